//! Stack-machine evaluation of compiled expressions.
//!
//! Values on the evaluation stack are typed f64 lanes; int32 and float
//! lanes are exact in f64, so integer semantics (wrapping arithmetic,
//! truncating division) are recovered per operation from the value's
//! declared type. The arithmetic helpers here are shared with the parser's
//! constant folder, which evaluates pure sub-stacks speculatively.

use bitflags::bitflags;

use crate::buffer::ValueBuffer;
use crate::time::Timetag;
use crate::value::{ScalarType, Vector};

use super::token::{
    AccInit, AssignTarget, BinaryOp, Dim, Func, HistIdx, InstIdx, Token, UnaryOp, VarRef,
    VecFunc, VecIdx,
};
use super::CompiledExpr;

bitflags! {
    /// Outcome of one evaluator run.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct EvalFlags: u8 {
        /// The destination has a new value.
        const UPDATE = 1 << 0;
        /// A value was produced but is muted.
        const MUTED_UPDATE = 1 << 1;
        /// The instance released before producing a value.
        const RELEASE_BEFORE_UPDATE = 1 << 2;
        /// The instance released after producing a value.
        const RELEASE_AFTER_UPDATE = 1 << 3;
        /// The expression does not depend on the live instance; one run
        /// covers all instances.
        const EVAL_DONE = 1 << 4;
    }
}

/// One source slot as seen by the evaluator.
pub struct SlotSource<'a> {
    /// Ring of the instance the evaluation is running for.
    pub cur: Option<&'a ValueBuffer>,
    /// Rings of all active instances, for instance reductions.
    pub all: Vec<&'a ValueBuffer>,
    /// Declared instance pool size.
    pub pool_size: usize,
    /// Timetag of the newest sample.
    pub time: Timetag,
}

pub struct EvalParams<'a> {
    pub srcs: &'a [SlotSource<'a>],
    /// Destination history ring, if one exists yet.
    pub dst: Option<&'a ValueBuffer>,
    pub dst_time: Timetag,
    /// Index of the most recently updated source slot (`x$$`).
    pub newest: usize,
}

#[derive(Debug)]
pub struct EvalOutput {
    pub flags: EvalFlags,
    /// The new destination sample, if one was produced.
    pub value: Option<Vector>,
    /// Seeded past samples: `(history offset, value)`.
    pub history_writes: Vec<(i32, Vector)>,
}

/// Per-instance expression memory: user variables and stateful-function
/// slots.
#[derive(Clone, Debug, Default)]
pub struct ExprState {
    vars: Vec<Option<Vector>>,
    fn_state: Vec<Vec<f64>>,
}

impl ExprState {
    pub fn new(expr: &CompiledExpr) -> Self {
        ExprState {
            vars: vec![None; expr.var_types.len()],
            fn_state: vec![Vec::new(); expr.num_state],
        }
    }
}

// ── evaluation values ───────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct EvalVal {
    pub ty: ScalarType,
    pub lanes: Vec<f64>,
}

impl EvalVal {
    pub fn scalar(ty: ScalarType, v: f64) -> Self {
        EvalVal {
            ty,
            lanes: vec![v],
        }
    }

    pub fn from_vector(v: &Vector) -> Self {
        EvalVal {
            ty: v.ty(),
            lanes: v.as_f64s(),
        }
    }

    pub fn to_vector(&self) -> Vector {
        Vector::from_f64s(self.ty, &self.lanes)
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    /// Lane with length-1 broadcast.
    pub fn at(&self, i: usize) -> f64 {
        if self.lanes.len() == 1 {
            self.lanes[0]
        } else {
            self.lanes[i]
        }
    }

    fn is_zero(&self) -> bool {
        self.lanes.first().map(|v| *v == 0.0).unwrap_or(true)
    }
}

/// Runtime arithmetic fault: the pending assignment is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DivideByZero;

fn wrap_i32(v: f64) -> f64 {
    (v as i64 as i32) as f64
}

pub(crate) fn apply_unary(op: UnaryOp, v: EvalVal) -> EvalVal {
    match op {
        UnaryOp::Negate => {
            let lanes = v
                .lanes
                .iter()
                .map(|x| {
                    if v.ty.is_integer() {
                        (*x as i32).wrapping_neg() as f64
                    } else {
                        -*x
                    }
                })
                .collect();
            EvalVal { ty: v.ty, lanes }
        }
        UnaryOp::Not => EvalVal {
            ty: ScalarType::Int32,
            lanes: v
                .lanes
                .iter()
                .map(|x| if *x == 0.0 { 1.0 } else { 0.0 })
                .collect(),
        },
    }
}

pub(crate) fn apply_binary(
    op: BinaryOp,
    a: EvalVal,
    b: EvalVal,
) -> Result<EvalVal, DivideByZero> {
    use BinaryOp::*;
    let ty = a.ty.promote(b.ty);
    let len = a.len().max(b.len());
    let int = ty.is_integer();
    let mut lanes = Vec::with_capacity(len);
    for i in 0..len {
        let x = a.at(i);
        let y = b.at(i);
        let v = match op {
            Add => {
                if int {
                    wrap_i32((x as i32).wrapping_add(y as i32) as f64)
                } else {
                    x + y
                }
            }
            Subtract => {
                if int {
                    (x as i32).wrapping_sub(y as i32) as f64
                } else {
                    x - y
                }
            }
            Multiply => {
                if int {
                    (x as i32).wrapping_mul(y as i32) as f64
                } else {
                    x * y
                }
            }
            Divide => {
                if int {
                    if y as i32 == 0 {
                        return Err(DivideByZero);
                    }
                    (x as i32).wrapping_div(y as i32) as f64
                } else {
                    x / y
                }
            }
            Modulo => {
                if int {
                    if y as i32 == 0 {
                        return Err(DivideByZero);
                    }
                    (x as i32).wrapping_rem(y as i32) as f64
                } else {
                    x % y
                }
            }
            ShiftLeft => ((x as i32).wrapping_shl(y as u32)) as f64,
            ShiftRight => ((x as i32).wrapping_shr(y as u32)) as f64,
            BitAnd => ((x as i32) & (y as i32)) as f64,
            BitOr => ((x as i32) | (y as i32)) as f64,
            BitXor => ((x as i32) ^ (y as i32)) as f64,
            Less => (x < y) as i32 as f64,
            LessEqual => (x <= y) as i32 as f64,
            Greater => (x > y) as i32 as f64,
            GreaterEqual => (x >= y) as i32 as f64,
            Equal => (x == y) as i32 as f64,
            NotEqual => (x != y) as i32 as f64,
            LogicalAnd => (x != 0.0 && y != 0.0) as i32 as f64,
            LogicalOr => (x != 0.0 || y != 0.0) as i32 as f64,
        };
        lanes.push(v);
    }
    let ty = if op.yields_int() || op.requires_int() {
        ScalarType::Int32
    } else {
        ty
    };
    Ok(EvalVal { ty, lanes })
}

/// Applies a scalar function element-wise. `state` holds the per-lane
/// memory of stateful functions; pure callers pass an empty slice.
pub(crate) fn apply_call(f: Func, args: &[EvalVal], state: &mut [f64]) -> EvalVal {
    use Func::*;
    let len = args.iter().map(|a| a.len()).max().unwrap_or(1);
    let mut ty = args
        .iter()
        .fold(ScalarType::Int32, |t, a| t.promote(a.ty));
    if !f.keeps_int() {
        ty = ty.at_least_float();
    }
    let int = ty.is_integer();
    let mut lanes = Vec::with_capacity(len);
    for i in 0..len {
        let x = args[0].at(i);
        let v = match f {
            Abs => {
                if int {
                    (x as i32).wrapping_abs() as f64
                } else {
                    x.abs()
                }
            }
            Acos => x.acos(),
            Acosh => x.acosh(),
            Asin => x.asin(),
            Asinh => x.asinh(),
            Atan => x.atan(),
            Atan2 => x.atan2(args[1].at(i)),
            Atanh => x.atanh(),
            Cbrt => x.cbrt(),
            Ceil => x.ceil(),
            Cos => x.cos(),
            Cosh => x.cosh(),
            Exp => x.exp(),
            Exp2 => x.exp2(),
            Floor => x.floor(),
            Hypot => x.hypot(args[1].at(i)),
            HzToMidi => 69.0 + 12.0 * (x / 440.0).log2(),
            Log => x.ln(),
            Log10 => x.log10(),
            Log2 => x.log2(),
            Max => x.max(args[1].at(i)),
            MidiToHz => 440.0 * ((x - 69.0) / 12.0).exp2(),
            Min => x.min(args[1].at(i)),
            Pow => x.powf(args[1].at(i)),
            Round => x.round(),
            Sign => {
                if x >= 0.0 {
                    1.0
                } else {
                    -1.0
                }
            }
            Sin => x.sin(),
            Sinh => x.sinh(),
            Sqrt => x.sqrt(),
            Tan => x.tan(),
            Tanh => x.tanh(),
            Trunc => x.trunc(),
            Uniform => rand::random::<f64>() * x,
            Ema => {
                let mem = state.get(i).copied().unwrap_or(f64::NAN);
                let out = if mem.is_nan() {
                    x
                } else {
                    mem + (x - mem) * args[1].at(i)
                };
                if let Some(slot) = state.get_mut(i) {
                    *slot = out;
                }
                out
            }
            Schmitt => {
                let mem = state.get(i).copied().unwrap_or(f64::NAN);
                let held = !mem.is_nan() && mem != 0.0;
                let out = if held {
                    (x > args[1].at(i)) as i32 as f64
                } else {
                    (x >= args[2].at(i)) as i32 as f64
                };
                if let Some(slot) = state.get_mut(i) {
                    *slot = out;
                }
                out
            }
        };
        lanes.push(if int { wrap_i32(v) } else { v });
    }
    EvalVal { ty, lanes }
}

pub(crate) fn apply_veccall(f: VecFunc, args: &[EvalVal]) -> EvalVal {
    use VecFunc::*;
    let a = &args[0];
    let promoted = args
        .iter()
        .fold(ScalarType::Int32, |t, v| t.promote(v.ty));
    let ty = if f.yields_int() {
        ScalarType::Int32
    } else if f.needs_float() {
        promoted.at_least_float()
    } else {
        promoted
    };
    let lanes: Vec<f64> = match f {
        All => vec![a.lanes.iter().all(|x| *x != 0.0) as i32 as f64],
        Any => vec![a.lanes.iter().any(|x| *x != 0.0) as i32 as f64],
        Sum => vec![a.lanes.iter().sum()],
        Mean => vec![a.lanes.iter().sum::<f64>() / a.len() as f64],
        Max => vec![a.lanes.iter().cloned().fold(f64::NEG_INFINITY, f64::max)],
        Min => vec![a.lanes.iter().cloned().fold(f64::INFINITY, f64::min)],
        Center => {
            let max = a.lanes.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let min = a.lanes.iter().cloned().fold(f64::INFINITY, f64::min);
            vec![(max + min) * 0.5]
        }
        Length => vec![a.len() as f64],
        Norm => vec![a.lanes.iter().map(|x| x * x).sum::<f64>().sqrt()],
        Median => {
            let mut sorted = a.lanes.clone();
            sorted.sort_by(|p, q| p.partial_cmp(q).unwrap_or(std::cmp::Ordering::Equal));
            let idx = sorted.len() / 2;
            let mut m = sorted[idx];
            if sorted.len() > 2 && sorted.len() % 2 == 0 {
                m = (m + sorted[idx - 1]) * 0.5;
            }
            vec![m]
        }
        Sort => {
            let mut sorted = a.lanes.clone();
            let ascending = args[1].at(0) >= 0.0;
            sorted.sort_by(|p, q| p.partial_cmp(q).unwrap_or(std::cmp::Ordering::Equal));
            if !ascending {
                sorted.reverse();
            }
            sorted
        }
        Concat => {
            let mut lanes = a.lanes.clone();
            lanes.extend_from_slice(&args[1].lanes);
            lanes.truncate(crate::value::MAX_VECTOR_LEN);
            lanes
        }
        Dot => {
            let b = &args[1];
            let len = a.len().max(b.len());
            vec![(0..len).map(|i| a.at(i) * b.at(i)).sum()]
        }
        Index => {
            let needle = args[1].at(0);
            vec![a
                .lanes
                .iter()
                .position(|x| *x == needle)
                .map(|i| i as f64)
                .unwrap_or(-1.0)]
        }
        Angle => {
            let b = &args[1];
            let mut theta = b.at(1).atan2(b.at(0)) - a.at(1).atan2(a.at(0));
            if theta > std::f64::consts::PI {
                theta -= 2.0 * std::f64::consts::PI;
            } else if theta < -std::f64::consts::PI {
                theta += 2.0 * std::f64::consts::PI;
            }
            vec![theta]
        }
    };
    EvalVal { ty, lanes }
}

// ── the evaluator ───────────────────────────────────────────────────────

struct Frame {
    dim: Dim,
    idx: usize,
    count: usize,
    body: usize,
    acc_pos: usize,
}

/// Evaluates a compiled expression against the given sources.
///
/// Returns `None` when a referenced sample does not exist yet (absence):
/// the evaluation aborts without producing output. A runtime integer
/// division by zero skips only the statement it occurs in.
pub fn evaluate(
    expr: &CompiledExpr,
    state: &mut ExprState,
    p: &EvalParams<'_>,
) -> Option<EvalOutput> {
    let tokens = &expr.tokens;
    let mut stack: Vec<EvalVal> = Vec::new();
    let mut frames: Vec<Frame> = Vec::new();
    let mut flags = EvalFlags::empty();
    let mut muted = false;
    let mut out_value: Option<Vector> = None;
    let mut history_writes: Vec<(i32, Vector)> = Vec::new();
    let mut released = false;

    state.vars.resize(expr.var_types.len(), None);
    state.fn_state.resize(expr.num_state, Vec::new());

    let mut pc = 0usize;
    'program: while pc < tokens.len() {
        // skip the rest of the current statement
        macro_rules! skip_statement {
            () => {{
                while pc < tokens.len() && !matches!(tokens[pc], Token::Assign(_)) {
                    pc += 1;
                }
                pc += 1;
                stack.clear();
                frames.clear();
                continue 'program;
            }};
        }

        match &tokens[pc] {
            Token::Literal(v) => stack.push(EvalVal::from_vector(v)),
            Token::BuildVector { n } => {
                let k = *n as usize;
                let mut ty = ScalarType::Int32;
                let mut lanes = Vec::new();
                for v in stack.drain(stack.len() - k..) {
                    ty = ty.promote(v.ty);
                    lanes.extend_from_slice(&v.lanes);
                }
                stack.push(EvalVal { ty, lanes });
            }
            Token::Var {
                var,
                hist,
                vec,
                inst,
            } => {
                let vec_idx = if *vec == VecIdx::Dynamic {
                    Some(stack.pop()?.at(0))
                } else {
                    None
                };
                let hist_off = if *hist == HistIdx::Dynamic {
                    Some(stack.pop()?.at(0))
                } else {
                    None
                };
                let loaded = load_var(
                    expr, state, p, &frames, *var, *hist, hist_off, *inst,
                )?;
                stack.push(apply_vec_index(loaded, *vec, vec_idx, &frames));
            }
            Token::TimeOf { var } => {
                let t = match var {
                    VarRef::Dst => p.dst_time,
                    _ => p.srcs.get(slot_of(*var, &frames, p)?)?.time,
                };
                stack.push(EvalVal::scalar(ScalarType::Double, t.as_secs_f64()));
            }
            Token::Unary(op) => {
                let v = stack.pop()?;
                stack.push(apply_unary(*op, v));
            }
            Token::Binary(op) => {
                let b = stack.pop()?;
                let a = stack.pop()?;
                match apply_binary(*op, a, b) {
                    Ok(v) => stack.push(v),
                    Err(DivideByZero) => skip_statement!(),
                }
            }
            Token::IfThen => {
                let v = stack.pop()?;
                let cond = stack.pop()?;
                if cond.is_zero() {
                    skip_statement!();
                }
                stack.push(v);
            }
            Token::IfElse => {
                let b = stack.pop()?;
                let a = stack.pop()?;
                let cond = stack.pop()?;
                let len = a.len().max(b.len()).max(cond.len());
                let ty = a.ty.promote(b.ty);
                let lanes = (0..len)
                    .map(|i| if cond.at(i) != 0.0 { a.at(i) } else { b.at(i) })
                    .collect();
                stack.push(EvalVal { ty, lanes });
            }
            Token::Call { f, arity, state: slot } => {
                let n = *arity as usize;
                let args: Vec<EvalVal> = stack.split_off(stack.len() - n);
                let v = match slot {
                    Some(s) => {
                        let mem = &mut state.fn_state[*s as usize];
                        let len = args.iter().map(|a| a.len()).max().unwrap_or(1);
                        mem.resize(len, f64::NAN);
                        apply_call(*f, &args, mem)
                    }
                    None => apply_call(*f, &args, &mut []),
                };
                stack.push(v);
            }
            Token::VecCall { f, arity } => {
                let n = *arity as usize;
                let args: Vec<EvalVal> = stack.split_off(stack.len() - n);
                stack.push(apply_veccall(*f, &args));
            }
            Token::Cast(ty) => {
                let v = stack.pop()?;
                let lanes = if ty.is_integer() {
                    v.lanes.iter().map(|x| *x as i32 as f64).collect()
                } else {
                    v.lanes
                };
                stack.push(EvalVal { ty: *ty, lanes });
            }
            Token::InstanceCount { var } => {
                let slot = slot_of(*var, &frames, p)?;
                stack.push(EvalVal::scalar(
                    ScalarType::Int32,
                    p.srcs.get(slot)?.all.len() as f64,
                ));
            }
            Token::InstancePoolSize { var } => {
                let slot = slot_of(*var, &frames, p)?;
                stack.push(EvalVal::scalar(
                    ScalarType::Int32,
                    p.srcs.get(slot)?.pool_size as f64,
                ));
            }
            Token::LoopStart { dim, var, init } => {
                let count = match dim {
                    Dim::History(n) => *n as usize,
                    Dim::Signal => p.srcs.len(),
                    Dim::Instance => {
                        let slot = slot_of(*var, &frames, p)?;
                        p.srcs.get(slot)?.all.len()
                    }
                    Dim::Vector => vector_loop_len(expr, *var),
                };
                let seed = match init {
                    AccInit::Zero => 0.0,
                    AccInit::One => 1.0,
                    AccInit::NegInf => f64::NEG_INFINITY,
                    AccInit::PosInf => f64::INFINITY,
                };
                stack.push(EvalVal::scalar(ScalarType::Int32, seed));
                if count == 0 {
                    // empty dimension: the accumulator seed is the result
                    pc = find_loop_end(tokens, pc)?;
                    pc += 1;
                    continue 'program;
                }
                frames.push(Frame {
                    dim: *dim,
                    idx: 0,
                    count,
                    body: pc + 1,
                    acc_pos: stack.len() - 1,
                });
            }
            Token::AccLoad => {
                let pos = frames.last()?.acc_pos;
                let v = stack[pos].clone();
                stack.push(v);
            }
            Token::AccStore => {
                let v = stack.pop()?;
                let pos = frames.last()?.acc_pos;
                stack[pos] = v;
            }
            Token::LoopEnd { .. } => {
                let frame = frames.last_mut()?;
                frame.idx += 1;
                if frame.idx < frame.count {
                    pc = frame.body;
                    continue 'program;
                }
                frames.pop();
            }
            Token::Assign(target) => {
                let v = stack.pop()?;
                match target {
                    AssignTarget::Dst {
                        hist,
                        vec_start,
                        vec_len,
                    } => {
                        if *hist == 0 {
                            let mut out = match out_value.take() {
                                Some(o) => o,
                                None => match p.dst.and_then(|d| d.read(0)) {
                                    Some(prev) => prev.cast(expr.out_ty),
                                    None => Vector::zeros(expr.out_ty, expr.out_len),
                                },
                            };
                            for j in 0..*vec_len as usize {
                                out.set(*vec_start as usize + j, v.at(j));
                            }
                            out_value = Some(out);
                            if muted {
                                flags.insert(EvalFlags::MUTED_UPDATE);
                            } else {
                                flags.insert(EvalFlags::UPDATE);
                            }
                        } else {
                            let mut out = match p.dst.and_then(|d| d.read(*hist as i32)) {
                                Some(prev) => prev.cast(expr.out_ty),
                                None => Vector::zeros(expr.out_ty, expr.out_len),
                            };
                            for j in 0..*vec_len as usize {
                                out.set(*vec_start as usize + j, v.at(j));
                            }
                            history_writes.push((*hist as i32, out));
                        }
                    }
                    AssignTarget::User { idx, .. } => {
                        state.vars[*idx as usize] = Some(v.to_vector());
                    }
                    AssignTarget::Alive => {
                        if v.is_zero() {
                            if flags.intersects(EvalFlags::UPDATE | EvalFlags::MUTED_UPDATE) {
                                flags.insert(EvalFlags::RELEASE_AFTER_UPDATE);
                            } else {
                                flags.insert(EvalFlags::RELEASE_BEFORE_UPDATE);
                            }
                            released = true;
                        }
                    }
                    AssignTarget::Muted => {
                        if !v.is_zero() {
                            muted = true;
                            if flags.contains(EvalFlags::UPDATE) {
                                flags.remove(EvalFlags::UPDATE);
                                flags.insert(EvalFlags::MUTED_UPDATE);
                            }
                        }
                    }
                }
                if released {
                    break 'program;
                }
            }
        }
        pc += 1;
    }

    if !expr.uses_current_instance {
        flags.insert(EvalFlags::EVAL_DONE);
    }
    if muted {
        out_value = None;
    }
    Some(EvalOutput {
        flags,
        value: if flags.contains(EvalFlags::UPDATE) {
            out_value
        } else {
            None
        },
        history_writes,
    })
}

/// Resolves a source reference to its slot index.
fn slot_of(var: VarRef, frames: &[Frame], p: &EvalParams<'_>) -> Option<usize> {
    match var {
        VarRef::Src(i) => Some(i as usize),
        VarRef::SrcNewest => Some(p.newest),
        VarRef::SrcLoop => frames
            .iter()
            .rev()
            .find(|f| matches!(f.dim, Dim::Signal))
            .map(|f| f.idx),
        _ => None,
    }
}

fn vector_loop_len(expr: &CompiledExpr, var: VarRef) -> usize {
    match var {
        VarRef::Src(i) => expr.src_types.get(i as usize).map(|s| s.1).unwrap_or(1),
        VarRef::SrcNewest | VarRef::SrcLoop => {
            expr.src_types.iter().map(|s| s.1).max().unwrap_or(1)
        }
        VarRef::Dst => expr.out_len,
        VarRef::User(i) => expr.var_types.get(i as usize).map(|s| s.1).unwrap_or(1),
    }
}

/// Finds the `LoopEnd` matching the `LoopStart` at `start`.
fn find_loop_end(tokens: &[Token], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, t) in tokens.iter().enumerate().skip(start) {
        match t {
            Token::LoopStart { .. } => depth += 1,
            Token::LoopEnd { .. } => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn load_var(
    expr: &CompiledExpr,
    state: &ExprState,
    p: &EvalParams<'_>,
    frames: &[Frame],
    var: VarRef,
    hist: HistIdx,
    hist_dynamic: Option<f64>,
    inst: InstIdx,
) -> Option<EvalVal> {
    // user variables have no history or instance dimension of their own
    if let VarRef::User(i) = var {
        let (ty, len) = expr.var_types[i as usize];
        let v = match &state.vars[i as usize] {
            Some(v) => v.clone(),
            None => Vector::zeros(ty, len),
        };
        return Some(EvalVal::from_vector(&v));
    }

    let buffer: &ValueBuffer = match var {
        VarRef::Dst => p.dst?,
        _ => {
            let slot = slot_of(var, frames, p)?;
            let src = p.srcs.get(slot)?;
            match inst {
                InstIdx::Current => src.cur?,
                InstIdx::Loop => {
                    let frame = frames
                        .iter()
                        .rev()
                        .find(|f| matches!(f.dim, Dim::Instance))?;
                    src.all.get(frame.idx).copied()?
                }
            }
        }
    };

    let value = match hist {
        HistIdx::Const(k) => buffer.read(k as i32)?.clone(),
        HistIdx::Loop => {
            let frame = frames
                .iter()
                .rev()
                .find(|f| matches!(f.dim, Dim::History(_)))?;
            buffer.read(-(frame.idx as i32))?.clone()
        }
        HistIdx::Dynamic => buffer.read_interp(hist_dynamic?)?,
    };
    Some(EvalVal::from_vector(&value))
}

fn apply_vec_index(
    v: EvalVal,
    vec: VecIdx,
    dynamic: Option<f64>,
    frames: &[Frame],
) -> EvalVal {
    match vec {
        VecIdx::Full => v,
        VecIdx::Const(i) => {
            let vector = v.to_vector();
            EvalVal::scalar(v.ty, vector.index_interp(i as f64))
        }
        VecIdx::Dynamic => {
            let vector = v.to_vector();
            EvalVal::scalar(v.ty, vector.index_interp(dynamic.unwrap_or(0.0)))
        }
        VecIdx::Loop => {
            let idx = frames
                .iter()
                .rev()
                .find(|f| matches!(f.dim, Dim::Vector))
                .map(|f| f.idx)
                .unwrap_or(0);
            EvalVal::scalar(v.ty, v.at(idx.min(v.len().saturating_sub(1))))
        }
        VecIdx::Slice { start, len } => {
            let s = start as usize;
            let e = (s + len as usize).min(v.len());
            EvalVal {
                ty: v.ty,
                lanes: v.lanes[s.min(v.len())..e].to_vec(),
            }
        }
    }
}
