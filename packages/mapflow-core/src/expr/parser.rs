//! Expression parser and compile-time analysis.
//!
//! Parsing emits postfix tokens directly, resolving operator precedence
//! with the classic shunting-yard discipline over the lexer stream. Three
//! passes follow:
//!
//! 1. constant folding by speculative evaluation of pure sub-stacks,
//! 2. type and vector-length inference, iterated to a fixpoint so
//!    self-referential user variables settle,
//! 3. history-depth annotation per referenced signal.

use std::collections::HashMap;

use crate::value::{ScalarType, Vector, MAX_VECTOR_LEN};

use super::eval::{apply_binary, apply_call, apply_unary, apply_veccall, EvalVal};
use super::lexer::{LexToken, Lexer};
use super::token::{
    AccInit, AssignTarget, BinaryOp, Dim, Func, HistIdx, InstIdx, ReduceOp, Token, UnaryOp,
    VarRef, VecFunc, VecIdx, MAX_HISTORY,
};
use super::{CompiledExpr, ExprContext, ExprError};

struct VarDef {
    name: String,
}

struct LambdaScope {
    acc: String,
    elem: String,
    /// Dimension-marked operand tokens substituted for the element name.
    span: Vec<Token>,
}

struct Parser<'a> {
    toks: Vec<(LexToken, usize)>,
    pos: usize,
    ctx: &'a ExprContext,
    out: Vec<Token>,
    vars: Vec<VarDef>,
    num_state: usize,
    lambda: Option<LambdaScope>,
    /// Reduction dimensions currently being compiled, for nesting checks.
    active_dims: Vec<&'static str>,
    /// Names that were reduce-lambda parameters, for targeted errors.
    past_lambda_params: Vec<String>,
    /// History depth recorded eagerly for fractional offsets.
    src_hist: Vec<i32>,
    dst_hist: i32,
    assigned_dst: bool,
}

pub(super) fn compile(expr: &str, ctx: &ExprContext) -> Result<CompiledExpr, ExprError> {
    let toks = Lexer::new(expr).tokenize()?;
    let mut parser = Parser {
        toks,
        pos: 0,
        ctx,
        out: Vec::new(),
        vars: Vec::new(),
        num_state: 0,
        lambda: None,
        active_dims: Vec::new(),
        past_lambda_params: Vec::new(),
        src_hist: vec![1; ctx.srcs.len()],
        dst_hist: 1,
        assigned_dst: false,
    };
    parser.parse_program()?;
    let Parser {
        mut out,
        vars,
        num_state,
        mut src_hist,
        mut dst_hist,
        ..
    } = parser;

    fold(&mut out)?;
    let var_types = infer(&out, ctx, vars.len())?;
    annotate_history(&out, &mut src_hist, &mut dst_hist);

    let uses_current_instance = out.iter().any(|t| {
        matches!(
            t,
            Token::Var {
                var: VarRef::Src(_) | VarRef::SrcNewest | VarRef::Dst,
                inst: InstIdx::Current,
                ..
            }
        )
    });

    Ok(CompiledExpr {
        source: expr.to_string(),
        tokens: out,
        src_types: ctx.srcs.clone(),
        out_ty: ctx.dst.0,
        out_len: ctx.dst.1,
        var_types,
        var_names: vars.into_iter().map(|v| v.name).collect(),
        num_state,
        src_hist,
        dst_hist,
        uses_current_instance,
    })
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &LexToken {
        &self.toks[self.pos.min(self.toks.len() - 1)].0
    }

    fn at(&self) -> usize {
        self.toks[self.pos.min(self.toks.len() - 1)].1
    }

    fn bump(&mut self) -> LexToken {
        let t = self.toks[self.pos.min(self.toks.len() - 1)].0.clone();
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, want: &LexToken, what: &str) -> Result<(), ExprError> {
        if self.peek() == want {
            self.bump();
            Ok(())
        } else {
            Err(self.syntax(what))
        }
    }

    fn syntax(&self, what: &str) -> ExprError {
        ExprError::Syntax {
            at: self.at(),
            what: what.to_string(),
        }
    }

    // ── statements ──────────────────────────────────────────────────────

    fn parse_program(&mut self) -> Result<(), ExprError> {
        loop {
            while *self.peek() == LexToken::Semicolon {
                self.bump();
            }
            if *self.peek() == LexToken::End {
                break;
            }
            self.parse_statement()?;
            match self.peek() {
                LexToken::Semicolon => {
                    self.bump();
                }
                LexToken::End => break,
                _ => return Err(self.syntax("expected ';' between statements")),
            }
        }
        if !self.assigned_dst {
            return Err(ExprError::NoOutput);
        }
        Ok(())
    }

    fn parse_statement(&mut self) -> Result<(), ExprError> {
        let target = self.parse_target()?;
        self.expect(&LexToken::Assign, "expected '=' after assignment target")?;
        self.parse_ternary()?;
        if matches!(target, AssignTarget::Dst { .. }) {
            self.assigned_dst = true;
        }
        self.out.push(Token::Assign(target));
        Ok(())
    }

    fn parse_target(&mut self) -> Result<AssignTarget, ExprError> {
        match self.bump() {
            LexToken::DstVar => {
                let mut hist = 0i16;
                if *self.peek() == LexToken::OpenCurly {
                    self.bump();
                    let k = self.parse_const_int("history offset")?;
                    self.expect(&LexToken::CloseCurly, "expected '}'")?;
                    if k > 0 || -k > MAX_HISTORY as i64 {
                        return Err(ExprError::HistoryTooDeep(k));
                    }
                    hist = k as i16;
                    self.dst_hist = self.dst_hist.max(1 - k as i32);
                }
                let (vec_start, vec_len) = self.parse_target_vec(self.ctx.dst.1)?;
                Ok(AssignTarget::Dst {
                    hist,
                    vec_start,
                    vec_len,
                })
            }
            LexToken::SrcVar(_) | LexToken::SrcNewest => Err(ExprError::AssignToInput),
            LexToken::Name(name) => match name.as_str() {
                "alive" => Ok(AssignTarget::Alive),
                "muted" => Ok(AssignTarget::Muted),
                _ => {
                    if self
                        .lambda
                        .as_ref()
                        .is_some_and(|l| l.acc == name || l.elem == name)
                    {
                        return Err(ExprError::ReduceLocal(name));
                    }
                    let idx = match self.vars.iter().position(|v| v.name == name) {
                        Some(i) => i,
                        None => {
                            if self.vars.len() >= u8::MAX as usize {
                                return Err(self.syntax("too many user variables"));
                            }
                            self.vars.push(VarDef { name });
                            self.vars.len() - 1
                        }
                    };
                    Ok(AssignTarget::User {
                        idx: idx as u8,
                        vec_start: 0,
                        vec_len: 0,
                    })
                }
            },
            _ => Err(self.syntax("expected assignment target")),
        }
    }

    fn parse_target_vec(&mut self, full_len: usize) -> Result<(u8, u8), ExprError> {
        if *self.peek() != LexToken::OpenSquare {
            return Ok((0, full_len.max(1) as u8));
        }
        self.bump();
        let a = self.parse_const_int("vector index")?;
        let b = if *self.peek() == LexToken::Colon {
            self.bump();
            self.parse_const_int("vector index")?
        } else {
            a
        };
        self.expect(&LexToken::CloseSquare, "expected ']'")?;
        if a < 0 || b < a || b as usize >= full_len.max(1) {
            return Err(self.syntax("vector index out of range"));
        }
        Ok((a as u8, (b - a + 1) as u8))
    }

    /// Parses a sub-expression that must fold to an integer literal.
    fn parse_const_int(&mut self, what: &str) -> Result<i64, ExprError> {
        let toks = self.parse_subexpr_folded()?;
        match const_scalar(&toks) {
            Some(v) if v.fract() == 0.0 => Ok(v as i64),
            _ => Err(self.syntax(&format!("{} must be a constant integer", what))),
        }
    }

    /// Parses a sub-expression into a detached, folded token buffer.
    fn parse_subexpr_folded(&mut self) -> Result<Vec<Token>, ExprError> {
        let saved = std::mem::take(&mut self.out);
        let result = self.parse_ternary();
        let mut tokens = std::mem::replace(&mut self.out, saved);
        result?;
        fold(&mut tokens)?;
        Ok(tokens)
    }

    // ── expressions ─────────────────────────────────────────────────────

    fn parse_ternary(&mut self) -> Result<(), ExprError> {
        self.parse_binary(0)?;
        if *self.peek() == LexToken::Question {
            self.bump();
            self.parse_ternary()?;
            if *self.peek() == LexToken::Colon {
                self.bump();
                self.parse_ternary()?;
                self.out.push(Token::IfElse);
            } else {
                self.out.push(Token::IfThen);
            }
        }
        Ok(())
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<(), ExprError> {
        self.parse_unary()?;
        while let LexToken::Op(op) = *self.peek() {
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            self.bump();
            self.parse_binary(prec + 1)?;
            self.out.push(Token::Binary(op));
        }
        Ok(())
    }

    fn parse_unary(&mut self) -> Result<(), ExprError> {
        match self.peek() {
            LexToken::Op(BinaryOp::Subtract) => {
                self.bump();
                self.parse_unary()?;
                self.out.push(Token::Unary(UnaryOp::Negate));
                Ok(())
            }
            LexToken::Not => {
                self.bump();
                self.parse_unary()?;
                self.out.push(Token::Unary(UnaryOp::Not));
                Ok(())
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<(), ExprError> {
        let span_start = self.out.len();
        self.parse_primary()?;
        let mut pending_dim: Option<Dim> = None;
        loop {
            match self.peek() {
                LexToken::OpenCurly => {
                    if pending_dim.is_some() {
                        return Err(self.syntax("expected reduction after dimension"));
                    }
                    self.bump();
                    self.apply_history_index(span_start)?;
                }
                LexToken::OpenSquare => {
                    if pending_dim.is_some() {
                        return Err(self.syntax("expected reduction after dimension"));
                    }
                    self.bump();
                    self.apply_vector_index(span_start)?;
                }
                LexToken::Dot => {
                    self.bump();
                    let name = match self.bump() {
                        LexToken::Name(n) => n,
                        _ => return Err(self.syntax("expected name after '.'")),
                    };
                    if let Some(dim) = pending_dim.take() {
                        self.compile_reduce(span_start, dim, &name)?;
                        continue;
                    }
                    match name.as_str() {
                        "history" => {
                            self.expect(&LexToken::OpenParen, "expected '(' after history")?;
                            let n = self.parse_const_int("history size")?;
                            self.expect(&LexToken::CloseParen, "expected ')'")?;
                            if n < 1 || n > MAX_HISTORY as i64 {
                                return Err(ExprError::HistoryTooDeep(n));
                            }
                            pending_dim = Some(Dim::History(n as u16));
                        }
                        "vector" => pending_dim = Some(Dim::Vector),
                        "instance" => pending_dim = Some(Dim::Instance),
                        "signal" => pending_dim = Some(Dim::Signal),
                        _ => {
                            // dot-form vector function: value.fn() or a.fn(b)
                            let Some(f) = VecFunc::lookup(&name) else {
                                return Err(ExprError::UnknownName(name));
                            };
                            self.expect(&LexToken::OpenParen, "expected '(' after function")?;
                            let mut arity = 1u8;
                            if *self.peek() != LexToken::CloseParen {
                                loop {
                                    self.parse_ternary()?;
                                    arity += 1;
                                    if *self.peek() != LexToken::Comma {
                                        break;
                                    }
                                    self.bump();
                                }
                            }
                            self.expect(&LexToken::CloseParen, "expected ')'")?;
                            if arity != f.arity() {
                                return Err(ExprError::Arity {
                                    name,
                                    expected: f.arity(),
                                    got: arity,
                                });
                            }
                            self.out.push(Token::VecCall { f, arity });
                        }
                    }
                }
                _ => {
                    if pending_dim.is_some() {
                        return Err(self.syntax("expected reduction after dimension"));
                    }
                    return Ok(());
                }
            }
        }
    }

    fn parse_primary(&mut self) -> Result<(), ExprError> {
        match self.bump() {
            LexToken::Int(v) => self.out.push(Token::Literal(Vector::I32(vec![v]))),
            LexToken::Float(v) => self.out.push(Token::Literal(Vector::F32(vec![v]))),
            LexToken::Double(v) => self.out.push(Token::Literal(Vector::F64(vec![v]))),
            LexToken::OpenParen => {
                self.parse_ternary()?;
                self.expect(&LexToken::CloseParen, "expected ')'")?;
            }
            LexToken::OpenSquare => {
                let mut n = 0u8;
                loop {
                    self.parse_ternary()?;
                    n += 1;
                    if *self.peek() != LexToken::Comma {
                        break;
                    }
                    self.bump();
                }
                self.expect(&LexToken::CloseSquare, "expected ']'")?;
                self.out.push(Token::BuildVector { n });
            }
            LexToken::SrcVar(idx) => {
                let slot = idx.unwrap_or(0);
                if slot as usize >= self.ctx.srcs.len() {
                    return Err(ExprError::UnknownName(format!("x${}", slot)));
                }
                self.out.push(Token::Var {
                    var: VarRef::Src(slot),
                    hist: HistIdx::Const(0),
                    vec: VecIdx::Full,
                    inst: InstIdx::Current,
                });
            }
            LexToken::SrcNewest => self.out.push(Token::Var {
                var: VarRef::SrcNewest,
                hist: HistIdx::Const(0),
                vec: VecIdx::Full,
                inst: InstIdx::Current,
            }),
            LexToken::DstVar => self.out.push(Token::Var {
                var: VarRef::Dst,
                hist: HistIdx::Const(0),
                vec: VecIdx::Full,
                inst: InstIdx::Current,
            }),
            LexToken::SrcTime(idx) => {
                let slot = idx.unwrap_or(0);
                if slot as usize >= self.ctx.srcs.len() {
                    return Err(ExprError::UnknownName(format!("t_x${}", slot)));
                }
                self.out.push(Token::TimeOf {
                    var: VarRef::Src(slot),
                });
            }
            LexToken::DstTime => self.out.push(Token::TimeOf { var: VarRef::Dst }),
            LexToken::Name(name) => self.parse_name(name)?,
            _ => return Err(self.syntax("expected operand")),
        }
        Ok(())
    }

    fn parse_name(&mut self, name: String) -> Result<(), ExprError> {
        // reduce-lambda locals shadow everything
        if let Some(lambda) = &self.lambda {
            if lambda.acc == name {
                self.out.push(Token::AccLoad);
                return Ok(());
            }
            if lambda.elem == name {
                let span = lambda.span.clone();
                self.out.extend(span);
                return Ok(());
            }
        }
        if *self.peek() == LexToken::OpenParen {
            return self.parse_call(name);
        }
        match name.as_str() {
            "alive" | "muted" => {
                return Err(self.syntax(&format!("'{}' can only be assigned", name)))
            }
            _ => {}
        }
        if let Some(idx) = self.vars.iter().position(|v| v.name == name) {
            self.out.push(Token::Var {
                var: VarRef::User(idx as u8),
                hist: HistIdx::Const(0),
                vec: VecIdx::Full,
                inst: InstIdx::Current,
            });
            return Ok(());
        }
        if self.past_lambda_params.contains(&name) {
            return Err(ExprError::ReduceLocal(name));
        }
        Err(ExprError::UnknownName(name))
    }

    fn parse_call(&mut self, name: String) -> Result<(), ExprError> {
        self.expect(&LexToken::OpenParen, "expected '('")?;
        let mut arity = 0u8;
        if *self.peek() != LexToken::CloseParen {
            loop {
                self.parse_ternary()?;
                arity += 1;
                if *self.peek() != LexToken::Comma {
                    break;
                }
                self.bump();
            }
        }
        self.expect(&LexToken::CloseParen, "expected ')'")?;
        // some names exist in both libraries ("max"); resolve by arity
        let func = Func::lookup(&name);
        let vfunc = VecFunc::lookup(&name);
        if let Some(f) = func.filter(|f| f.arity() == arity) {
            let state = if f.is_stateful() {
                let slot = self.num_state;
                self.num_state += 1;
                Some(slot as u8)
            } else {
                None
            };
            self.out.push(Token::Call { f, arity, state });
            return Ok(());
        }
        if let Some(f) = vfunc.filter(|f| f.arity() == arity) {
            self.out.push(Token::VecCall { f, arity });
            return Ok(());
        }
        if func.is_some() || vfunc.is_some() {
            Err(ExprError::Arity {
                expected: func
                    .map(|f| f.arity())
                    .or(vfunc.map(|f| f.arity()))
                    .unwrap_or(0),
                got: arity,
                name,
            })
        } else {
            Err(ExprError::UnknownName(name))
        }
    }

    // ── index suffixes ──────────────────────────────────────────────────

    /// Index suffixes attach to a lone signal/variable reference, which
    /// after any earlier dynamic-index insertions is the last token of the
    /// current span. Returns its index in `out`.
    fn span_var_idx(&self, span_start: usize, what: &str) -> Result<usize, ExprError> {
        let idx = self.out.len().wrapping_sub(1);
        if idx < span_start || idx >= self.out.len() {
            return Err(self.syntax(&format!("{} applies to a signal reference", what)));
        }
        match self.out[idx] {
            Token::Var { .. } => Ok(idx),
            _ => Err(self.syntax(&format!("{} applies to a signal reference", what))),
        }
    }

    fn apply_history_index(&mut self, span_start: usize) -> Result<(), ExprError> {
        let toks = self.parse_subexpr_folded()?;
        self.expect(&LexToken::CloseCurly, "expected '}'")?;
        let Some(offset) = const_scalar(&toks) else {
            return Err(self.syntax("history index must be constant"));
        };
        if offset > 0.0 || -offset > MAX_HISTORY as f64 {
            return Err(ExprError::HistoryTooDeep(offset as i64));
        }
        let depth = 1 + (-offset).ceil() as i32;
        let fractional = offset.fract() != 0.0;

        let var_idx = self.span_var_idx(span_start, "a history index")?;
        let (vref, hist, vec) = match &self.out[var_idx] {
            Token::Var { var, hist, vec, .. } => (*var, *hist, *vec),
            _ => unreachable!(),
        };
        if fractional && vec == VecIdx::Dynamic {
            return Err(self.syntax(
                "a fractional history index must precede a computed vector index",
            ));
        }
        if !matches!(vref, VarRef::Src(_) | VarRef::SrcNewest | VarRef::Dst) {
            return Err(ExprError::TypeMismatch(
                "history indexing applies to signal references".into(),
            ));
        }
        if hist != HistIdx::Const(0) {
            return Err(ExprError::TypeMismatch("doubled history index".into()));
        }
        if let Token::Var { hist, .. } = &mut self.out[var_idx] {
            *hist = if fractional {
                HistIdx::Dynamic
            } else {
                HistIdx::Const(offset as i16)
            };
        }
        // record depth now; fractional offsets are invisible to the
        // annotation pass once they move onto the stack
        match vref {
            VarRef::Dst => self.dst_hist = self.dst_hist.max(depth),
            VarRef::Src(i) => {
                self.src_hist[i as usize] = self.src_hist[i as usize].max(depth);
            }
            _ => {
                for d in &mut self.src_hist {
                    *d = (*d).max(depth);
                }
            }
        }
        if fractional {
            // the dynamic offset evaluates just before the load
            self.out
                .insert(var_idx, Token::Literal(Vector::F64(vec![offset])));
        }
        Ok(())
    }

    fn apply_vector_index(&mut self, span_start: usize) -> Result<(), ExprError> {
        let toks = self.parse_subexpr_folded()?;
        let range_end = if *self.peek() == LexToken::Colon {
            self.bump();
            Some(self.parse_const_int("vector range")?)
        } else {
            None
        };
        self.expect(&LexToken::CloseSquare, "expected ']'")?;

        let new_vec = match (const_scalar(&toks), range_end) {
            (Some(a), Some(b)) => {
                if a.fract() != 0.0 {
                    return Err(self.syntax("vector range bounds must be integers"));
                }
                let a = a as i64;
                if a < 0 || b < a || b as usize >= MAX_VECTOR_LEN {
                    return Err(self.syntax("vector range out of bounds"));
                }
                VecIdx::Slice {
                    start: a as u8,
                    len: (b - a + 1) as u8,
                }
            }
            (None, Some(_)) => {
                return Err(self.syntax("vector range bounds must be constant"));
            }
            (Some(i), None) if i.fract() == 0.0 && i.abs() <= i16::MAX as f64 => {
                VecIdx::Const(i as i16)
            }
            _ => VecIdx::Dynamic,
        };

        let var_idx = self.span_var_idx(span_start, "a vector index")?;
        let cur = match &self.out[var_idx] {
            Token::Var { vec, .. } => *vec,
            _ => unreachable!(),
        };
        if cur != VecIdx::Full {
            return Err(ExprError::TypeMismatch("doubled vector index".into()));
        }
        if let Token::Var { vec, .. } = &mut self.out[var_idx] {
            *vec = new_vec;
        }
        if new_vec == VecIdx::Dynamic {
            // non-constant index: its tokens evaluate just before the load
            for (i, t) in toks.into_iter().enumerate() {
                self.out.insert(var_idx + i, t);
            }
        }
        Ok(())
    }

    // ── reductions ──────────────────────────────────────────────────────

    fn compile_reduce(
        &mut self,
        span_start: usize,
        dim: Dim,
        op_name: &str,
    ) -> Result<(), ExprError> {
        let span: Vec<Token> = self.out.drain(span_start..).collect();
        let nested = self.active_dims.contains(&dim.name())
            || span
                .iter()
                .any(|t| matches!(t, Token::LoopStart { dim: d, .. } if d.name() == dim.name()));
        if nested {
            return Err(ExprError::NestedReduce(dim.name()));
        }

        if op_name == "reduce" {
            return self.compile_custom_reduce(dim, span);
        }

        let Some(op) = ReduceOp::lookup(op_name) else {
            return Err(ExprError::UnknownName(op_name.to_string()));
        };
        self.expect(&LexToken::OpenParen, "expected '()' after reduction")?;
        self.expect(&LexToken::CloseParen, "expected ')'")?;
        self.emit_reduce(dim, op, span)
    }

    fn emit_reduce(&mut self, dim: Dim, op: ReduceOp, span: Vec<Token>) -> Result<(), ExprError> {
        use ReduceOp::*;

        // forms that never loop
        match (dim, op) {
            (Dim::Signal, Newest) => {
                let mut span = span;
                mark_span(&mut span, dim)?;
                self.out.extend(span);
                return Ok(());
            }
            (_, Newest) => {
                return Err(ExprError::TypeMismatch(
                    "newest() only reduces the signal dimension".into(),
                ))
            }
            (Dim::Vector, Count | Size) => {
                self.out.extend(span);
                self.out.push(Token::VecCall {
                    f: VecFunc::Length,
                    arity: 1,
                });
                return Ok(());
            }
            (Dim::Vector, _) => {
                let f = match op {
                    All => VecFunc::All,
                    Any => VecFunc::Any,
                    Center => VecFunc::Center,
                    Max => VecFunc::Max,
                    Mean => VecFunc::Mean,
                    Min => VecFunc::Min,
                    Sum => VecFunc::Sum,
                    _ => unreachable!(),
                };
                self.out.extend(span);
                self.out.push(Token::VecCall { f, arity: 1 });
                return Ok(());
            }
            (Dim::History(n), Count | Size) => {
                self.out.push(Token::Literal(Vector::I32(vec![n as i32])));
                return Ok(());
            }
            (Dim::Signal, Count | Size) => {
                self.out
                    .push(Token::Literal(Vector::I32(vec![self.ctx.srcs.len() as i32])));
                return Ok(());
            }
            (Dim::Instance, Count) => {
                let var = first_src_var(&span).ok_or_else(|| {
                    ExprError::TypeMismatch("instance reduction needs a signal reference".into())
                })?;
                self.out.push(Token::InstanceCount { var });
                return Ok(());
            }
            (Dim::Instance, Size) => {
                let var = first_src_var(&span).ok_or_else(|| {
                    ExprError::TypeMismatch("instance reduction needs a signal reference".into())
                })?;
                self.out.push(Token::InstancePoolSize { var });
                return Ok(());
            }
            (_, Center) => {
                // (max + min) / 2, as two sequential loops
                self.emit_reduce(dim, Max, span.clone())?;
                self.emit_reduce(dim, Min, span)?;
                self.out.push(Token::Binary(BinaryOp::Add));
                self.out.push(Token::Literal(Vector::F32(vec![0.5])));
                self.out.push(Token::Binary(BinaryOp::Multiply));
                return Ok(());
            }
            _ => {}
        }

        let mut span = span;
        let loop_var = mark_span(&mut span, dim)?;
        let (init, combine) = match op {
            Sum | Mean => (AccInit::Zero, Token::Binary(BinaryOp::Add)),
            Max => (
                AccInit::NegInf,
                Token::Call {
                    f: Func::Max,
                    arity: 2,
                    state: None,
                },
            ),
            Min => (
                AccInit::PosInf,
                Token::Call {
                    f: Func::Min,
                    arity: 2,
                    state: None,
                },
            ),
            Any => (AccInit::Zero, Token::Binary(BinaryOp::LogicalOr)),
            All => (AccInit::One, Token::Binary(BinaryOp::LogicalAnd)),
            _ => unreachable!(),
        };

        self.out.push(Token::LoopStart {
            dim,
            var: loop_var,
            init,
        });
        let body = self.out.len() as u32;
        self.out.extend(span);
        self.out.push(combine);
        self.out.push(Token::LoopEnd { dim, body });

        if op == Mean {
            match dim {
                Dim::History(n) => {
                    self.out.push(Token::Literal(Vector::F32(vec![n as f32])))
                }
                Dim::Signal => self.out.push(Token::Literal(Vector::F32(vec![
                    self.ctx.srcs.len() as f32,
                ]))),
                Dim::Instance => {
                    self.out.push(Token::InstanceCount { var: loop_var });
                    self.out.push(Token::Cast(ScalarType::Float));
                }
                Dim::Vector => unreachable!(),
            }
            self.out.push(Token::Binary(BinaryOp::Divide));
        }
        Ok(())
    }

    fn compile_custom_reduce(&mut self, dim: Dim, span: Vec<Token>) -> Result<(), ExprError> {
        self.expect(&LexToken::OpenParen, "expected '(' after reduce")?;
        self.expect(&LexToken::OpenParen, "expected '(' opening the lambda")?;
        let acc = match self.bump() {
            LexToken::Name(n) => n,
            _ => return Err(self.syntax("expected accumulator name")),
        };
        self.expect(&LexToken::Comma, "expected ','")?;
        let elem = match self.bump() {
            LexToken::Name(n) => n,
            _ => return Err(self.syntax("expected element name")),
        };
        self.expect(&LexToken::CloseParen, "expected ')'")?;
        self.expect(&LexToken::Lambda, "expected '->'")?;

        let mut span = span;
        let loop_var = mark_span(&mut span, dim)?;
        if self.lambda.is_some() {
            return Err(ExprError::NestedReduce("reduce"));
        }
        self.past_lambda_params.push(acc.clone());
        self.past_lambda_params.push(elem.clone());
        self.lambda = Some(LambdaScope { acc, elem, span });

        self.out.push(Token::LoopStart {
            dim,
            var: loop_var,
            init: AccInit::Zero,
        });
        let body = self.out.len() as u32;
        self.active_dims.push(dim.name());
        let result = self.parse_ternary();
        self.active_dims.pop();
        self.lambda = None;
        result?;
        self.expect(&LexToken::CloseParen, "expected ')' closing reduce")?;
        self.out.push(Token::AccStore);
        self.out.push(Token::LoopEnd { dim, body });
        Ok(())
    }
}

/// Finds the first source reference in a span.
fn first_src_var(span: &[Token]) -> Option<VarRef> {
    span.iter().find_map(|t| match t {
        Token::Var {
            var: var @ (VarRef::Src(_) | VarRef::SrcNewest),
            ..
        } => Some(*var),
        _ => None,
    })
}

/// Rewrites variable loads in a reduction operand so they draw their index
/// from the enclosing loop. Returns the loop's subject variable.
fn mark_span(span: &mut [Token], dim: Dim) -> Result<VarRef, ExprError> {
    let mut subject = None;
    for t in span.iter_mut() {
        let Token::Var {
            var,
            hist,
            vec,
            inst,
        } = t
        else {
            continue;
        };
        match dim {
            Dim::History(_) => {
                if matches!(var, VarRef::Src(_) | VarRef::SrcNewest | VarRef::Dst)
                    && *hist == HistIdx::Const(0)
                {
                    *hist = HistIdx::Loop;
                    subject.get_or_insert(*var);
                }
            }
            Dim::Vector => {
                if *vec == VecIdx::Full {
                    *vec = VecIdx::Loop;
                    subject.get_or_insert(*var);
                }
            }
            Dim::Instance => {
                if matches!(var, VarRef::Src(_) | VarRef::SrcNewest) && *inst == InstIdx::Current {
                    *inst = InstIdx::Loop;
                    subject.get_or_insert(*var);
                }
            }
            Dim::Signal => {
                if matches!(var, VarRef::Src(_)) {
                    subject.get_or_insert(*var);
                    *var = VarRef::SrcLoop;
                }
            }
        }
    }
    match dim {
        Dim::Instance | Dim::Signal => subject.ok_or_else(|| {
            ExprError::TypeMismatch(format!("{} reduction needs a signal reference", dim.name()))
        }),
        _ => Ok(subject.unwrap_or(VarRef::Src(0))),
    }
}

/// A span that is a lone scalar literal.
fn const_scalar(toks: &[Token]) -> Option<f64> {
    match toks {
        [Token::Literal(v)] if v.len() == 1 => Some(v.get(0)),
        _ => None,
    }
}

// ── constant folding ────────────────────────────────────────────────────

/// Stack entry during folding: where the value's tokens begin in the
/// rebuilt stream, and the value itself if it is known at compile time.
struct FoldSlot {
    start: usize,
    value: Option<EvalVal>,
}

/// Folds pure constant sub-stacks by evaluating them speculatively, and
/// rejects division by a literal zero. Loop branch targets are remapped to
/// the rebuilt stream.
pub(super) fn fold(tokens: &mut Vec<Token>) -> Result<(), ExprError> {
    let mut out: Vec<Token> = Vec::with_capacity(tokens.len());
    let mut stack: Vec<FoldSlot> = Vec::new();
    // old body index -> new body index, for LoopEnd retargeting
    let mut body_map: HashMap<u32, u32> = HashMap::new();

    fn push_opaque(out: &mut Vec<Token>, stack: &mut Vec<FoldSlot>, tok: Token, pops: usize) {
        for _ in 0..pops.min(stack.len()) {
            stack.pop();
        }
        let start = out.len();
        out.push(tok);
        stack.push(FoldSlot { start, value: None });
    }

    fn fold_top(out: &mut Vec<Token>, stack: &mut Vec<FoldSlot>, pops: usize, value: EvalVal) {
        for _ in 1..pops {
            stack.pop();
        }
        let slot = stack.last_mut().expect("fold stack underflow");
        out.truncate(slot.start);
        out.push(Token::Literal(value.to_vector()));
        slot.value = Some(value);
    }

    fn const_args(stack: &[FoldSlot], n: usize) -> Option<Vec<EvalVal>> {
        if stack.len() < n {
            return None;
        }
        stack[stack.len() - n..]
            .iter()
            .map(|s| s.value.clone())
            .collect()
    }

    for (old_idx, tok) in tokens.drain(..).enumerate() {
        match tok {
            Token::Literal(v) => {
                let value = EvalVal::from_vector(&v);
                let start = out.len();
                out.push(Token::Literal(v));
                stack.push(FoldSlot {
                    start,
                    value: Some(value),
                });
            }
            Token::Unary(op) => match const_args(&stack, 1) {
                Some(args) => {
                    let folded = apply_unary(op, args.into_iter().next().unwrap());
                    fold_top(&mut out, &mut stack, 1, folded);
                }
                None => push_opaque(&mut out, &mut stack, Token::Unary(op), 1),
            },
            Token::Binary(op) => {
                if matches!(op, BinaryOp::Divide | BinaryOp::Modulo) {
                    if let Some(FoldSlot {
                        value: Some(b), ..
                    }) = stack.last()
                    {
                        if b.lanes.iter().any(|x| *x == 0.0) {
                            return Err(ExprError::DivisionByZero);
                        }
                    }
                }
                match const_args(&stack, 2) {
                    Some(mut args) => {
                        let b = args.pop().unwrap();
                        let a = args.pop().unwrap();
                        let folded =
                            apply_binary(op, a, b).map_err(|_| ExprError::DivisionByZero)?;
                        fold_top(&mut out, &mut stack, 2, folded);
                    }
                    None => push_opaque(&mut out, &mut stack, Token::Binary(op), 2),
                }
            }
            Token::Call { f, arity, state } if f.is_pure() => {
                match const_args(&stack, arity as usize) {
                    Some(args) => {
                        let folded = apply_call(f, &args, &mut []);
                        fold_top(&mut out, &mut stack, arity as usize, folded);
                    }
                    None => push_opaque(
                        &mut out,
                        &mut stack,
                        Token::Call { f, arity, state },
                        arity as usize,
                    ),
                }
            }
            Token::Call { f, arity, state } => push_opaque(
                &mut out,
                &mut stack,
                Token::Call { f, arity, state },
                arity as usize,
            ),
            Token::VecCall { f, arity } => match const_args(&stack, arity as usize) {
                Some(args) => {
                    let folded = apply_veccall(f, &args);
                    fold_top(&mut out, &mut stack, arity as usize, folded);
                }
                None => push_opaque(
                    &mut out,
                    &mut stack,
                    Token::VecCall { f, arity },
                    arity as usize,
                ),
            },
            Token::BuildVector { n } => match const_args(&stack, n as usize) {
                Some(args) => {
                    let mut ty = ScalarType::Int32;
                    let mut lanes = Vec::new();
                    for v in &args {
                        ty = ty.promote(v.ty);
                        lanes.extend_from_slice(&v.lanes);
                    }
                    fold_top(&mut out, &mut stack, n as usize, EvalVal { ty, lanes });
                }
                None => push_opaque(&mut out, &mut stack, Token::BuildVector { n }, n as usize),
            },
            Token::Cast(ty) => match const_args(&stack, 1) {
                Some(args) => {
                    let v = args.into_iter().next().unwrap();
                    fold_top(&mut out, &mut stack, 1, EvalVal { ty, lanes: v.lanes });
                }
                None => push_opaque(&mut out, &mut stack, Token::Cast(ty), 1),
            },
            Token::Var {
                var,
                hist,
                vec,
                inst,
            } => {
                let mut pops = 0usize;
                if vec == VecIdx::Dynamic {
                    pops += 1;
                }
                if hist == HistIdx::Dynamic {
                    pops += 1;
                }
                push_opaque(
                    &mut out,
                    &mut stack,
                    Token::Var {
                        var,
                        hist,
                        vec,
                        inst,
                    },
                    pops,
                );
            }
            Token::IfThen => push_opaque(&mut out, &mut stack, Token::IfThen, 2),
            Token::IfElse => push_opaque(&mut out, &mut stack, Token::IfElse, 3),
            t @ (Token::TimeOf { .. }
            | Token::InstanceCount { .. }
            | Token::InstancePoolSize { .. }
            | Token::AccLoad) => push_opaque(&mut out, &mut stack, t, 0),
            t @ Token::LoopStart { .. } => {
                body_map.insert(old_idx as u32 + 1, out.len() as u32 + 1);
                let start = out.len();
                out.push(t);
                stack.push(FoldSlot { start, value: None });
            }
            Token::AccStore => {
                stack.pop();
                out.push(Token::AccStore);
            }
            Token::LoopEnd { dim, body } => {
                let body = *body_map.get(&body).unwrap_or(&body);
                out.push(Token::LoopEnd { dim, body });
                // the accumulator entry stays as the loop's result, but is
                // no longer a compile-time constant
                if let Some(s) = stack.last_mut() {
                    s.value = None;
                }
            }
            Token::Assign(target) => {
                stack.pop();
                out.push(Token::Assign(target));
            }
        }
    }
    *tokens = out;
    Ok(())
}

// ── type & length inference ─────────────────────────────────────────────

/// Infers user-variable types and validates operand types and vector
/// lengths. Iterates to a fixpoint so self-referential accumulators
/// (`acc = acc + x`) settle on their promoted type.
pub(super) fn infer(
    tokens: &[Token],
    ctx: &ExprContext,
    num_vars: usize,
) -> Result<Vec<(ScalarType, usize)>, ExprError> {
    let mut vars = vec![(ScalarType::Int32, 1usize); num_vars];
    let mut acc_tys: HashMap<usize, (ScalarType, usize)> = HashMap::new();

    let widest_src = {
        let mut ty = ScalarType::Int32;
        let mut len = 1;
        for (t, l) in &ctx.srcs {
            ty = ty.promote(*t);
            len = len.max(*l);
        }
        (ty, len)
    };

    for _round in 0..8 {
        let mut changed = false;
        let mut stack: Vec<(ScalarType, usize)> = Vec::new();
        let mut frames: Vec<usize> = Vec::new(); // stack index of loop accumulators

        for (i, tok) in tokens.iter().enumerate() {
            match tok {
                Token::Literal(v) => stack.push((v.ty(), v.len())),
                Token::BuildVector { n } => {
                    let k = *n as usize;
                    if stack.len() < k {
                        return Err(internal());
                    }
                    let mut ty = ScalarType::Int32;
                    let mut len = 0;
                    for (t, l) in stack.drain(stack.len() - k..) {
                        ty = ty.promote(t);
                        len += l;
                    }
                    if len > MAX_VECTOR_LEN {
                        return Err(ExprError::LengthMismatch(len, MAX_VECTOR_LEN));
                    }
                    stack.push((ty, len));
                }
                Token::Var { var, hist, vec, .. } => {
                    if *vec == VecIdx::Dynamic {
                        pop1(&mut stack)?;
                    }
                    if *hist == HistIdx::Dynamic {
                        pop1(&mut stack)?;
                    }
                    let (ty, len) = match var {
                        VarRef::Src(i) => ctx.srcs[*i as usize],
                        VarRef::SrcNewest | VarRef::SrcLoop => widest_src,
                        VarRef::Dst => ctx.dst,
                        VarRef::User(i) => vars[*i as usize],
                    };
                    let len = match vec {
                        VecIdx::Full => len,
                        VecIdx::Slice { len, .. } => *len as usize,
                        _ => 1,
                    };
                    stack.push((ty, len));
                }
                Token::TimeOf { .. } => stack.push((ScalarType::Double, 1)),
                Token::Unary(op) => {
                    let (ty, len) = pop1(&mut stack)?;
                    stack.push((
                        if *op == UnaryOp::Not {
                            ScalarType::Int32
                        } else {
                            ty
                        },
                        len,
                    ));
                }
                Token::Binary(op) => {
                    let (bt, bl) = pop1(&mut stack)?;
                    let (at, al) = pop1(&mut stack)?;
                    if op.requires_int() && (!at.is_integer() || !bt.is_integer()) {
                        return Err(ExprError::TypeMismatch(format!(
                            "operator '{}' requires integer operands",
                            op.symbol()
                        )));
                    }
                    let len = broadcast(al, bl)?;
                    let ty = if op.yields_int() {
                        ScalarType::Int32
                    } else {
                        at.promote(bt)
                    };
                    stack.push((ty, len));
                }
                Token::IfThen => {
                    let (vt, vl) = pop1(&mut stack)?;
                    let (_ct, cl) = pop1(&mut stack)?;
                    stack.push((vt, broadcast(cl, vl)?));
                }
                Token::IfElse => {
                    let (bt, bl) = pop1(&mut stack)?;
                    let (at, al) = pop1(&mut stack)?;
                    let (_ct, cl) = pop1(&mut stack)?;
                    let len = broadcast(broadcast(al, bl)?, cl)?;
                    stack.push((at.promote(bt), len));
                }
                Token::Call { f, arity, .. } => {
                    let mut ty = ScalarType::Int32;
                    let mut len = 1;
                    for _ in 0..*arity {
                        let (t, l) = pop1(&mut stack)?;
                        ty = ty.promote(t);
                        len = broadcast(len, l)?;
                    }
                    if !f.keeps_int() {
                        ty = ty.at_least_float();
                    }
                    stack.push((ty, len));
                }
                Token::VecCall { f, arity } => {
                    let mut args = Vec::new();
                    for _ in 0..*arity {
                        args.push(pop1(&mut stack)?);
                    }
                    args.reverse();
                    let mut ty = args
                        .iter()
                        .fold(ScalarType::Int32, |t, (a, _)| t.promote(*a));
                    if f.needs_float() {
                        ty = ty.at_least_float();
                    }
                    if f.yields_int() {
                        ty = ScalarType::Int32;
                    }
                    let len = if f.reduces() {
                        1
                    } else if *f == VecFunc::Concat {
                        (args[0].1 + args[1].1).min(MAX_VECTOR_LEN)
                    } else {
                        args[0].1
                    };
                    stack.push((ty, len));
                }
                Token::Cast(ty) => {
                    let (_t, l) = pop1(&mut stack)?;
                    stack.push((*ty, l));
                }
                Token::InstanceCount { .. } | Token::InstancePoolSize { .. } => {
                    stack.push((ScalarType::Int32, 1))
                }
                Token::LoopStart { .. } => {
                    let acc = *acc_tys.get(&i).unwrap_or(&(ScalarType::Int32, 1));
                    stack.push(acc);
                    frames.push(stack.len() - 1);
                }
                Token::AccLoad => {
                    let pos = *frames.last().ok_or_else(internal)?;
                    let acc = stack[pos];
                    stack.push(acc);
                }
                Token::AccStore => {
                    let v = pop1(&mut stack)?;
                    let pos = *frames.last().ok_or_else(internal)?;
                    stack[pos] = v;
                }
                Token::LoopEnd { body, .. } => {
                    let pos = frames.pop().ok_or_else(internal)?;
                    if stack.len() != pos + 1 {
                        return Err(internal());
                    }
                    let result = stack[pos];
                    let start = *body as usize - 1;
                    if acc_tys.get(&start) != Some(&result) {
                        acc_tys.insert(start, result);
                        changed = true;
                    }
                }
                Token::Assign(target) => {
                    let (vt, vl) = pop1(&mut stack)?;
                    match target {
                        AssignTarget::Dst { vec_len, .. } => {
                            if vl != *vec_len as usize && vl != 1 {
                                return Err(ExprError::LengthMismatch(vl, *vec_len as usize));
                            }
                        }
                        AssignTarget::User { idx, .. } => {
                            let slot = &mut vars[*idx as usize];
                            if *slot != (vt, vl) {
                                *slot = (vt, vl);
                                changed = true;
                            }
                        }
                        AssignTarget::Alive | AssignTarget::Muted => {}
                    }
                    if !stack.is_empty() {
                        return Err(internal());
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }
    Ok(vars)
}

fn internal() -> ExprError {
    ExprError::Syntax {
        at: 0,
        what: "malformed expression stack".into(),
    }
}

fn pop1(stack: &mut Vec<(ScalarType, usize)>) -> Result<(ScalarType, usize), ExprError> {
    stack.pop().ok_or_else(internal)
}

fn broadcast(a: usize, b: usize) -> Result<usize, ExprError> {
    if a == b || a == 1 || b == 1 {
        Ok(a.max(b))
    } else {
        Err(ExprError::LengthMismatch(a, b))
    }
}

// ── history-depth annotation ────────────────────────────────────────────

/// Computes the ring depth each referenced signal needs: `-k + 1` samples
/// for a fixed offset `k`, `n` samples inside a history-`n` loop.
fn annotate_history(tokens: &[Token], src_hist: &mut [i32], dst_hist: &mut i32) {
    let mut history_frames: Vec<u16> = Vec::new();
    for tok in tokens {
        match tok {
            Token::LoopStart {
                dim: Dim::History(n),
                ..
            } => history_frames.push(*n),
            Token::LoopEnd {
                dim: Dim::History(_),
                ..
            } => {
                history_frames.pop();
            }
            Token::Var { var, hist, .. } => {
                let depth = match hist {
                    HistIdx::Const(k) => 1 - *k as i32,
                    HistIdx::Loop => history_frames.last().copied().unwrap_or(1) as i32,
                    HistIdx::Dynamic => continue, // recorded at parse time
                };
                match var {
                    VarRef::Dst => *dst_hist = (*dst_hist).max(depth),
                    VarRef::Src(i) => {
                        if let Some(d) = src_hist.get_mut(*i as usize) {
                            *d = (*d).max(depth);
                        }
                    }
                    VarRef::SrcNewest | VarRef::SrcLoop => {
                        for d in src_hist.iter_mut() {
                            *d = (*d).max(depth);
                        }
                    }
                    VarRef::User(_) => {}
                }
            }
            Token::Assign(AssignTarget::Dst { hist, .. }) => {
                *dst_hist = (*dst_hist).max(1 - *hist as i32);
            }
            _ => {}
        }
    }
}
