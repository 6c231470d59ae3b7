//! The expression engine.
//!
//! Maps transform values with a small, strictly typed expression language:
//!
//! ```text
//! y = x * 0.5 + x{-1} * 0.5;
//! y = x.vector.mean();
//! y = x.instance.count();
//! alive = x[0] > 0;
//! ```
//!
//! An expression is compiled once per map ([`CompiledExpr::compile`]) and
//! evaluated per incoming sample ([`evaluate`]). Compilation runs a lexer,
//! a shunting-yard parser emitting a postfix token stack, type and
//! vector-length inference, constant folding, and history-depth
//! annotation. Per-instance state (user variables, `ema`/`schmitt`
//! memories) lives in an [`ExprState`] owned by the map.

mod eval;
mod lexer;
mod parser;
mod token;

pub use eval::{evaluate, EvalFlags, EvalOutput, EvalParams, ExprState, SlotSource};
pub use token::{MAX_HISTORY, MAX_SOURCES};

use thiserror::Error;

use crate::value::ScalarType;
use token::Token;

/// Compile-time diagnostics.
#[derive(Debug, Error)]
pub enum ExprError {
    #[error("syntax error at byte {at}: {what}")]
    Syntax { at: usize, what: String },
    #[error("unknown name '{0}'")]
    UnknownName(String),
    #[error("reduce-local variable '{0}' used outside its reduction")]
    ReduceLocal(String),
    #[error("cannot assign to an input signal")]
    AssignToInput,
    #[error("division by literal zero")]
    DivisionByZero,
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("vector length mismatch: {0} vs {1}")]
    LengthMismatch(usize, usize),
    #[error("wrong arity for {name}: expected {expected}, got {got}")]
    Arity {
        name: String,
        expected: u8,
        got: u8,
    },
    #[error("history depth {0} exceeds the maximum of {MAX_HISTORY}")]
    HistoryTooDeep(i64),
    #[error("nested {0} reductions")]
    NestedReduce(&'static str),
    #[error("expression never assigns y")]
    NoOutput,
}

/// Signal shapes an expression compiles against.
#[derive(Clone, Debug)]
pub struct ExprContext {
    /// Element type and vector length per source slot, in slot order.
    pub srcs: Vec<(ScalarType, usize)>,
    /// Element type and vector length of the destination.
    pub dst: (ScalarType, usize),
}

/// A compiled expression: the postfix token stack plus everything the
/// evaluator and the owning map need to know about it.
#[derive(Clone, Debug)]
pub struct CompiledExpr {
    source: String,
    tokens: Vec<Token>,
    src_types: Vec<(ScalarType, usize)>,
    out_ty: ScalarType,
    out_len: usize,
    var_types: Vec<(ScalarType, usize)>,
    var_names: Vec<String>,
    num_state: usize,
    src_hist: Vec<i32>,
    dst_hist: i32,
    uses_current_instance: bool,
}

impl CompiledExpr {
    pub fn compile(expr: &str, ctx: &ExprContext) -> Result<CompiledExpr, ExprError> {
        parser::compile(expr, ctx)
    }

    /// The expression text this was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Ring depth required of source slot `i`.
    pub fn src_history(&self, i: usize) -> i32 {
        self.src_hist.get(i).copied().unwrap_or(1)
    }

    /// Ring depth required of the destination.
    pub fn dst_history(&self) -> i32 {
        self.dst_hist
    }

    /// True when one evaluator run covers all instances.
    pub fn eval_once(&self) -> bool {
        !self.uses_current_instance
    }

    pub fn var_names(&self) -> &[String] {
        &self.var_names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ValueBuffer;
    use crate::time::Timetag;
    use crate::value::Vector;

    fn ctx(srcs: &[(ScalarType, usize)], dst: (ScalarType, usize)) -> ExprContext {
        ExprContext {
            srcs: srcs.to_vec(),
            dst,
        }
    }

    fn scalar_ctx() -> ExprContext {
        ctx(&[(ScalarType::Float, 1)], (ScalarType::Float, 1))
    }

    /// Evaluates `expr` over a sequence of scalar source samples,
    /// returning the produced outputs.
    fn run_scalar(expr: &str, inputs: &[f64]) -> Vec<Option<f64>> {
        run_typed(expr, inputs, ScalarType::Float, ScalarType::Float)
    }

    fn run_typed(
        expr: &str,
        inputs: &[f64],
        src_ty: ScalarType,
        dst_ty: ScalarType,
    ) -> Vec<Option<f64>> {
        let ctx = ctx(&[(src_ty, 1)], (dst_ty, 1));
        let compiled = CompiledExpr::compile(expr, &ctx).unwrap();
        let mut state = ExprState::new(&compiled);
        let mut src = ValueBuffer::new(src_ty, 1, compiled.src_history(0) as usize);
        let mut dst = ValueBuffer::new(dst_ty, 1, compiled.dst_history() as usize);
        let mut out = Vec::new();
        for (i, v) in inputs.iter().enumerate() {
            let t = Timetag::new(i as u32 + 1, 0);
            src.write(&Vector::from_f64s(src_ty, &[*v]), t);
            let srcs = [SlotSource {
                cur: Some(&src),
                all: vec![&src],
                pool_size: 1,
                time: t,
            }];
            let result = evaluate(
                &compiled,
                &mut state,
                &EvalParams {
                    srcs: &srcs,
                    dst: Some(&dst),
                    dst_time: t,
                    newest: 0,
                },
            );
            match result.and_then(|r| r.value) {
                Some(value) => {
                    dst.write(&value, t);
                    out.push(Some(value.get(0)));
                }
                None => out.push(None),
            }
        }
        out
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(run_scalar("y = x*x + 1", &[0.0, 1.0, 2.0, 3.0]),
            vec![Some(1.0), Some(2.0), Some(5.0), Some(10.0)]);
        assert_eq!(run_scalar("y = 2 + 3 * 4", &[0.0]), vec![Some(14.0)]);
        assert_eq!(run_scalar("y = (2 + 3) * 4", &[0.0]), vec![Some(20.0)]);
    }

    #[test]
    fn unary_and_logic() {
        assert_eq!(run_scalar("y = -x", &[2.5]), vec![Some(-2.5)]);
        assert_eq!(run_scalar("y = !(x > 1)", &[0.0, 2.0]),
            vec![Some(1.0), Some(0.0)]);
        assert_eq!(run_scalar("y = x > 1 && x < 3", &[2.0, 4.0]),
            vec![Some(1.0), Some(0.0)]);
    }

    #[test]
    fn ternary_selects() {
        assert_eq!(
            run_scalar("y = x > 0 ? x : 0 - x", &[3.0, -4.0]),
            vec![Some(3.0), Some(4.0)]
        );
    }

    #[test]
    fn conditional_without_else_skips_output() {
        assert_eq!(
            run_scalar("y = x > 5 ? x", &[3.0, 7.0]),
            vec![None, Some(7.0)]
        );
    }

    #[test]
    fn history_filter_needs_samples_first() {
        // no output until the history is populated
        assert_eq!(
            run_scalar("y = x{-1} * 0.5 + x * 0.5", &[0.0, 10.0, 20.0]),
            vec![None, Some(5.0), Some(15.0)]
        );
    }

    #[test]
    fn history_reduce_mean() {
        assert_eq!(
            run_scalar("y = x.history(3).mean()", &[3.0, 6.0, 9.0, 12.0]),
            vec![None, None, Some(6.0), Some(9.0)]
        );
    }

    #[test]
    fn custom_reduce_over_history() {
        assert_eq!(
            run_scalar("y = x.history(2).reduce((a, b) -> a + b)", &[1.0, 2.0, 3.0]),
            vec![None, Some(3.0), Some(5.0)]
        );
    }

    #[test]
    fn user_variable_accumulates_across_samples() {
        assert_eq!(
            run_scalar("count = count + 1; y = count", &[9.0, 9.0, 9.0]),
            vec![Some(1.0), Some(2.0), Some(3.0)]
        );
    }

    #[test]
    fn ema_converges_from_first_sample() {
        let out = run_scalar("y = ema(x, 0.5)", &[10.0, 0.0]);
        assert_eq!(out[0], Some(10.0));
        assert_eq!(out[1], Some(5.0));
    }

    #[test]
    fn schmitt_trigger_hysteresis() {
        let out = run_scalar("y = schmitt(x, 2, 4)", &[1.0, 5.0, 3.0, 1.0]);
        assert_eq!(
            out,
            vec![Some(0.0), Some(1.0), Some(1.0), Some(0.0)]
        );
    }

    #[test]
    fn integer_division_truncates() {
        assert_eq!(
            run_typed("y = x / 2", &[5.0], ScalarType::Int32, ScalarType::Int32),
            vec![Some(2.0)]
        );
    }

    #[test]
    fn runtime_integer_divide_by_zero_skips_statement() {
        // x is 0 on the first sample: the assignment is skipped, no output
        assert_eq!(
            run_typed("y = 10 / x", &[0.0, 5.0], ScalarType::Int32, ScalarType::Int32),
            vec![None, Some(2.0)]
        );
    }

    #[test]
    fn vector_reduction_mean() {
        let ctx = ctx(&[(ScalarType::Int32, 3)], (ScalarType::Float, 1));
        let compiled = CompiledExpr::compile("y = x.vector.mean()", &ctx).unwrap();
        let mut state = ExprState::new(&compiled);
        let mut src = ValueBuffer::new(ScalarType::Int32, 3, 1);
        src.write(&Vector::I32(vec![0, 6, 12]), Timetag::new(1, 0));
        let srcs = [SlotSource {
            cur: Some(&src),
            all: vec![&src],
            pool_size: 1,
            time: Timetag::new(1, 0),
        }];
        let out = evaluate(
            &compiled,
            &mut state,
            &EvalParams {
                srcs: &srcs,
                dst: None,
                dst_time: Timetag::new(1, 0),
                newest: 0,
            },
        )
        .unwrap();
        assert_eq!(out.value, Some(Vector::F32(vec![6.0])));
    }

    #[test]
    fn vector_indexing_and_literals() {
        let ctx = ctx(&[(ScalarType::Float, 3)], (ScalarType::Float, 1));
        let compiled = CompiledExpr::compile("y = x[1] + [10, 20, 30].vector.max()", &ctx).unwrap();
        let mut state = ExprState::new(&compiled);
        let mut src = ValueBuffer::new(ScalarType::Float, 3, 1);
        src.write(&Vector::F32(vec![1.0, 2.0, 3.0]), Timetag::new(1, 0));
        let srcs = [SlotSource {
            cur: Some(&src),
            all: vec![&src],
            pool_size: 1,
            time: Timetag::new(1, 0),
        }];
        let out = evaluate(
            &compiled,
            &mut state,
            &EvalParams {
                srcs: &srcs,
                dst: None,
                dst_time: Timetag::new(1, 0),
                newest: 0,
            },
        )
        .unwrap();
        assert_eq!(out.value, Some(Vector::F32(vec![32.0])));
    }

    #[test]
    fn instance_reduction_sums_active_instances() {
        let ctx = scalar_ctx();
        let compiled = CompiledExpr::compile("y = x.instance.sum()", &ctx).unwrap();
        assert!(compiled.eval_once());
        let mut state = ExprState::new(&compiled);
        let mut bufs = Vec::new();
        for v in [10.0, 10.0, 10.0, 10.0] {
            let mut b = ValueBuffer::new(ScalarType::Float, 1, 1);
            b.write(&Vector::F32(vec![v as f32]), Timetag::new(1, 0));
            bufs.push(b);
        }
        let srcs = [SlotSource {
            cur: Some(&bufs[0]),
            all: bufs.iter().collect(),
            pool_size: 8,
            time: Timetag::new(1, 0),
        }];
        let out = evaluate(
            &compiled,
            &mut state,
            &EvalParams {
                srcs: &srcs,
                dst: None,
                dst_time: Timetag::new(1, 0),
                newest: 0,
            },
        )
        .unwrap();
        assert!(out.flags.contains(EvalFlags::EVAL_DONE));
        assert_eq!(out.value, Some(Vector::F32(vec![40.0])));
    }

    #[test]
    fn instance_count_is_an_integer_independent_of_values() {
        let ctx = ctx(&[(ScalarType::Float, 1)], (ScalarType::Int32, 1));
        let compiled = CompiledExpr::compile("y = x.instance.count()", &ctx).unwrap();
        let mut state = ExprState::new(&compiled);
        let mut a = ValueBuffer::new(ScalarType::Float, 1, 1);
        let mut b = ValueBuffer::new(ScalarType::Float, 1, 1);
        a.write(&Vector::F32(vec![123.0]), Timetag::new(1, 0));
        b.write(&Vector::F32(vec![-9.0]), Timetag::new(1, 0));
        let srcs = [SlotSource {
            cur: Some(&a),
            all: vec![&a, &b],
            pool_size: 4,
            time: Timetag::new(1, 0),
        }];
        let out = evaluate(
            &compiled,
            &mut state,
            &EvalParams {
                srcs: &srcs,
                dst: None,
                dst_time: Timetag::new(1, 0),
                newest: 0,
            },
        )
        .unwrap();
        assert_eq!(out.value, Some(Vector::I32(vec![2])));
    }

    #[test]
    fn convergent_sum_of_two_sources() {
        let ctx = ctx(
            &[(ScalarType::Float, 1), (ScalarType::Float, 1)],
            (ScalarType::Float, 1),
        );
        let compiled = CompiledExpr::compile("y = x$0 + x$1", &ctx).unwrap();
        let mut state = ExprState::new(&compiled);
        let mut a = ValueBuffer::new(ScalarType::Float, 1, 1);
        let mut b = ValueBuffer::new(ScalarType::Float, 1, 1);
        a.write(&Vector::F32(vec![3.0]), Timetag::new(1, 0));
        b.write(&Vector::F32(vec![4.0]), Timetag::new(1, 0));
        let srcs = [
            SlotSource {
                cur: Some(&a),
                all: vec![&a],
                pool_size: 1,
                time: Timetag::new(1, 0),
            },
            SlotSource {
                cur: Some(&b),
                all: vec![&b],
                pool_size: 1,
                time: Timetag::new(1, 0),
            },
        ];
        let out = evaluate(
            &compiled,
            &mut state,
            &EvalParams {
                srcs: &srcs,
                dst: None,
                dst_time: Timetag::new(1, 0),
                newest: 1,
            },
        )
        .unwrap();
        assert_eq!(out.value, Some(Vector::F32(vec![7.0])));
    }

    #[test]
    fn alive_zero_releases_before_update() {
        let ctx = scalar_ctx();
        let compiled = CompiledExpr::compile("alive = x > 0; y = x", &ctx).unwrap();
        let mut state = ExprState::new(&compiled);
        let mut src = ValueBuffer::new(ScalarType::Float, 1, 1);
        src.write(&Vector::F32(vec![-1.0]), Timetag::new(1, 0));
        let srcs = [SlotSource {
            cur: Some(&src),
            all: vec![&src],
            pool_size: 1,
            time: Timetag::new(1, 0),
        }];
        let out = evaluate(
            &compiled,
            &mut state,
            &EvalParams {
                srcs: &srcs,
                dst: None,
                dst_time: Timetag::new(1, 0),
                newest: 0,
            },
        )
        .unwrap();
        assert!(out.flags.contains(EvalFlags::RELEASE_BEFORE_UPDATE));
        assert_eq!(out.value, None);
    }

    #[test]
    fn muted_suppresses_output() {
        assert_eq!(
            run_scalar("muted = x < 0; y = x", &[1.0, -2.0, 3.0]),
            vec![Some(1.0), None, Some(3.0)]
        );
    }

    #[test]
    fn history_depths_are_annotated() {
        let compiled =
            CompiledExpr::compile("y = x{-4} + x.history(2).sum()", &scalar_ctx()).unwrap();
        assert_eq!(compiled.src_history(0), 5);
        let compiled = CompiledExpr::compile("y = y{-3} + x", &scalar_ctx()).unwrap();
        assert_eq!(compiled.dst_history(), 4);
    }

    #[test]
    fn constant_folding_reduces_pure_subexpressions() {
        let compiled =
            CompiledExpr::compile("y = x + sqrt(16.0) * 2", &scalar_ctx()).unwrap();
        // "sqrt(16.0) * 2" folds to a single literal: x, literal, add, assign
        assert_eq!(compiled.tokens.len(), 4);
    }

    #[test]
    fn parse_diagnostics() {
        let c = scalar_ctx;
        assert!(matches!(
            CompiledExpr::compile("y = x +", &c()),
            Err(ExprError::Syntax { .. })
        ));
        assert!(matches!(
            CompiledExpr::compile("y = nope", &c()),
            Err(ExprError::UnknownName(_))
        ));
        assert!(matches!(
            CompiledExpr::compile("x = y", &c()),
            Err(ExprError::AssignToInput)
        ));
        assert!(matches!(
            CompiledExpr::compile("y = x / 0", &c()),
            Err(ExprError::DivisionByZero)
        ));
        assert!(matches!(
            CompiledExpr::compile("y = pow(x)", &c()),
            Err(ExprError::Arity { .. })
        ));
        assert!(matches!(
            CompiledExpr::compile("y = x{-200}", &c()),
            Err(ExprError::HistoryTooDeep(_))
        ));
        assert!(matches!(
            CompiledExpr::compile("y = x", &ctx(&[], (ScalarType::Float, 1))),
            Err(ExprError::UnknownName(_))
        ));
        assert!(matches!(
            CompiledExpr::compile("q = x", &c()),
            Err(ExprError::NoOutput)
        ));
        assert!(matches!(
            CompiledExpr::compile(
                "y = x.history(2).reduce((a, b) -> a + b.history(2).sum())",
                &c()
            ),
            Err(ExprError::NestedReduce(_))
        ));
        assert!(matches!(
            CompiledExpr::compile("y = x.history(2).reduce((a, b) -> a + b); q = a; y = q", &c()),
            Err(ExprError::ReduceLocal(_))
        ));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let ctx = ctx(
            &[(ScalarType::Float, 3), (ScalarType::Float, 2)],
            (ScalarType::Float, 3),
        );
        assert!(matches!(
            CompiledExpr::compile("y = x$0 + x$1", &ctx),
            Err(ExprError::LengthMismatch(_, _))
        ));
    }

    #[test]
    fn shift_requires_integers() {
        assert!(matches!(
            CompiledExpr::compile("y = x << 2", &scalar_ctx()),
            Err(ExprError::TypeMismatch(_))
        ));
    }

    #[test]
    fn midi_conversions_round_trip() {
        let out = run_scalar("y = hzToMidi(midiToHz(x))", &[69.0, 57.0]);
        assert!((out[0].unwrap() - 69.0).abs() < 1e-4);
        assert!((out[1].unwrap() - 57.0).abs() < 1e-4);
    }
}
