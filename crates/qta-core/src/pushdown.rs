//! Stack-based evaluator for expression nodes (spec §4.2, component 5):
//! arithmetic, comparisons, logic, ternary, `limit`, and probabilistic draws.
//!
//! An [`Expr`] is first flattened into a postfix instruction sequence, then
//! run against an explicit [`UnitValue`] stack — the engine's tree-walking
//! interpreter never recurses into expression evaluation directly, it calls
//! [`eval`] and gets a single resolved value back.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::ast::{BinOp, CompareOp, Expr, LogicalOp, StreamKind};
use crate::error::{DomainError, EngineError};
use crate::unit::{Unit, UnitValue};

/// What the push-down machine needs from the engine to resolve `get`,
/// free variables, the two protected identifiers, and sampling. The engine
/// implements this directly over its own state.
pub trait EvalHost {
    fn lookup_var(&self, name: &str) -> Option<UnitValue>;
    fn years_elapsed(&self) -> i64;
    fn year_absolute(&self) -> i32;
    fn get_stream(
        &self,
        stream: StreamKind,
        of_substance: Option<&str>,
        as_unit: Option<Unit>,
    ) -> Result<UnitValue, EngineError>;
    fn sample_uniform(&mut self, lo: Decimal, hi: Decimal) -> Decimal;
    fn sample_normal(&mut self, mean: Decimal, std: Decimal) -> Decimal;
}

#[derive(Debug, Clone)]
enum Op {
    Push(UnitValue),
    PushVar(String),
    PushYearsElapsed,
    PushYearAbsolute,
    PushGet { stream: StreamKind, of_substance: Option<String>, as_unit: Option<Unit> },
    Neg,
    Bin(BinOp),
    Cmp(CompareOp),
    Logic(LogicalOp),
    /// Pops [hi, lo, value]; pushes `value` clamped into `[lo, hi]`.
    Limit,
    /// Pops [hi, lo]; pushes a uniform draw in `[lo, hi]`.
    SampleUniform,
    /// Pops [std, mean]; pushes a normal draw.
    SampleNormal,
    /// Pops [else_val, then_val, cond]; pushes `then_val` if truthy else `else_val`.
    Ternary,
}

/// Evaluate an [`Expr`] to a single [`UnitValue`].
pub fn eval(expr: &Expr, host: &mut dyn EvalHost) -> Result<UnitValue, EngineError> {
    let mut ops = Vec::new();
    compile(expr, &mut ops);
    run(&ops, host)
}

fn compile(expr: &Expr, out: &mut Vec<Op>) {
    match expr {
        Expr::Number(n) => out.push(Op::Push(UnitValue::new(*n, Unit::None))),
        Expr::UnitLiteral(n, u) => out.push(Op::Push(UnitValue::new(*n, *u))),
        Expr::Var(name) => out.push(Op::PushVar(name.clone())),
        Expr::YearsElapsed => out.push(Op::PushYearsElapsed),
        Expr::YearAbsolute => out.push(Op::PushYearAbsolute),
        Expr::Neg(inner) => {
            compile(inner, out);
            out.push(Op::Neg);
        }
        Expr::BinOp(lhs, op, rhs) => {
            compile(lhs, out);
            compile(rhs, out);
            out.push(Op::Bin(*op));
        }
        Expr::Compare(lhs, op, rhs) => {
            compile(lhs, out);
            compile(rhs, out);
            out.push(Op::Cmp(*op));
        }
        Expr::Logical(lhs, op, rhs) => {
            compile(lhs, out);
            compile(rhs, out);
            out.push(Op::Logic(*op));
        }
        Expr::Ternary { cond, if_true, if_false } => {
            compile(cond, out);
            compile(if_true, out);
            compile(if_false, out);
            out.push(Op::Ternary);
        }
        Expr::Limit { value, lo, hi } => {
            compile(value, out);
            compile(lo, out);
            compile(hi, out);
            out.push(Op::Limit);
        }
        Expr::SampleUniform { lo, hi } => {
            compile(lo, out);
            compile(hi, out);
            out.push(Op::SampleUniform);
        }
        Expr::SampleNormal { mean, std } => {
            compile(mean, out);
            compile(std, out);
            out.push(Op::SampleNormal);
        }
        Expr::Get { stream, of_substance, as_unit } => out.push(Op::PushGet {
            stream: *stream,
            of_substance: of_substance.clone(),
            as_unit: *as_unit,
        }),
    }
}

fn run(ops: &[Op], host: &mut dyn EvalHost) -> Result<UnitValue, EngineError> {
    let mut stack: Vec<UnitValue> = Vec::with_capacity(ops.len());

    for op in ops {
        match op {
            Op::Push(v) => stack.push(*v),
            Op::PushVar(name) => {
                let v = host
                    .lookup_var(name)
                    .ok_or_else(|| crate::error::ReferenceError::UnknownVariable(name.clone()))?;
                stack.push(v);
            }
            Op::PushYearsElapsed => {
                stack.push(UnitValue::new(Decimal::from(host.years_elapsed()), Unit::None))
            }
            Op::PushYearAbsolute => {
                stack.push(UnitValue::new(Decimal::from(host.year_absolute()), Unit::None))
            }
            Op::PushGet { stream, of_substance, as_unit } => {
                let v = host.get_stream(*stream, of_substance.as_deref(), *as_unit)?;
                stack.push(v);
            }
            Op::Neg => {
                let v = pop(&mut stack)?;
                stack.push(UnitValue::new(-v.magnitude, v.unit));
            }
            Op::Bin(bin) => {
                let rhs = pop(&mut stack)?;
                let lhs = pop(&mut stack)?;
                stack.push(apply_bin(*bin, lhs, rhs)?);
            }
            Op::Cmp(cmp) => {
                let rhs = pop(&mut stack)?;
                let lhs = pop(&mut stack)?;
                let result = match cmp {
                    CompareOp::Lt => lhs.magnitude < rhs.magnitude,
                    CompareOp::Le => lhs.magnitude <= rhs.magnitude,
                    CompareOp::Gt => lhs.magnitude > rhs.magnitude,
                    CompareOp::Ge => lhs.magnitude >= rhs.magnitude,
                    CompareOp::Eq => lhs.magnitude == rhs.magnitude,
                    CompareOp::Ne => lhs.magnitude != rhs.magnitude,
                };
                stack.push(bool_value(result));
            }
            Op::Logic(op) => {
                let rhs = pop(&mut stack)?;
                let lhs = pop(&mut stack)?;
                let (l, r) = (is_truthy(&lhs), is_truthy(&rhs));
                let result = match op {
                    LogicalOp::And => l && r,
                    LogicalOp::Or => l || r,
                    LogicalOp::Xor => l != r,
                };
                stack.push(bool_value(result));
            }
            Op::Limit => {
                let hi = pop(&mut stack)?;
                let lo = pop(&mut stack)?;
                let value = pop(&mut stack)?;
                let clamped = value.magnitude.clamp(lo.magnitude.min(hi.magnitude), lo.magnitude.max(hi.magnitude));
                stack.push(UnitValue::new(clamped, value.unit));
            }
            Op::SampleUniform => {
                let hi = pop(&mut stack)?;
                let lo = pop(&mut stack)?;
                let draw = host.sample_uniform(lo.magnitude, hi.magnitude);
                stack.push(UnitValue::new(draw, lo.unit));
            }
            Op::SampleNormal => {
                let std = pop(&mut stack)?;
                let mean = pop(&mut stack)?;
                let draw = host.sample_normal(mean.magnitude, std.magnitude);
                stack.push(UnitValue::new(draw, mean.unit));
            }
            Op::Ternary => {
                let else_val = pop(&mut stack)?;
                let then_val = pop(&mut stack)?;
                let cond = pop(&mut stack)?;
                stack.push(if is_truthy(&cond) { then_val } else { else_val });
            }
        }
    }

    pop(&mut stack)
}

fn pop(stack: &mut Vec<UnitValue>) -> Result<UnitValue, EngineError> {
    stack
        .pop()
        .ok_or_else(|| EngineError::Internal("push-down stack underflow".into()))
}

fn is_truthy(v: &UnitValue) -> bool {
    !v.magnitude.is_zero()
}

fn bool_value(b: bool) -> UnitValue {
    UnitValue::new(if b { Decimal::ONE } else { Decimal::ZERO }, Unit::None)
}

fn apply_bin(op: BinOp, lhs: UnitValue, rhs: UnitValue) -> Result<UnitValue, EngineError> {
    // Arithmetic is performed on raw magnitudes; unit bookkeeping for `+`/`-`
    // keeps the left operand's unit (the common case: `manufacture + 5 kg`),
    // `*`/`/` keep the left operand's unit as well (DSL programs scale a
    // quantity by a dimensionless factor, they do not form new ratio units
    // inline — ratio units only arise from declared parameters).
    let unit = lhs.unit;
    let magnitude = match op {
        BinOp::Add => lhs.magnitude + rhs.magnitude,
        BinOp::Sub => lhs.magnitude - rhs.magnitude,
        BinOp::Mul => lhs.magnitude * rhs.magnitude,
        BinOp::Div => crate::unit::divide_exact(lhs.magnitude, rhs.magnitude)
            .ok_or_else(|| DomainError::DivisionByZero("/".into()))?,
        BinOp::Pow => {
            if rhs.magnitude.trunc() != rhs.magnitude {
                return Err(EngineError::Internal(format!(
                    "non-integer exponent '{}' unsupported",
                    rhs.magnitude
                )));
            }
            let exp_i = rhs.magnitude.to_i64().ok_or_else(|| EngineError::Internal("exponent out of range".into()))?;
            pow_decimal(lhs.magnitude, exp_i)
        }
    };
    Ok(UnitValue::new(magnitude, unit))
}

fn pow_decimal(base: Decimal, exp: i64) -> Decimal {
    if exp < 0 {
        let positive = pow_decimal(base, -exp);
        return Decimal::ONE / positive;
    }
    let mut result = Decimal::ONE;
    for _ in 0..exp {
        result *= base;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Expr;
    use rust_decimal_macros::dec;

    struct NullHost;
    impl EvalHost for NullHost {
        fn lookup_var(&self, name: &str) -> Option<UnitValue> {
            if name == "x" {
                Some(UnitValue::new(dec!(4), Unit::None))
            } else {
                None
            }
        }
        fn years_elapsed(&self) -> i64 {
            2
        }
        fn year_absolute(&self) -> i32 {
            2005
        }
        fn get_stream(
            &self,
            _stream: StreamKind,
            _of_substance: Option<&str>,
            _as_unit: Option<Unit>,
        ) -> Result<UnitValue, EngineError> {
            Ok(UnitValue::zero(Unit::Kg))
        }
        fn sample_uniform(&mut self, lo: Decimal, _hi: Decimal) -> Decimal {
            lo
        }
        fn sample_normal(&mut self, mean: Decimal, _std: Decimal) -> Decimal {
            mean
        }
    }

    #[test]
    fn arithmetic_precedence_is_baked_in_by_the_parser_not_pushdown() {
        let expr = Expr::BinOp(
            Box::new(Expr::Number(dec!(2))),
            BinOp::Add,
            Box::new(Expr::BinOp(Box::new(Expr::Number(dec!(3))), BinOp::Mul, Box::new(Expr::Number(dec!(4))))),
        );
        let mut host = NullHost;
        let result = eval(&expr, &mut host).unwrap();
        assert_eq!(result.magnitude, dec!(14));
    }

    #[test]
    fn ternary_selects_branch() {
        let expr = Expr::Ternary {
            cond: Box::new(Expr::Compare(
                Box::new(Expr::Number(dec!(5))),
                CompareOp::Gt,
                Box::new(Expr::Number(dec!(1))),
            )),
            if_true: Box::new(Expr::Number(dec!(100))),
            if_false: Box::new(Expr::Number(dec!(200))),
        };
        let mut host = NullHost;
        assert_eq!(eval(&expr, &mut host).unwrap().magnitude, dec!(100));
    }

    #[test]
    fn limit_clamps_into_range() {
        let expr = Expr::Limit {
            value: Box::new(Expr::Number(dec!(500))),
            lo: Box::new(Expr::Number(dec!(0))),
            hi: Box::new(Expr::Number(dec!(100))),
        };
        let mut host = NullHost;
        assert_eq!(eval(&expr, &mut host).unwrap().magnitude, dec!(100));
    }

    #[test]
    fn variable_lookup_resolves_free_identifiers() {
        let mut host = NullHost;
        assert_eq!(eval(&Expr::Var("x".into()), &mut host).unwrap().magnitude, dec!(4));
    }

    #[test]
    fn unknown_variable_is_a_reference_error() {
        let mut host = NullHost;
        let err = eval(&Expr::Var("missing".into()), &mut host).unwrap_err();
        assert!(matches!(err, EngineError::Reference(_)));
    }
}
