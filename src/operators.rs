//! Arithmetic, comparison and equality over runtime values.
//!
//! Errors come back without a span; the evaluator attaches the operator's
//! position.

use std::cmp::Ordering;

use crate::{
    ast::{BinaryOp, UnaryOp},
    diagnostics::{Diagnostic, DiagnosticKind, KentError, Result},
    value::{Value, ValueKind},
};

/// Longest string or list a repetition may produce.
pub const MAX_REPEAT_LEN: usize = 1 << 28;

fn type_error(message: String) -> KentError {
    Diagnostic::new(DiagnosticKind::Type, message).into()
}

fn zero_division(op: BinaryOp) -> KentError {
    let message = match op {
        BinaryOp::Mod => "modulo by zero",
        _ => "division by zero",
    };
    Diagnostic::new(DiagnosticKind::ZeroDivision, message).into()
}

fn unsupported(op: BinaryOp, left: &Value, right: &Value) -> KentError {
    type_error(format!(
        "unsupported operand types for {}: {} and {}",
        op.symbol(),
        left.describe_type(),
        right.describe_type()
    ))
}

/// Applies a non-short-circuiting binary operator.
pub fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
    match op {
        BinaryOp::Equal => Ok(Value::bool(left == right)),
        BinaryOp::NotEqual => Ok(Value::bool(left != right)),
        BinaryOp::Less | BinaryOp::LessEqual | BinaryOp::Greater | BinaryOp::GreaterEqual => {
            let ordering = compare(left, right).ok_or_else(|| unsupported(op, left, right))?;
            let result = match op {
                BinaryOp::Less => ordering == Ordering::Less,
                BinaryOp::LessEqual => ordering != Ordering::Greater,
                BinaryOp::Greater => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Value::bool(result))
        }
        BinaryOp::And => Ok(if left.is_truthy() {
            right.clone()
        } else {
            left.clone()
        }),
        BinaryOp::Or => Ok(if left.is_truthy() {
            left.clone()
        } else {
            right.clone()
        }),
        BinaryOp::Add => add(left, right),
        BinaryOp::Mul => multiply(left, right),
        BinaryOp::Sub | BinaryOp::Div | BinaryOp::Mod | BinaryOp::Pow => {
            numeric(op, left, right)
        }
        BinaryOp::BitAnd
        | BinaryOp::BitOr
        | BinaryOp::BitXor
        | BinaryOp::ShiftLeft
        | BinaryOp::ShiftRight => match (&*left.0, &*right.0) {
            (ValueKind::Int(a), ValueKind::Int(b)) => bitwise(op, *a, *b),
            _ => Err(unsupported(op, left, right)),
        },
    }
}

fn bitwise(op: BinaryOp, a: i64, b: i64) -> Result<Value> {
    let value = match op {
        BinaryOp::BitAnd => a & b,
        BinaryOp::BitOr => a | b,
        BinaryOp::BitXor => a ^ b,
        BinaryOp::ShiftLeft | BinaryOp::ShiftRight if b < 0 => {
            return Err(Diagnostic::new(
                DiagnosticKind::Custom("ValueError".into()),
                "negative shift count",
            )
            .into());
        }
        BinaryOp::ShiftLeft => {
            let shifted = u32::try_from(b)
                .ok()
                .and_then(|count| a.checked_shl(count))
                .filter(|shifted| shifted >> b == a);
            match shifted {
                Some(shifted) => shifted,
                None if a == 0 => 0,
                None => {
                    return Err(Diagnostic::new(
                        DiagnosticKind::Runtime,
                        format!("integer overflow in {a} << {b}"),
                    )
                    .into());
                }
            }
        }
        // Shifting right by 64 or more leaves only the sign.
        BinaryOp::ShiftRight => a >> b.min(63),
        _ => return Err(type_error(format!("`{}` is not bitwise", op.symbol()))),
    };
    Ok(Value::int(value))
}

/// Length of `len` items repeated `count` times, refusing absurd sizes.
fn repeat_len(len: usize, count: i64) -> Result<usize> {
    let count = usize::try_from(count.max(0)).unwrap_or(usize::MAX);
    len.checked_mul(count)
        .filter(|total| *total <= MAX_REPEAT_LEN)
        .ok_or_else(|| {
            Diagnostic::new(
                DiagnosticKind::Runtime,
                format!("repetition of {len} item(s) {count} times is too large"),
            )
            .into()
        })
}

fn add(left: &Value, right: &Value) -> Result<Value> {
    match (&*left.0, &*right.0) {
        (ValueKind::String(a), ValueKind::String(b)) => Ok(Value::string(format!("{a}{b}"))),
        (ValueKind::List(a), ValueKind::List(b)) => {
            Ok(Value::list(a.iter().chain(b.iter()).cloned().collect()))
        }
        _ => numeric(BinaryOp::Add, left, right),
    }
}

fn multiply(left: &Value, right: &Value) -> Result<Value> {
    match (&*left.0, &*right.0) {
        (ValueKind::String(s), ValueKind::Int(n)) | (ValueKind::Int(n), ValueKind::String(s)) => {
            let total = repeat_len(s.len(), *n)?;
            Ok(Value::string(if s.is_empty() {
                String::new()
            } else {
                s.repeat(total / s.len())
            }))
        }
        (ValueKind::List(items), ValueKind::Int(n)) => {
            let total = repeat_len(items.len(), *n)?;
            Ok(Value::list(items.iter().cloned().cycle().take(total).collect()))
        }
        _ => numeric(BinaryOp::Mul, left, right),
    }
}

fn numeric(op: BinaryOp, left: &Value, right: &Value) -> Result<Value> {
    match (&*left.0, &*right.0) {
        (ValueKind::Int(a), ValueKind::Int(b)) => int_op(op, *a, *b),
        _ => {
            let (Some(a), Some(b)) = (left.as_number(), right.as_number()) else {
                return Err(unsupported(op, left, right));
            };
            float_op(op, a, b)
        }
    }
}

fn int_op(op: BinaryOp, a: i64, b: i64) -> Result<Value> {
    let overflow = || -> KentError {
        Diagnostic::new(
            DiagnosticKind::Runtime,
            format!("integer overflow in {a} {} {b}", op.symbol()),
        )
        .into()
    };
    let value = match op {
        BinaryOp::Add => a.checked_add(b).ok_or_else(overflow)?,
        BinaryOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        BinaryOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        BinaryOp::Div => {
            if b == 0 {
                return Err(zero_division(op));
            }
            if a.checked_rem(b).ok_or_else(overflow)? == 0 {
                a.checked_div(b).ok_or_else(overflow)?
            } else {
                return Ok(Value::float(a as f64 / b as f64));
            }
        }
        BinaryOp::Mod => {
            if b == 0 {
                return Err(zero_division(op));
            }
            // Result takes the sign of the divisor.
            let rem = a.checked_rem(b).ok_or_else(overflow)?;
            if rem != 0 && (rem < 0) != (b < 0) {
                rem + b
            } else {
                rem
            }
        }
        BinaryOp::Pow => {
            if b < 0 {
                return Ok(Value::float((a as f64).powf(b as f64)));
            }
            let exponent = u32::try_from(b).map_err(|_| overflow())?;
            a.checked_pow(exponent).ok_or_else(overflow)?
        }
        _ => return Err(type_error(format!("`{}` is not arithmetic", op.symbol()))),
    };
    Ok(Value::int(value))
}

fn float_op(op: BinaryOp, a: f64, b: f64) -> Result<Value> {
    let value = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Err(zero_division(op));
            }
            a / b
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Err(zero_division(op));
            }
            a - b * (a / b).floor()
        }
        BinaryOp::Pow => a.powf(b),
        _ => return Err(type_error(format!("`{}` is not arithmetic", op.symbol()))),
    };
    Ok(Value::float(value))
}

/// Ordering for numbers, strings and lists of comparable values.
pub fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (&*left.0, &*right.0) {
        (ValueKind::Int(a), ValueKind::Int(b)) => Some(a.cmp(b)),
        (ValueKind::String(a), ValueKind::String(b)) => Some(a.cmp(b)),
        (ValueKind::Bool(a), ValueKind::Bool(b)) => Some(a.cmp(b)),
        (ValueKind::List(a), ValueKind::List(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                match compare(x, y)? {
                    Ordering::Equal => continue,
                    other => return Some(other),
                }
            }
            Some(a.len().cmp(&b.len()))
        }
        _ => {
            let a = left.as_number()?;
            let b = right.as_number()?;
            a.partial_cmp(&b)
        }
    }
}

pub fn unary(op: UnaryOp, operand: &Value) -> Result<Value> {
    match (op, &*operand.0) {
        (UnaryOp::Not, _) => Ok(Value::bool(!operand.is_truthy())),
        (UnaryOp::Negate, ValueKind::Int(n)) => n.checked_neg().map(Value::int).ok_or_else(|| {
            Diagnostic::new(DiagnosticKind::Runtime, "integer overflow in negation").into()
        }),
        (UnaryOp::Negate, ValueKind::Float(n)) => Ok(Value::float(-n)),
        (UnaryOp::Negate, _) => Err(type_error(format!(
            "bad operand type for unary -: {}",
            operand.describe_type()
        ))),
        (UnaryOp::BitNot, ValueKind::Int(n)) => Ok(Value::int(!n)),
        (UnaryOp::BitNot, _) => Err(type_error(format!(
            "bad operand type for unary ~: {}",
            operand.describe_type()
        ))),
        (UnaryOp::Deref, _) => Err(type_error(format!(
            "cannot dereference a value of type {}",
            operand.describe_type()
        ))),
    }
}
