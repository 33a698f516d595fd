//! Arithmetic and comparison kernels.
//!
//! The VM itself has no arithmetic opcodes: operators are type methods
//! registered by the `core` module. Those methods delegate the actual
//! computation here. Mixed `int`/`flt` operands widen to `flt`. Unsupported
//! operand pairings are dispatch errors, division and modulo by zero are
//! domain errors; the native wrapper records either as a VM failure.

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};

use crate::error::Error;
use crate::value::VarKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

/// Apply a binary arithmetic operator.
///
/// Handles `int`/`flt` pairs (widening), string concatenation, string
/// repetition, and vec concatenation.
pub fn arith_binop(op: ArithOp, left: &VarKind, right: &VarKind) -> Result<VarKind, Error> {
    match (left, right) {
        (VarKind::Int(a), VarKind::Int(b)) => int_binop(op, a, b),
        (VarKind::Flt(a), VarKind::Flt(b)) => flt_binop(op, *a, *b),
        (VarKind::Int(a), VarKind::Flt(b)) => flt_binop(op, widen(a), *b),
        (VarKind::Flt(a), VarKind::Int(b)) => flt_binop(op, *a, widen(b)),
        (VarKind::Str(a), VarKind::Str(b)) if op == ArithOp::Add => {
            Ok(VarKind::Str(format!("{}{}", a, b)))
        }
        (VarKind::Str(s), VarKind::Int(n)) if op == ArithOp::Mul => {
            let n = n.to_usize().unwrap_or(0);
            Ok(VarKind::Str(s.repeat(n)))
        }
        (VarKind::Vec(a), VarKind::Vec(b)) if op == ArithOp::Add => {
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            Ok(VarKind::Vec(out))
        }
        _ => Err(Error::Dispatch(format!(
            "unsupported operand types for '{}'",
            op_symbol(op)
        ))),
    }
}

/// Apply an ordering comparison. Numbers compare widened; strings compare
/// lexicographically.
pub fn compare(op: CmpOp, left: &VarKind, right: &VarKind) -> Result<bool, Error> {
    let ord = match (left, right) {
        (VarKind::Int(a), VarKind::Int(b)) => a.partial_cmp(b),
        (VarKind::Flt(a), VarKind::Flt(b)) => a.partial_cmp(b),
        (VarKind::Int(a), VarKind::Flt(b)) => widen(a).partial_cmp(b),
        (VarKind::Flt(a), VarKind::Int(b)) => a.partial_cmp(&widen(b)),
        (VarKind::Str(a), VarKind::Str(b)) => a.partial_cmp(b),
        _ => {
            return Err(Error::Dispatch(
                "unsupported operand types for comparison".to_string(),
            ));
        }
    };
    let ord = match ord {
        Some(o) => o,
        None => return Ok(false), // NaN comparisons
    };
    Ok(match op {
        CmpOp::Lt => ord.is_lt(),
        CmpOp::Le => ord.is_le(),
        CmpOp::Gt => ord.is_gt(),
        CmpOp::Ge => ord.is_ge(),
    })
}

/// Arithmetic negation.
pub fn negate(operand: &VarKind) -> Result<VarKind, Error> {
    match operand {
        VarKind::Int(i) => Ok(VarKind::Int(-i)),
        VarKind::Flt(f) => Ok(VarKind::Flt(-f)),
        _ => Err(Error::Dispatch("unary '-' expects a number".to_string())),
    }
}

fn int_binop(op: ArithOp, a: &BigInt, b: &BigInt) -> Result<VarKind, Error> {
    match op {
        ArithOp::Add => Ok(VarKind::Int(a + b)),
        ArithOp::Sub => Ok(VarKind::Int(a - b)),
        ArithOp::Mul => Ok(VarKind::Int(a * b)),
        ArithOp::Div => {
            if b.is_zero() {
                return Err(Error::Domain("division by zero".to_string()));
            }
            Ok(VarKind::Int(a / b))
        }
        ArithOp::Mod => {
            if b.is_zero() {
                return Err(Error::Domain("modulo by zero".to_string()));
            }
            // Result carries the sign of the divisor, matching flooring
            // division.
            let mut r = a % b;
            if !r.is_zero() && (r.is_negative() != b.is_negative()) {
                r += b;
            }
            Ok(VarKind::Int(r))
        }
    }
}

fn flt_binop(op: ArithOp, a: f64, b: f64) -> Result<VarKind, Error> {
    match op {
        ArithOp::Add => Ok(VarKind::Flt(a + b)),
        ArithOp::Sub => Ok(VarKind::Flt(a - b)),
        ArithOp::Mul => Ok(VarKind::Flt(a * b)),
        ArithOp::Div => {
            if b == 0.0 {
                return Err(Error::Domain("division by zero".to_string()));
            }
            Ok(VarKind::Flt(a / b))
        }
        ArithOp::Mod => {
            if b == 0.0 {
                return Err(Error::Domain("modulo by zero".to_string()));
            }
            Ok(VarKind::Flt(a.rem_euclid(b)))
        }
    }
}

fn widen(i: &BigInt) -> f64 {
    i.to_f64().unwrap_or(f64::INFINITY)
}

fn op_symbol(op: ArithOp) -> &'static str {
    match op {
        ArithOp::Add => "+",
        ArithOp::Sub => "-",
        ArithOp::Mul => "*",
        ArithOp::Div => "/",
        ArithOp::Mod => "%",
    }
}
