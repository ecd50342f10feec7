//! Raw arithmetic, comparison, and coercion helpers.
//!
//! Everything here is metamethod-free: a failed fast path reports
//! `NonNumeric` and the dispatch loop decides whether a metamethod or an
//! error takes over.

use crate::metamethod::Tm;
use sol_core::string::StringInterner;
use sol_core::value::TValue;

/// Binary arithmetic operators, in the order of their opcode group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
}

impl ArithOp {
    /// The metamethod tag dispatched when the fast path fails.
    pub fn tm(self) -> Tm {
        match self {
            ArithOp::Add => Tm::Add,
            ArithOp::Sub => Tm::Sub,
            ArithOp::Mul => Tm::Mul,
            ArithOp::Mod => Tm::Mod,
            ArithOp::Pow => Tm::Pow,
            ArithOp::Div => Tm::Div,
            ArithOp::IDiv => Tm::IDiv,
            ArithOp::BAnd => Tm::BAnd,
            ArithOp::BOr => Tm::BOr,
            ArithOp::BXor => Tm::BXor,
            ArithOp::Shl => Tm::Shl,
            ArithOp::Shr => Tm::Shr,
        }
    }
}

/// Why the fast path could not produce a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithFail {
    /// At least one operand is not usable as a number (or, for bitwise
    /// operators, as an integer).
    NonNumeric,
    /// Integer division or modulo by zero; the payload is the operator
    /// spelling for the error message.
    DivZero(&'static str),
}

/// Exact integer view of a value: integers, and floats with an exact
/// integer representation.
pub fn to_integer(v: TValue) -> Option<i64> {
    match v {
        TValue::Integer(i) => Some(i),
        TValue::Float(f) => {
            if f.fract() == 0.0 && f >= -(2f64.powi(63)) && f < 2f64.powi(63) {
                Some(f as i64)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Compute a binary arithmetic operation on numeric operands.
pub fn raw_arith(op: ArithOp, a: TValue, b: TValue) -> Result<TValue, ArithFail> {
    use ArithOp::*;
    match op {
        BAnd | BOr | BXor | Shl | Shr => {
            let (x, y) = match (to_integer(a), to_integer(b)) {
                (Some(x), Some(y)) => (x, y),
                _ => return Err(ArithFail::NonNumeric),
            };
            let r = match op {
                BAnd => x & y,
                BOr => x | y,
                BXor => x ^ y,
                Shl => shift_left(x, y),
                Shr => shift_left(x, y.wrapping_neg()),
                _ => unreachable!(),
            };
            Ok(TValue::from_integer(r))
        }
        Div | Pow => {
            // always float
            let (x, y) = match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) => (x, y),
                _ => return Err(ArithFail::NonNumeric),
            };
            let r = if op == Div { x / y } else { x.powf(y) };
            Ok(TValue::from_float(r))
        }
        _ => match (a, b) {
            (TValue::Integer(x), TValue::Integer(y)) => match op {
                Add => Ok(TValue::from_integer(x.wrapping_add(y))),
                Sub => Ok(TValue::from_integer(x.wrapping_sub(y))),
                Mul => Ok(TValue::from_integer(x.wrapping_mul(y))),
                Mod => {
                    if y == 0 {
                        Err(ArithFail::DivZero("%"))
                    } else {
                        // result takes the sign of the divisor
                        let m = x.wrapping_rem(y);
                        let m = if m != 0 && (m < 0) != (y < 0) { m + y } else { m };
                        Ok(TValue::from_integer(m))
                    }
                }
                IDiv => {
                    if y == 0 {
                        Err(ArithFail::DivZero("//"))
                    } else {
                        // floor division
                        let q = x.wrapping_div(y);
                        let r = x.wrapping_rem(y);
                        let q = if r != 0 && (r < 0) != (y < 0) { q - 1 } else { q };
                        Ok(TValue::from_integer(q))
                    }
                }
                _ => unreachable!(),
            },
            _ => {
                let (x, y) = match (a.as_number(), b.as_number()) {
                    (Some(x), Some(y)) => (x, y),
                    _ => return Err(ArithFail::NonNumeric),
                };
                let r = match op {
                    Add => x + y,
                    Sub => x - y,
                    Mul => x * y,
                    Mod => {
                        let m = x % y;
                        if m != 0.0 && (m < 0.0) != (y < 0.0) {
                            m + y
                        } else {
                            m
                        }
                    }
                    IDiv => (x / y).floor(),
                    _ => unreachable!(),
                };
                Ok(TValue::from_float(r))
            }
        },
    }
}

/// Shift with Sol semantics: shifts of 64 or more produce zero, negative
/// amounts shift the other way.
fn shift_left(x: i64, n: i64) -> i64 {
    if n < 0 {
        if n <= -64 {
            0
        } else {
            ((x as u64) >> (-n as u32)) as i64
        }
    } else if n >= 64 {
        0
    } else {
        ((x as u64) << (n as u32)) as i64
    }
}

/// Unary minus on a numeric operand.
pub fn raw_unm(v: TValue) -> Result<TValue, ArithFail> {
    match v {
        TValue::Integer(i) => Ok(TValue::from_integer(i.wrapping_neg())),
        TValue::Float(f) => Ok(TValue::from_float(-f)),
        _ => Err(ArithFail::NonNumeric),
    }
}

/// Bitwise not on an integer operand.
pub fn raw_bnot(v: TValue) -> Result<TValue, ArithFail> {
    match to_integer(v) {
        Some(i) => Ok(TValue::from_integer(!i)),
        None => Err(ArithFail::NonNumeric),
    }
}

/// Primitive equality: numbers compare across subtypes, everything else
/// by identity.
pub fn raw_eq(a: TValue, b: TValue) -> bool {
    match (a, b) {
        (TValue::Integer(x), TValue::Float(y)) => x as f64 == y,
        (TValue::Float(x), TValue::Integer(y)) => x == y as f64,
        _ => a == b,
    }
}

/// Primitive less-than over numbers and strings; `None` when the operands
/// are not comparable.
pub fn raw_lt(a: TValue, b: TValue, strings: &StringInterner) -> Option<bool> {
    match (a, b) {
        (TValue::Integer(x), TValue::Integer(y)) => Some(x < y),
        _ => {
            if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
                Some(x < y)
            } else if let (Some(x), Some(y)) = (a.as_string_id(), b.as_string_id()) {
                Some(strings.get_bytes(x) < strings.get_bytes(y))
            } else {
                None
            }
        }
    }
}

/// Primitive less-or-equal; see `raw_lt`.
pub fn raw_le(a: TValue, b: TValue, strings: &StringInterner) -> Option<bool> {
    match (a, b) {
        (TValue::Integer(x), TValue::Integer(y)) => Some(x <= y),
        _ => {
            if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
                Some(x <= y)
            } else if let (Some(x), Some(y)) = (a.as_string_id(), b.as_string_id()) {
                Some(strings.get_bytes(x) <= strings.get_bytes(y))
            } else {
                None
            }
        }
    }
}

/// True when a value participates in concatenation without metamethods.
pub fn concatable(v: TValue) -> bool {
    v.is_string() || v.is_number()
}

/// Render a number the way the language prints it.
pub fn number_to_display(v: TValue) -> Option<String> {
    match v {
        TValue::Integer(i) => Some(format!("{i}")),
        TValue::Float(f) => {
            if f == f.floor() && f.is_finite() {
                Some(format!("{f:.1}"))
            } else {
                Some(format!("{f:.14}").trim_end_matches('0').to_string())
            }
        }
        _ => None,
    }
}
