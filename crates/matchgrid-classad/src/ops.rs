//! Operator semantics over evaluated values.

use std::cmp::Ordering;

use crate::expr::{BinaryOp, UnaryOp};
use crate::value::{AbsTime, Value};

/// Strict propagation: Error wins over Undefined.
fn strict(l: &Value, r: &Value) -> Option<Value> {
    match (l, r) {
        (Value::Error(e), _) | (_, Value::Error(e)) => Some(Value::Error(e.clone())),
        (Value::Undefined, _) | (_, Value::Undefined) => Some(Value::Undefined),
        _ => None,
    }
}

fn type_error(op: &str, l: &Value, r: &Value) -> Value {
    Value::error(format!("cannot apply {op} to {} and {}", l.kind(), r.kind()))
}

pub(crate) fn unary(op: UnaryOp, v: Value) -> Value {
    match (op, v) {
        (_, Value::Undefined) => Value::Undefined,
        (_, e @ Value::Error(_)) => e,
        (UnaryOp::Neg, Value::Integer(i)) => Value::Integer(i.wrapping_neg()),
        (UnaryOp::Neg, Value::Real(r)) => Value::Real(-r),
        (UnaryOp::Neg, Value::RelTime(r)) => Value::RelTime(-r),
        (UnaryOp::Plus, v @ (Value::Integer(_) | Value::Real(_) | Value::RelTime(_))) => v,
        (UnaryOp::Not, Value::Boolean(b)) => Value::Boolean(!b),
        (UnaryOp::BitNot, Value::Integer(i)) => Value::Integer(!i),
        (op, v) => Value::error(format!("cannot apply {} to {}", op.symbol(), v.kind())),
    }
}

/// Three-valued conjunction. `l` is the already-evaluated left operand.
pub(crate) fn and(l: &Value, r: &Value) -> Value {
    match (l, r) {
        (Value::Boolean(false), _) => Value::Boolean(false),
        (Value::Error(e), _) => Value::Error(e.clone()),
        (Value::Boolean(true) | Value::Undefined, Value::Error(e)) => Value::Error(e.clone()),
        (Value::Boolean(true) | Value::Undefined, Value::Boolean(false)) => Value::Boolean(false),
        (Value::Boolean(true), Value::Boolean(true)) => Value::Boolean(true),
        (Value::Boolean(true) | Value::Undefined, Value::Boolean(true) | Value::Undefined) => {
            Value::Undefined
        }
        _ => type_error("&&", l, r),
    }
}

/// Three-valued disjunction.
pub(crate) fn or(l: &Value, r: &Value) -> Value {
    match (l, r) {
        (Value::Boolean(true), _) => Value::Boolean(true),
        (Value::Error(e), _) => Value::Error(e.clone()),
        (Value::Boolean(false) | Value::Undefined, Value::Error(e)) => Value::Error(e.clone()),
        (Value::Boolean(false) | Value::Undefined, Value::Boolean(true)) => Value::Boolean(true),
        (Value::Boolean(false), Value::Boolean(false)) => Value::Boolean(false),
        (Value::Boolean(false) | Value::Undefined, Value::Boolean(false) | Value::Undefined) => {
            Value::Undefined
        }
        _ => type_error("||", l, r),
    }
}

pub(crate) fn binary(op: BinaryOp, l: &Value, r: &Value) -> Value {
    match op {
        BinaryOp::And => and(l, r),
        BinaryOp::Or => or(l, r),
        BinaryOp::Is => Value::Boolean(l.identical(r)),
        BinaryOp::Isnt => Value::Boolean(!l.identical(r)),
        BinaryOp::Eq
        | BinaryOp::Ne
        | BinaryOp::Lt
        | BinaryOp::Le
        | BinaryOp::Gt
        | BinaryOp::Ge => compare(op, l, r),
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(op, l, r)
        }
        BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor => bitwise(op, l, r),
        BinaryOp::Shl | BinaryOp::Shr | BinaryOp::UShr => shift(op, l, r),
    }
}

/// Order two values for the comparison operators. Strings compare
/// case-insensitively; integers promote to reals when mixed.
pub(crate) fn ordering(l: &Value, r: &Value) -> Result<Option<Ordering>, Value> {
    match (l, r) {
        (Value::Integer(a), Value::Integer(b)) => Ok(Some(a.cmp(b))),
        (Value::Integer(_) | Value::Real(_), Value::Integer(_) | Value::Real(_)) => {
            let (a, b) = (l.as_f64().unwrap_or(f64::NAN), r.as_f64().unwrap_or(f64::NAN));
            Ok(a.partial_cmp(&b))
        }
        (Value::String(a), Value::String(b)) => {
            Ok(Some(a.to_lowercase().cmp(&b.to_lowercase())))
        }
        (Value::AbsTime(a), Value::AbsTime(b)) => Ok(Some(a.secs.cmp(&b.secs))),
        (Value::RelTime(a), Value::RelTime(b)) => Ok(a.partial_cmp(b)),
        (Value::Boolean(a), Value::Boolean(b)) => Ok(Some(a.cmp(b))),
        _ => Err(type_error("comparison", l, r)),
    }
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> Value {
    if let Some(v) = strict(l, r) {
        return v;
    }
    if matches!(l, Value::Boolean(_))
        && matches!(r, Value::Boolean(_))
        && !matches!(op, BinaryOp::Eq | BinaryOp::Ne)
    {
        return type_error(op.symbol(), l, r);
    }
    let ord = match ordering(l, r) {
        Ok(ord) => ord,
        Err(e) => return e,
    };
    // NaN compares unequal to everything, itself included.
    let result = match (op, ord) {
        (BinaryOp::Ne, None) => true,
        (_, None) => false,
        (BinaryOp::Eq, Some(o)) => o == Ordering::Equal,
        (BinaryOp::Ne, Some(o)) => o != Ordering::Equal,
        (BinaryOp::Lt, Some(o)) => o == Ordering::Less,
        (BinaryOp::Le, Some(o)) => o != Ordering::Greater,
        (BinaryOp::Gt, Some(o)) => o == Ordering::Greater,
        (BinaryOp::Ge, Some(o)) => o != Ordering::Less,
        _ => false,
    };
    Value::Boolean(result)
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Value {
    if let Some(v) = strict(l, r) {
        return v;
    }
    match (l, r) {
        (Value::Integer(a), Value::Integer(b)) => {
            let (a, b) = (*a, *b);
            match op {
                BinaryOp::Add => Value::Integer(a.wrapping_add(b)),
                BinaryOp::Sub => Value::Integer(a.wrapping_sub(b)),
                BinaryOp::Mul => Value::Integer(a.wrapping_mul(b)),
                BinaryOp::Div if b == 0 => Value::error("integer division by zero"),
                BinaryOp::Div => Value::Integer(a.wrapping_div(b)),
                BinaryOp::Mod if b == 0 => Value::error("integer modulus by zero"),
                BinaryOp::Mod => Value::Integer(a.wrapping_rem(b)),
                _ => type_error(op.symbol(), l, r),
            }
        }
        (Value::Integer(_) | Value::Real(_), Value::Integer(_) | Value::Real(_)) => {
            let (a, b) = (l.as_f64().unwrap_or(f64::NAN), r.as_f64().unwrap_or(f64::NAN));
            match op {
                BinaryOp::Add => Value::Real(a + b),
                BinaryOp::Sub => Value::Real(a - b),
                BinaryOp::Mul => Value::Real(a * b),
                BinaryOp::Div if b == 0.0 => Value::error("division by zero"),
                BinaryOp::Div => Value::Real(a / b),
                BinaryOp::Mod if b == 0.0 => Value::error("modulus by zero"),
                BinaryOp::Mod => Value::Real(a % b),
                _ => type_error(op.symbol(), l, r),
            }
        }
        _ => time_arithmetic(op, l, r),
    }
}

fn shift_abs(t: &AbsTime, secs: f64) -> Value {
    Value::AbsTime(AbsTime {
        secs: t.secs.wrapping_add(secs.round() as i64),
        offset: t.offset,
    })
}

fn time_arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Value {
    match (op, l, r) {
        (BinaryOp::Add, Value::AbsTime(t), Value::RelTime(d))
        | (BinaryOp::Add, Value::RelTime(d), Value::AbsTime(t)) => shift_abs(t, *d),
        (BinaryOp::Sub, Value::AbsTime(t), Value::RelTime(d)) => shift_abs(t, -*d),
        (BinaryOp::Sub, Value::AbsTime(a), Value::AbsTime(b)) => {
            Value::RelTime(a.secs.wrapping_sub(b.secs) as f64)
        }
        (BinaryOp::Add, Value::RelTime(a), Value::RelTime(b)) => Value::RelTime(a + b),
        (BinaryOp::Sub, Value::RelTime(a), Value::RelTime(b)) => Value::RelTime(a - b),
        (BinaryOp::Mul, Value::RelTime(d), n) | (BinaryOp::Mul, n, Value::RelTime(d))
            if n.is_number() =>
        {
            Value::RelTime(d * n.as_f64().unwrap_or(f64::NAN))
        }
        (BinaryOp::Div, Value::RelTime(d), n) if n.is_number() => {
            match n.as_f64() {
                Some(x) if x != 0.0 => Value::RelTime(d / x),
                _ => Value::error("division by zero"),
            }
        }
        _ => type_error(op.symbol(), l, r),
    }
}

fn bitwise(op: BinaryOp, l: &Value, r: &Value) -> Value {
    if let Some(v) = strict(l, r) {
        return v;
    }
    match (op, l, r) {
        (BinaryOp::BitAnd, Value::Integer(a), Value::Integer(b)) => Value::Integer(a & b),
        (BinaryOp::BitOr, Value::Integer(a), Value::Integer(b)) => Value::Integer(a | b),
        (BinaryOp::BitXor, Value::Integer(a), Value::Integer(b)) => Value::Integer(a ^ b),
        (BinaryOp::BitAnd, Value::Boolean(a), Value::Boolean(b)) => Value::Boolean(*a & *b),
        (BinaryOp::BitOr, Value::Boolean(a), Value::Boolean(b)) => Value::Boolean(*a | *b),
        (BinaryOp::BitXor, Value::Boolean(a), Value::Boolean(b)) => Value::Boolean(*a ^ *b),
        _ => type_error(op.symbol(), l, r),
    }
}

fn shift(op: BinaryOp, l: &Value, r: &Value) -> Value {
    if let Some(v) = strict(l, r) {
        return v;
    }
    let (Value::Integer(a), Value::Integer(b)) = (l, r) else {
        return type_error(op.symbol(), l, r);
    };
    let amount = (*b & 63) as u32;
    match op {
        BinaryOp::Shl => Value::Integer(a.wrapping_shl(amount)),
        BinaryOp::Shr => Value::Integer(a.wrapping_shr(amount)),
        _ => Value::Integer(((*a as u64) >> amount) as i64),
    }
}
