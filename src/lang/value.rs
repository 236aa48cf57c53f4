use crate::lang::heap::ObjRef;

/// Runtime value in the Rat language.
///
/// Values are `Copy`; only [`Value::Object`] refers to shared heap data, and
/// its lifetime is governed by the heap's reference count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    None,

    /// Single-precision number. Integral values are plain numbers whose
    /// fractional part is zero.
    Number(f32),

    Bool(bool),

    /// String, runnable, or native.
    Object(ObjRef),
}

impl Value {
    pub fn as_object(self) -> Option<ObjRef> {
        match self {
            Value::Object(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_number(self) -> Option<f32> {
        match self {
            Value::Number(n) => Some(n),
            _ => None,
        }
    }

    /// The number as an `i32` when it has no fractional part.
    pub fn as_integral(self) -> Option<i32> {
        match self {
            // `i32::MAX as f32` rounds up to 2^31, so the upper bound is exclusive.
            Value::Number(n) if n == n.trunc() && (-2147483648.0..2147483648.0).contains(&n) => {
                Some(n as i32)
            }
            _ => None,
        }
    }
}

/// Display form of a number: integral values print without a fraction.
pub fn format_number(n: f32) -> String {
    format!("{}", n)
}
