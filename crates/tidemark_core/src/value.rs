//! Values crossing the host/guest boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A value passed across the boundary
///
/// Pointer-shaped values are plain addresses here; their portable form only
/// exists on the trace wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// No value
    Void,
    /// Boolean
    Bool(bool),
    /// Unsigned 32-bit integer (also used for guest addresses)
    U32(u32),
    /// Signed 32-bit integer
    I32(i32),
    /// 32-bit float
    F32(f32),
    /// 64-bit float
    F64(f64),
    /// UTF-8 string
    String(String),
}

impl Value {
    /// Short name of the variant, for diagnostics
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Bool(_) => "bool",
            Self::U32(_) => "u32",
            Self::I32(_) => "i32",
            Self::F32(_) => "f32",
            Self::F64(_) => "f64",
            Self::String(_) => "string",
        }
    }

    /// Interpret the value as a guest address.
    ///
    /// Integers are reinterpreted as `u32`; a float is accepted only when it
    /// holds an exact address.
    #[must_use]
    pub fn as_address(&self) -> Option<u32> {
        match *self {
            Self::U32(v) => Some(v),
            Self::I32(v) => Some(v as u32),
            Self::F64(v) if v.fract() == 0.0 && (0.0..=f64::from(u32::MAX)).contains(&v) => {
                Some(v as u32)
            }
            _ => None,
        }
    }

    /// Numeric view of the value
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::U32(v) => Some(f64::from(v)),
            Self::I32(v) => Some(f64::from(v)),
            Self::F32(v) => Some(f64::from(v)),
            Self::F64(v) => Some(v),
            _ => None,
        }
    }

    /// Whether this is [`Value::Void`]
    #[must_use]
    pub const fn is_void(&self) -> bool {
        matches!(self, Self::Void)
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::Void
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => write!(f, "void"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}u32"),
            Self::I32(v) => write!(f, "{v}i32"),
            Self::F32(v) => write!(f, "{v}f32"),
            Self::F64(v) => write!(f, "{v}f64"),
            Self::String(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::U32(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// How a boundary crossing ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallOutcome {
    /// Normal return with a value (`Void` when there is none)
    Returned(Value),
    /// The callee threw; the message is diagnostic only and is not traced
    Threw(String),
}

impl CallOutcome {
    /// Whether the call threw
    #[must_use]
    pub const fn is_throw(&self) -> bool {
        matches!(self, Self::Threw(_))
    }

    /// The returned value, if the call returned
    #[must_use]
    pub const fn value(&self) -> Option<&Value> {
        match self {
            Self::Returned(v) => Some(v),
            Self::Threw(_) => None,
        }
    }
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Returned(v) => write!(f, "return {v}"),
            Self::Threw(msg) if msg.is_empty() => write!(f, "throw"),
            Self::Threw(msg) => write!(f, "throw ({msg})"),
        }
    }
}
