//! Comparison of replayed values with the values a live guest produced.
//!
//! Comparison is best-effort: integers compare by bit pattern regardless of
//! signedness, floats within a tolerance, and NaN equals NaN. Allocation
//! boundary values carry recording-time addresses and are never compared.

use crate::config::CompareOptions;
use serde::{Deserialize, Serialize};
use std::fmt;
use tidemark_core::Value;
use tidemark_trace::ValueKind;

/// One value that did not match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueMismatch {
    /// Argument position, or `None` for a return value or arity difference
    pub index: Option<usize>,
    /// Value from the trace
    pub expected: String,
    /// Value from the guest
    pub actual: String,
}

impl fmt::Display for ValueMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(f, "argument {i}: expected {}, got {}", self.expected, self.actual),
            None => write!(f, "expected {}, got {}", self.expected, self.actual),
        }
    }
}

/// Whether two values are equivalent under `opts`
#[must_use]
pub fn values_match(expected: &Value, actual: &Value, opts: &CompareOptions) -> bool {
    match (expected, actual) {
        (Value::F32(a), Value::F32(b)) => floats_match(f64::from(*a), f64::from(*b), opts),
        (Value::F64(a), Value::F64(b)) => floats_match(*a, *b, opts),
        (Value::F32(a), Value::F64(b)) | (Value::F64(b), Value::F32(a)) => {
            floats_match(f64::from(*a), *b, opts)
        }
        (Value::U32(_) | Value::I32(_), Value::U32(_) | Value::I32(_)) => {
            expected.as_address() == actual.as_address()
        }
        _ => expected == actual,
    }
}

fn floats_match(a: f64, b: f64, opts: &CompareOptions) -> bool {
    if a.is_nan() || b.is_nan() {
        return a.is_nan() && b.is_nan();
    }
    a == b || (a - b).abs() <= opts.float_tolerance
}

/// Whether values of `kind` are comparable across sessions
#[must_use]
pub const fn comparable(kind: ValueKind) -> bool {
    !kind.is_alloc_boundary()
}

/// Compare argument lists, reporting every difference
#[must_use]
pub fn compare_args(
    expected: &[Value],
    actual: &[Value],
    kinds: &[ValueKind],
    opts: &CompareOptions,
) -> Vec<ValueMismatch> {
    if expected.len() != actual.len() {
        return vec![ValueMismatch {
            index: None,
            expected: format!("{} arguments", expected.len()),
            actual: format!("{} arguments", actual.len()),
        }];
    }
    expected
        .iter()
        .zip(actual)
        .enumerate()
        .filter(|(i, _)| kinds.get(*i).is_none_or(|k| comparable(*k)))
        .filter(|(_, (e, a))| !values_match(e, a, opts))
        .map(|(i, (e, a))| ValueMismatch {
            index: Some(i),
            expected: e.to_string(),
            actual: a.to_string(),
        })
        .collect()
}

/// Render a mismatch list as one line
#[must_use]
pub fn describe(mismatches: &[ValueMismatch]) -> String {
    mismatches
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
