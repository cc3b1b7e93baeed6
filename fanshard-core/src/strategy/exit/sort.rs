use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Comparable key extracted from a result element.
///
/// Values form a total order: numbers compare numerically whether they are
/// integers or floats (positive NaN above every other number, negative NaN
/// below), and values of
/// different kinds rank `Bool < number < Text`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SortValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SortValue {
    fn rank(&self) -> u8 {
        match self {
            SortValue::Bool(_) => 0,
            SortValue::Int(_) | SortValue::Float(_) => 1,
            SortValue::Text(_) => 2,
        }
    }

    /// Build a key from a JSON scalar; arrays, objects and null have none.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(SortValue::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(SortValue::Int(i)),
                None => n.as_f64().map(SortValue::Float),
            },
            serde_json::Value::String(s) => Some(SortValue::Text(s.clone())),
            _ => None,
        }
    }
}

// Exact comparison; `i as f64` rounds above 2^53.
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    if f.is_nan() {
        return if f.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    // 2^63 is exact in f64
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    let whole = f.trunc();
    if whole >= LIMIT {
        return Ordering::Less;
    }
    if whole < -LIMIT {
        return Ordering::Greater;
    }
    match i.cmp(&(whole as i64)) {
        Ordering::Equal => whole.total_cmp(&f),
        other => other,
    }
}

fn cmp_floats(a: f64, b: f64) -> Ordering {
    // -0.0 and 0.0 both equal the integer 0
    if a == b { Ordering::Equal } else { a.total_cmp(&b) }
}

impl Ord for SortValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use SortValue::*;
        match (self, other) {
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => cmp_floats(*a, *b),
            (Int(a), Float(b)) => cmp_int_float(*a, *b),
            (Float(a), Int(b)) => cmp_int_float(*b, *a).reverse(),
            (Text(a), Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for SortValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SortValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortValue {}

impl fmt::Display for SortValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortValue::Bool(v) => write!(f, "{}", v),
            SortValue::Int(v) => write!(f, "{}", v),
            SortValue::Float(v) => write!(f, "{}", v),
            SortValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for SortValue {
    fn from(value: bool) -> Self {
        SortValue::Bool(value)
    }
}

impl From<i32> for SortValue {
    fn from(value: i32) -> Self {
        SortValue::Int(value as i64)
    }
}

impl From<i64> for SortValue {
    fn from(value: i64) -> Self {
        SortValue::Int(value)
    }
}

impl From<u32> for SortValue {
    fn from(value: u32) -> Self {
        SortValue::Int(value as i64)
    }
}

impl From<f64> for SortValue {
    fn from(value: f64) -> Self {
        SortValue::Float(value)
    }
}

impl From<&str> for SortValue {
    fn from(value: &str) -> Self {
        SortValue::Text(value.to_string())
    }
}

impl From<String> for SortValue {
    fn from(value: String) -> Self {
        SortValue::Text(value)
    }
}
