//! Host-side scalar values accepted and produced by the evaluator.
//!
//! The bridge speaks exactly five scalar shapes: missing, boolean, integer,
//! float, and string. Narrower numeric types widen losslessly on the way in
//! (`i8`/`i16`/`i32` to [`Value::Int`], `f32` to [`Value::Float`]), so the
//! same record round-trips identically no matter which width produced it.

use std::fmt;

/// A single cell crossing the evaluator boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Missing value. PMML treats this as "no user input" for the field.
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// True only for a float cell holding NaN.
    #[must_use]
    pub fn is_nan(&self) -> bool {
        matches!(self, Self::Float(f) if f.is_nan())
    }

    /// Apply the NaN-as-missing rule: with `nan_as_missing` set, a NaN float
    /// becomes [`Value::Null`] before anything crosses the bridge.
    #[must_use]
    pub fn canonicalize(self, nan_as_missing: bool) -> Self {
        if nan_as_missing && self.is_nan() {
            Self::Null
        } else {
            self
        }
    }

    /// Short type label used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
        }
    }

    /// Parse one CSV cell. Empty text is missing; integers are tried before
    /// floats so `"5"` stays integral; `"true"`/`"false"` (any case) parse as
    /// booleans; everything else stays a string.
    #[must_use]
    pub fn parse_csv(text: &str) -> Self {
        if text.is_empty() {
            return Self::Null;
        }
        if let Ok(i) = text.parse::<i64>() {
            return Self::Int(i);
        }
        if let Ok(f) = text.parse::<f64>() {
            return Self::Float(f);
        }
        if text.eq_ignore_ascii_case("true") {
            return Self::Bool(true);
        }
        if text.eq_ignore_ascii_case("false") {
            return Self::Bool(false);
        }
        Self::String(text.to_string())
    }

    /// Numeric view of this cell, widening integers.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// CSV rendering: missing cells print as empty text.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
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

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}
