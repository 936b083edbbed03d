//! Scalar values shared by namelists and diag tables.

use serde::{Deserialize, Serialize};

/// A single namelist / diag-table scalar.
///
/// Deserializes untagged, so `true`, `5`, `5.5` and `"abc"` in JSON map to
/// `Bool`, `Int`, `Float` and `Str` respectively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NamelistValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl NamelistValue {
    /// Render as a Fortran namelist literal.
    pub fn to_fortran(&self) -> String {
        match self {
            NamelistValue::Bool(true) => ".true.".to_string(),
            NamelistValue::Bool(false) => ".false.".to_string(),
            NamelistValue::Int(i) => i.to_string(),
            // Debug keeps the decimal point on whole numbers (`1.0`, `1e-5`).
            NamelistValue::Float(f) => format!("{:?}", f),
            NamelistValue::Str(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            NamelistValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            NamelistValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            NamelistValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl std::fmt::Display for NamelistValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NamelistValue::Bool(b) => write!(f, "{}", b),
            NamelistValue::Int(i) => write!(f, "{}", i),
            NamelistValue::Float(x) => write!(f, "{}", x),
            NamelistValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for NamelistValue {
    fn from(v: bool) -> Self {
        NamelistValue::Bool(v)
    }
}

impl From<i64> for NamelistValue {
    fn from(v: i64) -> Self {
        NamelistValue::Int(v)
    }
}

impl From<i32> for NamelistValue {
    fn from(v: i32) -> Self {
        NamelistValue::Int(v as i64)
    }
}

impl From<f64> for NamelistValue {
    fn from(v: f64) -> Self {
        NamelistValue::Float(v)
    }
}

impl From<&str> for NamelistValue {
    fn from(v: &str) -> Self {
        NamelistValue::Str(v.to_string())
    }
}

impl From<String> for NamelistValue {
    fn from(v: String) -> Self {
        NamelistValue::Str(v)
    }
}

/// Coerce one diag-table token into a typed value.
///
/// Rules are applied in order:
/// 1. a double-quoted token is a string with the quotes stripped
/// 2. an integer, if it survives a round trip through `f64`
/// 3. a finite float
/// 4. `.true.` / `.false.` (case-insensitive)
/// 5. anything else is returned unchanged as a string
pub fn coerce_token(raw: &str) -> NamelistValue {
    let x = raw.trim();
    if x.starts_with('"') {
        return NamelistValue::Str(x.trim_matches('"').to_string());
    }
    if let Ok(i) = x.parse::<i64>() {
        if (i as f64) as i64 == i {
            return NamelistValue::Int(i);
        }
    }
    if let Ok(f) = x.parse::<f64>() {
        if f.is_finite() {
            return NamelistValue::Float(f);
        }
    }
    match x.to_ascii_lowercase().as_str() {
        ".true." => NamelistValue::Bool(true),
        ".false." => NamelistValue::Bool(false),
        _ => NamelistValue::Str(x.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_token_rules() {
        assert_eq!(coerce_token("5"), NamelistValue::Int(5));
        assert_eq!(coerce_token(" 5.5 "), NamelistValue::Float(5.5));
        assert_eq!(coerce_token("\"abc\""), NamelistValue::Str("abc".into()));
        assert_eq!(coerce_token(".true."), NamelistValue::Bool(true));
        assert_eq!(coerce_token(".FALSE."), NamelistValue::Bool(false));
        assert_eq!(coerce_token("all"), NamelistValue::Str("all".into()));
        assert_eq!(coerce_token(""), NamelistValue::Str(String::new()));
    }

    #[test]
    fn test_quoted_number_stays_string() {
        assert_eq!(coerce_token("\"12\""), NamelistValue::Str("12".into()));
    }

    #[test]
    fn test_non_finite_words_are_not_floats() {
        assert_eq!(coerce_token("nan"), NamelistValue::Str("nan".into()));
        assert_eq!(coerce_token("inf"), NamelistValue::Str("inf".into()));
    }

    #[test]
    fn test_to_fortran_literals() {
        assert_eq!(NamelistValue::Bool(true).to_fortran(), ".true.");
        assert_eq!(NamelistValue::Int(-3).to_fortran(), "-3");
        assert_eq!(NamelistValue::Float(1.0).to_fortran(), "1.0");
        assert_eq!(NamelistValue::Str("it's".into()).to_fortran(), "'it''s'");
    }

    #[test]
    fn test_untagged_json() {
        let v: Vec<NamelistValue> = serde_json::from_str(r#"[true, 5, 5.5, "abc"]"#).unwrap();
        assert_eq!(
            v,
            vec![
                NamelistValue::Bool(true),
                NamelistValue::Int(5),
                NamelistValue::Float(5.5),
                NamelistValue::Str("abc".into()),
            ]
        );
    }
}
