//! Rule value sum - the dynamically typed results of rule evaluation
//!
//! Interpolation and JS results are dynamically typed; selector contexts
//! want string lists and scalar fields want a single string. `RuleValue`
//! is the tagged union both backends normalize through.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum RuleValue {
    Str(String),
    List(Vec<String>),
    Number(f64),
    Bool(bool),
    Null,
    /// Anything structured that is not a flat string list, kept as JSON
    Raw(Value),
}

impl RuleValue {
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::String(s) => Self::Str(s),
            Value::Number(n) => Self::Number(n.as_f64().unwrap_or(0.0)),
            Value::Bool(b) => Self::Bool(b),
            Value::Null => Self::Null,
            Value::Array(arr) => {
                if arr.iter().all(|v| v.is_string()) {
                    Self::List(
                        arr.into_iter()
                            .map(|v| v.as_str().unwrap_or_default().to_string())
                            .collect(),
                    )
                } else {
                    Self::Raw(Value::Array(arr))
                }
            }
            other => Self::Raw(other),
        }
    }

    /// Normalize for a selector/list context: one string per element, empty
    /// strings dropped.
    pub fn into_list(self) -> Vec<String> {
        match self {
            Self::Str(s) => {
                if s.is_empty() {
                    vec![]
                } else {
                    vec![s]
                }
            }
            Self::List(items) => items.into_iter().filter(|s| !s.is_empty()).collect(),
            Self::Number(n) => vec![format_number(n)],
            Self::Bool(b) => vec![b.to_string()],
            Self::Null => vec![],
            Self::Raw(Value::Array(arr)) => arr
                .into_iter()
                .map(json_element_to_string)
                .filter(|s| !s.is_empty())
                .collect(),
            Self::Raw(other) => vec![other.to_string()],
        }
    }

    /// Normalize for a scalar field context: lists join with newlines,
    /// null renders empty.
    pub fn into_scalar(self) -> String {
        match self {
            Self::Str(s) => s,
            Self::List(items) => items.join("\n"),
            Self::Number(n) => format_number(n),
            Self::Bool(b) => b.to_string(),
            Self::Null => String::new(),
            Self::Raw(Value::Array(arr)) => arr
                .into_iter()
                .map(json_element_to_string)
                .collect::<Vec<_>>()
                .join("\n"),
            Self::Raw(other) => other.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Str(s) => s.is_empty(),
            Self::List(items) => items.iter().all(|s| s.is_empty()),
            Self::Null => true,
            Self::Raw(Value::Array(arr)) => arr.is_empty(),
            _ => false,
        }
    }
}

/// Scalars inside a matched JSON array stringify bare; structures keep
/// their JSON form so list items stay parseable downstream.
fn json_element_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Integral floats print without the trailing `.0` so page arithmetic
/// interpolates as `2`, not `2.0`.
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_string_array() {
        let v = RuleValue::from_json(serde_json::json!(["a", "b"]));
        assert_eq!(v, RuleValue::List(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn test_mixed_array_stays_raw() {
        let v = RuleValue::from_json(serde_json::json!([{"id": 7}, "x"]));
        assert!(matches!(v, RuleValue::Raw(_)));
        let list = v.into_list();
        assert_eq!(list[0], r#"{"id":7}"#);
        assert_eq!(list[1], "x");
    }

    #[test]
    fn test_scalar_join() {
        let v = RuleValue::List(vec!["a".into(), "b".into()]);
        assert_eq!(v.into_scalar(), "a\nb");
        assert_eq!(RuleValue::Null.into_scalar(), "");
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(RuleValue::Number(2.0).into_scalar(), "2");
        assert_eq!(RuleValue::Number(2.5).into_scalar(), "2.5");
    }

    #[test]
    fn test_is_empty() {
        assert!(RuleValue::Str(String::new()).is_empty());
        assert!(RuleValue::List(vec!["".into()]).is_empty());
        assert!(!RuleValue::List(vec!["x".into()]).is_empty());
    }
}
