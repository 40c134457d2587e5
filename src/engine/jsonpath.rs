//! JSONPath queries for the fetch backend
//!
//! Path evaluation is delegated to `jsonpath-rust`. The supported subset a
//! source can rely on: `$`, `$.field`, `$..field`, `$[N]`, `$[*].field`,
//! chained `.key` segments, and filters/slices the engine itself accepts.
//! A trailing `[start:end:step]` written after the path is split off by the
//! rule parser and applied Python-style to the match list, so negative
//! steps work uniformly with CSS slices.

use jsonpath_rust::JsonPath;
use serde_json::Value;

/// All matches for `path` over `json`, in document order.
pub fn query(json: &Value, path: &str) -> anyhow::Result<Vec<Value>> {
    let compiled = JsonPath::try_from(path)
        .map_err(|e| anyhow::anyhow!("invalid JSONPath `{path}`: {e}"))?;
    let found = compiled.find(json);
    Ok(match found {
        Value::Array(matches) => matches,
        Value::Null => vec![],
        other => vec![other],
    })
}

/// List-context matches: a path that selects one array (`$.data.list`)
/// yields that array's elements, so list rules iterate items rather than
/// a single blob.
pub fn query_list(json: &Value, path: &str) -> anyhow::Result<Vec<Value>> {
    let matches = query(json, path)?;
    if matches.len() == 1 {
        if let Value::Array(inner) = &matches[0] {
            return Ok(inner.clone());
        }
    }
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        serde_json::json!({
            "data": {
                "list": [
                    {"id": 1, "title": "A"},
                    {"id": 2, "title": "B"},
                    {"id": 3, "title": "C"}
                ]
            },
            "name": "root"
        })
    }

    #[test]
    fn test_scalar_field() {
        let matches = query(&sample(), "$.name").unwrap();
        assert_eq!(matches, vec![Value::String("root".into())]);
    }

    #[test]
    fn test_wildcard_field() {
        let matches = query(&sample(), "$.data.list[*].title").unwrap();
        assert_eq!(
            matches,
            vec![
                Value::String("A".into()),
                Value::String("B".into()),
                Value::String("C".into())
            ]
        );
    }

    #[test]
    fn test_list_flattening() {
        let items = query_list(&sample(), "$.data.list").unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0]["title"], "A");
    }

    #[test]
    fn test_recursive_descent() {
        let matches = query(&sample(), "$..title").unwrap();
        assert_eq!(matches.len(), 3);
    }

    #[test]
    fn test_invalid_path() {
        assert!(query(&sample(), "$[").is_err());
    }

    #[test]
    fn test_no_match_is_empty() {
        assert!(query(&sample(), "$.missing.deep").unwrap().is_empty());
    }
}
