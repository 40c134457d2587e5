//! Rule AST - typed form of a parsed rule expression
//!
//! Three node kinds: a `Selector` (css/xpath/json/regex body plus attribute,
//! slice and suffix metadata), a `Js` snippet, and a `Composite` combining
//! siblings with one operator. The tree serializes to camelCase JSON so the
//! WebView extraction script can interpret the same shape in-page.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::{ReaderError, ReaderResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum RuleNode {
    #[serde(rename = "selector")]
    Selector(Selector),
    #[serde(rename = "js")]
    Js(JsRule),
    #[serde(rename = "composite")]
    Composite(Composite),
}

impl RuleNode {
    pub fn as_selector(&self) -> Option<&Selector> {
        match self {
            Self::Selector(s) => Some(s),
            _ => None,
        }
    }

    /// Suffix metadata (`##...` / `@put:{...}`) if this node carries any.
    /// Only selectors can.
    pub fn has_suffix(&self) -> bool {
        match self {
            Self::Selector(s) => s.regex_replace.is_some() || !s.put_vars.is_empty(),
            _ => false,
        }
    }

    /// Whether evaluating this node needs a live DOM (css/xpath selectors,
    /// DOM-touching js).
    pub fn requires_dom(&self) -> bool {
        match self {
            Self::Selector(s) => {
                matches!(s.selector_type, SelectorType::Css | SelectorType::XPath)
            }
            Self::Js(js) => js.requires_dom,
            Self::Composite(c) => c.children.iter().any(|n| n.requires_dom()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    pub selector_type: SelectorType,
    pub expr: String,
    /// Normalized attribute: `text`, `html`, `outerHtml`, or a verbatim
    /// attribute name such as `href`
    pub attr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slice: Option<SliceRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex_replace: Option<RegexReplace>,
    /// `@put:{name:rule}` side-effects; the values are unparsed rule
    /// expressions evaluated in the item's context. BTreeMap keeps the
    /// serialized script stable.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub put_vars: BTreeMap<String, String>,
}

impl Selector {
    pub fn new(selector_type: SelectorType, expr: impl Into<String>) -> Self {
        Self {
            selector_type,
            expr: expr.into(),
            attr: "text".to_string(),
            slice: None,
            regex_replace: None,
            put_vars: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorType {
    Css,
    XPath,
    Json,
    Regex,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JsRule {
    /// Code without the `@js:` prefix
    pub code: String,
    pub requires_dom: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Composite {
    pub operator: CompositeOp,
    pub children: Vec<RuleNode>,
}

/// `||` first non-empty, `&&` concatenation, `%%` interleave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompositeOp {
    #[serde(rename = "||")]
    Or,
    #[serde(rename = "&&")]
    And,
    #[serde(rename = "%%")]
    Zip,
}

impl CompositeOp {
    pub fn token(&self) -> &'static str {
        match self {
            Self::Or => "||",
            Self::And => "&&",
            Self::Zip => "%%",
        }
    }
}

/// Python-style slice suffix. `index == true` means the suffix was a single
/// integer (`[2]`, `[-1]`): pick that one element rather than a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceRange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub index: bool,
}

impl SliceRange {
    pub fn index(i: i64) -> Self {
        Self {
            start: Some(i),
            end: None,
            step: None,
            index: true,
        }
    }

    pub fn range(start: Option<i64>, end: Option<i64>, step: Option<i64>) -> Self {
        Self {
            start,
            end,
            step,
            index: false,
        }
    }

    /// Apply with Python semantics: negative indices count from the end,
    /// `end` exclusive, negative `step` walks backwards defaulting to the
    /// full reversed range.
    pub fn apply<T: Clone>(&self, items: &[T]) -> Vec<T> {
        let len = items.len() as i64;
        if self.index {
            let mut i = self.start.unwrap_or(0);
            if i < 0 {
                i += len;
            }
            if (0..len).contains(&i) {
                return vec![items[i as usize].clone()];
            }
            return vec![];
        }

        let step = self.step.unwrap_or(1);
        debug_assert!(step != 0, "slice step of zero is rejected at parse time");
        let mut out = Vec::new();
        if step > 0 {
            let mut start = self.start.unwrap_or(0);
            if start < 0 {
                start += len;
            }
            let mut end = self.end.unwrap_or(len);
            if end < 0 {
                end += len;
            }
            let mut i = start.clamp(0, len);
            let end = end.clamp(0, len);
            while i < end {
                out.push(items[i as usize].clone());
                i += step;
            }
        } else if step < 0 {
            let mut start = match self.start {
                Some(s) if s < 0 => s + len,
                Some(s) => s,
                None => len - 1,
            };
            start = start.min(len - 1);
            // -1 is the sentinel meaning "walk through index 0"
            let end = match self.end {
                Some(e) if e < 0 => (e + len).max(-1),
                Some(e) => e,
                None => -1,
            };
            let mut i = start;
            while i > end && i >= 0 {
                out.push(items[i as usize].clone());
                i += step;
            }
        }
        out
    }
}

/// `##pattern##replacement##1` suffix. Applied with the `regex` crate on the
/// host and as a JavaScript `RegExp` inside the WebView.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegexReplace {
    pub pattern: String,
    pub replacement: String,
    pub first_only: bool,
}

impl RegexReplace {
    pub fn apply(&self, input: &str) -> ReaderResult<String> {
        let re = regex::Regex::new(&self.pattern).map_err(|e| {
            ReaderError::parse(
                format!("invalid regex-replace pattern: {e}"),
                format!("##{}##{}", self.pattern, self.replacement),
            )
        })?;
        let out = if self.first_only {
            re.replace(input, self.replacement.as_str())
        } else {
            re.replace_all(input, self.replacement.as_str())
        };
        Ok(out.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items() -> Vec<&'static str> {
        vec!["a", "b", "c", "d", "e"]
    }

    #[test]
    fn test_slice_negative_start() {
        let s = SliceRange::range(Some(-2), None, None);
        assert_eq!(s.apply(&items()), vec!["d", "e"]);
    }

    #[test]
    fn test_slice_reverse() {
        let s = SliceRange::range(None, None, Some(-1));
        assert_eq!(s.apply(&items()), vec!["e", "d", "c", "b", "a"]);
    }

    #[test]
    fn test_slice_start_end() {
        let s = SliceRange::range(Some(1), Some(3), None);
        assert_eq!(s.apply(&items()), vec!["b", "c"]);
    }

    #[test]
    fn test_slice_step_two() {
        let s = SliceRange::range(None, None, Some(2));
        assert_eq!(s.apply(&items()), vec!["a", "c", "e"]);
    }

    #[test]
    fn test_slice_single_index() {
        assert_eq!(SliceRange::index(-1).apply(&items()), vec!["e"]);
        assert_eq!(SliceRange::index(0).apply(&items()), vec!["a"]);
        assert!(SliceRange::index(9).apply(&items()).is_empty());
    }

    #[test]
    fn test_slice_negative_step_bounds() {
        let s = SliceRange::range(Some(3), Some(0), Some(-1));
        assert_eq!(s.apply(&items()), vec!["d", "c", "b"]);
        let full = SliceRange::range(None, Some(-7), Some(-1));
        assert_eq!(full.apply(&items()), vec!["e", "d", "c", "b", "a"]);
    }

    #[test]
    fn test_slice_out_of_range_is_empty() {
        let s = SliceRange::range(Some(9), None, None);
        assert!(s.apply(&items()).is_empty());
        assert!(SliceRange::range(None, None, Some(1)).apply(&Vec::<String>::new()).is_empty());
    }

    #[test]
    fn test_regex_replace() {
        let rr = RegexReplace {
            pattern: "(foo)".into(),
            replacement: "bar".into(),
            first_only: false,
        };
        assert_eq!(rr.apply("foo foo").unwrap(), "bar bar");

        let first = RegexReplace {
            pattern: "foo".into(),
            replacement: "bar".into(),
            first_only: true,
        };
        assert_eq!(first.apply("foo foo").unwrap(), "bar foo");
    }

    #[test]
    fn test_node_serialize_shape() {
        let node = RuleNode::Selector(Selector {
            slice: Some(SliceRange::index(0)),
            ..Selector::new(SelectorType::Css, "div.title")
        });
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["kind"], "selector");
        assert_eq!(json["selectorType"], "css");
        assert_eq!(json["attr"], "text");
        assert_eq!(json["slice"]["index"], true);
    }

    #[test]
    fn test_requires_dom() {
        let css = RuleNode::Selector(Selector::new(SelectorType::Css, "a"));
        let json = RuleNode::Selector(Selector::new(SelectorType::Json, "$.a"));
        assert!(css.requires_dom());
        assert!(!json.requires_dom());
        let composite = RuleNode::Composite(Composite {
            operator: CompositeOp::Or,
            children: vec![json, css],
        });
        assert!(composite.requires_dom());
    }
}
