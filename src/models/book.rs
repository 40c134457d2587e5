//! Output domain records produced by the executor

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A book produced by search or discover.
///
/// `id` is the absolute book URL; it doubles as the dedup key across
/// pagination and as the flow-variable scope key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    pub id: String,
    pub source_id: String,
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intro: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_chapter: Option<String>,
    /// Flow variables captured for this book (`@put:{...}` results merged
    /// over the source globals).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vars: Option<HashMap<String, String>>,
}

/// One chapter of a book. `index` is assigned after full pagination and
/// optional reversal, `0..n-1` in reading order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub id: String,
    pub book_id: String,
    pub name: String,
    pub url: String,
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vars: Option<HashMap<String, String>>,
}

/// Extracted chapter content. Comics carry an ordered image-URL list,
/// novels a single text body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub body: ContentBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentBody {
    Text(String),
    Images(Vec<String>),
}

impl ContentBody {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(t) => t.trim().is_empty(),
            Self::Images(urls) => urls.is_empty(),
        }
    }
}

/// A discover category: either declared statically on the source or
/// extracted by a dynamic category rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverCategory {
    pub name: String,
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_body_untagged_serde() {
        let text: Content = serde_json::from_str(r#"{"body":"hello"}"#).unwrap();
        assert_eq!(text.body, ContentBody::Text("hello".into()));

        let comic: Content = serde_json::from_str(r#"{"body":["a.jpg","b.jpg"]}"#).unwrap();
        assert_eq!(
            comic.body,
            ContentBody::Images(vec!["a.jpg".into(), "b.jpg".into()])
        );
    }

    #[test]
    fn test_content_body_empty() {
        assert!(ContentBody::Text("  ".into()).is_empty());
        assert!(ContentBody::Images(vec![]).is_empty());
        assert!(!ContentBody::Text("x".into()).is_empty());
    }
}
