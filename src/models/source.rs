//! Book source model - the declarative description of one site
//!
//! A `Source` carries four module descriptors (search / discover / chapter /
//! content), each pairing a request template with parse rules in the rule
//! DSL. Sources travel as camelCase JSON; the import entry point accepts the
//! versioned interchange document, a bare source object, or a bare array.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::book::DiscoverCategory;

/// 书源模型
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: String,
    pub name: String,
    /// Absolute base URL of the site, e.g. `https://example.com`
    pub host: String,
    #[serde(rename = "type", default)]
    pub source_type: SourceType,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    /// Per-host request rate, e.g. `"1/s"` or `"2/500ms"`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<String>,
    /// JavaScript prelude injected into every `@js` evaluation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub js_lib: Option<String>,
    /// Immutable global variable table, readable as `{{name}}`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vars: Option<HashMap<String, String>>,
    /// Response charset hint (`gbk`, `gb18030`, ...); UTF-8 when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<SearchModule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discover: Option<DiscoverModule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chapter: Option<ChapterModule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<ContentModule>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    #[default]
    Novel,
    Comic,
}

/// One of the four executable modules of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Search,
    Discover,
    Chapter,
    Content,
}

impl ModuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Discover => "discover",
            Self::Chapter => "chapter",
            Self::Content => "content",
        }
    }
}

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request template of a module. `url` and `body` may contain `{{...}}`
/// interpolation blocks; `action` selects the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestConfig {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub action: BackendAction,
    /// Per-request timeout in milliseconds (default 15000)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charset: Option<String>,
}

impl RequestConfig {
    /// The implicit chapter-module request: load the book URL in the WebView.
    pub fn load_current_url() -> Self {
        Self {
            url: "{{url}}".to_string(),
            method: HttpMethod::Get,
            headers: None,
            body: None,
            action: BackendAction::LoadUrl,
            timeout: None,
            charset: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// `loadUrl` renders the page in a WebView (DOM rules available);
/// `fetch` pulls the raw body over HTTP (json/regex/js rules only).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendAction {
    #[default]
    LoadUrl,
    Fetch,
}

/// Search module descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchModule {
    pub request: RequestConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
    pub parse: BookListParse,
}

/// Discover module descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverModule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub categories: Categories,
    pub parse: BookListParse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
    /// Request template for category pages; defaults to a plain
    /// `loadUrl` of the category URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestConfig>,
}

/// Either a static category list or a rule that extracts categories from a
/// fetched page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Categories {
    Static(Vec<DiscoverCategory>),
    Dynamic(DynamicCategoryRule),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicCategoryRule {
    pub request: RequestConfig,
    pub list: String,
    pub name: String,
    pub url: String,
}

/// Chapter module descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterModule {
    /// Defaults to `{url: "{{url}}", action: "loadUrl"}`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestConfig>,
    pub parse: ChapterParse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
    /// Site lists newest-first; reverse into reading order before indexing
    #[serde(default)]
    pub reverse: bool,
}

/// Content module descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentModule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestConfig>,
    pub parse: ContentParse,
    /// Module-level purify rules, applied before `parse.purify`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purify: Option<Vec<String>>,
}

/// List + field rules shared by search and discover
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookListParse {
    pub list: String,
    pub fields: BookFields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookFields {
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
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterParse {
    pub list: String,
    pub fields: ChapterFields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterFields {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentParse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purify: Option<Vec<String>>,
}

/// Pagination config, tagged by shape: `nextUrl` follows a link rule,
/// `pageParam` counts through a numeric page variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Pagination {
    NextUrl(NextUrlPagination),
    PageParam(PageParamPagination),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextUrlPagination {
    pub next_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopCondition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageParamPagination {
    pub page_param: PageParam,
    #[serde(default)]
    pub strategy: PageStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopCondition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageParam {
    pub start: i64,
    pub step: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageStrategy {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopCondition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_result: Option<bool>,
}

impl StopCondition {
    pub const DEFAULT_MAX_PAGES: usize = 20;

    pub fn max_pages(&self) -> usize {
        self.max_pages.unwrap_or(Self::DEFAULT_MAX_PAGES)
    }

    pub fn stop_on_empty(&self) -> bool {
        self.empty_result.unwrap_or(false)
    }
}

/// Versioned interchange document for source collections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDocument {
    pub version: String,
    pub sources: Vec<serde_json::Value>,
    /// Epoch milliseconds
    pub last_updated_at: i64,
}

/// One rejected entry from an import
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportIssue {
    pub index: usize,
    pub reason: String,
    /// Whatever identifies the entry to the user: its name or id if present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
}

/// Result of importing a source document
#[derive(Debug, Default)]
pub struct ImportReport {
    pub sources: Vec<Source>,
    pub skipped: Vec<ImportIssue>,
}

/// Import sources from JSON. Accepts the versioned document, a bare source
/// object, or a bare array of sources. Entries missing `id`, `name`, `host`
/// or any of the three required modules are skipped and reported.
pub fn import_sources(json: &str) -> anyhow::Result<ImportReport> {
    let value: serde_json::Value = serde_json::from_str(json)?;

    let entries: Vec<serde_json::Value> = if let Some(obj) = value.as_object() {
        if obj.contains_key("sources") {
            let doc: SourceDocument = serde_json::from_value(value.clone())?;
            let updated = chrono::DateTime::from_timestamp_millis(doc.last_updated_at)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| doc.last_updated_at.to_string());
            tracing::info!(
                version = %doc.version,
                updated = %updated,
                count = doc.sources.len(),
                "importing source document"
            );
            doc.sources
        } else {
            vec![value]
        }
    } else if let Some(arr) = value.as_array() {
        arr.clone()
    } else {
        anyhow::bail!("source document must be an object or an array");
    };

    let mut report = ImportReport::default();
    for (index, entry) in entries.into_iter().enumerate() {
        match validate_entry(&entry) {
            Ok(()) => {
                let label = entry_label(&entry);
                match serde_json::from_value::<Source>(entry) {
                    Ok(source) => report.sources.push(source),
                    Err(e) => report.skipped.push(ImportIssue {
                        index,
                        reason: format!("malformed source: {e}"),
                        example: label,
                    }),
                }
            }
            Err(reason) => {
                report.skipped.push(ImportIssue {
                    index,
                    reason,
                    example: entry_label(&entry),
                });
            }
        }
    }
    Ok(report)
}

fn validate_entry(entry: &serde_json::Value) -> Result<(), String> {
    for key in ["id", "name", "host"] {
        let ok = entry
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        if !ok {
            return Err(format!("missing required field `{key}`"));
        }
    }
    for module in ["search", "chapter", "content"] {
        if entry.get(module).map(|v| v.is_null()).unwrap_or(true) {
            return Err(format!("missing required module `{module}`"));
        }
    }
    Ok(())
}

fn entry_label(entry: &serde_json::Value) -> Option<String> {
    entry
        .get("name")
        .or_else(|| entry.get("id"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_source_json(id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": "Test Source",
            "host": "https://example.com",
            "search": {
                "request": {"url": "https://example.com/s?q={{keyword}}", "action": "fetch"},
                "parse": {"list": "$.list", "fields": {"name": "$.title", "url": "$.url"}}
            },
            "chapter": {
                "parse": {"list": "ul.c li", "fields": {"name": "a@text", "url": "a@href"}}
            },
            "content": {
                "parse": {"content": "#content@html"}
            }
        })
    }

    #[test]
    fn test_source_deserialize() {
        let source: Source = serde_json::from_value(minimal_source_json("s1")).unwrap();
        assert_eq!(source.id, "s1");
        assert_eq!(source.source_type, SourceType::Novel);
        assert!(source.enabled);
        let search = source.search.unwrap();
        assert_eq!(search.request.action, BackendAction::Fetch);
        assert_eq!(search.request.method, HttpMethod::Get);
        let chapter = source.chapter.unwrap();
        assert!(chapter.request.is_none());
        assert!(!chapter.reverse);
    }

    #[test]
    fn test_pagination_untagged() {
        let next: Pagination =
            serde_json::from_str(r#"{"nextUrl": "a.next@href", "stop": {"maxPages": 3}}"#).unwrap();
        match next {
            Pagination::NextUrl(p) => {
                assert_eq!(p.next_url, "a.next@href");
                assert_eq!(p.stop.unwrap().max_pages(), 3);
            }
            _ => panic!("expected nextUrl pagination"),
        }

        let param: Pagination = serde_json::from_str(
            r#"{"pageParam": {"start": 1, "step": 1}, "strategy": "parallel", "maxConcurrent": 2}"#,
        )
        .unwrap();
        match param {
            Pagination::PageParam(p) => {
                assert_eq!(p.page_param.start, 1);
                assert_eq!(p.strategy, PageStrategy::Parallel);
                assert_eq!(p.max_concurrent, Some(2));
                assert_eq!(p.stop.unwrap_or_default().max_pages(), 20);
            }
            _ => panic!("expected pageParam pagination"),
        }
    }

    #[test]
    fn test_categories_untagged() {
        let cats: Categories = serde_json::from_str(
            r#"[{"name": "Fantasy", "url": "/cat/fantasy"}]"#,
        )
        .unwrap();
        assert!(matches!(cats, Categories::Static(ref v) if v.len() == 1));
    }

    #[test]
    fn test_import_versioned_document() {
        let doc = serde_json::json!({
            "version": "1",
            "lastUpdatedAt": 1700000000000i64,
            "sources": [
                minimal_source_json("ok"),
                {"id": "bad", "name": "No Host"}
            ]
        });
        let report = import_sources(&doc.to_string()).unwrap();
        assert_eq!(report.sources.len(), 1);
        assert_eq!(report.sources[0].id, "ok");
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].index, 1);
        assert!(report.skipped[0].reason.contains("host"));
        assert_eq!(report.skipped[0].example.as_deref(), Some("No Host"));
    }

    #[test]
    fn test_import_bare_forms() {
        let single = import_sources(&minimal_source_json("a").to_string()).unwrap();
        assert_eq!(single.sources.len(), 1);

        let arr = serde_json::json!([minimal_source_json("a"), minimal_source_json("b")]);
        let list = import_sources(&arr.to_string()).unwrap();
        assert_eq!(list.sources.len(), 2);
    }
}
