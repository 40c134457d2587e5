//! Variable Interpolator - resolve `{{...}}` template blocks
//!
//! Templates appear in request URLs, bodies and header values. Each block
//! resolves against the operation's `RuleContext`:
//! - `{{@get:name}}` reads the current item's flow variables
//! - `{{@js:expr}}` evaluates through the injected JS runtime
//! - `{{keyword}}`, `{{page}}`, `{{pageIndex}}`, `{{host}}`, `{{url}}` are
//!   builtins
//! - any other `{{name}}` falls through to the source's global `vars`
//!
//! Unknown names render empty. `\{{` and `\}}` escape literal braces;
//! replacement runs right-to-left so scan indices stay valid.

use std::collections::HashMap;

use super::debug::{DebugScope, DebugStep, StepType};
use super::js::{JsContext, JsRuntime};
use super::value::RuleValue;
use crate::models::{Book, Chapter, Source};

/// Request-time state one module operation carries through interpolation
/// and rule evaluation.
pub struct RuleContext<'a> {
    pub source: &'a Source,
    pub book: Option<&'a Book>,
    pub chapter: Option<&'a Chapter>,
    pub keyword: Option<String>,
    pub page: Option<i64>,
    pub page_index: Option<i64>,
    pub base_url: Option<String>,
    /// Current page text/JSON or current list item
    pub result: Option<RuleValue>,
    /// Flow variables of the current item scope
    pub vars: HashMap<String, String>,
}

impl<'a> RuleContext<'a> {
    pub fn new(source: &'a Source) -> Self {
        Self {
            source,
            book: None,
            chapter: None,
            keyword: None,
            page: None,
            page_index: None,
            base_url: None,
            result: None,
            vars: HashMap::new(),
        }
    }

    fn builtin(&self, name: &str) -> Option<String> {
        match name {
            "keyword" => Some(self.keyword.clone().unwrap_or_default()),
            "page" => Some(self.page.map(|p| p.to_string()).unwrap_or_default()),
            "pageIndex" => Some(self.page_index.map(|p| p.to_string()).unwrap_or_default()),
            "host" => Some(self.source.host.clone()),
            "url" => Some(self.current_url().unwrap_or_default()),
            _ => None,
        }
    }

    /// The URL the operation is anchored on: the chapter's, else the
    /// book's, else the page being processed.
    pub fn current_url(&self) -> Option<String> {
        self.chapter
            .map(|c| c.url.clone())
            .or_else(|| self.book.map(|b| b.url.clone()))
            .or_else(|| self.base_url.clone())
    }

    fn source_var(&self, name: &str) -> Option<String> {
        self.source
            .vars
            .as_ref()
            .and_then(|vars| vars.get(name))
            .cloned()
    }

    pub fn js_context(&self) -> JsContext {
        JsContext {
            base_url: self.base_url.clone(),
            url: self.current_url(),
            host: Some(self.source.host.clone()),
            keyword: self.keyword.clone(),
            page: self.page,
            page_index: self.page_index,
            result: self.result.as_ref().map(|v| match v {
                RuleValue::Raw(raw) => raw.clone(),
                other => serde_json::Value::String(other.clone().into_scalar()),
            }),
            book: self
                .book
                .map(|b| serde_json::to_value(b).unwrap_or_default()),
            chapter: self
                .chapter
                .map(|c| serde_json::to_value(c).unwrap_or_default()),
            vars: self.vars.clone(),
        }
    }
}

struct Block {
    start: usize,
    end: usize,
    content: String,
}

/// Locate every balanced `{{...}}` block, honoring `\{{` / `\}}` escapes.
/// Inner `{{`/`}}` pairs only count toward nesting depth; they are never
/// evaluated recursively.
fn find_blocks(template: &str) -> Result<Vec<Block>, String> {
    let mut blocks = Vec::new();
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if template[i..].starts_with("\\{{") || template[i..].starts_with("\\}}") {
            i += 3;
            continue;
        }
        if template[i..].starts_with("{{") {
            let start = i;
            let mut depth = 1;
            let mut j = i + 2;
            let mut closed = None;
            while j < bytes.len() {
                if template[j..].starts_with("\\{{") || template[j..].starts_with("\\}}") {
                    j += 3;
                } else if template[j..].starts_with("{{") {
                    depth += 1;
                    j += 2;
                } else if template[j..].starts_with("}}") {
                    depth -= 1;
                    j += 2;
                    if depth == 0 {
                        closed = Some(j);
                        break;
                    }
                } else {
                    j += next_char_len(template, j);
                }
            }
            let Some(end) = closed else {
                return Err("Unclosed interpolation block".to_string());
            };
            blocks.push(Block {
                start,
                end,
                content: template[start + 2..end - 2].trim().to_string(),
            });
            i = end;
            continue;
        }
        i += next_char_len(template, i);
    }
    Ok(blocks)
}

fn next_char_len(s: &str, i: usize) -> usize {
    s[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1)
}

/// Syntax check used by the rule parser: every `{{` must close.
pub fn validate_template(template: &str) -> Result<(), String> {
    find_blocks(template).map(|_| ())
}

/// Render a template against the context. `@js:` failures render empty but
/// are logged and reported to the debug handle; everything else is
/// infallible by construction.
pub async fn render_template(
    template: &str,
    ctx: &RuleContext<'_>,
    js: Option<&dyn JsRuntime>,
    dbg: Option<&DebugScope>,
) -> Result<String, String> {
    if !template.contains("{{") && !template.contains("\\}}") {
        return Ok(template.to_string());
    }
    let blocks = find_blocks(template)?;
    let mut out = template.to_string();
    for block in blocks.iter().rev() {
        let value = resolve_block(&block.content, ctx, js, dbg).await;
        out.replace_range(block.start..block.end, &value);
    }
    Ok(out.replace("\\{{", "{{").replace("\\}}", "}}"))
}

async fn resolve_block(
    content: &str,
    ctx: &RuleContext<'_>,
    js: Option<&dyn JsRuntime>,
    dbg: Option<&DebugScope>,
) -> String {
    if let Some(name) = content.strip_prefix("@get:") {
        return ctx.vars.get(name.trim()).cloned().unwrap_or_default();
    }

    if let Some(code) = content.strip_prefix("@js:") {
        let Some(runtime) = js else {
            return String::new();
        };
        let js_ctx = ctx.js_context();
        return match runtime.eval_js_expr(code.trim(), &js_ctx, ctx.source).await {
            Ok(value) => value.into_scalar(),
            Err(e) => {
                tracing::warn!(
                    source_id = %ctx.source.id,
                    code = %code,
                    error = %e,
                    "js interpolation failed, rendering empty"
                );
                if let Some(dbg) = dbg {
                    dbg.step(
                        DebugStep::new(
                            StepType::Warn,
                            format!("js interpolation failed: {e}"),
                        )
                        .expr(format!("@js:{code}")),
                    );
                }
                String::new()
            }
        };
    }

    if let Some(value) = ctx.builtin(content) {
        return value;
    }
    ctx.source_var(content).unwrap_or_default()
}
