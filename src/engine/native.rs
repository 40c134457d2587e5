//! Native AST Evaluator - rule evaluation without a DOM
//!
//! For `action: fetch` the page is raw text; json, regex and `@js:` rules
//! evaluate in-process with the same composite and slice semantics the
//! WebView interpreter applies in-page. CSS/XPath rules have nothing to
//! select against here and fail as source errors.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use super::ast::{CompositeOp, RuleNode, Selector, SelectorType};
use super::jsonpath;
use super::js::JsRuntime;
use super::template::RuleContext;
use super::value::RuleValue;
use crate::error::{ErrorContext, ReaderError, ReaderResult};
use crate::models::Source;

pub struct NativeEvaluator<'a> {
    pub source: &'a Source,
    pub js: Option<&'a dyn JsRuntime>,
}

impl<'a> NativeEvaluator<'a> {
    pub fn new(source: &'a Source, js: Option<&'a dyn JsRuntime>) -> Self {
        Self { source, js }
    }

    /// Evaluate in list context: one string per element. Structured JSON
    /// elements keep their JSON form so item-level rules can parse them.
    pub fn eval_list<'r>(
        &'r self,
        node: &'r RuleNode,
        ctx: &'r RuleContext<'r>,
    ) -> BoxFuture<'r, ReaderResult<Vec<String>>> {
        async move {
            match node {
                RuleNode::Js(js) => Ok(self.eval_js(&js.code, ctx).await?.into_list()),
                RuleNode::Selector(sel) => self.eval_selector(sel, ctx),
                RuleNode::Composite(c) => {
                    self.eval_composite(c.operator, &c.children, ctx).await
                }
            }
        }
        .boxed()
    }

    /// Evaluate in scalar field context: list results join with newlines,
    /// then any regex-replace suffix applies.
    pub fn eval_field<'r>(
        &'r self,
        node: &'r RuleNode,
        ctx: &'r RuleContext<'r>,
    ) -> BoxFuture<'r, ReaderResult<String>> {
        async move {
            let joined = self.eval_list(node, ctx).await?.join("\n");
            if let Some(rr) = node.as_selector().and_then(|s| s.regex_replace.as_ref()) {
                return rr.apply(&joined);
            }
            Ok(joined)
        }
        .boxed()
    }

    async fn eval_js(&self, code: &str, ctx: &RuleContext<'_>) -> ReaderResult<RuleValue> {
        let Some(runtime) = self.js else {
            return Err(ReaderError::Source {
                message: "@js rule requires a JS runtime".to_string(),
                context: ErrorContext::default(),
                cause: None,
            });
        };
        runtime
            .eval_js_expr(code, &ctx.js_context(), self.source)
            .await
            .map_err(|e| ReaderError::Source {
                message: format!("js evaluation failed: {e}"),
                context: ErrorContext::default(),
                cause: Some(e),
            })
    }

    fn eval_selector(&self, sel: &Selector, ctx: &RuleContext<'_>) -> ReaderResult<Vec<String>> {
        match sel.selector_type {
            SelectorType::Json => self.eval_json(sel, ctx),
            SelectorType::Regex => self.eval_regex(sel, ctx),
            SelectorType::Css | SelectorType::XPath => Err(ReaderError::Source {
                message: format!(
                    "{:?} rules need the loadUrl backend, this module fetches raw text",
                    sel.selector_type
                ),
                context: ErrorContext::default(),
                cause: None,
            }),
        }
    }

    fn eval_json(&self, sel: &Selector, ctx: &RuleContext<'_>) -> ReaderResult<Vec<String>> {
        let json = current_json(ctx)?;
        let mut matches =
            jsonpath::query_list(&json, &sel.expr).map_err(|e| ReaderError::Source {
                message: e.to_string(),
                context: ErrorContext::default(),
                cause: Some(e),
            })?;
        if let Some(slice) = &sel.slice {
            matches = slice.apply(&matches);
        }
        Ok(RuleValue::Raw(Value::Array(matches)).into_list())
    }

    fn eval_regex(&self, sel: &Selector, ctx: &RuleContext<'_>) -> ReaderResult<Vec<String>> {
        let re = regex::Regex::new(&sel.expr).map_err(|e| {
            ReaderError::parse(format!("invalid regex rule: {e}"), sel.expr.clone())
        })?;
        let text = current_text(ctx);
        // capture group 1 when the pattern defines one, whole match otherwise
        let mut matches: Vec<String> = if re.captures_len() > 1 {
            re.captures_iter(&text)
                .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
                .collect()
        } else {
            re.find_iter(&text).map(|m| m.as_str().to_string()).collect()
        };
        if let Some(slice) = &sel.slice {
            matches = slice.apply(&matches);
        }
        Ok(matches.into_iter().filter(|s| !s.is_empty()).collect())
    }

    async fn eval_composite(
        &self,
        operator: CompositeOp,
        children: &[RuleNode],
        ctx: &RuleContext<'_>,
    ) -> ReaderResult<Vec<String>> {
        match operator {
            CompositeOp::Or => {
                let last = children.len() - 1;
                for (i, child) in children.iter().enumerate() {
                    match self.eval_list(child, ctx).await {
                        Ok(values) if !values.is_empty() => return Ok(values),
                        Ok(_) => {}
                        Err(e) if i == last => return Err(e),
                        Err(e) => {
                            tracing::debug!(error = %e, "composite || child failed, trying next");
                        }
                    }
                }
                Ok(vec![])
            }
            CompositeOp::And => {
                let mut out = Vec::new();
                for child in children {
                    out.extend(self.eval_list(child, ctx).await?);
                }
                Ok(out)
            }
            CompositeOp::Zip => {
                let mut parts = Vec::with_capacity(children.len());
                for child in children {
                    parts.push(self.eval_list(child, ctx).await?);
                }
                let longest = parts.iter().map(Vec::len).max().unwrap_or(0);
                let mut out = Vec::new();
                for i in 0..longest {
                    for part in &parts {
                        if let Some(v) = part.get(i) {
                            out.push(v.clone());
                        }
                    }
                }
                Ok(out)
            }
        }
    }
}

fn current_text(ctx: &RuleContext<'_>) -> String {
    ctx.result.clone().map(RuleValue::into_scalar).unwrap_or_default()
}

fn current_json(ctx: &RuleContext<'_>) -> ReaderResult<Value> {
    if let Some(RuleValue::Raw(value)) = &ctx.result {
        return Ok(value.clone());
    }
    let text = current_text(ctx);
    serde_json::from_str(&text).map_err(|e| ReaderError::Source {
        message: format!("result is not valid JSON: {e}"),
        context: ErrorContext::default(),
        cause: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::js::testing::ScriptedJsRuntime;
    use crate::engine::parser::{parse_list_rule, parse_rule};

    fn test_source() -> Source {
        serde_json::from_value(serde_json::json!({
            "id": "s1",
            "name": "Test",
            "host": "https://api"
        }))
        .unwrap()
    }

    fn ctx_with<'a>(source: &'a Source, body: &str) -> RuleContext<'a> {
        let mut ctx = RuleContext::new(source);
        ctx.result = Some(RuleValue::Str(body.to_string()));
        ctx
    }

    #[tokio::test]
    async fn test_json_list_and_fields() {
        let source = test_source();
        let body = r#"{"data":{"list":[{"id":7,"title":"Foo"},{"id":8,"title":"Bar"}]}}"#;
        let ctx = ctx_with(&source, body);
        let evaluator = NativeEvaluator::new(&source, None);

        let list = parse_list_rule("$.data.list").unwrap();
        let items = evaluator.eval_list(&list, &ctx).await.unwrap();
        assert_eq!(items.len(), 2);

        // field rule over one item
        let item_ctx = ctx_with(&source, &items[0]);
        let title = parse_rule("$.title").unwrap();
        assert_eq!(
            evaluator.eval_field(&title, &item_ctx).await.unwrap(),
            "Foo"
        );
    }

    #[tokio::test]
    async fn test_json_trailing_slice() {
        let source = test_source();
        let ctx = ctx_with(&source, r#"{"tags":["a","b","c","d"]}"#);
        let evaluator = NativeEvaluator::new(&source, None);
        let rule = parse_list_rule("$.tags[1:3]").unwrap();
        assert_eq!(
            evaluator.eval_list(&rule, &ctx).await.unwrap(),
            vec!["b", "c"]
        );
    }

    #[tokio::test]
    async fn test_regex_capture_group() {
        let source = test_source();
        let ctx = ctx_with(&source, "<title>Book One</title><title>Two</title>");
        let evaluator = NativeEvaluator::new(&source, None);
        let rule = parse_rule("@regex:<title>(.*?)</title>").unwrap();
        assert_eq!(
            evaluator.eval_list(&rule, &ctx).await.unwrap(),
            vec!["Book One", "Two"]
        );
        assert_eq!(
            evaluator.eval_field(&rule, &ctx).await.unwrap(),
            "Book One\nTwo"
        );
    }

    #[tokio::test]
    async fn test_regex_whole_match_without_group() {
        let source = test_source();
        let ctx = ctx_with(&source, "ch1 ch2 ch3");
        let evaluator = NativeEvaluator::new(&source, None);
        let rule = parse_rule(r"@regex:ch\d").unwrap();
        assert_eq!(
            evaluator.eval_list(&rule, &ctx).await.unwrap(),
            vec!["ch1", "ch2", "ch3"]
        );
    }

    #[tokio::test]
    async fn test_js_rule_through_runtime() {
        let source = test_source();
        let ctx = ctx_with(&source, "ignored");
        let js = ScriptedJsRuntime::new().respond(
            "JSON.parse(result).data.list",
            RuleValue::List(vec!["one".into(), "two".into()]),
        );
        let evaluator = NativeEvaluator::new(&source, Some(&js));
        let rule = parse_list_rule("@js:JSON.parse(result).data.list").unwrap();
        assert_eq!(
            evaluator.eval_list(&rule, &ctx).await.unwrap(),
            vec!["one", "two"]
        );
    }

    #[tokio::test]
    async fn test_js_rule_without_runtime_errors() {
        let source = test_source();
        let ctx = ctx_with(&source, "");
        let evaluator = NativeEvaluator::new(&source, None);
        let rule = parse_rule("@js:1+1").unwrap();
        let err = evaluator.eval_field(&rule, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("JS runtime"));
    }

    #[tokio::test]
    async fn test_css_rule_rejected() {
        let source = test_source();
        let ctx = ctx_with(&source, "<html></html>");
        let evaluator = NativeEvaluator::new(&source, None);
        let rule = parse_rule("div.title@text").unwrap();
        let err = evaluator.eval_field(&rule, &ctx).await.unwrap_err();
        assert_eq!(err.kind(), "source");
        assert!(err.to_string().contains("loadUrl"));
    }

    #[tokio::test]
    async fn test_composite_or_short_circuit() {
        let source = test_source();
        let ctx = ctx_with(&source, r#"{"a":"hit"}"#);
        let evaluator = NativeEvaluator::new(&source, None);
        // second branch would error (not JSON-selectable), first wins
        let rule = parse_rule("$.a || $.b").unwrap();
        assert_eq!(evaluator.eval_field(&rule, &ctx).await.unwrap(), "hit");
    }

    #[tokio::test]
    async fn test_composite_or_falls_back() {
        let source = test_source();
        let ctx = ctx_with(&source, r#"{"b":"fallback"}"#);
        let evaluator = NativeEvaluator::new(&source, None);
        let rule = parse_rule("$.a || $.b").unwrap();
        assert_eq!(evaluator.eval_field(&rule, &ctx).await.unwrap(), "fallback");
    }

    #[tokio::test]
    async fn test_composite_and_concat() {
        let source = test_source();
        let ctx = ctx_with(&source, r#"{"a":["x"],"b":["y","z"]}"#);
        let evaluator = NativeEvaluator::new(&source, None);
        let rule = parse_list_rule("$.a && $.b").unwrap();
        assert_eq!(
            evaluator.eval_list(&rule, &ctx).await.unwrap(),
            vec!["x", "y", "z"]
        );
    }

    #[tokio::test]
    async fn test_composite_zip_interleave() {
        let source = test_source();
        let ctx = ctx_with(&source, r#"{"a":["a","b","c"],"b":["1","2"]}"#);
        let evaluator = NativeEvaluator::new(&source, None);
        let rule = parse_list_rule("$.a %% $.b").unwrap();
        assert_eq!(
            evaluator.eval_list(&rule, &ctx).await.unwrap(),
            vec!["a", "1", "b", "2", "c"]
        );
    }

    #[tokio::test]
    async fn test_regex_replace_applies_after_join() {
        let source = test_source();
        let ctx = ctx_with(&source, r#"{"t":"  Chapter 1  "}"#);
        let evaluator = NativeEvaluator::new(&source, None);
        let rule = parse_rule(r"$.t##\s+Chapter\s+##Ch.").unwrap();
        assert_eq!(evaluator.eval_field(&rule, &ctx).await.unwrap(), "Ch.1  ");
    }
}
