//! JS runtime seam - the capability handed in by the caller
//!
//! The engine never ships a JavaScript engine. `@js:` rules and
//! `{{@js:...}}` interpolation go through this trait; a caller that wires
//! none in gets empty interpolation results and hard errors from explicit
//! `@js:` rules.

use async_trait::async_trait;
use std::collections::HashMap;

use super::value::RuleValue;
use crate::models::Source;

/// Variables visible to an `@js:` evaluation. The runtime is expected to
/// expose each field under its camelCase name, inject `source.jsLib` as a
/// prelude, and bind `result` to the current dataflow value.
#[derive(Debug, Clone, Default)]
pub struct JsContext {
    pub base_url: Option<String>,
    pub url: Option<String>,
    pub host: Option<String>,
    pub keyword: Option<String>,
    pub page: Option<i64>,
    pub page_index: Option<i64>,
    /// Current page text or list-item value
    pub result: Option<serde_json::Value>,
    pub book: Option<serde_json::Value>,
    pub chapter: Option<serde_json::Value>,
    /// Flow variables of the current item scope
    pub vars: HashMap<String, String>,
}

#[async_trait]
pub trait JsRuntime: Send + Sync {
    /// Evaluate a `@js:` expression. `code` arrives with the `@js:` prefix
    /// already stripped.
    async fn eval_js_expr(
        &self,
        code: &str,
        context: &JsContext,
        source: &Source,
    ) -> anyhow::Result<RuleValue>;
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedJsRuntime;
    use super::*;
    use crate::engine::value::RuleValue;

    #[test]
    fn test_scripted_runtime_responses() {
        let source: Source = serde_json::from_value(serde_json::json!({
            "id": "s", "name": "S", "host": "https://x"
        }))
        .unwrap();
        let runtime = ScriptedJsRuntime::new().respond("1+1", RuleValue::Number(2.0));
        let value = tokio_test::block_on(runtime.eval_js_expr(
            "1+1",
            &JsContext::default(),
            &source,
        ))
        .unwrap();
        assert_eq!(value, RuleValue::Number(2.0));
        let missing = tokio_test::block_on(runtime.eval_js_expr(
            "nope",
            &JsContext::default(),
            &source,
        ))
        .unwrap();
        assert_eq!(missing, RuleValue::Null);
    }
}

#[cfg(test)]
pub mod testing {
    //! A canned-response runtime for executor and interpolator tests.

    use super::*;
    use std::sync::Mutex;

    pub struct ScriptedJsRuntime {
        responses: Mutex<HashMap<String, RuleValue>>,
        /// When a script is not scripted, fail instead of returning Null
        pub strict: bool,
    }

    impl ScriptedJsRuntime {
        pub fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                strict: false,
            }
        }

        pub fn respond(self, code: &str, value: RuleValue) -> Self {
            self.responses
                .lock()
                .unwrap()
                .insert(code.to_string(), value);
            self
        }
    }

    #[async_trait]
    impl JsRuntime for ScriptedJsRuntime {
        async fn eval_js_expr(
            &self,
            code: &str,
            _context: &JsContext,
            _source: &Source,
        ) -> anyhow::Result<RuleValue> {
            if let Some(value) = self.responses.lock().unwrap().get(code) {
                return Ok(value.clone());
            }
            if self.strict {
                anyhow::bail!("unscripted js expression: {code}");
            }
            Ok(RuleValue::Null)
        }
    }
}
