//! The book-source execution engine
//!
//! Leaves to roots: rule AST and parser, the `{{...}}` interpolator, the
//! flow-variable store and per-host rate limiter, the two fetch backends
//! (plain HTTP and WebView with its generated extraction script), the
//! paginator, and the module-level executor on top.

pub mod ast;
pub mod debug;
pub mod executor;
pub mod extract_script;
pub mod flow;
pub mod http;
pub mod js;
pub mod jsonpath;
pub mod native;
pub mod paginate;
pub mod parser;
pub mod rate_limit;
pub mod template;
pub mod utils;
pub mod value;
pub mod webview;

pub use ast::{Composite, CompositeOp, JsRule, RegexReplace, RuleNode, Selector, SelectorType, SliceRange};
pub use debug::{DebugCollector, DebugHandle, DebugStep, OperationInfo, StepType};
pub use executor::{Engine, EngineBuilder, OperationOptions};
pub use extract_script::{generate_extract_script, ExtractSpec, PurifyRule};
pub use flow::FlowStore;
pub use http::{HttpClient, HttpResponse, RenderedRequest, ReqwestClient};
pub use js::{JsContext, JsRuntime};
pub use parser::{parse_list_rule, parse_rule, RuleCache};
pub use rate_limit::{parse_rate_limit, RateLimit, RateLimiter};
pub use template::{render_template, validate_template, RuleContext};
pub use value::RuleValue;
pub use webview::{WebViewController, WebViewProvider};

#[cfg(feature = "webview")]
pub use webview::chrome::HeadlessChromeProvider;
