//! reader-engine - a rule-driven book source execution engine
//!
//! Given a declarative [`Source`](models::Source) describing how a site
//! exposes books and a user action (search a keyword, browse a category,
//! open a chapter), the engine fetches the relevant pages, parses them with
//! a composable rule DSL and produces [`Book`](models::Book) /
//! [`Chapter`](models::Chapter) / [`Content`](models::Content) records.
//!
//! Rules combine CSS/XPath/JSONPath/regex/`@js:` atoms with `||`/`&&`/`%%`
//! operators, attribute/slice/regex-replace suffixes, `@put:{...}`
//! side-effects and `{{...}}` interpolation. Two backends are supported per
//! request: `loadUrl` renders the page in a WebView (DOM rules, Cloudflare
//! handling), `fetch` pulls the raw body over HTTP and evaluates rules
//! in-process.
//!
//! ```no_run
//! use std::sync::Arc;
//! use reader_engine::engine::{Engine, OperationOptions};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let engine = Engine::builder().build()?;
//! let report = reader_engine::models::import_sources(r#"{"version":"1","sources":[],"lastUpdatedAt":0}"#)?;
//! for source in &report.sources {
//!     let books = engine.search(source, "dune", OperationOptions::default()).await?;
//!     println!("{} results from {}", books.len(), source.name);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The JS runtime, WebView implementation and debug sink are capabilities
//! handed in through [`Engine::builder`](engine::Engine::builder); the crate
//! ships a default HTTP client (reqwest) and, behind the `webview` feature,
//! a headless-Chrome controller.

pub mod engine;
pub mod error;
pub mod models;

pub use engine::{Engine, OperationOptions};
pub use error::{ErrorContext, ReaderError, ReaderResult};
pub use models::{Book, Chapter, Content, ContentBody, DiscoverCategory, Source};
