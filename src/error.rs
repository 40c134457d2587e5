//! Engine Error Types - Structured error handling
//!
//! One public error enum with three kinds: rule parse failures, network
//! failures, and source/extraction failures. Every variant carries enough
//! context ({sourceId, module, url, fieldPath}) for a rule author to locate
//! the offending rule without re-running the operation.

use thiserror::Error;

/// Where an error happened: which source, module, url and rule field.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_path: Option<String>,
}

impl ErrorContext {
    pub fn new(source_id: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            source_id: Some(source_id.into()),
            module: Some(module.into()),
            ..Default::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }
}

/// Reader Error - the error type surfaced by every engine operation
#[derive(Error, Debug)]
pub enum ReaderError {
    /// Grammar violation in a rule expression: mixed composite operators,
    /// unbalanced interpolation, invalid slice or regex-replace suffix.
    /// Never retried; the expression itself is wrong.
    #[error("Rule parse error: {message} (expr: {expr:?})")]
    Parse {
        message: String,
        expr: String,
        context: ErrorContext,
    },

    /// HTTP non-2xx, timeout, or WebView load failure.
    #[error("Network error: {message}")]
    Network {
        message: String,
        status_code: Option<u16>,
        context: ErrorContext,
    },

    /// The backend worked but extraction failed: empty content, a purify
    /// rule that does not compile, `__error` from the extraction script,
    /// a Cloudflare Turnstile challenge, a DOM rule on the fetch backend.
    #[error("Source error: {message}")]
    Source {
        message: String,
        context: ErrorContext,
        cause: Option<anyhow::Error>,
    },
}

/// Result type alias for engine operations
pub type ReaderResult<T> = Result<T, ReaderError>;

impl ReaderError {
    /// Create a parse error for a rule expression
    pub fn parse(message: impl Into<String>, expr: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            expr: expr.into(),
            context: ErrorContext::default(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self::Network {
            message: message.into(),
            status_code,
            context: ErrorContext::default(),
        }
    }

    /// Create a source/extraction error
    pub fn source(message: impl Into<String>) -> Self {
        Self::Source {
            message: message.into(),
            context: ErrorContext::default(),
            cause: None,
        }
    }

    /// Convert any foreign error into a `Source` error, attaching context.
    /// A `ReaderError` cause passes through with its context merged instead
    /// of being double-wrapped.
    pub fn from_any(cause: anyhow::Error, context: ErrorContext) -> Self {
        match cause.downcast::<ReaderError>() {
            Ok(reader) => reader.merge_context(context),
            Err(other) => Self::Source {
                message: other.to_string(),
                context,
                cause: Some(other),
            },
        }
    }

    /// Fill in any context fields not already set.
    pub fn merge_context(mut self, extra: ErrorContext) -> Self {
        let ctx = match &mut self {
            Self::Parse { context, .. } => context,
            Self::Network { context, .. } => context,
            Self::Source { context, .. } => context,
        };
        if ctx.source_id.is_none() {
            ctx.source_id = extra.source_id;
        }
        if ctx.module.is_none() {
            ctx.module = extra.module;
        }
        if ctx.url.is_none() {
            ctx.url = extra.url;
        }
        if ctx.field_path.is_none() {
            ctx.field_path = extra.field_path;
        }
        self
    }

    /// The context attached to this error
    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::Parse { context, .. } => context,
            Self::Network { context, .. } => context,
            Self::Source { context, .. } => context,
        }
    }

    /// Stable kind name, useful for logs and UI dispatch
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse",
            Self::Network { .. } => "network",
            Self::Source { .. } => "source",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ReaderError::parse("mixed composite operators", "a || b && c");
        assert!(err.to_string().contains("mixed composite operators"));
        assert_eq!(err.kind(), "parse");
    }

    #[test]
    fn test_merge_context_keeps_existing() {
        let err = ReaderError::Network {
            message: "HTTP 404".into(),
            status_code: Some(404),
            context: ErrorContext::default().with_url("https://x/a"),
        };
        let merged = err.merge_context(
            ErrorContext::new("src1", "search").with_url("https://x/b"),
        );
        let ctx = merged.context();
        assert_eq!(ctx.url.as_deref(), Some("https://x/a"));
        assert_eq!(ctx.source_id.as_deref(), Some("src1"));
        assert_eq!(ctx.module.as_deref(), Some("search"));
    }

    #[test]
    fn test_from_any_passes_reader_error_through() {
        let inner = ReaderError::source("Empty content extracted");
        let out = ReaderError::from_any(anyhow::Error::new(inner), ErrorContext::new("s", "content"));
        assert_eq!(out.kind(), "source");
        assert!(out.to_string().contains("Empty content extracted"));
        assert_eq!(out.context().module.as_deref(), Some("content"));
    }
}
