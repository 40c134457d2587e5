//! Debug tracer contract - ordered operation/step events for rule authors
//!
//! The engine emits a structured event stream per operation; the sink is
//! provided by the caller (a log window, a file, nothing). A `None` from
//! `start_operation` disables collection for that operation with zero cost
//! on the hot path.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ReaderError;

/// Identifies one engine operation (one search, one chapter-list fetch...)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationInfo {
    pub id: Uuid,
    pub op_type: String,
    pub source_id: String,
    pub module: String,
    /// Operation input: keyword, category, book url...
    pub input: serde_json::Value,
    pub started_at: DateTime<Utc>,
}

impl OperationInfo {
    pub fn new(source_id: &str, module: &str, input: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            op_type: module.to_string(),
            source_id: source_id.to_string(),
            module: module.to_string(),
            input,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepType {
    #[serde(rename = "request")]
    Request,
    #[serde(rename = "response")]
    Response,
    #[serde(rename = "field")]
    Field,
    #[serde(rename = "put")]
    Put,
    #[serde(rename = "cf.wait")]
    CfWait,
    #[serde(rename = "cf.passed")]
    CfPassed,
    #[serde(rename = "warn")]
    Warn,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugStep {
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

impl DebugStep {
    pub fn new(step_type: StepType, message: impl Into<String>) -> Self {
        Self {
            step_type,
            message: message.into(),
            url: None,
            source_id: None,
            module: None,
            field_path: None,
            expr: None,
            data: None,
            at: Utc::now(),
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn expr(mut self, expr: impl Into<String>) -> Self {
        self.expr = Some(expr.into());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Sink for one operation's steps
pub trait DebugHandle: Send + Sync {
    fn step(&self, step: DebugStep);
    fn end_ok(&self);
    fn end_error(&self, error: &ReaderError);
}

/// Collector of operations; returning `None` skips tracing entirely
pub trait DebugCollector: Send + Sync {
    fn start_operation(&self, info: OperationInfo) -> Option<Box<dyn DebugHandle>>;
}

/// Convenience wrapper the executor threads through its helpers: a handle
/// that may not exist.
pub struct DebugScope {
    handle: Option<Box<dyn DebugHandle>>,
}

impl DebugScope {
    pub fn disabled() -> Self {
        Self { handle: None }
    }

    pub fn start(
        collector: Option<&dyn DebugCollector>,
        source_id: &str,
        module: &str,
        input: serde_json::Value,
    ) -> Self {
        let handle = collector.and_then(|c| {
            c.start_operation(OperationInfo::new(source_id, module, input))
        });
        Self { handle }
    }

    pub fn enabled(&self) -> bool {
        self.handle.is_some()
    }

    pub fn step(&self, step: DebugStep) {
        if let Some(handle) = &self.handle {
            handle.step(step);
        }
    }

    pub fn end_ok(&self) {
        if let Some(handle) = &self.handle {
            handle.end_ok();
        }
    }

    pub fn end_error(&self, error: &ReaderError) {
        if let Some(handle) = &self.handle {
            handle.end_error(error);
        }
    }
}
