//! Wait context threaded through every engine call
//!
//! Carries the logging prefix, the stack of detection context names
//! and the cancellation signal of the owning test case.

use tokio_util::sync::CancellationToken;

/// Explicit per-call context
#[derive(Debug, Clone)]
pub struct WaitContext {
    prefix: String,
    detect_contexts: Vec<String>,
    cancel: CancellationToken,
}

impl WaitContext {
    /// New root context
    pub fn new(prefix: &str, cancel: CancellationToken) -> Self {
        Self {
            prefix: prefix.to_string(),
            detect_contexts: Vec::new(),
            cancel,
        }
    }

    /// Context for a nested operation; logs as `PREFIX/SEGMENT`
    #[must_use]
    pub fn child(&self, segment: &str) -> Self {
        let mut ctx = self.clone();
        if ctx.prefix.is_empty() {
            ctx.prefix = segment.to_string();
        } else {
            ctx.prefix = format!("{}/{}", self.prefix, segment);
        }
        ctx
    }

    /// Context whose expectations default to `detect_context`
    #[must_use]
    pub fn with_detect_context(&self, detect_context: &str) -> Self {
        let mut ctx = self.clone();
        ctx.detect_contexts.push(detect_context.to_string());
        ctx
    }

    /// Logging prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Innermost detection context, if any was pushed
    pub fn detect_context(&self) -> Option<&str> {
        self.detect_contexts.last().map(String::as_str)
    }

    /// Cancellation signal
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the owning test case was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for WaitContext {
    fn default() -> Self {
        Self::new("", CancellationToken::new())
    }
}
