//! Typed results of a console wait
//!
//! Every wait ends in exactly one of these: a match handed back to the
//! caller, or an [`ExpectError`] tagged with a [`Verdict`] and carrying
//! its diagnostics as a structured [`Attachment`].

use super::expectation::Match;
use super::remote::RemoteError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Outcome classes a wait can propagate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Verdict {
    /// Condition met, raised as a result
    Pass,
    /// Test defect (default for timeouts)
    Fail,
    /// Test code or target misbehaved
    Error,
    /// Infrastructure/environment fault, not a test defect
    Block,
    /// Test does not apply
    Skip,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "passed"),
            Self::Fail => write!(f, "failed"),
            Self::Error => write!(f, "errored"),
            Self::Block => write!(f, "blocked"),
            Self::Skip => write!(f, "skipped"),
        }
    }
}

/// What to do when an expectation is found or times out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behavior {
    /// Hand the data back to the caller
    #[default]
    Return,
    /// Raise a typed result
    Raise(Verdict),
}

/// Diagnostics attached to a timed out expectation
#[derive(Debug, Clone, Serialize)]
pub struct TimeoutReport {
    /// Expectation name
    pub name: String,
    /// `role:id` of the target
    pub target: String,
    /// Console name
    pub console: String,
    /// Pattern being looked for
    pub pattern: String,
    /// Detection context whose cursor was used
    pub detect_context: String,
    /// Search offset when the wait timed out
    pub offset: u64,
    /// Search offset before the last successful match
    pub offset_prev: u64,
    /// Seconds waited
    pub elapsed_secs: f64,
    /// Everything read since we started looking
    #[serde(skip)]
    pub output: super::capture::CaptureSlice,
}

/// A remote console operation that failed
#[derive(Debug, Clone, Serialize)]
pub struct RemoteFault {
    /// Poll key of the console (`console-ROLE.ID.CONSOLE`)
    pub console_id: String,
    /// Remote offset the operation was attempted at
    pub offset: u64,
    /// Rendered cause
    pub cause: String,
}

/// Structured data carried by a raised result
#[derive(Debug, Clone)]
pub enum Attachment {
    /// Nothing attached
    None,
    /// The match that raised
    Match(Box<Match>),
    /// Timeout diagnostics
    Timeout(Box<TimeoutReport>),
    /// Remote read/write fault
    Remote(RemoteFault),
}

/// Errors (and raised results) of the expectation engine
#[derive(Error, Debug)]
pub enum ExpectError {
    /// A typed result raised by an expectation, the coordinator or the
    /// polling layer
    #[error("{verdict}: {message}")]
    Raised {
        /// Result class
        verdict: Verdict,
        /// Human readable message
        message: String,
        /// Diagnostics
        attachment: Attachment,
    },

    /// Pattern failed to compile
    #[error("invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        /// Offending pattern
        pattern: String,
        /// Compiler error
        #[source]
        source: regex::Error,
    },

    /// Malformed wait or expectation parameters
    #[error("invalid expectation: {0}")]
    Invalid(String),

    /// The owning test case was cancelled while waiting
    #[error("wait cancelled: {0}")]
    Cancelled(String),
}

impl ExpectError {
    /// Raise a result of the given class
    pub fn raised(verdict: Verdict, message: impl Into<String>, attachment: Attachment) -> Self {
        Self::Raised {
            verdict,
            message: message.into(),
            attachment,
        }
    }

    /// Infrastructure fault with no further data
    pub fn blocked(message: impl Into<String>) -> Self {
        Self::raised(Verdict::Block, message, Attachment::None)
    }

    /// Remote fault on a console, reported as blocked
    pub fn remote(console_id: &str, offset: u64, err: &RemoteError) -> Self {
        Self::raised(
            Verdict::Block,
            format!("error accessing console {console_id} @{offset}B: {err}"),
            Attachment::Remote(RemoteFault {
                console_id: console_id.to_string(),
                offset,
                cause: err.to_string(),
            }),
        )
    }

    /// Local capture file I/O fault, reported as blocked
    pub fn capture_io(console_id: &str, err: &std::io::Error) -> Self {
        Self::blocked(format!("{console_id}: capture file error: {err}"))
    }

    /// Verdict, if this is a raised result
    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            Self::Raised { verdict, .. } => Some(*verdict),
            _ => None,
        }
    }

    /// Attachment, if this is a raised result
    pub fn attachment(&self) -> Option<&Attachment> {
        match self {
            Self::Raised { attachment, .. } => Some(attachment),
            _ => None,
        }
    }

    /// Raised as blocked
    pub fn is_blocked(&self) -> bool {
        self.verdict() == Some(Verdict::Block)
    }

    /// Raised as failed
    pub fn is_failed(&self) -> bool {
        self.verdict() == Some(Verdict::Fail)
    }
}
