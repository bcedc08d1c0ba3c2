//! Expectations: "wait for pattern P, with timeout T"
//!
//! An [`Expectation`] is driven by the [`Expecter`](crate::core::expecter::Expecter):
//! it is polled (fetch new console data), asked to detect its pattern
//! and, when its time is up, asked to produce its timeout result.

mod console;

pub use console::{ConsoleExpectation, ReportWindow};

use super::capture::CaptureSlice;
use super::context::WaitContext;
use super::error::ExpectError;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// A pattern found in a console capture
#[derive(Debug, Clone, Serialize)]
pub struct Match {
    /// Name of the expectation that found it
    pub name: String,
    /// `role:id` of the target
    pub target: String,
    /// Console name
    pub console: String,
    /// Pattern that matched
    pub pattern: String,
    /// Detection context the search ran in
    pub detect_context: String,
    /// Capture offset the search started at
    pub offset: u64,
    /// Capture offset where the match starts
    pub offset_match_start: u64,
    /// Capture offset where the match ends (exclusive)
    pub offset_match_end: u64,
    /// Named capture groups
    pub groups: BTreeMap<String, Vec<u8>>,
    /// Console output consumed by this match, if reported
    #[serde(skip)]
    pub output: Option<CaptureSlice>,
    /// When the match was detected
    pub timestamp: DateTime<Local>,
}

impl Match {
    /// Named group as lossy UTF-8
    pub fn group(&self, name: &str) -> Option<String> {
        self.groups
            .get(name)
            .map(|value| String::from_utf8_lossy(value).into_owned())
    }

    /// JSON rendering for reports
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Something the wait coordinator can drive
#[async_trait]
pub trait Expectation: Send + Sync {
    /// Name used in messages and reports
    fn name(&self) -> &str;

    /// How often to poll
    fn poll_period(&self) -> Duration;

    /// How long to wait; zero means it is only checked opportunistically
    /// and never makes a wait last or time out
    fn timeout(&self) -> Duration;

    /// Reject parameters the coordinator cannot work with
    fn validate(&self) -> Result<(), ExpectError> {
        if self.poll_period().is_zero() {
            return Err(ExpectError::Invalid(format!(
                "{}: poll period must be > 0",
                self.name()
            )));
        }
        Ok(())
    }

    /// Expectations sharing a poll key share one poll per cycle
    fn poll_key(&self) -> Option<&str> {
        None
    }

    /// Fetch new data
    async fn poll(&self, ctx: &WaitContext) -> Result<(), ExpectError>;

    /// Look for the pattern in data not searched yet; never blocks
    fn detect(&self, ctx: &WaitContext) -> Result<Option<Match>, ExpectError>;

    /// Called with a detected match; returns it to the caller or raises
    fn on_found(&self, ctx: &WaitContext, found: Match) -> Result<Match, ExpectError>;

    /// Called when the timeout elapsed; `Ok` swallows the timeout
    fn on_timeout(&self, ctx: &WaitContext, elapsed: Duration) -> Result<(), ExpectError>;
}
