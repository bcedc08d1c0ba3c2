//! Expect text on a target's console

use super::{Expectation, Match};
use crate::config::ExpectSettings;
use crate::core::context::WaitContext;
use crate::core::error::{Attachment, Behavior, ExpectError, TimeoutReport, Verdict};
use crate::core::pattern::Pattern;
use crate::core::poll::PollState;
use async_trait::async_trait;
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;

/// How much console output a match reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportWindow {
    /// Everything from where the search started to the match end
    #[default]
    Full,
    /// Only the last N bytes before the match end
    Tail(u64),
    /// No output
    Suppressed,
}

/// Waits for a literal or regex to show up in a console
///
/// Search position is kept per detection context in the shared
/// [`PollState`], not in the expectation: a new expectation on the same
/// context continues where the previous one matched.
#[derive(Debug, Clone)]
pub struct ConsoleExpectation {
    name: String,
    state: Arc<PollState>,
    pattern: Pattern,
    detect_context: Option<String>,
    poll_period: Duration,
    timeout: Duration,
    lookback: u64,
    report: ReportWindow,
    on_found: Behavior,
    on_timeout: Behavior,
}

impl ConsoleExpectation {
    /// Expect `pattern` on the console behind `state`
    pub fn new(state: Arc<PollState>, pattern: Pattern) -> Self {
        Self::with_settings(state, pattern, &ExpectSettings::default())
    }

    /// Same as [`ConsoleExpectation::new`], taking defaults from settings
    pub fn with_settings(state: Arc<PollState>, pattern: Pattern, settings: &ExpectSettings) -> Self {
        Self {
            name: pattern.safe_name(),
            state,
            pattern,
            detect_context: None,
            poll_period: settings.poll_period(),
            timeout: settings.timeout(),
            lookback: settings.lookback_bytes,
            report: ReportWindow::Full,
            on_found: Behavior::Return,
            on_timeout: Behavior::Raise(Verdict::Fail),
        }
    }

    /// Name for messages
    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Search cursor to use; defaults to the wait context's, then to
    /// the console name
    #[must_use]
    pub fn with_detect_context(mut self, detect_context: &str) -> Self {
        self.detect_context = Some(detect_context.to_string());
        self
    }

    /// Time between polls
    #[must_use]
    pub fn with_poll_period(mut self, poll_period: Duration) -> Self {
        self.poll_period = poll_period;
        self
    }

    /// How long to wait; zero never times out
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// History pulled in if this expectation opens the capture
    #[must_use]
    pub fn with_lookback(mut self, lookback: u64) -> Self {
        self.lookback = lookback;
        self
    }

    /// How much output to report with a match
    #[must_use]
    pub fn with_report(mut self, report: ReportWindow) -> Self {
        self.report = report;
        self
    }

    /// What to do when found
    #[must_use]
    pub fn when_found(mut self, behavior: Behavior) -> Self {
        self.on_found = behavior;
        self
    }

    /// What to do on timeout
    #[must_use]
    pub fn when_timeout(mut self, behavior: Behavior) -> Self {
        self.on_timeout = behavior;
        self
    }

    /// Pattern looked for
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Shared poll state
    pub fn state(&self) -> &Arc<PollState> {
        &self.state
    }

    /// Detection context this expectation searches in under `ctx`
    pub fn detect_context(&self, ctx: &WaitContext) -> String {
        self.detect_context
            .as_deref()
            .or_else(|| ctx.detect_context())
            .unwrap_or_else(|| self.state.console())
            .to_string()
    }

    fn target_id(&self) -> String {
        self.state.target().full_id()
    }
}

#[async_trait]
impl Expectation for ConsoleExpectation {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll_period(&self) -> Duration {
        self.poll_period
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn validate(&self) -> Result<(), ExpectError> {
        if self.poll_period.is_zero() {
            return Err(ExpectError::Invalid(format!("{}: poll period must be > 0", self.name)));
        }
        if self.lookback == 0 {
            return Err(ExpectError::Invalid(format!("{}: lookback must be > 0", self.name)));
        }
        Ok(())
    }

    fn poll_key(&self) -> Option<&str> {
        Some(self.state.key())
    }

    async fn poll(&self, ctx: &WaitContext) -> Result<(), ExpectError> {
        self.state.poll(ctx, self.lookback).await.map(|_| ())
    }

    fn detect(&self, ctx: &WaitContext) -> Result<Option<Match>, ExpectError> {
        if !self.state.is_open() {
            return Err(ExpectError::blocked(format!(
                "{}/{}: no capture for console {}:{}, it was never polled",
                ctx.prefix(),
                self.name,
                self.target_id(),
                self.state.console()
            )));
        }
        let end = self.state.captured_len();
        let detect_context = self.detect_context(ctx);
        let cursor = self.state.cursor(&detect_context);
        if end == 0 || end <= cursor.offset {
            return Ok(None);
        }

        tracing::trace!(
            "{}/{}: looking for `{}` in console {}:{} @{}-{}",
            ctx.prefix(),
            self.name,
            self.pattern,
            self.target_id(),
            self.state.console(),
            cursor.offset,
            end
        );
        let window = self.state.read_range(cursor.offset, end)?;
        let Some(hit) = self.pattern.find(&window) else {
            return Ok(None);
        };
        let match_start = cursor.offset + hit.start as u64;
        let match_end = cursor.offset + hit.end as u64;
        if !self.state.commit_match(&detect_context, cursor, match_end) {
            // another waiter on this context consumed it first
            return Ok(None);
        }

        let output = match self.report {
            ReportWindow::Full => Some(self.state.slice(cursor.offset, match_end)),
            ReportWindow::Tail(bytes) => Some(self.state.slice(
                cursor.offset.max(match_end.saturating_sub(bytes)),
                match_end,
            )),
            ReportWindow::Suppressed => None,
        };
        tracing::info!(
            "{}/{}: found `{}` at @{}-{} on console {}:{} [{}]",
            ctx.prefix(),
            self.name,
            self.pattern,
            match_start,
            match_end,
            self.target_id(),
            self.state.console(),
            self.state.capture_path().display()
        );
        Ok(Some(Match {
            name: self.name.clone(),
            target: self.target_id(),
            console: self.state.console().to_string(),
            pattern: self.pattern.to_string(),
            detect_context,
            offset: cursor.offset,
            offset_match_start: match_start,
            offset_match_end: match_end,
            groups: hit.groups,
            output,
            timestamp: Local::now(),
        }))
    }

    fn on_found(&self, ctx: &WaitContext, found: Match) -> Result<Match, ExpectError> {
        match self.on_found {
            Behavior::Return => Ok(found),
            Behavior::Raise(verdict) => Err(ExpectError::raised(
                verdict,
                format!(
                    "{}/{}: found `{}` at @{}-{} on console {}:{}",
                    ctx.prefix(),
                    self.name,
                    self.pattern,
                    found.offset_match_start,
                    found.offset_match_end,
                    found.target,
                    found.console
                ),
                Attachment::Match(Box::new(found)),
            )),
        }
    }

    fn on_timeout(&self, ctx: &WaitContext, elapsed: Duration) -> Result<(), ExpectError> {
        let detect_context = self.detect_context(ctx);
        let cursor = self.state.cursor(&detect_context);
        let report = TimeoutReport {
            name: self.name.clone(),
            target: self.target_id(),
            console: self.state.console().to_string(),
            pattern: self.pattern.to_string(),
            detect_context,
            offset: cursor.offset,
            offset_prev: cursor.offset_prev,
            elapsed_secs: elapsed.as_secs_f64(),
            output: self.state.slice(cursor.offset, self.state.captured_len()),
        };
        let message = format!(
            "{}/{}: timed out finding `{}` in console {}:{} @{:.1}/{:.1}s",
            ctx.prefix(),
            self.name,
            self.pattern,
            report.target,
            report.console,
            elapsed.as_secs_f64(),
            self.timeout.as_secs_f64()
        );
        match self.on_timeout {
            Behavior::Raise(verdict) => {
                tracing::warn!("{}", message);
                Err(ExpectError::raised(
                    verdict,
                    message,
                    Attachment::Timeout(Box::new(report)),
                ))
            }
            Behavior::Return => {
                tracing::debug!("{} (ignored)", message);
                Ok(())
            }
        }
    }
}
