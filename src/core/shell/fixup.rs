//! Command echo verification and fixups
//!
//! Background output (kernel messages, daemons) can land in the middle
//! of a command being echoed. A fixup watches for one such known message
//! in its own detection context; when it shows up before the echo is
//! complete, the shell works out how much of the command made it and
//! types only the rest.

use crate::core::context::WaitContext;
use crate::core::error::{Behavior, ExpectError, Verdict};
use crate::core::expectation::{ConsoleExpectation, Expectation, Match, ReportWindow};
use crate::core::kpi::RecoveredConditions;
use crate::core::pattern::Pattern;
use crate::core::poll::PollState;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Detection context the command echo is looked for in
pub const ECHO_CONTEXT: &str = "shell-echo";

/// Waits for a typed command to be echoed back
///
/// Not seeing the echo in time means the console is not behaving and is
/// raised as blocked.
#[derive(Debug)]
pub struct EchoWaiter {
    inner: ConsoleExpectation,
}

impl EchoWaiter {
    /// Wait for `text` to be echoed on the console behind `state`
    pub fn new(state: Arc<PollState>, text: &str, timeout: Duration, poll_period: Duration) -> Self {
        Self {
            inner: ConsoleExpectation::new(state, Pattern::literal(text))
                .with_name("shell echo")
                .with_detect_context(ECHO_CONTEXT)
                .with_timeout(timeout)
                .with_poll_period(poll_period)
                .with_report(ReportWindow::Suppressed)
                .when_timeout(Behavior::Raise(Verdict::Block)),
        }
    }
}

#[async_trait]
impl Expectation for EchoWaiter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn poll_period(&self) -> Duration {
        self.inner.poll_period()
    }

    fn timeout(&self) -> Duration {
        self.inner.timeout()
    }

    fn validate(&self) -> Result<(), ExpectError> {
        self.inner.validate()
    }

    fn poll_key(&self) -> Option<&str> {
        self.inner.poll_key()
    }

    async fn poll(&self, ctx: &WaitContext) -> Result<(), ExpectError> {
        self.inner.poll(ctx).await
    }

    fn detect(&self, ctx: &WaitContext) -> Result<Option<Match>, ExpectError> {
        self.inner.detect(ctx)
    }

    fn on_found(&self, ctx: &WaitContext, found: Match) -> Result<Match, ExpectError> {
        self.inner.on_found(ctx, found)
    }

    fn on_timeout(&self, ctx: &WaitContext, elapsed: Duration) -> Result<(), ExpectError> {
        self.inner.on_timeout(ctx, elapsed)
    }
}

/// Watches for a known message that interrupts command echo
///
/// Never makes a wait last (zero timeout). Each time it is found it
/// counts a recovered condition named `shell fixup: NAME [TEXT]`.
#[derive(Debug)]
pub struct FixupWatcher {
    name: String,
    detect_context: String,
    inner: ConsoleExpectation,
    recovered: Arc<RecoveredConditions>,
}

impl FixupWatcher {
    /// Fixup `name` for messages matching `regex`
    pub fn new(
        state: Arc<PollState>,
        name: &str,
        regex: &str,
        poll_period: Duration,
        recovered: Arc<RecoveredConditions>,
    ) -> Result<Self, ExpectError> {
        let detect_context = format!("shell-fixup-{name}");
        let inner = ConsoleExpectation::new(state, Pattern::regex(regex)?)
            .with_name(name)
            .with_detect_context(&detect_context)
            .with_timeout(Duration::ZERO)
            .with_poll_period(poll_period)
            .with_report(ReportWindow::Suppressed);
        Ok(Self {
            name: name.to_string(),
            detect_context,
            inner,
            recovered,
        })
    }

    /// Detection context this fixup searches in
    pub fn detect_context(&self) -> &str {
        &self.detect_context
    }

    /// Pattern of the interrupting message
    pub fn pattern(&self) -> &Pattern {
        self.inner.pattern()
    }
}

#[async_trait]
impl Expectation for FixupWatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll_period(&self) -> Duration {
        self.inner.poll_period()
    }

    fn timeout(&self) -> Duration {
        Duration::ZERO
    }

    fn validate(&self) -> Result<(), ExpectError> {
        self.inner.validate()
    }

    fn poll_key(&self) -> Option<&str> {
        self.inner.poll_key()
    }

    async fn poll(&self, ctx: &WaitContext) -> Result<(), ExpectError> {
        self.inner.poll(ctx).await
    }

    fn detect(&self, ctx: &WaitContext) -> Result<Option<Match>, ExpectError> {
        self.inner.detect(ctx)
    }

    fn on_found(&self, ctx: &WaitContext, found: Match) -> Result<Match, ExpectError> {
        let text = self
            .inner
            .state()
            .read_range(found.offset_match_start, found.offset_match_end)?;
        let condition = format!(
            "shell fixup: {} [{}]",
            self.name,
            String::from_utf8_lossy(&text).trim()
        );
        self.recovered.record(ctx.prefix(), &condition);
        Ok(found)
    }

    fn on_timeout(&self, _ctx: &WaitContext, _elapsed: Duration) -> Result<(), ExpectError> {
        Ok(())
    }
}

/// How much of an interrupted command was echoed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResumePoint {
    /// Bytes of the command already echoed
    pub echoed: usize,
    /// Bytes after the interrupting message that belong to the echo
    pub after_consumed: usize,
}

/// Work out where to resume typing `pending`
///
/// `before` is the console output between where the echo was being
/// looked for and the interrupting message, `after` what followed the
/// message. Line endings around the message are not part of the echo.
pub(crate) fn resume_point(before: &[u8], after: &[u8], pending: &str) -> ResumePoint {
    let command = pending.as_bytes();
    let mut echoed = common_prefix(trim_start(before), command);

    let after_trimmed = trim_start(after);
    let skipped = after.len() - after_trimmed.len();
    let continued = common_prefix(after_trimmed, &command[echoed..]);
    let mut after_consumed = 0;
    if continued > 0 {
        echoed += continued;
        after_consumed = skipped + continued;
    }

    // never split a character
    while !pending.is_char_boundary(echoed) {
        echoed -= 1;
        after_consumed = after_consumed.saturating_sub(1);
    }
    ResumePoint {
        echoed,
        after_consumed,
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn trim_start(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|&b| !matches!(b, b'\r' | b'\n'))
        .unwrap_or(data.len());
    &data[start..]
}
