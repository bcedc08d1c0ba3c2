//! Wait coordinator
//!
//! Drives a set of [`Expectation`]s (plus the global watchers registered
//! with the coordinator) until one is found or they time out:
//!
//! 1. poll every distinct console once per cycle
//! 2. detect in registration order (global watchers first, then the
//!    caller's in the order given); the first one found wins, even if
//!    a later one matched earlier bytes
//! 3. sleep up to the poll period, waking early on cancellation
//!
//! Expectations with a zero timeout, and global watchers whatever their
//! timeout, are only checked while something else is being waited for;
//! they never make a wait last or time out.

use super::context::WaitContext;
use super::error::ExpectError;
use super::expectation::{Expectation, Match};
use futures::future::try_join_all;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Shared handle to an expectation
pub type ExpectationRef = Arc<dyn Expectation>;

/// Result of a successful wait
#[derive(Debug, Clone)]
pub struct Found {
    /// Position of the expectation in the caller's list, or in the
    /// global watchers if `global`
    pub index: usize,
    /// Found by a global watcher
    pub global: bool,
    /// Expectation name
    pub name: String,
    /// What was found
    pub matched: Match,
}

struct Entry {
    index: usize,
    global: bool,
    expectation: ExpectationRef,
}

/// Runs waits; holds the always-active global watchers
#[derive(Default)]
pub struct Expecter {
    globals: RwLock<Vec<ExpectationRef>>,
}

impl std::fmt::Debug for Expecter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .globals
            .read()
            .iter()
            .map(|e| e.name().to_string())
            .collect();
        f.debug_struct("Expecter").field("globals", &names).finish()
    }
}

impl Expecter {
    /// Coordinator with no global watchers
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a watcher checked on every wait
    ///
    /// With `skip_duplicate`, a watcher whose name is already registered
    /// is not added again. Returns whether it was added.
    pub fn global_append(&self, expectation: ExpectationRef, skip_duplicate: bool) -> bool {
        let mut globals = self.globals.write();
        if skip_duplicate && globals.iter().any(|e| e.name() == expectation.name()) {
            return false;
        }
        globals.push(expectation);
        true
    }

    /// Remove global watchers by name; returns whether any was removed
    pub fn global_remove(&self, name: &str) -> bool {
        let mut globals = self.globals.write();
        let before = globals.len();
        globals.retain(|e| e.name() != name);
        globals.len() != before
    }

    /// Names of the global watchers, in order
    pub fn global_names(&self) -> Vec<String> {
        self.globals
            .read()
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    /// Wait for any of `expectations` (or a global watcher)
    ///
    /// Returns the first one found, `None` if every timed expectation
    /// timed out and their timeout behavior swallowed it, or the raised
    /// result.
    pub async fn expect(
        &self,
        ctx: &WaitContext,
        expectations: &[ExpectationRef],
    ) -> Result<Option<Found>, ExpectError> {
        if expectations.is_empty() {
            return Err(ExpectError::Invalid(format!(
                "{}: nothing to expect",
                ctx.prefix()
            )));
        }
        let globals = self.globals.read().clone();
        let mut active: Vec<Entry> = globals
            .into_iter()
            .enumerate()
            .map(|(index, expectation)| Entry {
                index,
                global: true,
                expectation,
            })
            .chain(
                expectations
                    .iter()
                    .cloned()
                    .enumerate()
                    .map(|(index, expectation)| Entry {
                        index,
                        global: false,
                        expectation,
                    }),
            )
            .collect();

        let mut poll_period = Duration::MAX;
        for Entry { expectation: e, .. } in &active {
            e.validate().map_err(|err| match err {
                ExpectError::Invalid(message) => {
                    ExpectError::Invalid(format!("{}/{}", ctx.prefix(), message))
                }
                other => other,
            })?;
            poll_period = poll_period.min(e.poll_period());
        }
        let budget = expectations
            .iter()
            .map(|e| e.timeout())
            .max()
            .unwrap_or_default();
        if budget.is_zero() {
            return Err(ExpectError::Invalid(format!(
                "{}: no expectation has a timeout > 0",
                ctx.prefix()
            )));
        }
        tracing::debug!(
            "{}: expecting {} for up to {:.1}s, polling every {:.2}s",
            ctx.prefix(),
            active
                .iter()
                .map(|entry| entry.expectation.name())
                .collect::<Vec<_>>()
                .join(", "),
            budget.as_secs_f64(),
            poll_period.as_secs_f64()
        );

        let start = Instant::now();
        loop {
            if ctx.is_cancelled() {
                return Err(self.cancelled(ctx, start));
            }
            self.poll(ctx, &active).await?;

            for entry in &active {
                let e = &entry.expectation;
                if let Some(found) = e.detect(ctx)? {
                    let matched = e.on_found(ctx, found)?;
                    return Ok(Some(Found {
                        index: entry.index,
                        global: entry.global,
                        name: e.name().to_string(),
                        matched,
                    }));
                }
            }

            let elapsed = start.elapsed();
            let mut waiting = Vec::with_capacity(active.len());
            for entry in active {
                let timeout = entry.expectation.timeout();
                if !entry.global && !timeout.is_zero() && elapsed >= timeout {
                    // Err raises; Ok means it just stops being waited for
                    entry.expectation.on_timeout(ctx, elapsed)?;
                } else {
                    waiting.push(entry);
                }
            }
            active = waiting;

            let Some(next_deadline) = active
                .iter()
                .filter(|entry| !entry.global)
                .map(|entry| entry.expectation.timeout())
                .filter(|t| !t.is_zero())
                .min()
            else {
                tracing::debug!(
                    "{}: all expectations timed out after {:.1}s",
                    ctx.prefix(),
                    elapsed.as_secs_f64()
                );
                return Ok(None);
            };

            let wait = poll_period.min(next_deadline.saturating_sub(elapsed));
            tokio::select! {
                _ = ctx.cancel_token().cancelled() => {
                    return Err(self.cancelled(ctx, start));
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// One poll per distinct poll key, concurrently across consoles
    async fn poll(
        &self,
        ctx: &WaitContext,
        active: &[Entry],
    ) -> Result<(), ExpectError> {
        let mut seen = HashSet::new();
        let pending = active.iter().filter_map(|entry| {
            let e = &entry.expectation;
            match e.poll_key() {
                Some(key) if !seen.insert(key.to_string()) => None,
                _ => Some(e.poll(ctx)),
            }
        });
        try_join_all(pending).await?;
        Ok(())
    }

    fn cancelled(&self, ctx: &WaitContext, start: Instant) -> ExpectError {
        tracing::info!(
            "{}: wait cancelled after {:.2}s",
            ctx.prefix(),
            start.elapsed().as_secs_f64()
        );
        ExpectError::Cancelled(format!(
            "{}: cancelled after {:.2}s",
            ctx.prefix(),
            start.elapsed().as_secs_f64()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{Attachment, Behavior, Verdict};
    use crate::core::expectation::ConsoleExpectation;
    use crate::core::pattern::Pattern;
    use crate::core::poll::{PollRegistry, PollState};
    use crate::core::simulator::SimulatedConsole;
    use crate::core::target::Target;
    use tokio_util::sync::CancellationToken;

    fn setup(dir: &std::path::Path) -> (Arc<SimulatedConsole>, Arc<PollState>) {
        let sim = Arc::new(SimulatedConsole::new(&["serial0"]));
        let target = Arc::new(Target::new("target", "qemu0", "serial0", sim.clone()));
        (sim, PollRegistry::new(dir).get(&target, "serial0"))
    }

    fn text(state: &Arc<PollState>, text: &str, ctx: &str) -> ConsoleExpectation {
        ConsoleExpectation::new(state.clone(), Pattern::literal(text))
            .with_detect_context(ctx)
            .with_poll_period(Duration::from_millis(20))
            .with_timeout(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_nothing_to_expect() {
        let expecter = Expecter::new();
        let err = expecter.expect(&WaitContext::default(), &[]).await.unwrap_err();
        assert!(matches!(err, ExpectError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_only_opportunistic_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let (_sim, state) = setup(dir.path());
        let exp: ExpectationRef = Arc::new(text(&state, "x", "a").with_timeout(Duration::ZERO));
        let err = Expecter::new()
            .expect(&WaitContext::default(), &[exp])
            .await
            .unwrap_err();
        assert!(matches!(err, ExpectError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_expectations_validated_before_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, state) = setup(dir.path());
        let ctx = WaitContext::new("tc", CancellationToken::new());
        let good: ExpectationRef = Arc::new(text(&state, "login:", "a"));
        let bad: ExpectationRef = Arc::new(text(&state, "x", "b").with_lookback(0));

        let err = Expecter::new().expect(&ctx, &[good, bad]).await.unwrap_err();
        match err {
            ExpectError::Invalid(message) => {
                assert!(message.starts_with("tc/"), "{message}");
                assert!(message.contains("lookback must be > 0"), "{message}");
            }
            other => panic!("unexpected {other:?}"),
        }
        // rejected up front, the console was never touched
        assert!(sim.read_offsets("serial0").is_empty());
    }

    #[tokio::test]
    async fn test_registration_order_wins() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, state) = setup(dir.path());
        sim.emit("serial0", b"hello world");
        let later_bytes: ExpectationRef = Arc::new(text(&state, "world", "a").with_name("world"));
        let earlier_bytes: ExpectationRef = Arc::new(text(&state, "hello", "b").with_name("hello"));

        let found = Expecter::new()
            .expect(&WaitContext::default(), &[later_bytes, earlier_bytes])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.index, 0);
        assert!(!found.global);
        assert_eq!(found.name, "world");
        assert_eq!(found.matched.offset_match_start, 6);
    }

    #[tokio::test]
    async fn test_one_read_per_console_per_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, state) = setup(dir.path());
        sim.emit("serial0", b"ready");
        let a: ExpectationRef = Arc::new(text(&state, "nope", "a"));
        let b: ExpectationRef = Arc::new(text(&state, "ready", "b"));

        Expecter::new()
            .expect(&WaitContext::default(), &[a, b])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sim.read_offsets("serial0").len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_return_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let (_sim, state) = setup(dir.path());
        let exp: ExpectationRef = Arc::new(
            text(&state, "never", "a")
                .with_timeout(Duration::from_millis(100))
                .when_timeout(Behavior::Return),
        );
        let found = Expecter::new()
            .expect(&WaitContext::default(), &[exp])
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_shorter_timeout_raises_first() {
        let dir = tempfile::tempdir().unwrap();
        let (_sim, state) = setup(dir.path());
        let short: ExpectationRef = Arc::new(
            text(&state, "never", "a")
                .with_name("short")
                .with_timeout(Duration::from_millis(100))
                .when_timeout(Behavior::Raise(Verdict::Skip)),
        );
        let long: ExpectationRef = Arc::new(
            text(&state, "never", "b").with_timeout(Duration::from_secs(5)),
        );
        let start = std::time::Instant::now();
        let err = Expecter::new()
            .expect(&WaitContext::default(), &[long, short])
            .await
            .unwrap_err();
        assert_eq!(err.verdict(), Some(Verdict::Skip));
        assert!(start.elapsed() < Duration::from_secs(2));
        match err.attachment() {
            Some(Attachment::Timeout(report)) => assert_eq!(report.name, "short"),
            other => panic!("unexpected attachment {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_sleep() {
        let dir = tempfile::tempdir().unwrap();
        let (_sim, state) = setup(dir.path());
        let token = CancellationToken::new();
        let ctx = WaitContext::new("tc", token.clone());
        let exp: ExpectationRef = Arc::new(
            text(&state, "never", "a")
                .with_poll_period(Duration::from_secs(2))
                .with_timeout(Duration::from_secs(10)),
        );

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let start = std::time::Instant::now();
        let err = Expecter::new().expect(&ctx, &[exp]).await.unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(err, ExpectError::Cancelled(_)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_global_watcher_raises() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, state) = setup(dir.path());
        let expecter = Expecter::new();
        let watcher: ExpectationRef = Arc::new(
            text(&state, "Kernel panic", "panic")
                .with_name("kernel panic")
                .with_timeout(Duration::ZERO)
                .when_found(Behavior::Raise(Verdict::Error)),
        );
        assert!(expecter.global_append(watcher.clone(), true));
        assert!(!expecter.global_append(watcher, true));
        assert_eq!(expecter.global_names(), vec!["kernel panic"]);

        sim.emit("serial0", b"Kernel panic - not syncing");
        let exp: ExpectationRef = Arc::new(text(&state, "login:", "a"));
        let err = expecter
            .expect(&WaitContext::default(), &[exp])
            .await
            .unwrap_err();
        assert_eq!(err.verdict(), Some(Verdict::Error));

        assert!(expecter.global_remove("kernel panic"));
        assert!(!expecter.global_remove("kernel panic"));
    }
}
