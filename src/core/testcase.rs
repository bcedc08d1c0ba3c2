//! Test case scope
//!
//! A [`Testcase`] ties together everything the waits of one test case
//! share: the poll states of the consoles it touches, its global
//! watchers, its recovered-condition KPIs and its cancellation signal.
//! It is a cheap handle; clones share the same state so it can be
//! handed to concurrent tasks driving different targets.

use super::context::WaitContext;
use super::error::ExpectError;
use super::expectation::ConsoleExpectation;
use super::expecter::{ExpectationRef, Expecter, Found};
use super::kpi::RecoveredConditions;
use super::pattern::Pattern;
use super::poll::{PollRegistry, PollState, SearchCursor};
use super::remote::ConsoleRemote;
use super::shell::Shell;
use super::target::Target;
use crate::config::AppConfig;
use futures::future::join_all;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Length of the random id embedded in shell prompts
pub const HASH_ID_LEN: usize = 6;

#[derive(Debug)]
struct Inner {
    name: String,
    hash_id: String,
    config: AppConfig,
    registry: PollRegistry,
    expecter: Expecter,
    recovered: Arc<RecoveredConditions>,
    cancel: CancellationToken,
}

/// Shared state of one test case
#[derive(Debug, Clone)]
pub struct Testcase {
    inner: Arc<Inner>,
}

impl Testcase {
    /// New test case; creates the capture directory
    pub fn new(name: &str, config: AppConfig) -> Result<Self, ExpectError> {
        let hash_id: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(HASH_ID_LEN)
            .collect();
        let capture_dir = config
            .capture_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(format!("tcf-{hash_id}")));
        std::fs::create_dir_all(&capture_dir).map_err(|e| {
            ExpectError::blocked(format!(
                "{name}: cannot create capture directory {}: {e}",
                capture_dir.display()
            ))
        })?;
        tracing::debug!(
            "{}: test case {} capturing to {}",
            name,
            hash_id,
            capture_dir.display()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                hash_id,
                registry: PollRegistry::new(&capture_dir),
                config,
                expecter: Expecter::new(),
                recovered: Arc::new(RecoveredConditions::new()),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Test case name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Random id of this run
    pub fn hash_id(&self) -> &str {
        &self.inner.hash_id
    }

    /// Configuration in use
    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    /// Where console captures are written
    pub fn capture_dir(&self) -> &Path {
        self.inner.registry.capture_dir()
    }

    /// Root wait context, carrying this test case's cancellation
    pub fn context(&self) -> WaitContext {
        WaitContext::new(&self.inner.name, self.inner.cancel.clone())
    }

    /// Abort every wait of this test case
    pub fn cancel(&self) {
        tracing::info!("{}: cancelling", self.inner.name);
        self.inner.cancel.cancel();
    }

    /// Whether [`Testcase::cancel`] was called
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Recovered conditions seen so far
    pub fn recovered(&self) -> &Arc<RecoveredConditions> {
        &self.inner.recovered
    }

    /// Target with the configured console settings applied
    pub fn target(
        &self,
        role: &str,
        id: &str,
        default_console: &str,
        remote: Arc<dyn ConsoleRemote>,
    ) -> Arc<Target> {
        let target = self
            .inner
            .config
            .consoles
            .iter()
            .fold(Target::new(role, id, default_console, remote), |target, (name, settings)| {
                target.with_console_settings(name, settings.clone())
            });
        Arc::new(target)
    }

    /// Shared poll state of a console; `None` is the default console
    pub fn console(&self, target: &Arc<Target>, console: Option<&str>) -> Arc<PollState> {
        self.inner.registry.get(target, target.console_name(console))
    }

    /// Expectation for `pattern` on a console, with configured defaults
    pub fn text(
        &self,
        target: &Arc<Target>,
        console: Option<&str>,
        pattern: Pattern,
    ) -> ConsoleExpectation {
        ConsoleExpectation::with_settings(
            self.console(target, console),
            pattern,
            &self.inner.config.expect,
        )
    }

    /// Wait for any of `expectations` or a global watcher
    pub async fn expect(
        &self,
        ctx: &WaitContext,
        expectations: &[ExpectationRef],
    ) -> Result<Option<Found>, ExpectError> {
        self.inner.expecter.expect(ctx, expectations).await
    }

    /// Add a watcher checked in every wait of this test case
    pub fn expect_global_append(&self, expectation: ExpectationRef, skip_duplicate: bool) -> bool {
        let added = self.inner.expecter.global_append(expectation, skip_duplicate);
        if !added {
            tracing::debug!("{}: global watcher already registered", self.inner.name);
        }
        added
    }

    /// Remove global watchers by name
    pub fn expect_global_remove(&self, name: &str) -> bool {
        self.inner.expecter.global_remove(name)
    }

    /// Names of the global watchers
    pub fn expect_global_names(&self) -> Vec<String> {
        self.inner.expecter.global_names()
    }

    /// Make the next wait in `detect_context` only see output captured
    /// from now on
    ///
    /// Call before sending something whose response is to be expected.
    /// `None` is the console's own detection context.
    pub fn send_expect_sync(
        &self,
        target: &Arc<Target>,
        console: Option<&str>,
        detect_context: Option<&str>,
    ) -> SearchCursor {
        let state = self.console(target, console);
        let detect_context = detect_context.unwrap_or(state.console()).to_string();
        state.sync_to_end(&detect_context)
    }

    /// Pull whatever the remote already has into the local captures
    ///
    /// Polls twice so data that arrived while the first poll ran is also
    /// picked up. With `target`, only its consoles are completed.
    pub async fn capture_complete(
        &self,
        ctx: &WaitContext,
        target: Option<&Arc<Target>>,
    ) -> Result<(), ExpectError> {
        let lookback = self.inner.config.expect.lookback_bytes;
        let states: Vec<Arc<PollState>> = self
            .inner
            .registry
            .states()
            .into_iter()
            .filter(|state| target.map_or(true, |t| Arc::ptr_eq(state.target(), t)))
            .collect();
        for _ in 0..2 {
            let results = join_all(states.iter().map(|state| state.poll(ctx, lookback))).await;
            for result in results {
                result?;
            }
        }
        Ok(())
    }

    /// Shell on a console of a target
    pub fn shell(&self, target: &Arc<Target>, console: Option<&str>) -> Result<Shell, ExpectError> {
        Shell::new(self.clone(), target.clone(), console)
    }

    /// Complete the captures and release the poll states
    ///
    /// Capture files stay on disk for post-mortem analysis.
    pub async fn teardown(&self, ctx: &WaitContext) -> Result<(), ExpectError> {
        let result = self.capture_complete(ctx, None).await;
        for state in self.inner.registry.states() {
            tracing::info!(
                "{}: console {}:{} captured {}B to {}",
                ctx.prefix(),
                state.target().full_id(),
                state.console(),
                state.captured_len(),
                state.capture_path().display()
            );
        }
        for (condition, count) in self.inner.recovered.counts() {
            tracing::info!("{}: recovered conditions [{}]: {}", ctx.prefix(), condition, count);
        }
        self.inner.registry.clear();
        result
    }
}
