//! # TCF Console Expectation Engine
//!
//! Waits for things to show up on the consoles of targets under test:
//! - Local, append-only captures of remote consoles, one per
//!   (target, console), shared by every waiter
//! - Console resets detected through stream generations
//! - Independent search cursors ("detection contexts") over one capture
//! - A wait coordinator with timeouts, global watchers and cancellation
//! - Shell commands typed with echo verification, recovering from
//!   messages that interrupt them
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tcf_expect::{AppConfig, ExpectationRef, Pattern, SimulatedConsole, Testcase};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let tc = Testcase::new("boot", AppConfig::default())?;
//!     let remote = Arc::new(SimulatedConsole::new(&["serial0"]));
//!     let target = tc.target("target", "qemu0", "serial0", remote);
//!
//!     let login: ExpectationRef = Arc::new(
//!         tc.text(&target, None, Pattern::literal("login: "))
//!             .with_timeout(Duration::from_secs(60)),
//!     );
//!     let found = tc.expect(&tc.context(), &[login]).await?;
//!     println!("{:?}", found.map(|f| f.matched.offset_match_end));
//!
//!     tc.teardown(&tc.context()).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod core;
pub mod utils;

// Re-exports for convenience
pub use crate::config::{AppConfig, ConfigError, ConsoleSettings, LogFormat, LoggingConfig};
pub use crate::core::error::{Attachment, Behavior, ExpectError, Verdict};
pub use crate::core::expectation::{ConsoleExpectation, Expectation, Match, ReportWindow};
pub use crate::core::expecter::{ExpectationRef, Expecter, Found};
pub use crate::core::pattern::Pattern;
pub use crate::core::remote::{ConsoleRemote, ReadChunk, RemoteError};
pub use crate::core::shell::{RunOptions, RunOutput, Shell, UpOptions};
pub use crate::core::simulator::SimulatedConsole;
pub use crate::core::target::Target;
pub use crate::core::testcase::Testcase;
pub use crate::core::context::WaitContext;
pub use crate::utils::init_tracing;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
