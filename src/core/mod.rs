//! Core module containing the expectation engine
//!
//! This module provides:
//! - Remote console access and targets
//! - Local console captures shared per (target, console)
//! - Polling with generation tracking
//! - Expectations and the wait coordinator
//! - Shell command typing with echo verification and fixups
//! - Recovered condition KPIs
//! - A simulated console for tests

pub mod capture;
pub mod context;
pub mod error;
pub mod expectation;
pub mod expecter;
pub mod kpi;
pub mod pattern;
pub mod poll;
pub mod remote;
pub mod shell;
pub mod simulator;
pub mod target;
pub mod testcase;

pub use capture::CaptureSlice;
pub use context::WaitContext;
pub use error::{Attachment, Behavior, ExpectError, RemoteFault, TimeoutReport, Verdict};
pub use expectation::{ConsoleExpectation, Expectation, Match, ReportWindow};
pub use expecter::{ExpectationRef, Expecter, Found};
pub use kpi::RecoveredConditions;
pub use pattern::Pattern;
pub use poll::{PollRegistry, PollState, SearchCursor};
pub use remote::{ConsoleRemote, ReadChunk, RemoteError};
pub use shell::{RunOptions, RunOutput, Shell, UpOptions};
pub use simulator::SimulatedConsole;
pub use target::Target;
pub use testcase::Testcase;
