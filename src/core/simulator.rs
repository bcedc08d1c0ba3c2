//! Simulated Console Remote
//!
//! In-memory, scriptable implementation of [`ConsoleRemote`] for tests
//! and benchmarks. Each console is a byte stream with a generation that
//! bumps on power cycles. Writes can be answered by response rules
//! (echo, canned output) and reads can be made to fail.

use super::remote::{ConsoleRemote, ReadChunk, RemoteError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Condition a write has to meet for a rule to fire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MatchCondition {
    /// Write is exactly these bytes
    Exact { bytes: Vec<u8> },
    /// Write starts with these bytes
    Prefix { bytes: Vec<u8> },
    /// Write contains this text
    Text { text: String },
    /// Write matches this regex
    Regex { pattern: String },
    /// Any write
    Any,
}

impl MatchCondition {
    /// Check if a write matches this condition
    pub fn matches(&self, data: &[u8]) -> bool {
        match self {
            Self::Exact { bytes } => data == bytes.as_slice(),
            Self::Prefix { bytes } => data.starts_with(bytes),
            Self::Text { text } => {
                let needle = text.as_bytes();
                !needle.is_empty() && data.windows(needle.len()).any(|w| w == needle)
            }
            Self::Regex { pattern } => Regex::new(pattern)
                .map(|re| re.is_match(data))
                .unwrap_or(false),
            Self::Any => true,
        }
    }
}

/// What the console outputs in response to a write
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResponseAction {
    /// Output the written bytes
    Echo,
    /// Output fixed bytes
    Send { data: Vec<u8> },
    /// Output text
    SendText { text: String },
    /// Several actions in order
    Sequence(Vec<ResponseAction>),
    /// Output nothing
    None,
}

impl ResponseAction {
    fn render(&self, written: &[u8], out: &mut Vec<u8>) {
        match self {
            Self::Echo => out.extend_from_slice(written),
            Self::Send { data } => out.extend_from_slice(data),
            Self::SendText { text } => out.extend_from_slice(text.as_bytes()),
            Self::Sequence(actions) => {
                for action in actions {
                    action.render(written, out);
                }
            }
            Self::None => {}
        }
    }
}

/// Response rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRule {
    /// Rule name
    pub name: String,
    /// Match condition
    pub condition: MatchCondition,
    /// Response action
    pub action: ResponseAction,
    /// One-shot (disable after first match)
    pub one_shot: bool,
    /// Match count
    #[serde(default)]
    pub match_count: u64,
}

impl ResponseRule {
    /// Echo every write
    pub fn echo(name: &str) -> Self {
        Self {
            name: name.to_string(),
            condition: MatchCondition::Any,
            action: ResponseAction::Echo,
            one_shot: false,
            match_count: 0,
        }
    }

    /// Answer writes starting with `prefix` with `response`
    pub fn on_prefix(name: &str, prefix: &[u8], response: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            condition: MatchCondition::Prefix {
                bytes: prefix.to_vec(),
            },
            action: ResponseAction::Send {
                data: response.to_vec(),
            },
            one_shot: false,
            match_count: 0,
        }
    }

    /// Set one-shot mode
    #[must_use]
    pub fn one_shot(mut self, value: bool) -> Self {
        self.one_shot = value;
        self
    }

    fn is_live(&self) -> bool {
        !(self.one_shot && self.match_count > 0)
    }
}

#[derive(Debug)]
struct SimStream {
    generation: u64,
    data: Vec<u8>,
    enabled: bool,
    rules: Vec<ResponseRule>,
    failing_reads: u32,
    failing_writes: u32,
    read_offsets: Vec<u64>,
    writes: Vec<Vec<u8>>,
}

impl SimStream {
    fn new() -> Self {
        Self {
            generation: 1,
            data: Vec::new(),
            enabled: true,
            rules: Vec::new(),
            failing_reads: 0,
            failing_writes: 0,
            read_offsets: Vec::new(),
            writes: Vec::new(),
        }
    }
}

/// Simulated target console server
#[derive(Debug)]
pub struct SimulatedConsole {
    streams: Mutex<HashMap<String, SimStream>>,
}

impl SimulatedConsole {
    /// Simulator with the given consoles, all at generation 1
    pub fn new(consoles: &[&str]) -> Self {
        Self {
            streams: Mutex::new(
                consoles
                    .iter()
                    .map(|name| ((*name).to_string(), SimStream::new()))
                    .collect(),
            ),
        }
    }

    fn with_stream<R>(&self, console: &str, f: impl FnOnce(&mut SimStream) -> R) -> R {
        let mut streams = self.streams.lock();
        let stream = streams
            .entry(console.to_string())
            .or_insert_with(SimStream::new);
        f(stream)
    }

    /// Target prints `data` on the console
    pub fn emit(&self, console: &str, data: &[u8]) {
        self.with_stream(console, |s| s.data.extend_from_slice(data));
    }

    /// Console is reset: new generation, empty stream
    pub fn power_cycle(&self, console: &str) {
        self.with_stream(console, |s| {
            s.generation += 1;
            s.data.clear();
        });
    }

    /// Enable or disable a console; disabled consoles report no size
    pub fn set_enabled(&self, console: &str, enabled: bool) {
        self.with_stream(console, |s| s.enabled = enabled);
    }

    /// Add a response rule; rules are checked in insertion order
    pub fn add_rule(&self, console: &str, rule: ResponseRule) {
        self.with_stream(console, |s| s.rules.push(rule));
    }

    /// Make the next `count` reads fail
    pub fn fail_reads(&self, console: &str, count: u32) {
        self.with_stream(console, |s| s.failing_reads = count);
    }

    /// Make the next `count` writes fail
    pub fn fail_writes(&self, console: &str, count: u32) {
        self.with_stream(console, |s| s.failing_writes = count);
    }

    /// Offsets reads were requested at, in order
    pub fn read_offsets(&self, console: &str) -> Vec<u64> {
        self.with_stream(console, |s| s.read_offsets.clone())
    }

    /// Writes received, in order
    pub fn writes(&self, console: &str) -> Vec<Vec<u8>> {
        self.with_stream(console, |s| s.writes.clone())
    }

    /// Current generation
    pub fn generation(&self, console: &str) -> u64 {
        self.with_stream(console, |s| s.generation)
    }

    /// How many times a rule fired
    pub fn rule_matches(&self, console: &str, rule: &str) -> u64 {
        self.with_stream(console, |s| {
            s.rules
                .iter()
                .filter(|r| r.name == rule)
                .map(|r| r.match_count)
                .sum()
        })
    }
}

#[async_trait]
impl ConsoleRemote for SimulatedConsole {
    async fn read(&self, console: &str, offset: u64) -> Result<ReadChunk, RemoteError> {
        self.with_stream(console, |s| {
            s.read_offsets.push(offset);
            if s.failing_reads > 0 {
                s.failing_reads -= 1;
                return Err(RemoteError::ReceiveError(format!(
                    "simulated read failure on {console}"
                )));
            }
            let len = s.data.len() as u64;
            let data = if offset < len {
                Bytes::copy_from_slice(&s.data[offset as usize..])
            } else {
                Bytes::new()
            };
            Ok(ReadChunk {
                generation: s.generation,
                new_offset: len,
                data,
            })
        })
    }

    async fn write(&self, console: &str, data: &[u8]) -> Result<(), RemoteError> {
        self.with_stream(console, |s| {
            if s.failing_writes > 0 {
                s.failing_writes -= 1;
                return Err(RemoteError::SendError(format!(
                    "simulated write failure on {console}"
                )));
            }
            s.writes.push(data.to_vec());
            let mut output = Vec::new();
            if let Some(rule) = s
                .rules
                .iter_mut()
                .find(|r| r.is_live() && r.condition.matches(data))
            {
                rule.match_count += 1;
                rule.action.render(data, &mut output);
            }
            s.data.extend_from_slice(&output);
            Ok(())
        })
    }

    async fn size(&self, console: &str) -> Result<Option<u64>, RemoteError> {
        Ok(self.with_stream(console, |s| s.enabled.then_some(s.data.len() as u64)))
    }

    fn consoles(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.lock().keys().cloned().collect();
        names.sort();
        names
    }
}
