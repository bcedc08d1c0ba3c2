//! Remote console access
//!
//! The expectation engine never talks to a target server directly; it
//! goes through a [`ConsoleRemote`], which exposes a target's consoles as
//! offset-addressed byte streams that restart (bump their generation)
//! whenever the console is reset.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Remote console error types
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Connection to the target server failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Request timed out
    #[error("Request timeout after {0} seconds")]
    Timeout(u64),

    /// Console does not exist in the target
    #[error("Console not found: {0}")]
    ConsoleNotFound(String),

    /// Console exists but is disabled
    #[error("Console disabled: {0}")]
    ConsoleDisabled(String),

    /// Server answered something we cannot interpret
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Send error
    #[error("Send error: {0}")]
    SendError(String),

    /// Receive error
    #[error("Receive error: {0}")]
    ReceiveError(String),
}

/// Result of reading a console from an offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadChunk {
    /// Stream generation the data belongs to
    pub generation: u64,
    /// Offset right after the last byte in `data`
    pub new_offset: u64,
    /// Bytes available at `[offset, new_offset)`
    pub data: Bytes,
}

/// Remote console operations the engine consumes
#[async_trait]
pub trait ConsoleRemote: Send + Sync {
    /// Read everything available in `console` from `offset`
    ///
    /// If the console was reset since the generation the caller knows,
    /// the returned generation is higher and the caller has to restart
    /// reading at offset zero.
    async fn read(&self, console: &str, offset: u64) -> Result<ReadChunk, RemoteError>;

    /// Write bytes to `console`, fire and forget
    async fn write(&self, console: &str, data: &[u8]) -> Result<(), RemoteError>;

    /// Current size of the console stream; `None` if disabled
    async fn size(&self, console: &str) -> Result<Option<u64>, RemoteError>;

    /// Consoles this remote exposes
    fn consoles(&self) -> Vec<String> {
        Vec::new()
    }
}
