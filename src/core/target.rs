//! Targets under test and console writes

use super::error::ExpectError;
use super::remote::ConsoleRemote;
use crate::config::ConsoleSettings;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A device under test, addressed by the role it plays in the test
/// case and its id in the lab
pub struct Target {
    role: String,
    id: String,
    default_console: String,
    remote: Arc<dyn ConsoleRemote>,
    consoles: HashMap<String, ConsoleSettings>,
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("role", &self.role)
            .field("id", &self.id)
            .field("default_console", &self.default_console)
            .finish_non_exhaustive()
    }
}

impl Target {
    /// Create a new target
    pub fn new(
        role: &str,
        id: &str,
        default_console: &str,
        remote: Arc<dyn ConsoleRemote>,
    ) -> Self {
        Self {
            role: role.to_string(),
            id: id.to_string(),
            default_console: default_console.to_string(),
            remote,
            consoles: HashMap::new(),
        }
    }

    /// Set console specific settings
    #[must_use]
    pub fn with_console_settings(mut self, console: &str, settings: ConsoleSettings) -> Self {
        self.consoles.insert(console.to_string(), settings);
        self
    }

    /// Role name in the test case
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Lab id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// `role:id`, used in messages
    pub fn full_id(&self) -> String {
        format!("{}:{}", self.role, self.id)
    }

    /// Remote console access
    pub fn remote(&self) -> &Arc<dyn ConsoleRemote> {
        &self.remote
    }

    /// Resolve an optional console name to a real one
    pub fn console_name<'a>(&'a self, console: Option<&'a str>) -> &'a str {
        console.unwrap_or(&self.default_console)
    }

    /// Settings for a console
    pub fn console_settings(&self, console: &str) -> ConsoleSettings {
        self.consoles.get(console).cloned().unwrap_or_default()
    }

    /// Key shared by everything reading this console
    pub fn poll_key(&self, console: &str) -> String {
        format!("console-{}.{}.{}", self.role, self.id, console)
    }

    /// Write raw bytes to a console, no end of line conversion
    ///
    /// When the console has a chunk size configured, the data is sent
    /// in chunks with the configured wait in between.
    pub async fn write(&self, console: &str, data: &[u8]) -> Result<(), ExpectError> {
        let settings = self.console_settings(console);
        tracing::debug!("{}: writing {}B to console {}", self.full_id(), data.len(), console);

        let chunk_size = settings.chunk_size.unwrap_or(data.len()).max(1);
        let wait = settings.interchunk_wait();
        let mut sent = 0usize;
        for (index, chunk) in data.chunks(chunk_size).enumerate() {
            if index > 0 {
                if let Some(wait) = wait {
                    tokio::time::sleep(wait).await;
                }
            }
            self.remote
                .write(console, chunk)
                .await
                .map_err(|e| ExpectError::remote(&self.poll_key(console), sent as u64, &e))?;
            sent += chunk.len();
        }

        tracing::debug!(
            "{}: wrote {}B ({}) to console {}",
            self.full_id(),
            data.len(),
            printable_preview(data),
            console
        );
        Ok(())
    }

    /// Write text followed by the console's end of line sequence
    pub async fn send(&self, console: &str, text: &str) -> Result<(), ExpectError> {
        let settings = self.console_settings(console);
        let mut data = Vec::with_capacity(text.len() + 2);
        data.extend_from_slice(text.as_bytes());
        data.extend_from_slice(settings.crlf().as_bytes());
        self.write(console, &data).await
    }
}

/// Shorten and make newlines visible for log messages
fn printable_preview(data: &[u8]) -> String {
    const MAX: usize = 50;
    let text = String::from_utf8_lossy(&data[..data.len().min(MAX)]);
    let mut preview = text.replace('\r', "<CR>").replace('\n', "<NL>");
    if data.len() > MAX {
        preview.push_str("...");
    }
    preview
}
