//! Engine settings, console settings and shell fixups

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Could not read or write the file
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// TOML did not parse
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML did not serialize
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Values out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// No configuration directory on this platform
    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Expectation defaults
    pub expect: ExpectSettings,
    /// Shell layer settings
    pub shell: ShellSettings,
    /// Per console settings, by console name
    pub consoles: HashMap<String, ConsoleSettings>,
    /// Logging settings
    pub logging: LoggingConfig,
    /// Where console captures are written; a per test case
    /// temporary directory when unset
    pub capture_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Default config file location
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        super::config_dir()
            .map(|dir| dir.join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load config from file; defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.expect.poll_period_ms == 0 {
            return Err(ConfigError::Invalid("expect.poll_period_ms must be > 0".into()));
        }
        if self.expect.timeout_ms == 0 {
            return Err(ConfigError::Invalid("expect.timeout_ms must be > 0".into()));
        }
        if self.expect.lookback_bytes == 0 {
            return Err(ConfigError::Invalid("expect.lookback_bytes must be > 0".into()));
        }
        if self.shell.echo_timeout_ms == 0 {
            return Err(ConfigError::Invalid("shell.echo_timeout_ms must be > 0".into()));
        }
        for (name, console) in &self.consoles {
            if console.chunk_size == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "consoles.{name}.chunk_size must be > 0"
                )));
            }
        }
        Ok(())
    }

    /// Settings for a console, defaults if not configured
    pub fn console(&self, name: &str) -> ConsoleSettings {
        self.consoles.get(name).cloned().unwrap_or_default()
    }
}

/// Defaults applied to new expectations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpectSettings {
    /// Time between polls of a console
    pub poll_period_ms: u64,
    /// How long to wait for a pattern
    pub timeout_ms: u64,
    /// How much console history to pull in when a capture starts
    pub lookback_bytes: u64,
}

impl Default for ExpectSettings {
    fn default() -> Self {
        Self {
            poll_period_ms: 250,
            timeout_ms: 30_000,
            lookback_bytes: 4096,
        }
    }
}

impl ExpectSettings {
    /// Poll period as a duration
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }

    /// Timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Shell layer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellSettings {
    /// How long to wait for a typed command to be echoed
    pub echo_timeout_ms: u64,
    /// Fixups by shell context name, then fixup name, to regex
    ///
    /// ```toml
    /// [shell.fixups."iPXE booting"]
    /// dhcp = "Configuring \\(net0 [0-9a-f:]+\\)"
    /// ```
    pub fixups: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            echo_timeout_ms: 10_000,
            fixups: BTreeMap::new(),
        }
    }
}

impl ShellSettings {
    /// Echo timeout as a duration
    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms)
    }
}

/// Per console settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleSettings {
    /// End of line sequence appended when sending lines
    pub crlf: Option<String>,
    /// Break writes into chunks of this many bytes
    pub chunk_size: Option<usize>,
    /// Wait between chunks
    pub interchunk_wait_ms: Option<u64>,
}

impl ConsoleSettings {
    /// End of line sequence, `\n` if not configured
    pub fn crlf(&self) -> &str {
        self.crlf.as_deref().unwrap_or("\n")
    }

    /// Wait between chunks as a duration
    pub fn interchunk_wait(&self) -> Option<Duration> {
        self.interchunk_wait_ms.map(Duration::from_millis)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable
    #[default]
    Text,
    /// JSON lines
    Json,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`info`, `tcf_expect=debug`, ...)
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}
