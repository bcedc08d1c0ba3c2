//! Configuration module
//!
//! Handles engine defaults, console settings and shell fixups

mod settings;

pub use settings::{
    AppConfig, ConfigError, ConsoleSettings, ExpectSettings, LogFormat, LoggingConfig,
    ShellSettings,
};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("org", "tcf", "tcf-expect").map(|dirs| dirs.config_dir().to_path_buf())
}

