//! Configuration file for tach.
//!
//! The file lives at `~/.tach/config.toml` (or wherever `TACH_CONFIG`
//! points). Every key is optional:
//!
//! ```toml
//! # Same as -l: no idle refresh of the running timestamp
//! slow = false
//!
//! # Same as -p: plain pipes instead of pseudo-terminals
//! pipes = false
//!
//! # Idle refresh period in milliseconds (~60 Hz)
//! refresh_ms = 17
//!
//! # Gaps at or below this many microseconds use the "fast" style
//! fast_threshold_us = 1000
//!
//! [style]
//! stdout_separator = { r = 200, g = 200, b = 200 }
//! stderr_separator = { r = 255, g = 85, b = 85 }
//! fast = { r = 110, g = 110, b = 110 }
//! ```
//!
//! Command-line flags override the file.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Disable the idle timestamp refresh
    pub slow: bool,
    /// Use pipes instead of pseudo-terminals
    pub pipes: bool,
    /// Idle refresh period
    pub refresh_ms: u64,
    /// Upper bound of a "fast" line gap
    pub fast_threshold_us: u64,
    /// Separator and timestamp colors
    pub style: StyleConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slow: false,
            pipes: false,
            refresh_ms: 17,
            fast_threshold_us: 1000,
            style: StyleConfig::default(),
        }
    }
}

/// Color overrides. Unset entries keep the terminal's own palette colors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleConfig {
    pub stdout_separator: Option<Color>,
    pub stderr_separator: Option<Color>,
    pub fast: Option<Color>,
}

impl Config {
    /// Load configuration from file, falling back to defaults
    pub fn load() -> Self {
        let Some(path) = Self::get_config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match Self::parse(&content) {
                Ok(config) => {
                    debug!(path = %path.display(), "loaded config");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring invalid config");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read config");
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Get config file path
    fn get_config_path() -> Option<PathBuf> {
        if let Some(path) = env::var_os("TACH_CONFIG") {
            return Some(PathBuf::from(path));
        }
        home_dir().map(|home| home.join(".tach").join("config.toml"))
    }

    pub fn refresh(&self) -> Duration {
        Duration::from_millis(self.refresh_ms.max(1))
    }

    pub fn fast_threshold(&self) -> Duration {
        Duration::from_micros(self.fast_threshold_us)
    }
}

/// Color definition (RGB)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    #[cfg(test)]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Convert to crossterm Color
    pub fn to_crossterm(self) -> crossterm::style::Color {
        crossterm::style::Color::Rgb {
            r: self.r,
            g: self.g,
            b: self.b,
        }
    }
}

// Get home directory
pub fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME").map(PathBuf::from)
}
