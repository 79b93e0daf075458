//! Configuration module for httptap
//!
//! This module handles loading and validating configuration from files and
//! command line arguments.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("malformed config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid capture settings: {0}")]
    Invalid(String),
}

/// Main configuration structure for httptap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapConfig {
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

/// Capture parameters consumed by the core pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Interface to capture on; empty means the host default device.
    #[serde(default)]
    pub interface: String,
    /// TCP ports to observe. Must be non-empty.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Fraction of connections to track, in [0, 1]. 1 disables sampling.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    /// Maximum stored body size per message, in bytes.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// Hard cap on tracked connections.
    #[serde(default = "default_max_connections")]
    pub max_concurrent_connections: usize,
    /// Idle eviction threshold, in milliseconds.
    #[serde(default = "default_idle_timeout_ms")]
    pub connection_idle_timeout_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Output sink configuration for the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    /// JSONL destination file; absent means stdout.
    #[serde(default)]
    pub file: Option<String>,
}

fn default_sample_rate() -> f64 {
    1.0
}

fn default_max_body_size() -> usize {
    1_048_576
}

fn default_max_connections() -> usize {
    10_000
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interface: String::new(),
            ports: Vec::new(),
            sample_rate: default_sample_rate(),
            max_body_size: default_max_body_size(),
            max_concurrent_connections: default_max_connections(),
            connection_idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self { file: None }
    }
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            capture: CaptureSettings::default(),
            logging: LoggingSettings::default(),
            output: OutputSettings::default(),
        }
    }
}

impl TapConfig {
    /// Load configuration from a TOML file.
    ///
    /// The loaded file must be valid on its own; a file relying on CLI
    /// overrides for required fields (such as `ports`) is rejected here.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: TapConfig = toml::from_str(&config_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.capture.validate()
    }
}

impl CaptureSettings {
    /// Validate capture parameters before they reach the core.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.is_empty() {
            return Err(ConfigError::Invalid(
                "ports: at least one capture port is required".to_string(),
            ));
        }
        if self.ports.iter().any(|&p| p == 0) {
            return Err(ConfigError::Invalid(
                "ports: 0 is not a valid port".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(ConfigError::Invalid(format!(
                "sample_rate: {} is outside [0, 1]",
                self.sample_rate
            )));
        }
        if self.max_body_size == 0 {
            return Err(ConfigError::Invalid(
                "max_body_size: must be positive".to_string(),
            ));
        }
        if self.max_concurrent_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_connections: must be positive".to_string(),
            ));
        }
        if self.connection_idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "connection_idle_timeout_ms: must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_settings() -> CaptureSettings {
        CaptureSettings {
            ports: vec![8080],
            ..CaptureSettings::default()
        }
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let settings = CaptureSettings::default();
        assert_eq!(settings.sample_rate, 1.0);
        assert_eq!(settings.max_body_size, 1_048_576);
        assert_eq!(settings.max_concurrent_connections, 10_000);
        assert_eq!(settings.connection_idle_timeout_ms, 300_000);
    }

    #[test]
    fn test_validate_rejects_empty_ports() {
        let settings = CaptureSettings::default();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_port_zero() {
        let mut settings = valid_settings();
        settings.ports.push(0);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_sample_rate() {
        let mut settings = valid_settings();
        settings.sample_rate = 1.5;
        assert!(settings.validate().is_err());
        settings.sample_rate = -0.1;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_good_settings() {
        assert!(valid_settings().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TapConfig = toml::from_str(
            r#"
            [capture]
            ports = [80, 8080]
            "#,
        )
        .unwrap();
        assert_eq!(config.capture.ports, vec![80, 8080]);
        assert_eq!(config.capture.max_body_size, 1_048_576);
        assert_eq!(config.logging.log_level, "info");
        assert!(config.validate().is_ok());
    }
}
