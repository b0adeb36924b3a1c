// SPDX-License-Identifier: MIT
//! Structs used to configure `analyze_pcap` and the `tcpasm` command line
//! application in general.
//!
//! Typically instantiated using `serde_yaml`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

const DEFAULT_CONFIG_STR: &str = include_str!("../etc/example-config.yml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for persisted artifacts.
    #[serde(default = "default_out")]
    pub out: PathBuf,

    /// Verbose per-segment assembler tracing.
    #[serde(default)]
    pub tcp_debug: bool,

    /// Track streams whose SYN was not captured.
    #[serde(default)]
    pub allow_missing_init: bool,

    /// Persist the ANSI-colored conversation instead of the raw bytes.
    #[serde(default)]
    pub save_colored: bool,

    /// Capacity of each per-direction byte channel.
    #[serde(default = "default_byte_channel_capacity")]
    pub byte_channel_capacity: usize,

    /// Pages buffered per connection before forced delivery. 0 = unlimited.
    #[serde(default)]
    pub max_buffered_pages_per_connection: usize,

    /// Pages buffered across all connections before forced delivery.
    /// 0 = unlimited.
    #[serde(default)]
    pub max_buffered_pages_total: usize,

    /// How much capture time passes between flush sweeps.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,

    /// Idle time after which a drained connection is closed.
    #[serde(default = "default_close_older_than")]
    pub close_older_than: String,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_out() -> PathBuf {
    PathBuf::from("./out")
}

fn default_byte_channel_capacity() -> usize {
    100
}

fn default_flush_interval() -> String {
    "10s".to_string()
}

fn default_close_older_than() -> String {
    "30s".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_yaml_str(&contents),
            Err(e) => {
                warn!("could not open config ({e}), using default config");
                Self::from_yaml_str(DEFAULT_CONFIG_STR)
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.byte_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "byte_channel_capacity must be at least 1".into(),
            ));
        }
        if let Err(e) = parse_duration(&self.flush_interval) {
            return Err(ConfigError::Invalid(format!("Invalid flush interval: {e}")));
        }
        if let Err(e) = parse_duration(&self.close_older_than) {
            return Err(ConfigError::Invalid(format!(
                "Invalid close threshold: {e}"
            )));
        }
        Ok(())
    }

    pub fn get_flush_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.flush_interval)
            .map_err(|e| ConfigError::Invalid(format!("Failed to parse flush interval: {e}")))
    }

    pub fn get_close_older_than(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.close_older_than)
            .map_err(|e| ConfigError::Invalid(format!("Failed to parse close threshold: {e}")))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_yaml_str(DEFAULT_CONFIG_STR).expect("example config must parse")
    }
}

pub fn parse_duration(duration_str: &str) -> Result<Duration, ConfigError> {
    let mut s = duration_str.to_string();
    if s.ends_with("ms") {
        s.truncate(s.len() - 2);
        Ok(Duration::from_millis(s.parse::<u64>().map_err(|e| {
            ConfigError::Invalid(format!("Invalid milliseconds value: {e}"))
        })?))
    } else if s.ends_with('s') {
        s.truncate(s.len() - 1);
        Ok(Duration::from_secs(s.parse::<u64>().map_err(|e| {
            ConfigError::Invalid(format!("Invalid seconds value: {e}"))
        })?))
    } else if s.ends_with('m') {
        s.truncate(s.len() - 1);
        Ok(Duration::from_secs(
            s.parse::<u64>()
                .map_err(|e| ConfigError::Invalid(format!("Invalid minutes value: {e}")))?
                * 60,
        ))
    } else if s.ends_with('h') {
        s.truncate(s.len() - 1);
        Ok(Duration::from_secs(
            s.parse::<u64>()
                .map_err(|e| ConfigError::Invalid(format!("Invalid hours value: {e}")))?
                * 3600,
        ))
    } else {
        Err(ConfigError::Invalid(format!(
            "invalid suffix in duration: {duration_str}"
        )))
    }
}

#[cfg(test)]
mod test {
    use super::{parse_duration, Config};
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let res = Config::from_file("/nonexistent_file_path");

        match res {
            Ok(cfg) => {
                assert_eq!(cfg.byte_channel_capacity, 100);
                assert_eq!(cfg.max_buffered_pages_total, 0);
            }
            Err(e) => {
                eprintln!("{e}");
                panic!("could not parse default config")
            }
        };
    }

    #[test]
    fn test_parse_duration_suffixes() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("xs").is_err());
    }

    #[test]
    fn test_rejects_zero_channel_capacity() {
        let yaml = "byte_channel_capacity: 0\n";
        assert!(Config::from_yaml_str(yaml).is_err());
    }
}
