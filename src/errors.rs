// SPDX-License-Identifier: MIT
//! Common `Error` and `Result` types used throughout the library and
//! application. The reassembler's own entry points never fail; these cover
//! the fallible edges (configuration, capture files, persistence).

use crate::config::ConfigError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] ConfigError),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("capture parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, Error>;
