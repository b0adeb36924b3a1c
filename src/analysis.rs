// SPDX-License-Identifier: MIT
//! Per-connection analysis pipeline: the consumer streams fed by the
//! reassembler, the reader tasks that drain them, and persistence of the
//! reconstructed conversations.

pub mod connection;
pub mod factory;
pub mod harvest;
pub mod persist;
pub mod reader;

pub use connection::{Conversation, TcpConnectionStream};
pub use factory::TcpConnectionFactory;
pub use harvest::{default_harvesters, CredentialHarvester, Credentials};

use std::path::PathBuf;

use crate::config::Config;

/// The subset of the configuration the analysis pipeline carries around.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Root output directory for persisted artifacts.
    pub out: PathBuf,
    /// Capacity of each per-direction byte channel.
    pub byte_channel_capacity: usize,
    /// Accept streams whose SYN was not observed.
    pub allow_missing_init: bool,
    /// Persist the ANSI-colored conversation instead of the raw bytes.
    pub save_colored: bool,
}

impl From<&Config> for AnalysisConfig {
    fn from(cfg: &Config) -> Self {
        AnalysisConfig {
            out: cfg.out.clone(),
            byte_channel_capacity: cfg.byte_channel_capacity.max(1),
            allow_missing_init: cfg.allow_missing_init,
            save_colored: cfg.save_colored,
        }
    }
}
