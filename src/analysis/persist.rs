// SPDX-License-Identifier: MIT
//! Writes reconstructed conversations, per-direction streams, and credential
//! records under the output directory. I/O failures are logged by the
//! callers and never reach the assembler.

use std::fs::{DirBuilder, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::analysis::connection::Conversation;
use crate::analysis::harvest::{CredentialHarvester, Credentials};
use crate::analysis::AnalysisConfig;
use crate::errors::Result;
use crate::metrics;
use crate::reassembly::ReassemblyStats;
use crate::services;
use crate::util::sanitize_ident;

/// Directory mode for everything written below the output root.
#[cfg(unix)]
const DIR_MODE: u32 = 0o700;

/// Persists a finished conversation: runs the harvesters over the raw bytes
/// (first match emits a credential record), then appends the conversation to
/// `tcpConnections/<class>/<ident>.bin`.
pub(crate) async fn save_connection(
    cfg: &AnalysisConfig,
    harvesters: &Arc<Vec<Box<dyn CredentialHarvester>>>,
    stats: &Arc<RwLock<ReassemblyStats>>,
    conv: &Conversation,
) -> Result<()> {
    if conv.raw.is_empty() {
        return Ok(());
    }

    for harvester in harvesters.iter() {
        if let Some(creds) = harvester.harvest(&conv.raw, &conv.ident, conv.first_packet) {
            write_credentials(cfg, &creds)?;
            stats.write().await.credentials_harvested += 1;
            break;
        }
    }

    let class = service_class(&conv.raw, conv.transport.dst);
    let root = cfg.out.join("tcpConnections").join(class);
    let path = artifact_path(&root, &conv.ident)?;
    let data: &[u8] = if cfg.save_colored {
        &conv.colored
    } else {
        &conv.raw
    };
    append_file(&path, data)?;

    stats.write().await.saved_connections += 1;
    metrics::SAVED_CONNECTIONS.inc();
    debug!(path = %path.display(), bytes = data.len(), "saved connection");
    Ok(())
}

/// Appends one direction's reconstructed stream to
/// `tcpStreams/<class>/<ident>.bin`.
pub(crate) async fn save_stream(
    cfg: &AnalysisConfig,
    stats: &Arc<RwLock<ReassemblyStats>>,
    ident: &str,
    data: &[u8],
    service_port: u16,
) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }

    let class = service_class(data, service_port);
    let root = cfg.out.join("tcpStreams").join(class);
    let path = artifact_path(&root, ident)?;
    append_file(&path, data)?;

    stats.write().await.saved_streams += 1;
    metrics::SAVED_STREAMS.inc();
    debug!(path = %path.display(), bytes = data.len(), "saved stream");
    Ok(())
}

/// Appends a credential record as one JSON line to `credentials.jsonl`.
pub(crate) fn write_credentials(cfg: &AnalysisConfig, creds: &Credentials) -> Result<()> {
    create_dirs(&cfg.out)?;
    let mut line = serde_json::to_string(creds)?;
    line.push('\n');
    append_file(&cfg.out.join("credentials.jsonl"), line.as_bytes())?;
    metrics::CREDENTIALS_HARVESTED.inc();
    Ok(())
}

/// Service class for persisted artifacts: port registry first, then a
/// UTF-8 sniff of the payload.
pub(crate) fn service_class(data: &[u8], port: u16) -> String {
    if let Some(name) = services::lookup_service_by_port(port, "tcp") {
        return name.to_string();
    }
    if std::str::from_utf8(data).is_ok() {
        "utf8".to_string()
    } else {
        "unknown".to_string()
    }
}

fn artifact_path(root: &Path, ident: &str) -> Result<PathBuf> {
    create_dirs(root)?;
    Ok(root.join(format!("{}.bin", sanitize_ident(ident))))
}

fn create_dirs(path: &Path) -> std::io::Result<()> {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(DIR_MODE);
    }
    builder.create(path)
}

fn append_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_class_fallbacks() {
        assert_eq!(service_class(b"anything", 80), "http");
        assert_eq!(service_class(b"GET / HTTP/1.0\r\n", 54321), "utf8");
        assert_eq!(service_class(&[0xff, 0xfe, 0x00, 0x80], 54321), "unknown");
    }

    #[test]
    fn test_append_creates_and_extends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        append_file(&path, b"one").unwrap();
        append_file(&path, b"two").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"onetwo");
    }
}
