// SPDX-License-Identifier: MIT
//! The per-direction reader task: a synchronous byte-reader view over the
//! delivered chunks, feeding the shared conversation buffers and triggering
//! persistence when its direction ends.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error};

use crate::analysis::connection::{Conversation, ANSI_BLUE, ANSI_RED, ANSI_RESET};
use crate::analysis::harvest::CredentialHarvester;
use crate::analysis::{persist, AnalysisConfig};
use crate::metrics;
use crate::reassembly::ReassemblyStats;

const READ_CHUNK: usize = 512;

/// Drains one direction of a connection. Created by the factory together
/// with its sibling for the opposite direction.
pub struct ConnectionReader {
    pub(crate) ident: String,
    pub(crate) is_client: bool,
    pub(crate) service_port: u16,
    pub(crate) rx: mpsc::Receiver<Vec<u8>>,
    pub(crate) residual: Vec<u8>,
    pub(crate) conversation: Arc<Mutex<Conversation>>,
    pub(crate) cfg: Arc<AnalysisConfig>,
    pub(crate) stats: Arc<RwLock<ReassemblyStats>>,
    pub(crate) harvesters: Arc<Vec<Box<dyn CredentialHarvester>>>,
    pub(crate) active: Arc<AtomicI64>,
    pub(crate) saved: bool,
}

impl ConnectionReader {
    /// Blocks until payload is available or the channel closes; returns the
    /// number of bytes placed into `buf`, 0 meaning end of stream. Every
    /// byte read is appended to the shared conversation buffers.
    async fn read(&mut self, buf: &mut [u8]) -> usize {
        while self.residual.is_empty() {
            match self.rx.recv().await {
                Some(chunk) => self.residual = chunk,
                None => return 0,
            }
        }
        let n = buf.len().min(self.residual.len());
        buf[..n].copy_from_slice(&self.residual[..n]);
        self.residual.drain(..n);

        let mut conv = self.conversation.lock().await;
        conv.raw.extend_from_slice(&buf[..n]);
        let color = if self.is_client { ANSI_RED } else { ANSI_BLUE };
        conv.colored.extend_from_slice(color);
        conv.colored.extend_from_slice(&buf[..n]);
        conv.colored.extend_from_slice(ANSI_RESET);
        if self.is_client {
            conv.client_data.extend_from_slice(&buf[..n]);
        } else {
            conv.server_data.extend_from_slice(&buf[..n]);
        }
        n
    }

    /// Consumes the direction until end of stream, then runs cleanup.
    pub(crate) async fn run(mut self) {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if self.read(&mut chunk).await == 0 {
                break;
            }
        }
        self.cleanup().await;
    }

    /// Runs exactly once per direction. The client-side reader persists the
    /// whole conversation; each reader persists its own direction's stream.
    async fn cleanup(mut self) {
        {
            let mut conv = self.conversation.lock().await;
            if self.is_client && !self.saved {
                if let Err(e) =
                    persist::save_connection(&self.cfg, &self.harvesters, &self.stats, &conv).await
                {
                    error!(ident = %self.ident, error = %e, "failed to save connection");
                }
                self.saved = true;
            }
            let data = if self.is_client {
                &conv.client_data
            } else {
                &conv.server_data
            };
            if let Err(e) =
                persist::save_stream(&self.cfg, &self.stats, &self.ident, data, self.service_port)
                    .await
            {
                error!(ident = %self.ident, error = %e, "failed to save stream");
            }

            if conv.first_reader_done {
                // second direction to finish: the conversation is complete
                debug!(
                    ident = %conv.ident,
                    raw = conv.raw.len(),
                    client = conv.client_data.len(),
                    server = conv.server_data.len(),
                    "conversation finished"
                );
            } else {
                conv.first_reader_done = true;
            }
        }
        self.active.fetch_sub(1, Ordering::Relaxed);
        metrics::ACTIVE_READERS.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembly::{IpFlow, PortFlow};
    use chrono::{TimeZone, Utc};
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::tempdir;

    fn reader_pair(
        out: std::path::PathBuf,
        capacity: usize,
    ) -> (
        mpsc::Sender<Vec<u8>>,
        mpsc::Sender<Vec<u8>>,
        ConnectionReader,
        ConnectionReader,
        Arc<Mutex<Conversation>>,
        Arc<AtomicI64>,
    ) {
        let net = IpFlow::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        );
        let transport = PortFlow::new(49152, 21);
        let first = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let ident = "10.0.0.1:49152->10.0.0.2:21".to_string();
        let conversation = Arc::new(Mutex::new(Conversation::new(
            ident.clone(),
            first,
            net,
            transport,
        )));
        let cfg = Arc::new(AnalysisConfig {
            out,
            byte_channel_capacity: capacity,
            allow_missing_init: false,
            save_colored: false,
        });
        let stats = Arc::new(RwLock::new(ReassemblyStats::default()));
        let harvesters: Arc<Vec<Box<dyn CredentialHarvester>>> =
            Arc::new(crate::analysis::harvest::default_harvesters());
        let active = Arc::new(AtomicI64::new(2));
        let (ctx, crx) = mpsc::channel(capacity);
        let (stx, srx) = mpsc::channel(capacity);
        let client = ConnectionReader {
            ident: ident.clone(),
            is_client: true,
            service_port: 21,
            rx: crx,
            residual: Vec::new(),
            conversation: conversation.clone(),
            cfg: cfg.clone(),
            stats: stats.clone(),
            harvesters: harvesters.clone(),
            active: active.clone(),
            saved: false,
        };
        let server = ConnectionReader {
            ident: "10.0.0.2:21->10.0.0.1:49152".to_string(),
            is_client: false,
            service_port: 21,
            rx: srx,
            residual: Vec::new(),
            conversation: conversation.clone(),
            cfg,
            stats,
            harvesters,
            active: active.clone(),
            saved: false,
        };
        (ctx, stx, client, server, conversation, active)
    }

    #[tokio::test]
    async fn test_readers_fill_conversation_and_persist() {
        let dir = tempdir().unwrap();
        let (ctx, stx, client, server, conversation, active) =
            reader_pair(dir.path().to_path_buf(), 8);

        let client_task = tokio::spawn(client.run());
        let server_task = tokio::spawn(server.run());

        // finish the server side first so the conversation is complete when
        // the client-side cleanup persists it
        stx.send(b"220 ready\r\n".to_vec()).await.unwrap();
        drop(stx);
        server_task.await.unwrap();

        ctx.send(b"USER alice\r\n".to_vec()).await.unwrap();
        ctx.send(b"PASS hunter2\r\n".to_vec()).await.unwrap();
        drop(ctx);
        client_task.await.unwrap();

        let conv = conversation.lock().await;
        assert_eq!(conv.client_data, b"USER alice\r\nPASS hunter2\r\n");
        assert_eq!(conv.server_data, b"220 ready\r\n");
        assert_eq!(
            conv.raw.len(),
            conv.client_data.len() + conv.server_data.len()
        );
        assert!(conv.colored.len() > conv.raw.len());
        assert_eq!(active.load(Ordering::Relaxed), 0);

        // port 21 is registered, so artifacts land under the ftp class
        let conn_file = dir
            .path()
            .join("tcpConnections/ftp/10.0.0.1:49152->10.0.0.2:21.bin");
        let written = std::fs::read(&conn_file).unwrap();
        assert_eq!(written.len(), conv.raw.len());
        assert!(dir
            .path()
            .join("tcpStreams/ftp/10.0.0.1:49152->10.0.0.2:21.bin")
            .exists());
        assert!(dir
            .path()
            .join("tcpStreams/ftp/10.0.0.2:21->10.0.0.1:49152.bin")
            .exists());

        // the ftp harvester matched, so a credential record was emitted
        let creds = std::fs::read_to_string(dir.path().join("credentials.jsonl")).unwrap();
        assert!(creds.contains("\"user\":\"alice\""));
        assert!(creds.contains("\"password\":\"hunter2\""));
    }

    #[tokio::test]
    async fn test_empty_direction_persists_nothing() {
        let dir = tempdir().unwrap();
        let (ctx, stx, client, server, _conversation, active) =
            reader_pair(dir.path().to_path_buf(), 4);
        drop(ctx);
        drop(stx);
        client.run().await;
        server.run().await;
        assert_eq!(active.load(Ordering::Relaxed), 0);
        assert!(!dir.path().join("tcpConnections").exists());
        assert!(!dir.path().join("tcpStreams").exists());
    }
}
