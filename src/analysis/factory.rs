// SPDX-License-Identifier: MIT
//! Creates the per-connection consumer and its pair of reader tasks, and
//! tracks them so shutdown can drain the whole pipeline.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::analysis::connection::{Conversation, TcpConnectionStream};
use crate::analysis::harvest::CredentialHarvester;
use crate::analysis::reader::ConnectionReader;
use crate::analysis::AnalysisConfig;
use crate::metrics;
use crate::reassembly::stream::{CaptureInfo, StreamFactory, TcpSegment};
use crate::reassembly::{IpFlow, PortFlow, ReassemblyStats};

/// Stream factory for the analysis pipeline. Cloneable; all clones share
/// the same tracker, counters, and configuration.
#[derive(Clone)]
pub struct TcpConnectionFactory {
    cfg: Arc<AnalysisConfig>,
    stats: Arc<RwLock<ReassemblyStats>>,
    harvesters: Arc<Vec<Box<dyn CredentialHarvester>>>,
    tracker: TaskTracker,
    active: Arc<AtomicI64>,
}

impl TcpConnectionFactory {
    pub fn new(
        cfg: AnalysisConfig,
        stats: Arc<RwLock<ReassemblyStats>>,
        harvesters: Vec<Box<dyn CredentialHarvester>>,
    ) -> Self {
        TcpConnectionFactory {
            cfg: Arc::new(cfg),
            stats,
            harvesters: Arc::new(harvesters),
            tracker: TaskTracker::new(),
            active: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Number of reader tasks that have not reached cleanup yet.
    pub fn num_active(&self) -> i64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Waits for every spawned reader to finish. Call after the assembler
    /// has been drained with `flush_all`, which closes the byte channels.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn spawn_reader(&self, reader: ConnectionReader) {
        self.active.fetch_add(1, Ordering::Relaxed);
        metrics::ACTIVE_READERS.inc();
        self.tracker.spawn(reader.run());
    }
}

impl StreamFactory for TcpConnectionFactory {
    type Stream = TcpConnectionStream;

    fn new_stream(
        &self,
        net: IpFlow,
        transport: PortFlow,
        _segment: &TcpSegment<'_>,
        info: &CaptureInfo,
    ) -> TcpConnectionStream {
        let ident = format!(
            "{}:{}->{}:{}",
            net.src, transport.src, net.dst, transport.dst
        );
        debug!(%ident, "new connection");
        let conversation = Arc::new(Mutex::new(Conversation::new(
            ident.clone(),
            info.timestamp,
            net,
            transport,
        )));

        let capacity = self.cfg.byte_channel_capacity;
        let (client_tx, client_rx) = mpsc::channel(capacity);
        let (server_tx, server_rx) = mpsc::channel(capacity);

        self.spawn_reader(ConnectionReader {
            ident: ident.clone(),
            is_client: true,
            service_port: transport.dst,
            rx: client_rx,
            residual: Vec::new(),
            conversation: conversation.clone(),
            cfg: self.cfg.clone(),
            stats: self.stats.clone(),
            harvesters: self.harvesters.clone(),
            active: self.active.clone(),
            saved: false,
        });
        self.spawn_reader(ConnectionReader {
            ident: format!(
                "{}:{}->{}:{}",
                net.dst, transport.dst, net.src, transport.src
            ),
            is_client: false,
            service_port: transport.dst,
            rx: server_rx,
            residual: Vec::new(),
            conversation: conversation.clone(),
            cfg: self.cfg.clone(),
            stats: self.stats.clone(),
            harvesters: self.harvesters.clone(),
            active: self.active.clone(),
            saved: false,
        });

        TcpConnectionStream {
            ident,
            client_tx: Some(client_tx),
            server_tx: Some(server_tx),
            allow_missing_init: self.cfg.allow_missing_init,
        }
    }
}
