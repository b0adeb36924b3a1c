// SPDX-License-Identifier: MIT
// lib.rs
use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

pub mod analysis;
pub mod capture;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod reassembly;
pub mod services;
pub mod util;

use crate::analysis::{default_harvesters, AnalysisConfig, TcpConnectionFactory};
use crate::capture::CaptureReport;
use crate::config::Config;
use crate::errors::Result;
use crate::reassembly::{Assembler, AssemblerOptions, ReassemblyStats, StreamPool};

/// Runs a capture file through the full pipeline: parse, reassemble, feed
/// the per-connection readers, persist artifacts, and drain everything
/// before returning the report.
pub async fn analyze_pcap<P: AsRef<Path>>(config: Config, pcap: P) -> Result<CaptureReport> {
    metrics::init_metrics();

    let stats = Arc::new(RwLock::new(ReassemblyStats::default()));
    let factory = TcpConnectionFactory::new(
        AnalysisConfig::from(&config),
        stats.clone(),
        default_harvesters(),
    );
    let pool = Arc::new(StreamPool::new(factory.clone(), stats.clone()));
    let opts = AssemblerOptions {
        max_buffered_pages_total: config.max_buffered_pages_total,
        max_buffered_pages_per_connection: config.max_buffered_pages_per_connection,
        tcp_debug: config.tcp_debug,
    };
    let mut assembler = Assembler::new(pool, opts, stats);

    let mut report = capture::process_pcap(&mut assembler, &config, pcap).await?;

    // push out whatever is still queued, close every stream, and wait for
    // the readers to finish persisting
    report.closed += assembler.flush_all().await;
    factory.shutdown().await;
    report.stats = assembler.stats_snapshot().await;

    info!(
        connections = report.stats.total_connections,
        saved = report.stats.saved_connections,
        "capture analysis finished"
    );
    Ok(report)
}
