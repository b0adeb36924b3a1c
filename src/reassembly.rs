// SPDX-License-Identifier: MIT
//! Passive TCP stream reassembly: sequence arithmetic, page buffering, the
//! connection pool, and the assembler state machine that turns observed
//! segments into ordered byte deliveries.

pub mod assembler;
pub mod conn;
pub mod page;
pub mod seq;
pub mod stream;

pub use assembler::{Assembler, AssemblerOptions, FlushOptions};
pub use conn::{Connection, Direction, FlowKey, HalfConnection, IpFlow, PortFlow, StreamPool};
pub use page::{Page, PageCache, PAGE_BYTES};
pub use seq::Sequence;
pub use stream::{
    CaptureInfo, DeliveryStats, ScatterGather, Stream, StreamFactory, TcpSegment,
};

/// Counters accumulated across the lifetime of a pool and its assemblers.
#[derive(Default, Debug, Clone, serde::Serialize)]
pub struct ReassemblyStats {
    pub total_segments: i64,
    pub total_payload_bytes: i64,
    pub total_connections: i64,
    pub total_flushed: i64,
    pub total_closed: i64,
    pub saved_connections: i64,
    pub saved_streams: i64,
    pub credentials_harvested: i64,
}
