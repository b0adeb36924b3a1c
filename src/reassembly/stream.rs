// SPDX-License-Identifier: MIT
//! The consumer-facing surface of the reassembler: segments in, ordered
//! byte runs out.

use std::borrow::Cow;
use std::future::Future;

use chrono::{DateTime, Utc};

use crate::reassembly::conn::{Direction, IpFlow, PortFlow};
use crate::reassembly::page::Page;
use crate::reassembly::seq::Sequence;

/// One observed TCP segment: the transport endpoints, sequence state, flag
/// bits, and a borrowed payload.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub syn: bool,
    pub ack_flag: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: &'a [u8],
}

impl TcpSegment<'_> {
    pub fn transport_flow(&self) -> PortFlow {
        PortFlow::new(self.src_port, self.dst_port)
    }
}

/// Capture metadata carried alongside a segment.
#[derive(Debug, Clone, Copy)]
pub struct CaptureInfo {
    pub timestamp: DateTime<Utc>,
    /// Original wire length of the frame.
    pub length: usize,
}

/// A delivered run of bytes. Either the in-flight payload of the segment
/// being assembled (zero copy) or a page drawn from a half-connection queue.
pub(crate) enum Chunk<'a> {
    Live {
        seq: Sequence,
        bytes: &'a [u8],
        seen: DateTime<Utc>,
        start: bool,
        end: bool,
    },
    Page(Page),
}

impl Chunk<'_> {
    pub(crate) fn seq(&self) -> Sequence {
        match self {
            Chunk::Live { seq, .. } => *seq,
            Chunk::Page(p) => p.seq,
        }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        match self {
            Chunk::Live { bytes, .. } => bytes,
            Chunk::Page(p) => p.bytes(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.bytes().len()
    }

    pub(crate) fn is_start(&self) -> bool {
        match self {
            Chunk::Live { start, .. } => *start,
            Chunk::Page(p) => p.start,
        }
    }

    pub(crate) fn is_end(&self) -> bool {
        match self {
            Chunk::Live { end, .. } => *end,
            Chunk::Page(p) => p.end,
        }
    }
}

/// Counter snapshot attached to a delivery; the underlying half-connection
/// counters reset when the snapshot is taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub queued_bytes: usize,
    pub queued_packets: usize,
    pub overlap_bytes: usize,
    pub overlap_packets: usize,
}

/// An ordered set of byte runs handed to the consumer while the connection
/// mutex is held. The consumer may claim a trailing portion for re-delivery
/// with [`ScatterGather::keep_from`].
pub struct ScatterGather<'a> {
    pub(crate) all: Vec<Chunk<'a>>,
    pub(crate) skip: i64,
    pub(crate) direction: Direction,
    pub(crate) saved: usize,
    pub(crate) stats: DeliveryStats,
    pub(crate) to_keep: Option<usize>,
}

impl ScatterGather<'_> {
    /// Total bytes in this delivery, including any re-delivered saved prefix.
    pub fn len(&self) -> usize {
        self.all.iter().map(Chunk::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (total bytes, bytes re-delivered from a previous keep request).
    pub fn lengths(&self) -> (usize, usize) {
        (self.len(), self.saved)
    }

    /// (direction, starts stream, ends stream, bytes missing before the
    /// first byte; 0 = contiguous, negative = unknown).
    pub fn info(&self) -> (Direction, bool, bool, i64) {
        (
            self.direction,
            self.all.first().map(Chunk::is_start).unwrap_or(false),
            self.all.last().map(Chunk::is_end).unwrap_or(false),
            self.skip,
        )
    }

    pub fn stats(&self) -> DeliveryStats {
        self.stats
    }

    /// Returns up to the first `n` bytes, borrowing when a single run
    /// suffices.
    pub fn fetch(&self, n: usize) -> Cow<'_, [u8]> {
        if let [only] = self.all.as_slice() {
            return Cow::Borrowed(&only.bytes()[..n.min(only.len())]);
        }
        let mut out = Vec::with_capacity(n.min(self.len()));
        for chunk in &self.all {
            if out.len() >= n {
                break;
            }
            let take = (n - out.len()).min(chunk.len());
            out.extend_from_slice(&chunk.bytes()[..take]);
        }
        Cow::Owned(out)
    }

    /// Asks the assembler to retain everything from `offset` onward and
    /// re-deliver it in front of the next contiguous delivery.
    pub fn keep_from(&mut self, offset: usize) {
        self.to_keep = Some(offset);
    }
}

/// The capability set a per-connection consumer provides. Invoked by the
/// assembler with the connection mutex held; `reassembled` may suspend and
/// is the backpressure point into the assembler.
pub trait Stream: Send + 'static {
    /// Policy gate called for every segment before any state change. May
    /// force `start` to begin a stream without an observed SYN. Returning
    /// false drops the segment.
    fn accept(
        &mut self,
        segment: &TcpSegment<'_>,
        info: &CaptureInfo,
        dir: Direction,
        next_seq: Sequence,
        start: &mut bool,
    ) -> bool;

    /// Ordered byte delivery for one direction.
    fn reassembled(&mut self, sg: &mut ScatterGather<'_>) -> impl Future<Output = ()> + Send;

    /// Called exactly once, after the last delivery, when both directions
    /// have closed. Returning true releases the connection record.
    fn reassembly_complete(&mut self) -> impl Future<Output = bool> + Send;
}

/// Creates the consumer for a connection on its first accepted segment.
pub trait StreamFactory: Send + Sync + 'static {
    type Stream: Stream;

    fn new_stream(
        &self,
        net: IpFlow,
        transport: PortFlow,
        segment: &TcpSegment<'_>,
        info: &CaptureInfo,
    ) -> Self::Stream;
}
