// SPDX-License-Identifier: MIT
//! The reassembly state machine: segment acceptance, overlap resolution,
//! contiguous delivery, and timed flush/close.
//!
//! An assembler is single-threaded at its entry point: after submitting a
//! segment the caller must wait for the call to return before submitting
//! another. Several assemblers may share one [`StreamPool`]; they serialize
//! per connection on the connection mutex, so distinct connections assemble
//! concurrently. In the common case an in-order segment is handed to the
//! consumer without copying; only out-of-order payload is copied into pages.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::metrics;
use crate::reassembly::conn::{ConnInner, Direction, FlowKey, HalfConnection, IpFlow, StreamPool};
use crate::reassembly::page::{Page, PageCache};
use crate::reassembly::seq::Sequence;
use crate::reassembly::stream::{
    CaptureInfo, Chunk, DeliveryStats, ScatterGather, Stream, StreamFactory, TcpSegment,
};
use crate::reassembly::ReassemblyStats;

/// Tuning knobs for an assembler.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssemblerOptions {
    /// Upper limit on pages buffered across all connections of this
    /// assembler. 0 = unlimited. When reached, the assembler degrades to
    /// forcing out the oldest queued data of the connection it is touching.
    pub max_buffered_pages_total: usize,
    /// Upper limit on pages buffered for a single connection. 0 = unlimited.
    pub max_buffered_pages_per_connection: usize,
    /// Verbose per-segment tracing.
    pub tcp_debug: bool,
}

/// Thresholds for [`Assembler::flush_with_options`].
#[derive(Debug, Clone, Copy)]
pub struct FlushOptions {
    /// Queued data seen before this instant is pushed through, skipping the
    /// gap in front of it.
    pub t: DateTime<Utc>,
    /// Halves idle since before this instant are closed once drained.
    pub tc: DateTime<Utc>,
}

/// Reassembles TCP streams and drives the per-connection consumers created
/// by the pool's [`StreamFactory`].
pub struct Assembler<F: StreamFactory> {
    opts: AssemblerOptions,
    pc: PageCache,
    pool: Arc<StreamPool<F>>,
    stats: Arc<RwLock<ReassemblyStats>>,
}

impl<F: StreamFactory> Assembler<F> {
    pub fn new(
        pool: Arc<StreamPool<F>>,
        opts: AssemblerOptions,
        stats: Arc<RwLock<ReassemblyStats>>,
    ) -> Self {
        pool.register_user();
        Assembler {
            opts,
            pc: PageCache::new(),
            pool,
            stats,
        }
    }

    pub fn pool(&self) -> &Arc<StreamPool<F>> {
        &self.pool
    }

    pub async fn stats_snapshot(&self) -> ReassemblyStats {
        self.stats.read().await.clone()
    }

    /// Short description of the page usage of this assembler.
    pub fn dump(&self) -> String {
        format!(
            "page cache: used: {}, size: {}, free: {}",
            self.pc.used(),
            self.pc.size(),
            self.pc.free_count()
        )
    }

    /// Feeds one observed segment into its connection, creating the
    /// connection and its consumer on first sight. Results in zero or one
    /// delivery to the consumer and, on FIN/RST of the second half, its
    /// completion callback. Never fails: malformed or rejected input is
    /// dropped and counted.
    pub async fn assemble(&mut self, net: IpFlow, segment: &TcpSegment<'_>, info: CaptureInfo) {
        let ts = info.timestamp;
        {
            let mut stats = self.stats.write().await;
            stats.total_segments += 1;
            stats.total_payload_bytes += segment.payload.len() as i64;
        }
        metrics::SEGMENTS_PROCESSED.inc();

        let key = FlowKey::new(net, segment.transport_flow());
        let (conn, dir) = self.pool.get_connection(key, ts, segment, &info).await;
        let mut guard = conn.inner.lock().await;
        let inner = &mut *guard;

        let mut ret: Vec<Chunk> = Vec::new();
        {
            let (half, rev, stream) = inner.parts_mut(dir);
            if ts > half.last_seen {
                half.last_seen = ts;
            }
            let mut start = half.next_seq.is_invalid() && segment.syn;
            if self.opts.tcp_debug
                && !half.next_seq.is_invalid()
                && half.next_seq.difference(rev.ack_seq) > 0
            {
                debug!(%key, next_seq = %half.next_seq, acked = %rev.ack_seq,
                    "data acked by the peer but not assembled yet");
            }
            if !stream.accept(segment, &info, dir, half.next_seq, &mut start) {
                if self.opts.tcp_debug {
                    debug!(%key, "segment rejected by stream policy");
                }
                return;
            }
            if half.closed {
                if self.opts.tcp_debug {
                    debug!(%key, %dir, "segment on closed half");
                }
                return;
            }

            let mut seq = Sequence::from(segment.seq);
            if segment.ack_flag {
                half.ack_seq = Sequence::from(segment.ack);
            }
            let mut queue = true;
            if half.next_seq.is_invalid() {
                if segment.syn {
                    seq = seq.add(1);
                    half.next_seq = seq;
                    queue = false;
                } else if start {
                    half.next_seq = seq;
                    queue = false;
                }
            } else if half.next_seq.difference(seq) <= 0 {
                queue = false;
            }
            self.handle_bytes(
                half,
                &mut ret,
                seq,
                segment.payload,
                ts,
                segment.syn,
                segment.fin || segment.rst,
                queue,
            );
        }

        if ret.is_empty() {
            return;
        }
        let (half, _rev, stream) = inner.parts_mut(dir);
        let (end, next_seq) = self.send_to_connection(half, stream, ret).await;
        if !next_seq.is_invalid() {
            half.next_seq = if segment.fin {
                next_seq.add(1)
            } else {
                next_seq
            };
        }
        if self.opts.tcp_debug {
            debug!(%key, next_seq = %inner.half(dir).next_seq, "segment assembled");
        }
        if end {
            let remove = self.finish_close(inner, dir).await;
            drop(guard);
            if remove {
                self.pool.remove(&key).await;
            }
        }
    }

    /// Queues or trims the payload. On the immediate path the leading
    /// overlap against `next_seq` is dropped and the remainder lands in
    /// `ret`; on the queue path the payload goes through overlap resolution
    /// against the queued pages, and buffer limits may force the oldest
    /// queued page out into `ret`.
    #[allow(clippy::too_many_arguments)]
    fn handle_bytes<'a>(
        &mut self,
        half: &mut HalfConnection,
        ret: &mut Vec<Chunk<'a>>,
        seq: Sequence,
        bytes: &'a [u8],
        seen: DateTime<Utc>,
        start: bool,
        end: bool,
        queue: bool,
    ) {
        if queue {
            self.check_overlap(half, seq, bytes, seen, start, end, true);
            let per_conn = self.opts.max_buffered_pages_per_connection;
            let total = self.opts.max_buffered_pages_total;
            if (per_conn > 0 && half.pages() >= per_conn)
                || (total > 0 && self.pc.used() >= total)
            {
                if self.opts.tcp_debug {
                    debug!(
                        pages = half.pages(),
                        used = self.pc.used(),
                        "buffer limit reached, forcing oldest queued data out"
                    );
                }
                self.add_next_from_conn(half, ret);
            }
        } else {
            let (bytes, seq) = self.overlap_existing(half, seq, bytes);
            let bytes = self.check_overlap(half, seq, bytes, seen, start, end, false);
            if !bytes.is_empty() || end || start {
                ret.push(Chunk::Live {
                    seq,
                    bytes,
                    seen,
                    start,
                    end,
                });
            }
        }
    }

    /// Drops the leading part of the payload that was already delivered
    /// (everything before `next_seq`), counting it as overlap.
    fn overlap_existing<'a>(
        &mut self,
        half: &mut HalfConnection,
        seq: Sequence,
        bytes: &'a [u8],
    ) -> (&'a [u8], Sequence) {
        if half.next_seq.is_invalid() {
            return (bytes, seq);
        }
        let diff = seq.difference(half.next_seq);
        if diff <= 0 {
            return (bytes, seq);
        }
        let trim = (diff as usize).min(bytes.len());
        if !bytes.is_empty() {
            half.overlap_packets += 1;
            half.overlap_bytes += trim;
        }
        (&bytes[trim..], half.next_seq)
    }

    /// Resolves the payload range against the queued pages, walking the
    /// queue from the tail. New data wins on range boundaries; a queued page
    /// keeps its identity unless the new range fully covers it. With `queue`
    /// set, whatever survives is split into pages and spliced in order.
    /// Returns the surviving payload slice.
    #[allow(clippy::too_many_arguments)]
    fn check_overlap<'a>(
        &mut self,
        half: &mut HalfConnection,
        seq: Sequence,
        mut bytes: &'a [u8],
        seen: DateTime<Utc>,
        start: bool,
        end: bool,
        queue: bool,
    ) -> &'a [u8] {
        if bytes.is_empty() {
            return bytes;
        }
        let mut insert_pos = 0usize;
        let mut i = half.queue.len();
        while i > 0 {
            let idx = i - 1;
            let end_seq = seq.add(bytes.len() as i64);
            let (cs, ce, cur_len) = {
                let cur = &half.queue[idx];
                (cur.seq, cur.end_seq(), cur.len())
            };
            if end_seq.difference(cs) >= 0 {
                // new range ends at or before this page: look further left
                i -= 1;
                continue;
            }
            if ce.difference(seq) >= 0 {
                // new range starts at or after this page's end
                insert_pos = idx + 1;
                break;
            }
            let covers_head = seq.difference(cs) >= 0;
            let covers_tail = end_seq.difference(ce) <= 0;
            if covers_head && covers_tail {
                // fully covered page: replaced by the new data
                let cur = half.queue.remove(idx);
                if cur.is_packet_origin() {
                    half.overlap_packets += 1;
                }
                half.overlap_bytes += cur.len();
                self.pc.replace(cur);
                i = idx;
                continue;
            }
            if covers_tail {
                // new range runs past the page's tail: the page keeps its
                // head, the overlapped tail is replaced
                let keep = cs.difference(seq) as usize;
                half.overlap_bytes += cur_len - keep;
                half.queue[idx].truncate_back(keep);
                insert_pos = idx + 1;
                break;
            }
            if covers_head {
                // new range runs into the page's head: the page keeps its
                // bytes, the new range loses its tail
                let keep = seq.difference(cs) as usize;
                half.overlap_bytes += bytes.len() - keep;
                bytes = &bytes[..keep];
                if bytes.is_empty() {
                    break;
                }
                i -= 1;
                continue;
            }
            // strictly inside the page: overwrite the interior in place
            let offset = cs.difference(seq) as usize;
            half.queue[idx].overwrite(offset, bytes);
            half.overlap_bytes += bytes.len();
            bytes = &bytes[..0];
            break;
        }
        if queue && !bytes.is_empty() {
            let pages = self.pc.pages_from(seq, bytes, seen, start, end);
            half.queued_packets += 1;
            half.queued_bytes += bytes.len();
            half.queue.splice(insert_pos..insert_pos, pages);
        }
        bytes
    }

    /// Pops the smallest-sequence queued page into the return buffer.
    fn add_next_from_conn(&mut self, half: &mut HalfConnection, ret: &mut Vec<Chunk<'_>>) {
        if half.queue.is_empty() {
            return;
        }
        let page = half.queue.remove(0);
        ret.push(Chunk::Page(page));
    }

    /// Builds the delivery: prepends kept bytes from the previous delivery,
    /// appends everything now contiguous, and snapshots the counters.
    /// Returns the delivery, whether it terminates the stream, and the new
    /// `next_seq`.
    fn build_sg<'a>(
        &mut self,
        half: &mut HalfConnection,
        mut ret: Vec<Chunk<'a>>,
    ) -> (ScatterGather<'a>, bool, Sequence) {
        let first_seq = ret[0].seq();
        let skip = if half.next_seq.is_invalid() {
            -1
        } else {
            half.next_seq.difference(first_seq)
        };
        let last = first_seq.add(ret[0].len() as i64);
        let saved = self.add_pending(half, first_seq, &mut ret);
        let next_seq = self.add_contiguous(half, last, &mut ret);
        let end = ret.last().map(Chunk::is_end).unwrap_or(false);
        let stats = DeliveryStats {
            queued_bytes: std::mem::take(&mut half.queued_bytes),
            queued_packets: std::mem::take(&mut half.queued_packets),
            overlap_bytes: std::mem::take(&mut half.overlap_bytes),
            overlap_packets: std::mem::take(&mut half.overlap_packets),
        };
        let sg = ScatterGather {
            all: ret,
            skip,
            direction: half.dir,
            saved,
            stats,
            to_keep: None,
        };
        (sg, end, next_seq)
    }

    /// Prepends the saved pages when they are contiguous with the new first
    /// byte; otherwise releases them. Returns the number of bytes prepended.
    fn add_pending(
        &mut self,
        half: &mut HalfConnection,
        first_seq: Sequence,
        ret: &mut Vec<Chunk<'_>>,
    ) -> usize {
        if half.saved.is_empty() {
            return 0;
        }
        let total: usize = half.saved.iter().map(Page::len).sum();
        if half.saved[0].seq.add(total as i64) != first_seq {
            // saved bytes no longer line up with what is being delivered
            for page in half.saved.drain(..) {
                self.pc.replace(page);
            }
            return 0;
        }
        let pages: Vec<Chunk> = half.saved.drain(..).map(Chunk::Page).collect();
        ret.splice(0..0, pages);
        total
    }

    /// Moves queued pages contiguous with `last_seq` into the return buffer
    /// and returns the sequence number one past the last delivered byte.
    fn add_contiguous(
        &mut self,
        half: &mut HalfConnection,
        mut last_seq: Sequence,
        ret: &mut Vec<Chunk<'_>>,
    ) -> Sequence {
        while !half.queue.is_empty() && last_seq.difference(half.queue[0].seq) == 0 {
            let page = half.queue.remove(0);
            last_seq = last_seq.add(page.len() as i64);
            ret.push(Chunk::Page(page));
        }
        last_seq
    }

    /// Delivers the return buffer to the consumer and recycles it. Empty
    /// deliveries are only surfaced when they terminate the stream.
    async fn send_to_connection(
        &mut self,
        half: &mut HalfConnection,
        stream: &mut F::Stream,
        ret: Vec<Chunk<'_>>,
    ) -> (bool, Sequence) {
        let (mut sg, end, next_seq) = self.build_sg(half, ret);
        if !sg.is_empty() || end {
            stream.reassembled(&mut sg).await;
        }
        self.clean_sg(half, sg);
        (end, next_seq)
    }

    /// Releases consumed pages back to the cache and converts any tail the
    /// consumer kept into fresh saved pages.
    fn clean_sg(&mut self, half: &mut HalfConnection, sg: ScatterGather<'_>) {
        let ScatterGather { all, to_keep, .. } = sg;
        let mut new_saved: Vec<Page> = Vec::new();
        let mut consumed = 0usize;
        for chunk in all {
            let len = chunk.len();
            match to_keep {
                Some(k) if k < consumed + len => {
                    let off = k.saturating_sub(consumed);
                    match chunk {
                        Chunk::Page(mut page) => {
                            if off > 0 {
                                page.trim_front(off);
                            }
                            new_saved.push(page);
                        }
                        Chunk::Live {
                            seq,
                            bytes,
                            seen,
                            start,
                            end,
                        } => {
                            let kept = &bytes[off..];
                            if !kept.is_empty() {
                                new_saved.extend(self.pc.pages_from(
                                    seq.add(off as i64),
                                    kept,
                                    seen,
                                    start && off == 0,
                                    end,
                                ));
                            }
                        }
                    }
                }
                _ => {
                    if let Chunk::Page(page) = chunk {
                        self.pc.replace(page);
                    }
                }
            }
            consumed += len;
        }
        half.saved = new_saved;
    }

    /// Closes one half; when the second half closes this runs the
    /// completion callback and reports whether the connection should leave
    /// the pool.
    async fn finish_close(&mut self, inner: &mut ConnInner<F::Stream>, dir: Direction) -> bool {
        if inner.half(dir).closed {
            return false;
        }
        let both = inner.close_half(dir, &mut self.pc);
        self.stats.write().await.total_closed += 1;
        if both {
            return inner.stream.reassembly_complete().await;
        }
        false
    }

    /// Forces out the first queued range (and anything contiguous with it)
    /// even though bytes in front of it are missing; closes the half when
    /// nothing is queued. Returns true when the connection should leave the
    /// pool.
    async fn skip_flush(&mut self, inner: &mut ConnInner<F::Stream>, dir: Direction) -> bool {
        if inner.half(dir).queue.is_empty() {
            return self.finish_close(inner, dir).await;
        }
        let page = inner.half_mut(dir).queue.remove(0);
        let ret = vec![Chunk::Page(page)];
        let (half, _rev, stream) = inner.parts_mut(dir);
        let (end, next_seq) = self.send_to_connection(half, stream, ret).await;
        if !next_seq.is_invalid() {
            half.next_seq = next_seq;
        }
        if end {
            return self.finish_close(inner, dir).await;
        }
        false
    }

    async fn flush_close(
        &mut self,
        inner: &mut ConnInner<F::Stream>,
        dir: Direction,
        opts: &FlushOptions,
    ) -> (bool, bool, bool) {
        let (mut flushed, mut closed, mut remove) = (false, false, false);
        if inner.half(dir).closed {
            return (flushed, closed, remove);
        }
        while let Some(seen) = inner.half(dir).queue.first().map(|p| p.seen) {
            if seen >= opts.t {
                break;
            }
            flushed = true;
            remove |= self.skip_flush(inner, dir).await;
            if inner.half(dir).closed {
                return (flushed, true, remove);
            }
        }
        if inner.half(dir).queue.is_empty() && inner.last_seen() < opts.tc {
            remove |= self.finish_close(inner, dir).await;
            closed = true;
        }
        (flushed, closed, remove)
    }

    /// Pushes through queued data older than `opts.t`, skipping the gaps in
    /// front of it, and closes halves idle since before `opts.tc`. Returns
    /// how many halves were flushed and how many closed.
    pub async fn flush_with_options(&mut self, opts: FlushOptions) -> (usize, usize) {
        let conns = self.pool.connections().await;
        let mut flushes = 0;
        let mut closes = 0;
        for conn in conns {
            let mut remove = false;
            {
                let mut guard = conn.inner.lock().await;
                let inner = &mut *guard;
                for dir in [Direction::ClientToServer, Direction::ServerToClient] {
                    let (flushed, closed, rm) = self.flush_close(inner, dir, &opts).await;
                    if flushed {
                        flushes += 1;
                    }
                    if closed {
                        closes += 1;
                    }
                    remove |= rm;
                }
                if inner.both_closed()
                    && inner.c2s.last_seen < opts.tc
                    && inner.s2c.last_seen < opts.tc
                {
                    remove = true;
                }
            }
            if remove {
                self.pool.remove(&conn.key).await;
            }
        }
        if flushes > 0 || closes > 0 {
            let mut stats = self.stats.write().await;
            stats.total_flushed += flushes as i64;
            metrics::FLUSHED_HALVES.inc_by(flushes as f64);
        }
        (flushes, closes)
    }

    /// Flushes and closes everything older than `t`.
    pub async fn flush_close_older_than(&mut self, t: DateTime<Utc>) -> (usize, usize) {
        self.flush_with_options(FlushOptions { t, tc: t }).await
    }

    /// Drains every connection to completion: all queued data is pushed
    /// through and every half is closed. Returns the number of connections
    /// drained.
    pub async fn flush_all(&mut self) -> usize {
        let conns = self.pool.connections().await;
        let drained = conns.len();
        for conn in conns {
            let mut remove = false;
            {
                let mut guard = conn.inner.lock().await;
                let inner = &mut *guard;
                for dir in [Direction::ClientToServer, Direction::ServerToClient] {
                    while !inner.half(dir).closed {
                        remove |= self.skip_flush(inner, dir).await;
                    }
                }
            }
            if remove {
                self.pool.remove(&conn.key).await;
            }
        }
        drained
    }
}
