// SPDX-License-Identifier: MIT
//! Flow keys, per-direction connection state, and the shared connection pool.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::metrics;
use crate::reassembly::page::{Page, PageCache};
use crate::reassembly::seq::Sequence;
use crate::reassembly::stream::{CaptureInfo, StreamFactory, TcpSegment};
use crate::reassembly::ReassemblyStats;

/// The direction of a segment within a connection. The orientation is fixed
/// by the first observed segment, which is taken to be client to server.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub fn reverse(self) -> Direction {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }

    pub fn is_client(self) -> bool {
        matches!(self, Direction::ClientToServer)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => write!(f, "client->server"),
            Direction::ServerToClient => write!(f, "server->client"),
        }
    }
}

/// Network-layer endpoint pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct IpFlow {
    pub src: IpAddr,
    pub dst: IpAddr,
}

impl IpFlow {
    pub fn new(src: IpAddr, dst: IpAddr) -> Self {
        IpFlow { src, dst }
    }

    pub fn reverse(self) -> IpFlow {
        IpFlow {
            src: self.dst,
            dst: self.src,
        }
    }
}

/// Transport-layer endpoint pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PortFlow {
    pub src: u16,
    pub dst: u16,
}

impl PortFlow {
    pub fn new(src: u16, dst: u16) -> Self {
        PortFlow { src, dst }
    }

    pub fn reverse(self) -> PortFlow {
        PortFlow {
            src: self.dst,
            dst: self.src,
        }
    }
}

/// Identifies one TCP connection as seen from one direction. Both directions
/// of the same 4-tuple resolve to the same pool entry via [`FlowKey::reverse`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FlowKey {
    pub net: IpFlow,
    pub transport: PortFlow,
}

impl FlowKey {
    pub fn new(net: IpFlow, transport: PortFlow) -> Self {
        FlowKey { net, transport }
    }

    pub fn reverse(self) -> FlowKey {
        FlowKey {
            net: self.net.reverse(),
            transport: self.transport.reverse(),
        }
    }

    /// Printable flow identifier, also used as the artifact file basename.
    pub fn ident(&self) -> String {
        format!(
            "{}:{}->{}:{}",
            self.net.src, self.transport.src, self.net.dst, self.transport.dst
        )
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ident())
    }
}

/// One direction of a tracked connection: the next expected sequence number,
/// the out-of-order page queue, and bytes the consumer asked to keep.
pub struct HalfConnection {
    pub dir: Direction,
    pub next_seq: Sequence,
    pub ack_seq: Sequence,
    pub closed: bool,
    pub last_seen: DateTime<Utc>,
    pub(crate) queue: Vec<Page>,
    pub(crate) saved: Vec<Page>,
    pub(crate) queued_bytes: usize,
    pub(crate) queued_packets: usize,
    pub(crate) overlap_bytes: usize,
    pub(crate) overlap_packets: usize,
}

impl HalfConnection {
    fn new(dir: Direction, seen: DateTime<Utc>) -> Self {
        HalfConnection {
            dir,
            next_seq: Sequence::INVALID,
            ack_seq: Sequence::INVALID,
            closed: false,
            last_seen: seen,
            queue: Vec::new(),
            saved: Vec::new(),
            queued_bytes: 0,
            queued_packets: 0,
            overlap_bytes: 0,
            overlap_packets: 0,
        }
    }

    /// Number of pages currently held by this half (queued plus saved).
    pub fn pages(&self) -> usize {
        self.queue.len() + self.saved.len()
    }
}

pub(crate) struct ConnInner<S> {
    pub(crate) c2s: HalfConnection,
    pub(crate) s2c: HalfConnection,
    pub(crate) stream: S,
}

impl<S> ConnInner<S> {
    pub(crate) fn half(&self, dir: Direction) -> &HalfConnection {
        match dir {
            Direction::ClientToServer => &self.c2s,
            Direction::ServerToClient => &self.s2c,
        }
    }

    pub(crate) fn half_mut(&mut self, dir: Direction) -> &mut HalfConnection {
        match dir {
            Direction::ClientToServer => &mut self.c2s,
            Direction::ServerToClient => &mut self.s2c,
        }
    }

    /// Splits the record into the sending half, the reverse half, and the
    /// consumer, for callers that need all three at once.
    pub(crate) fn parts_mut(
        &mut self,
        dir: Direction,
    ) -> (&mut HalfConnection, &mut HalfConnection, &mut S) {
        match dir {
            Direction::ClientToServer => (&mut self.c2s, &mut self.s2c, &mut self.stream),
            Direction::ServerToClient => (&mut self.s2c, &mut self.c2s, &mut self.stream),
        }
    }

    pub(crate) fn both_closed(&self) -> bool {
        self.c2s.closed && self.s2c.closed
    }

    pub(crate) fn last_seen(&self) -> DateTime<Utc> {
        self.c2s.last_seen.max(self.s2c.last_seen)
    }

    /// Marks one half closed and releases every page it still holds.
    /// Returns true when both halves are now closed.
    pub(crate) fn close_half(&mut self, dir: Direction, pc: &mut PageCache) -> bool {
        let half = self.half_mut(dir);
        half.closed = true;
        for page in half.queue.drain(..) {
            pc.replace(page);
        }
        for page in half.saved.drain(..) {
            pc.replace(page);
        }
        self.both_closed()
    }
}

/// A tracked connection: the flow key it was first seen under and the two
/// half-connections plus their consumer, all behind one mutex.
pub struct Connection<S> {
    pub key: FlowKey,
    pub(crate) inner: Mutex<ConnInner<S>>,
}

/// Maps flow keys to connections. Lookups take the shared lock; creation and
/// removal take the exclusive one. A pool may be shared by several
/// assemblers, which then serialize per connection on the connection mutex.
pub struct StreamPool<F: StreamFactory> {
    factory: F,
    conns: RwLock<HashMap<FlowKey, Arc<Connection<F::Stream>>>>,
    users: AtomicUsize,
    stats: Arc<RwLock<ReassemblyStats>>,
}

impl<F: StreamFactory> StreamPool<F> {
    pub fn new(factory: F, stats: Arc<RwLock<ReassemblyStats>>) -> Self {
        StreamPool {
            factory,
            conns: RwLock::new(HashMap::new()),
            users: AtomicUsize::new(0),
            stats,
        }
    }

    pub(crate) fn register_user(&self) {
        self.users.fetch_add(1, Ordering::Relaxed);
    }

    pub fn users(&self) -> usize {
        self.users.load(Ordering::Relaxed)
    }

    /// Looks up the connection for `key`, creating it (and its consumer
    /// stream) on first sight. The returned direction is the sending side of
    /// the current segment relative to the stored orientation.
    pub(crate) async fn get_connection(
        &self,
        key: FlowKey,
        seen: DateTime<Utc>,
        segment: &TcpSegment<'_>,
        info: &CaptureInfo,
    ) -> (Arc<Connection<F::Stream>>, Direction) {
        {
            let conns = self.conns.read().await;
            if let Some(conn) = conns.get(&key) {
                return (conn.clone(), Direction::ClientToServer);
            }
            if let Some(conn) = conns.get(&key.reverse()) {
                return (conn.clone(), Direction::ServerToClient);
            }
        }
        let mut conns = self.conns.write().await;
        // Re-check: another assembler may have raced us here.
        if let Some(conn) = conns.get(&key) {
            return (conn.clone(), Direction::ClientToServer);
        }
        if let Some(conn) = conns.get(&key.reverse()) {
            return (conn.clone(), Direction::ServerToClient);
        }
        let stream = self.factory.new_stream(key.net, key.transport, segment, info);
        let conn = Arc::new(Connection {
            key,
            inner: Mutex::new(ConnInner {
                c2s: HalfConnection::new(Direction::ClientToServer, seen),
                s2c: HalfConnection::new(Direction::ServerToClient, seen),
                stream,
            }),
        });
        conns.insert(key, conn.clone());
        metrics::CONNECTIONS_TRACKED.inc();
        self.stats.write().await.total_connections += 1;
        (conn, Direction::ClientToServer)
    }

    pub(crate) async fn remove(&self, key: &FlowKey) {
        self.conns.write().await.remove(key);
    }

    pub async fn connections(&self) -> Vec<Arc<Connection<F::Stream>>> {
        self.conns.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.conns.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conns.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembly::stream::Stream;
    use crate::reassembly::ScatterGather;
    use chrono::TimeZone;
    use std::future::Future;
    use std::net::Ipv4Addr;

    struct NullStream;

    impl Stream for NullStream {
        fn accept(
            &mut self,
            _segment: &TcpSegment<'_>,
            _info: &CaptureInfo,
            _dir: Direction,
            _next_seq: Sequence,
            _start: &mut bool,
        ) -> bool {
            true
        }

        fn reassembled(&mut self, _sg: &mut ScatterGather<'_>) -> impl Future<Output = ()> + Send {
            async {}
        }

        fn reassembly_complete(&mut self) -> impl Future<Output = bool> + Send {
            async { true }
        }
    }

    struct NullFactory;

    impl StreamFactory for NullFactory {
        type Stream = NullStream;

        fn new_stream(
            &self,
            _net: IpFlow,
            _transport: PortFlow,
            _segment: &TcpSegment<'_>,
            _info: &CaptureInfo,
        ) -> NullStream {
            NullStream
        }
    }

    fn key() -> FlowKey {
        FlowKey::new(
            IpFlow::new(
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            ),
            PortFlow::new(49152, 80),
        )
    }

    #[test]
    fn test_flow_key_reverse() {
        let k = key();
        let r = k.reverse();
        assert_eq!(r.net.src, k.net.dst);
        assert_eq!(r.transport.dst, k.transport.src);
        assert_eq!(r.reverse(), k);
        assert_eq!(k.ident(), "10.0.0.1:49152->10.0.0.2:80");
    }

    #[tokio::test]
    async fn test_both_directions_resolve_to_one_connection() {
        let stats = Arc::new(RwLock::new(ReassemblyStats::default()));
        let pool = StreamPool::new(NullFactory, stats.clone());
        let seen = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let seg = TcpSegment {
            src_port: 49152,
            dst_port: 80,
            seq: 1000,
            ack: 0,
            syn: true,
            ack_flag: false,
            fin: false,
            rst: false,
            payload: b"",
        };
        let info = CaptureInfo {
            timestamp: seen,
            length: 60,
        };
        let (a, dir_a) = pool.get_connection(key(), seen, &seg, &info).await;
        let (b, dir_b) = pool.get_connection(key().reverse(), seen, &seg, &info).await;
        assert_eq!(dir_a, Direction::ClientToServer);
        assert_eq!(dir_b, Direction::ServerToClient);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len().await, 1);
        assert_eq!(stats.read().await.total_connections, 1);

        pool.remove(&a.key).await;
        assert!(pool.is_empty().await);
    }
}
