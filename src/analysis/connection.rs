// SPDX-License-Identifier: MIT
//! The per-connection consumer wired between the reassembler and the two
//! reader tasks, plus the conversation buffers both readers share.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use crate::reassembly::stream::{CaptureInfo, Stream, TcpSegment};
use crate::reassembly::{Direction, IpFlow, PortFlow, ScatterGather, Sequence};

pub(crate) const ANSI_RED: &[u8] = b"\x1b[31m";
pub(crate) const ANSI_BLUE: &[u8] = b"\x1b[34m";
pub(crate) const ANSI_RESET: &[u8] = b"\x1b[0m";

/// Append-only buffers for one connection's reconstructed traffic. Owned
/// jointly by the two reader halves; the wrapping mutex is the sole access
/// discipline.
pub struct Conversation {
    pub ident: String,
    pub first_packet: DateTime<Utc>,
    pub net: IpFlow,
    pub transport: PortFlow,
    pub raw: Vec<u8>,
    pub colored: Vec<u8>,
    pub client_data: Vec<u8>,
    pub server_data: Vec<u8>,
    pub(crate) first_reader_done: bool,
}

impl Conversation {
    pub(crate) fn new(
        ident: String,
        first_packet: DateTime<Utc>,
        net: IpFlow,
        transport: PortFlow,
    ) -> Self {
        Conversation {
            ident,
            first_packet,
            net,
            transport,
            raw: Vec::new(),
            colored: Vec::new(),
            client_data: Vec::new(),
            server_data: Vec::new(),
            first_reader_done: false,
        }
    }
}

/// The consumer the factory creates for each tracked connection. Forwards
/// ordered byte runs into the per-direction channels; dropping the senders
/// at completion is the readers' end-of-stream signal.
pub struct TcpConnectionStream {
    pub(crate) ident: String,
    pub(crate) client_tx: Option<mpsc::Sender<Vec<u8>>>,
    pub(crate) server_tx: Option<mpsc::Sender<Vec<u8>>>,
    pub(crate) allow_missing_init: bool,
}

impl Stream for TcpConnectionStream {
    fn accept(
        &mut self,
        _segment: &TcpSegment<'_>,
        _info: &CaptureInfo,
        _dir: Direction,
        _next_seq: Sequence,
        start: &mut bool,
    ) -> bool {
        if self.allow_missing_init && !*start {
            *start = true;
        }
        true
    }

    async fn reassembled(&mut self, sg: &mut ScatterGather<'_>) {
        let (dir, _start, _end, skip) = sg.info();
        if skip > 0 {
            debug!(ident = %self.ident, %dir, skip, "missing bytes before delivery");
        }
        let data = sg.fetch(sg.len());
        if data.is_empty() {
            return;
        }
        let tx = match dir {
            Direction::ClientToServer => self.client_tx.as_ref(),
            Direction::ServerToClient => self.server_tx.as_ref(),
        };
        if let Some(tx) = tx {
            if tx.send(data.into_owned()).await.is_err() {
                debug!(ident = %self.ident, %dir, "reader gone, dropping delivery");
            }
        }
    }

    async fn reassembly_complete(&mut self) -> bool {
        debug!(ident = %self.ident, "reassembly complete");
        self.client_tx.take();
        self.server_tx.take();
        true
    }
}
