// SPDX-License-Identifier: MIT
//! Reads classic pcap files without a capture library, parses the frame,
//! IP, and TCP layers, and feeds the segments into an assembler. Capture
//! timestamps drive the periodic flush sweeps.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::trace;
use zerocopy::*;
use zerocopy_derive::*;

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::reassembly::{
    Assembler, CaptureInfo, FlushOptions, IpFlow, ReassemblyStats, StreamFactory, TcpSegment,
};

/// Indicates which stage a packet reached during parsing.
#[derive(Debug)]
enum ParsingStage {
    FrameHeader,
    IpHeader,
    TcpHeader,
}

/// A summary of one processed capture file.
#[derive(Debug, Default)]
pub struct CaptureReport {
    /// Frames in the file.
    pub packets: u64,
    /// Frames that carried a TCP segment and were assembled.
    pub tcp_segments: u64,
    /// TCP payload bytes observed.
    pub payload_bytes: u64,
    /// Frames skipped because they were not IP or not TCP.
    pub skipped: u64,
    /// Half-connections pushed past a gap by the periodic flush.
    pub flushed: usize,
    /// Half-connections closed while processing.
    pub closed: usize,
    /// Per-packet parse failures.
    pub errors: Vec<String>,
    /// Final counter snapshot.
    pub stats: ReassemblyStats,
}

impl fmt::Display for CaptureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# Capture Report")?;
        writeln!(
            f,
            "{} packets, {} TCP segments ({} payload bytes), {} skipped",
            self.packets, self.tcp_segments, self.payload_bytes, self.skipped
        )?;
        writeln!(
            f,
            "{} halves flushed past gaps, {} halves closed during capture",
            self.flushed, self.closed
        )?;
        writeln!(f, "\nReassembly Statistics:\n{:#?}", self.stats)?;
        if !self.errors.is_empty() {
            writeln!(f, "\n## Errors")?;
            for (i, error) in self.errors.iter().enumerate() {
                writeln!(f, "  {}. {}", i + 1, error)?;
            }
        }
        Ok(())
    }
}

/// PCAP Global Header
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct PcapGlobalHeader {
    magic_number: u32,  // Magic number
    version_major: u16, // Major version number
    version_minor: u16, // Minor version number
    thiszone: i32,      // GMT to local correction
    sigfigs: u32,       // Accuracy of timestamps
    snaplen: u32,       // Max length of captured packets
    network: u32,       // Data link type
}

/// PCAP Packet Header
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Copy, Clone)]
#[repr(C, packed)]
struct PcapPacketHeader {
    ts_sec: u32,   // Timestamp seconds
    ts_usec: u32,  // Timestamp microseconds
    incl_len: u32, // Number of octets of packet saved in file
    orig_len: u32, // Actual length of packet
}

/// Ethernet Frame Header
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Copy, Clone)]
#[repr(C, packed)]
struct EthernetHeader {
    dst_mac: [u8; 6],
    src_mac: [u8; 6],
    ether_type: u16,
}

/// Null/Loopback Frame Header
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Copy, Clone)]
#[repr(C, packed)]
struct LoopbackHeader {
    family: u32,
}

/// IPv4 Header
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Copy, Clone)]
#[repr(C, packed)]
struct IPv4Header {
    version_ihl: u8,
    tos: u8,
    total_length: u16,
    identification: u16,
    flags_fragment: u16,
    ttl: u8,
    protocol: u8,
    header_checksum: u16,
    src_addr: [u8; 4],
    dst_addr: [u8; 4],
    // Options are variable and handled via the header length
}

impl IPv4Header {
    fn header_length(&self) -> usize {
        ((self.version_ihl & 0x0F) as usize) * 4
    }

    fn total_length(&self) -> usize {
        u16::from_be(self.total_length) as usize
    }
}

/// IPv6 Header
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Copy, Clone)]
#[repr(C, packed)]
struct IPv6Header {
    version_traffic_flow: u32,
    payload_length: u16,
    next_header: u8,
    hop_limit: u8,
    src_addr: [u8; 16],
    dst_addr: [u8; 16],
}

impl IPv6Header {
    fn payload_length(&self) -> usize {
        u16::from_be(self.payload_length) as usize
    }
}

/// TCP Header
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Copy, Clone)]
#[repr(C, packed)]
struct TcpHeader {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    data_offset_reserved: u8,
    flags: u8,
    window: u16,
    checksum: u16,
    urgent: u16,
}

const TCP_FIN: u8 = 0x01;
const TCP_SYN: u8 = 0x02;
const TCP_RST: u8 = 0x04;
const TCP_ACK: u8 = 0x10;

impl TcpHeader {
    fn src_port(&self) -> u16 {
        u16::from_be(self.src_port)
    }
    fn dst_port(&self) -> u16 {
        u16::from_be(self.dst_port)
    }
    fn seq(&self) -> u32 {
        u32::from_be(self.seq)
    }
    fn ack(&self) -> u32 {
        u32::from_be(self.ack)
    }
    fn data_offset(&self) -> usize {
        ((self.data_offset_reserved >> 4) as usize) * 4
    }
}

/// Data link type of the capture file.
#[derive(Debug, Clone, Copy, PartialEq)]
enum LinkType {
    Ethernet,
    Null,
    Unsupported(u32),
}

impl LinkType {
    fn from_network(network: u32) -> Self {
        match network {
            0 => LinkType::Null,
            1 => LinkType::Ethernet,
            other => LinkType::Unsupported(other),
        }
    }
}

struct ParsedSegment<'a> {
    net: IpFlow,
    segment: TcpSegment<'a>,
}

/// Parses one captured frame down to its TCP segment. `Ok(None)` means the
/// frame is well-formed but not TCP/IP and should be skipped.
fn parse_packet<'a>(
    data: &'a [u8],
    link: LinkType,
    swap_endian: bool,
) -> std::result::Result<Option<ParsedSegment<'a>>, (ParsingStage, String)> {
    let mut rem = data;

    // --- Frame header ---
    let ip_version = match link {
        LinkType::Ethernet => {
            let (eth, new_rem) = EthernetHeader::ref_from_prefix(rem).map_err(|_| {
                (
                    ParsingStage::FrameHeader,
                    "too small for Ethernet header".to_string(),
                )
            })?;
            rem = new_rem;
            match u16::from_be(eth.ether_type) {
                0x0800 => 4,
                0x86DD => 6,
                _ => return Ok(None),
            }
        }
        LinkType::Null => {
            let (lo, new_rem) = LoopbackHeader::ref_from_prefix(rem).map_err(|_| {
                (
                    ParsingStage::FrameHeader,
                    "too small for loopback header".to_string(),
                )
            })?;
            rem = new_rem;
            let family = if swap_endian {
                u32::from_be(lo.family)
            } else {
                u32::from_le(lo.family)
            };
            match family {
                2 => 4,
                24 | 28 | 30 => 6,
                _ => return Ok(None),
            }
        }
        LinkType::Unsupported(_) => return Ok(None),
    };

    // --- IP header ---
    let (src_ip, dst_ip, ip_payload_len) = if ip_version == 4 {
        let (ip, new_rem) = IPv4Header::ref_from_prefix(rem).map_err(|_| {
            (
                ParsingStage::IpHeader,
                "too small for IPv4 header".to_string(),
            )
        })?;
        if ip.protocol != 6 {
            return Ok(None);
        }
        let header_len = ip.header_length();
        if header_len < std::mem::size_of::<IPv4Header>() || ip.total_length() < header_len {
            return Err((
                ParsingStage::IpHeader,
                format!("bad IPv4 header length {header_len}"),
            ));
        }
        rem = if header_len > std::mem::size_of::<IPv4Header>() {
            rem.get(header_len..).ok_or((
                ParsingStage::IpHeader,
                "IPv4 options past end of frame".to_string(),
            ))?
        } else {
            new_rem
        };
        let src = IpAddr::V4(Ipv4Addr::from(ip.src_addr));
        let dst = IpAddr::V4(Ipv4Addr::from(ip.dst_addr));
        (src, dst, ip.total_length() - header_len)
    } else {
        let (ip, new_rem) = IPv6Header::ref_from_prefix(rem).map_err(|_| {
            (
                ParsingStage::IpHeader,
                "too small for IPv6 header".to_string(),
            )
        })?;
        // extension headers are not walked; anything but plain TCP is skipped
        if ip.next_header != 6 {
            return Ok(None);
        }
        rem = new_rem;
        let src = IpAddr::V6(Ipv6Addr::from(ip.src_addr));
        let dst = IpAddr::V6(Ipv6Addr::from(ip.dst_addr));
        (src, dst, ip.payload_length())
    };

    // --- TCP header ---
    let (tcp, new_rem) = TcpHeader::ref_from_prefix(rem).map_err(|_| {
        (
            ParsingStage::TcpHeader,
            "too small for TCP header".to_string(),
        )
    })?;
    let data_offset = tcp.data_offset();
    if data_offset < std::mem::size_of::<TcpHeader>() || ip_payload_len < data_offset {
        return Err((
            ParsingStage::TcpHeader,
            format!("bad TCP data offset {data_offset}"),
        ));
    }
    let options = data_offset - std::mem::size_of::<TcpHeader>();
    let rem = new_rem.get(options..).ok_or((
        ParsingStage::TcpHeader,
        "TCP options past end of frame".to_string(),
    ))?;
    // ignore link-layer padding past the IP total length
    let declared = ip_payload_len - data_offset;
    let payload = &rem[..declared.min(rem.len())];

    Ok(Some(ParsedSegment {
        net: IpFlow::new(src_ip, dst_ip),
        segment: TcpSegment {
            src_port: tcp.src_port(),
            dst_port: tcp.dst_port(),
            seq: tcp.seq(),
            ack: tcp.ack(),
            syn: tcp.flags & TCP_SYN != 0,
            ack_flag: tcp.flags & TCP_ACK != 0,
            fin: tcp.flags & TCP_FIN != 0,
            rst: tcp.flags & TCP_RST != 0,
            payload,
        },
    }))
}

/// Runs a capture file through the assembler. Flush sweeps fire on
/// `flush_interval` boundaries of capture time with `close_older_than` as
/// the close threshold; draining the pipeline afterwards is left to the
/// caller.
pub async fn process_pcap<F: StreamFactory, P: AsRef<Path>>(
    assembler: &mut Assembler<F>,
    config: &Config,
    path: P,
) -> Result<CaptureReport> {
    const PCAP_MAGIC: u32 = 0xa1b2c3d4;
    const PCAP_MAGIC_SWAPPED: u32 = 0xd4c3b2a1;
    const PCAP_HEADER_SIZE: usize = 24;
    const PACKET_HEADER_SIZE: usize = 16;

    let flush_interval = chrono::Duration::from_std(config.get_flush_interval()?)
        .map_err(|e| Error::Config(format!("flush interval out of range: {e}")))?;
    let close_older_than = chrono::Duration::from_std(config.get_close_older_than()?)
        .map_err(|e| Error::Config(format!("close threshold out of range: {e}")))?;

    let mut file = File::open(path)?;
    let mut global_header_buf = [0u8; PCAP_HEADER_SIZE];
    file.read_exact(&mut global_header_buf)?;
    let magic = u32::from_le_bytes(global_header_buf[0..4].try_into().unwrap());
    if magic != PCAP_MAGIC && magic != PCAP_MAGIC_SWAPPED {
        return Err(Error::Parse("Invalid PCAP magic number".to_string()));
    }
    let swap_endian = magic == PCAP_MAGIC_SWAPPED;
    let raw_network = u32::from_le_bytes(global_header_buf[20..24].try_into().unwrap());
    let network = if swap_endian {
        raw_network.swap_bytes()
    } else {
        raw_network
    };
    let link = LinkType::from_network(network);
    if let LinkType::Unsupported(other) = link {
        return Err(Error::Parse(format!("unsupported link type {other}")));
    }

    let mut report = CaptureReport::default();
    let mut packet_header_buf = [0u8; PACKET_HEADER_SIZE];
    let mut last_flush: Option<DateTime<Utc>> = None;

    while file.read_exact(&mut packet_header_buf).is_ok() {
        report.packets += 1;
        let field = |range: std::ops::Range<usize>| -> u32 {
            let bytes: [u8; 4] = packet_header_buf[range].try_into().unwrap();
            if swap_endian {
                u32::from_be_bytes(bytes)
            } else {
                u32::from_le_bytes(bytes)
            }
        };
        let pcap_hdr = PcapPacketHeader {
            ts_sec: field(0..4),
            ts_usec: field(4..8),
            incl_len: field(8..12),
            orig_len: field(12..16),
        };

        let mut packet_data = vec![0u8; pcap_hdr.incl_len as usize];
        if let Err(e) = file.read_exact(&mut packet_data) {
            report
                .errors
                .push(format!("Failed to read packet data: {e}"));
            break;
        }

        let timestamp = DateTime::from_timestamp(
            pcap_hdr.ts_sec as i64,
            pcap_hdr.ts_usec.saturating_mul(1000),
        )
        .unwrap_or_else(Utc::now);

        match parse_packet(&packet_data, link, swap_endian) {
            Ok(Some(parsed)) => {
                report.tcp_segments += 1;
                report.payload_bytes += parsed.segment.payload.len() as u64;
                trace!(
                    packet = report.packets,
                    seq = parsed.segment.seq,
                    len = parsed.segment.payload.len(),
                    "assembling segment"
                );
                let info = CaptureInfo {
                    timestamp,
                    length: pcap_hdr.orig_len as usize,
                };
                assembler.assemble(parsed.net, &parsed.segment, info).await;
            }
            Ok(None) => {
                report.skipped += 1;
            }
            Err((stage, err)) => {
                report
                    .errors
                    .push(format!("packet {}: {:?}: {}", report.packets, stage, err));
            }
        }

        match last_flush {
            None => last_flush = Some(timestamp),
            Some(prev) if timestamp - prev >= flush_interval => {
                let (flushed, closed) = assembler
                    .flush_with_options(FlushOptions {
                        t: timestamp - flush_interval,
                        tc: timestamp - close_older_than,
                    })
                    .await;
                report.flushed += flushed;
                report.closed += closed;
                last_flush = Some(timestamp);
            }
            Some(_) => {}
        }
    }

    report.stats = assembler.stats_snapshot().await;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembly::stream::Stream;
    use crate::reassembly::{
        AssemblerOptions, Direction, PortFlow, ScatterGather, Sequence, StreamPool,
    };
    use std::io::Write;
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::sync::RwLock;

    #[derive(Clone, Default)]
    struct Collected(Arc<StdMutex<Vec<(Direction, Vec<u8>)>>>);

    struct CollectStream(Collected);

    impl Stream for CollectStream {
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

        async fn reassembled(&mut self, sg: &mut ScatterGather<'_>) {
            let bytes = sg.fetch(sg.len()).into_owned();
            let (dir, _, _, _) = sg.info();
            if !bytes.is_empty() {
                self.0 .0.lock().unwrap().push((dir, bytes));
            }
        }

        async fn reassembly_complete(&mut self) -> bool {
            true
        }
    }

    #[derive(Clone, Default)]
    struct CollectFactory(Collected);

    impl StreamFactory for CollectFactory {
        type Stream = CollectStream;

        fn new_stream(
            &self,
            _net: IpFlow,
            _transport: PortFlow,
            _segment: &TcpSegment<'_>,
            _info: &CaptureInfo,
        ) -> CollectStream {
            CollectStream(self.0.clone())
        }
    }

    fn tcp_packet(
        src: [u8; 4],
        dst: [u8; 4],
        src_port: u16,
        dst_port: u16,
        seq: u32,
        flags: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let eth = EthernetHeader {
            dst_mac: [0; 6],
            src_mac: [0; 6],
            ether_type: 0x0800u16.to_be(),
        };
        let total_length = 20 + 20 + payload.len();
        let ip = IPv4Header {
            version_ihl: 0x45,
            tos: 0,
            total_length: (total_length as u16).to_be(),
            identification: 0,
            flags_fragment: 0,
            ttl: 64,
            protocol: 6,
            header_checksum: 0,
            src_addr: src,
            dst_addr: dst,
        };
        let tcp = TcpHeader {
            src_port: src_port.to_be(),
            dst_port: dst_port.to_be(),
            seq: seq.to_be(),
            ack: 0,
            data_offset_reserved: 0x50,
            flags,
            window: 0xffffu16.to_be(),
            checksum: 0,
            urgent: 0,
        };
        let mut frame = Vec::new();
        frame.extend_from_slice(eth.as_bytes());
        frame.extend_from_slice(ip.as_bytes());
        frame.extend_from_slice(tcp.as_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    fn write_pcap(packets: &[(u32, Vec<u8>)]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let global = PcapGlobalHeader {
            magic_number: 0xa1b2c3d4u32.to_le(),
            version_major: 2u16.to_le(),
            version_minor: 4u16.to_le(),
            thiszone: 0,
            sigfigs: 0,
            snaplen: 65535u32.to_le(),
            network: 1u32.to_le(),
        };
        file.write_all(global.as_bytes()).unwrap();
        for (ts_sec, frame) in packets {
            let hdr = PcapPacketHeader {
                ts_sec: ts_sec.to_le(),
                ts_usec: 0,
                incl_len: (frame.len() as u32).to_le(),
                orig_len: (frame.len() as u32).to_le(),
            };
            file.write_all(hdr.as_bytes()).unwrap();
            file.write_all(frame).unwrap();
        }
        file.flush().unwrap();
        file
    }

    const CLIENT: [u8; 4] = [10, 0, 0, 1];
    const SERVER: [u8; 4] = [10, 0, 0, 2];

    #[test]
    fn test_parse_ethernet_ipv4_tcp() {
        let frame = tcp_packet(CLIENT, SERVER, 49152, 80, 1000, TCP_SYN, b"");
        let parsed = parse_packet(&frame, LinkType::Ethernet, false)
            .unwrap()
            .unwrap();
        assert_eq!(parsed.segment.src_port, 49152);
        assert_eq!(parsed.segment.dst_port, 80);
        assert_eq!(parsed.segment.seq, 1000);
        assert!(parsed.segment.syn);
        assert!(!parsed.segment.fin);
        assert!(parsed.segment.payload.is_empty());
        assert_eq!(parsed.net.src, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_parse_ignores_link_padding() {
        let mut frame = tcp_packet(CLIENT, SERVER, 49152, 80, 1001, TCP_ACK, b"AB");
        frame.extend_from_slice(&[0u8; 6]);
        let parsed = parse_packet(&frame, LinkType::Ethernet, false)
            .unwrap()
            .unwrap();
        assert_eq!(parsed.segment.payload, b"AB");
    }

    #[test]
    fn test_parse_non_tcp_is_skipped() {
        let mut frame = tcp_packet(CLIENT, SERVER, 1, 2, 0, 0, b"");
        frame[23] = 17; // ip protocol byte
        assert!(parse_packet(&frame, LinkType::Ethernet, false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_truncated_errors() {
        let frame = tcp_packet(CLIENT, SERVER, 1, 2, 0, 0, b"");
        assert!(parse_packet(&frame[..20], LinkType::Ethernet, false).is_err());
    }

    #[tokio::test]
    async fn test_process_pcap_reassembles_both_directions() {
        let packets = vec![
            (100, tcp_packet(CLIENT, SERVER, 49152, 80, 1000, TCP_SYN, b"")),
            (
                100,
                tcp_packet(SERVER, CLIENT, 80, 49152, 5000, TCP_SYN | TCP_ACK, b""),
            ),
            (
                101,
                tcp_packet(CLIENT, SERVER, 49152, 80, 1001, TCP_ACK, b"GET / HTTP/1.0\r\n\r\n"),
            ),
            (
                102,
                tcp_packet(SERVER, CLIENT, 80, 49152, 5001, TCP_ACK, b"HTTP/1.0 200 OK\r\n"),
            ),
            (
                103,
                tcp_packet(CLIENT, SERVER, 49152, 80, 1019, TCP_FIN | TCP_ACK, b""),
            ),
            (
                104,
                tcp_packet(SERVER, CLIENT, 80, 49152, 5018, TCP_FIN | TCP_ACK, b""),
            ),
        ];
        let file = write_pcap(&packets);

        let collected = Collected::default();
        let stats = Arc::new(RwLock::new(ReassemblyStats::default()));
        let pool = Arc::new(StreamPool::new(
            CollectFactory(collected.clone()),
            stats.clone(),
        ));
        let mut assembler = Assembler::new(pool, AssemblerOptions::default(), stats);
        let config = Config::default();

        let report = process_pcap(&mut assembler, &config, file.path())
            .await
            .unwrap();
        assert_eq!(report.packets, 6);
        assert_eq!(report.tcp_segments, 6);
        assert!(report.errors.is_empty());
        assert_eq!(report.stats.total_connections, 1);

        let runs = collected.0.lock().unwrap();
        let c2s: Vec<u8> = runs
            .iter()
            .filter(|(d, _)| *d == Direction::ClientToServer)
            .flat_map(|(_, b)| b.clone())
            .collect();
        let s2c: Vec<u8> = runs
            .iter()
            .filter(|(d, _)| *d == Direction::ServerToClient)
            .flat_map(|(_, b)| b.clone())
            .collect();
        assert_eq!(c2s, b"GET / HTTP/1.0\r\n\r\n");
        assert_eq!(s2c, b"HTTP/1.0 200 OK\r\n");
    }
}
