//! Capture file reading
//!
//! Traces are read once per case and reduced to the UDP datagrams they carry.
//! Everything that is not IPv4/UDP over Ethernet is skipped.

pub mod snoop;

use std::fmt;
use std::net::SocketAddrV4;

use bytes::Bytes;

pub use snoop::{decode_udp, SnoopReader, SnoopRecord};

/// Coarse classification made while reading, before any dialog correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramKind {
    /// Either port is one of the configured signaling ports
    Signaling,
    /// Anything else; media is only recognised later by the segmenter
    Unknown,
}

/// One UDP datagram taken out of a capture record.
#[derive(Debug, Clone)]
pub struct UdpDatagram {
    /// 1-based record position inside the trace
    pub index: usize,
    pub timestamp_us: u64,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub kind: DatagramKind,
    pub payload: Bytes,
}

impl UdpDatagram {
    pub fn timestamp_label(&self) -> String {
        format_timestamp(self.timestamp_us)
    }
}

impl fmt::Display for UdpDatagram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} -> {} ({} bytes)",
            self.index,
            self.timestamp_label(),
            self.src,
            self.dst,
            self.payload.len()
        )
    }
}

/// Renders a microsecond timestamp as `seconds.micros`.
pub fn format_timestamp(timestamp_us: u64) -> String {
    format!("{}.{:06}", timestamp_us / 1_000_000, timestamp_us % 1_000_000)
}
