//! Snoop (RFC 1761) capture container reader

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;

use bytes::{Buf, Bytes};
use tracing::{debug, trace};

use super::{DatagramKind, UdpDatagram};
use crate::{Error, Result};

pub const SNOOP_MAGIC: [u8; 8] = *b"snoop\0\0\0";
pub const SNOOP_VERSION: u32 = 2;
pub const LINK_TYPE_ETHERNET: u32 = 4;

const FILE_HEADER_LEN: usize = 16;
const RECORD_HEADER_LEN: usize = 24;
/// Largest IP packet plus Ethernet/VLAN framing, rounded up to the record alignment
const MAX_RECORD_BODY_LEN: usize = 65_535 + 32;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_VLAN: u16 = 0x8100;
const IP_PROTOCOL_UDP: u8 = 17;

/// One packet record of the container
#[derive(Debug, Clone)]
pub struct SnoopRecord {
    pub original_len: u32,
    pub included_len: u32,
    pub cumulative_drops: u32,
    pub timestamp_us: u64,
    pub frame: Bytes,
}

pub struct SnoopReader<R: Read> {
    reader: R,
    records_read: usize,
}

impl SnoopReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> SnoopReader<R> {
    /// Validates the container header and positions the reader on the first record.
    pub fn new(mut reader: R) -> Result<Self> {
        let mut header = [0u8; FILE_HEADER_LEN];
        reader.read_exact(&mut header).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => Error::format("capture header is truncated"),
            _ => Error::Io(e),
        })?;

        let mut buf = &header[..];
        if buf[..8] != SNOOP_MAGIC {
            return Err(Error::format("not a snoop capture (bad magic)"));
        }
        buf.advance(8);

        let version = buf.get_u32();
        if version != SNOOP_VERSION {
            return Err(Error::format(format!("unsupported snoop version {}", version)));
        }

        let link_type = buf.get_u32();
        if link_type != LINK_TYPE_ETHERNET {
            return Err(Error::format(format!("unsupported link type {}", link_type)));
        }

        Ok(Self {
            reader,
            records_read: 0,
        })
    }

    /// Reads the next record, `None` at a clean end of file.
    pub fn next_record(&mut self) -> Result<Option<SnoopRecord>> {
        let mut header = [0u8; RECORD_HEADER_LEN];
        match read_fully(&mut self.reader, &mut header)? {
            0 => return Ok(None),
            RECORD_HEADER_LEN => {}
            n => {
                return Err(Error::format(format!(
                    "record {} header truncated after {} bytes",
                    self.records_read + 1,
                    n
                )))
            }
        }

        let mut buf = &header[..];
        let original_len = buf.get_u32();
        let included_len = buf.get_u32();
        let record_len = buf.get_u32() as usize;
        let cumulative_drops = buf.get_u32();
        let seconds = buf.get_u32() as u64;
        let micros = buf.get_u32() as u64;

        if record_len < RECORD_HEADER_LEN || record_len - RECORD_HEADER_LEN > MAX_RECORD_BODY_LEN {
            return Err(Error::format(format!(
                "record {} has invalid length {}",
                self.records_read + 1,
                record_len
            )));
        }

        let mut data = vec![0u8; record_len - RECORD_HEADER_LEN];
        if read_fully(&mut self.reader, &mut data)? != data.len() {
            return Err(Error::format(format!(
                "record {} body truncated",
                self.records_read + 1
            )));
        }

        // Drop the alignment padding
        data.truncate((included_len as usize).min(data.len()));
        self.records_read += 1;

        Ok(Some(SnoopRecord {
            original_len,
            included_len,
            cumulative_drops,
            timestamp_us: seconds * 1_000_000 + micros,
            frame: Bytes::from(data),
        }))
    }

    /// Reads every record and keeps the UDP datagrams.
    ///
    /// Datagrams touching one of `signaling_ports` are tagged as signaling.
    pub fn read_datagrams(mut self, signaling_ports: &[u16]) -> Result<Vec<UdpDatagram>> {
        let mut datagrams = Vec::new();

        while let Some(record) = self.next_record()? {
            let index = self.records_read;
            let Some((src, dst, payload)) = decode_udp(record.frame) else {
                trace!("Record {} is not IPv4/UDP, skipped", index);
                continue;
            };

            let kind = if signaling_ports.contains(&src.port()) || signaling_ports.contains(&dst.port()) {
                DatagramKind::Signaling
            } else {
                DatagramKind::Unknown
            };

            datagrams.push(UdpDatagram {
                index,
                timestamp_us: record.timestamp_us,
                src,
                dst,
                kind,
                payload,
            });
        }

        debug!(
            "Read {} records, {} UDP datagrams",
            self.records_read,
            datagrams.len()
        );
        Ok(datagrams)
    }
}

/// Strips Ethernet/IPv4/UDP headers, `None` for anything else.
pub fn decode_udp(mut frame: Bytes) -> Option<(SocketAddrV4, SocketAddrV4, Bytes)> {
    if frame.len() < 14 {
        return None;
    }
    frame.advance(12);
    let mut ethertype = frame.get_u16();
    if ethertype == ETHERTYPE_VLAN {
        if frame.len() < 4 {
            return None;
        }
        frame.advance(2);
        ethertype = frame.get_u16();
    }
    if ethertype != ETHERTYPE_IPV4 || frame.len() < 20 {
        return None;
    }

    let version_ihl = frame[0];
    if version_ihl >> 4 != 4 {
        return None;
    }
    let header_len = (version_ihl & 0x0f) as usize * 4;
    if header_len < 20 || frame.len() < header_len {
        return None;
    }

    let fragment = u16::from_be_bytes([frame[6], frame[7]]);
    if fragment & 0x1fff != 0 {
        // Only first fragments carry the UDP header
        return None;
    }
    if frame[9] != IP_PROTOCOL_UDP {
        return None;
    }
    let src_ip = Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]);
    let dst_ip = Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]);
    frame.advance(header_len);

    if frame.len() < 8 {
        return None;
    }
    let src_port = frame.get_u16();
    let dst_port = frame.get_u16();
    let udp_len = frame.get_u16() as usize;
    let _checksum = frame.get_u16();

    let payload_len = udp_len.saturating_sub(8).min(frame.len());
    Some((
        SocketAddrV4::new(src_ip, src_port),
        SocketAddrV4::new(dst_ip, dst_port),
        frame.slice(..payload_len),
    ))
}

fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ethernet_udp_frame, TraceBuilder};
    use std::io::Cursor;

    fn addr(ip: [u8; 4], port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(ip), port)
    }

    #[test]
    fn test_rejects_bad_header() {
        let mut bytes = TraceBuilder::new().build();
        bytes[0] = b'x';
        assert!(matches!(SnoopReader::new(Cursor::new(bytes)), Err(Error::Format(_))));

        let mut bytes = TraceBuilder::new().build();
        bytes[11] = 1;
        assert!(matches!(SnoopReader::new(Cursor::new(bytes)), Err(Error::Format(_))));

        let mut bytes = TraceBuilder::new().build();
        bytes[15] = 9;
        assert!(matches!(SnoopReader::new(Cursor::new(bytes)), Err(Error::Format(_))));

        assert!(matches!(
            SnoopReader::new(Cursor::new(b"snoop".to_vec())),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_reads_udp_datagrams_and_tags_signaling() {
        let a = addr([10, 0, 0, 1], 5060);
        let b = addr([10, 0, 0, 2], 5060);
        let ma = addr([10, 0, 0, 1], 40000);
        let mb = addr([10, 0, 0, 2], 50000);

        let mut builder = TraceBuilder::new();
        builder
            .udp(1_000_000, a, b, b"INVITE")
            .raw_frame(1_000_100, vec![0u8; 20])
            .udp(1_500_042, ma, mb, &[0x80, 0x00, 0x00, 0x01]);
        let bytes = builder.build();

        let reader = SnoopReader::new(Cursor::new(bytes)).unwrap();
        let datagrams = reader.read_datagrams(&[5060, 5061]).unwrap();

        assert_eq!(datagrams.len(), 2);
        assert_eq!(datagrams[0].index, 1);
        assert_eq!(datagrams[0].kind, DatagramKind::Signaling);
        assert_eq!(&datagrams[0].payload[..], b"INVITE");
        assert_eq!(datagrams[1].index, 3);
        assert_eq!(datagrams[1].kind, DatagramKind::Unknown);
        assert_eq!(datagrams[1].timestamp_label(), "1.500042");
        assert_eq!(datagrams[1].src, ma);
        assert_eq!(datagrams[1].dst, mb);
    }

    #[test]
    fn test_truncated_record_is_format_error() {
        let mut builder = TraceBuilder::new();
        builder.udp(0, addr([1, 1, 1, 1], 1), addr([2, 2, 2, 2], 2), b"payload");
        let mut bytes = builder.build();
        bytes.truncate(bytes.len() - 3);

        let reader = SnoopReader::new(Cursor::new(bytes)).unwrap();
        assert!(matches!(reader.read_datagrams(&[5060]), Err(Error::Format(_))));
    }

    #[test]
    fn test_oversized_record_length_is_format_error() {
        let mut builder = TraceBuilder::new();
        builder.udp(0, addr([1, 1, 1, 1], 1), addr([2, 2, 2, 2], 2), b"payload");
        let mut bytes = builder.build();
        // Record length field of the first record
        let field = FILE_HEADER_LEN + 8;
        bytes[field..field + 4].copy_from_slice(&0x7fff_ff00u32.to_be_bytes());

        let mut reader = SnoopReader::new(Cursor::new(bytes)).unwrap();
        let err = reader.next_record().unwrap_err();
        assert!(matches!(err, Error::Format(_)), "{}", err);
    }

    #[test]
    fn test_decode_udp_skips_non_udp() {
        let mut frame = ethernet_udp_frame(addr([1, 1, 1, 1], 1), addr([2, 2, 2, 2], 2), b"x");
        assert!(decode_udp(Bytes::from(frame.clone())).is_some());

        // Protocol TCP
        frame[14 + 9] = 6;
        assert!(decode_udp(Bytes::from(frame.clone())).is_none());

        // ARP
        frame[12] = 0x08;
        frame[13] = 0x06;
        assert!(decode_udp(Bytes::from(frame)).is_none());
    }
}
