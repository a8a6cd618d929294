//! RTP (Real-time Transport Protocol) decoding and IVR event payloads

use bytes::{Buf, Bytes};
use tracing::error;

use crate::ivr::{IvrEvent, IvrEventKind};
use crate::protocols::dtmf::DtmfDigit;
use crate::{Error, Result};

pub const RTP_HEADER_LEN: usize = 12;

/// G.711 mu-law audio
pub const PT_PCMU: u8 = 0;
pub const PT_COMFORT_NOISE: u8 = 13;
/// Private type carrying the name of a file the IVR recorded
pub const PT_IVR_RECORD_FILE: u8 = 126;
/// Private type carrying the list of prompts the IVR played
pub const PT_IVR_PROMPTS: u8 = 127;

/// Decoded view of one RTP datagram.
///
/// Only what replay needs is kept; CSRCs, header extensions and padding are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.len() < RTP_HEADER_LEN {
            return Err(Error::format(format!("RTP datagram of {} bytes", data.len())));
        }

        let flags = data.get_u8();
        if flags >> 6 != 2 {
            return Err(Error::format(format!("RTP version {}", flags >> 6)));
        }
        let marker_and_type = data.get_u8();
        let sequence_number = data.get_u16();
        let timestamp = data.get_u32();
        let ssrc = data.get_u32();

        let csrc_len = (flags & 0x0f) as usize * 4;
        if data.remaining() < csrc_len {
            return Err(Error::format("RTP CSRC list runs past the datagram"));
        }
        data.advance(csrc_len);

        if flags & 0x10 != 0 {
            if data.remaining() < 4 {
                return Err(Error::format("RTP extension header truncated"));
            }
            data.advance(2);
            let words = data.get_u16() as usize;
            if data.remaining() < words * 4 {
                return Err(Error::format("RTP extension runs past the datagram"));
            }
            data.advance(words * 4);
        }

        if flags & 0x20 != 0 {
            let pad = data.last().copied().unwrap_or_default() as usize;
            if pad == 0 || pad > data.len() {
                return Err(Error::format(format!("RTP padding of {} bytes", pad)));
            }
            data.truncate(data.len() - pad);
        }

        Ok(Self {
            marker: marker_and_type & 0x80 != 0,
            payload_type: marker_and_type & 0x7f,
            sequence_number,
            timestamp,
            ssrc,
            payload: data,
        })
    }

    /// Telephone-event digit, when this packet uses the negotiated event type.
    pub fn dtmf_digit(&self, telephone_event_pt: Option<u8>) -> Option<DtmfDigit> {
        match telephone_event_pt {
            Some(pt) if pt == self.payload_type => DtmfDigit::from_payload(&self.payload),
            _ => None,
        }
    }

    /// Decodes the IVR events carried by the two private payload types.
    pub fn ivr_events(&self) -> Result<Vec<IvrEvent>> {
        match self.payload_type {
            PT_IVR_RECORD_FILE => Ok(vec![decode_record_file(&self.payload)]),
            PT_IVR_PROMPTS => decode_prompt_list(&self.payload),
            other => Err(Error::UnsupportedPayloadType(other)),
        }
    }
}

/// Payload type without decoding the whole header.
pub fn quick_payload_type(data: &[u8]) -> Option<u8> {
    data.get(1).map(|b| b & 0x7f)
}

/// Copy of `data` with its payload type replaced, the marker bit is kept.
pub fn with_payload_type(data: &[u8], payload_type: u8) -> Vec<u8> {
    let mut out = data.to_vec();
    if let Some(byte) = out.get_mut(1) {
        *byte = (*byte & 0x80) | (payload_type & 0x7f);
    }
    out
}

/// Record file payload: one flag byte then a NUL-terminated name.
fn decode_record_file(payload: &[u8]) -> IvrEvent {
    let body = payload.get(1..).unwrap_or_default();
    let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    IvrEvent::new(
        IvrEventKind::RecordFile,
        String::from_utf8_lossy(&body[..end]).trim().to_string(),
    )
}

/// Prompt payload: a count byte, then NUL-separated prompt paths.
fn decode_prompt_list(payload: &[u8]) -> Result<Vec<IvrEvent>> {
    let Some((&count, body)) = payload.split_first() else {
        return Err(Error::format("empty IVR prompt payload"));
    };

    let entries: Vec<String> = body
        .split(|&b| b == 0)
        .map(|entry| String::from_utf8_lossy(entry).trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect();

    if entries.len() < count as usize {
        return Err(Error::format(format!(
            "IVR prompt payload announces {} entries but carries {}",
            count,
            entries.len()
        )));
    }

    let mut events = Vec::with_capacity(count as usize);
    for entry in entries.into_iter().take(count as usize) {
        match IvrEventKind::classify_prompt(&entry) {
            Some(kind) => events.push(IvrEvent::new(kind, entry)),
            None => error!("Unknown IVR prompt type: {}", entry),
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{prompt_payload, record_file_payload, rtp_bytes};

    #[test]
    fn test_decode_header_fields() {
        let raw = rtp_bytes(0x80 | PT_IVR_PROMPTS, 12345, 67890, b"test payload");
        let packet = RtpPacket::decode(Bytes::from(raw)).unwrap();

        assert!(packet.marker);
        assert_eq!(packet.payload_type, PT_IVR_PROMPTS);
        assert_eq!(packet.sequence_number, 12345);
        assert_eq!(packet.timestamp, 67890);
        assert_eq!(packet.ssrc, 0x0bad_cafe);
        assert_eq!(&packet.payload[..], b"test payload");
    }

    #[test]
    fn test_decode_strips_padding() {
        let mut raw = rtp_bytes(PT_PCMU, 1, 160, b"ab");
        raw[0] |= 0x20;
        raw.extend_from_slice(&[0, 0, 3]);
        let packet = RtpPacket::decode(Bytes::from(raw)).unwrap();
        assert_eq!(&packet.payload[..], b"ab");

        let mut bad = rtp_bytes(PT_PCMU, 1, 160, b"");
        bad[0] |= 0x20;
        bad.push(9);
        assert!(matches!(RtpPacket::decode(Bytes::from(bad)), Err(Error::Format(_))));
    }

    #[test]
    fn test_decode_skips_csrc_and_extension() {
        let mut raw = vec![0x80 | 0x10 | 0x02, 0x7f, 0, 1, 0, 0, 0, 160, 1, 2, 3, 4];
        raw.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 2]); // two CSRCs
        raw.extend_from_slice(&[0xbe, 0xde, 0, 1, 9, 9, 9, 9]); // one word of extension
        raw.extend_from_slice(b"XY");

        let packet = RtpPacket::decode(Bytes::from(raw)).unwrap();
        assert_eq!(packet.payload_type, PT_IVR_PROMPTS);
        assert_eq!(&packet.payload[..], b"XY");
    }

    #[test]
    fn test_decode_rejects_truncated_csrc() {
        let raw = vec![0x83, 0x00, 0, 1, 0, 0, 0, 160, 1, 2, 3, 4, 0, 0];
        assert!(matches!(RtpPacket::decode(Bytes::from(raw)), Err(Error::Format(_))));
        assert!(RtpPacket::decode(Bytes::from_static(&[0x80, 0])).is_err());
    }

    #[test]
    fn test_quick_accessors() {
        let raw = rtp_bytes(0x80 | 101, 7, 0x01020304, &[5]);
        assert_eq!(quick_payload_type(&raw), Some(101));
        assert_eq!(quick_payload_type(&[0x80]), None);

        let rewritten = with_payload_type(&raw, 96);
        assert_eq!(rewritten[1], 0x80 | 96);
        assert_eq!(&rewritten[2..], &raw[2..]);
    }

    #[test]
    fn test_dtmf_digit() {
        let packet = RtpPacket::decode(Bytes::from(rtp_bytes(101, 1, 160, &[11, 0x0a, 0, 160]))).unwrap();
        assert_eq!(packet.dtmf_digit(Some(101)).unwrap().label(), "#");
        assert!(packet.dtmf_digit(Some(100)).is_none());
        assert!(packet.dtmf_digit(None).is_none());
    }

    #[test]
    fn test_record_file_event() {
        let raw = rtp_bytes(PT_IVR_RECORD_FILE, 1, 160, &record_file_payload("rec\\caller01.wav"));
        let packet = RtpPacket::decode(Bytes::from(raw)).unwrap();
        let events = packet.ivr_events().unwrap();
        assert_eq!(events, vec![IvrEvent::new(IvrEventKind::RecordFile, "rec\\caller01.wav")]);
    }

    #[test]
    fn test_prompt_list_event() {
        let payload = prompt_payload(&[
            "d:\\ivr\\speak.vox\\E1JA348",
            "d:\\ivr\\system32.vox\\busy",
            "d:\\ivr\\music\\hold",
        ]);
        let raw = rtp_bytes(PT_IVR_PROMPTS, 1, 160, &payload);
        let packet = RtpPacket::decode(Bytes::from(raw)).unwrap();
        let events = packet.ivr_events().unwrap();

        // Unclassifiable entries are dropped
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, IvrEventKind::Speak);
        assert_eq!(events[1].kind, IvrEventKind::System);
    }

    #[test]
    fn test_prompt_list_missing_entries() {
        let mut payload = vec![3u8];
        payload.extend_from_slice(b"d:\\speak.vox\\a\0\0");
        assert!(matches!(decode_prompt_list(&payload), Err(Error::Format(_))));
    }

    #[test]
    fn test_unsupported_ivr_type() {
        let packet = RtpPacket::decode(Bytes::from(rtp_bytes(PT_PCMU, 1, 160, &[0xff; 4]))).unwrap();
        assert!(matches!(packet.ivr_events(), Err(Error::UnsupportedPayloadType(0))));
    }
}
