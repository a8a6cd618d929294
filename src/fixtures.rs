//! Synthetic captures for tests

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::BufMut;

use crate::capture::snoop::{LINK_TYPE_ETHERNET, SNOOP_MAGIC, SNOOP_VERSION};

pub const SPEAK_PROMPT: &str = "d:\\ivr\\speak.vox\\E1JA348";
pub const CALLER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const IVR_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const CALLER_MEDIA_PORT: u16 = 40000;
pub const IVR_MEDIA_PORT: u16 = 50000;
pub const TELEPHONE_EVENT_PT: u8 = 101;

#[derive(Debug, Default)]
pub struct TraceBuilder {
    records: Vec<(u64, Vec<u8>)>,
}

impl TraceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn udp(&mut self, timestamp_us: u64, src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> &mut Self {
        self.records.push((timestamp_us, ethernet_udp_frame(src, dst, payload)));
        self
    }

    pub fn raw_frame(&mut self, timestamp_us: u64, frame: Vec<u8>) -> &mut Self {
        self.records.push((timestamp_us, frame));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&SNOOP_MAGIC);
        out.put_u32(SNOOP_VERSION);
        out.put_u32(LINK_TYPE_ETHERNET);

        for (timestamp_us, frame) in &self.records {
            let padded = (frame.len() + 3) & !3;
            out.put_u32(frame.len() as u32);
            out.put_u32(frame.len() as u32);
            out.put_u32((24 + padded) as u32);
            out.put_u32(0);
            out.put_u32((timestamp_us / 1_000_000) as u32);
            out.put_u32((timestamp_us % 1_000_000) as u32);
            out.extend_from_slice(frame);
            out.resize(out.len() + padded - frame.len(), 0);
        }
        out
    }
}

pub fn ethernet_udp_frame(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(42 + payload.len());
    frame.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    frame.extend_from_slice(&[0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb]);
    frame.put_u16(0x0800);

    frame.put_u8(0x45);
    frame.put_u8(0);
    frame.put_u16((20 + 8 + payload.len()) as u16);
    frame.put_u16(0x1234);
    frame.put_u16(0x4000);
    frame.put_u8(64);
    frame.put_u8(17);
    frame.put_u16(0);
    frame.extend_from_slice(&src.ip().octets());
    frame.extend_from_slice(&dst.ip().octets());

    frame.put_u16(src.port());
    frame.put_u16(dst.port());
    frame.put_u16((8 + payload.len()) as u16);
    frame.put_u16(0);
    frame.extend_from_slice(payload);
    frame
}

/// RTP packet with the given second header byte (marker and payload type).
pub fn rtp_bytes(marker_and_pt: u8, sequence: u16, timestamp: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + payload.len());
    out.put_u8(0x80);
    out.put_u8(marker_and_pt);
    out.put_u16(sequence);
    out.put_u32(timestamp);
    out.put_u32(0x0bad_cafe);
    out.extend_from_slice(payload);
    out
}

pub fn prompt_payload(entries: &[&str]) -> Vec<u8> {
    let mut out = vec![entries.len() as u8];
    for entry in entries {
        out.extend_from_slice(entry.as_bytes());
        out.push(0);
    }
    out
}

pub fn record_file_payload(name: &str) -> Vec<u8> {
    let mut out = vec![1u8];
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    out
}

/// A recorded call to the IVR: INVITE, 100, 183, 200, ACK, one RTP frame,
/// the prompts and finally a BYE.
#[derive(Debug, Clone)]
pub struct CallTrace {
    /// One received prompt payload per element
    pub prompts: Vec<Vec<String>>,
    /// Extra copies of every prompt payload with the same RTP timestamp
    pub prompt_repeats: usize,
    pub with_bye: bool,
    pub bye_from_destination: bool,
    /// Number of consecutive dialogs
    pub repeat: usize,
}

impl Default for CallTrace {
    fn default() -> Self {
        Self {
            prompts: vec![vec![SPEAK_PROMPT.to_string()]],
            prompt_repeats: 0,
            with_bye: true,
            bye_from_destination: false,
            repeat: 1,
        }
    }
}

impl CallTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prompt(prompt: &str) -> Self {
        Self {
            prompts: vec![vec![prompt.to_string()]],
            ..Self::default()
        }
    }

    pub fn build(&self) -> Vec<u8> {
        let caller_sip = SocketAddrV4::new(CALLER_IP, 5060);
        let ivr_sip = SocketAddrV4::new(IVR_IP, 5060);
        let caller_rtp = SocketAddrV4::new(CALLER_IP, CALLER_MEDIA_PORT);
        let ivr_rtp = SocketAddrV4::new(IVR_IP, IVR_MEDIA_PORT);

        let mut builder = TraceBuilder::new();
        for dialog in 0..self.repeat {
            let t0 = 1_700_000_000_000_000 + dialog as u64 * 10_000_000;
            let from_tag = format!("ftag{}", dialog);
            let to_tag = format!("ttag{}", dialog);
            let call_id = format!("call{}@{}", dialog, CALLER_IP);

            builder
                .udp(t0, caller_sip, ivr_sip, invite(&from_tag, &call_id).as_bytes())
                .udp(t0 + 100_000, ivr_sip, caller_sip, response(100, &from_tag, None, &call_id, false).as_bytes())
                .udp(t0 + 500_000, ivr_sip, caller_sip, response(183, &from_tag, Some(&to_tag), &call_id, true).as_bytes())
                .udp(t0 + 505_000, ivr_sip, caller_sip, response(200, &from_tag, Some(&to_tag), &call_id, true).as_bytes())
                .udp(t0 + 510_000, caller_sip, ivr_sip, in_dialog("ACK", &from_tag, &to_tag, &call_id, 1).as_bytes())
                .udp(t0 + 520_000, caller_rtp, ivr_rtp, &rtp_bytes(0, 1, 160, &[0xff; 160]));

            for (i, entries) in self.prompts.iter().enumerate() {
                let entries: Vec<&str> = entries.iter().map(String::as_str).collect();
                let packet = rtp_bytes(127, 100 + i as u16, 8000 * (i as u32 + 1), &prompt_payload(&entries));
                for copy in 0..=self.prompt_repeats {
                    let ts = t0 + 600_000 + i as u64 * 100_000 + copy as u64 * 1_000;
                    builder.udp(ts, ivr_rtp, caller_rtp, &packet);
                }
            }

            if self.with_bye {
                let bye = if self.bye_from_destination {
                    bye_from_ivr(&from_tag, &to_tag, &call_id)
                } else {
                    in_dialog("BYE", &from_tag, &to_tag, &call_id, 2)
                };
                let (src, dst) = if self.bye_from_destination {
                    (ivr_sip, caller_sip)
                } else {
                    (caller_sip, ivr_sip)
                };
                builder
                    .udp(t0 + 2_000_000, src, dst, bye.as_bytes())
                    .udp(t0 + 2_010_000, dst, src, b"SIP/2.0 200 OK\r\nContent-Length: 0\r\n\r\n");
            }
        }
        builder.build()
    }
}

fn sdp(ip: Ipv4Addr, port: u16) -> String {
    format!(
        "v=0\r\no=- 1 1 IN IP4 {ip}\r\ns=-\r\nc=IN IP4 {ip}\r\nt=0 0\r\nm=audio {port} RTP/AVP 0 {pt}\r\na=rtpmap:0 PCMU/8000\r\na=rtpmap:{pt} telephone-event/8000\r\n",
        ip = ip,
        port = port,
        pt = TELEPHONE_EVENT_PT
    )
}

fn invite(from_tag: &str, call_id: &str) -> String {
    let body = sdp(CALLER_IP, CALLER_MEDIA_PORT);
    format!(
        "INVITE sip:800@{ivr}:5060 SIP/2.0\r\n\
         Via: SIP/2.0/UDP {caller}:5060;branch=z9hG4bK-{tag}\r\n\
         Max-Forwards: 70\r\n\
         From: \"5551000\" <sip:5551000@{caller}>;tag={tag}\r\n\
         To: <sip:800@{ivr}>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:5551000@{caller}:5060>\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {len}\r\n\r\n{body}",
        ivr = IVR_IP,
        caller = CALLER_IP,
        tag = from_tag,
        call_id = call_id,
        len = body.len(),
        body = body
    )
}

fn response(code: u16, from_tag: &str, to_tag: Option<&str>, call_id: &str, with_sdp: bool) -> String {
    let reason = match code {
        100 => "Trying",
        183 => "Session Progress",
        _ => "OK",
    };
    let to = match to_tag {
        Some(tag) => format!("<sip:800@{}>;tag={}", IVR_IP, tag),
        None => format!("<sip:800@{}>", IVR_IP),
    };
    let body = if with_sdp { sdp(IVR_IP, IVR_MEDIA_PORT) } else { String::new() };
    format!(
        "SIP/2.0 {code} {reason}\r\n\
         Via: SIP/2.0/UDP {caller}:5060;branch=z9hG4bK-{from_tag}\r\n\
         From: \"5551000\" <sip:5551000@{caller}>;tag={from_tag}\r\n\
         To: {to}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 INVITE\r\n\
         Content-Length: {len}\r\n\r\n{body}",
        code = code,
        reason = reason,
        caller = CALLER_IP,
        from_tag = from_tag,
        to = to,
        call_id = call_id,
        len = body.len(),
        body = body
    )
}

fn in_dialog(method: &str, from_tag: &str, to_tag: &str, call_id: &str, cseq: u32) -> String {
    format!(
        "{method} sip:800@{ivr}:5060 SIP/2.0\r\n\
         Via: SIP/2.0/UDP {caller}:5060;branch=z9hG4bK-{method}-{from_tag}\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:5551000@{caller}>;tag={from_tag}\r\n\
         To: <sip:800@{ivr}>;tag={to_tag}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} {method}\r\n\
         Content-Length: 0\r\n\r\n",
        method = method,
        ivr = IVR_IP,
        caller = CALLER_IP,
        from_tag = from_tag,
        to_tag = to_tag,
        call_id = call_id,
        cseq = cseq
    )
}

fn bye_from_ivr(from_tag: &str, to_tag: &str, call_id: &str) -> String {
    format!(
        "BYE sip:5551000@{caller}:5060 SIP/2.0\r\n\
         Via: SIP/2.0/UDP {ivr}:5060;branch=z9hG4bK-ivr-bye\r\n\
         From: <sip:800@{ivr}>;tag={to_tag}\r\n\
         To: <sip:5551000@{caller}>;tag={from_tag}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 BYE\r\n\
         Content-Length: 0\r\n\r\n",
        ivr = IVR_IP,
        caller = CALLER_IP,
        from_tag = from_tag,
        to_tag = to_tag,
        call_id = call_id
    )
}
