//! Minimal SIP message model
//!
//! Only what replaying a recorded dialog needs: a start line, an ordered list
//! of header lines and an opaque body. Header lookups understand the compact
//! header forms.

use std::fmt;

use crate::{Error, Result};

pub const SIP_VERSION: &str = "SIP/2.0";
pub const DEFAULT_SIP_PORT: u16 = 5060;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request {
        method: String,
        uri: String,
        version: String,
    },
    Response {
        version: String,
        code: u16,
        reason: String,
    },
}

impl fmt::Display for StartLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request { method, uri, version } => write!(f, "{} {} {}", method, uri, version),
            Self::Response { version, code, reason } => write!(f, "{} {} {}", version, code, reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    pub start_line: StartLine,
    pub headers: Vec<SipHeader>,
    pub body: String,
}

impl SipMessage {
    pub fn parse(text: &str) -> Result<Self> {
        let (head, body) = split_head_body(text);
        let mut lines = head.lines().map(|line| line.trim_end_matches('\r'));

        let first = lines
            .by_ref()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| Error::parse("empty SIP message"))?;
        let start_line = parse_start_line(first)?;

        let mut headers: Vec<SipHeader> = Vec::new();
        for line in lines {
            if line.starts_with(' ') || line.starts_with('\t') {
                // Folded continuation of the previous header
                if let Some(last) = headers.last_mut() {
                    last.value.push(' ');
                    last.value.push_str(line.trim());
                }
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            headers.push(SipHeader {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            });
        }

        Ok(Self {
            start_line,
            headers,
            body: body.to_string(),
        })
    }

    /// Serializes with CRLF line endings; the body is emitted as stored.
    pub fn to_wire(&self) -> String {
        let mut out = String::with_capacity(256 + self.body.len());
        out.push_str(&self.start_line.to_string());
        out.push_str("\r\n");
        for header in &self.headers {
            out.push_str(&header.name);
            out.push_str(": ");
            out.push_str(&header.value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn is_request(&self, expected: &str) -> bool {
        matches!(
            &self.start_line,
            StartLine::Request { method, version, .. }
                if method.eq_ignore_ascii_case(expected) && version == SIP_VERSION
        )
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Response { code, .. } => Some(*code),
            StartLine::Request { .. } => None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| names_match(&header.name, name))
            .map(|header| header.value.as_str())
    }

    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |header| names_match(&header.name, name))
            .map(|header| header.value.as_str())
    }

    /// Replaces the first header of that name, or appends one.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.headers.iter_mut().find(|header| names_match(&header.name, name)) {
            Some(header) => header.value = value,
            None => self.push_header(name, value),
        }
    }

    pub fn push_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push(SipHeader {
            name: name.to_string(),
            value: value.into(),
        });
    }

    pub fn remove_headers(&mut self, name: &str) {
        self.headers.retain(|header| !names_match(&header.name, name));
    }

    /// Keeps only the first occurrence of a header.
    pub fn keep_first(&mut self, name: &str) {
        let mut seen = false;
        self.headers.retain(|header| {
            if !names_match(&header.name, name) {
                return true;
            }
            let keep = !seen;
            seen = true;
            keep
        });
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.header("From").and_then(|value| header_param(value, "tag"))
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.header("To").and_then(|value| header_param(value, "tag"))
    }

    /// Call-ID without its `@host` part.
    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
            .map(|value| value.split('@').next().unwrap_or(value).trim())
    }

    pub fn cseq(&self) -> Option<(u32, &str)> {
        let value = self.header("CSeq")?;
        let (number, method) = value.split_once(char::is_whitespace)?;
        Some((number.trim().parse().ok()?, method.trim()))
    }

    /// Port of the first `m=audio` line of the SDP body.
    pub fn sdp_audio_port(&self) -> Option<u16> {
        self.body.lines().find_map(|line| {
            let rest = line.trim().strip_prefix("m=audio")?;
            rest.split_whitespace().next()?.parse().ok()
        })
    }

    /// Payload type mapped to `telephone-event` in the SDP body.
    pub fn telephone_event_pt(&self) -> Option<u8> {
        self.body.lines().find_map(|line| {
            let rest = line.trim().strip_prefix("a=rtpmap:")?;
            let (pt, encoding) = rest.split_once(char::is_whitespace)?;
            if encoding.trim().to_ascii_lowercase().starts_with("telephone-event") {
                pt.trim().parse().ok()
            } else {
                None
            }
        })
    }

    /// Builds the final response to a request, copying its dialog headers.
    pub fn response_to(request: &SipMessage, code: u16, reason: &str) -> Self {
        let mut response = Self {
            start_line: StartLine::Response {
                version: SIP_VERSION.to_string(),
                code,
                reason: reason.to_string(),
            },
            headers: Vec::new(),
            body: String::new(),
        };

        for via in request.headers_named("Via") {
            response.push_header("Via", via);
        }
        for name in ["To", "From", "Call-ID", "CSeq"] {
            if let Some(value) = request.header(name) {
                response.push_header(name, value);
            }
        }
        response.push_header("Content-Length", "0");
        response
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// Value of a `;name=value` parameter placed after the address part.
pub fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    let params = match value.rfind('>') {
        Some(end) => &value[end + 1..],
        None => value,
    };
    params.split(';').skip(1).find_map(|param| {
        let (key, val) = param.split_once('=')?;
        key.trim().eq_ignore_ascii_case(name).then(|| val.trim())
    })
}

/// User part of the first SIP URI in a header value or request URI.
pub fn uri_user(value: &str) -> Option<&str> {
    let start = value.find("sip:").map(|i| i + 4)?;
    let rest = &value[start..];
    let end = rest.find(|c| matches!(c, '@' | '>' | ';' | ' '))?;
    (rest.as_bytes().get(end) == Some(&b'@')).then(|| &rest[..end])
}

fn canonical_name(name: &str) -> &str {
    match name {
        "i" | "I" => "Call-ID",
        "m" | "M" => "Contact",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "v" | "V" => "Via",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        other => other,
    }
}

fn names_match(a: &str, b: &str) -> bool {
    canonical_name(a).eq_ignore_ascii_case(canonical_name(b))
}

fn split_head_body(text: &str) -> (&str, &str) {
    if let Some(i) = text.find("\r\n\r\n") {
        return (&text[..i], &text[i + 4..]);
    }
    if let Some(i) = text.find("\n\n") {
        return (&text[..i], &text[i + 2..]);
    }
    // Some recorders lose the blank line, the SDP still starts at v=
    if let Some(i) = text.find("\nv=") {
        return (&text[..i], &text[i + 1..]);
    }
    (text, "")
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("SIP/") {
        let mut parts = rest.splitn(3, ' ');
        let version = format!("SIP/{}", parts.next().unwrap_or_default());
        let code = parts
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or_else(|| Error::parse(format!("invalid status line: {}", line)))?;
        let reason = parts.next().unwrap_or_default().to_string();
        return Ok(StartLine::Response { version, code, reason });
    }

    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(uri), Some(version)) if version.starts_with("SIP/") => {
            Ok(StartLine::Request {
                method: method.to_string(),
                uri: uri.to_string(),
                version: version.to_string(),
            })
        }
        _ => Err(Error::parse(format!("invalid request line: {}", line))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &str = "INVITE sip:800@10.0.0.2:5060 SIP/2.0\r\n\
        Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK1\r\n\
        Via: SIP/2.0/UDP 10.0.0.9:5060;branch=z9hG4bK2\r\n\
        From: \"Alice\" <sip:5551000@10.0.0.1>;tag=abc123\r\n\
        To: <sip:800@10.0.0.2>\r\n\
        i: call-77@10.0.0.1\r\n\
        CSeq: 101 INVITE\r\n\
        m: <sip:5551000@10.0.0.1:5060>\r\n\
        Content-Length: 120\r\n\
        \r\n\
        v=0\r\n\
        o=- 1 1 IN IP4 10.0.0.1\r\n\
        c=IN IP4 10.0.0.1\r\n\
        m=audio 4000 RTP/AVP 0 101\r\n\
        a=rtpmap:101 telephone-event/8000\r\n";

    #[test]
    fn test_parse_request() {
        let message = SipMessage::parse(INVITE).unwrap();
        assert!(message.is_request("INVITE"));
        assert_eq!(message.method(), Some("INVITE"));
        assert_eq!(message.headers_named("Via").count(), 2);
        assert_eq!(message.from_tag(), Some("abc123"));
        assert_eq!(message.to_tag(), None);
        assert_eq!(message.call_id(), Some("call-77"));
        assert_eq!(message.cseq(), Some((101, "INVITE")));
        assert_eq!(message.sdp_audio_port(), Some(4000));
        assert_eq!(message.telephone_event_pt(), Some(101));
        assert_eq!(message.header("Contact"), Some("<sip:5551000@10.0.0.1:5060>"));
    }

    #[test]
    fn test_parse_response_with_lf_only() {
        let text = "SIP/2.0 183 Session Progress\nFrom: <sip:a@1.1.1.1>;tag=x\nTo: <sip:b@2.2.2.2>;tag=y\nCall-ID: c1\n\nv=0\nm=audio 5000 RTP/AVP 0\n";
        let message = SipMessage::parse(text).unwrap();
        assert_eq!(message.status_code(), Some(183));
        assert_eq!(message.to_tag(), Some("y"));
        assert_eq!(message.sdp_audio_port(), Some(5000));
        assert_eq!(message.telephone_event_pt(), None);
    }

    #[test]
    fn test_header_editing() {
        let mut message = SipMessage::parse(INVITE).unwrap();
        message.keep_first("Via");
        assert_eq!(message.headers_named("v").count(), 1);
        message.set_header("CSeq", "1 INVITE");
        assert_eq!(message.cseq(), Some((1, "INVITE")));
        message.remove_headers("Contact");
        assert!(message.header("m").is_none());
        message.set_header("Privacy", "id");
        assert_eq!(message.headers.last().unwrap().name, "Privacy");
    }

    #[test]
    fn test_header_outlives_lookup_name() {
        let message = SipMessage::parse(INVITE).unwrap();
        let from = {
            let name = String::from("from");
            message.header(&name)
        };
        assert_eq!(from, Some("\"Alice\" <sip:5551000@10.0.0.1>;tag=abc123"));
        assert_eq!(message.header("f"), from);
    }

    #[test]
    fn test_wire_round_trip() {
        let message = SipMessage::parse(INVITE).unwrap();
        let reparsed = SipMessage::parse(&message.to_wire()).unwrap();
        assert_eq!(message, reparsed);
    }

    #[test]
    fn test_response_to_bye() {
        let bye = SipMessage::parse(
            "BYE sip:a@10.0.0.1 SIP/2.0\r\nVia: SIP/2.0/UDP 10.0.0.2;branch=1\r\nVia: SIP/2.0/UDP 10.0.0.3;branch=2\r\nFrom: <sip:b@10.0.0.2>;tag=t2\r\nTo: <sip:a@10.0.0.1>;tag=t1\r\nCall-ID: c9\r\nCSeq: 5 BYE\r\nMax-Forwards: 70\r\n\r\n",
        )
        .unwrap();
        let ok = SipMessage::response_to(&bye, 200, "OK");
        let wire = ok.to_wire();
        assert!(wire.starts_with("SIP/2.0 200 OK\r\n"));
        assert_eq!(ok.headers_named("Via").count(), 2);
        assert_eq!(ok.header("CSeq"), Some("5 BYE"));
        assert_eq!(ok.header("Content-Length"), Some("0"));
        assert!(ok.header("Max-Forwards").is_none());
    }

    #[test]
    fn test_helpers() {
        assert_eq!(header_param("<sip:a@b;transport=udp>;tag=9f", "tag"), Some("9f"));
        assert_eq!(header_param("sip:a@b;tag=1", "tag"), Some("1"));
        assert_eq!(uri_user("\"A\" <sip:5551000@10.0.0.1>"), Some("5551000"));
        assert_eq!(uri_user("sip:10.0.0.1:5060"), None);
        assert!(SipMessage::parse("garbage").is_err());
    }
}
