//! Turning recorded SIP messages into replayable templates and back

use once_cell::sync::Lazy;
use regex::Regex;

use crate::protocols::sip::{SipMessage, StartLine, DEFAULT_SIP_PORT};
use crate::Result;

pub const SOURCE: &str = "[SOURCE]";
pub const DESTINATION: &str = "[DESTINATION]";
pub const CALLED: &str = "[CALLED]";
pub const CALLING: &str = "[CALLING]";
pub const FROM_TAG: &str = "[FROM_TAG]";
pub const TO_TAG: &str = "[TO_TAG]";
pub const FROM_DISPLAY: &str = "[FROM_DISPLAY]";
pub const LENGTH: &str = "[LENGTH]";
pub const AUDIO_PORT: &str = "[AUDIO_PORT]";

static IPV4: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("valid IPv4 pattern"));

/// Headers the replaying side must never copy from the recording.
const STRIPPED_HEADERS: [&str; 5] = [
    "Record-Route",
    "Route",
    "Diversion",
    "P-Asserted-Identity",
    "Privacy",
];

pub fn template_invite(message: &SipMessage) -> SipMessage {
    let mut templated = template_common(message, 1, "INVITE");
    templated.body = template_sdp(&message.body);
    templated
}

pub fn template_ack(message: &SipMessage) -> SipMessage {
    template_common(message, 1, "ACK")
}

pub fn template_bye(message: &SipMessage) -> SipMessage {
    template_common(message, 2, "BYE")
}

fn template_common(message: &SipMessage, cseq: u32, method: &str) -> SipMessage {
    let mut templated = message.clone();

    if let StartLine::Request { uri, .. } = &mut templated.start_line {
        *uri = rewrite_sip_uri(uri, CALLED, DESTINATION);
    }

    for name in STRIPPED_HEADERS {
        templated.remove_headers(name);
    }
    templated.keep_first("Via");

    for header in templated.headers.iter_mut() {
        let name = header.name.to_ascii_lowercase();
        header.value = match name.as_str() {
            "via" | "v" => template_via(&header.value),
            "from" | "f" => template_from(&header.value),
            "to" | "t" => template_to(&header.value),
            "call-id" | "i" => format!("{}@{}", FROM_TAG, SOURCE),
            "contact" | "m" => template_contact(&header.value),
            "cseq" => format!("{} {}", cseq, method),
            "content-length" | "l" => LENGTH.to_string(),
            _ => continue,
        };
    }

    if templated.header("Content-Length").is_none() {
        templated.push_header("Content-Length", LENGTH);
    }
    templated
}

/// `SIP/2.0/UDP host:port;params` with the sent-by and any address replaced.
fn template_via(value: &str) -> String {
    let first = value.split(',').next().unwrap_or(value).trim();
    let Some((protocol, rest)) = first.split_once(char::is_whitespace) else {
        return IPV4.replace_all(first, SOURCE).into_owned();
    };
    let rest = rest.trim_start();
    let (sent_by, params) = match rest.find(';') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    let sent_by = if sent_by.contains(':') {
        format!("{}:{}", SOURCE, DEFAULT_SIP_PORT)
    } else {
        SOURCE.to_string()
    };
    format!("{} {}{}", protocol, sent_by, IPV4.replace_all(params, SOURCE))
}

fn template_from(value: &str) -> String {
    let addr = NameAddr::parse(value);
    format!(
        "{}<{}>{}",
        FROM_DISPLAY,
        rewrite_sip_uri(&addr.uri, CALLING, SOURCE),
        set_param(&addr.params, "tag", FROM_TAG)
    )
}

fn template_to(value: &str) -> String {
    let addr = NameAddr::parse(value);
    let params = if has_param(&addr.params, "tag") {
        set_param(&addr.params, "tag", TO_TAG)
    } else {
        addr.params.clone()
    };
    format!("<{}>{}", rewrite_sip_uri(&addr.uri, CALLED, DESTINATION), params)
}

fn template_contact(value: &str) -> String {
    let addr = NameAddr::parse(value);
    format!("<{}>{}", rewrite_sip_uri(&addr.uri, CALLING, SOURCE), addr.params)
}

/// `m=audio` port and every address of the SDP body become placeholders.
fn template_sdp(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        let line = match line.strip_prefix("m=audio ") {
            Some(rest) => {
                let tail = rest.split_once(' ').map_or("", |(_, tail)| tail);
                format!("m=audio {} {}", AUDIO_PORT, tail).trim_end().to_string()
            }
            None => line.to_string(),
        };
        out.push_str(&IPV4.replace_all(&line, SOURCE));
        out.push_str("\r\n");
    }
    out
}

/// Replaces `user@host[:port]` of the first SIP URI in `value`.
///
/// A URI without user part gets one. An explicit port becomes the default
/// signaling port, URI parameters are kept.
pub fn rewrite_sip_uri(value: &str, user: &str, host: &str) -> String {
    let Some(scheme) = value.find("sip:") else {
        return value.to_string();
    };
    let start = scheme + 4;
    let rest = &value[start..];
    let end = rest
        .find(|c| matches!(c, ';' | '>' | '?' | ' '))
        .unwrap_or(rest.len());
    let hostport = rest[..end].rsplit('@').next().unwrap_or(&rest[..end]);

    let mut out = String::with_capacity(value.len() + 16);
    out.push_str(&value[..start]);
    out.push_str(user);
    out.push('@');
    out.push_str(host);
    if hostport.contains(':') {
        out.push(':');
        out.push_str(&DEFAULT_SIP_PORT.to_string());
    }
    out.push_str(&rest[end..]);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NameAddr {
    uri: String,
    params: String,
}

impl NameAddr {
    fn parse(value: &str) -> Self {
        let value = value.trim();
        if let Some(lt) = value.find('<') {
            if let Some(len) = value[lt..].find('>') {
                // The display name is dropped, From gets a placeholder instead
                return Self {
                    uri: value[lt + 1..lt + len].to_string(),
                    params: value[lt + len + 1..].trim().to_string(),
                };
            }
        }
        match value.find(';') {
            Some(i) => Self {
                uri: value[..i].to_string(),
                params: value[i..].to_string(),
            },
            None => Self {
                uri: value.to_string(),
                params: String::new(),
            },
        }
    }
}

fn has_param(params: &str, name: &str) -> bool {
    params.split(';').skip(1).any(|param| {
        param
            .split('=')
            .next()
            .map_or(false, |key| key.trim().eq_ignore_ascii_case(name))
    })
}

/// Sets `;name=value` in a parameter list, appending it when missing.
fn set_param(params: &str, name: &str, value: &str) -> String {
    let mut found = false;
    let mut out = String::new();
    for param in params.split(';').skip(1) {
        let key = param.split('=').next().unwrap_or(param).trim();
        out.push(';');
        if key.eq_ignore_ascii_case(name) {
            found = true;
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        } else {
            out.push_str(param.trim());
        }
    }
    if !found {
        out.push(';');
        out.push_str(name);
        out.push('=');
        out.push_str(value);
    }
    out
}

/// Live values put in place of the placeholders when a template is sent.
#[derive(Debug, Clone, Default)]
pub struct Substitutions {
    pairs: Vec<(&'static str, String)>,
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, placeholder: &'static str, value: impl Into<String>) -> Self {
        let value = value.into();
        match self.pairs.iter_mut().find(|(key, _)| *key == placeholder) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((placeholder, value)),
        }
        self
    }

    pub fn apply(&self, text: &str) -> String {
        self.pairs
            .iter()
            .fold(text.to_string(), |acc, (key, value)| acc.replace(key, value))
    }
}

/// Parses a templated message, substitutes placeholders and fixes Content-Length.
pub fn render(template: &str, substitutions: &Substitutions) -> Result<SipMessage> {
    let mut message = SipMessage::parse(template)?;

    message.start_line = match message.start_line {
        StartLine::Request { method, uri, version } => StartLine::Request {
            method,
            uri: substitutions.apply(&uri),
            version,
        },
        response => response,
    };
    for header in message.headers.iter_mut() {
        header.value = substitutions.apply(&header.value);
    }

    let body = substitutions.apply(&message.body);
    let body = body.trim();
    message.body = if body.is_empty() {
        String::new()
    } else {
        let mut normalized = body
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .collect::<Vec<_>>()
            .join("\r\n");
        normalized.push_str("\r\n");
        normalized
    };
    message.set_header("Content-Length", message.body.len().to_string());
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &str = "INVITE sip:800@10.0.0.2:5060;user=phone SIP/2.0\r\n\
        Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK1;received=10.0.0.9\r\n\
        Via: SIP/2.0/UDP 10.0.0.7:5060;branch=z9hG4bK2\r\n\
        Record-Route: <sip:10.0.0.7;lr>\r\n\
        Max-Forwards: 70\r\n\
        From: \"Alice\" <sip:5551000@10.0.0.1>;tag=abc123\r\n\
        To: <sip:800@10.0.0.2>\r\n\
        Call-ID: call-77@10.0.0.1\r\n\
        CSeq: 101 INVITE\r\n\
        Contact: <sip:5551000@10.0.0.1:5060>\r\n\
        Diversion: <sip:700@10.0.0.1>;reason=unknown\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: 99\r\n\
        \r\n\
        v=0\r\n\
        o=- 1 1 IN IP4 10.0.0.1\r\n\
        c=IN IP4 10.0.0.1\r\n\
        m=audio 4000 RTP/AVP 0 101\r\n\
        a=rtpmap:101 telephone-event/8000\r\n";

    #[test]
    fn test_template_invite() {
        let message = SipMessage::parse(INVITE).unwrap();
        let templated = template_invite(&message);
        let wire = templated.to_wire();

        assert!(wire.starts_with("INVITE sip:[CALLED]@[DESTINATION]:5060;user=phone SIP/2.0\r\n"));
        assert_eq!(templated.headers_named("Via").count(), 1);
        assert_eq!(
            templated.header("Via"),
            Some("SIP/2.0/UDP [SOURCE]:5060;branch=z9hG4bK1;received=[SOURCE]")
        );
        assert_eq!(
            templated.header("From"),
            Some("[FROM_DISPLAY]<sip:[CALLING]@[SOURCE]>;tag=[FROM_TAG]")
        );
        assert_eq!(templated.header("To"), Some("<sip:[CALLED]@[DESTINATION]>"));
        assert_eq!(templated.header("Call-ID"), Some("[FROM_TAG]@[SOURCE]"));
        assert_eq!(templated.header("Contact"), Some("<sip:[CALLING]@[SOURCE]:5060>"));
        assert_eq!(templated.header("CSeq"), Some("1 INVITE"));
        assert_eq!(templated.header("Content-Length"), Some("[LENGTH]"));
        assert_eq!(templated.header("Max-Forwards"), Some("70"));
        assert!(templated.header("Record-Route").is_none());
        assert!(templated.header("Diversion").is_none());
        assert!(templated.body.contains("m=audio [AUDIO_PORT] RTP/AVP 0 101\r\n"));
        assert!(templated.body.contains("c=IN IP4 [SOURCE]\r\n"));
        assert!(!templated.body.contains("10.0.0.1"));
    }

    #[test]
    fn test_template_bye_keeps_to_tag() {
        let bye = SipMessage::parse(
            "BYE sip:800@10.0.0.2 SIP/2.0\r\nVia: SIP/2.0/UDP 10.0.0.1;branch=b\r\nRoute: <sip:10.0.0.7;lr>\r\nFrom: <sip:5551000@10.0.0.1>;tag=abc\r\nTo: <sip:800@10.0.0.2>;tag=xyz\r\nCall-ID: call-77@10.0.0.1\r\nCSeq: 103 BYE\r\n\r\n",
        )
        .unwrap();
        let templated = template_bye(&bye);
        assert!(templated.to_wire().starts_with("BYE sip:[CALLED]@[DESTINATION] SIP/2.0"));
        assert_eq!(templated.header("To"), Some("<sip:[CALLED]@[DESTINATION]>;tag=[TO_TAG]"));
        assert_eq!(templated.header("Via"), Some("SIP/2.0/UDP [SOURCE];branch=b"));
        assert_eq!(templated.header("CSeq"), Some("2 BYE"));
        assert!(templated.header("Route").is_none());
        assert_eq!(templated.header("Content-Length"), Some("[LENGTH]"));
    }

    #[test]
    fn test_rewrite_sip_uri() {
        assert_eq!(rewrite_sip_uri("sip:800@10.0.0.2", CALLED, DESTINATION), "sip:[CALLED]@[DESTINATION]");
        assert_eq!(
            rewrite_sip_uri("sip:10.0.0.1:5070;transport=udp", CALLING, SOURCE),
            "sip:[CALLING]@[SOURCE]:5060;transport=udp"
        );
        assert_eq!(rewrite_sip_uri("tel:800", CALLED, DESTINATION), "tel:800");
    }

    #[test]
    fn test_from_without_brackets() {
        assert_eq!(
            template_from("sip:5551000@10.0.0.1;tag=1"),
            "[FROM_DISPLAY]<sip:[CALLING]@[SOURCE]>;tag=[FROM_TAG]"
        );
    }

    #[test]
    fn test_render_fills_placeholders_and_length() {
        let templated = template_invite(&SipMessage::parse(INVITE).unwrap()).to_wire();
        let substitutions = Substitutions::new()
            .set(SOURCE, "192.168.1.10")
            .set(DESTINATION, "192.168.1.20")
            .set(CALLED, "900")
            .set(CALLING, "5552000")
            .set(FROM_TAG, "tag42")
            .set(FROM_DISPLAY, "\"5552000\" ")
            .set(AUDIO_PORT, "30000");
        let rendered = render(&templated, &substitutions).unwrap();
        let wire = rendered.to_wire();

        assert!(wire.starts_with("INVITE sip:900@192.168.1.20:5060;user=phone SIP/2.0\r\n"));
        assert_eq!(
            rendered.header("From"),
            Some("\"5552000\" <sip:5552000@192.168.1.10>;tag=tag42")
        );
        assert!(rendered.body.contains("m=audio 30000 RTP/AVP 0 101\r\n"));
        assert_eq!(
            rendered.header("Content-Length"),
            Some(rendered.body.len().to_string().as_str())
        );
        assert!(!wire.contains('['));
    }

    #[test]
    fn test_render_without_body() {
        let rendered = render(
            "ACK sip:[CALLED]@[DESTINATION] SIP/2.0\r\nContent-Length: [LENGTH]\r\n\r\n",
            &Substitutions::new().set(CALLED, "1").set(DESTINATION, "2.2.2.2"),
        )
        .unwrap();
        assert_eq!(rendered.header("Content-Length"), Some("0"));
        assert!(rendered.body.is_empty());
    }
}
