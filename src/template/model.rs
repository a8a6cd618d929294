//! Parsed call templates

use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::ivr::{IvrEvent, IvrEventKind};
use crate::protocols::DtmfDigit;

/// What a template packet carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UdpCategory {
    Unknown,
    Sip,
    Rtp,
    RtpEvent,
    IvrRecordFile,
    IvrSpeakPrompt,
    IvrSystem,
    IvrRecordTone,
}

impl UdpCategory {
    pub fn for_ivr(kind: IvrEventKind) -> Self {
        match kind {
            IvrEventKind::RecordFile => Self::IvrRecordFile,
            IvrEventKind::Speak => Self::IvrSpeakPrompt,
            IvrEventKind::System => Self::IvrSystem,
            IvrEventKind::RecordTone => Self::IvrRecordTone,
        }
    }

    pub fn is_media(&self) -> bool {
        matches!(self, Self::Rtp | Self::RtpEvent)
    }

    pub fn is_ivr(&self) -> bool {
        matches!(
            self,
            Self::IvrRecordFile | Self::IvrSpeakPrompt | Self::IvrSystem | Self::IvrRecordTone
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SipKind {
    None,
    Invite,
    Ack,
    Bye,
}

/// SIP dialog progress, shared by the segmenter and the replaying channel.
///
/// A finished dialog goes back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DialogState {
    Idle,
    WaitingFor183,
    WaitingFor200,
    BeforeAck,
    AfterAck,
    Byeing,
}

/// One packet of a dialog template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPacket {
    /// 1-based position in the trace
    pub index: usize,
    pub dialog_index: Option<usize>,
    pub timestamp_us: u64,
    /// Offset from the dialog's session progress answer
    pub delay_us: i64,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub category: UdpCategory,
    pub sip_kind: SipKind,
    /// Templated SIP text or raw RTP, empty for received packets
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub rtp_timestamp: Option<u32>,
    pub dtmf: Option<DtmfDigit>,
    pub ivr_event: Option<IvrEvent>,
    pub received: bool,
    /// Split out of a prompt payload that carried several entries
    pub is_twin: bool,
}

impl RawPacket {
    pub fn is_bye(&self) -> bool {
        self.sip_kind == SipKind::Bye
    }

    pub fn sip_text(&self) -> Option<&str> {
        if self.category != UdpCategory::Sip || self.data.is_empty() {
            return None;
        }
        std::str::from_utf8(&self.data).ok()
    }

    /// Short description used by listings and call flows.
    pub fn describe(&self) -> String {
        match (self.category, self.sip_kind) {
            (UdpCategory::Sip, SipKind::Invite) => "INVITE".to_string(),
            (UdpCategory::Sip, SipKind::Ack) => "ACK".to_string(),
            (UdpCategory::Sip, SipKind::Bye) => "BYE".to_string(),
            (UdpCategory::RtpEvent, _) => match self.dtmf {
                Some(digit) => format!("DTMF {}", digit),
                None => "DTMF".to_string(),
            },
            (UdpCategory::Rtp, _) => "RTP".to_string(),
            _ => match &self.ivr_event {
                Some(event) => format!("{} {}", event.kind.label(), event.content),
                None => format!("{:?}", self.category),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogNumbers {
    pub called: String,
    pub calling: String,
}

/// One call leg of a trace; the first packet is its INVITE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dialog {
    pub index: usize,
    pub numbers: DialogNumbers,
    pub packets: Vec<RawPacket>,
}

impl Dialog {
    pub fn invite(&self) -> Option<&RawPacket> {
        self.packets
            .first()
            .filter(|packet| packet.sip_kind == SipKind::Invite)
    }

    pub fn ack(&self) -> Option<&RawPacket> {
        self.packets.iter().find(|packet| packet.sip_kind == SipKind::Ack)
    }

    pub fn received_count(&self) -> usize {
        self.packets.iter().filter(|packet| packet.received).count()
    }
}

/// Modification time with sub-second precision, stable across serialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
    pub secs: u64,
    pub nanos: u32,
}

impl From<SystemTime> for FileStamp {
    fn from(time: SystemTime) -> Self {
        let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            secs: since.as_secs(),
            nanos: since.subsec_nanos(),
        }
    }
}

/// Metadata artifact: enough to decide whether a cached template is stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseInformation {
    pub format_version: u32,
    pub trace: PathBuf,
    pub trace_modified: FileStamp,
    pub trace_size: u64,
    pub created: FileStamp,
    pub dialog_numbers: Vec<DialogNumbers>,
    /// CRC-32 of the dialog artifact
    pub dialogs_crc: u32,
}

impl CaseInformation {
    pub fn trace_name(&self) -> String {
        self.trace
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.trace.display().to_string())
    }
}

/// Everything parsed from one trace.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseTemplate {
    pub info: CaseInformation,
    pub dialogs: Vec<Dialog>,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
