//! IVR event model shared by the templater and the replaying channels

pub mod dedup;
pub mod fuzzy;
pub mod judge;
pub mod prompt_book;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use dedup::{IvrDedup, IVR_EVENT_DUP_TIMES};
pub use fuzzy::FuzzyPrompts;
pub use judge::{smart_judge, wash_prompt, Judgment};
pub use prompt_book::PromptBook;

/// What the system under test reported playing or recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IvrEventKind {
    #[serde(rename = "record_file")]
    RecordFile,
    #[serde(rename = "speak")]
    Speak,
    #[serde(rename = "system")]
    System,
    #[serde(rename = "record_tone")]
    RecordTone,
}

impl IvrEventKind {
    /// Classifies a prompt list entry by the directory it was played from.
    pub fn classify_prompt(entry: &str) -> Option<Self> {
        let lowered = entry.to_ascii_lowercase();
        if lowered.contains("speak.vox") {
            Some(Self::Speak)
        } else if lowered.contains("system32.vox") {
            Some(Self::System)
        } else if lowered.contains("rectone") {
            Some(Self::RecordTone)
        } else {
            None
        }
    }

    pub fn short_code(&self) -> char {
        match self {
            Self::RecordFile => 'r',
            Self::Speak => 'p',
            Self::System => 's',
            Self::RecordTone => 't',
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::RecordFile => "RECORD",
            Self::Speak => "SPEAK",
            Self::System => "SYSTEM",
            Self::RecordTone => "TONE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IvrEvent {
    pub kind: IvrEventKind,
    pub content: String,
}

impl IvrEvent {
    pub fn new<S: Into<String>>(kind: IvrEventKind, content: S) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }
}

impl fmt::Display for IvrEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.short_code(), self.content)
    }
}

/// Canonical string of one IVR payload, used to spot retransmissions.
pub fn dedup_key(events: &[IvrEvent]) -> String {
    events
        .iter()
        .map(|event| event.to_string())
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_prompt() {
        assert_eq!(
            IvrEventKind::classify_prompt("d:\\ivr\\speak.vox\\E1JA348"),
            Some(IvrEventKind::Speak)
        );
        assert_eq!(
            IvrEventKind::classify_prompt("d:\\ivr\\SYSTEM32.VOX\\busy"),
            Some(IvrEventKind::System)
        );
        assert_eq!(
            IvrEventKind::classify_prompt("/opt/ivr/rectone/beep"),
            Some(IvrEventKind::RecordTone)
        );
        assert_eq!(IvrEventKind::classify_prompt("/opt/ivr/music/hold"), None);
    }

    #[test]
    fn test_dedup_key() {
        let events = vec![
            IvrEvent::new(IvrEventKind::Speak, "a"),
            IvrEvent::new(IvrEventKind::System, "b"),
        ];
        assert_eq!(dedup_key(&events), "p:a|s:b");
        assert_eq!(dedup_key(&[]), "");
    }
}
