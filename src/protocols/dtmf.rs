//! RFC 2833 telephone-event digits

use std::fmt;

use serde::{Deserialize, Serialize};

/// Highest event code that maps to a keypad digit (16 = Flash)
pub const MAX_DTMF_EVENT: u8 = 16;

/// A telephone-event code in the 0..=16 range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct DtmfDigit(u8);

impl DtmfDigit {
    pub fn from_event(code: u8) -> Option<Self> {
        (code <= MAX_DTMF_EVENT).then_some(Self(code))
    }

    /// Reads the event code from the first byte of a telephone-event payload.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        payload.first().copied().and_then(Self::from_event)
    }

    pub fn code(&self) -> u8 {
        self.0
    }

    pub fn label(&self) -> &'static str {
        const LABELS: [&str; 17] = [
            "0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "*", "#", "A", "B", "C", "D",
            "Flash",
        ];
        LABELS[self.0 as usize]
    }
}

impl TryFrom<u8> for DtmfDigit {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, Self::Error> {
        Self::from_event(code).ok_or_else(|| format!("invalid telephone-event code {}", code))
    }
}

impl From<DtmfDigit> for u8 {
    fn from(digit: DtmfDigit) -> Self {
        digit.0
    }
}

impl fmt::Display for DtmfDigit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
