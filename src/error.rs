//! Error handling for the IVR replay tester


pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Format error: {0}")]
    Format(String),

    #[error("No dialog found in trace: {0}")]
    NoDialogFound(String),

    #[error("Correlation mismatch: {0}")]
    CorrelationMismatch(String),

    #[error("Unknown cache key: {0}")]
    UnknownCacheKey(String),

    #[error("Unsupported payload type: {0}")]
    UnsupportedPayloadType(u8),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn format<S: Into<String>>(msg: S) -> Self {
        Self::Format(msg.into())
    }

    pub fn no_dialog<S: Into<String>>(trace: S) -> Self {
        Self::NoDialogFound(trace.into())
    }

    pub fn correlation<S: Into<String>>(msg: S) -> Self {
        Self::CorrelationMismatch(msg.into())
    }

    pub fn unknown_key<S: Into<String>>(key: S) -> Self {
        Self::UnknownCacheKey(key.into())
    }

    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Self::Parse(msg.into())
    }

    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error ends the processing of the trace it was raised for.
    pub fn is_fatal_for_trace(&self) -> bool {
        matches!(
            self,
            Self::Format(_) | Self::NoDialogFound(_) | Self::Io(_) | Self::Serialization(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::UnsupportedPayloadType(96).to_string(),
            "Unsupported payload type: 96"
        );
        assert_eq!(
            Error::no_dialog("case/a.snoop").to_string(),
            "No dialog found in trace: case/a.snoop"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::format("bad magic").is_fatal_for_trace());
        assert!(Error::no_dialog("x").is_fatal_for_trace());
        assert!(!Error::correlation("tag").is_fatal_for_trace());
        assert!(!Error::unknown_key("k").is_fatal_for_trace());
    }
}
