//! Redfire IVR Replay - capture driven IVR conformance testing
//!
//! Recorded SIP/RTP calls are turned into call templates, replayed against a
//! system under test over many concurrent channels, and every prompt the IVR
//! reports back is judged against the recording.
//!
//! **Sponsored by [Carrier One Inc](https://carrierone.com) - Professional Telecommunications Solutions**

pub mod capture;
pub mod cases;
pub mod config;
pub mod core;
pub mod error;
pub mod ivr;
pub mod protocols;
pub mod services;
pub mod template;
pub mod utils;

#[cfg(test)]
pub(crate) mod fixtures;

pub use error::{Error, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
