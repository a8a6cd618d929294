//! Wire protocol decoders for the IVR replay tester

pub mod sip;
pub mod rtp;
pub mod dtmf;

pub use dtmf::DtmfDigit;
pub use rtp::RtpPacket;
pub use sip::SipMessage;
