//! Error types for protocol parsing

use thiserror::Error;

/// Errors that can occur when framing or parsing test stand packets
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Packet is too short to contain required data
    #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    /// Protocol version byte is not one we speak
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Length field doesn't match actual packet length
    #[error("Length mismatch: header says {header_len} bytes, packet has {actual_len}")]
    LengthMismatch { header_len: usize, actual_len: usize },

    /// Header LENGTH field outside the framable range
    #[error("Frame length {0} outside valid range")]
    BadFrameLength(usize),

    /// Packet type not recognized
    #[error("Unknown packet type: {0:#04X}")]
    UnknownPacketType(u8),

    /// A payload byte is outside its enum domain
    #[error("Invalid {field} value: {value:#04X}")]
    InvalidEnum { field: &'static str, value: u8 },

    /// Invalid UTF-8 in string field
    #[error("Invalid string encoding")]
    InvalidString,

    /// CONFIG JSON is missing required shape
    #[error("Invalid device config: {0}")]
    InvalidConfig(String),
}
