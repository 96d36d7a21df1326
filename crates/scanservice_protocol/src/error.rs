//! Error types for the worker wire protocol.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid opcode: {0}")]
    InvalidOpCode(u8),

    #[error("Protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("Header too short: expected {expected} bytes, got {got}")]
    HeaderTooShort { expected: usize, got: usize },

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Unexpected opcode {got:?} (expected {expected})")]
    UnexpectedOpCode {
        expected: &'static str,
        got: crate::OpCode,
    },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
