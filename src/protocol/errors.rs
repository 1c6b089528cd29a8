//! Protocol parsing errors.

use miette::Diagnostic;
use thiserror::Error;

/// Failures while validating an incoming frame.
///
/// `Truncated` is recoverable (read more bytes); everything else is a
/// protocol violation handled by nacking or closing the connection.
#[derive(Debug, Error, Diagnostic)]
pub enum ProtocolError {
    /// Fewer bytes than a full header are available.
    #[error("truncated header: have {have} bytes, need {need}")]
    #[diagnostic(code(tidemark::protocol::truncated))]
    Truncated { have: usize, need: usize },

    /// The packet did not start with the request magic.
    #[error("invalid magic byte {byte:#04x}")]
    #[diagnostic(
        code(tidemark::protocol::invalid_magic),
        help("Only binary-protocol requests (magic 0x80) are accepted on this port.")
    )]
    InvalidMagic { byte: u8 },

    /// The opcode is not one this server understands.
    #[error("unknown opcode {byte:#04x}")]
    #[diagnostic(code(tidemark::protocol::unknown_opcode))]
    UnknownOpcode { byte: u8 },

    /// The body exceeds the configured maximum packet size.
    #[error("body length {body_len} exceeds maximum {max}")]
    #[diagnostic(code(tidemark::protocol::body_too_large))]
    BodyTooLarge { body_len: u32, max: u32 },

    /// Structurally inconsistent header fields.
    #[error("invalid frame: {reason}")]
    #[diagnostic(code(tidemark::protocol::invalid_frame))]
    InvalidFrame { reason: String },
}

impl ProtocolError {
    /// Whether the error merely means more bytes are needed.
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ProtocolError::Truncated { .. })
    }
}
