//! The memcached binary wire protocol: framing, opcodes, status codes and
//! HELLO feature negotiation.
//!
//! This module is deliberately transport-agnostic — it parses and encodes
//! byte frames and knows nothing about sockets, TLS or dispatch. The
//! connection engine in [`crate::server`] owns the I/O.

mod errors;
mod feature;
mod header;
mod opcode;
mod status;

pub use errors::ProtocolError;
pub use feature::{Feature, FeatureSet};
pub use header::{
    Request, RequestHeader, Response, HEADER_LEN, MAGIC_REQUEST, MAGIC_RESPONSE,
};
pub use opcode::Opcode;
pub use status::Status;
