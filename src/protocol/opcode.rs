//! Opcodes carried by the binary protocol.

use std::fmt;

/// Commands the connection engine dispatches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Quit = 0x07,
    Noop = 0x0a,
    Version = 0x0b,
    Hello = 0x1f,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
    SelectBucket = 0x89,
}

impl Opcode {
    #[must_use]
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Opcode::Get,
            0x01 => Opcode::Set,
            0x02 => Opcode::Add,
            0x03 => Opcode::Replace,
            0x04 => Opcode::Delete,
            0x07 => Opcode::Quit,
            0x0a => Opcode::Noop,
            0x0b => Opcode::Version,
            0x1f => Opcode::Hello,
            0x20 => Opcode::SaslListMechs,
            0x21 => Opcode::SaslAuth,
            0x22 => Opcode::SaslStep,
            0x89 => Opcode::SelectBucket,
            _ => return None,
        })
    }

    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether this command mutates bucket data.
    #[must_use]
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Opcode::Set | Opcode::Add | Opcode::Replace | Opcode::Delete
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Opcode::Get => "GET",
            Opcode::Set => "SET",
            Opcode::Add => "ADD",
            Opcode::Replace => "REPLACE",
            Opcode::Delete => "DELETE",
            Opcode::Quit => "QUIT",
            Opcode::Noop => "NOOP",
            Opcode::Version => "VERSION",
            Opcode::Hello => "HELLO",
            Opcode::SaslListMechs => "SASL_LIST_MECHS",
            Opcode::SaslAuth => "SASL_AUTH",
            Opcode::SaslStep => "SASL_STEP",
            Opcode::SelectBucket => "SELECT_BUCKET",
        };
        write!(f, "{s}")
    }
}
