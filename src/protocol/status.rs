//! Wire status codes.

use std::fmt;

/// Status field of a response packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    #[default]
    Success = 0x0000,
    KeyEnoent = 0x0001,
    KeyEexists = 0x0002,
    E2big = 0x0003,
    Einval = 0x0004,
    NotStored = 0x0005,
    DeltaBadval = 0x0006,
    NotMyPartition = 0x0007,
    NoBucket = 0x0008,
    Locked = 0x0009,
    AuthStale = 0x001f,
    AuthError = 0x0020,
    AuthContinue = 0x0021,
    Erange = 0x0022,
    Eaccess = 0x0024,
    UnknownCommand = 0x0081,
    Enomem = 0x0082,
    NotSupported = 0x0083,
    Einternal = 0x0084,
    Ebusy = 0x0085,
    Etmpfail = 0x0086,
    UnknownCollection = 0x0088,
}

impl Status {
    #[must_use]
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Success => "Success",
            Status::KeyEnoent => "Not found",
            Status::KeyEexists => "Data exists for key",
            Status::E2big => "Too large",
            Status::Einval => "Invalid arguments",
            Status::NotStored => "Not stored",
            Status::DeltaBadval => "Non-numeric value",
            Status::NotMyPartition => "Not my vbucket",
            Status::NoBucket => "No bucket selected",
            Status::Locked => "Locked",
            Status::AuthStale => "Authentication stale",
            Status::AuthError => "Auth failure",
            Status::AuthContinue => "Auth continue",
            Status::Erange => "Outside legal range",
            Status::Eaccess => "No access",
            Status::UnknownCommand => "Unknown command",
            Status::Enomem => "Out of memory",
            Status::NotSupported => "Not supported",
            Status::Einternal => "Internal error",
            Status::Ebusy => "Too busy",
            Status::Etmpfail => "Temporary failure",
            Status::UnknownCollection => "Unknown collection",
        };
        write!(f, "{s}")
    }
}
