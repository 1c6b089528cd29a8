//! HELLO feature negotiation.

use std::fmt;

use rustc_hash::FxHashSet;

/// Features a client can toggle during HELLO negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Feature {
    TcpNoDelay = 0x03,
    MutationSeqno = 0x04,
    Xattr = 0x06,
    Xerror = 0x07,
    SelectBucket = 0x08,
    Collections = 0x09,
    Snappy = 0x0a,
    Tracing = 0x0f,
}

impl Feature {
    #[must_use]
    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            0x03 => Feature::TcpNoDelay,
            0x04 => Feature::MutationSeqno,
            0x06 => Feature::Xattr,
            0x07 => Feature::Xerror,
            0x08 => Feature::SelectBucket,
            0x09 => Feature::Collections,
            0x0a => Feature::Snappy,
            0x0f => Feature::Tracing,
            _ => return None,
        })
    }

    #[must_use]
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Feature::TcpNoDelay => "TCP nodelay",
            Feature::MutationSeqno => "Mutation seqno",
            Feature::Xattr => "XATTR",
            Feature::Xerror => "XERROR",
            Feature::SelectBucket => "Select bucket",
            Feature::Collections => "Collections",
            Feature::Snappy => "Snappy",
            Feature::Tracing => "Tracing",
        };
        write!(f, "{s}")
    }
}

/// The set of features a connection has negotiated.
#[derive(Clone, Debug, Default)]
pub struct FeatureSet {
    enabled: FxHashSet<Feature>,
}

impl FeatureSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&mut self, feature: Feature) {
        self.enabled.insert(feature);
    }

    #[must_use]
    pub fn contains(&self, feature: Feature) -> bool {
        self.enabled.contains(&feature)
    }

    #[must_use]
    pub fn xerror(&self) -> bool {
        self.contains(Feature::Xerror)
    }

    #[must_use]
    pub fn collections(&self) -> bool {
        self.contains(Feature::Collections)
    }

    /// Negotiated features in wire order for the HELLO response body.
    #[must_use]
    pub fn to_wire(&self) -> Vec<u8> {
        let mut codes: Vec<u16> = self.enabled.iter().map(|f| f.as_u16()).collect();
        codes.sort_unstable();
        codes.iter().flat_map(|c| c.to_be_bytes()).collect()
    }
}
