//! Protocol versioning

use serde::{Deserialize, Serialize};
use std::fmt;

/// Packed protocol version: `(epoch << 22) | (major << 12) | minor`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion(u32);

impl ProtocolVersion {
    pub const fn new(epoch: u32, major: u32, minor: u32) -> Self {
        Self((epoch << 22) | ((major & 0x3ff) << 12) | (minor & 0xfff))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn epoch(self) -> u32 {
        self.0 >> 22
    }

    pub const fn major(self) -> u32 {
        (self.0 >> 12) & 0x3ff
    }

    pub const fn minor(self) -> u32 {
        self.0 & 0xfff
    }

    /// Whether a server speaking the current protocol accepts this version
    pub fn is_supported(self) -> bool {
        (OLDEST_COMPATIBLE_PROTOCOL_VERSION..=CURRENT_PROTOCOL_VERSION).contains(&self)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.epoch(), self.major(), self.minor())
    }
}

/// Version spoken by this build
pub const CURRENT_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(1, 4, 0);

/// Oldest client version the server still accepts
pub const OLDEST_COMPATIBLE_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::new(1, 0, 0);
