// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logging facilities (component identifiers)

use serde::{Deserialize, Serialize};

/// Logging facility - identifies which component generated the log message
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Facility {
    /// Daemon loop, interface lifecycle
    Daemon = 0,
    /// Querier election and query scheduling
    Querier = 1,
    /// Group membership table
    Membership = 2,
    /// IGMP message encode/decode
    Codec = 3,
    /// Timer set bookkeeping
    Timers = 4,
    /// Raw socket transport
    Transport = 5,
    /// Configuration loading and validation
    Config = 6,

    /// Fallback for uncategorized messages
    Unknown = 255,
}

impl Facility {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Facility::Daemon => "daemon",
            Facility::Querier => "querier",
            Facility::Membership => "membership",
            Facility::Codec => "codec",
            Facility::Timers => "timers",
            Facility::Transport => "transport",
            Facility::Config => "config",
            Facility::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Facility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
