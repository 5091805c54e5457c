// SPDX-License-Identifier: Apache-2.0 OR MIT
// Severity levels for logging (RFC 5424 syslog-style)

use serde::{Deserialize, Serialize};

/// Log severity levels (0-7, lower is more severe)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// System unusable (daemon cannot continue)
    Emergency = 0,
    /// Immediate action required (transport socket lost)
    Alert = 1,
    /// Critical conditions (timer invariant violation)
    Critical = 2,
    /// Error conditions (send failure, decode pipeline fault)
    Error = 3,
    /// Warning conditions (malformed packet dropped)
    Warning = 4,
    /// Significant normal condition (role change, interface up)
    Notice = 5,
    /// Informational (query sent, report processed)
    Info = 6,
    /// Debug-level messages (timer arming, per-packet traces)
    Debug = 7,
}

impl Severity {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Severity::Emergency => "EMERGENCY",
            Severity::Alert => "ALERT",
            Severity::Critical => "CRITICAL",
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::Notice => "NOTICE",
            Severity::Info => "INFO",
            Severity::Debug => "DEBUG",
        }
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Severity::Emergency),
            1 => Some(Severity::Alert),
            2 => Some(Severity::Critical),
            3 => Some(Severity::Error),
            4 => Some(Severity::Warning),
            5 => Some(Severity::Notice),
            6 => Some(Severity::Info),
            7 => Some(Severity::Debug),
            _ => None,
        }
    }

    /// Parse a severity name as used in config files and on the CLI
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "emergency" => Some(Severity::Emergency),
            "alert" => Some(Severity::Alert),
            "critical" => Some(Severity::Critical),
            "error" => Some(Severity::Error),
            "warning" | "warn" => Some(Severity::Warning),
            "notice" => Some(Severity::Notice),
            "info" => Some(Severity::Info),
            "debug" => Some(Severity::Debug),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
