// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Configuration file types and parsing for querierd.
//!
//! JSON5 configuration format supporting:
//! - Per-interface protocol timing (robustness, query intervals)
//! - Comments and trailing commas
//!
//! All intervals are in seconds; derived values (Group Membership
//! Interval, Other Querier Present Interval) come from the RFC 3376
//! formulas via methods on `InterfaceConfig`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::membership::MembershipTiming;

/// Largest Query Interval representable in a QQIC field: mantissa
/// 0x1f shifted by the maximum exponent, (0x0f | 0x10) << (7 + 3).
pub const MAX_QUERY_INTERVAL_SECS: u64 = 31_744;

/// Startup configuration (JSON5 file format)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    /// Interfaces to run a querier instance on
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,

    /// Minimum log severity by name ("debug", "info", ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

/// Per-interface querier settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterfaceConfig {
    /// Network interface name
    pub name: String,

    /// Robustness Variable (RFC 3376 §8.1)
    #[serde(default = "default_robustness")]
    pub robustness: u8,

    /// Query Interval between General Queries, seconds
    #[serde(default = "default_query_interval")]
    pub query_interval: u64,

    /// Max Response Time advertised in General Queries, seconds
    #[serde(default = "default_query_response_interval")]
    pub query_response_interval: u64,

    /// Max Response Time for Group-Specific Queries, seconds
    #[serde(default = "default_last_member_query_interval")]
    pub last_member_query_interval: u64,

    /// Group-Specific Queries sent per leave
    #[serde(default = "default_last_member_query_count")]
    pub last_member_query_count: u8,

    /// General Queries sent at startup; defaults to the robustness value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_query_count: Option<u8>,

    /// IP TTL on emitted queries
    #[serde(default = "default_ttl")]
    pub ttl: u8,

    /// Query wire format to emit: 2 or 3
    #[serde(default = "default_query_version")]
    pub query_version: u8,
}

fn default_robustness() -> u8 {
    2
}

fn default_query_interval() -> u64 {
    125
}

fn default_query_response_interval() -> u64 {
    10
}

fn default_last_member_query_interval() -> u64 {
    1
}

fn default_last_member_query_count() -> u8 {
    2
}

fn default_ttl() -> u8 {
    1
}

fn default_query_version() -> u8 {
    3
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            robustness: default_robustness(),
            query_interval: default_query_interval(),
            query_response_interval: default_query_response_interval(),
            last_member_query_interval: default_last_member_query_interval(),
            last_member_query_count: default_last_member_query_count(),
            startup_query_count: None,
            ttl: default_ttl(),
            query_version: default_query_version(),
        }
    }
}

impl InterfaceConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Group Membership Interval:
    /// robustness x query interval + query response interval
    pub fn group_membership_interval(&self) -> Duration {
        Duration::from_secs(
            self.robustness as u64 * self.query_interval + self.query_response_interval,
        )
    }

    /// Other Querier Present Interval:
    /// robustness x query interval + query response interval / 2
    pub fn other_querier_present_interval(&self) -> Duration {
        Duration::from_millis(
            self.robustness as u64 * self.query_interval * 1000
                + self.query_response_interval * 500,
        )
    }

    pub fn query_interval_duration(&self) -> Duration {
        Duration::from_secs(self.query_interval)
    }

    pub fn query_response_duration(&self) -> Duration {
        Duration::from_secs(self.query_response_interval)
    }

    pub fn last_member_query_duration(&self) -> Duration {
        Duration::from_secs(self.last_member_query_interval)
    }

    /// Interval between the rapid General Queries sent at startup:
    /// a quarter of the configured Query Interval.
    pub fn startup_interval(&self) -> Duration {
        Duration::from_millis(self.query_interval * 250)
    }

    pub fn startup_query_count(&self) -> u8 {
        self.startup_query_count.unwrap_or(self.robustness)
    }

    pub fn timing(&self) -> MembershipTiming {
        MembershipTiming {
            group_membership_interval: self.group_membership_interval(),
            last_member_query_interval: self.last_member_query_duration(),
            last_member_query_count: self.last_member_query_count,
        }
    }
}

impl Config {
    /// Load configuration from a JSON5 file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        json5::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Serialize configuration
    pub fn to_json5(&self) -> String {
        // json5 crate doesn't have pretty printing, so we use serde_json for
        // output and rely on json5 for input (which handles comments and
        // trailing commas)
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interfaces.is_empty() {
            return Err(ConfigError::NoInterfaces);
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for interface in &self.interfaces {
            validate_interface_name(&interface.name)?;
            if !seen.insert(interface.name.as_str()) {
                return Err(ConfigError::DuplicateInterface {
                    name: interface.name.clone(),
                });
            }

            if interface.robustness == 0 {
                return Err(ConfigError::InvalidTiming {
                    interface: interface.name.clone(),
                    reason: "robustness must be at least 1".to_string(),
                });
            }
            if interface.query_interval == 0 {
                return Err(ConfigError::InvalidTiming {
                    interface: interface.name.clone(),
                    reason: "query_interval must be at least 1 second".to_string(),
                });
            }
            if interface.query_interval > MAX_QUERY_INTERVAL_SECS {
                return Err(ConfigError::InvalidTiming {
                    interface: interface.name.clone(),
                    reason: format!(
                        "query_interval must be at most {} seconds",
                        MAX_QUERY_INTERVAL_SECS
                    ),
                });
            }
            if interface.query_response_interval >= interface.query_interval {
                return Err(ConfigError::InvalidTiming {
                    interface: interface.name.clone(),
                    reason: "query_response_interval must be less than query_interval"
                        .to_string(),
                });
            }
            if interface.last_member_query_count == 0 {
                return Err(ConfigError::InvalidTiming {
                    interface: interface.name.clone(),
                    reason: "last_member_query_count must be at least 1".to_string(),
                });
            }
            if interface.ttl == 0 {
                return Err(ConfigError::InvalidTiming {
                    interface: interface.name.clone(),
                    reason: "ttl must be at least 1".to_string(),
                });
            }
            if !matches!(interface.query_version, 2 | 3) {
                return Err(ConfigError::InvalidVersion {
                    interface: interface.name.clone(),
                    version: interface.query_version,
                });
            }
        }

        if let Some(level) = &self.log_level {
            if crate::logging::Severity::from_name(level).is_none() {
                return Err(ConfigError::InvalidLogLevel {
                    level: level.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Validate an interface name
fn validate_interface_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::InvalidInterfaceName {
            name: name.to_string(),
            reason: "interface name cannot be empty".to_string(),
        });
    }
    if name.len() > 15 {
        // Linux IFNAMSIZ limit
        return Err(ConfigError::InvalidInterfaceName {
            name: name.to_string(),
            reason: "interface name too long (max 15 chars)".to_string(),
        });
    }
    // Check for invalid characters
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ConfigError::InvalidInterfaceName {
            name: name.to_string(),
            reason: "interface name contains invalid characters".to_string(),
        });
    }
    // Interface names shouldn't start with a number
    if name.chars().next().map(|c| c.is_ascii_digit()) == Some(true) {
        return Err(ConfigError::InvalidInterfaceName {
            name: name.to_string(),
            reason: "interface name cannot start with a digit".to_string(),
        });
    }
    Ok(())
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    IoError(std::path::PathBuf, String),
    ParseError(String),
    NoInterfaces,
    DuplicateInterface {
        name: String,
    },
    InvalidInterfaceName {
        name: String,
        reason: String,
    },
    InvalidTiming {
        interface: String,
        reason: String,
    },
    InvalidVersion {
        interface: String,
        version: u8,
    },
    InvalidLogLevel {
        level: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, msg) => {
                write!(
                    f,
                    "failed to read config file '{}': {}",
                    path.display(),
                    msg
                )
            }
            ConfigError::ParseError(msg) => write!(f, "failed to parse config: {}", msg),
            ConfigError::NoInterfaces => {
                write!(f, "configuration lists no interfaces to serve")
            }
            ConfigError::DuplicateInterface { name } => {
                write!(f, "interface '{}' listed more than once", name)
            }
            ConfigError::InvalidInterfaceName { name, reason } => {
                write!(f, "invalid interface name '{}': {}", name, reason)
            }
            ConfigError::InvalidTiming { interface, reason } => {
                write!(f, "invalid timing on interface '{}': {}", interface, reason)
            }
            ConfigError::InvalidVersion { interface, version } => {
                write!(
                    f,
                    "unsupported query version {} on interface '{}' (expected 2 or 3)",
                    version, interface
                )
            }
            ConfigError::InvalidLogLevel { level } => {
                write!(f, "unknown log level '{}'", level)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
