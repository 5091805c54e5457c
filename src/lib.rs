use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

pub mod config;
pub mod daemon;
#[macro_use]
pub mod logging;
pub mod membership;
pub mod packet;
pub mod querier;
pub mod timers;
pub mod transport;

/// One tracked membership, as reported in snapshots and shutdown logs.
///
/// `sources: None` means the group wants traffic from every source
/// (EXCLUDE mode, which is also how v1/v2 joins are represented);
/// `Some(set)` lists the INCLUDE-mode sources.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GroupMembership {
    pub group: Ipv4Addr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<BTreeSet<Ipv4Addr>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reporter: Option<Ipv4Addr>,
}
