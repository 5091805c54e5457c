// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Per-interface querier state machine.
//!
//! Pure state: every transition happens in `handle_event` (or `start`),
//! driven by an explicit `now` so tests steer time directly. The daemon
//! loop owns sockets and sleeping; this module only decides what the
//! interface believes and which packets it owes the network.
//!
//! Election follows RFC 2236 §3 / RFC 3376 §6.6: an interface starts as
//! querier and demotes itself the moment it hears a General Query from a
//! numerically lower source address. It promotes itself back when the
//! Other Querier Present timer runs out.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Instant;

use crate::config::InterfaceConfig;
use crate::membership::{GroupExpiryOutcome, GroupTable, TriggeredQuery};
use crate::packet::{
    max_resp_code, Message, Query, QueryVersion, ALL_HOSTS_GROUP,
};
use crate::timers::{TimerKey, TimerSet};

/// Election role of this interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Querier,
    NonQuerier,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Querier => write!(f, "querier"),
            Role::NonQuerier => write!(f, "non-querier"),
        }
    }
}

/// Input to the state machine
#[derive(Debug, Clone)]
pub enum QuerierEvent {
    /// A validated IGMP message arrived from `src`
    PacketReceived { src: Ipv4Addr, message: Message },
    /// A timer armed by this state machine came due
    TimerFired(TimerKey),
}

/// A packet the daemon must put on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub dst: Ipv4Addr,
    pub message: Message,
}

/// An event arrived that the current state cannot accept. The daemon
/// logs these and drops the event; state is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("timer {timer:?} fired while {role}")]
    InvalidTransition { timer: TimerKey, role: Role },
}

/// Everything one interface knows: role, peers, memberships, timers.
#[derive(Debug)]
pub struct InterfaceState {
    config: InterfaceConfig,
    /// Our source address on this interface; election compares against it
    pub our_addr: Ipv4Addr,
    role: Role,
    /// Address of the querier we deferred to, while NonQuerier
    other_querier: Option<Ipv4Addr>,
    /// General Queries still owed from the startup burst
    startup_queries_left: u8,
    groups: GroupTable,
}

impl InterfaceState {
    pub fn new(config: InterfaceConfig, our_addr: Ipv4Addr) -> Self {
        Self {
            config,
            our_addr,
            role: Role::Querier,
            other_querier: None,
            startup_queries_left: 0,
            groups: GroupTable::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn other_querier(&self) -> Option<Ipv4Addr> {
        self.other_querier
    }

    pub fn groups(&self) -> &GroupTable {
        &self.groups
    }

    pub fn config(&self) -> &InterfaceConfig {
        &self.config
    }

    /// Begin operation: assume the querier role and start the startup
    /// burst of General Queries at a quarter of the query interval.
    pub fn start(&mut self, now: Instant, timers: &mut TimerSet) -> Vec<Outbound> {
        self.role = Role::Querier;
        self.other_querier = None;
        self.startup_queries_left = self.config.startup_query_count().saturating_sub(1);
        let next = if self.startup_queries_left > 0 {
            self.config.startup_interval()
        } else {
            self.config.query_interval_duration()
        };
        timers.reset(TimerKey::GeneralQuery, now, next);
        vec![self.general_query()]
    }

    /// Feed one event through the state machine.
    pub fn handle_event(
        &mut self,
        event: QuerierEvent,
        now: Instant,
        timers: &mut TimerSet,
    ) -> Result<Vec<Outbound>, DispatchError> {
        match event {
            QuerierEvent::PacketReceived { src, message } => {
                Ok(self.handle_packet(src, message, now, timers))
            }
            QuerierEvent::TimerFired(key) => self.handle_timer(key, now, timers),
        }
    }

    fn handle_packet(
        &mut self,
        src: Ipv4Addr,
        message: Message,
        now: Instant,
        timers: &mut TimerSet,
    ) -> Vec<Outbound> {
        match message {
            Message::Query(query) => {
                self.observed_query(src, &query, now, timers);
                Vec::new()
            }
            Message::ReportV1 { group } | Message::ReportV2 { group } => {
                self.groups
                    .on_report_v2(src, group, now, &self.config.timing(), timers);
                Vec::new()
            }
            Message::ReportV3 { records } => {
                let triggered = self.groups.on_report_v3(
                    src,
                    &records,
                    now,
                    &self.config.timing(),
                    timers,
                    self.role == Role::Querier,
                );
                triggered
                    .into_iter()
                    .map(|query| self.group_query(query))
                    .collect()
            }
            Message::Leave { group } => {
                // Only the elected querier chases leaves
                if self.role != Role::Querier {
                    return Vec::new();
                }
                self.groups
                    .on_leave(group, now, &self.config.timing(), timers)
                    .map(|query| self.group_query(query))
                    .into_iter()
                    .collect()
            }
            Message::Unknown { .. } => Vec::new(),
        }
    }

    /// Election logic. Only a General Query is evidence of a competing
    /// querier; group-specific queries also come from non-queriers
    /// finishing a leave sequence they started before losing election.
    fn observed_query(
        &mut self,
        src: Ipv4Addr,
        query: &Query,
        now: Instant,
        timers: &mut TimerSet,
    ) {
        if !query.is_general() || src == self.our_addr || src.is_unspecified() {
            return;
        }
        if u32::from(src) >= u32::from(self.our_addr) {
            // Higher-address querier defers to us; nothing to do
            return;
        }

        match self.role {
            Role::Querier => {
                self.role = Role::NonQuerier;
                self.other_querier = Some(src);
                self.startup_queries_left = 0;
                timers.cancel(&TimerKey::GeneralQuery);
            }
            Role::NonQuerier => {
                // Track whichever lower-address querier spoke last
                self.other_querier = Some(src);
            }
        }
        timers.reset(
            TimerKey::OtherQuerierPresent,
            now,
            self.config.other_querier_present_interval(),
        );
    }

    fn handle_timer(
        &mut self,
        key: TimerKey,
        now: Instant,
        timers: &mut TimerSet,
    ) -> Result<Vec<Outbound>, DispatchError> {
        match key {
            TimerKey::GeneralQuery => {
                if self.role != Role::Querier {
                    return Err(DispatchError::InvalidTransition {
                        timer: key,
                        role: self.role,
                    });
                }
                let next = if self.startup_queries_left > 0 {
                    self.startup_queries_left -= 1;
                    if self.startup_queries_left > 0 {
                        self.config.startup_interval()
                    } else {
                        self.config.query_interval_duration()
                    }
                } else {
                    self.config.query_interval_duration()
                };
                timers.reset(TimerKey::GeneralQuery, now, next);
                Ok(vec![self.general_query()])
            }
            TimerKey::OtherQuerierPresent => {
                if self.role != Role::NonQuerier {
                    return Err(DispatchError::InvalidTransition {
                        timer: key,
                        role: self.role,
                    });
                }
                // The other querier went quiet; take over
                self.role = Role::Querier;
                self.other_querier = None;
                timers.reset(
                    TimerKey::GeneralQuery,
                    now,
                    self.config.query_interval_duration(),
                );
                Ok(vec![self.general_query()])
            }
            TimerKey::GroupExpiry(group) => {
                match self.groups.on_group_expiry(group, now, timers) {
                    GroupExpiryOutcome::Removed
                    | GroupExpiryOutcome::SwitchedToInclude
                    | GroupExpiryOutcome::Stale => Ok(Vec::new()),
                }
            }
            TimerKey::SourceExpiry(group, source) => {
                self.groups.on_source_expiry(group, source, now, timers);
                Ok(Vec::new())
            }
            TimerKey::LastMemberQuery(group) => {
                if self.role != Role::Querier {
                    // Lost election mid-sequence; let the lowered timers run out
                    return Ok(Vec::new());
                }
                Ok(self
                    .groups
                    .on_last_member_timer(group, now, &self.config.timing(), timers)
                    .map(|query| self.group_query(query))
                    .into_iter()
                    .collect())
            }
        }
    }

    fn general_query(&self) -> Outbound {
        let max_resp = self.config.query_response_duration();
        let query = match self.version() {
            QueryVersion::V3 => Query::general_v3(
                max_resp_code(max_resp, QueryVersion::V3),
                self.config.robustness,
                qqic_code(self.config.query_interval),
            ),
            _ => Query::general_v2(max_resp_code(max_resp, QueryVersion::V2)),
        };
        Outbound {
            dst: ALL_HOSTS_GROUP,
            message: Message::Query(query),
        }
    }

    fn group_query(&self, triggered: TriggeredQuery) -> Outbound {
        let max_resp = self.config.last_member_query_duration();
        let query = match self.version() {
            QueryVersion::V3 => Query::group_specific_v3(
                triggered.group,
                max_resp_code(max_resp, QueryVersion::V3),
                self.config.robustness,
                qqic_code(self.config.query_interval),
                triggered
                    .sources
                    .map(|set| set.into_iter().collect())
                    .unwrap_or_default(),
            ),
            // v2 has no source lists; a source query degrades to Q(G)
            _ => Query::group_specific_v2(
                triggered.group,
                max_resp_code(max_resp, QueryVersion::V2),
            ),
        };
        Outbound {
            dst: triggered.group,
            message: Message::Query(query),
        }
    }

    fn version(&self) -> QueryVersion {
        if self.config.query_version == 3 {
            QueryVersion::V3
        } else {
            QueryVersion::V2
        }
    }
}

/// Encode a query interval in seconds as a QQIC field (RFC 3376 §4.1.7)
fn qqic_code(secs: u64) -> u8 {
    if secs < 128 {
        secs as u8
    } else {
        let mut exp = 0u8;
        let mut mant = secs >> 3;
        while mant > 0x1F && exp < 7 {
            mant >>= 1;
            exp += 1;
        }
        0x80 | (exp << 4) | ((mant as u8) & 0x0F)
    }
}
