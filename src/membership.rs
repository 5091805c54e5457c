// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Per-interface multicast group membership table.
//!
//! Tracks one `GroupRecord` per reported group. v1/v2 reports are folded
//! into the IGMPv3 model as EXCLUDE mode with an empty source list, so a
//! single state representation serves all protocol versions.
//!
//! The v3 merge rules follow the router-side combination tables of
//! RFC 3376 §6.4.1 (current mode INCLUDE) and §6.4.2 (current mode
//! EXCLUDE) explicitly, one arm per (mode, record type) pair. `Q(G)` and
//! `Q(G,S)` actions become `TriggeredQuery` values the querier turns into
//! group(-and-source)-specific query sequences; callers pass
//! `send_queries = false` when the interface is not the elected querier.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::packet::{RecordType, ReportRecord};
use crate::timers::{TimerKey, TimerSet};
use crate::GroupMembership;

/// IGMPv3 filter mode of a group record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Include,
    Exclude,
}

/// An in-flight group(-and-source)-specific query sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingQuery {
    /// `None` queries the whole group; `Some` queries the listed sources
    pub sources: Option<BTreeSet<Ipv4Addr>>,
    /// Retransmissions still owed after the query already sent
    pub retransmits_left: u8,
}

/// A query the table wants sent, produced while merging a report or
/// processing a leave. The querier owns actually emitting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggeredQuery {
    pub group: Ipv4Addr,
    pub sources: Option<BTreeSet<Ipv4Addr>>,
}

/// Membership state for one group
#[derive(Debug, Clone)]
pub struct GroupRecord {
    pub group: Ipv4Addr,
    pub filter_mode: FilterMode,
    /// Group timer; drives record expiry in EXCLUDE mode
    pub group_expiry: Option<Instant>,
    /// INCLUDE: every source has `Some(expiry)`.
    /// EXCLUDE: `Some` = requested sources (still forwarded),
    /// `None` = excluded sources (no timer).
    pub sources: BTreeMap<Ipv4Addr, Option<Instant>>,
    /// Last host seen reporting this group
    pub last_reporter: Option<Ipv4Addr>,
    pub pending: Option<PendingQuery>,
}

impl GroupRecord {
    fn new_exclude(group: Ipv4Addr, expiry: Instant) -> Self {
        Self {
            group,
            filter_mode: FilterMode::Exclude,
            group_expiry: Some(expiry),
            sources: BTreeMap::new(),
            last_reporter: None,
            pending: None,
        }
    }

    fn new_include(group: Ipv4Addr) -> Self {
        Self {
            group,
            filter_mode: FilterMode::Include,
            group_expiry: None,
            sources: BTreeMap::new(),
            last_reporter: None,
            pending: None,
        }
    }

    /// Sources whose timer is still running (INCLUDE set, or requested
    /// sources in EXCLUDE mode).
    fn live_sources(&self, now: Instant) -> BTreeSet<Ipv4Addr> {
        self.sources
            .iter()
            .filter_map(|(source, expiry)| match expiry {
                Some(when) if *when > now => Some(*source),
                _ => None,
            })
            .collect()
    }
}

/// What happened when a group timer fired
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupExpiryOutcome {
    /// Record deleted, no member remains
    Removed,
    /// EXCLUDE record switched to INCLUDE over its still-live sources
    SwitchedToInclude,
    /// Timer fire was stale (record gone or refreshed); nothing changed
    Stale,
}

/// Timeout knobs the table needs; derived from the interface config.
#[derive(Debug, Clone, Copy)]
pub struct MembershipTiming {
    /// Group Membership Interval: robustness x query interval + query response interval
    pub group_membership_interval: Duration,
    pub last_member_query_interval: Duration,
    pub last_member_query_count: u8,
}

impl MembershipTiming {
    /// Last Member Query Time: how long membership survives once a
    /// leave-triggered query sequence starts unanswered.
    pub fn last_member_query_time(&self) -> Duration {
        self.last_member_query_interval * self.last_member_query_count as u32
    }
}

#[derive(Debug, Default)]
pub struct GroupTable {
    groups: HashMap<Ipv4Addr, GroupRecord>,
}

impl GroupTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, group: &Ipv4Addr) -> Option<&GroupRecord> {
        self.groups.get(group)
    }

    /// Groups in 224.0.0.0/24 are link-local control traffic and never
    /// tracked as memberships; non-multicast addresses are invalid.
    pub fn is_trackable(group: Ipv4Addr) -> bool {
        group.is_multicast() && group.octets()[..3] != [224, 0, 0]
    }

    /// Process a v1/v2 membership report: EXCLUDE {} with the group
    /// timer reset to the Group Membership Interval.
    pub fn on_report_v2(
        &mut self,
        reporter: Ipv4Addr,
        group: Ipv4Addr,
        now: Instant,
        timing: &MembershipTiming,
        timers: &mut TimerSet,
    ) {
        if !Self::is_trackable(group) {
            return;
        }
        let expiry = now + timing.group_membership_interval;
        let record = self
            .groups
            .entry(group)
            .or_insert_with(|| GroupRecord::new_exclude(group, expiry));

        record.filter_mode = FilterMode::Exclude;
        record.group_expiry = Some(expiry);
        record.last_reporter = Some(reporter);
        // A fresh report cancels any leave-triggered query sequence
        record.pending = None;
        timers.cancel(&TimerKey::LastMemberQuery(group));
        timers.reset(TimerKey::GroupExpiry(group), now, timing.group_membership_interval);
    }

    /// Process the records of a v3 membership report. Returns the
    /// triggered queries prescribed by the combination tables when
    /// `send_queries` is set (Role = Querier).
    pub fn on_report_v3(
        &mut self,
        reporter: Ipv4Addr,
        records: &[ReportRecord],
        now: Instant,
        timing: &MembershipTiming,
        timers: &mut TimerSet,
        send_queries: bool,
    ) -> Vec<TriggeredQuery> {
        let mut queries = Vec::new();
        for record in records {
            if !Self::is_trackable(record.group) {
                continue;
            }
            self.merge_record(reporter, record, now, timing, timers, send_queries, &mut queries);
        }
        queries
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_record(
        &mut self,
        reporter: Ipv4Addr,
        report: &ReportRecord,
        now: Instant,
        timing: &MembershipTiming,
        timers: &mut TimerSet,
        send_queries: bool,
        queries: &mut Vec<TriggeredQuery>,
    ) {
        let gmi = timing.group_membership_interval;
        let group = report.group;
        let incoming: BTreeSet<Ipv4Addr> = report.sources.iter().copied().collect();

        // IS_IN/ALLOW/TO_IN with no current state and no sources carries
        // no membership; don't materialize an empty INCLUDE record.
        let creates_state = matches!(
            report.record_type,
            RecordType::ModeIsExclude | RecordType::ChangeToExclude
        ) || !incoming.is_empty();
        if !self.groups.contains_key(&group) && !creates_state {
            return;
        }

        let record = self
            .groups
            .entry(group)
            .or_insert_with(|| GroupRecord::new_include(group));
        record.last_reporter = Some(reporter);

        let mode = record.filter_mode;
        match (mode, report.record_type) {
            // 6.4.1 INCLUDE (A) + IS_IN(B) / ALLOW(B): A+B, (B)=GMI
            (FilterMode::Include, RecordType::ModeIsInclude)
            | (FilterMode::Include, RecordType::AllowNewSources) => {
                for source in &incoming {
                    record.sources.insert(*source, Some(now + gmi));
                    timers.reset(TimerKey::SourceExpiry(group, *source), now, gmi);
                }
                Self::unpend_sources(record, &incoming, timers);
            }

            // 6.4.1 INCLUDE (A) + IS_EX(B): EXCLUDE(A*B, B-A), group timer = GMI
            (FilterMode::Include, RecordType::ModeIsExclude) => {
                Self::become_exclude(record, &incoming, now, now + gmi, timers);
            }

            // 6.4.1 INCLUDE (A) + TO_IN(B): A+B, (B)=GMI, Q(G, A-B)
            (FilterMode::Include, RecordType::ChangeToInclude) => {
                let current: BTreeSet<Ipv4Addr> = record.sources.keys().copied().collect();
                for source in &incoming {
                    record.sources.insert(*source, Some(now + gmi));
                    timers.reset(TimerKey::SourceExpiry(group, *source), now, gmi);
                }
                Self::unpend_sources(record, &incoming, timers);
                let stale: BTreeSet<Ipv4Addr> = current.difference(&incoming).copied().collect();
                if send_queries && !stale.is_empty() {
                    Self::start_source_query(record, stale, now, timing, timers, queries);
                }
            }

            // 6.4.1 INCLUDE (A) + TO_EX(B): EXCLUDE(A*B, B-A), Q(G, A*B), group timer = GMI
            (FilterMode::Include, RecordType::ChangeToExclude) => {
                let current: BTreeSet<Ipv4Addr> = record.sources.keys().copied().collect();
                Self::become_exclude(record, &incoming, now, now + gmi, timers);
                let still_requested: BTreeSet<Ipv4Addr> =
                    current.intersection(&incoming).copied().collect();
                if send_queries && !still_requested.is_empty() {
                    Self::start_source_query(record, still_requested, now, timing, timers, queries);
                }
            }

            // 6.4.1 INCLUDE (A) + BLOCK(B): state unchanged, Q(G, A*B)
            (FilterMode::Include, RecordType::BlockOldSources) => {
                let current: BTreeSet<Ipv4Addr> = record.sources.keys().copied().collect();
                let blocked: BTreeSet<Ipv4Addr> =
                    current.intersection(&incoming).copied().collect();
                if send_queries && !blocked.is_empty() {
                    Self::start_source_query(record, blocked, now, timing, timers, queries);
                }
            }

            // 6.4.2 EXCLUDE (X,Y) + IS_IN(A) / ALLOW(A): X+A with (A)=GMI, Y-A
            (FilterMode::Exclude, RecordType::ModeIsInclude)
            | (FilterMode::Exclude, RecordType::AllowNewSources) => {
                for source in &incoming {
                    record.sources.insert(*source, Some(now + gmi));
                    timers.reset(TimerKey::SourceExpiry(group, *source), now, gmi);
                }
                Self::unpend_sources(record, &incoming, timers);
            }

            // 6.4.2 EXCLUDE (X,Y) + IS_EX(A): (A-X-Y)=GMI, delete X-A and Y-A, group timer = GMI
            (FilterMode::Exclude, RecordType::ModeIsExclude) => {
                Self::intersect_exclude(record, &incoming, now, now + gmi, gmi, timers);
                record.group_expiry = Some(now + gmi);
                timers.reset(TimerKey::GroupExpiry(group), now, gmi);
            }

            // 6.4.2 EXCLUDE (X,Y) + TO_EX(A): (A-X-Y)=group timer, delete X-A and Y-A,
            // Q(G, A-Y), group timer = GMI
            (FilterMode::Exclude, RecordType::ChangeToExclude) => {
                let previously_excluded: BTreeSet<Ipv4Addr> = record
                    .sources
                    .iter()
                    .filter(|(_, expiry)| expiry.is_none())
                    .map(|(source, _)| *source)
                    .collect();
                let group_timer_left = record
                    .group_expiry
                    .map(|when| when.max(now))
                    .unwrap_or(now);
                Self::intersect_exclude(
                    record,
                    &incoming,
                    now,
                    group_timer_left,
                    group_timer_left.saturating_duration_since(now),
                    timers,
                );
                record.group_expiry = Some(now + gmi);
                timers.reset(TimerKey::GroupExpiry(group), now, gmi);

                let to_query: BTreeSet<Ipv4Addr> = incoming
                    .difference(&previously_excluded)
                    .copied()
                    .collect();
                if send_queries && !to_query.is_empty() {
                    Self::start_source_query(record, to_query, now, timing, timers, queries);
                }
            }

            // 6.4.2 EXCLUDE (X,Y) + TO_IN(A): (A)=GMI, Q(G, X-A), Q(G)
            (FilterMode::Exclude, RecordType::ChangeToInclude) => {
                let requested: BTreeSet<Ipv4Addr> = record
                    .sources
                    .iter()
                    .filter(|(_, expiry)| expiry.is_some())
                    .map(|(source, _)| *source)
                    .collect();
                for source in &incoming {
                    record.sources.insert(*source, Some(now + gmi));
                    timers.reset(TimerKey::SourceExpiry(group, *source), now, gmi);
                }
                Self::unpend_sources(record, &incoming, timers);
                if send_queries {
                    let stale: BTreeSet<Ipv4Addr> =
                        requested.difference(&incoming).copied().collect();
                    if !stale.is_empty() {
                        Self::start_source_query(record, stale, now, timing, timers, queries);
                    }
                    Self::start_group_query(record, now, timing, timers, queries);
                }
            }

            // 6.4.2 EXCLUDE (X,Y) + BLOCK(A): (A-X-Y)=group timer, Q(G, A-Y)
            (FilterMode::Exclude, RecordType::BlockOldSources) => {
                let previously_excluded: BTreeSet<Ipv4Addr> = record
                    .sources
                    .iter()
                    .filter(|(_, expiry)| expiry.is_none())
                    .map(|(source, _)| *source)
                    .collect();
                let group_timer_left = record
                    .group_expiry
                    .map(|when| when.max(now))
                    .unwrap_or(now);
                for source in &incoming {
                    if !record.sources.contains_key(source) {
                        record.sources.insert(*source, Some(group_timer_left));
                        timers.reset(
                            TimerKey::SourceExpiry(group, *source),
                            now,
                            group_timer_left.saturating_duration_since(now),
                        );
                    }
                }
                let to_query: BTreeSet<Ipv4Addr> = incoming
                    .difference(&previously_excluded)
                    .copied()
                    .collect();
                if send_queries && !to_query.is_empty() {
                    Self::start_source_query(record, to_query, now, timing, timers, queries);
                }
            }
        }

        // An INCLUDE record with no sources left means no member remains
        if record.filter_mode == FilterMode::Include && record.sources.is_empty() {
            self.remove(&group, timers);
        }
    }

    /// Switch a record to EXCLUDE mode against an incoming exclude set:
    /// keep timers for sources both sides know, track new exclusions
    /// without timers, drop sources no longer mentioned.
    fn become_exclude(
        record: &mut GroupRecord,
        incoming: &BTreeSet<Ipv4Addr>,
        now: Instant,
        group_expiry: Instant,
        timers: &mut TimerSet,
    ) {
        let current: BTreeSet<Ipv4Addr> = record.sources.keys().copied().collect();
        for source in current.difference(incoming) {
            record.sources.remove(source);
            timers.cancel(&TimerKey::SourceExpiry(record.group, *source));
        }
        for source in incoming {
            record.sources.entry(*source).or_insert(None);
        }
        record.filter_mode = FilterMode::Exclude;
        record.group_expiry = Some(group_expiry);
        timers.reset(
            TimerKey::GroupExpiry(record.group),
            now,
            group_expiry.saturating_duration_since(now),
        );
    }

    /// EXCLUDE + {IS_EX, TO_EX}: keep only sources present in the incoming
    /// set; sources new to both X and Y get `new_source_expiry`.
    fn intersect_exclude(
        record: &mut GroupRecord,
        incoming: &BTreeSet<Ipv4Addr>,
        now: Instant,
        new_source_expiry: Instant,
        new_source_duration: Duration,
        timers: &mut TimerSet,
    ) {
        let current: BTreeSet<Ipv4Addr> = record.sources.keys().copied().collect();
        for source in current.difference(incoming) {
            record.sources.remove(source);
            timers.cancel(&TimerKey::SourceExpiry(record.group, *source));
        }
        for source in incoming {
            if !record.sources.contains_key(source) {
                record.sources.insert(*source, Some(new_source_expiry));
                timers.reset(
                    TimerKey::SourceExpiry(record.group, *source),
                    now,
                    new_source_duration,
                );
            }
        }
    }

    /// A report vouched for these sources: drop them from any pending
    /// source-specific query sequence.
    fn unpend_sources(
        record: &mut GroupRecord,
        refreshed: &BTreeSet<Ipv4Addr>,
        timers: &mut TimerSet,
    ) {
        if let Some(pending) = &mut record.pending {
            if let Some(sources) = &mut pending.sources {
                sources.retain(|source| !refreshed.contains(source));
                if sources.is_empty() {
                    record.pending = None;
                    timers.cancel(&TimerKey::LastMemberQuery(record.group));
                }
            }
        }
    }

    fn start_group_query(
        record: &mut GroupRecord,
        now: Instant,
        timing: &MembershipTiming,
        timers: &mut TimerSet,
        queries: &mut Vec<TriggeredQuery>,
    ) {
        let lmqt = timing.last_member_query_time();
        record.group_expiry = Some(now + lmqt);
        timers.reset(TimerKey::GroupExpiry(record.group), now, lmqt);
        record.pending = Some(PendingQuery {
            sources: None,
            retransmits_left: timing.last_member_query_count.saturating_sub(1),
        });
        timers.reset(
            TimerKey::LastMemberQuery(record.group),
            now,
            timing.last_member_query_interval,
        );
        queries.push(TriggeredQuery {
            group: record.group,
            sources: None,
        });
    }

    fn start_source_query(
        record: &mut GroupRecord,
        sources: BTreeSet<Ipv4Addr>,
        now: Instant,
        timing: &MembershipTiming,
        timers: &mut TimerSet,
        queries: &mut Vec<TriggeredQuery>,
    ) {
        let lmqt = timing.last_member_query_time();
        for source in &sources {
            if let Some(expiry) = record.sources.get_mut(source) {
                if expiry.is_some() {
                    *expiry = Some(now + lmqt);
                    timers.reset(TimerKey::SourceExpiry(record.group, *source), now, lmqt);
                }
            }
        }
        // A whole-group sequence already covers every source
        match &mut record.pending {
            Some(PendingQuery { sources: None, .. }) => return,
            Some(PendingQuery {
                sources: Some(existing),
                retransmits_left,
            }) => {
                existing.extend(sources.iter().copied());
                *retransmits_left = timing.last_member_query_count.saturating_sub(1);
            }
            None => {
                record.pending = Some(PendingQuery {
                    sources: Some(sources.clone()),
                    retransmits_left: timing.last_member_query_count.saturating_sub(1),
                });
            }
        }
        timers.reset(
            TimerKey::LastMemberQuery(record.group),
            now,
            timing.last_member_query_interval,
        );
        queries.push(TriggeredQuery {
            group: record.group,
            sources: Some(sources),
        });
    }

    /// Process a Leave Group message. Returns the first group-specific
    /// query to send, or `None` when the group is unknown. Callers must
    /// only invoke this while Role = Querier.
    pub fn on_leave(
        &mut self,
        group: Ipv4Addr,
        now: Instant,
        timing: &MembershipTiming,
        timers: &mut TimerSet,
    ) -> Option<TriggeredQuery> {
        let record = self.groups.get_mut(&group)?;
        let mut queries = Vec::new();
        Self::start_group_query(record, now, timing, timers, &mut queries);
        queries.pop()
    }

    /// A group timer fired. In EXCLUDE mode the record either dies or
    /// degenerates to INCLUDE over its still-live requested sources.
    pub fn on_group_expiry(
        &mut self,
        group: Ipv4Addr,
        now: Instant,
        timers: &mut TimerSet,
    ) -> GroupExpiryOutcome {
        let Some(record) = self.groups.get_mut(&group) else {
            return GroupExpiryOutcome::Stale;
        };
        if record.filter_mode != FilterMode::Exclude {
            return GroupExpiryOutcome::Stale;
        }
        match record.group_expiry {
            Some(when) if when <= now => {}
            _ => return GroupExpiryOutcome::Stale,
        }

        let live = record.live_sources(now);
        if live.is_empty() {
            self.remove(&group, timers);
            GroupExpiryOutcome::Removed
        } else {
            record.filter_mode = FilterMode::Include;
            record.group_expiry = None;
            record.sources.retain(|source, _| live.contains(source));
            GroupExpiryOutcome::SwitchedToInclude
        }
    }

    /// A per-source timer fired. Returns true when the whole record was
    /// removed (last INCLUDE source gone).
    pub fn on_source_expiry(
        &mut self,
        group: Ipv4Addr,
        source: Ipv4Addr,
        now: Instant,
        timers: &mut TimerSet,
    ) -> bool {
        let Some(record) = self.groups.get_mut(&group) else {
            return false;
        };
        match record.sources.get(&source) {
            Some(Some(when)) if *when <= now => {}
            _ => return false, // refreshed or already gone
        }
        match record.filter_mode {
            FilterMode::Include => {
                record.sources.remove(&source);
                if record.sources.is_empty() {
                    self.remove(&group, timers);
                    return true;
                }
            }
            FilterMode::Exclude => {
                // Requested source stops being vouched for; it joins the
                // excluded set rather than leaving the record
                record.sources.insert(source, None);
            }
        }
        false
    }

    /// A last-member query timer fired. Returns the next retransmission
    /// of the pending sequence, or `None` once the sequence is done.
    pub fn on_last_member_timer(
        &mut self,
        group: Ipv4Addr,
        now: Instant,
        timing: &MembershipTiming,
        timers: &mut TimerSet,
    ) -> Option<TriggeredQuery> {
        let record = self.groups.get_mut(&group)?;
        let pending = record.pending.as_mut()?;
        if pending.retransmits_left == 0 {
            record.pending = None;
            return None;
        }
        pending.retransmits_left -= 1;
        let query = TriggeredQuery {
            group,
            sources: pending.sources.clone(),
        };
        if pending.retransmits_left > 0 {
            timers.reset(
                TimerKey::LastMemberQuery(group),
                now,
                timing.last_member_query_interval,
            );
        } else {
            record.pending = None;
        }
        Some(query)
    }

    fn remove(&mut self, group: &Ipv4Addr, timers: &mut TimerSet) {
        if let Some(record) = self.groups.remove(group) {
            timers.cancel(&TimerKey::GroupExpiry(*group));
            timers.cancel(&TimerKey::LastMemberQuery(*group));
            for source in record.sources.keys() {
                timers.cancel(&TimerKey::SourceExpiry(*group, *source));
            }
        }
    }

    /// Read-only membership view for external consumers. EXCLUDE mode
    /// (incl. v1/v2 joins) reports `sources: None`, meaning all sources.
    pub fn snapshot(&self) -> Vec<GroupMembership> {
        let mut memberships: Vec<GroupMembership> = self
            .groups
            .values()
            .map(|record| GroupMembership {
                group: record.group,
                sources: match record.filter_mode {
                    FilterMode::Exclude => None,
                    FilterMode::Include => {
                        Some(record.sources.keys().copied().collect())
                    }
                },
                last_reporter: record.last_reporter,
            })
            .collect();
        memberships.sort_by_key(|m| m.group);
        memberships
    }

    /// Drop all state (interface shutdown).
    pub fn clear(&mut self, timers: &mut TimerSet) {
        let groups: Vec<Ipv4Addr> = self.groups.keys().copied().collect();
        for group in groups {
            self.remove(&group, timers);
        }
    }
}
