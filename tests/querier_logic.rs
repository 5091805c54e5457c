// Election and membership scenarios driven entirely through the public
// state machine API with a synthetic clock, so every assertion is about
// wall-clock-independent behavior.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use querierd::config::InterfaceConfig;
use querierd::packet::{Message, Query, RecordType, ReportRecord, ALL_HOSTS_GROUP};
use querierd::querier::{InterfaceState, Outbound, QuerierEvent, Role};
use querierd::timers::TimerSet;

const GROUP: Ipv4Addr = Ipv4Addr::new(239, 10, 0, 1);
const MEMBER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 40);

struct Sim {
    state: InterfaceState,
    timers: TimerSet,
    now: Instant,
    sent: Vec<Outbound>,
}

impl Sim {
    fn new(addr: Ipv4Addr) -> Self {
        let mut config = InterfaceConfig::named("eth0");
        config.query_version = 2;
        let mut sim = Sim {
            state: InterfaceState::new(config, addr),
            timers: TimerSet::new(),
            now: Instant::now(),
            sent: Vec::new(),
        };
        let out = sim.state.start(sim.now, &mut sim.timers);
        sim.sent.extend(out);
        sim
    }

    /// Advance the clock, firing due timers along the way.
    fn advance(&mut self, by: Duration) {
        let target = self.now + by;
        loop {
            let Some(deadline) = self.timers.next_deadline() else {
                break;
            };
            if deadline > target {
                break;
            }
            self.now = deadline;
            for key in self.timers.pop_expired(self.now) {
                if let Ok(out) =
                    self.state
                        .handle_event(QuerierEvent::TimerFired(key), self.now, &mut self.timers)
                {
                    self.sent.extend(out);
                }
            }
        }
        self.now = target;
    }

    fn deliver(&mut self, src: Ipv4Addr, message: Message) {
        let out = self
            .state
            .handle_event(
                QuerierEvent::PacketReceived { src, message },
                self.now,
                &mut self.timers,
            )
            .expect("packet events never fail");
        self.sent.extend(out);
    }

    fn drain_sent(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.sent)
    }
}

fn general_query() -> Message {
    Message::Query(Query::general_v2(100))
}

#[test]
fn two_queriers_converge_on_lowest_address() {
    let low_addr = Ipv4Addr::new(10, 0, 0, 1);
    let high_addr = Ipv4Addr::new(10, 0, 0, 2);
    let mut low = Sim::new(low_addr);
    let mut high = Sim::new(high_addr);

    // Both start as querier and announce themselves
    assert_eq!(low.state.role(), Role::Querier);
    assert_eq!(high.state.role(), Role::Querier);

    // Deliver each side's startup query to the other
    low.deliver(high_addr, general_query());
    high.deliver(low_addr, general_query());

    // Exactly one querier remains, and it is the lower address
    assert_eq!(low.state.role(), Role::Querier);
    assert_eq!(high.state.role(), Role::NonQuerier);
    assert_eq!(high.state.other_querier(), Some(low_addr));

    // The loser stays silent from here on
    high.drain_sent();
    high.advance(Duration::from_secs(250));
    assert!(high.drain_sent().is_empty());
}

#[test]
fn five_queriers_converge_on_lowest_address() {
    let addrs: Vec<Ipv4Addr> = (1..=5).map(|i| Ipv4Addr::new(10, 0, 0, i)).collect();
    let mut sims: Vec<Sim> = addrs.iter().map(|addr| Sim::new(*addr)).collect();

    // Everyone hears everyone else's general queries as they are sent
    for _ in 0..30 {
        for sim in sims.iter_mut() {
            sim.advance(Duration::from_secs(10));
        }
        let mut heard: Vec<(Ipv4Addr, Vec<Outbound>)> = Vec::new();
        for (sim, addr) in sims.iter_mut().zip(&addrs) {
            heard.push((*addr, sim.drain_sent()));
        }
        for (src, batch) in heard {
            for out in batch {
                if !matches!(&out.message, Message::Query(q) if q.is_general()) {
                    continue;
                }
                for (sim, addr) in sims.iter_mut().zip(&addrs) {
                    if *addr != src {
                        sim.deliver(src, out.message.clone());
                    }
                }
            }
        }
    }

    assert_eq!(sims[0].state.role(), Role::Querier);
    for sim in &sims[1..] {
        assert_eq!(sim.state.role(), Role::NonQuerier);
        assert_eq!(sim.state.other_querier(), Some(addrs[0]));
    }
}

#[test]
fn non_querier_takes_over_when_querier_goes_silent() {
    let mut sim = Sim::new(Ipv4Addr::new(10, 0, 0, 2));
    sim.deliver(Ipv4Addr::new(10, 0, 0, 1), general_query());
    assert_eq!(sim.state.role(), Role::NonQuerier);
    sim.drain_sent();

    // Other Querier Present Interval: 2*125 + 10/2 = 255s of silence
    sim.advance(Duration::from_secs(254));
    assert_eq!(sim.state.role(), Role::NonQuerier);
    sim.advance(Duration::from_secs(2));
    assert_eq!(sim.state.role(), Role::Querier);

    // Takeover announced with a General Query
    let sent = sim.drain_sent();
    assert!(sent
        .iter()
        .any(|o| o.dst == ALL_HOSTS_GROUP && matches!(&o.message, Message::Query(q) if q.is_general())));
}

#[test]
fn rival_query_keeps_resetting_presence_timer() {
    let mut sim = Sim::new(Ipv4Addr::new(10, 0, 0, 2));
    let rival = Ipv4Addr::new(10, 0, 0, 1);

    for _ in 0..5 {
        sim.deliver(rival, general_query());
        sim.advance(Duration::from_secs(125));
        assert_eq!(sim.state.role(), Role::NonQuerier);
    }
}

#[test]
fn membership_expires_after_group_membership_interval() {
    let mut sim = Sim::new(Ipv4Addr::new(10, 0, 0, 1));
    sim.advance(Duration::from_secs(5));
    sim.deliver(MEMBER, Message::ReportV2 { group: GROUP });
    assert_eq!(sim.state.groups().len(), 1);

    // Just short of GMI (260s): still a member
    sim.advance(Duration::from_secs(259));
    assert_eq!(sim.state.groups().len(), 1);

    sim.advance(Duration::from_secs(2));
    assert!(sim.state.groups().is_empty());
}

#[test]
fn repeated_reports_keep_membership_alive() {
    let mut sim = Sim::new(Ipv4Addr::new(10, 0, 0, 1));
    sim.deliver(MEMBER, Message::ReportV2 { group: GROUP });

    for _ in 0..4 {
        sim.advance(Duration::from_secs(200));
        sim.deliver(MEMBER, Message::ReportV2 { group: GROUP });
    }
    assert_eq!(sim.state.groups().len(), 1);
}

#[test]
fn unanswered_leave_deletes_group_within_lmqt() {
    let mut sim = Sim::new(Ipv4Addr::new(10, 0, 0, 1));
    sim.deliver(MEMBER, Message::ReportV2 { group: GROUP });
    sim.advance(Duration::from_secs(10));
    sim.drain_sent();

    sim.deliver(MEMBER, Message::Leave { group: GROUP });

    // First group-specific query immediately
    let sent = sim.drain_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].dst, GROUP);

    // Retransmission one last-member interval later
    sim.advance(Duration::from_secs(1));
    let sent = sim.drain_sent();
    assert_eq!(sent.len(), 1);

    // Gone by leave + 2s (interval x count)
    sim.advance(Duration::from_secs(1));
    assert!(sim.state.groups().is_empty());
}

#[test]
fn answered_leave_keeps_group() {
    let mut sim = Sim::new(Ipv4Addr::new(10, 0, 0, 1));
    sim.deliver(MEMBER, Message::ReportV2 { group: GROUP });
    sim.deliver(MEMBER, Message::Leave { group: GROUP });

    // Another member answers the group-specific query in time
    sim.advance(Duration::from_millis(500));
    sim.deliver(Ipv4Addr::new(192, 168, 1, 41), Message::ReportV2 { group: GROUP });

    sim.advance(Duration::from_secs(10));
    assert_eq!(sim.state.groups().len(), 1);

    // And membership now runs a full interval from the answering report
    sim.advance(Duration::from_secs(248));
    assert_eq!(sim.state.groups().len(), 1);
    sim.advance(Duration::from_secs(3));
    assert!(sim.state.groups().is_empty());
}

#[test]
fn leave_is_ignored_while_non_querier() {
    let mut sim = Sim::new(Ipv4Addr::new(10, 0, 0, 2));
    sim.deliver(MEMBER, Message::ReportV2 { group: GROUP });
    sim.deliver(Ipv4Addr::new(10, 0, 0, 1), general_query());
    sim.drain_sent();

    sim.deliver(MEMBER, Message::Leave { group: GROUP });
    assert!(sim.drain_sent().is_empty());

    // The group still ages out on the normal schedule
    sim.advance(Duration::from_secs(261));
    assert!(sim.state.groups().is_empty());
}

#[test]
fn v3_source_memberships_tracked_through_state_machine() {
    let mut sim = Sim::new(Ipv4Addr::new(10, 0, 0, 1));
    let source = Ipv4Addr::new(10, 1, 0, 1);
    sim.deliver(
        MEMBER,
        Message::ReportV3 {
            records: vec![ReportRecord {
                record_type: RecordType::ModeIsInclude,
                group: GROUP,
                sources: vec![source],
            }],
        },
    );

    let snapshot = sim.state.groups().snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].group, GROUP);
    let sources = snapshot[0].sources.as_ref().expect("INCLUDE lists sources");
    assert!(sources.contains(&source));

    // The lone source ages out and takes the group with it
    sim.advance(Duration::from_secs(261));
    assert!(sim.state.groups().is_empty());
}

#[test]
fn v3_block_triggers_source_specific_query() {
    let source = Ipv4Addr::new(10, 1, 0, 1);
    let mut config = InterfaceConfig::named("eth0");
    config.query_version = 3;
    let mut sim_v3 = Sim {
        state: InterfaceState::new(config, Ipv4Addr::new(10, 0, 0, 1)),
        timers: TimerSet::new(),
        now: Instant::now(),
        sent: Vec::new(),
    };
    sim_v3
        .sent
        .extend(sim_v3.state.start(sim_v3.now, &mut sim_v3.timers));
    sim_v3.drain_sent();

    sim_v3.deliver(
        MEMBER,
        Message::ReportV3 {
            records: vec![ReportRecord {
                record_type: RecordType::ModeIsInclude,
                group: GROUP,
                sources: vec![source],
            }],
        },
    );
    sim_v3.deliver(
        MEMBER,
        Message::ReportV3 {
            records: vec![ReportRecord {
                record_type: RecordType::BlockOldSources,
                group: GROUP,
                sources: vec![source],
            }],
        },
    );

    let sent = sim_v3.drain_sent();
    assert_eq!(sent.len(), 1);
    let Message::Query(q) = &sent[0].message else {
        panic!("expected a query, got {:?}", sent[0].message);
    };
    assert_eq!(q.group, GROUP);
    assert_eq!(q.sources, vec![source]);
}

#[test]
fn event_sequences_are_deterministic() {
    let run = || {
        let mut sim = Sim::new(Ipv4Addr::new(10, 0, 0, 1));
        sim.deliver(MEMBER, Message::ReportV2 { group: GROUP });
        sim.advance(Duration::from_secs(40));
        sim.deliver(MEMBER, Message::Leave { group: GROUP });
        sim.advance(Duration::from_secs(300));
        sim.drain_sent()
            .into_iter()
            .map(|o| (o.dst, o.message.encode()))
            .collect::<Vec<_>>()
    };

    let first = run();
    let second = run();
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.0, b.0);
        assert_eq!(a.1, b.1);
    }
}

#[test]
fn demoted_querier_refreshes_presence_on_later_queries() {
    let mut sim = Sim::new(Ipv4Addr::new(10, 0, 0, 3));
    let first_rival = Ipv4Addr::new(10, 0, 0, 2);
    let better_rival = Ipv4Addr::new(10, 0, 0, 1);

    sim.deliver(first_rival, general_query());
    assert_eq!(sim.state.other_querier(), Some(first_rival));

    sim.advance(Duration::from_secs(100));
    sim.deliver(better_rival, general_query());
    assert_eq!(sim.state.other_querier(), Some(better_rival));
    assert_eq!(sim.state.role(), Role::NonQuerier);
}
