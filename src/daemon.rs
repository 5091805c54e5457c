// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Daemon loop: one async task per configured interface.
//!
//! Each `InterfaceRunner` owns its transport, its timer set, and its
//! state machine, and multiplexes three inputs with `tokio::select!`:
//! received packets, the earliest armed timer, and the shutdown signal.
//! All clock reads go through tokio's clock so tests can pause and
//! auto-advance time.
//!
//! Malformed packets are logged and dropped; they never disturb state.
//! Timer fires that the current role cannot accept are logged the same
//! way. Timer invariant violations (a double fire the generation check
//! caught) are logged at critical severity.

use std::net::Ipv4Addr;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::watch;

use crate::config::{Config, InterfaceConfig};
use crate::logging::{Facility, Logger};
use crate::packet::Message;
use crate::querier::{InterfaceState, Outbound, QuerierEvent, Role};
use crate::timers::TimerSet;
use crate::transport::{interface_ipv4_address, PacketTransport, RawIgmpTransport};
use crate::{log_critical, log_debug, log_error, log_info, log_notice, log_warning};

/// What woke the select loop up
enum Turn {
    Shutdown,
    Packet(Result<(Ipv4Addr, Vec<u8>)>),
    Tick,
}

pub struct InterfaceRunner<T: PacketTransport> {
    name: String,
    state: InterfaceState,
    timers: TimerSet,
    transport: T,
    logger: Logger,
    shutdown: watch::Receiver<bool>,
}

impl<T: PacketTransport> InterfaceRunner<T> {
    pub fn new(
        config: InterfaceConfig,
        our_addr: Ipv4Addr,
        transport: T,
        logger: Logger,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let name = config.name.clone();
        Self {
            name,
            state: InterfaceState::new(config, our_addr),
            timers: TimerSet::new(),
            transport,
            logger,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let now = tokio_now();
        log_notice!(
            self.logger,
            Facility::Querier,
            "starting querier on {} as {}",
            self.name,
            self.state.our_addr
        );
        let outbound = self.state.start(now, &mut self.timers);
        self.send_all(outbound).await?;

        loop {
            let next_deadline = self.timers.next_deadline();
            let turn = tokio::select! {
                changed = self.shutdown.changed() => {
                    match changed {
                        Ok(()) => Turn::Shutdown,
                        // Sender dropped: treat as shutdown
                        Err(_) => Turn::Shutdown,
                    }
                }
                received = self.transport.recv() => Turn::Packet(received),
                _ = wait_until(next_deadline) => Turn::Tick,
            };

            match turn {
                Turn::Shutdown => break,
                Turn::Packet(Ok((src, bytes))) => self.on_packet(src, &bytes).await?,
                Turn::Packet(Err(e)) => {
                    log_error!(
                        self.logger,
                        Facility::Transport,
                        "receive failed on {}: {:#}",
                        self.name,
                        e
                    );
                    return Err(e.context("interface receive loop failed"));
                }
                Turn::Tick => self.on_tick().await?,
            }
        }

        if let Ok(snapshot) = serde_json::to_string(&self.state.groups().snapshot()) {
            log_info!(
                self.logger,
                Facility::Membership,
                "stopping querier on {}, memberships: {}",
                self.name,
                snapshot
            );
        }
        Ok(())
    }

    async fn on_packet(&mut self, src: Ipv4Addr, bytes: &[u8]) -> Result<()> {
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                log_warning!(
                    self.logger,
                    Facility::Codec,
                    "dropping packet from {}: {}",
                    src,
                    e
                );
                return Ok(());
            }
        };
        log_debug!(
            self.logger,
            Facility::Querier,
            "received {:?} from {}",
            message,
            src
        );

        let role_before = self.state.role();
        let now = tokio_now();
        let event = QuerierEvent::PacketReceived { src, message };
        let outbound = match self.state.handle_event(event, now, &mut self.timers) {
            Ok(outbound) => outbound,
            Err(e) => {
                log_warning!(self.logger, Facility::Querier, "{}", e);
                Vec::new()
            }
        };
        self.log_role_change(role_before);
        self.send_all(outbound).await
    }

    async fn on_tick(&mut self) -> Result<()> {
        let now = tokio_now();
        let role_before = self.state.role();
        let mut outbound = Vec::new();
        for key in self.timers.pop_expired(now) {
            match self
                .state
                .handle_event(QuerierEvent::TimerFired(key), now, &mut self.timers)
            {
                Ok(mut messages) => outbound.append(&mut messages),
                Err(e) => {
                    log_warning!(self.logger, Facility::Timers, "{}", e);
                }
            }
        }
        for violation in self.timers.drain_violations() {
            log_critical!(
                self.logger,
                Facility::Timers,
                "timer invariant violated on {}: {}",
                self.name,
                violation
            );
        }
        self.log_role_change(role_before);
        self.send_all(outbound).await
    }

    fn log_role_change(&self, before: Role) {
        let after = self.state.role();
        if before == after {
            return;
        }
        match after {
            Role::NonQuerier => {
                if let Some(other) = self.state.other_querier() {
                    log_notice!(
                        self.logger,
                        Facility::Querier,
                        "{}: deferring to querier {}",
                        self.name,
                        other
                    );
                }
            }
            Role::Querier => {
                log_notice!(
                    self.logger,
                    Facility::Querier,
                    "{}: other querier timed out, taking over",
                    self.name
                );
            }
        }
    }

    async fn send_all(&mut self, outbound: Vec<Outbound>) -> Result<()> {
        for Outbound { dst, message } in outbound {
            log_debug!(
                self.logger,
                Facility::Querier,
                "sending {:?} to {}",
                message,
                dst
            );
            let bytes = message.encode();
            self.transport.send(dst, &bytes).await?;
        }
        Ok(())
    }
}

/// Read the clock through tokio so paused-time tests drive it.
fn tokio_now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending().await,
    }
}

/// Run querier tasks for every configured interface until a shutdown
/// signal arrives.
pub async fn run(config: Config, logger: Logger) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();
    for interface in config.interfaces {
        let name = interface.name.clone();
        let our_addr = interface_ipv4_address(&name)
            .with_context(|| format!("cannot serve interface {name}"))?;
        let transport = RawIgmpTransport::open(&name, our_addr, interface.ttl)
            .with_context(|| format!("cannot open sockets on {name}"))?;
        let runner = InterfaceRunner::new(
            interface,
            our_addr,
            transport,
            logger.for_interface(&name),
            shutdown_rx.clone(),
        );
        tasks.push((name, tokio::spawn(runner.run())));
    }
    drop(shutdown_rx);

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    log_notice!(logger, Facility::Daemon, "shutdown requested");
    let _ = shutdown_tx.send(true);

    let mut failed = false;
    for (name, task) in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log_error!(logger, Facility::Daemon, "interface {} failed: {:#}", name, e);
                failed = true;
            }
            Err(e) => {
                log_error!(logger, Facility::Daemon, "interface {} panicked: {}", name, e);
                failed = true;
            }
        }
    }
    if failed {
        return Err(anyhow::anyhow!("one or more interface tasks failed"));
    }
    Ok(())
}
