//! Per-connection relay session.
//!
//! A [`Session`] owns the inbound client connection, one [`Forwarder`] per
//! destination and the backlog of bytes each destination has not received
//! yet. Every inbound chunk goes to both destinations in arrival order:
//! - destination connected: flush its backlog, then forward the chunk
//! - destination still connecting: append the chunk to its backlog
//!
//! A client that closes normally gets a graceful teardown: each destination
//! is handed what it has not received yet and closes once that is written.
//! A failing destination aborts the session and every connection is cut.

mod backlog;
mod driver;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use streamfork_core::Config;

use crate::error::ForwarderError;
use crate::forwarder::{ConnectState, EventSender, Forwarder, ForwarderEvent, Identifier, Role};

pub use backlog::{Backlog, BacklogOverflow};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the first destination to connect.
    Connecting,
    /// At least one destination connected.
    Active,
    /// Teardown requested; forwarders are draining.
    Closing,
    /// Every connection released.
    Closed,
}

/// One destination as seen by the session.
#[derive(Debug)]
struct Leg {
    forwarder: Forwarder,
    backlog: Backlog,
}

impl Leg {
    fn flush(&mut self) {
        if let Some(pending) = self.backlog.take() {
            debug!(role = %self.forwarder.role(), bytes = pending.len(), "Flushing backlog");
            self.forwarder.send(pending);
        }
    }

    /// Hand the backlog over and let the forwarder close after writing it.
    fn finish(&mut self) {
        let pending = self.backlog.take();
        if let Some(pending) = &pending {
            debug!(role = %self.forwarder.role(), bytes = pending.len(), "Handing backlog to closing forwarder");
        }
        self.forwarder.finish_with(pending);
    }

    fn abort(&mut self) {
        if let Some(dropped) = self.backlog.take() {
            debug!(role = %self.forwarder.role(), bytes = dropped.len(), "Discarding backlog");
        }
        self.forwarder.abort();
    }
}

pub struct Session {
    id: Uuid,
    peer: SocketAddr,
    state: SessionState,
    bytes_received: u64,
    storage: Leg,
    media: Leg,
    stats_timer: Option<Interval>,
    stats_interval: Duration,
    connect_timeout: Duration,
    drain_timeout: Duration,
    events_tx: EventSender,
    events_rx: Option<mpsc::UnboundedReceiver<ForwarderEvent>>,
    inbound_close_requested: bool,
}

impl Session {
    pub fn new(config: &Config, peer: SocketAddr) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id: Uuid::new_v4(),
            peer,
            state: SessionState::Connecting,
            bytes_received: 0,
            storage: Leg {
                forwarder: Forwarder::new(Role::Storage, config.storage()),
                backlog: Backlog::new(config.max_buffer_bytes),
            },
            media: Leg {
                forwarder: Forwarder::new(Role::Media, config.media()),
                backlog: Backlog::new(config.max_buffer_bytes),
            },
            stats_timer: None,
            stats_interval: config.stats_interval(),
            connect_timeout: config.connect_timeout(),
            drain_timeout: config.drain_timeout(),
            events_tx,
            events_rx: Some(events_rx),
            inbound_close_requested: false,
        }
    }

    /// Start connecting both destinations.
    pub fn on_inbound_accepted(&mut self) {
        info!(peer = %self.peer, "Connection from {}", self.peer);
        self.state = SessionState::Connecting;
        for role in Role::ALL {
            let (timeout, events) = (self.connect_timeout, self.events_tx.clone());
            self.leg_mut(role).forwarder.connect(timeout, events);
        }
    }

    /// Fan one inbound chunk out to both destinations.
    pub fn on_inbound_data(&mut self, chunk: Bytes) {
        if self.is_finishing() {
            return;
        }
        self.bytes_received += chunk.len() as u64;

        for role in Role::ALL {
            let leg = self.leg_mut(role);
            if leg.forwarder.is_connected() {
                leg.flush();
                leg.forwarder.send(chunk.clone());
            } else if let Err(overflow) = leg.backlog.push(&chunk) {
                warn!(role = %role, limit = overflow.limit, "Backlog limit exceeded for {role} server");
                self.abort();
                return;
            }
        }

        if self.stats_timer.is_none() {
            self.stats_timer = Some(stats_timer(self.stats_interval));
        }
    }

    pub fn on_inbound_closed(&mut self) {
        debug!("Inbound connection closed");
        self.finish();
    }

    /// Mark a destination connected and flush what it missed.
    pub fn on_forwarder_connected(&mut self, role: Role) {
        if self.is_finishing() {
            return;
        }
        let leg = self.leg_mut(role);
        if !leg.forwarder.mark_connected() {
            return;
        }
        info!(role = %role, target = %leg.forwarder.target(), "Connected to {role} server");
        leg.flush();
        if self.state == SessionState::Connecting {
            self.state = SessionState::Active;
        }
    }

    /// A destination failed to connect or dropped; the session cannot
    /// continue without it.
    pub fn on_forwarder_lost(&mut self, role: Role, error: &ForwarderError) {
        let previous = self.leg_mut(role).forwarder.mark_lost();
        if self.is_finishing() {
            debug!(role = %role, error = %error, "Forwarder ended during teardown");
            return;
        }
        if previous == ConnectState::Lost {
            return;
        }
        if error.is_connect_failure() {
            warn!(role = %role, error = %error, "Could not connect to {role} server");
        } else {
            warn!(role = %role, error = %error, "Connection to {role} server was lost");
        }
        self.abort();
    }

    /// Record the identifier the storage server sent back.
    pub fn on_identifier(&mut self, identifier: Identifier) {
        if self.storage.forwarder.set_identifier(identifier) {
            info!(%identifier, "Got identifier {identifier}");
        }
    }

    pub fn handle_event(&mut self, event: ForwarderEvent) {
        match event {
            ForwarderEvent::Connected(role) => self.on_forwarder_connected(role),
            ForwarderEvent::Identifier(identifier) => self.on_identifier(identifier),
            ForwarderEvent::Lost { role, error } => self.on_forwarder_lost(role, &error),
        }
    }

    /// Tear the session down at once: pending connects are abandoned,
    /// live destinations are cut off and backlogs are discarded.
    pub fn abort(&mut self) {
        if !self.begin_teardown() {
            return;
        }
        warn!(peer = %self.peer, "Incoming connection dropped");
        self.storage.abort();
        self.media.abort();
    }

    /// Tear the session down gracefully. Each destination gets its backlog
    /// and closes after writing it; a pending connect may still complete
    /// within its timeout. Returns `false` if teardown already started.
    pub fn finish(&mut self) -> bool {
        if !self.begin_teardown() {
            return false;
        }
        self.storage.finish();
        self.media.finish();
        true
    }

    fn begin_teardown(&mut self) -> bool {
        if self.is_finishing() {
            return false;
        }
        self.state = SessionState::Closing;
        if self.stats_timer.take().is_some() {
            debug!("Stats timer cancelled");
        }
        self.inbound_close_requested = true;
        true
    }

    fn report_stats(&self) {
        info!(bytes = self.bytes_received, "Data received: {}", self.bytes_received);
    }

    fn leg_mut(&mut self, role: Role) -> &mut Leg {
        match role {
            Role::Storage => &mut self.storage,
            Role::Media => &mut self.media,
        }
    }

    const fn leg(&self, role: Role) -> &Leg {
        match role {
            Role::Storage => &self.storage,
            Role::Media => &self.media,
        }
    }

    pub const fn is_finishing(&self) -> bool {
        matches!(self.state, SessionState::Closing | SessionState::Closed)
    }

    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub const fn state(&self) -> SessionState {
        self.state
    }

    pub const fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub const fn forwarder(&self, role: Role) -> &Forwarder {
        &self.leg(role).forwarder
    }

    /// Bytes held for `role` because it has not connected yet.
    pub fn buffered(&self, role: Role) -> usize {
        self.leg(role).backlog.len()
    }

    pub const fn identifier(&self) -> Option<&Identifier> {
        self.storage.forwarder.identifier()
    }

    pub const fn has_stats_timer(&self) -> bool {
        self.stats_timer.is_some()
    }

    pub const fn inbound_close_requested(&self) -> bool {
        self.inbound_close_requested
    }
}

/// Repeating timer whose first tick is one period away.
fn stats_timer(period: Duration) -> Interval {
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
#[path = "session_tests.rs"]
mod tests;
