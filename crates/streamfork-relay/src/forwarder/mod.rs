//! Outbound forwarders.
//!
//! A [`Forwarder`] is the session-side handle for one downstream destination.
//! The connection itself lives on a spawned task that reports back to the
//! owning session through [`ForwarderEvent`]s; the session never shares the
//! handle and the task never holds more than the event sender.

mod reply;
mod task;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use streamfork_core::Endpoint;

use crate::error::ForwarderError;

pub use reply::{IDENTIFIER_LEN, Identifier, IdentifierCapture, ReplyHandler};

/// Which destination a forwarder feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Media,
    Storage,
}

impl Role {
    pub const ALL: [Self; 2] = [Self::Storage, Self::Media];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Media => "media",
            Self::Storage => "storage",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state as seen by the owning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Pending,
    Connected,
    Lost,
}

/// Notification from a forwarder task to its session.
#[derive(Debug)]
pub enum ForwarderEvent {
    Connected(Role),
    Identifier(Identifier),
    Lost { role: Role, error: ForwarderError },
}

pub type EventSender = mpsc::UnboundedSender<ForwarderEvent>;

/// Handle for one outbound destination.
pub struct Forwarder {
    role: Role,
    target: Endpoint,
    state: ConnectState,
    /// Write queue; `None` once finishing.
    writes: Option<mpsc::UnboundedSender<Bytes>>,
    /// Receiving end of the write queue until `connect` hands it to the task.
    queued: Option<mpsc::UnboundedReceiver<Bytes>>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    identifier: Option<Identifier>,
}

impl Forwarder {
    pub fn new(role: Role, target: Endpoint) -> Self {
        let (writes, queued) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            role,
            target,
            state: ConnectState::Pending,
            writes: Some(writes),
            queued: Some(queued),
            shutdown,
            task: None,
            identifier: None,
        }
    }

    /// Start the outbound connect on a new task.
    ///
    /// The task reports `Connected` or `Lost` through `events`. Calling this
    /// more than once, or after [`finish`](Self::finish), does nothing.
    pub fn connect(&mut self, timeout: Duration, events: EventSender) {
        if self.writes.is_none() {
            return;
        }
        let Some(queued) = self.queued.take() else {
            warn!(role = %self.role, "Forwarder connect requested twice");
            return;
        };
        let task = task::ForwarderTask {
            role: self.role,
            target: self.target.clone(),
            timeout,
            writes: queued,
            replies: ReplyHandler::for_role(self.role),
            events,
            shutdown: self.shutdown.subscribe(),
        };
        self.task = Some(tokio::spawn(task.run()));
    }

    /// Pending -> Connected. Returns whether the transition happened.
    pub fn mark_connected(&mut self) -> bool {
        if self.state == ConnectState::Pending {
            self.state = ConnectState::Connected;
            true
        } else {
            false
        }
    }

    /// Move to the terminal Lost state, returning the previous state.
    pub fn mark_lost(&mut self) -> ConnectState {
        std::mem::replace(&mut self.state, ConnectState::Lost)
    }

    /// Queue bytes for the destination. Fire-and-forget: a dead connection
    /// surfaces as a `Lost` event, not here.
    pub fn send(&self, bytes: Bytes) {
        if self.state != ConnectState::Connected {
            warn!(role = %self.role, "Dropping write to unconnected forwarder");
            return;
        }
        if let Some(writes) = &self.writes {
            let _ = writes.send(bytes);
        }
    }

    /// Write out everything queued, then close. A pending connect keeps
    /// going and delivers the queue if it succeeds within its timeout.
    /// Idempotent.
    pub fn finish(&mut self) {
        self.writes.take();
    }

    /// Queue `pending` regardless of connect state, then [`finish`](Self::finish).
    pub fn finish_with(&mut self, pending: Option<Bytes>) {
        if let (Some(bytes), Some(writes)) = (pending, &self.writes) {
            let _ = writes.send(bytes);
        }
        self.finish();
    }

    /// Close right away: a pending connect is abandoned and a live
    /// connection is dropped without writing what is still queued.
    pub fn abort(&mut self) {
        self.writes.take();
        self.shutdown.send_replace(true);
    }

    /// Wait for the connection task to end. Cancel-safe: if the wait is
    /// dropped, a later call waits for the same task.
    pub async fn closed(&mut self) {
        if let Some(task) = self.task.as_mut() {
            let joined = task.await;
            self.task = None;
            if let Err(e) = joined {
                warn!(role = %self.role, error = %e, "Forwarder task failed");
            }
        }
    }

    pub const fn is_finishing(&self) -> bool {
        self.writes.is_none()
    }

    pub fn is_aborted(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Finishing and no connection task left running.
    pub fn is_closed(&self) -> bool {
        self.is_finishing() && self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Record the storage identifier. Only the first call has an effect.
    pub fn set_identifier(&mut self, identifier: Identifier) -> bool {
        if self.identifier.is_some() {
            return false;
        }
        self.identifier = Some(identifier);
        true
    }

    pub const fn role(&self) -> Role {
        self.role
    }

    pub const fn target(&self) -> &Endpoint {
        &self.target
    }

    pub const fn state(&self) -> ConnectState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectState::Connected
    }

    pub const fn identifier(&self) -> Option<&Identifier> {
        self.identifier.as_ref()
    }

    /// Take the write queue without connecting, so tests can observe what
    /// the session sends.
    #[cfg(test)]
    pub(crate) fn take_write_queue(&mut self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.queued.take()
    }
}

impl fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forwarder")
            .field("role", &self.role)
            .field("target", &self.target)
            .field("state", &self.state)
            .field("finishing", &self.is_finishing())
            .field("aborted", &self.is_aborted())
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    async fn local_listener() -> (TcpListener, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, Endpoint::new(addr.ip().to_string(), addr.port()))
    }

    #[test]
    fn state_transitions() {
        let mut fwd = Forwarder::new(Role::Media, Endpoint::new("127.0.0.1", 1));
        assert_eq!(fwd.state(), ConnectState::Pending);
        assert!(fwd.mark_connected());
        assert!(!fwd.mark_connected());
        assert_eq!(fwd.mark_lost(), ConnectState::Connected);
        assert_eq!(fwd.mark_lost(), ConnectState::Lost);
        assert!(!fwd.mark_connected());
    }

    #[test]
    fn finish_is_idempotent_without_task() {
        let mut fwd = Forwarder::new(Role::Storage, Endpoint::new("127.0.0.1", 1));
        let mut queue = fwd.take_write_queue().unwrap();
        fwd.finish();
        fwd.finish();
        assert!(fwd.is_closed());
        assert!(queue.try_recv().is_err());
    }

    #[test]
    fn identifier_is_set_once() {
        let mut fwd = Forwarder::new(Role::Storage, Endpoint::new("127.0.0.1", 1));
        assert!(fwd.set_identifier(Identifier::from([b'A'; IDENTIFIER_LEN])));
        assert!(!fwd.set_identifier(Identifier::from([b'B'; IDENTIFIER_LEN])));
        assert_eq!(fwd.identifier().unwrap().as_bytes(), &[b'A'; IDENTIFIER_LEN]);
    }

    #[tokio::test]
    async fn writes_queued_bytes_then_closes_on_finish() {
        let (listener, target) = local_listener().await;
        let (tx, mut events) = mpsc::unbounded_channel();

        let mut fwd = Forwarder::new(Role::Media, target);
        fwd.connect(Duration::from_secs(7), tx);

        let (mut dest, _) = listener.accept().await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(ForwarderEvent::Connected(Role::Media))
        ));
        assert!(fwd.mark_connected());

        fwd.send(Bytes::from_static(b"hello "));
        fwd.send(Bytes::from_static(b"world"));
        fwd.finish();

        let mut received = Vec::new();
        dest.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello world");

        fwd.closed().await;
        assert!(fwd.is_closed());
    }

    #[tokio::test]
    async fn finish_delivers_bytes_queued_before_connect() {
        let (listener, target) = local_listener().await;
        let (tx, mut events) = mpsc::unbounded_channel();

        let mut fwd = Forwarder::new(Role::Storage, target);
        fwd.connect(Duration::from_secs(7), tx);
        fwd.finish_with(Some(Bytes::from_static(b"early bytes")));
        assert!(fwd.is_finishing());
        assert!(!fwd.is_aborted());

        let (mut dest, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        dest.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"early bytes");

        fwd.closed().await;
        assert!(matches!(
            events.recv().await,
            Some(ForwarderEvent::Connected(Role::Storage))
        ));
    }

    #[tokio::test]
    async fn abort_cuts_off_stalled_destination() {
        let (listener, target) = local_listener().await;
        let (tx, mut events) = mpsc::unbounded_channel();

        let mut fwd = Forwarder::new(Role::Storage, target);
        fwd.connect(Duration::from_secs(7), tx);
        // Accepted but never read, so writes back up once the socket
        // buffers are full.
        let (_dest, _) = listener.accept().await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(ForwarderEvent::Connected(Role::Storage))
        ));
        assert!(fwd.mark_connected());

        for _ in 0..32 {
            fwd.send(Bytes::from(vec![0u8; 1 << 20]));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!fwd.is_closed());

        fwd.abort();
        tokio::time::timeout(Duration::from_secs(5), fwd.closed())
            .await
            .unwrap();
        assert!(fwd.is_closed());
    }

    #[tokio::test]
    async fn connect_after_abort_does_nothing() {
        let (_listener, target) = local_listener().await;
        let (tx, _events) = mpsc::unbounded_channel();
        let mut fwd = Forwarder::new(Role::Media, target);
        fwd.abort();
        fwd.connect(Duration::from_secs(7), tx);
        assert!(fwd.is_aborted());
        assert!(fwd.is_closed());
    }

    #[tokio::test]
    async fn refused_connect_reports_lost() {
        let (listener, target) = local_listener().await;
        drop(listener);
        let (tx, mut events) = mpsc::unbounded_channel();

        let mut fwd = Forwarder::new(Role::Storage, target);
        fwd.connect(Duration::from_secs(7), tx);

        match events.recv().await {
            Some(ForwarderEvent::Lost { role, error }) => {
                assert_eq!(role, Role::Storage);
                assert!(error.is_connect_failure());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        fwd.closed().await;
    }

    #[tokio::test]
    async fn peer_close_reports_lost_after_connect() {
        let (listener, target) = local_listener().await;
        let (tx, mut events) = mpsc::unbounded_channel();

        let mut fwd = Forwarder::new(Role::Media, target);
        fwd.connect(Duration::from_secs(7), tx);

        let (dest, _) = listener.accept().await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(ForwarderEvent::Connected(Role::Media))
        ));
        drop(dest);

        match events.recv().await {
            Some(ForwarderEvent::Lost { role, error }) => {
                assert_eq!(role, Role::Media);
                assert!(!error.is_connect_failure());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn storage_reports_identifier_from_first_bytes() {
        let (listener, target) = local_listener().await;
        let (tx, mut events) = mpsc::unbounded_channel();

        let mut fwd = Forwarder::new(Role::Storage, target);
        fwd.connect(Duration::from_secs(7), tx);

        let (mut dest, _) = listener.accept().await.unwrap();
        dest.write_all(&[b'A'; 20]).await.unwrap();
        dest.write_all(&[b'A'; 16]).await.unwrap();
        dest.write_all(b"ignored").await.unwrap();

        assert!(matches!(
            events.recv().await,
            Some(ForwarderEvent::Connected(Role::Storage))
        ));
        match events.recv().await {
            Some(ForwarderEvent::Identifier(id)) => {
                assert_eq!(id.as_bytes(), &[b'A'; IDENTIFIER_LEN]);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        fwd.finish();
        fwd.closed().await;
        assert!(events.try_recv().is_err());
    }
}
