//! The byte-oriented transport the matchmaking client rides on.
//!
//! A [`Transport`] owns one persistent connection to the matchmaking gateway.
//! It exposes a coarse [`ConnectionState`], an async connect, a synchronous
//! ordered send, and a broadcast stream of [`TransportEvent`]s carrying raw
//! inbound payloads and close notifications.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use crate::framing::FrameError;
use crate::messages::RoutingConfig;

/// Capacity of the inbound event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Coarse connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no connect in progress.
    Stopped,
    /// A connect attempt is in progress.
    Connecting,
    /// Connected, ready for communication.
    Running,
}

/// Observable connection state backed by a [`watch`] channel.
///
/// Multiple subscribers can observe state transitions without polling.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Stopped`].
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Stopped);
        Self { tx }
    }

    /// Set the current connection state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        self.tx.send_replace(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Gateway address, `host:port`.
    pub address: String,
    /// Upper bound on a single connect attempt. Default: 5 s.
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7801".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Something that happened on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A raw inbound payload (one envelope).
    Payload(Vec<u8>),
    /// The connection closed. `intentional` is true when the owner asked for it.
    Closed {
        /// Whether [`Transport::close`] caused the close.
        intentional: bool,
    },
}

/// Errors surfaced by transports.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport is not in [`ConnectionState::Running`].
    #[error("transport is not running")]
    NotRunning,

    /// The connect attempt did not finish in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The peer refused the connection.
    #[error("connection refused: {0}")]
    Refused(String),

    /// Framing failed while sending.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A persistent, reconnectable byte transport.
///
/// Implementations must deliver frames to the peer in the order [`send`] was
/// called and must not emit [`TransportEvent::Closed`] for a failed connect.
///
/// [`send`]: Transport::send
pub trait Transport: Send + Sync + 'static {
    /// Current coarse state.
    fn state(&self) -> ConnectionState;

    /// Establish the connection.
    fn connect(
        &self,
        options: &ConnectOptions,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Queue one frame for delivery. Fails with [`TransportError::NotRunning`]
    /// unless the transport is running.
    fn send(&self, body: Vec<u8>, routing: Option<RoutingConfig>) -> Result<(), TransportError>;

    /// Subscribe to inbound payloads and close notifications.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Close the connection on purpose.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_starts_stopped() {
        let watch = ConnectionStateWatch::new();
        assert_eq!(watch.current(), ConnectionState::Stopped);
    }

    #[test]
    fn test_state_transitions() {
        let watch = ConnectionStateWatch::new();
        watch.set(ConnectionState::Connecting);
        assert_eq!(watch.current(), ConnectionState::Connecting);
        watch.set(ConnectionState::Running);
        assert_eq!(watch.current(), ConnectionState::Running);
        watch.set(ConnectionState::Stopped);
        assert_eq!(watch.current(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_subscriber_sees_change() {
        let watch = ConnectionStateWatch::new();
        let mut rx = watch.subscribe();
        watch.set(ConnectionState::Running);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Running);
    }
}
