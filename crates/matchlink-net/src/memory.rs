//! In-process transport for tests and embedding.
//!
//! [`MemoryTransport`] implements [`Transport`] without any socket. Every sent
//! frame is forwarded to a channel the owner drains with
//! [`MemoryTransport::take_sent`], inbound payloads are injected with
//! [`MemoryTransport::inject`], and connect failures or involuntary drops can
//! be scripted.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc};

use crate::messages::RoutingConfig;
use crate::transport::{
    ConnectOptions, ConnectionState, ConnectionStateWatch, EVENT_CHANNEL_CAPACITY, Transport,
    TransportError, TransportEvent,
};

/// Sentinel for "fail every connect".
const FAIL_FOREVER: u32 = u32::MAX;

/// A frame handed to [`Transport::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    /// Envelope bytes.
    pub body: Vec<u8>,
    /// Routing hints passed with the frame.
    pub routing: Option<RoutingConfig>,
}

/// Scriptable in-memory [`Transport`].
pub struct MemoryTransport {
    state: ConnectionStateWatch,
    events: broadcast::Sender<TransportEvent>,
    sent_tx: mpsc::UnboundedSender<SentFrame>,
    sent_rx: Mutex<Option<mpsc::UnboundedReceiver<SentFrame>>>,
    connect_attempts: AtomicU32,
    failures_remaining: AtomicU32,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Create a stopped transport whose connects succeed.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        Self {
            state: ConnectionStateWatch::new(),
            events,
            sent_tx,
            sent_rx: Mutex::new(Some(sent_rx)),
            connect_attempts: AtomicU32::new(0),
            failures_remaining: AtomicU32::new(0),
        }
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Make every future connect attempt fail.
    pub fn fail_all_connects(&self) {
        self.failures_remaining.store(FAIL_FOREVER, Ordering::SeqCst);
    }

    /// Let connect attempts succeed again.
    pub fn allow_connects(&self) {
        self.failures_remaining.store(0, Ordering::SeqCst);
    }

    /// Number of connect attempts so far.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Take the receiving end of the sent-frame channel. Returns `None` after
    /// the first call.
    pub fn take_sent(&self) -> Option<mpsc::UnboundedReceiver<SentFrame>> {
        self.sent_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Deliver a raw inbound payload as if the peer had sent it.
    pub fn inject(&self, payload: Vec<u8>) {
        let _ = self.events.send(TransportEvent::Payload(payload));
    }

    /// Drop the connection as if the peer went away.
    pub fn drop_connection(&self) {
        if self.state.current() == ConnectionState::Running {
            self.state.set(ConnectionState::Stopped);
            let _ = self.events.send(TransportEvent::Closed { intentional: false });
        }
    }

    fn take_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                FAIL_FOREVER => Some(FAIL_FOREVER),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

impl Transport for MemoryTransport {
    fn state(&self) -> ConnectionState {
        self.state.current()
    }

    fn connect(
        &self,
        options: &ConnectOptions,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let address = options.address.clone();
        async move {
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            self.state.set(ConnectionState::Connecting);
            tokio::task::yield_now().await;

            if self.take_failure() {
                self.state.set(ConnectionState::Stopped);
                return Err(TransportError::Refused(address));
            }
            self.state.set(ConnectionState::Running);
            Ok(())
        }
    }

    fn send(&self, body: Vec<u8>, routing: Option<RoutingConfig>) -> Result<(), TransportError> {
        if self.state() != ConnectionState::Running {
            return Err(TransportError::NotRunning);
        }
        let _ = self.sent_tx.send(SentFrame { body, routing });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn close(&self) {
        if self.state.current() != ConnectionState::Stopped {
            self.state.set(ConnectionState::Stopped);
            let _ = self.events.send(TransportEvent::Closed { intentional: true });
        }
    }
}
