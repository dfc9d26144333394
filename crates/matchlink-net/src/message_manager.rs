//! Typed request sending and inbound dispatch over a [`Transport`].
//!
//! [`MessageManager`] wraps outgoing [`Message`]s in an [`Envelope`] with a
//! fresh request id and decodes inbound envelopes back into typed messages,
//! raising each one to the registered [`InboundHandler`]s as an [`Inbound`].
//!
//! A payload that fails to decode for a known message type is raised with an
//! absent message. An envelope that fails to decode is fatal: the error is
//! logged, stored, reported to every handler, and the receive loop stops.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::messages::{
    Envelope, Message, MessageError, MsgType, RoutingConfig, decode_envelope, encode_envelope,
};
use crate::transport::{ConnectionState, Transport, TransportEvent};

/// Client-generated request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub i64);

impl RequestId {
    /// Returned by sends that did not reach the transport.
    pub const NOT_SENT: RequestId = RequestId(0);

    /// Whether this id belongs to a request that was actually issued.
    pub fn is_sent(self) -> bool {
        self != Self::NOT_SENT
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One decoded inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    /// Request id the peer echoed back.
    pub request_id: RequestId,
    /// Raw message-type id.
    pub msg_type_id: i32,
    /// Decoded payload. `None` for unknown types and undecodable payloads.
    pub message: Option<Message>,
}

impl Inbound {
    /// Known message type, if any.
    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_id(self.msg_type_id)
    }
}

/// Receives decoded envelopes from a [`MessageManager`].
///
/// Handlers run on the receive task and must not block.
pub trait InboundHandler: Send + Sync + 'static {
    /// Called for every decoded envelope.
    fn on_message(&self, inbound: &Inbound);

    /// Called once when the receive path fails on a malformed envelope.
    fn on_fatal(&self, _error: &Arc<MessageError>) {}
}

impl<F> InboundHandler for F
where
    F: Fn(&Inbound) + Send + Sync + 'static,
{
    fn on_message(&self, inbound: &Inbound) {
        self(inbound)
    }
}

/// Serializes requests onto a transport and dispatches what comes back.
pub struct MessageManager<T: Transport> {
    transport: Arc<T>,
    last_id: AtomicI64,
    handlers: RwLock<Vec<Arc<dyn InboundHandler>>>,
    fatal: OnceLock<Arc<MessageError>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> MessageManager<T> {
    /// Create a manager sending through `transport`. Call
    /// [`start_receiving`](Self::start_receiving) to dispatch inbound traffic.
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            last_id: AtomicI64::new(0),
            handlers: RwLock::new(Vec::new()),
            fatal: OnceLock::new(),
            receiver: Mutex::new(None),
        }
    }

    /// Register a handler for inbound messages.
    pub fn subscribe(&self, handler: Arc<dyn InboundHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Allocate the next request id. Ids start at 1 and are never reused.
    pub fn next_request_id(&self) -> RequestId {
        RequestId(self.last_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Send `message` under a fresh request id.
    ///
    /// Returns [`RequestId::NOT_SENT`] without allocating an id when the
    /// transport is not running.
    pub fn send(&self, message: &Message, routing: Option<RoutingConfig>) -> RequestId {
        if self.transport.state() != ConnectionState::Running {
            tracing::debug!("Dropping {:?}: transport not running", message.msg_type());
            return RequestId::NOT_SENT;
        }
        let id = self.next_request_id();
        self.send_with_id(id, message, routing)
    }

    /// Send `message` under an id obtained from
    /// [`next_request_id`](Self::next_request_id).
    ///
    /// Returns `id` on success and [`RequestId::NOT_SENT`] otherwise.
    pub fn send_with_id(
        &self,
        id: RequestId,
        message: &Message,
        routing: Option<RoutingConfig>,
    ) -> RequestId {
        if self.transport.state() != ConnectionState::Running {
            tracing::debug!(
                "Dropping {:?} {id}: transport not running",
                message.msg_type()
            );
            return RequestId::NOT_SENT;
        }

        let bytes = match Envelope::wrap(id.0, message).and_then(|env| encode_envelope(&env)) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Failed to encode {:?} {id}: {e}", message.msg_type());
                return RequestId::NOT_SENT;
            }
        };

        match self.transport.send(bytes, routing) {
            Ok(()) => {
                tracing::debug!("Sent {:?} {id}", message.msg_type());
                id
            }
            Err(e) => {
                tracing::warn!("Failed to send {:?} {id}: {e}", message.msg_type());
                RequestId::NOT_SENT
            }
        }
    }

    /// Decode one raw inbound payload and raise it to the handlers.
    ///
    /// A malformed envelope is recorded as the fatal error, reported through
    /// [`InboundHandler::on_fatal`], and returned.
    pub fn dispatch(&self, raw: &[u8]) -> Result<(), Arc<MessageError>> {
        let envelope = match decode_envelope(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!("Malformed envelope ({} bytes): {e}", raw.len());
                let error = Arc::clone(self.fatal.get_or_init(|| Arc::new(e)));
                for handler in self.handlers_snapshot() {
                    handler.on_fatal(&error);
                }
                return Err(error);
            }
        };

        let message = match MsgType::from_id(envelope.msg_type_id) {
            Some(msg_type) => match Message::decode_payload(msg_type, &envelope.payload) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::warn!(
                        "Undecodable {msg_type:?} payload for request #{}: {e}",
                        envelope.request_id
                    );
                    None
                }
            },
            None => {
                tracing::debug!(
                    "Unknown message type {} for request #{}",
                    envelope.msg_type_id,
                    envelope.request_id
                );
                None
            }
        };

        let inbound = Inbound {
            request_id: RequestId(envelope.request_id),
            msg_type_id: envelope.msg_type_id,
            message,
        };
        for handler in self.handlers_snapshot() {
            handler.on_message(&inbound);
        }
        Ok(())
    }

    /// The error that stopped the receive path, if any.
    pub fn fatal_error(&self) -> Option<Arc<MessageError>> {
        self.fatal.get().cloned()
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Spawn the receive loop. Calling it again replaces the previous loop.
    pub fn start_receiving(self: &Arc<Self>) {
        let events = self.transport.subscribe();
        let handle = tokio::spawn(receive_loop(Arc::downgrade(self), events));
        let previous = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn handlers_snapshot(&self) -> Vec<Arc<dyn InboundHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<T: Transport> Drop for MessageManager<T> {
    fn drop(&mut self) {
        let handle = self
            .receiver
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

async fn receive_loop<T: Transport>(
    manager: Weak<MessageManager<T>>,
    mut events: broadcast::Receiver<TransportEvent>,
) {
    loop {
        match events.recv().await {
            Ok(TransportEvent::Payload(raw)) => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if manager.dispatch(&raw).is_err() {
                    tracing::error!("Receive path stopped after a malformed envelope");
                    break;
                }
            }
            Ok(TransportEvent::Closed { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Receive loop lagged, {skipped} inbound payloads lost");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use crate::messages::{HeartbeatReq, IdentityReq, IdentityResp, PROTOCOL_VERSION};
    use crate::transport::ConnectOptions;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn identity_resp() -> Message {
        Message::IdentityResp(IdentityResp {
            status_code: 0,
            status_message: String::new(),
            open_id: "u1".to_string(),
            avatar_url: String::new(),
            nickname: "N".to_string(),
            room_id: 42,
        })
    }

    fn encoded(request_id: i64, message: &Message) -> Vec<u8> {
        encode_envelope(&Envelope::wrap(request_id, message).unwrap()).unwrap()
    }

    async fn running() -> Arc<MemoryTransport> {
        let transport = Arc::new(MemoryTransport::new());
        transport.connect(&ConnectOptions::default()).await.unwrap();
        transport
    }

    /// Helper: collect every inbound message into a channel.
    fn collector(manager: &MessageManager<MemoryTransport>) -> mpsc::UnboundedReceiver<Inbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        manager.subscribe(Arc::new(move |inbound: &Inbound| {
            let _ = tx.send(inbound.clone());
        }));
        rx
    }

    #[tokio::test]
    async fn test_request_ids_start_at_one_and_increase() {
        let transport = running().await;
        let manager = MessageManager::new(transport);
        let msg = Message::HeartbeatReq(HeartbeatReq {});

        let ids: Vec<RequestId> = (0..5).map(|_| manager.send(&msg, None)).collect();
        assert_eq!(ids[0], RequestId(1));
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_send_wraps_envelope_with_routing() {
        let transport = running().await;
        let mut sent = transport.take_sent().unwrap();
        let manager = MessageManager::new(Arc::clone(&transport));
        let routing = RoutingConfig {
            module_type: 3,
            instance_id: 8,
        };

        let id = manager.send(&Message::IdentityReq(IdentityReq {}), Some(routing));

        let frame = sent.recv().await.unwrap();
        assert_eq!(frame.routing, Some(routing));
        let envelope = decode_envelope(&frame.body).unwrap();
        assert_eq!(envelope.request_id, id.0);
        assert_eq!(envelope.msg_type_id, MsgType::IdentityReq.id());
    }

    #[tokio::test]
    async fn test_send_returns_zero_when_not_running() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = MessageManager::new(Arc::clone(&transport));
        let msg = Message::HeartbeatReq(HeartbeatReq {});

        assert_eq!(manager.send(&msg, None), RequestId::NOT_SENT);
        assert!(!manager.send(&msg, None).is_sent());

        // Reserved ids stay consumed even when the send is refused.
        let reserved = manager.next_request_id();
        assert_eq!(manager.send_with_id(reserved, &msg, None), RequestId::NOT_SENT);
        transport.connect(&ConnectOptions::default()).await.unwrap();
        assert!(manager.send(&msg, None) > reserved);
    }

    #[tokio::test]
    async fn test_dispatch_raises_decoded_message() {
        let manager = MessageManager::new(Arc::new(MemoryTransport::new()));
        let mut inbound = collector(&manager);

        manager.dispatch(&encoded(7, &identity_resp())).unwrap();

        let got = inbound.recv().await.unwrap();
        assert_eq!(got.request_id, RequestId(7));
        assert_eq!(got.msg_type(), Some(MsgType::IdentityResp));
        assert_eq!(got.message, Some(identity_resp()));
    }

    #[tokio::test]
    async fn test_unknown_type_decodes_to_absent_message() {
        let manager = MessageManager::new(Arc::new(MemoryTransport::new()));
        let mut inbound = collector(&manager);
        let envelope = Envelope {
            request_id: 3,
            msg_type_id: 777,
            payload: vec![9, 9],
        };

        manager.dispatch(&encode_envelope(&envelope).unwrap()).unwrap();

        let got = inbound.recv().await.unwrap();
        assert_eq!(got.msg_type_id, 777);
        assert_eq!(got.message, None);
        assert!(manager.fatal_error().is_none());
    }

    #[tokio::test]
    async fn test_bad_payload_of_known_type_is_not_fatal() {
        let manager = MessageManager::new(Arc::new(MemoryTransport::new()));
        let mut inbound = collector(&manager);
        let envelope = Envelope {
            request_id: 4,
            msg_type_id: MsgType::IdentityResp.id(),
            payload: vec![],
        };

        manager.dispatch(&encode_envelope(&envelope).unwrap()).unwrap();

        let got = inbound.recv().await.unwrap();
        assert_eq!(got.request_id, RequestId(4));
        assert_eq!(got.message, None);
        assert!(manager.fatal_error().is_none());
    }

    #[test]
    fn test_malformed_envelope_is_fatal() {
        struct FatalProbe(Mutex<Option<String>>);
        impl InboundHandler for FatalProbe {
            fn on_message(&self, _inbound: &Inbound) {}
            fn on_fatal(&self, error: &Arc<MessageError>) {
                *self.0.lock().unwrap() = Some(error.to_string());
            }
        }

        let manager = MessageManager::new(Arc::new(MemoryTransport::new()));
        let probe = Arc::new(FatalProbe(Mutex::new(None)));
        manager.subscribe(probe.clone());

        let result = manager.dispatch(&[PROTOCOL_VERSION, 0xFF, 0xFF]);

        assert!(result.is_err());
        assert!(manager.fatal_error().is_some());
        assert!(probe.0.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_receive_loop_dispatches_and_stops_on_fatal() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = Arc::new(MessageManager::new(Arc::clone(&transport)));
        let mut inbound = collector(&manager);
        manager.start_receiving();

        transport.inject(encoded(1, &identity_resp()));
        let got = tokio::time::timeout(Duration::from_secs(1), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.request_id, RequestId(1));

        transport.inject(vec![PROTOCOL_VERSION + 1, 1, 2]);
        transport.inject(encoded(2, &identity_resp()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            manager.fatal_error().as_deref(),
            Some(MessageError::UnsupportedVersion(_))
        ));
        assert!(inbound.try_recv().is_err());
    }
}
