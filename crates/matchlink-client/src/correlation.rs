//! Request/reply correlation by request id.
//!
//! A workflow reserves a request id, registers a [`PendingReply`] for it, and
//! only then sends the request, so a fast reply can never beat its slot.
//! Every inbound message is classified as an acknowledgement or as an
//! asynchronous match outcome; each kind has its own slot per request id,
//! which lets a start request wait for its acknowledgement and its outcome
//! under the same id.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use matchlink_net::{Inbound, InboundHandler, Message, MessageError, MsgType, RequestId};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;

/// Which reply to a request a slot waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    /// The direct response to a request.
    Ack,
    /// A later match-succeeded or match-failed notification.
    Outcome,
}

impl ReplyKind {
    /// Classify an inbound message type. Requests classify as `None`.
    pub fn of(msg_type: MsgType) -> Option<Self> {
        match msg_type {
            MsgType::InitRoutingResp
            | MsgType::StartMatchResp
            | MsgType::CancelMatchResp
            | MsgType::HeartbeatResp
            | MsgType::IdentityResp => Some(ReplyKind::Ack),
            MsgType::MatchSucceededNotify | MsgType::MatchFailedNotify => {
                Some(ReplyKind::Outcome)
            }
            MsgType::InitRoutingReq
            | MsgType::StartMatchReq
            | MsgType::CancelMatchReq
            | MsgType::HeartbeatReq
            | MsgType::IdentityReq => None,
        }
    }
}

type Slot = oneshot::Sender<Option<Message>>;

/// Table of reply slots, fed by the message manager's receive task.
#[derive(Default)]
pub struct Correlator {
    slots: DashMap<(RequestId, ReplyKind), Slot>,
    poisoned: OnceLock<Arc<MessageError>>,
}

impl Correlator {
    /// Create an empty table.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a slot for the `kind` reply to `id`.
    ///
    /// After a fatal receive error the returned slot fails immediately.
    pub fn expect(self: &Arc<Self>, id: RequestId, kind: ReplyKind) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        if self.poisoned.get().is_none() {
            self.slots.insert((id, kind), tx);
        }
        PendingReply {
            id,
            kind,
            rx,
            correlator: Arc::clone(self),
        }
    }

    /// Number of open slots.
    pub fn pending(&self) -> usize {
        self.slots.len()
    }

    /// Release every open slot.
    pub fn clear(&self) {
        self.slots.clear();
    }

    fn complete(&self, inbound: &Inbound) {
        let Some(kind) = inbound.msg_type().and_then(ReplyKind::of) else {
            tracing::debug!(
                "Ignoring message type {} for request {}",
                inbound.msg_type_id,
                inbound.request_id
            );
            return;
        };
        match self.slots.remove(&(inbound.request_id, kind)) {
            Some((_, slot)) => {
                let _ = slot.send(inbound.message.clone());
            }
            None => {
                tracing::debug!(
                    "Unclaimed {kind:?} for request {} dropped",
                    inbound.request_id
                );
            }
        }
    }
}

impl InboundHandler for Correlator {
    fn on_message(&self, inbound: &Inbound) {
        self.complete(inbound);
    }

    fn on_fatal(&self, error: &Arc<MessageError>) {
        let _ = self.poisoned.set(Arc::clone(error));
        self.slots.clear();
    }
}

/// A registered reply slot. Dropping it releases the slot.
pub struct PendingReply {
    id: RequestId,
    kind: ReplyKind,
    rx: oneshot::Receiver<Option<Message>>,
    correlator: Arc<Correlator>,
}

impl PendingReply {
    /// Request id this slot belongs to.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the reply or for `token`.
    ///
    /// Returns `Ok(None)` when the reply arrived with an undecodable payload.
    pub async fn wait(mut self, token: &CancellationToken) -> Result<Option<Message>, ClientError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(ClientError::Canceled),
            reply = &mut self.rx => match reply {
                Ok(message) => Ok(message),
                Err(_) => Err(match self.correlator.poisoned.get() {
                    Some(error) => ClientError::Protocol(Arc::clone(error)),
                    None => ClientError::ReplyDropped,
                }),
            },
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.correlator.slots.remove(&(self.id, self.kind));
    }
}
