//! Matchmaking message catalog and the binary request envelope.
//!
//! Every message travels inside an [`Envelope`] that pairs a client-generated
//! request id with a message-type id and the schema-specific payload bytes.
//! Envelopes are serialized with [`postcard`] and prefixed with a protocol
//! version byte. Use [`encode_envelope`] and [`decode_envelope`] for the outer
//! frame and [`Message::encode_payload`] / [`Message::decode_payload`] for the
//! inner payload.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

/// Current wire-protocol version. Prepended to every serialized envelope.
pub const PROTOCOL_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// Message type ids
// ---------------------------------------------------------------------------

/// Message-type identifier carried in every envelope. Selects the schema used
/// to decode the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MsgType {
    /// Ask the backend which shard serves a pool.
    InitRoutingReq = 1,
    /// Shard coordinates for a pool.
    InitRoutingResp = 2,
    /// Submit a match request.
    StartMatchReq = 3,
    /// Acknowledgement of a match request.
    StartMatchResp = 4,
    /// Withdraw a pending match request.
    CancelMatchReq = 5,
    /// Acknowledgement of a cancellation.
    CancelMatchResp = 6,
    /// Keep-alive for a pending match request.
    HeartbeatReq = 7,
    /// Keep-alive acknowledgement.
    HeartbeatResp = 8,
    /// Ask for the caller's identity and room.
    IdentityReq = 9,
    /// Identity and room information.
    IdentityResp = 10,
    /// A match was formed.
    MatchSucceededNotify = 11,
    /// Matching gave up.
    MatchFailedNotify = 12,
}

impl MsgType {
    /// Every known message type, in id order.
    pub const ALL: [MsgType; 12] = [
        MsgType::InitRoutingReq,
        MsgType::InitRoutingResp,
        MsgType::StartMatchReq,
        MsgType::StartMatchResp,
        MsgType::CancelMatchReq,
        MsgType::CancelMatchResp,
        MsgType::HeartbeatReq,
        MsgType::HeartbeatResp,
        MsgType::IdentityReq,
        MsgType::IdentityResp,
        MsgType::MatchSucceededNotify,
        MsgType::MatchFailedNotify,
    ];

    /// Raw wire id.
    pub fn id(self) -> i32 {
        self as i32
    }

    /// Look up a message type by its wire id. Unknown ids return `None`.
    pub fn from_id(id: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.id() == id)
    }
}

// ---------------------------------------------------------------------------
// Shared value types
// ---------------------------------------------------------------------------

/// Server-assigned coordinates of the backend shard serving a pool.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RoutingConfig {
    /// Backend module type.
    pub module_type: u64,
    /// Backend instance within the module.
    pub instance_id: u64,
}

/// Identifies a matchmaking pool: a named bucket of compatible requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MatchPoolDescriptor {
    /// Pool name.
    pub pool_name: String,
    /// Pool tag. The backend requires a non-empty tag.
    pub tag: String,
}

impl MatchPoolDescriptor {
    /// Create a descriptor from a pool name and tag.
    pub fn new(pool_name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            pool_name: pool_name.into(),
            tag: tag.into(),
        }
    }

    /// Stable hash used as the routing-cache key.
    pub fn cache_key(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Routing handshake request for a pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitRoutingReq {
    /// Pool to resolve.
    pub pool: MatchPoolDescriptor,
}

/// Routing handshake response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitRoutingResp {
    /// Zero on success.
    pub status_code: i32,
    /// Human-readable status.
    pub status_message: String,
    /// Backend module type.
    pub module_type: u64,
    /// Backend instance within the module.
    pub instance_id: u64,
}

/// Match request addressed to a resolved shard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartMatchReq {
    /// Pool to match in.
    pub pool: MatchPoolDescriptor,
    /// Caller-defined matching parameters (JSON).
    pub params_json: String,
    /// Opaque extra information forwarded to the backend.
    pub extra_info: String,
    /// Shard the request is addressed to.
    pub routing: RoutingConfig,
}

/// Acknowledgement of a [`StartMatchReq`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartMatchResp {
    /// Zero on success.
    pub status_code: i32,
    /// Human-readable status.
    pub status_message: String,
    /// Heartbeat period requested by the backend. `<= 0` disables heartbeats.
    pub heartbeat_interval_secs: i32,
}

/// Withdraw a pending match request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancelMatchReq {
    /// Pool the request was submitted to.
    pub pool: MatchPoolDescriptor,
    /// Shard the request was addressed to.
    pub routing: RoutingConfig,
}

/// Acknowledgement of a [`CancelMatchReq`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancelMatchResp {
    /// Zero on success.
    pub status_code: i32,
    /// Human-readable status.
    pub status_message: String,
}

/// Keep-alive for a pending match request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatReq {}

/// Keep-alive acknowledgement.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatResp {}

/// Identity request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IdentityReq {}

/// Identity and room of the current user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityResp {
    /// Zero on success.
    pub status_code: i32,
    /// Human-readable status.
    pub status_message: String,
    /// Stable user identifier.
    pub open_id: String,
    /// Avatar URL.
    pub avatar_url: String,
    /// Display name.
    pub nickname: String,
    /// Live room the user is broadcasting from.
    pub room_id: u64,
}

/// One participant of a formed match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchedPlayer {
    /// Stable user identifier.
    pub open_id: String,
    /// Display name.
    pub nickname: String,
    /// Live room of the participant.
    pub room_id: u64,
    /// Team index assigned by the backend.
    pub team: u32,
}

/// A match was formed for a pending request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchSucceededNotify {
    /// Backend identifier of the formed match.
    pub match_id: String,
    /// All participants, including the caller.
    pub players: Vec<MatchedPlayer>,
    /// Session description for the game (JSON).
    pub session_json: String,
}

/// Matching gave up on a pending request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchFailedNotify {
    /// Backend reason code.
    pub status_code: i32,
    /// Human-readable reason.
    pub message: String,
}

// ---------------------------------------------------------------------------
// Top-level enum
// ---------------------------------------------------------------------------

/// A decoded matchmaking message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    InitRoutingReq(InitRoutingReq),
    InitRoutingResp(InitRoutingResp),
    StartMatchReq(StartMatchReq),
    StartMatchResp(StartMatchResp),
    CancelMatchReq(CancelMatchReq),
    CancelMatchResp(CancelMatchResp),
    HeartbeatReq(HeartbeatReq),
    HeartbeatResp(HeartbeatResp),
    IdentityReq(IdentityReq),
    IdentityResp(IdentityResp),
    MatchSucceededNotify(MatchSucceededNotify),
    MatchFailedNotify(MatchFailedNotify),
}

impl Message {
    /// Message-type id of this message.
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::InitRoutingReq(_) => MsgType::InitRoutingReq,
            Message::InitRoutingResp(_) => MsgType::InitRoutingResp,
            Message::StartMatchReq(_) => MsgType::StartMatchReq,
            Message::StartMatchResp(_) => MsgType::StartMatchResp,
            Message::CancelMatchReq(_) => MsgType::CancelMatchReq,
            Message::CancelMatchResp(_) => MsgType::CancelMatchResp,
            Message::HeartbeatReq(_) => MsgType::HeartbeatReq,
            Message::HeartbeatResp(_) => MsgType::HeartbeatResp,
            Message::IdentityReq(_) => MsgType::IdentityReq,
            Message::IdentityResp(_) => MsgType::IdentityResp,
            Message::MatchSucceededNotify(_) => MsgType::MatchSucceededNotify,
            Message::MatchFailedNotify(_) => MsgType::MatchFailedNotify,
        }
    }

    /// Status code and message for responses that carry one.
    pub fn status(&self) -> Option<(i32, &str)> {
        match self {
            Message::InitRoutingResp(m) => Some((m.status_code, &m.status_message)),
            Message::StartMatchResp(m) => Some((m.status_code, &m.status_message)),
            Message::CancelMatchResp(m) => Some((m.status_code, &m.status_message)),
            Message::IdentityResp(m) => Some((m.status_code, &m.status_message)),
            Message::MatchFailedNotify(m) => Some((m.status_code, &m.message)),
            _ => None,
        }
    }

    /// Serialize the payload only (no envelope, no version byte).
    pub fn encode_payload(&self) -> Result<Vec<u8>, postcard::Error> {
        match self {
            Message::InitRoutingReq(m) => postcard::to_allocvec(m),
            Message::InitRoutingResp(m) => postcard::to_allocvec(m),
            Message::StartMatchReq(m) => postcard::to_allocvec(m),
            Message::StartMatchResp(m) => postcard::to_allocvec(m),
            Message::CancelMatchReq(m) => postcard::to_allocvec(m),
            Message::CancelMatchResp(m) => postcard::to_allocvec(m),
            Message::HeartbeatReq(m) => postcard::to_allocvec(m),
            Message::HeartbeatResp(m) => postcard::to_allocvec(m),
            Message::IdentityReq(m) => postcard::to_allocvec(m),
            Message::IdentityResp(m) => postcard::to_allocvec(m),
            Message::MatchSucceededNotify(m) => postcard::to_allocvec(m),
            Message::MatchFailedNotify(m) => postcard::to_allocvec(m),
        }
    }

    /// Decode a payload using the schema selected by `msg_type`.
    pub fn decode_payload(msg_type: MsgType, payload: &[u8]) -> Result<Message, postcard::Error> {
        let msg = match msg_type {
            MsgType::InitRoutingReq => Message::InitRoutingReq(postcard::from_bytes(payload)?),
            MsgType::InitRoutingResp => Message::InitRoutingResp(postcard::from_bytes(payload)?),
            MsgType::StartMatchReq => Message::StartMatchReq(postcard::from_bytes(payload)?),
            MsgType::StartMatchResp => Message::StartMatchResp(postcard::from_bytes(payload)?),
            MsgType::CancelMatchReq => Message::CancelMatchReq(postcard::from_bytes(payload)?),
            MsgType::CancelMatchResp => Message::CancelMatchResp(postcard::from_bytes(payload)?),
            MsgType::HeartbeatReq => Message::HeartbeatReq(postcard::from_bytes(payload)?),
            MsgType::HeartbeatResp => Message::HeartbeatResp(postcard::from_bytes(payload)?),
            MsgType::IdentityReq => Message::IdentityReq(postcard::from_bytes(payload)?),
            MsgType::IdentityResp => Message::IdentityResp(postcard::from_bytes(payload)?),
            MsgType::MatchSucceededNotify => {
                Message::MatchSucceededNotify(postcard::from_bytes(payload)?)
            }
            MsgType::MatchFailedNotify => Message::MatchFailedNotify(postcard::from_bytes(payload)?),
        };
        Ok(msg)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Outer frame correlating a request id with a typed payload.
///
/// `msg_type_id` stays a raw integer so that envelopes carrying message types
/// this client does not know still decode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    /// Client-generated request id. `0` means "not sent".
    pub request_id: i64,
    /// Wire id of the payload schema.
    pub msg_type_id: i32,
    /// Schema-specific payload bytes.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Wrap `message` for `request_id`.
    pub fn wrap(request_id: i64, message: &Message) -> Result<Self, postcard::Error> {
        Ok(Self {
            request_id,
            msg_type_id: message.msg_type().id(),
            payload: message.encode_payload()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during envelope deserialization.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The buffer was empty (no version byte).
    #[error("empty envelope: no version byte")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Bytes were left over after the envelope.
    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),

    /// Postcard deserialization failed.
    #[error("deserialization error: {0}")]
    Postcard(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

/// Serialize an [`Envelope`] into a versioned binary buffer.
///
/// Wire format: `[version: u8] [postcard-encoded Envelope]`
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, postcard::Error> {
    let body = postcard::to_allocvec(envelope)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Deserialize a versioned binary buffer into an [`Envelope`].
///
/// Truncated, corrupt, or over-long buffers are rejected.
pub fn decode_envelope(data: &[u8]) -> Result<Envelope, MessageError> {
    let Some((&version, body)) = data.split_first() else {
        return Err(MessageError::EmptyPayload);
    };
    if version != PROTOCOL_VERSION {
        return Err(MessageError::UnsupportedVersion(version));
    }

    let (envelope, rest) = postcard::take_from_bytes::<Envelope>(body)?;
    if !rest.is_empty() {
        return Err(MessageError::TrailingBytes(rest.len()));
    }
    Ok(envelope)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> MatchPoolDescriptor {
        MatchPoolDescriptor::new("duel", "ranked")
    }

    fn routing() -> RoutingConfig {
        RoutingConfig {
            module_type: 4,
            instance_id: 9001,
        }
    }

    fn catalog() -> Vec<Message> {
        vec![
            Message::InitRoutingReq(InitRoutingReq { pool: pool() }),
            Message::InitRoutingResp(InitRoutingResp {
                status_code: 0,
                status_message: String::new(),
                module_type: 4,
                instance_id: 9001,
            }),
            Message::StartMatchReq(StartMatchReq {
                pool: pool(),
                params_json: r#"{"team_size":2}"#.to_string(),
                extra_info: "sdk=1.2".to_string(),
                routing: routing(),
            }),
            Message::StartMatchResp(StartMatchResp {
                status_code: 0,
                status_message: "queued".to_string(),
                heartbeat_interval_secs: 5,
            }),
            Message::CancelMatchReq(CancelMatchReq {
                pool: pool(),
                routing: routing(),
            }),
            Message::CancelMatchResp(CancelMatchResp {
                status_code: 0,
                status_message: String::new(),
            }),
            Message::HeartbeatReq(HeartbeatReq {}),
            Message::HeartbeatResp(HeartbeatResp {}),
            Message::IdentityReq(IdentityReq {}),
            Message::IdentityResp(IdentityResp {
                status_code: 0,
                status_message: String::new(),
                open_id: "u1".to_string(),
                avatar_url: "https://cdn.example/a.png".to_string(),
                nickname: "N".to_string(),
                room_id: 42,
            }),
            Message::MatchSucceededNotify(MatchSucceededNotify {
                match_id: "m-77".to_string(),
                players: vec![MatchedPlayer {
                    open_id: "u1".to_string(),
                    nickname: "N".to_string(),
                    room_id: 42,
                    team: 1,
                }],
                session_json: "{}".to_string(),
            }),
            Message::MatchFailedNotify(MatchFailedNotify {
                status_code: 3,
                message: "no opponents".to_string(),
            }),
        ]
    }

    #[test]
    fn test_catalog_covers_every_message_type() {
        let types: Vec<MsgType> = catalog().iter().map(Message::msg_type).collect();
        assert_eq!(types, MsgType::ALL.to_vec());
    }

    #[test]
    fn test_every_message_survives_envelope() {
        for (i, msg) in catalog().into_iter().enumerate() {
            let envelope = Envelope::wrap(i as i64 + 1, &msg).unwrap();
            let bytes = encode_envelope(&envelope).unwrap();
            let decoded = decode_envelope(&bytes).unwrap();
            assert_eq!(decoded, envelope);

            let msg_type = MsgType::from_id(decoded.msg_type_id).unwrap();
            let payload = Message::decode_payload(msg_type, &decoded.payload).unwrap();
            assert_eq!(payload, msg);
        }
    }

    #[test]
    fn test_msg_type_ids_are_stable() {
        assert_eq!(MsgType::InitRoutingReq.id(), 1);
        assert_eq!(MsgType::MatchFailedNotify.id(), 12);
        assert_eq!(MsgType::from_id(4), Some(MsgType::StartMatchResp));
        assert_eq!(MsgType::from_id(0), None);
        assert_eq!(MsgType::from_id(999), None);
    }

    #[test]
    fn test_unknown_type_id_still_decodes_envelope() {
        let envelope = Envelope {
            request_id: 5,
            msg_type_id: 4242,
            payload: vec![1, 2, 3],
        };
        let bytes = encode_envelope(&envelope).unwrap();
        assert_eq!(decode_envelope(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_truncated_envelope_rejected() {
        let msg = Message::IdentityReq(IdentityReq {});
        let bytes = encode_envelope(&Envelope::wrap(1, &msg).unwrap()).unwrap();
        let result = decode_envelope(&bytes[..bytes.len() - 1]);
        assert!(
            matches!(result, Err(MessageError::Postcard(_))),
            "Truncated envelope should fail, got {result:?}"
        );
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let msg = Message::HeartbeatReq(HeartbeatReq {});
        let mut bytes = encode_envelope(&Envelope::wrap(1, &msg).unwrap()).unwrap();
        bytes.extend_from_slice(&[0, 0]);
        assert!(matches!(
            decode_envelope(&bytes),
            Err(MessageError::TrailingBytes(2))
        ));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let msg = Message::HeartbeatReq(HeartbeatReq {});
        let mut bytes = encode_envelope(&Envelope::wrap(1, &msg).unwrap()).unwrap();
        bytes[0] = 255;
        assert!(matches!(
            decode_envelope(&bytes),
            Err(MessageError::UnsupportedVersion(255))
        ));
    }

    #[test]
    fn test_empty_buffer_rejected() {
        assert!(matches!(
            decode_envelope(&[]),
            Err(MessageError::EmptyPayload)
        ));
    }

    #[test]
    fn test_corrupted_envelope_rejected() {
        let result = decode_envelope(&[PROTOCOL_VERSION, 0xFF, 0xFF, 0xFF]);
        assert!(result.is_err(), "Corrupted envelope should fail");
    }

    #[test]
    fn test_status_extracted_from_responses() {
        let resp = Message::StartMatchResp(StartMatchResp {
            status_code: 7,
            status_message: "pool closed".to_string(),
            heartbeat_interval_secs: 0,
        });
        assert_eq!(resp.status(), Some((7, "pool closed")));
        assert_eq!(Message::HeartbeatResp(HeartbeatResp {}).status(), None);
    }

    #[test]
    fn test_cache_key_depends_on_name_and_tag() {
        let a = MatchPoolDescriptor::new("duel", "ranked");
        let b = MatchPoolDescriptor::new("duel", "ranked");
        let c = MatchPoolDescriptor::new("duel", "casual");
        assert_eq!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), c.cache_key());
    }

    #[test]
    fn test_version_byte_is_first_byte() {
        let msg = Message::IdentityReq(IdentityReq {});
        let bytes = encode_envelope(&Envelope::wrap(1, &msg).unwrap()).unwrap();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
    }
}
