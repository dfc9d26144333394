//! Errors raised inside the matchmaking workflows.

use std::sync::Arc;

use matchlink_net::{MessageError, MsgType};

/// Terminal classification of a workflow result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// The request completed. A match may still have been rejected.
    RequestDone,
    /// The caller (or a newer request) canceled the workflow.
    UserCanceled,
    /// The server was unreachable, replied with the wrong shape, or returned
    /// a nonzero status.
    NetworkError,
    /// Anything else.
    Undefined,
}

/// Why a workflow step failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The cancellation token fired.
    #[error("canceled")]
    Canceled,

    /// The transport never reached the running state.
    #[error("could not connect to matchmaking server")]
    NotConnected,

    /// The transport refused the request.
    #[error("request could not be sent: not connected")]
    NotSent,

    /// The server answered with a nonzero status.
    #[error("{message}")]
    Status {
        /// Server status code.
        code: i32,
        /// Server message, or a fallback when the server sent none.
        message: String,
    },

    /// The correlated reply had the wrong type or no decodable payload.
    #[error("expected {expected:?}, got {got:?}")]
    UnexpectedReply {
        /// Type the workflow waited for.
        expected: MsgType,
        /// Type that arrived. `None` for undecodable payloads.
        got: Option<MsgType>,
    },

    /// Heartbeats stopped reaching the server.
    #[error("lost connection to matchmaking server")]
    ConnectionLost,

    /// The routing handshake was canceled before it completed.
    #[error("routing handshake canceled")]
    RoutingCanceled,

    /// The reply slot was released without an answer.
    #[error("reply slot released without an answer")]
    ReplyDropped,

    /// The receive path stopped on a malformed envelope.
    #[error("protocol error: {0}")]
    Protocol(Arc<MessageError>),
}

impl ClientError {
    /// Build a [`ClientError::Status`], substituting a generic message when
    /// the server sent an empty one.
    pub fn status(code: i32, message: &str) -> Self {
        let message = if message.is_empty() {
            format!("matchmaking server returned status {code}")
        } else {
            message.to_owned()
        };
        ClientError::Status { code, message }
    }

    /// Result code this error maps to.
    pub fn code(&self) -> ResultCode {
        match self {
            ClientError::Canceled => ResultCode::UserCanceled,
            ClientError::Protocol(_) => ResultCode::Undefined,
            ClientError::NotConnected
            | ClientError::NotSent
            | ClientError::Status { .. }
            | ClientError::UnexpectedReply { .. }
            | ClientError::ConnectionLost
            | ClientError::RoutingCanceled
            | ClientError::ReplyDropped => ResultCode::NetworkError,
        }
    }
}
