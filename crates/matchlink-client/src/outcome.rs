//! Values handed back to callers of the matchmaking workflows.

use matchlink_net::messages::{IdentityResp, MatchFailedNotify, MatchSucceededNotify};

use crate::error::{ClientError, ResultCode};

/// Terminal result of one [`start_match`](crate::MatchClient::start_match) call.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// The backend formed a match.
    Matched(MatchSucceededNotify),
    /// The backend accepted the request but gave up matching it.
    Rejected(MatchFailedNotify),
    /// The caller or a newer request canceled the call.
    Canceled,
    /// Connectivity, reply shape, or server status failure.
    NetworkError(String),
    /// Anything else. Details are logged, not returned.
    Undefined,
}

impl MatchOutcome {
    /// Classification of this outcome.
    pub fn code(&self) -> ResultCode {
        match self {
            MatchOutcome::Matched(_) | MatchOutcome::Rejected(_) => ResultCode::RequestDone,
            MatchOutcome::Canceled => ResultCode::UserCanceled,
            MatchOutcome::NetworkError(_) => ResultCode::NetworkError,
            MatchOutcome::Undefined => ResultCode::Undefined,
        }
    }

    /// Human-readable error, for network errors.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            MatchOutcome::NetworkError(message) => Some(message),
            _ => None,
        }
    }

    /// The formed match, if any.
    pub fn match_result(&self) -> Option<&MatchSucceededNotify> {
        match self {
            MatchOutcome::Matched(result) => Some(result),
            _ => None,
        }
    }

    /// The backend's rejection, if any.
    pub fn match_error(&self) -> Option<&MatchFailedNotify> {
        match self {
            MatchOutcome::Rejected(error) => Some(error),
            _ => None,
        }
    }
}

impl From<ClientError> for MatchOutcome {
    fn from(error: ClientError) -> Self {
        match error.code() {
            ResultCode::UserCanceled => MatchOutcome::Canceled,
            ResultCode::NetworkError => MatchOutcome::NetworkError(error.to_string()),
            ResultCode::RequestDone | ResultCode::Undefined => MatchOutcome::Undefined,
        }
    }
}

/// Identity and live room of the current user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityInfo {
    /// Platform-wide user id.
    pub open_id: String,
    /// Profile picture URL, possibly empty.
    pub avatar_url: String,
    /// Display name.
    pub nickname: String,
    /// Live room the user is broadcasting from.
    pub room_id: u64,
}

impl From<IdentityResp> for IdentityInfo {
    fn from(resp: IdentityResp) -> Self {
        Self {
            open_id: resp.open_id,
            avatar_url: resp.avatar_url,
            nickname: resp.nickname,
            room_id: resp.room_id,
        }
    }
}
