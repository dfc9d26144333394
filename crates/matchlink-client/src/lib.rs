//! Matchmaking orchestration: identity lookup, routing cache, match requests, heartbeats, and cancellation.

pub mod client;
pub mod correlation;
pub mod error;
pub mod heartbeat;
pub mod outcome;

pub use client::{MatchClient, MatchConfig};
pub use correlation::{Correlator, PendingReply, ReplyKind};
pub use error::{ClientError, ResultCode};
pub use heartbeat::Heartbeat;
pub use outcome::{IdentityInfo, MatchOutcome};
