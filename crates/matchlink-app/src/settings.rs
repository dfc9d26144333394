//! Conversion from persisted config into the client's runtime settings.

use std::time::Duration;

use matchlink_client::MatchConfig;
use matchlink_config::Config;
use matchlink_net::{ConnectOptions, FrameConfig, RetryPolicy};

pub fn connect_options(config: &Config) -> ConnectOptions {
    ConnectOptions {
        address: config.server.endpoint(),
        connect_timeout: Duration::from_millis(config.server.connect_timeout_ms),
    }
}

pub fn frame_config(config: &Config) -> FrameConfig {
    FrameConfig {
        max_payload_size: config.server.max_frame_bytes,
    }
}

pub fn retry_policy(config: &Config) -> RetryPolicy {
    RetryPolicy {
        max_retries: config.retry.max_retries,
        retry_interval: Duration::from_millis(config.retry.retry_interval_ms),
        jitter: config.retry.jitter.clamp(0.0, 1.0),
    }
}

pub fn match_config(config: &Config) -> MatchConfig {
    let matchmaking = &config.matchmaking;
    let defaults = MatchConfig::default();
    MatchConfig {
        // The backend rejects empty tags.
        default_tag: if matchmaking.default_tag.is_empty() {
            defaults.default_tag
        } else {
            matchmaking.default_tag.clone()
        },
        preempt_grace: Duration::from_millis(matchmaking.preempt_grace_ms),
        max_missed_heartbeats: matchmaking.max_missed_heartbeats,
    }
}
