//! Configuration for the matchlink client.
//!
//! Settings persist to disk as a RON file with forward/backward compatible
//! sections. CLI overrides come from clap; reload reports whether the file
//! changed.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CONFIG_FILE, Config, DebugConfig, MatchmakingConfig, RetryConfig, ServerConfig,
};
pub use error::ConfigError;
