//! Command-line arguments of the `matchlink` binary.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Join a matchmaking pool and print the outcome.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "matchlink", about = "Matchmaking protocol client")]
pub struct CliArgs {
    /// Gateway host.
    #[arg(long)]
    pub server: Option<String>,

    /// Gateway port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Pool to join.
    #[arg(long)]
    pub pool: Option<String>,

    /// Pool tag.
    #[arg(long)]
    pub tag: Option<String>,

    /// Matching parameters as JSON.
    #[arg(long, default_value = "{}")]
    pub params: String,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.server {
            self.server.address = addr.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(ref pool) = args.pool {
            self.matchmaking.pool_name = pool.clone();
        }
        if let Some(ref tag) = args.tag {
            self.matchmaking.tag = tag.clone();
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs::parse_from([
            "matchlink",
            "--server",
            "10.1.2.3",
            "--tag",
            "ranked",
            "--log-level",
            "debug",
        ]);
        config.apply_cli_overrides(&args);

        assert_eq!(config.server.address, "10.1.2.3");
        assert_eq!(config.matchmaking.tag, "ranked");
        assert_eq!(config.debug.log_level, "debug");
        // Non-overridden fields retain defaults
        assert_eq!(config.server.port, 7801);
        assert_eq!(config.matchmaking.pool_name, "duel");
        assert_eq!(args.params, "{}");
    }

    #[test]
    fn test_cli_no_override() {
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::parse_from(["matchlink"]));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_config_dir_flag() {
        let args = CliArgs::parse_from(["matchlink", "--config", "/tmp/mm", "--port", "9100"]);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/mm")));
        assert_eq!(args.port, Some(9100));
    }
}
