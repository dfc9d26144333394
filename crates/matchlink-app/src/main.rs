//! The `matchlink` binary: look up the caller's identity, join one pool, and
//! print the outcome. Ctrl-C cancels the pending match and notifies the server.

mod settings;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use matchlink_client::{MatchClient, MatchOutcome};
use matchlink_config::{CliArgs, Config};
use matchlink_net::{MatchPoolDescriptor, SocketConfig, TcpTransport};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_dir = match args.config.clone().map_or_else(Config::default_dir, Ok) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let mut config = match Config::load_or_create(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Using default config: {e}");
            Config::default()
        }
    };
    config.apply_cli_overrides(&args);

    let log_dir: PathBuf = config_dir.join("logs");
    matchlink_log::init_logging(Some(&log_dir), config.debug.log_to_file, Some(&config));
    tracing::info!("Config directory: {}", config_dir.display());

    let transport = Arc::new(TcpTransport::new(
        SocketConfig::default(),
        settings::frame_config(&config),
    ));
    let client = MatchClient::new(
        transport,
        settings::connect_options(&config),
        settings::retry_policy(&config),
        settings::match_config(&config),
    );

    let token = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(token.clone()));

    match client.get_identity_info(&token).await {
        Ok(info) => println!(
            "identity: {} ({}) in room {}",
            info.nickname, info.open_id, info.room_id
        ),
        Err(e) => {
            eprintln!("identity lookup failed: {e}");
            return ExitCode::FAILURE;
        }
    }

    let pool = MatchPoolDescriptor::new(
        config.matchmaking.pool_name.clone(),
        config.matchmaking.tag.clone(),
    );
    let outcome = client.start_match(pool, &args.params, "", &token).await;
    client.dispose();
    report(&outcome)
}

async fn cancel_on_ctrl_c(token: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Interrupted, canceling");
        token.cancel();
    }
}

fn report(outcome: &MatchOutcome) -> ExitCode {
    match outcome {
        MatchOutcome::Matched(result) => {
            println!("matched: {}", result.match_id);
            for player in &result.players {
                println!(
                    "  team {}: {} ({}) room {}",
                    player.team, player.nickname, player.open_id, player.room_id
                );
            }
            println!("session: {}", result.session_json);
            ExitCode::SUCCESS
        }
        MatchOutcome::Rejected(failure) => {
            println!("no match ({}): {}", failure.status_code, failure.message);
            ExitCode::FAILURE
        }
        MatchOutcome::Canceled => {
            println!("canceled");
            ExitCode::FAILURE
        }
        MatchOutcome::NetworkError(message) => {
            eprintln!("network error: {message}");
            ExitCode::FAILURE
        }
        MatchOutcome::Undefined => {
            eprintln!("matchmaking failed, see log for details");
            ExitCode::FAILURE
        }
    }
}
