mod relay;
mod transcribe;
mod web;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use meshroom_protocol::MeshroomConfig;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::transcribe::PlaceholderTranscriber;
use crate::web::AppState;

const USAGE: &str = "\
meshroom-server - Meshroom room relay

USAGE:
    meshroom-server [OPTIONS]

OPTIONS:
    -c, --config <PATH>          Config file [default: ./config/meshroom.toml]
    -p, --port <PORT>            Listen port [default: 5000]
    -V, --version                Print version and exit
    -h, --help                   Print this help and exit";

#[derive(Debug, PartialEq)]
enum Command {
    Serve {
        config_path: PathBuf,
        port: Option<u16>,
    },
    Help,
    Version,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Command> {
    let mut config_path = PathBuf::from("./config/meshroom.toml");
    let mut port = None;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-V" | "--version" => return Ok(Command::Version),
            "-h" | "--help" => return Ok(Command::Help),
            "-c" | "--config" => {
                config_path = args.next().context("Missing --config value")?.into();
            }
            "-p" | "--port" => {
                let value = args.next().context("Missing --port value")?;
                let parsed = value
                    .parse::<u16>()
                    .with_context(|| format!("Invalid --port value: {value}"))?;
                port = Some(parsed);
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
    }

    Ok(Command::Serve { config_path, port })
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
        tracing::warn!("SIGTERM handler unavailable, waiting for ctrl-c only");
        let _ = tokio::signal::ctrl_c().await;
        return;
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config_path, port) = match parse_args(std::env::args().skip(1))? {
        Command::Serve { config_path, port } => (config_path, port),
        Command::Help => {
            println!("{USAGE}");
            return Ok(());
        }
        Command::Version => {
            println!("meshroom-server {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
    };

    let mut config = MeshroomConfig::load(&config_path)?;
    if let Some(port) = port {
        config.relay.port = port;
    }
    config.check()?;

    let bind_addr: SocketAddr = format!("{}:{}", config.relay.bind, config.relay.port)
        .parse()
        .context("Invalid bind address")?;
    let mode = config.session.mode;
    let flush_every = Duration::from_millis(config.relay.transcript_flush_ms);

    let rooms = relay::new_room_registry();
    let transcription = tokio::spawn(transcribe::run_transcription(
        Arc::clone(&rooms),
        Arc::new(PlaceholderTranscriber),
        flush_every,
    ));

    let state = Arc::new(AppState {
        config,
        rooms,
        started_at: Instant::now(),
    });
    let app = web::with_request_tracing(web::build_router(state));

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;
    tracing::info!(
        ?mode,
        "meshroom-server v{} listening on http://{bind_addr}",
        env!("CARGO_PKG_VERSION")
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Relay server error")?;

    transcription.abort();
    tracing::info!("meshroom-server shut down cleanly");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults_without_flags() {
        assert_eq!(
            parse_args(args(&[])).unwrap(),
            Command::Serve {
                config_path: PathBuf::from("./config/meshroom.toml"),
                port: None,
            }
        );
    }

    #[test]
    fn config_and_port_flags() {
        assert_eq!(
            parse_args(args(&["-c", "/etc/meshroom.toml", "--port", "8443"])).unwrap(),
            Command::Serve {
                config_path: PathBuf::from("/etc/meshroom.toml"),
                port: Some(8443),
            }
        );
        assert_eq!(parse_args(args(&["-h"])).unwrap(), Command::Help);
    }

    #[test]
    fn bad_flags_are_rejected() {
        assert!(parse_args(args(&["--port", "eighty"])).is_err());
        assert!(parse_args(args(&["--port"])).is_err());
        assert!(parse_args(args(&["--tls"])).is_err());
    }
}
