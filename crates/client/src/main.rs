mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use meshroom_client::capture::SilentSource;
use meshroom_client::peer::WebRtcFactory;
use meshroom_client::services::{self, ServiceClient, Summarizer};
use meshroom_client::session::{Collaborators, Event, Session, SessionOptions, SessionUpdate};
use meshroom_client::signaling::run_signaling;
use meshroom_client::stats::Adapter;
use meshroom_protocol::MeshroomConfig;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// How long to wait for the leave message to reach the relay on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn log_update(update: &SessionUpdate) {
    match update {
        SessionUpdate::Membership(state) => info!(?state, "Membership changed"),
        SessionUpdate::LocalPreview { stream_id } => info!(stream_id, "Local preview ready"),
        SessionUpdate::PeerConnected(peer) => info!(peer = %peer, "Peer tile connected"),
        SessionUpdate::TileRemoved(peer) => info!(peer = %peer, "Peer tile removed"),
        SessionUpdate::ModeChanged(mode) => info!(%mode, "Operating mode"),
        SessionUpdate::TranscriptUpdate(entry) => {
            info!(ts = entry.ts, "Transcript: {}", entry.text)
        }
        SessionUpdate::AttentionUpdate { peer, score } => {
            debug!(peer = peer.as_deref().unwrap_or("local"), score, "Attention")
        }
        SessionUpdate::Summary(summary) => info!("Summary: {summary}"),
        SessionUpdate::Alert(message) => warn!("{message}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = cli::parse_args()?;
    let mut config = MeshroomConfig::load(&args.config_path)?;
    args.apply(&mut config);
    config.check()?;

    let service_client = ServiceClient::from_config(&config.services)
        .context("Failed to build collaborator HTTP client")?;
    if service_client.is_none() {
        info!("No services.base_url configured, adaptation and summaries disabled");
    }
    let ice_servers = services::resolve_ice_servers(service_client.as_ref(), &config.ice).await;
    let transports = WebRtcFactory::new(ice_servers).context("Failed to initialise WebRTC")?;

    let (adapter, summarizer) = match service_client {
        Some(client) => {
            let client = Arc::new(client);
            (
                Some(Arc::clone(&client) as Arc<dyn Adapter>),
                Some(client as Arc<dyn Summarizer>),
            )
        }
        None => (None, None),
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
    let (session, events_rx) = Session::new(
        SessionOptions::from_config(&config),
        Collaborators {
            capture: Arc::new(SilentSource),
            transports: Arc::new(transports),
            adapter,
            summarizer,
        },
        outbound_tx,
        updates_tx,
    );
    let events = session.events();
    let session_task = tokio::spawn(session.run(events_rx));

    let signaling_config = config.signaling.clone();
    let signaling_events = events.clone();
    let mut signaling_task = tokio::spawn(async move {
        run_signaling(&signaling_config, &mut outbound_rx, &signaling_events).await;
    });

    info!(
        room = %args.room,
        mode = ?config.session.mode,
        relay = %config.signaling.url,
        "meshroom-client v{}",
        env!("CARGO_PKG_VERSION")
    );
    events
        .send(Event::Join(args.room.clone()))
        .context("Session task exited before join")?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut signaling_down = false;
    loop {
        tokio::select! {
            Some(update) = updates_rx.recv() => log_update(&update),
            _ = &mut signaling_task, if !signaling_down => {
                // The session keeps its state; leaving needs the user.
                warn!("Signaling stopped, waiting for ctrl-c or SIGTERM");
                signaling_down = true;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, leaving room");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, leaving room");
                break;
            }
        }
    }

    if args.summarize_on_exit {
        let _ = events.send(Event::Summarize);
        let wait = Duration::from_millis(config.services.request_timeout_ms);
        let summary = tokio::time::timeout(wait, async {
            while let Some(update) = updates_rx.recv().await {
                log_update(&update);
                if matches!(update, SessionUpdate::Summary(_)) {
                    break;
                }
            }
        });
        if summary.await.is_err() {
            warn!("No summary received before shutdown");
        }
    }

    let _ = events.send(Event::Shutdown);
    drop(events);
    if session_task.await.is_err() {
        warn!("Session task panicked");
    }
    if !signaling_task.is_finished()
        && tokio::time::timeout(SHUTDOWN_GRACE, &mut signaling_task)
            .await
            .is_err()
    {
        debug!("Signaling did not drain in time");
        signaling_task.abort();
    }

    info!("meshroom-client shut down cleanly");
    Ok(())
}
