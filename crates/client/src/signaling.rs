use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use meshroom_protocol::config::SignalingConfig;
use meshroom_protocol::{ClientMessage, ServerMessage};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::SessionError;
use crate::session::Event;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingStatus {
    Connected,
    /// The connection dropped or failed; another attempt follows after the
    /// reconnect delay.
    Reconnecting { failures: u32 },
    /// Retries exhausted. The channel stays down. `attempts` counts every
    /// connection attempt since the last success.
    Unavailable { attempts: u32 },
}

enum Disconnect {
    /// The session dropped its end; nothing left to do.
    SessionGone,
    Lost(String),
}

/// Bounded retries with a fixed delay between attempts.
#[derive(Debug)]
pub struct ReconnectPolicy {
    max_retries: u32,
    delay: Duration,
    failures: u32,
}

impl ReconnectPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay,
            failures: 0,
        }
    }

    pub fn succeeded(&mut self) {
        self.failures = 0;
    }

    /// Record a failed attempt. Returns the delay before the next retry, or
    /// `None` once `max_retries` retries have failed as well.
    pub fn failed(&mut self) -> Option<Duration> {
        self.failures += 1;
        (self.failures <= self.max_retries).then_some(self.delay)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Run the signaling channel until the session goes away or retries are
/// exhausted. Outbound messages queued while disconnected are sent after the
/// next successful connect.
pub async fn run_signaling(
    config: &SignalingConfig,
    outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
    events: &mpsc::UnboundedSender<Event>,
) {
    let mut policy = ReconnectPolicy::new(
        config.max_reconnect_attempts,
        Duration::from_millis(config.reconnect_delay_ms),
    );

    loop {
        info!(url = %config.url, "Connecting to signaling server");
        let reason = match connect(config).await {
            Ok(ws) => {
                policy.succeeded();
                info!("Connected to signaling server");
                if events.send(Event::Signaling(SignalingStatus::Connected)).is_err() {
                    return;
                }
                match pump(ws, outbound, events).await {
                    Disconnect::SessionGone => {
                        debug!("Session gone, closing signaling channel");
                        return;
                    }
                    Disconnect::Lost(reason) => reason,
                }
            }
            Err(e) => format!("{e:#}"),
        };

        match policy.failed() {
            Some(delay) => {
                warn!(
                    failures = policy.failures(),
                    "Signaling connection lost: {reason}, retrying in {}ms",
                    delay.as_millis()
                );
                let status = SignalingStatus::Reconnecting {
                    failures: policy.failures(),
                };
                if events.send(Event::Signaling(status)).is_err() {
                    return;
                }
                tokio::time::sleep(delay).await;
            }
            None => {
                let attempts = policy.failures();
                error!("{}: {reason}", SessionError::SignalingUnavailable { attempts });
                let _ = events.send(Event::Signaling(SignalingStatus::Unavailable { attempts }));
                return;
            }
        }
    }
}

/// Build a TLS connector, pinning the relay certificate if a path is given.
fn build_tls_connector(tls_cert_path: Option<&str>) -> tokio_tungstenite::Connector {
    let mut root_store = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!("Failed to load a platform certificate: {e}");
    }
    for cert in native.certs {
        let _ = root_store.add(cert);
    }

    if let Some(cert_path) = tls_cert_path {
        match std::fs::read(cert_path) {
            Ok(pem_data) => {
                for cert in rustls_pemfile::certs(&mut pem_data.as_slice()).filter_map(|r| r.ok()) {
                    if let Err(e) = root_store.add(cert) {
                        warn!("Failed to add pinned cert to root store: {e}");
                    } else {
                        info!("Pinned relay certificate from {cert_path}");
                    }
                }
            }
            Err(e) => {
                warn!("Failed to read TLS cert from {cert_path}: {e}, falling back to system roots");
            }
        }
    }

    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    tokio_tungstenite::Connector::Rustls(Arc::new(tls_config))
}

async fn connect(config: &SignalingConfig) -> anyhow::Result<WsStream> {
    let connector = config
        .url
        .starts_with("wss://")
        .then(|| build_tls_connector(config.tls_cert.as_deref()));
    let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
    ws_config.max_message_size = Some(65_536);
    let (ws, _) =
        tokio_tungstenite::connect_async_tls_with_config(&config.url, Some(ws_config), false, connector)
            .await
            .context("WebSocket connection failed")?;
    Ok(ws)
}

async fn pump(
    ws: WsStream,
    outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
    events: &mpsc::UnboundedSender<Event>,
) -> Disconnect {
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(msg) => {
                                if events.send(Event::Signal(msg)).is_err() {
                                    return Disconnect::SessionGone;
                                }
                            }
                            Err(e) => warn!("Invalid message from relay: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Disconnect::Lost("closed by relay".to_string());
                    }
                    Some(Err(e)) => return Disconnect::Lost(e.to_string()),
                    _ => {}
                }
            }
            msg = outbound.recv() => {
                let Some(msg) = msg else {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return Disconnect::SessionGone;
                };
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to serialize outbound message: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    return Disconnect::Lost(e.to_string());
                }
            }
        }
    }
}
