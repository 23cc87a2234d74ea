use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use meshroom_protocol::{CandidateInit, PeerId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;

use crate::capture::LocalTrack;
use crate::session::Event;

/// Identifies one negotiation attempt. Completions carrying an id that no
/// longer matches the live Connection are stale.
pub type ConnectionId = u64;

static CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

pub fn next_connection_id() -> ConnectionId {
    CONNECTION_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// ICE server entry handed to the transport factory.
#[derive(Debug, Clone, PartialEq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
            _ => TransportState::New,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Raw counters read from a transport. RTT values are in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportStats {
    pub current_rtt: Option<f64>,
    pub cumulative_rtt: Option<f64>,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub bytes_sent: Option<u64>,
}

/// The operations the session needs from one peer-to-peer media transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn add_track(&self, track: Arc<LocalTrack>) -> anyhow::Result<()>;

    /// Create an offer, set it as the local description and return its SDP.
    async fn create_offer(&self) -> anyhow::Result<String>;

    /// Create an answer, set it as the local description and return its SDP.
    async fn create_answer(&self) -> anyhow::Result<String>;

    async fn set_remote_description(&self, kind: DescriptionKind, sdp: String)
    -> anyhow::Result<()>;

    async fn add_ice_candidate(&self, candidate: CandidateInit) -> anyhow::Result<()>;

    async fn stats(&self) -> anyhow::Result<TransportStats>;

    async fn close(&self) -> anyhow::Result<()>;
}

/// Sink a transport reports state changes and local candidates into.
/// Posting after the session has gone away is a no-op.
#[derive(Clone)]
pub struct TransportEvents {
    peer: PeerId,
    conn: ConnectionId,
    tx: mpsc::UnboundedSender<Event>,
}

impl TransportEvents {
    pub fn new(peer: PeerId, conn: ConnectionId, tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { peer, conn, tx }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self, state: TransportState) {
        let _ = self.tx.send(Event::TransportState {
            peer: self.peer.clone(),
            conn: self.conn,
            state,
        });
    }

    pub fn candidate(&self, candidate: CandidateInit) {
        let _ = self.tx.send(Event::LocalCandidate {
            peer: self.peer.clone(),
            conn: self.conn,
            candidate,
        });
    }
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, events: TransportEvents) -> anyhow::Result<Arc<dyn Transport>>;
}

/// Builds webrtc-rs peer connections.
pub struct WebRtcFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("Failed to register codecs")?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("Failed to register interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if ice_servers.is_empty() {
            vec![RTCIceServer {
                urls: meshroom_protocol::config::default_stun_urls(),
                ..Default::default()
            }]
        } else {
            ice_servers
                .into_iter()
                .map(|s| RTCIceServer {
                    urls: s.urls,
                    username: s.username.unwrap_or_default(),
                    credential: s.credential.unwrap_or_default(),
                })
                .collect()
        };

        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(&self, events: TransportEvents) -> anyhow::Result<Arc<dyn Transport>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            debug!(peer = %state_events.peer(), ?state, "Peer connection state changed");
            state_events.state(state.into());
            Box::pin(async {})
        }));

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(json) => candidate_events.candidate(CandidateInit {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                    }),
                    Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                }
            }
            Box::pin(async {})
        }));

        info!(peer = %events.peer(), "WebRTC peer connection created");
        Ok(Arc::new(WebRtcTransport { pc }))
    }
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn add_track(&self, track: Arc<LocalTrack>) -> anyhow::Result<()> {
        self.pc
            .add_track(track.rtc() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .with_context(|| format!("Failed to add {:?} track", track.kind()))?;
        Ok(())
    }

    async fn create_offer(&self) -> anyhow::Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .context("Failed to create offer")?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .context("Failed to set local description")?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> anyhow::Result<String> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .context("Failed to set local description")?;
        Ok(answer.sdp)
    }

    async fn set_remote_description(
        &self,
        kind: DescriptionKind,
        sdp: String,
    ) -> anyhow::Result<()> {
        let desc = match kind {
            DescriptionKind::Offer => RTCSessionDescription::offer(sdp),
            DescriptionKind::Answer => RTCSessionDescription::answer(sdp),
        }
        .context("Failed to parse SDP")?;
        self.pc
            .set_remote_description(desc)
            .await
            .context("Failed to set remote description")?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidateInit) -> anyhow::Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .context("Failed to add ICE candidate")?;
        Ok(())
    }

    async fn stats(&self) -> anyhow::Result<TransportStats> {
        if self.pc.connection_state() == RTCPeerConnectionState::Closed {
            anyhow::bail!("peer connection closed");
        }
        let report = self.pc.get_stats().await;
        let mut stats = TransportStats::default();
        let mut rtt_total = 0.0;
        let mut rtt_measurements = 0u64;

        for stat in report.reports.values() {
            match stat {
                StatsReportType::OutboundRTP(rtp) => {
                    *stats.bytes_sent.get_or_insert(0) += rtp.bytes_sent;
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    stats.packets_received += remote.packets_received;
                    stats.packets_lost += remote.packets_lost.max(0) as u64;
                    if let Some(rtt) = remote.round_trip_time {
                        stats.current_rtt = Some(stats.current_rtt.map_or(rtt, |r| r.max(rtt)));
                    }
                    rtt_total += remote.total_round_trip_time;
                    rtt_measurements += remote.round_trip_time_measurements;
                }
                _ => {}
            }
        }
        if rtt_measurements > 0 {
            stats.cumulative_rtt = Some(rtt_total / rtt_measurements as f64);
        }
        Ok(stats)
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.pc
            .close()
            .await
            .context("Failed to close peer connection")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Negotiating,
    Connected,
    Degraded,
    Closed,
}

/// Local bookkeeping for one remote participant. Owns its transport handle
/// and its stats task exclusively.
pub struct Connection {
    pub id: ConnectionId,
    pub role: Role,
    pub state: ConnectionState,
    pub transport: Option<Arc<dyn Transport>>,
    pub tracks_attached: bool,
    /// Offer received before the transport existed or capture was ready.
    pub pending_offer: Option<String>,
    pub offer_started: bool,
    pub awaiting_answer: bool,
    pub answer_pending: bool,
    pub remote_description_set: bool,
    /// ICE ufrag of the last applied remote offer, for dropping resent offers.
    pub remote_ufrag: Option<String>,
    pub pending_candidates: Vec<CandidateInit>,
    pub stats_task: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn new(role: Role) -> Self {
        Self {
            id: next_connection_id(),
            role,
            state: ConnectionState::Idle,
            transport: None,
            tracks_attached: false,
            pending_offer: None,
            offer_started: false,
            awaiting_answer: false,
            answer_pending: false,
            remote_description_set: false,
            remote_ufrag: None,
            pending_candidates: Vec::new(),
            stats_task: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Stop the stats task and close the transport. Idempotent.
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.state = ConnectionState::Closed;
        if let Some(task) = self.stats_task.take() {
            task.abort();
        }
        self.pending_candidates.clear();
        if let Some(transport) = self.transport.take() {
            spawn_close(transport, self.id);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// ICE username fragment of an SDP blob. A resent offer carries the same one.
pub fn ice_ufrag(sdp: &str) -> Option<String> {
    sdp.lines()
        .find_map(|l| l.trim().strip_prefix("a=ice-ufrag:"))
        .map(str::to_string)
}

/// Close a transport off the session task.
pub fn spawn_close(transport: Arc<dyn Transport>, conn: ConnectionId) {
    tokio::spawn(async move {
        if let Err(e) = transport.close().await {
            debug!(conn, "Transport close failed: {e:#}");
        }
    });
}
