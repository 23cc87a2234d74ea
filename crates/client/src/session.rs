//! Room membership and per-peer connection lifecycle.
//!
//! One task owns a [`Session`] and feeds it [`Event`]s: user intents, relay
//! messages, transport callbacks and the completions of asynchronous work the
//! session spawned. Completions carry the capture epoch or [`ConnectionId`]
//! they were started under; anything that no longer matches is stale and is
//! discarded, closing any transport it carries.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use meshroom_protocol::config::{
    AdaptationConfig, AttentionConfig, MeshroomConfig, TranscriptionConfig,
};
use meshroom_protocol::{
    CandidateInit, ClientMessage, OperatingMode, PeerId, RoomMode, ServerMessage, TranscriptEntry,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ancillary;
use crate::capture::{CaptureManager, CaptureSource, LocalStream, LocalTrack};
use crate::error::{CaptureError, SessionError};
use crate::peer::{
    Connection, ConnectionId, ConnectionState, DescriptionKind, Role, Transport, TransportEvents,
    TransportFactory, TransportState, ice_ufrag, spawn_close,
};
use crate::services::Summarizer;
use crate::signaling::SignalingStatus;
use crate::stats::{Adapter, StatsLoop};

/// Connection key in pair rooms, where the relay does not name the sender.
pub const PAIR_PEER: &str = "pair";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    NotJoined,
    Joining,
    Joined,
}

pub enum Event {
    Join(String),
    Leave,
    /// Leave and stop the session task.
    Shutdown,
    Signal(ServerMessage),
    Signaling(SignalingStatus),
    CaptureOpened {
        epoch: u64,
        result: Result<LocalStream, CaptureError>,
    },
    TransportCreated {
        peer: PeerId,
        conn: ConnectionId,
        result: anyhow::Result<Arc<dyn Transport>>,
    },
    TransportState {
        peer: PeerId,
        conn: ConnectionId,
        state: TransportState,
    },
    LocalCandidate {
        peer: PeerId,
        conn: ConnectionId,
        candidate: CandidateInit,
    },
    LocalDescription {
        peer: PeerId,
        conn: ConnectionId,
        kind: DescriptionKind,
        result: anyhow::Result<String>,
    },
    RemoteDescription {
        peer: PeerId,
        conn: ConnectionId,
        result: anyhow::Result<()>,
    },
    CandidateApplied {
        peer: PeerId,
        conn: ConnectionId,
        result: anyhow::Result<()>,
    },
    Summarize,
    SimulateMode(Option<OperatingMode>),
    TranscriptText(String),
}

/// What presentation needs to know.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Membership(Membership),
    LocalPreview { stream_id: u64 },
    PeerConnected(PeerId),
    TileRemoved(PeerId),
    ModeChanged(OperatingMode),
    TranscriptUpdate(TranscriptEntry),
    /// `peer` is `None` for the local score.
    AttentionUpdate { peer: Option<PeerId>, score: f64 },
    Summary(String),
    Alert(String),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub mode: RoomMode,
    pub adaptation: AdaptationConfig,
    pub transcription: TranscriptionConfig,
    pub attention: AttentionConfig,
}

impl SessionOptions {
    pub fn from_config(config: &MeshroomConfig) -> Self {
        Self {
            mode: config.session.mode,
            adaptation: config.adaptation.clone(),
            transcription: config.transcription.clone(),
            attention: config.attention.clone(),
        }
    }
}

/// External services the session drives.
pub struct Collaborators {
    pub capture: Arc<dyn CaptureSource>,
    pub transports: Arc<dyn TransportFactory>,
    pub adapter: Option<Arc<dyn Adapter>>,
    pub summarizer: Option<Arc<dyn Summarizer>>,
}

fn spawn_job<F>(events: &mpsc::UnboundedSender<Event>, job: F)
where
    F: Future<Output = Event> + Send + 'static,
{
    let tx = events.clone();
    tokio::spawn(async move {
        let _ = tx.send(job.await);
    });
}

fn live<'a>(
    connections: &'a mut HashMap<PeerId, Connection>,
    peer: &str,
    conn: ConnectionId,
) -> Option<&'a mut Connection> {
    connections.get_mut(peer).filter(|c| c.id == conn)
}

async fn negotiate(
    transport: Arc<dyn Transport>,
    tracks: Option<[Arc<LocalTrack>; 2]>,
    kind: DescriptionKind,
) -> anyhow::Result<String> {
    if let Some(tracks) = tracks {
        for track in tracks {
            transport.add_track(track).await?;
        }
    }
    match kind {
        DescriptionKind::Offer => transport.create_offer().await,
        DescriptionKind::Answer => transport.create_answer().await,
    }
}

fn spawn_candidate(
    events: &mpsc::UnboundedSender<Event>,
    peer: &str,
    conn: ConnectionId,
    transport: Arc<dyn Transport>,
    candidate: CandidateInit,
) {
    let peer = peer.to_string();
    spawn_job(events, async move {
        Event::CandidateApplied {
            peer,
            conn,
            result: transport.add_ice_candidate(candidate).await,
        }
    });
}

pub struct Session {
    options: SessionOptions,
    membership: Membership,
    room: Option<String>,
    is_initiator: bool,
    connections: HashMap<PeerId, Connection>,
    departed: HashSet<PeerId>,
    capture: CaptureManager,
    capture_epoch: u64,
    capture_pending: bool,
    had_capture: bool,
    transports: Arc<dyn TransportFactory>,
    adapter: Option<Arc<dyn Adapter>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    simulate: watch::Sender<Option<OperatingMode>>,
    ancillary: Vec<JoinHandle<()>>,
    events: mpsc::UnboundedSender<Event>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
}

impl Session {
    pub fn new(
        options: SessionOptions,
        collaborators: Collaborators,
        outbound: mpsc::UnboundedSender<ClientMessage>,
        updates: mpsc::UnboundedSender<SessionUpdate>,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (simulate, _) = watch::channel(options.adaptation.simulate);
        let session = Self {
            options,
            membership: Membership::NotJoined,
            room: None,
            is_initiator: false,
            connections: HashMap::new(),
            departed: HashSet::new(),
            capture: CaptureManager::new(collaborators.capture),
            capture_epoch: 0,
            capture_pending: false,
            had_capture: false,
            transports: collaborators.transports,
            adapter: collaborators.adapter,
            summarizer: collaborators.summarizer,
            simulate,
            ancillary: Vec::new(),
            events,
            outbound,
            updates,
        };
        (session, events_rx)
    }

    pub fn events(&self) -> mpsc::UnboundedSender<Event> {
        self.events.clone()
    }

    pub fn membership(&self) -> Membership {
        self.membership
    }

    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn connection(&self, peer: &str) -> Option<&Connection> {
        self.connections.get(peer)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.capture.active()
    }

    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            if matches!(event, Event::Shutdown) {
                self.leave();
                break;
            }
            self.handle(event);
        }
        debug!("Session task stopped");
    }

    /// The single transition function.
    pub fn handle(&mut self, event: Event) {
        match event {
            Event::Join(room) => self.join(room),
            Event::Leave | Event::Shutdown => self.leave(),
            Event::Signal(msg) => self.on_signal(msg),
            Event::Signaling(status) => self.on_signaling_status(status),
            Event::CaptureOpened { epoch, result } => self.on_capture_opened(epoch, result),
            Event::TransportCreated { peer, conn, result } => {
                self.on_transport_created(peer, conn, result)
            }
            Event::TransportState { peer, conn, state } => {
                self.on_transport_state(peer, conn, state)
            }
            Event::LocalCandidate {
                peer,
                conn,
                candidate,
            } => self.on_local_candidate(peer, conn, candidate),
            Event::LocalDescription {
                peer,
                conn,
                kind,
                result,
            } => self.on_local_description(peer, conn, kind, result),
            Event::RemoteDescription { peer, conn, result } => {
                self.on_remote_description(peer, conn, result)
            }
            Event::CandidateApplied { peer, conn, result } => {
                if let Err(e) = result
                    && live(&mut self.connections, &peer, conn).is_some()
                {
                    self.reject(&peer, format!("{e:#}"));
                }
            }
            Event::Summarize => self.summarize(),
            Event::SimulateMode(mode) => {
                info!(mode = ?mode, "Simulation override updated");
                self.simulate.send_replace(mode);
            }
            Event::TranscriptText(text) => self.push_transcript(text),
        }
    }

    fn publish(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }

    fn send(&self, msg: ClientMessage) {
        if self.outbound.send(msg).is_err() {
            debug!("Signaling channel gone, dropping outbound message");
        }
    }

    fn set_membership(&mut self, membership: Membership) {
        self.membership = membership;
        self.publish(SessionUpdate::Membership(membership));
    }

    /// `to` field for messages addressed to `peer`.
    fn target(&self, peer: &str) -> Option<PeerId> {
        match self.options.mode {
            RoomMode::Pair => None,
            RoomMode::Mesh => Some(peer.to_string()),
        }
    }

    /// Connection key for a message from `from`.
    fn peer_key(&self, from: Option<PeerId>, event: &str) -> Option<PeerId> {
        match (self.options.mode, from) {
            (RoomMode::Pair, _) => Some(PAIR_PEER.to_string()),
            (RoomMode::Mesh, Some(from)) => Some(from),
            (RoomMode::Mesh, None) => {
                warn!(event, "Dropping mesh event without sender");
                None
            }
        }
    }

    fn join(&mut self, room: String) {
        if self.membership != Membership::NotJoined {
            warn!(room = %room, state = ?self.membership, "Join ignored, already joining or joined");
            return;
        }
        let room = room.trim();
        if room.is_empty() {
            warn!("Join ignored, empty room id");
            self.publish(SessionUpdate::Alert("Room id must not be empty".to_string()));
            return;
        }
        info!(room = %room, mode = ?self.options.mode, "Joining room");
        self.room = Some(room.to_string());
        self.set_membership(Membership::Joining);
        self.send(ClientMessage::Join {
            room: room.to_string(),
        });
    }

    fn leave(&mut self) {
        if self.membership == Membership::NotJoined {
            debug!("Leave ignored, not joined");
            return;
        }
        if let Some(room) = self.room.take() {
            info!(room = %room, connections = self.connections.len(), "Leaving room");
            self.send(ClientMessage::Leave { room });
        }
        for (peer, mut conn) in self.connections.drain() {
            debug!(peer = %peer, conn = conn.id, "Closing connection");
            conn.close();
            let _ = self.updates.send(SessionUpdate::TileRemoved(peer));
        }
        for task in self.ancillary.drain(..) {
            task.abort();
        }
        self.capture.release();
        self.capture_epoch += 1;
        self.capture_pending = false;
        self.departed.clear();
        self.is_initiator = false;
        self.set_membership(Membership::NotJoined);
    }

    fn on_signal(&mut self, msg: ServerMessage) {
        if msg.is_negotiation() && self.membership != Membership::Joined {
            warn!(event = msg.name(), state = ?self.membership, "Discarding negotiation event, not joined");
            return;
        }
        match msg {
            ServerMessage::Created => self.on_confirmed(true),
            ServerMessage::Ready => match self.membership {
                Membership::Joining => self.on_confirmed(false),
                Membership::Joined if self.is_initiator => self.initiate_pair(),
                Membership::Joined => debug!("Peer ready, waiting for its offer"),
                Membership::NotJoined => warn!("Discarding ready, not joined"),
            },
            ServerMessage::ExistingPeers { peers } => {
                if self.membership == Membership::Joining {
                    info!(peers = peers.len(), "Room has existing participants");
                }
                self.on_confirmed(false);
            }
            ServerMessage::Full => {
                if self.membership != Membership::Joining {
                    warn!("Discarding full, no join in progress");
                    return;
                }
                warn!(room = ?self.room, "Room is full");
                self.room = None;
                self.set_membership(Membership::NotJoined);
                self.publish(SessionUpdate::Alert("Room is full".to_string()));
            }
            ServerMessage::NewPeer { peer } => {
                info!(peer = %peer, "New participant, initiating");
                self.departed.remove(&peer);
                self.start_initiator(peer);
            }
            ServerMessage::Offer { from, sdp } => {
                if let Some(peer) = self.peer_key(from, "offer") {
                    self.on_offer(peer, sdp);
                }
            }
            ServerMessage::Answer { from, sdp } => {
                if let Some(peer) = self.peer_key(from, "answer") {
                    self.on_answer(peer, sdp);
                }
            }
            ServerMessage::IceCandidate { from, candidate } => {
                if let Some(peer) = self.peer_key(from, "ice-candidate") {
                    self.on_remote_candidate(peer, candidate);
                }
            }
            ServerMessage::PeerLeft { sid } => self.on_peer_left(sid),
            ServerMessage::TranscriptUpdate { entry, .. } => {
                self.publish(SessionUpdate::TranscriptUpdate(entry))
            }
            ServerMessage::AttentionUpdate { sid, score } => {
                self.publish(SessionUpdate::AttentionUpdate {
                    peer: Some(sid),
                    score,
                })
            }
            ServerMessage::Pong { time } => debug!(time, "Pong"),
            ServerMessage::Error { message } => {
                warn!(%message, "Relay error");
                self.publish(SessionUpdate::Alert(message));
            }
        }
    }

    fn on_signaling_status(&mut self, status: SignalingStatus) {
        match status {
            SignalingStatus::Connected => info!("Signaling connected"),
            SignalingStatus::Reconnecting { failures } => {
                warn!(failures, "Signaling reconnecting")
            }
            SignalingStatus::Unavailable { attempts } => {
                let err = SessionError::SignalingUnavailable { attempts };
                warn!(state = ?self.membership, "{err}");
                self.publish(SessionUpdate::Alert(err.to_string()));
            }
        }
    }

    fn on_confirmed(&mut self, initiator: bool) {
        if self.membership != Membership::Joining {
            warn!(state = ?self.membership, "Discarding membership confirmation, no join in progress");
            return;
        }
        self.is_initiator = initiator;
        self.set_membership(Membership::Joined);
        info!(room = ?self.room, initiator, "Joined room");
        self.request_capture();
    }

    fn request_capture(&mut self) {
        if self.capture.active().is_some() || self.capture_pending {
            return;
        }
        self.capture_pending = true;
        let epoch = self.capture_epoch;
        let source = self.capture.source();
        spawn_job(&self.events, async move {
            Event::CaptureOpened {
                epoch,
                result: source.open().await,
            }
        });
    }

    fn on_capture_opened(&mut self, epoch: u64, result: Result<LocalStream, CaptureError>) {
        if epoch != self.capture_epoch || self.membership != Membership::Joined {
            debug!(epoch, "Discarding stale capture result");
            if let Ok(stream) = result {
                stream.stop();
            }
            return;
        }
        self.capture_pending = false;

        let stream = match result {
            Ok(stream) => self.capture.adopt(stream),
            Err(e) => {
                let err = SessionError::from(e);
                error!("Capture failed, leaving room: {err}");
                if matches!(err, SessionError::PermissionDenied) && !self.had_capture {
                    self.publish(SessionUpdate::Alert(err.to_string()));
                }
                self.leave();
                return;
            }
        };
        self.had_capture = true;
        self.publish(SessionUpdate::LocalPreview {
            stream_id: stream.id(),
        });
        self.start_ancillary(&stream);

        let peers: Vec<PeerId> = self.connections.keys().cloned().collect();
        for peer in peers {
            self.advance(&peer);
        }
    }

    fn start_ancillary(&mut self, stream: &LocalStream) {
        let Some(room) = self.room.clone() else { return };
        if !self.ancillary.is_empty() {
            return;
        }
        if self.options.transcription.enabled {
            self.ancillary.push(ancillary::spawn_transcription(
                room.clone(),
                stream,
                &self.options.transcription,
                self.outbound.clone(),
            ));
        }
        if self.options.attention.enabled {
            self.ancillary.push(ancillary::spawn_attention(
                room,
                stream,
                &self.options.attention,
                self.outbound.clone(),
                self.updates.clone(),
            ));
        }
    }

    fn initiate_pair(&mut self) {
        if let Some(conn) = self.connections.get(PAIR_PEER)
            && conn.role == Role::Initiator
        {
            debug!(conn = conn.id, "Duplicate ready, already initiating");
            return;
        }
        self.departed.remove(PAIR_PEER);
        self.start_initiator(PAIR_PEER.to_string());
    }

    fn start_initiator(&mut self, peer: PeerId) {
        let conn = Connection::new(Role::Initiator);
        info!(peer = %peer, conn = conn.id, "Creating initiator connection");
        self.install(peer, conn);
    }

    /// Insert a connection, closing any previous one for the same peer, and
    /// start creating its transport.
    fn install(&mut self, peer: PeerId, conn: Connection) {
        if let Some(mut old) = self.connections.remove(&peer) {
            info!(peer = %peer, old = old.id, new = conn.id, "Replacing existing connection");
            old.close();
        }
        let id = conn.id;
        self.connections.insert(peer.clone(), conn);

        let factory = Arc::clone(&self.transports);
        let sink = TransportEvents::new(peer.clone(), id, self.events.clone());
        spawn_job(&self.events, async move {
            Event::TransportCreated {
                peer,
                conn: id,
                result: factory.create(sink).await,
            }
        });
    }

    fn on_transport_created(
        &mut self,
        peer: PeerId,
        conn: ConnectionId,
        result: anyhow::Result<Arc<dyn Transport>>,
    ) {
        let Some(c) = live(&mut self.connections, &peer, conn) else {
            debug!(peer = %peer, conn, "Discarding transport for stale connection");
            if let Ok(transport) = result {
                spawn_close(transport, conn);
            }
            return;
        };
        match result {
            Ok(transport) => {
                c.transport = Some(transport);
                self.advance(&peer);
            }
            Err(e) => self.reject(&peer, format!("{e:#}")),
        }
    }

    /// Start whatever negotiation step the connection is ready for.
    fn advance(&mut self, peer: &str) {
        let stream = self.capture.active().cloned();
        let Some(c) = self.connections.get_mut(peer) else { return };
        let Some(transport) = c.transport.clone() else { return };
        let conn = c.id;
        let peer_id = peer.to_string();

        if let Some(sdp) = c.pending_offer.take() {
            c.state = ConnectionState::Negotiating;
            spawn_job(&self.events, async move {
                Event::RemoteDescription {
                    peer: peer_id,
                    conn,
                    result: transport
                        .set_remote_description(DescriptionKind::Offer, sdp)
                        .await,
                }
            });
            return;
        }

        // No track-less descriptions: wait for capture.
        let Some(stream) = stream else { return };
        let kind = match c.role {
            Role::Initiator if !c.offer_started => {
                c.offer_started = true;
                DescriptionKind::Offer
            }
            Role::Responder if c.answer_pending => {
                c.answer_pending = false;
                DescriptionKind::Answer
            }
            _ => return,
        };
        c.state = ConnectionState::Negotiating;
        let tracks = (!c.tracks_attached).then(|| stream.tracks());
        c.tracks_attached = true;
        spawn_job(&self.events, async move {
            Event::LocalDescription {
                peer: peer_id,
                conn,
                kind,
                result: negotiate(transport, tracks, kind).await,
            }
        });
    }

    fn on_offer(&mut self, peer: PeerId, sdp: String) {
        let ufrag = ice_ufrag(&sdp);
        if let Some(existing) = self.connections.get(&peer)
            && ufrag.is_some()
            && existing.remote_ufrag == ufrag
        {
            info!(peer = %peer, ufrag = ?ufrag, "Ignoring duplicate offer");
            return;
        }
        self.departed.remove(&peer);

        let mut conn = Connection::new(Role::Responder);
        info!(peer = %peer, conn = conn.id, "Offer received, creating responder connection");
        conn.state = ConnectionState::Negotiating;
        conn.pending_offer = Some(sdp);
        conn.remote_ufrag = ufrag;
        self.install(peer, conn);
        self.request_capture();
    }

    fn on_answer(&mut self, peer: PeerId, sdp: String) {
        let Some(c) = self.connections.get_mut(&peer) else {
            warn!(peer = %peer, "Answer for unknown connection, dropping");
            return;
        };
        if c.role != Role::Initiator || !c.awaiting_answer {
            warn!(peer = %peer, role = ?c.role, "Answer without outstanding offer, dropping");
            return;
        }
        let Some(transport) = c.transport.clone() else { return };
        c.awaiting_answer = false;
        let conn = c.id;
        debug!(peer = %peer, conn, "Applying answer");
        spawn_job(&self.events, async move {
            Event::RemoteDescription {
                peer,
                conn,
                result: transport
                    .set_remote_description(DescriptionKind::Answer, sdp)
                    .await,
            }
        });
    }

    fn on_remote_candidate(&mut self, peer: PeerId, candidate: CandidateInit) {
        let Some(c) = self.connections.get_mut(&peer) else {
            warn!(peer = %peer, "Dropping ICE candidate for unknown connection");
            return;
        };
        match c.transport.clone() {
            Some(transport) if c.remote_description_set => {
                spawn_candidate(&self.events, &peer, c.id, transport, candidate);
            }
            _ => {
                debug!(peer = %peer, conn = c.id, "Queueing ICE candidate until remote description is set");
                c.pending_candidates.push(candidate);
            }
        }
    }

    fn on_remote_description(&mut self, peer: PeerId, conn: ConnectionId, result: anyhow::Result<()>) {
        let Some(c) = live(&mut self.connections, &peer, conn) else {
            debug!(peer = %peer, conn, "Discarding stale remote description result");
            return;
        };
        if let Err(e) = result {
            self.reject(&peer, format!("{e:#}"));
            return;
        }
        c.remote_description_set = true;
        if c.role == Role::Responder {
            c.answer_pending = true;
        }
        let queued = std::mem::take(&mut c.pending_candidates);
        if let Some(transport) = c.transport.clone() {
            if !queued.is_empty() {
                debug!(peer = %peer, conn, count = queued.len(), "Flushing queued ICE candidates");
            }
            for candidate in queued {
                spawn_candidate(&self.events, &peer, conn, Arc::clone(&transport), candidate);
            }
        }
        self.advance(&peer);
    }

    fn on_local_description(
        &mut self,
        peer: PeerId,
        conn: ConnectionId,
        kind: DescriptionKind,
        result: anyhow::Result<String>,
    ) {
        let to = self.target(&peer);
        let Some(room) = self.room.clone() else {
            debug!(peer = %peer, conn, "Discarding local description, no room");
            return;
        };
        let Some(c) = live(&mut self.connections, &peer, conn) else {
            debug!(peer = %peer, conn, "Discarding stale local description");
            return;
        };
        let sdp = match result {
            Ok(sdp) => sdp,
            Err(e) => {
                self.reject(&peer, format!("{e:#}"));
                return;
            }
        };
        let msg = match kind {
            DescriptionKind::Offer => {
                c.awaiting_answer = true;
                info!(peer = %peer, conn, "Sending offer");
                ClientMessage::Offer { room, to, sdp }
            }
            DescriptionKind::Answer => {
                info!(peer = %peer, conn, "Sending answer");
                ClientMessage::Answer { room, to, sdp }
            }
        };
        self.send(msg);
    }

    fn on_local_candidate(&mut self, peer: PeerId, conn: ConnectionId, candidate: CandidateInit) {
        if self.membership != Membership::Joined
            || live(&mut self.connections, &peer, conn).is_none()
        {
            debug!(peer = %peer, conn, "Dropping local candidate for stale connection");
            return;
        }
        let Some(room) = self.room.clone() else { return };
        let to = self.target(&peer);
        self.send(ClientMessage::IceCandidate {
            room,
            to,
            candidate,
        });
    }

    fn on_transport_state(&mut self, peer: PeerId, conn: ConnectionId, state: TransportState) {
        let departed = self.departed.contains(&peer);
        let Some(c) = live(&mut self.connections, &peer, conn) else {
            if departed {
                debug!(peer = %peer, ?state, "Transport closed on departure");
            } else {
                debug!(peer = %peer, conn, ?state, "State change for stale connection");
            }
            return;
        };

        match state {
            TransportState::New | TransportState::Connecting => {
                debug!(peer = %peer, conn, ?state, "Transport state");
            }
            TransportState::Connected => {
                let previous = c.state;
                c.state = ConnectionState::Connected;
                let transport = c.transport.clone();
                let needs_stats = c.stats_task.is_none();
                match previous {
                    ConnectionState::Degraded => info!(peer = %peer, conn, "Connection recovered"),
                    ConnectionState::Connected => {}
                    _ => {
                        info!(peer = %peer, conn, "Peer connected");
                        self.publish(SessionUpdate::PeerConnected(peer.clone()));
                    }
                }
                if needs_stats
                    && let Some(transport) = transport
                    && let Some(task) = self.spawn_stats(&peer, transport)
                    && let Some(c) = self.connections.get_mut(&peer)
                {
                    c.stats_task = Some(task);
                }
            }
            TransportState::Disconnected => {
                if departed {
                    info!(peer = %peer, conn, "Transport decaying after departure, closing");
                    self.teardown(&peer);
                } else {
                    c.state = ConnectionState::Degraded;
                    warn!(peer = %peer, conn, "Transport disconnected, awaiting recovery");
                }
            }
            TransportState::Failed | TransportState::Closed => {
                if departed {
                    debug!(peer = %peer, conn, "Transport closed on departure");
                } else {
                    error!(conn, "{}", SessionError::TransportFailed { peer: peer.clone() });
                }
                self.teardown(&peer);
            }
        }
    }

    fn spawn_stats(&self, peer: &str, transport: Arc<dyn Transport>) -> Option<JoinHandle<()>> {
        if !self.options.adaptation.enabled {
            return None;
        }
        let stream = self.capture.active()?.clone();
        debug!(peer = %peer, "Starting stats loop");
        Some(
            StatsLoop {
                peer: peer.to_string(),
                transport,
                stream,
                adapter: self.adapter.clone(),
                interval: Duration::from_millis(self.options.adaptation.interval_ms),
                simulate: self.simulate.subscribe(),
                updates: self.updates.clone(),
            }
            .spawn(),
        )
    }

    fn on_peer_left(&mut self, sid: PeerId) {
        let peer = match self.options.mode {
            RoomMode::Pair => PAIR_PEER.to_string(),
            RoomMode::Mesh => sid.clone(),
        };
        info!(peer = %sid, "Participant left");
        self.departed.insert(peer.clone());
        self.publish(SessionUpdate::TileRemoved(peer.clone()));
        if let Some(mut conn) = self.connections.remove(&peer) {
            debug!(peer = %peer, conn = conn.id, "Closing connection of departed participant");
            conn.close();
        }
        // The remaining pair member offers to whoever joins next.
        if self.options.mode == RoomMode::Pair && !self.is_initiator {
            info!("Taking initiator role for the next participant");
            self.is_initiator = true;
        }
    }

    /// Abandon negotiation with one peer. Other connections are unaffected.
    fn reject(&mut self, peer: &str, reason: String) {
        let err = SessionError::NegotiationRejected {
            peer: peer.to_string(),
            reason,
        };
        warn!("{err}");
        self.teardown(peer);
    }

    fn teardown(&mut self, peer: &str) {
        let Some(mut conn) = self.connections.remove(peer) else { return };
        let had_tile = matches!(
            conn.state,
            ConnectionState::Connected | ConnectionState::Degraded
        );
        conn.close();
        if had_tile {
            self.publish(SessionUpdate::TileRemoved(peer.to_string()));
        }
    }

    fn summarize(&self) {
        let Some(room) = self.room.clone() else {
            warn!("Summary requested outside a room");
            return;
        };
        let Some(summarizer) = self.summarizer.clone() else {
            warn!("Summary requested but no summarizer configured");
            return;
        };
        let updates = self.updates.clone();
        tokio::spawn(async move {
            match summarizer.summarize(&room).await {
                Ok(summary) => {
                    let _ = updates.send(SessionUpdate::Summary(summary));
                }
                Err(e) => warn!(room = %room, "Summary unavailable: {e}"),
            }
        });
    }

    fn push_transcript(&self, text: String) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        match (&self.room, self.membership) {
            (Some(room), Membership::Joined) => self.send(ClientMessage::TranscriptText {
                room: room.clone(),
                text: text.to_string(),
                timestamp: ancillary::unix_seconds(),
            }),
            _ => debug!("Dropping transcript text, not joined"),
        }
    }
}
