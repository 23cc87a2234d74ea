//! Room relay: membership bookkeeping and message routing between the
//! participants of a room. Media never passes through here.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use meshroom_protocol::{ClientMessage, PeerId, RoomMode, ServerMessage, TranscriptEntry};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

/// Outbound queue of one connected participant.
pub type MemberTx = mpsc::UnboundedSender<ServerMessage>;

/// Decoded PCM waiting for the next transcription flush.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Capture time in unix seconds, as reported by the sender
    pub ts: f64,
    /// Arrival order within the room
    pub seq: u64,
    pub pcm: Vec<u8>,
}

#[derive(Default)]
pub struct Room {
    /// Members in join order.
    members: Vec<(PeerId, MemberTx)>,
    transcript: Vec<TranscriptEntry>,
    pending_audio: Vec<AudioChunk>,
    next_seq: u64,
}

impl Room {
    fn contains(&self, sid: &str) -> bool {
        self.members.iter().any(|(id, _)| id == sid)
    }

    fn get(&self, sid: &str) -> Option<&MemberTx> {
        self.members.iter().find(|(id, _)| id == sid).map(|(_, tx)| tx)
    }

    /// Send to every member except `sender`.
    fn broadcast(&self, sender: &str, msg: &ServerMessage) {
        for (id, tx) in &self.members {
            if id != sender {
                let _ = tx.send(msg.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    fn publish(&mut self, room_id: &str, entry: TranscriptEntry) {
        self.transcript.push(entry.clone());
        let update = ServerMessage::TranscriptUpdate {
            room: room_id.to_string(),
            entry,
        };
        for (_, tx) in &self.members {
            let _ = tx.send(update.clone());
        }
    }
}

/// Registry of live rooms keyed by room id.
pub type RoomRegistry = Arc<RwLock<HashMap<String, Room>>>;

pub fn new_room_registry() -> RoomRegistry {
    Arc::new(RwLock::new(HashMap::new()))
}

pub fn new_sid() -> PeerId {
    Uuid::new_v4().simple().to_string()
}

/// Admit `sid` to `room`. Returns whether it is now a member.
pub async fn join(
    registry: &RoomRegistry,
    mode: RoomMode,
    room_id: &str,
    sid: &str,
    tx: &MemberTx,
) -> bool {
    let mut rooms = registry.write().await;
    let room = rooms.entry(room_id.to_string()).or_default();
    if room.contains(sid) {
        tracing::debug!(room = %room_id, %sid, "Duplicate join ignored");
        return true;
    }

    match mode {
        RoomMode::Pair => match room.len() {
            0 => {
                room.members.push((sid.to_string(), tx.clone()));
                let _ = tx.send(ServerMessage::Created);
            }
            1 => {
                room.members.push((sid.to_string(), tx.clone()));
                for (_, member) in &room.members {
                    let _ = member.send(ServerMessage::Ready);
                }
            }
            count => {
                tracing::info!(room = %room_id, %sid, count, "Join refused, room full");
                let _ = tx.send(ServerMessage::Full);
                return false;
            }
        },
        RoomMode::Mesh => {
            let peers = room.members.iter().map(|(id, _)| id.clone()).collect();
            room.broadcast(
                sid,
                &ServerMessage::NewPeer {
                    peer: sid.to_string(),
                },
            );
            room.members.push((sid.to_string(), tx.clone()));
            let _ = tx.send(ServerMessage::ExistingPeers { peers });
        }
    }

    tracing::info!(room = %room_id, %sid, count = room.len(), "Joined");
    true
}

/// Remove `sid` from `room`, tell the rest, and drop the room once empty.
pub async fn leave(registry: &RoomRegistry, room_id: &str, sid: &str) {
    let mut rooms = registry.write().await;
    let Some(room) = rooms.get_mut(room_id) else {
        return;
    };
    let before = room.len();
    room.members.retain(|(id, _)| id != sid);
    if room.len() == before {
        return;
    }
    room.broadcast(
        sid,
        &ServerMessage::PeerLeft {
            sid: sid.to_string(),
        },
    );
    tracing::info!(room = %room_id, %sid, remaining = room.len(), "Left");
    if room.members.is_empty() {
        rooms.remove(room_id);
        tracing::debug!(room = %room_id, "Room removed");
    }
}

/// Deliver a negotiation message to `to`, or to the rest of the room.
/// Senders that are not members of the room are ignored.
pub async fn route(
    registry: &RoomRegistry,
    room_id: &str,
    sid: &str,
    to: Option<&str>,
    msg: ServerMessage,
) {
    let rooms = registry.read().await;
    let Some(room) = rooms.get(room_id).filter(|r| r.contains(sid)) else {
        tracing::warn!(
            room = %room_id,
            %sid,
            kind = msg.name(),
            "Sender is not in room, dropped"
        );
        return;
    };
    match to {
        Some(target) => match room.get(target) {
            Some(tx) => {
                let _ = tx.send(msg);
            }
            None => tracing::debug!(
                room = %room_id,
                %sid,
                to = %target,
                kind = msg.name(),
                "Target gone, dropped"
            ),
        },
        None => room.broadcast(sid, &msg),
    }
}

/// Append to the room transcript and send `transcript-update` to everyone.
pub async fn append_transcript(
    registry: &RoomRegistry,
    room_id: &str,
    sid: &str,
    entry: TranscriptEntry,
) {
    let mut rooms = registry.write().await;
    if let Some(room) = rooms.get_mut(room_id).filter(|r| r.contains(sid)) {
        room.publish(room_id, entry);
    }
}

/// Like [`append_transcript`] but on behalf of the relay itself. Rooms that
/// emptied in the meantime are skipped.
pub async fn publish_transcript(registry: &RoomRegistry, room_id: &str, entry: TranscriptEntry) {
    if let Some(room) = registry.write().await.get_mut(room_id) {
        room.publish(room_id, entry);
    }
}

/// Buffer a member's audio for the next transcription flush.
pub async fn queue_audio(registry: &RoomRegistry, room_id: &str, sid: &str, ts: f64, pcm: Vec<u8>) {
    let mut rooms = registry.write().await;
    let Some(room) = rooms.get_mut(room_id).filter(|r| r.contains(sid)) else {
        tracing::debug!(room = %room_id, %sid, "Audio from non-member dropped");
        return;
    };
    let seq = room.next_seq;
    room.next_seq += 1;
    room.pending_audio.push(AudioChunk { ts, seq, pcm });
}

/// Drain the audio buffered in every room since the last call.
pub async fn take_pending_audio(registry: &RoomRegistry) -> Vec<(String, Vec<AudioChunk>)> {
    registry
        .write()
        .await
        .iter_mut()
        .filter(|(_, room)| !room.pending_audio.is_empty())
        .map(|(id, room)| (id.clone(), std::mem::take(&mut room.pending_audio)))
        .collect()
}

pub(crate) fn unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Per-connection state of one participant.
pub struct Participant {
    sid: PeerId,
    tx: MemberTx,
    rooms: HashSet<String>,
    registry: RoomRegistry,
    mode: RoomMode,
}

impl Participant {
    pub fn new(registry: RoomRegistry, mode: RoomMode, tx: MemberTx) -> Self {
        Self {
            sid: new_sid(),
            tx,
            rooms: HashSet::new(),
            registry,
            mode,
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub async fn handle(&mut self, msg: ClientMessage) {
        let sid = self.sid.clone();
        let from = match self.mode {
            RoomMode::Mesh => Some(sid.clone()),
            RoomMode::Pair => None,
        };
        match msg {
            ClientMessage::Join { room } => {
                if join(&self.registry, self.mode, &room, &sid, &self.tx).await {
                    self.rooms.insert(room);
                }
            }
            ClientMessage::Leave { room } => {
                self.rooms.remove(&room);
                leave(&self.registry, &room, &sid).await;
            }
            ClientMessage::Offer { room, to, sdp } => {
                tracing::debug!(%room, %sid, "Offer");
                let msg = ServerMessage::Offer { from, sdp };
                route(&self.registry, &room, &sid, to.as_deref(), msg).await;
            }
            ClientMessage::Answer { room, to, sdp } => {
                tracing::debug!(%room, %sid, "Answer");
                let msg = ServerMessage::Answer { from, sdp };
                route(&self.registry, &room, &sid, to.as_deref(), msg).await;
            }
            ClientMessage::IceCandidate {
                room,
                to,
                candidate,
            } => {
                let msg = ServerMessage::IceCandidate { from, candidate };
                route(&self.registry, &room, &sid, to.as_deref(), msg).await;
            }
            ClientMessage::TranscriptText {
                room,
                text,
                timestamp,
            } => {
                let ts = if timestamp > 0.0 {
                    timestamp as u64
                } else {
                    unix_seconds()
                };
                let entry = TranscriptEntry { ts, text };
                append_transcript(&self.registry, &room, &sid, entry).await;
            }
            ClientMessage::AudioChunk {
                room,
                data,
                timestamp,
            } => match BASE64.decode(data.as_bytes()) {
                Ok(pcm) if pcm.is_empty() => {}
                Ok(pcm) => {
                    let ts = if timestamp > 0.0 {
                        timestamp
                    } else {
                        unix_seconds() as f64
                    };
                    queue_audio(&self.registry, &room, &sid, ts, pcm).await;
                }
                Err(e) => {
                    tracing::warn!(%room, %sid, "Invalid audio chunk: {e}");
                    let _ = self.tx.send(ServerMessage::Error {
                        message: format!("Invalid audio chunk: {e}"),
                    });
                }
            },
            ClientMessage::AttentionScore { room, score } if !score.is_finite() => {
                tracing::debug!(%room, %sid, "Non-finite attention score dropped");
            }
            ClientMessage::AttentionScore { room, score } => {
                let msg = ServerMessage::AttentionUpdate {
                    sid: sid.clone(),
                    score: score.clamp(0.0, 1.0),
                };
                route(&self.registry, &room, &sid, None, msg).await;
            }
            ClientMessage::Ping { time } => {
                let _ = self.tx.send(ServerMessage::Pong { time });
            }
        }
    }

    /// Leave every room this participant is still in.
    pub async fn disconnect(&mut self) {
        for room in std::mem::take(&mut self.rooms) {
            leave(&self.registry, &room, &self.sid).await;
        }
    }
}

/// Serve one participant's WebSocket until it closes.
pub async fn handle_ws(mut socket: WebSocket, registry: RoomRegistry, mode: RoomMode) {
    let (tx, mut outbound) = mpsc::unbounded_channel();
    let mut participant = Participant::new(registry, mode, tx);
    let sid = participant.sid().to_string();

    tracing::info!(%sid, "Participant connected");

    loop {
        tokio::select! {
            Some(msg) = outbound.recv() => {
                let json = match serde_json::to_string(&msg) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize relay message: {e}");
                        continue;
                    }
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    tracing::debug!(%sid, "Participant send failed");
                    break;
                }
            }
            Some(result) = socket.recv() => {
                match result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => participant.handle(msg).await,
                            Err(e) => {
                                tracing::warn!(%sid, "Invalid participant message: {e}");
                                let err = ServerMessage::Error {
                                    message: format!("Invalid message format: {e}"),
                                };
                                let json = serde_json::to_string(&err).unwrap_or_default();
                                let _ = socket.send(Message::Text(json.into())).await;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::debug!(%sid, "Participant closed the socket");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(%sid, "Participant WebSocket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            else => break,
        }
    }

    participant.disconnect().await;
    tracing::info!(%sid, "Participant disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshroom_protocol::CandidateInit;

    struct Client {
        participant: Participant,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    impl Client {
        fn new(registry: &RoomRegistry, mode: RoomMode) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                participant: Participant::new(Arc::clone(registry), mode, tx),
                rx,
            }
        }

        fn sid(&self) -> String {
            self.participant.sid().to_string()
        }

        async fn send(&mut self, msg: ClientMessage) {
            self.participant.handle(msg).await;
        }

        async fn join(&mut self, room: &str) {
            self.send(ClientMessage::Join {
                room: room.to_string(),
            })
            .await;
        }

        fn received(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(msg);
            }
            out
        }
    }

    fn offer(room: &str, to: Option<String>) -> ClientMessage {
        ClientMessage::Offer {
            room: room.to_string(),
            to,
            sdp: "v=0".to_string(),
        }
    }

    #[test]
    fn sids_are_simple_uuids() {
        let sid = new_sid();
        assert_eq!(sid.len(), 32);
        assert!(sid.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(sid, new_sid());
    }

    #[tokio::test]
    async fn pair_room_created_ready_full() {
        let registry = new_room_registry();
        let mut a = Client::new(&registry, RoomMode::Pair);
        let mut b = Client::new(&registry, RoomMode::Pair);
        let mut c = Client::new(&registry, RoomMode::Pair);

        a.join("r1").await;
        assert_eq!(a.received(), vec![ServerMessage::Created]);

        b.join("r1").await;
        assert_eq!(a.received(), vec![ServerMessage::Ready]);
        assert_eq!(b.received(), vec![ServerMessage::Ready]);

        c.join("r1").await;
        assert_eq!(c.received(), vec![ServerMessage::Full]);
        assert!(a.received().is_empty());
        assert_eq!(registry.read().await["r1"].len(), 2);

        // The refused participant cannot talk to the room.
        c.send(offer("r1", None)).await;
        assert!(a.received().is_empty());
        assert!(b.received().is_empty());
    }

    #[tokio::test]
    async fn pair_offer_broadcasts_without_sender() {
        let registry = new_room_registry();
        let mut a = Client::new(&registry, RoomMode::Pair);
        let mut b = Client::new(&registry, RoomMode::Pair);
        a.join("r1").await;
        b.join("r1").await;
        a.received();
        b.received();

        a.send(offer("r1", None)).await;
        assert_eq!(
            b.received(),
            vec![ServerMessage::Offer {
                from: None,
                sdp: "v=0".to_string()
            }]
        );
        assert!(a.received().is_empty());
    }

    #[tokio::test]
    async fn mesh_join_announces_both_ways() {
        let registry = new_room_registry();
        let mut a = Client::new(&registry, RoomMode::Mesh);
        let mut b = Client::new(&registry, RoomMode::Mesh);
        let mut c = Client::new(&registry, RoomMode::Mesh);

        a.join("r1").await;
        assert_eq!(a.received(), vec![ServerMessage::ExistingPeers { peers: vec![] }]);

        b.join("r1").await;
        assert_eq!(b.received(), vec![ServerMessage::ExistingPeers { peers: vec![a.sid()] }]);
        assert_eq!(a.received(), vec![ServerMessage::NewPeer { peer: b.sid() }]);

        c.join("r1").await;
        assert_eq!(
            c.received(),
            vec![ServerMessage::ExistingPeers {
                peers: vec![a.sid(), b.sid()]
            }]
        );
        assert_eq!(a.received(), vec![ServerMessage::NewPeer { peer: c.sid() }]);
        assert_eq!(b.received(), vec![ServerMessage::NewPeer { peer: c.sid() }]);
    }

    #[tokio::test]
    async fn mesh_addressed_messages_reach_only_target_with_sender() {
        let registry = new_room_registry();
        let mut a = Client::new(&registry, RoomMode::Mesh);
        let mut b = Client::new(&registry, RoomMode::Mesh);
        let mut c = Client::new(&registry, RoomMode::Mesh);
        for client in [&mut a, &mut b, &mut c] {
            client.join("r1").await;
        }
        a.received();
        b.received();
        c.received();

        c.send(ClientMessage::IceCandidate {
            room: "r1".to_string(),
            to: Some(a.sid()),
            candidate: CandidateInit {
                candidate: "candidate:1".to_string(),
                sdp_mid: None,
                sdp_mline_index: Some(0),
            },
        })
        .await;
        match a.received().as_slice() {
            [ServerMessage::IceCandidate { from, .. }] => assert_eq!(from, &Some(c.sid())),
            other => panic!("Expected one candidate, got {other:?}"),
        }
        assert!(b.received().is_empty());
    }

    #[tokio::test]
    async fn leave_notifies_rest_and_drops_empty_room() {
        let registry = new_room_registry();
        let mut a = Client::new(&registry, RoomMode::Mesh);
        let mut b = Client::new(&registry, RoomMode::Mesh);
        a.join("r1").await;
        b.join("r1").await;
        a.received();

        b.send(ClientMessage::Leave {
            room: "r1".to_string(),
        })
        .await;
        assert_eq!(a.received(), vec![ServerMessage::PeerLeft { sid: b.sid() }]);
        assert!(b.received().iter().all(|m| !matches!(m, ServerMessage::PeerLeft { .. })));

        a.send(ClientMessage::Leave {
            room: "r1".to_string(),
        })
        .await;
        assert!(registry.read().await.is_empty());
    }

    #[tokio::test]
    async fn disconnect_leaves_every_room() {
        let registry = new_room_registry();
        let mut a = Client::new(&registry, RoomMode::Mesh);
        let mut b = Client::new(&registry, RoomMode::Mesh);
        a.join("r1").await;
        a.join("r2").await;
        b.join("r1").await;
        b.received();

        a.participant.disconnect().await;
        assert_eq!(b.received(), vec![ServerMessage::PeerLeft { sid: a.sid() }]);
        let rooms = registry.read().await;
        assert!(!rooms.contains_key("r2"));
        assert_eq!(rooms["r1"].len(), 1);
    }

    #[tokio::test]
    async fn pair_room_reopens_after_departure() {
        let registry = new_room_registry();
        let mut a = Client::new(&registry, RoomMode::Pair);
        let mut b = Client::new(&registry, RoomMode::Pair);
        let mut c = Client::new(&registry, RoomMode::Pair);
        a.join("r1").await;
        b.join("r1").await;
        b.participant.disconnect().await;
        a.received();

        c.join("r1").await;
        assert_eq!(c.received(), vec![ServerMessage::Ready]);
        assert_eq!(a.received(), vec![ServerMessage::Ready]);
    }

    #[tokio::test]
    async fn transcript_is_kept_and_shared() {
        let registry = new_room_registry();
        let mut a = Client::new(&registry, RoomMode::Mesh);
        let mut b = Client::new(&registry, RoomMode::Mesh);
        a.join("r1").await;
        b.join("r1").await;
        a.received();
        b.received();

        a.send(ClientMessage::TranscriptText {
            room: "r1".to_string(),
            text: "hello".to_string(),
            timestamp: 1_700_000_000.5,
        })
        .await;
        let expected = ServerMessage::TranscriptUpdate {
            room: "r1".to_string(),
            entry: TranscriptEntry {
                ts: 1_700_000_000,
                text: "hello".to_string(),
            },
        };
        assert_eq!(a.received(), vec![expected.clone()]);
        assert_eq!(b.received(), vec![expected]);
        assert_eq!(registry.read().await["r1"].transcript().len(), 1);
    }

    #[tokio::test]
    async fn attention_ping_and_bad_audio() {
        let registry = new_room_registry();
        let mut a = Client::new(&registry, RoomMode::Mesh);
        let mut b = Client::new(&registry, RoomMode::Mesh);
        a.join("r1").await;
        b.join("r1").await;
        a.received();
        b.received();

        a.send(ClientMessage::AttentionScore {
            room: "r1".to_string(),
            score: 0.4,
        })
        .await;
        assert_eq!(
            b.received(),
            vec![ServerMessage::AttentionUpdate {
                sid: a.sid(),
                score: 0.4
            }]
        );

        a.send(ClientMessage::Ping { time: 3.0 }).await;
        assert_eq!(a.received(), vec![ServerMessage::Pong { time: 3.0 }]);

        a.send(ClientMessage::AudioChunk {
            room: "r1".to_string(),
            data: "AAA=".to_string(),
            timestamp: 1.0,
        })
        .await;
        assert!(a.received().is_empty());

        a.send(ClientMessage::AudioChunk {
            room: "r1".to_string(),
            data: "not base64!".to_string(),
            timestamp: 1.0,
        })
        .await;
        assert!(matches!(a.received().as_slice(), [ServerMessage::Error { .. }]));

        let pending = take_pending_audio(&registry).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, "r1");
        assert_eq!(pending[0].1.len(), 1);
        assert_eq!(pending[0].1[0].pcm, vec![0, 0]);
        assert!(take_pending_audio(&registry).await.is_empty());
    }

    #[tokio::test]
    async fn non_finite_attention_is_not_relayed() {
        let registry = new_room_registry();
        let mut a = Client::new(&registry, RoomMode::Mesh);
        let mut b = Client::new(&registry, RoomMode::Mesh);
        a.join("r1").await;
        b.join("r1").await;
        b.received();

        for score in [f64::NAN, f64::INFINITY] {
            a.send(ClientMessage::AttentionScore {
                room: "r1".to_string(),
                score,
            })
            .await;
        }
        assert!(b.received().is_empty());

        a.send(ClientMessage::AttentionScore {
            room: "r1".to_string(),
            score: 7.5,
        })
        .await;
        assert_eq!(
            b.received(),
            vec![ServerMessage::AttentionUpdate {
                sid: a.sid(),
                score: 1.0
            }]
        );
    }

    #[tokio::test]
    async fn audio_from_outside_the_room_is_not_buffered() {
        let registry = new_room_registry();
        let mut a = Client::new(&registry, RoomMode::Mesh);
        let mut outsider = Client::new(&registry, RoomMode::Mesh);
        a.join("r1").await;

        outsider
            .send(ClientMessage::AudioChunk {
                room: "r1".to_string(),
                data: "AAA=".to_string(),
                timestamp: 1.0,
            })
            .await;
        assert!(take_pending_audio(&registry).await.is_empty());
    }
}
