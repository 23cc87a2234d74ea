use serde::{Deserialize, Serialize};

/// Relay-assigned participant identifier.
pub type PeerId = String;

/// ICE candidate as exchanged between participants. Field names follow
/// `RTCIceCandidateInit` so browser participants interoperate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(default, alias = "sdp_mid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        alias = "sdp_mline_index",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// One line of a room transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// Unix seconds
    pub ts: u64,
    pub text: String,
}

/// Membership semantics of a room.
///
/// `Pair` rooms admit two participants and assign the initiator role through
/// `created`/`ready`. `Mesh` rooms admit any number and announce arrivals with
/// `existing-peers`/`new-peer`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomMode {
    Pair,
    #[default]
    Mesh,
}

/// Events sent by a participant to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Join {
        room: String,
    },
    Leave {
        room: String,
    },
    /// SDP offer. `to` is set in mesh rooms; pair rooms broadcast.
    Offer {
        room: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        sdp: String,
    },
    Answer {
        room: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        sdp: String,
    },
    IceCandidate {
        room: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        candidate: CandidateInit,
    },
    /// Base64 16-bit LE mono PCM captured for transcription.
    AudioChunk {
        room: String,
        data: String,
        timestamp: f64,
    },
    /// Utterance recognised locally.
    TranscriptText {
        room: String,
        text: String,
        timestamp: f64,
    },
    AttentionScore {
        room: String,
        score: f64,
    },
    Ping {
        time: f64,
    },
}

/// Events sent by the relay to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Pair room: first participant, will initiate once the peer arrives.
    Created,
    /// Pair room: both participants present.
    Ready,
    /// Pair room: already has two participants, join refused.
    Full,
    /// Mesh room: join accepted, these participants were already present.
    ExistingPeers {
        peers: Vec<PeerId>,
    },
    /// Mesh room: a participant arrived after us.
    NewPeer {
        peer: PeerId,
    },
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        sdp: String,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        sdp: String,
    },
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        candidate: CandidateInit,
    },
    PeerLeft {
        sid: PeerId,
    },
    TranscriptUpdate {
        room: String,
        entry: TranscriptEntry,
    },
    AttentionUpdate {
        sid: PeerId,
        score: f64,
    },
    Pong {
        time: f64,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// Whether this event drives negotiation or membership of a joined room.
    /// Such events are dropped while the receiver is not joined.
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            ServerMessage::Offer { .. }
                | ServerMessage::Answer { .. }
                | ServerMessage::IceCandidate { .. }
                | ServerMessage::NewPeer { .. }
                | ServerMessage::PeerLeft { .. }
        )
    }

    /// Wire name of the event, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ServerMessage::Created => "created",
            ServerMessage::Ready => "ready",
            ServerMessage::Full => "full",
            ServerMessage::ExistingPeers { .. } => "existing-peers",
            ServerMessage::NewPeer { .. } => "new-peer",
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::Answer { .. } => "answer",
            ServerMessage::IceCandidate { .. } => "ice-candidate",
            ServerMessage::PeerLeft { .. } => "peer-left",
            ServerMessage::TranscriptUpdate { .. } => "transcript-update",
            ServerMessage::AttentionUpdate { .. } => "attention-update",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }
}
