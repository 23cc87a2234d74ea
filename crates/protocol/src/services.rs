//! Request and response bodies of the external collaborators
//! (`/adapt`, `/summarize`, `/turn-credentials`).

use serde::{Deserialize, Serialize};

/// Named policy deciding which local tracks are live and at what quality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperatingMode {
    #[default]
    Normal,
    DegradeVideo,
    AudioOnly,
    CaptionsOnly,
}

/// Cap applied to the outbound video track in `degrade-video`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraint {
    pub max_width: u32,
    pub max_height: u32,
    pub max_framerate: u32,
}

pub const DEGRADED_VIDEO: VideoConstraint = VideoConstraint {
    max_width: 640,
    max_height: 360,
    max_framerate: 15,
};

/// Effect of an operating mode on the local capture tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackPolicy {
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub video_constraint: Option<VideoConstraint>,
}

impl OperatingMode {
    pub fn policy(self) -> TrackPolicy {
        match self {
            OperatingMode::Normal => TrackPolicy {
                video_enabled: true,
                audio_enabled: true,
                video_constraint: None,
            },
            OperatingMode::DegradeVideo => TrackPolicy {
                video_enabled: true,
                audio_enabled: true,
                video_constraint: Some(DEGRADED_VIDEO),
            },
            OperatingMode::AudioOnly => TrackPolicy {
                video_enabled: false,
                audio_enabled: true,
                video_constraint: None,
            },
            // Disabled rather than stopped so a later `normal` recovers.
            OperatingMode::CaptionsOnly => TrackPolicy {
                video_enabled: false,
                audio_enabled: false,
                video_constraint: None,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperatingMode::Normal => "normal",
            OperatingMode::DegradeVideo => "degrade-video",
            OperatingMode::AudioOnly => "audio-only",
            OperatingMode::CaptionsOnly => "captions-only",
        }
    }
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown operating mode: {0}")]
pub struct UnknownMode(pub String);

impl std::str::FromStr for OperatingMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(OperatingMode::Normal),
            "degrade-video" => Ok(OperatingMode::DegradeVideo),
            "audio-only" => Ok(OperatingMode::AudioOnly),
            "captions-only" => Ok(OperatingMode::CaptionsOnly),
            other => Err(UnknownMode(other.to_string())),
        }
    }
}

/// Body of `POST /adapt`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    /// Round-trip time in milliseconds
    pub rtt: f64,
    /// Windowed loss ratio, 0.0 - 1.0
    #[serde(rename = "packetLoss")]
    pub packet_loss: f64,
    /// Estimated outbound bandwidth in kbps
    pub bandwidth: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptResponse {
    pub mode: OperatingMode,
}

/// Body of `POST /summarize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizeRequest {
    pub room: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizeResponse {
    pub result: SummaryResult,
}

/// The summarizer answers either `{"summary": "..."}` or a bare string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SummaryResult {
    Structured { summary: String },
    Text(String),
}

impl SummaryResult {
    pub fn into_text(self) -> String {
        match self {
            SummaryResult::Structured { summary } => summary,
            SummaryResult::Text(text) => text,
        }
    }
}

/// Body of `GET /turn-credentials`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnCredentials {
    pub uris: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_use_wire_names() {
        let resp: AdaptResponse = serde_json::from_str(r#"{"mode":"degrade-video"}"#).unwrap();
        assert_eq!(resp.mode, OperatingMode::DegradeVideo);
        let resp: AdaptResponse = serde_json::from_str(r#"{"mode":"captions-only"}"#).unwrap();
        assert_eq!(resp.mode, OperatingMode::CaptionsOnly);
        assert_eq!(
            serde_json::to_string(&OperatingMode::AudioOnly).unwrap(),
            r#""audio-only""#
        );
    }

    #[test]
    fn unknown_mode_rejected() {
        assert!(serde_json::from_str::<AdaptResponse>(r#"{"mode":"turbo"}"#).is_err());
        assert!("turbo".parse::<OperatingMode>().is_err());
        assert_eq!(
            "audio-only".parse::<OperatingMode>().unwrap(),
            OperatingMode::AudioOnly
        );
    }

    #[test]
    fn policy_table() {
        let normal = OperatingMode::Normal.policy();
        assert!(normal.video_enabled && normal.audio_enabled);
        assert!(normal.video_constraint.is_none());

        let degraded = OperatingMode::DegradeVideo.policy();
        assert!(degraded.video_enabled);
        assert_eq!(degraded.video_constraint, Some(DEGRADED_VIDEO));

        let audio_only = OperatingMode::AudioOnly.policy();
        assert!(!audio_only.video_enabled);
        assert!(audio_only.audio_enabled);

        let captions = OperatingMode::CaptionsOnly.policy();
        assert!(!captions.video_enabled && !captions.audio_enabled);
    }

    #[test]
    fn metrics_serialize_packet_loss_camel_case() {
        let metrics = NetworkMetrics {
            rtt: 120.0,
            packet_loss: 0.05,
            bandwidth: 800.0,
        };
        let json = serde_json::to_string(&metrics).unwrap();
        assert!(json.contains(r#""packetLoss":0.05"#));
        assert!(!json.contains("packet_loss"));
    }

    #[test]
    fn summary_accepts_both_shapes() {
        let structured: SummarizeResponse =
            serde_json::from_str(r#"{"result":{"summary":"We agreed."}}"#).unwrap();
        assert_eq!(structured.result.into_text(), "We agreed.");

        let text: SummarizeResponse =
            serde_json::from_str(r#"{"result":"Plain summary"}"#).unwrap();
        assert_eq!(text.result.into_text(), "Plain summary");
    }

    #[test]
    fn turn_credentials_shape() {
        let creds: TurnCredentials = serde_json::from_str(
            r#"{"uris":["turn:turn.example.com:3478"],"username":"u","credential":"c"}"#,
        )
        .unwrap();
        assert_eq!(creds.uris.len(), 1);
        assert_eq!(creds.username, "u");
    }
}
