use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{OperatingMode, RoomMode};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config TOML")]
    Parse(#[from] toml::de::Error),
    #[error("configuration has {0} error(s), fix the ERROR(s) above and restart")]
    Invalid(usize),
}

/// Top-level configuration shared by the client and the relay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshroomConfig {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub adaptation: AdaptationConfig,
    #[serde(default)]
    pub transcription: TranscriptionConfig,
    #[serde(default)]
    pub attention: AttentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Relay WebSocket URL
    #[serde(default = "default_signaling_url")]
    pub url: String,
    /// Retries after a failed or dropped connection before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Fixed delay between attempts in milliseconds
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// PEM certificate to pin for `wss://` relays
    pub tls_cert: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// How often buffered audio chunks are transcribed, per room.
    #[serde(default = "default_transcript_flush_ms")]
    pub transcript_flush_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Room membership semantics; relay and clients must agree.
    #[serde(default)]
    pub mode: RoomMode,
}

/// ICE/TURN server configuration used when the credential service is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN servers)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

/// HTTP collaborators (`/adapt`, `/summarize`, `/turn-credentials`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Base URL, e.g. "http://127.0.0.1:5000". None disables every collaborator.
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Stats poll period per connection in milliseconds
    #[serde(default = "default_stats_interval_ms")]
    pub interval_ms: u64,
    /// Force a mode regardless of measured metrics (testing aid)
    pub simulate: Option<OperatingMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_chunk_ms")]
    pub chunk_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// RMS sampling period in milliseconds
    #[serde(default = "default_sample_ms")]
    pub sample_ms: u64,
    /// Score emission period in milliseconds
    #[serde(default = "default_emit_ms")]
    pub emit_ms: u64,
    /// EMA smoothing factor applied to each new RMS sample
    #[serde(default = "default_smoothing")]
    pub smoothing: f64,
    /// Smoothed energy below this maps to a zero score
    #[serde(default = "default_noise_floor")]
    pub noise_floor: f64,
    #[serde(default = "default_gain")]
    pub gain: f64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: default_signaling_url(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            tls_cert: None,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            transcript_flush_ms: default_transcript_flush_ms(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_stats_interval_ms(),
            simulate: None,
        }
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_ms: default_chunk_ms(),
        }
    }
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_ms: default_sample_ms(),
            emit_ms: default_emit_ms(),
            smoothing: default_smoothing(),
            noise_floor: default_noise_floor(),
            gain: default_gain(),
        }
    }
}

impl MeshroomConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the process should not start) or
    /// "WARNING:" (advisory, the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- Signaling ---
        if !self.signaling.url.starts_with("ws://") && !self.signaling.url.starts_with("wss://") {
            issues.push(format!(
                "ERROR: signaling.url '{}' must start with 'ws://' or 'wss://'.",
                self.signaling.url
            ));
        }
        if self.signaling.max_reconnect_attempts == 0 {
            issues.push("ERROR: signaling.max_reconnect_attempts must be >= 1.".to_string());
        }
        if self.signaling.tls_cert.is_some() && self.signaling.url.starts_with("ws://") {
            issues.push(
                "WARNING: signaling.tls_cert is set but signaling.url is plain ws://; \
                 the certificate will not be used."
                    .to_string(),
            );
        }

        // --- Relay ---
        if self.relay.port == 0 {
            issues.push("ERROR: relay.port must be between 1 and 65535, got 0.".to_string());
        }
        if self.relay.transcript_flush_ms == 0 {
            issues.push("ERROR: relay.transcript_flush_ms must be > 0.".to_string());
        }

        // --- Adaptation ---
        if !(1000..=5000).contains(&self.adaptation.interval_ms) {
            issues.push(format!(
                "ERROR: adaptation.interval_ms must be between 1000 and 5000, got {}.",
                self.adaptation.interval_ms
            ));
        }
        if self.adaptation.simulate.is_some() {
            issues.push(format!(
                "WARNING: adaptation.simulate forces '{}' and bypasses network measurements.",
                self.adaptation.simulate.unwrap_or_default()
            ));
        }

        // --- Transcription ---
        if self.transcription.chunk_ms < 500 {
            issues.push(format!(
                "ERROR: transcription.chunk_ms must be at least 500, got {}.",
                self.transcription.chunk_ms
            ));
        }

        // --- Attention ---
        let smoothing = self.attention.smoothing;
        if !(smoothing > 0.0 && smoothing <= 1.0) {
            issues.push(format!(
                "ERROR: attention.smoothing must be in (0, 1], got {smoothing}."
            ));
        } else if !(0.18..=0.2).contains(&smoothing) {
            issues.push(format!(
                "WARNING: attention.smoothing is {smoothing}; scores are tuned for 0.18-0.2."
            ));
        }
        if self.attention.sample_ms == 0 || self.attention.emit_ms < self.attention.sample_ms {
            issues.push(format!(
                "ERROR: attention.emit_ms ({}) must be >= attention.sample_ms ({}) and both non-zero.",
                self.attention.emit_ms, self.attention.sample_ms
            ));
        }
        if self.attention.gain <= 0.0 {
            issues.push(format!(
                "ERROR: attention.gain must be positive, got {}.",
                self.attention.gain
            ));
        }

        // --- Services ---
        if let Some(base) = &self.services.base_url
            && !base.starts_with("http://")
            && !base.starts_with("https://")
        {
            issues.push(format!(
                "ERROR: services.base_url '{base}' must start with 'http://' or 'https://'."
            ));
        }

        // --- STUN URLs ---
        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }

        // --- TURN URLs ---
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'. \
                     Example: turn:turn.example.com:3478",
                    url
                ));
            }
        }
        if !self.ice.turn_urls.is_empty()
            && (self.ice.turn_username.is_none() || self.ice.turn_credential.is_none())
        {
            issues.push(
                "WARNING: ice.turn_urls is set without turn_username/turn_credential.".to_string(),
            );
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }

    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&contents)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Log every validation issue. Fails when any of them is an `ERROR:`.
    pub fn check(&self) -> Result<(), ConfigError> {
        let Err(issues) = self.validate() else {
            return Ok(());
        };
        let mut errors = 0;
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                errors += 1;
                tracing::error!("{issue}");
            } else {
                tracing::warn!("{issue}");
            }
        }
        match errors {
            0 => Ok(()),
            n => Err(ConfigError::Invalid(n)),
        }
    }
}

fn default_signaling_url() -> String {
    "ws://127.0.0.1:5000/ws".to_string()
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_transcript_flush_ms() -> u64 {
    3000
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5000
}
fn default_request_timeout_ms() -> u64 {
    5000
}
fn default_stats_interval_ms() -> u64 {
    2000
}
fn default_chunk_ms() -> u64 {
    3000
}
fn default_sample_ms() -> u64 {
    100
}
fn default_emit_ms() -> u64 {
    5000
}
fn default_smoothing() -> f64 {
    0.2
}
fn default_noise_floor() -> f64 {
    0.02
}
fn default_gain() -> f64 {
    8.0
}
fn default_true() -> bool {
    true
}
pub fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}
