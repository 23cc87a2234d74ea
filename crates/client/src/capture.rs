//! Local audio/video capture: the tracks every connection sends, and the
//! PCM tap the transcription and attention producers read.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use meshroom_protocol::{OperatingMode, VideoConstraint};
use tokio::sync::broadcast;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::CaptureError;

/// Sample rate of the PCM tap.
pub const TAP_SAMPLE_RATE: u32 = 48_000;
/// 20ms of mono audio at [`TAP_SAMPLE_RATE`].
pub const TAP_FRAME_SAMPLES: usize = 960;

/// One frame of mono f32 PCM from the local microphone.
pub type AudioFrame = Arc<[f32]>;

static STREAM_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A local media track. Shared by reference with every connection that sends it.
#[derive(Debug)]
pub struct LocalTrack {
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    constraint: Mutex<Option<VideoConstraint>>,
    rtc: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    fn new(kind: TrackKind) -> Self {
        let capability = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let id = match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        Self {
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            constraint: Mutex::new(None),
            rtc: Arc::new(TrackLocalStaticSample::new(
                capability,
                id.to_string(),
                "meshroom".to_string(),
            )),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// A stopped track never reports enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed) && !self.is_stopped()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn constraint(&self) -> Option<VideoConstraint> {
        *self.constraint.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_constraint(&self, constraint: Option<VideoConstraint>) {
        *self.constraint.lock().unwrap_or_else(|e| e.into_inner()) = constraint;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    /// The webrtc track sources write encoded samples into.
    pub fn rtc(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc)
    }
}

#[derive(Debug)]
struct StreamInner {
    id: u64,
    audio: Arc<LocalTrack>,
    video: Arc<LocalTrack>,
    tap: broadcast::Sender<AudioFrame>,
    mode: Mutex<OperatingMode>,
    stopped: AtomicBool,
}

/// Handle to an active capture. Clones refer to the same capture.
#[derive(Clone, Debug)]
pub struct LocalStream {
    inner: Arc<StreamInner>,
}

impl LocalStream {
    pub fn new() -> Self {
        let (tap, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(StreamInner {
                id: STREAM_ID.fetch_add(1, Ordering::Relaxed) + 1,
                audio: Arc::new(LocalTrack::new(TrackKind::Audio)),
                video: Arc::new(LocalTrack::new(TrackKind::Video)),
                tap,
                mode: Mutex::new(OperatingMode::Normal),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn audio(&self) -> &Arc<LocalTrack> {
        &self.inner.audio
    }

    pub fn video(&self) -> &Arc<LocalTrack> {
        &self.inner.video
    }

    pub fn tracks(&self) -> [Arc<LocalTrack>; 2] {
        [Arc::clone(&self.inner.audio), Arc::clone(&self.inner.video)]
    }

    pub fn subscribe_audio(&self) -> broadcast::Receiver<AudioFrame> {
        self.inner.tap.subscribe()
    }

    /// Called by capture sources for every captured PCM frame. Frames are
    /// dropped while the audio track is disabled or stopped.
    pub fn publish_audio(&self, frame: AudioFrame) {
        if self.inner.audio.is_enabled() {
            let _ = self.inner.tap.send(frame);
        }
    }

    pub fn mode(&self) -> OperatingMode {
        *self.inner.mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply an operating mode to the tracks. Returns true if the mode changed.
    pub fn apply_mode(&self, mode: OperatingMode) -> bool {
        if self.is_stopped() {
            return false;
        }
        let policy = mode.policy();
        self.inner.video.set_enabled(policy.video_enabled);
        self.inner.video.set_constraint(policy.video_constraint);
        self.inner.audio.set_enabled(policy.audio_enabled);

        let mut current = self.inner.mode.lock().unwrap_or_else(|e| e.into_inner());
        let changed = *current != mode;
        *current = mode;
        changed
    }

    /// Stop every track. Idempotent: returns false if already stopped.
    pub fn stop(&self) -> bool {
        if self.inner.stopped.swap(true, Ordering::Relaxed) {
            return false;
        }
        self.inner.audio.stop();
        self.inner.video.stop();
        debug!(stream = self.id(), "Local capture stopped");
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Relaxed)
    }

    fn downgrade(&self) -> Weak<StreamInner> {
        Arc::downgrade(&self.inner)
    }
}

impl Default for LocalStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Platform capture: yields a stream or fails with a permission/device error.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn open(&self) -> Result<LocalStream, CaptureError>;
}

/// Device-less source for headless participants: tracks carry no encoded
/// media and the tap produces silence every 20ms.
pub struct SilentSource;

#[async_trait]
impl CaptureSource for SilentSource {
    async fn open(&self) -> Result<LocalStream, CaptureError> {
        let stream = LocalStream::new();
        let weak = stream.downgrade();
        tokio::spawn(async move {
            let silence: AudioFrame = vec![0.0f32; TAP_FRAME_SAMPLES].into();
            let mut ticker = tokio::time::interval(Duration::from_millis(20));
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let stream = LocalStream { inner };
                if stream.is_stopped() {
                    break;
                }
                stream.publish_audio(Arc::clone(&silence));
            }
        });
        Ok(stream)
    }
}

/// Owns the zero-or-one active capture of a session.
pub struct CaptureManager {
    source: Arc<dyn CaptureSource>,
    active: Option<LocalStream>,
}

impl CaptureManager {
    pub fn new(source: Arc<dyn CaptureSource>) -> Self {
        Self {
            source,
            active: None,
        }
    }

    pub fn source(&self) -> Arc<dyn CaptureSource> {
        Arc::clone(&self.source)
    }

    pub fn active(&self) -> Option<&LocalStream> {
        self.active.as_ref().filter(|s| !s.is_stopped())
    }

    /// Open capture, or return the active stream without prompting again.
    pub async fn acquire(&mut self) -> Result<LocalStream, CaptureError> {
        if let Some(stream) = self.active() {
            return Ok(stream.clone());
        }
        let stream = self.source.open().await?;
        info!(stream = stream.id(), "Local capture acquired");
        self.active = Some(stream.clone());
        Ok(stream)
    }

    /// Install a stream that was opened off the session task. If a stream is
    /// already active the new one is stopped and the active one returned.
    pub fn adopt(&mut self, stream: LocalStream) -> LocalStream {
        if let Some(existing) = self.active() {
            if existing.id() != stream.id() {
                stream.stop();
            }
            return existing.clone();
        }
        info!(stream = stream.id(), "Local capture acquired");
        self.active = Some(stream.clone());
        stream
    }

    /// Stop the active capture. Safe to call when nothing is active.
    pub fn release(&mut self) {
        if let Some(stream) = self.active.take()
            && stream.stop()
        {
            info!(stream = stream.id(), "Local capture released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSource {
        opens: AtomicUsize,
    }

    #[async_trait]
    impl CaptureSource for CountingSource {
        async fn open(&self) -> Result<LocalStream, CaptureError> {
            self.opens.fetch_add(1, Ordering::Relaxed);
            Ok(LocalStream::new())
        }
    }

    struct DeniedSource;

    #[async_trait]
    impl CaptureSource for DeniedSource {
        async fn open(&self) -> Result<LocalStream, CaptureError> {
            Err(CaptureError::PermissionDenied)
        }
    }

    #[tokio::test]
    async fn acquire_is_memoized() {
        let source = Arc::new(CountingSource {
            opens: AtomicUsize::new(0),
        });
        let mut manager = CaptureManager::new(source.clone());
        let first = manager.acquire().await.unwrap();
        let second = manager.acquire().await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(source.opens.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn acquire_after_release_opens_fresh_stream() {
        let source = Arc::new(CountingSource {
            opens: AtomicUsize::new(0),
        });
        let mut manager = CaptureManager::new(source.clone());
        let first = manager.acquire().await.unwrap();
        manager.release();
        assert!(first.is_stopped());

        let second = manager.acquire().await.unwrap();
        assert_ne!(first.id(), second.id());
        assert!(!second.is_stopped());
        assert_eq!(source.opens.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn permission_denied_leaves_nothing_active() {
        let mut manager = CaptureManager::new(Arc::new(DeniedSource));
        assert_eq!(
            manager.acquire().await.unwrap_err(),
            CaptureError::PermissionDenied
        );
        assert!(manager.active().is_none());
    }

    #[test]
    fn release_twice_is_a_no_op() {
        let mut manager = CaptureManager::new(Arc::new(SilentSource));
        let stream = manager.adopt(LocalStream::new());
        manager.release();
        assert!(stream.is_stopped());
        manager.release();
        assert!(stream.is_stopped());
        assert!(manager.active().is_none());

        // Stopping the stream handle directly is idempotent too.
        assert!(!stream.stop());
    }

    #[test]
    fn adopt_keeps_existing_stream() {
        let mut manager = CaptureManager::new(Arc::new(SilentSource));
        let first = manager.adopt(LocalStream::new());
        let late = LocalStream::new();
        let kept = manager.adopt(late.clone());
        assert_eq!(kept.id(), first.id());
        assert!(late.is_stopped());
        assert!(!first.is_stopped());
    }

    #[test]
    fn audio_only_disables_video_and_normal_restores_it() {
        let stream = LocalStream::new();
        assert!(stream.apply_mode(OperatingMode::AudioOnly));
        assert!(!stream.video().is_enabled());
        assert!(stream.audio().is_enabled());

        assert!(stream.apply_mode(OperatingMode::Normal));
        assert!(stream.video().is_enabled());
        assert!(stream.audio().is_enabled());
        assert!(!stream.apply_mode(OperatingMode::Normal));
    }

    #[test]
    fn degrade_video_sets_constraint() {
        let stream = LocalStream::new();
        stream.apply_mode(OperatingMode::DegradeVideo);
        assert!(stream.video().is_enabled());
        assert_eq!(
            stream.video().constraint(),
            Some(meshroom_protocol::DEGRADED_VIDEO)
        );
        stream.apply_mode(OperatingMode::Normal);
        assert!(stream.video().constraint().is_none());
    }

    #[test]
    fn stopped_stream_ignores_modes() {
        let stream = LocalStream::new();
        stream.stop();
        assert!(!stream.apply_mode(OperatingMode::AudioOnly));
        assert!(!stream.audio().is_enabled());
        assert!(!stream.video().is_enabled());
    }

    #[tokio::test]
    async fn tap_drops_frames_while_audio_disabled() {
        let stream = LocalStream::new();
        let mut rx = stream.subscribe_audio();
        stream.apply_mode(OperatingMode::CaptionsOnly);
        stream.publish_audio(vec![0.5f32; 4].into());
        stream.apply_mode(OperatingMode::Normal);
        stream.publish_audio(vec![0.25f32; 4].into());
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame[0], 0.25);
    }
}
