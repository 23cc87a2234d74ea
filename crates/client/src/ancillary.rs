//! Satellite producers fed by the local audio tap: chunked PCM for the
//! transcription collaborator and a smoothed energy score for attention.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use meshroom_protocol::config::{AttentionConfig, TranscriptionConfig};
use meshroom_protocol::ClientMessage;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::capture::{AudioFrame, LocalStream};
use crate::session::SessionUpdate;

pub(crate) fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Encode f32 samples as base64 16-bit little-endian PCM.
pub fn encode_pcm16(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    BASE64.encode(bytes)
}

/// Root-mean-square energy of a frame.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Exponential moving average.
#[derive(Debug, Clone, Copy)]
pub struct Ema {
    alpha: f32,
    value: f32,
}

impl Ema {
    pub fn new(alpha: f32) -> Self {
        Self { alpha, value: 0.0 }
    }

    pub fn update(&mut self, sample: f32) -> f32 {
        self.value = self.alpha * sample + (1.0 - self.alpha) * self.value;
        self.value
    }

    pub fn value(&self) -> f32 {
        self.value
    }
}

/// Map smoothed energy to 0..=1.
pub fn attention_score(energy: f32, noise_floor: f32, gain: f32) -> f64 {
    f64::from(((energy - noise_floor) * gain).clamp(0.0, 1.0))
}

/// Drain whatever frames are buffered on the tap. Returns false once the
/// capture has gone away.
fn drain(rx: &mut broadcast::Receiver<AudioFrame>, mut sink: impl FnMut(&[f32])) -> bool {
    loop {
        match rx.try_recv() {
            Ok(frame) => sink(&frame),
            Err(broadcast::error::TryRecvError::Empty) => return true,
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                debug!(skipped = n, "Audio tap lagged");
            }
            Err(broadcast::error::TryRecvError::Closed) => return false,
        }
    }
}

/// Send one `audio-chunk` every `chunk_ms` with the PCM captured since the
/// previous one.
pub fn spawn_transcription(
    room: String,
    stream: &LocalStream,
    config: &TranscriptionConfig,
    outbound: mpsc::UnboundedSender<ClientMessage>,
) -> JoinHandle<()> {
    let mut tap = stream.subscribe_audio();
    let period = Duration::from_millis(config.chunk_ms);
    tokio::spawn(async move {
        info!(room = %room, chunk_ms = period.as_millis() as u64, "Transcription stream started");
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        let mut buffer: Vec<f32> = Vec::new();
        loop {
            ticker.tick().await;
            let open = drain(&mut tap, |frame| buffer.extend_from_slice(frame));
            if !buffer.is_empty() {
                let data = encode_pcm16(&buffer);
                buffer.clear();
                let msg = ClientMessage::AudioChunk {
                    room: room.clone(),
                    data,
                    timestamp: unix_seconds(),
                };
                if outbound.send(msg).is_err() {
                    break;
                }
            }
            if !open {
                break;
            }
        }
    })
}

/// Sample audio energy every `sample_ms`, emit a score every `emit_ms` to the
/// relay and to local presentation.
pub fn spawn_attention(
    room: String,
    stream: &LocalStream,
    config: &AttentionConfig,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
) -> JoinHandle<()> {
    let mut tap = stream.subscribe_audio();
    let sample = Duration::from_millis(config.sample_ms);
    let emit = Duration::from_millis(config.emit_ms);
    let (noise_floor, gain) = (config.noise_floor as f32, config.gain as f32);
    let mut ema = Ema::new(config.smoothing as f32);
    tokio::spawn(async move {
        info!(room = %room, "Attention stream started");
        let mut sampler = tokio::time::interval(sample);
        let mut emitter = tokio::time::interval(emit);
        emitter.tick().await;
        loop {
            tokio::select! {
                _ = sampler.tick() => {
                    let mut latest: Option<f32> = None;
                    let open = drain(&mut tap, |frame| latest = Some(rms(frame)));
                    if let Some(energy) = latest {
                        ema.update(energy);
                    }
                    if !open {
                        break;
                    }
                }
                _ = emitter.tick() => {
                    let score = attention_score(ema.value(), noise_floor, gain);
                    let msg = ClientMessage::AttentionScore { room: room.clone(), score };
                    if outbound.send(msg).is_err() {
                        break;
                    }
                    let _ = updates.send(SessionUpdate::AttentionUpdate { peer: None, score });
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn pcm16_is_little_endian() {
        let encoded = encode_pcm16(&[0.0, 1.0, -1.0]);
        let bytes = BASE64.decode(encoded).unwrap();
        assert_eq!(bytes.len(), 6);
        assert_eq!(&bytes[0..2], &[0, 0]);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([bytes[4], bytes[5]]), -i16::MAX);
    }

    #[test]
    fn rms_of_constant_signal() {
        assert!((rms(&[0.5; 480]) - 0.5).abs() < 1e-6);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn ema_converges() {
        let mut ema = Ema::new(0.2);
        assert!((ema.update(1.0) - 0.2).abs() < 1e-6);
        assert!((ema.update(1.0) - 0.36).abs() < 1e-6);
        for _ in 0..100 {
            ema.update(1.0);
        }
        assert!((ema.value() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn score_subtracts_floor_and_clamps() {
        assert_eq!(attention_score(0.01, 0.02, 8.0), 0.0);
        assert!((attention_score(0.07, 0.02, 8.0) - 0.4).abs() < 1e-6);
        assert_eq!(attention_score(0.9, 0.02, 8.0), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn transcription_sends_chunks_and_skips_silence_gaps() {
        let stream = LocalStream::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = TranscriptionConfig {
            enabled: true,
            chunk_ms: 3000,
        };
        let handle = spawn_transcription("r1".to_string(), &stream, &config, tx);

        stream.publish_audio(Arc::from(vec![0.25f32; 960]));
        stream.publish_audio(Arc::from(vec![0.25f32; 960]));
        tokio::time::sleep(Duration::from_millis(3100)).await;

        match rx.try_recv().unwrap() {
            ClientMessage::AudioChunk { room, data, .. } => {
                assert_eq!(room, "r1");
                assert_eq!(BASE64.decode(data).unwrap().len(), 960 * 2 * 2);
            }
            other => panic!("Expected AudioChunk, got {other:?}"),
        }

        // Nothing captured in the next window: nothing sent.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn attention_emits_scores() {
        let stream = LocalStream::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (updates, mut updates_rx) = mpsc::unbounded_channel();
        let config = AttentionConfig {
            emit_ms: 1000,
            ..Default::default()
        };
        let handle = spawn_attention("r1".to_string(), &stream, &config, tx, updates);

        for _ in 0..20 {
            stream.publish_audio(Arc::from(vec![0.5f32; 960]));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        match rx.try_recv().unwrap() {
            ClientMessage::AttentionScore { room, score } => {
                assert_eq!(room, "r1");
                assert!(score > 0.0 && score <= 1.0);
            }
            other => panic!("Expected AttentionScore, got {other:?}"),
        }
        assert!(matches!(
            updates_rx.try_recv(),
            Ok(SessionUpdate::AttentionUpdate { peer: None, .. })
        ));
        handle.abort();
    }
}
