//! Periodic transcription of the audio participants stream to the relay.
//! Each flush turns one room's buffered chunks into one transcript entry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshroom_protocol::TranscriptEntry;
use tokio::time::MissedTickBehavior;

use crate::relay::{self, RoomRegistry};

/// Speech-to-text engine. Receives a room's 16-bit mono PCM in capture order.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, room: &str, pcm: &[u8]) -> anyhow::Result<String>;
}

/// Reports that speech was heard without recognising it.
pub struct PlaceholderTranscriber;

#[async_trait]
impl Transcriber for PlaceholderTranscriber {
    async fn transcribe(&self, _room: &str, _pcm: &[u8]) -> anyhow::Result<String> {
        Ok("[speech detected]".to_string())
    }
}

/// Transcribe everything buffered since the last flush.
pub async fn flush_audio(registry: &RoomRegistry, transcriber: &dyn Transcriber) {
    for (room, mut chunks) in relay::take_pending_audio(registry).await {
        chunks.sort_by(|a, b| a.ts.total_cmp(&b.ts).then(a.seq.cmp(&b.seq)));
        let count = chunks.len();
        let pcm: Vec<u8> = chunks.into_iter().flat_map(|c| c.pcm).collect();

        match transcriber.transcribe(&room, &pcm).await {
            Ok(text) if text.trim().is_empty() => {
                tracing::debug!(%room, chunks = count, "Nothing recognised");
            }
            Ok(text) => {
                let entry = TranscriptEntry {
                    ts: relay::unix_seconds(),
                    text,
                };
                relay::publish_transcript(registry, &room, entry).await;
            }
            Err(e) => tracing::warn!(%room, chunks = count, "Transcription failed: {e:#}"),
        }
    }
}

/// Flush every `every` until the task is dropped.
pub async fn run_transcription(
    registry: RoomRegistry,
    transcriber: Arc<dyn Transcriber>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        flush_audio(&registry, transcriber.as_ref()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use meshroom_protocol::{ClientMessage, RoomMode, ServerMessage};
    use tokio::sync::mpsc;

    use crate::relay::{Participant, new_room_registry, queue_audio};

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl Transcriber for Recording {
        async fn transcribe(&self, _room: &str, pcm: &[u8]) -> anyhow::Result<String> {
            self.seen.lock().unwrap().push(pcm.to_vec());
            Ok(format!("{} bytes", pcm.len()))
        }
    }

    fn updates(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<TranscriptEntry> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let ServerMessage::TranscriptUpdate { entry, .. } = msg {
                out.push(entry);
            }
        }
        out
    }

    #[tokio::test]
    async fn chunks_are_joined_in_capture_order() {
        let registry = new_room_registry();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        relay::join(&registry, RoomMode::Mesh, "r1", "a", &a_tx).await;
        relay::join(&registry, RoomMode::Mesh, "r1", "b", &b_tx).await;

        queue_audio(&registry, "r1", "a", 2.0, vec![3, 4]).await;
        queue_audio(&registry, "r1", "b", 1.0, vec![1, 2]).await;

        let transcriber = Recording::default();
        flush_audio(&registry, &transcriber).await;

        assert_eq!(*transcriber.seen.lock().unwrap(), vec![vec![1, 2, 3, 4]]);
        for rx in [&mut a_rx, &mut b_rx] {
            let entries = updates(rx);
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].text, "4 bytes");
        }
        let rooms = registry.read().await;
        assert_eq!(rooms["r1"].transcript().len(), 1);
    }

    #[tokio::test]
    async fn empty_flush_publishes_nothing() {
        let registry = new_room_registry();
        let (tx, mut rx) = mpsc::unbounded_channel();
        relay::join(&registry, RoomMode::Mesh, "r1", "a", &tx).await;

        let transcriber = Recording::default();
        flush_audio(&registry, &transcriber).await;

        assert!(transcriber.seen.lock().unwrap().is_empty());
        assert!(updates(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn streamed_chunks_become_one_update_per_flush() {
        let registry = new_room_registry();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut speaker = Participant::new(Arc::clone(&registry), RoomMode::Mesh, tx);
        speaker
            .handle(ClientMessage::Join {
                room: "r1".to_string(),
            })
            .await;

        let flusher = tokio::spawn(run_transcription(
            Arc::clone(&registry),
            Arc::new(PlaceholderTranscriber),
            Duration::from_secs(3),
        ));

        for (data, timestamp) in [("AAA=", 10.0), ("AQI=", 10.5)] {
            speaker
                .handle(ClientMessage::AudioChunk {
                    room: "r1".to_string(),
                    data: data.to_string(),
                    timestamp,
                })
                .await;
        }
        assert!(updates(&mut rx).is_empty());

        tokio::time::sleep(Duration::from_millis(3100)).await;
        let entries = updates(&mut rx);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "[speech detected]");

        flusher.abort();
    }
}
