use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshroom_protocol::{NetworkMetrics, OperatingMode, PeerId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::capture::LocalStream;
use crate::error::{ServiceError, SessionError};
use crate::peer::{Transport, TransportStats};
use crate::session::SessionUpdate;

/// Used when outbound byte counters are unavailable.
pub const DEFAULT_BANDWIDTH_KBPS: f64 = 1000.0;

/// Decides an operating mode from network metrics.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn decide(&self, metrics: NetworkMetrics) -> Result<OperatingMode, ServiceError>;
}

/// Previous cumulative packet counters of one connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct LossWindow {
    prev_received: u64,
    prev_lost: u64,
}

impl LossWindow {
    /// Loss over the interval since the previous sample:
    /// `lost_delta / (received_delta + lost_delta)`. Counters that went
    /// backwards count as zero deltas.
    pub fn update(&mut self, received: u64, lost: u64) -> f64 {
        let received_delta = received.saturating_sub(self.prev_received);
        let lost_delta = lost.saturating_sub(self.prev_lost);
        self.prev_received = received;
        self.prev_lost = lost;

        let total = received_delta + lost_delta;
        if total == 0 {
            0.0
        } else {
            lost_delta as f64 / total as f64
        }
    }
}

/// Round-trip time in milliseconds: the current sample if present,
/// otherwise the cumulative average.
pub fn rtt_ms(stats: &TransportStats) -> f64 {
    stats.current_rtt.or(stats.cumulative_rtt).unwrap_or(0.0) * 1000.0
}

#[derive(Debug, Default)]
struct BandwidthWindow {
    prev_bytes: Option<u64>,
}

impl BandwidthWindow {
    fn update(&mut self, bytes_sent: Option<u64>, interval: Duration) -> f64 {
        let Some(bytes) = bytes_sent else {
            return DEFAULT_BANDWIDTH_KBPS;
        };
        let prev = self.prev_bytes.replace(bytes);
        let secs = interval.as_secs_f64();
        match prev {
            Some(prev) if bytes > prev && secs > 0.0 => (bytes - prev) as f64 * 8.0 / 1000.0 / secs,
            _ => DEFAULT_BANDWIDTH_KBPS,
        }
    }
}

pub struct StatsLoop {
    pub peer: PeerId,
    pub transport: Arc<dyn Transport>,
    pub stream: LocalStream,
    /// Without an adapter the loop only samples and logs.
    pub adapter: Option<Arc<dyn Adapter>>,
    pub interval: Duration,
    pub simulate: watch::Receiver<Option<OperatingMode>>,
    pub updates: mpsc::UnboundedSender<SessionUpdate>,
}

impl StatsLoop {
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Poll the transport on a fixed period and apply the adapter's decision
    /// to the local tracks. Returns once the transport stops reporting.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        // First tick completes immediately; the first sample is one period in.
        ticker.tick().await;

        let mut loss = LossWindow::default();
        let mut bandwidth = BandwidthWindow::default();

        loop {
            ticker.tick().await;

            let forced = *self.simulate.borrow();
            let mode = match forced {
                Some(mode) => mode,
                None => {
                    let stats = match self.transport.stats().await {
                        Ok(stats) => stats,
                        Err(e) => {
                            debug!(peer = %self.peer, "Stats loop stopping: {e:#}");
                            return;
                        }
                    };
                    let metrics = NetworkMetrics {
                        rtt: rtt_ms(&stats),
                        packet_loss: loss.update(stats.packets_received, stats.packets_lost),
                        bandwidth: bandwidth.update(stats.bytes_sent, self.interval),
                    };
                    debug!(
                        peer = %self.peer,
                        rtt_ms = format!("{:.0}", metrics.rtt),
                        loss_pct = format!("{:.1}", metrics.packet_loss * 100.0),
                        kbps = format!("{:.0}", metrics.bandwidth),
                        "Transport stats"
                    );
                    let Some(adapter) = &self.adapter else {
                        continue;
                    };
                    match adapter.decide(metrics).await {
                        Ok(mode) => mode,
                        Err(e) => {
                            warn!(peer = %self.peer, "{}", SessionError::AdaptationUnavailable(e));
                            continue;
                        }
                    }
                }
            };

            let previous = self.stream.mode();
            if self.stream.apply_mode(mode) {
                info!(peer = %self.peer, from = %previous, to = %mode, "Operating mode changed");
                let _ = self.updates.send(SessionUpdate::ModeChanged(mode));
            }
        }
    }
}
