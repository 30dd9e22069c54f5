//! Connection and message metrics.
//!
//! The recorder accumulates counters between samples; the sampler drains
//! them on a fixed 60-second interval (no catch-up on overrun) and emits
//! interval sums/averages, not cumulative totals.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Aggregated metrics for one sampling interval.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSample {
    pub connections_current: u64,
    pub connections_peak: u64,
    pub connections_avg: f64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub latency_avg_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub latency_samples: usize,
}

#[derive(Debug, Default)]
pub struct MetricsRecorder {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    connections_current: AtomicU64,
    connections_peak: AtomicU64,
    conn_samples: Mutex<Vec<u64>>,
    latencies_ms: Mutex<Vec<f64>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent_bytes(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_latency_ms(&self, ms: f64) {
        if let Ok(mut latencies) = self.latencies_ms.lock() {
            latencies.push(ms);
        }
    }

    pub fn connection_opened(&self) {
        let current = self.connections_current.fetch_add(1, Ordering::Relaxed) + 1;
        self.connections_peak.fetch_max(current, Ordering::Relaxed);
        self.push_conn_sample(current);
    }

    pub fn connection_closed(&self) {
        let current = self
            .connections_current
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        self.push_conn_sample(current);
    }

    pub fn current_connections(&self) -> u64 {
        self.connections_current.load(Ordering::Relaxed)
    }

    fn push_conn_sample(&self, current: u64) {
        if let Ok(mut samples) = self.conn_samples.lock() {
            samples.push(current);
        }
    }

    /// Drain the interval's counters into one sample and reset them.
    pub fn sample(&self) -> MetricsSample {
        let current = self.connections_current.load(Ordering::Relaxed);
        let peak = self.connections_peak.swap(current, Ordering::Relaxed);

        let conn_samples: Vec<u64> = match self.conn_samples.lock() {
            Ok(mut samples) => std::mem::take(&mut *samples),
            Err(_) => Vec::new(),
        };
        let connections_avg = if conn_samples.is_empty() {
            current as f64
        } else {
            conn_samples.iter().sum::<u64>() as f64 / conn_samples.len() as f64
        };

        let mut latencies: Vec<f64> = match self.latencies_ms.lock() {
            Ok(mut latencies) => std::mem::take(&mut *latencies),
            Err(_) => Vec::new(),
        };
        latencies.sort_by(|a, b| a.total_cmp(b));
        let latency_avg_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };

        MetricsSample {
            connections_current: current,
            connections_peak: peak.max(current),
            connections_avg,
            messages_sent: self.messages_sent.swap(0, Ordering::Relaxed),
            messages_received: self.messages_received.swap(0, Ordering::Relaxed),
            bytes_sent: self.bytes_sent.swap(0, Ordering::Relaxed),
            bytes_received: self.bytes_received.swap(0, Ordering::Relaxed),
            latency_avg_ms,
            latency_p95_ms: percentile(&latencies, 0.95),
            latency_p99_ms: percentile(&latencies, 0.99),
            latency_samples: latencies.len(),
        }
    }
}

/// Index the sorted sample at `floor(n * q)`, clamped to the last element.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 * q).floor() as usize).min(sorted.len() - 1);
    sorted[idx]
}

/// Spawn the periodic sampler. Stops when `shutdown` changes; the final
/// partial interval is dropped, which is acceptable.
pub fn spawn_sampler(
    recorder: Arc<MetricsRecorder>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so samples cover a
        // full interval.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Metrics sampler stopping");
                    break;
                }
                _ = interval.tick() => {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        recorder.sample()
                    }));
                    match result {
                        Ok(sample) => {
                            info!(
                                connections = sample.connections_current,
                                connections_peak = sample.connections_peak,
                                connections_avg = sample.connections_avg,
                                messages_sent = sample.messages_sent,
                                messages_received = sample.messages_received,
                                bytes_sent = sample.bytes_sent,
                                bytes_received = sample.bytes_received,
                                latency_avg_ms = sample.latency_avg_ms,
                                latency_p95_ms = sample.latency_p95_ms,
                                latency_p99_ms = sample.latency_p99_ms,
                                "Metrics sample"
                            );
                        }
                        Err(_) => {
                            error!("Metrics sampling failed; continuing");
                        }
                    }
                }
            }
        }
    })
}
