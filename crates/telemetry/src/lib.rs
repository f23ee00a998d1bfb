//! Vigil telemetry: deduplicating aggregate of admission outcomes, flushed to
//! an external sink in batches.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vigil_core::ClusterRequestMetadata;

/// Distinct keys that trigger a flush from inside `record`.
pub const FLUSH_THRESHOLD: usize = 500;
/// Period of the unconditional background flush.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("telemetry transport: {0}")]
    Transport(String),
    #[error("telemetry send timed out after {0:?}")]
    Timeout(Duration),
}

/// Receiver of flushed batches (the backend, in production).
#[async_trait::async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn send_batch(&self, batch: Vec<ClusterRequestMetadata>) -> Result<(), SinkError>;
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub threshold: usize,
    pub send_timeout: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self { Self { threshold: FLUSH_THRESHOLD, send_timeout: Duration::from_secs(10) } }
}

/// Map from canonical key to record. Keys are unique; order is irrelevant.
#[derive(Default)]
struct Aggregate {
    map: FxHashMap<String, ClusterRequestMetadata>,
}

impl Aggregate {
    fn upsert(&mut self, key: String, mut rec: ClusterRequestMetadata) {
        match self.map.get_mut(&key) {
            Some(existing) => existing.occurrences = existing.occurrences.saturating_add(1),
            None => {
                rec.occurrences = 1;
                self.map.insert(key, rec);
            }
        }
    }

    fn drain(&mut self) -> Vec<ClusterRequestMetadata> {
        std::mem::take(&mut self.map).into_values().collect()
    }
}

pub struct TelemetryAggregator {
    inner: Mutex<Aggregate>,
    sink: Arc<dyn TelemetrySink>,
    cfg: AggregatorConfig,
    flushes: AtomicU64,
}

impl TelemetryAggregator {
    pub fn new(sink: Arc<dyn TelemetrySink>, cfg: AggregatorConfig) -> Self {
        Self { inner: Mutex::new(Aggregate::default()), sink, cfg, flushes: AtomicU64::new(0) }
    }

    fn lock(&self) -> MutexGuard<'_, Aggregate> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert the record or bump `occurrences` on its existing entry.
    ///
    /// When the aggregate reaches the threshold, the whole map is swapped out
    /// under the same lock and shipped on a spawned task; the returned handle
    /// lets callers await that send. Must be called inside a tokio runtime.
    pub fn record(&self, rec: ClusterRequestMetadata) -> Result<Option<JoinHandle<()>>, serde_json::Error> {
        let key = rec.canonical_key()?;
        let (size, batch) = {
            let mut agg = self.lock();
            agg.upsert(key, rec);
            let size = agg.map.len();
            let batch = if size >= self.cfg.threshold { Some(agg.drain()) } else { None };
            (size, batch)
        };
        counter!("telemetry_records_total", 1u64);
        match batch {
            Some(batch) => {
                debug!(size, "telemetry: threshold reached, flushing");
                gauge!("telemetry_aggregate_size", 0.0);
                Ok(Some(self.dispatch(batch)))
            }
            None => {
                gauge!("telemetry_aggregate_size", size as f64);
                Ok(None)
            }
        }
    }

    /// Swap the aggregate for an empty one and send its previous contents.
    /// Send failures are logged and dropped. Returns the number of records sent.
    pub async fn flush(&self) -> usize {
        let batch = self.lock().drain();
        gauge!("telemetry_aggregate_size", 0.0);
        if batch.is_empty() {
            return 0;
        }
        let n = batch.len();
        self.flushes.fetch_add(1, Ordering::Relaxed);
        send(self.sink.clone(), batch, self.cfg.send_timeout).await;
        n
    }

    fn dispatch(&self, batch: Vec<ClusterRequestMetadata>) -> JoinHandle<()> {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(send(self.sink.clone(), batch, self.cfg.send_timeout))
    }

    pub fn len(&self) -> usize { self.lock().map.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Number of batches handed to the sink so far (empty flushes excluded).
    pub fn flush_count(&self) -> u64 { self.flushes.load(Ordering::Relaxed) }

    /// Copy of the current records, for inspection.
    pub fn snapshot(&self) -> Vec<ClusterRequestMetadata> {
        self.lock().map.values().cloned().collect()
    }
}

async fn send(sink: Arc<dyn TelemetrySink>, batch: Vec<ClusterRequestMetadata>, limit: Duration) {
    let t0 = Instant::now();
    let n = batch.len();
    let res = match tokio::time::timeout(limit, sink.send_batch(batch)).await {
        Ok(r) => r,
        Err(_) => Err(SinkError::Timeout(limit)),
    };
    histogram!("telemetry_flush_ms", t0.elapsed().as_secs_f64() * 1000.0);
    match res {
        Ok(()) => {
            counter!("telemetry_flush_total", 1u64);
            info!(records = n, took_ms = %t0.elapsed().as_millis(), "telemetry: batch sent");
        }
        Err(e) => {
            counter!("telemetry_flush_errors_total", 1u64);
            warn!(records = n, error = %e, "telemetry: batch dropped");
        }
    }
}

/// Sink that discards batches; used when no backend is configured.
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait::async_trait]
impl TelemetrySink for NullSink {
    async fn send_batch(&self, batch: Vec<ClusterRequestMetadata>) -> Result<(), SinkError> {
        debug!(records = batch.len(), "telemetry: no sink configured, discarding batch");
        Ok(())
    }
}
