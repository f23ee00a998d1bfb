#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use vigil_core::ClusterRequestMetadata;
use vigil_telemetry::{AggregatorConfig, SinkError, TelemetryAggregator, TelemetrySink};

struct RecordingSink {
    tx: mpsc::UnboundedSender<Vec<ClusterRequestMetadata>>,
    fail: bool,
}

#[async_trait::async_trait]
impl TelemetrySink for RecordingSink {
    async fn send_batch(&self, batch: Vec<ClusterRequestMetadata>) -> Result<(), SinkError> {
        let _ = self.tx.send(batch);
        if self.fail {
            return Err(SinkError::Transport("connection refused".into()));
        }
        Ok(())
    }
}

fn aggregator(fail: bool) -> (TelemetryAggregator, mpsc::UnboundedReceiver<Vec<ClusterRequestMetadata>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let agg = TelemetryAggregator::new(Arc::new(RecordingSink { tx, fail }), AggregatorConfig::default());
    (agg, rx)
}

fn rec(name: &str) -> ClusterRequestMetadata {
    ClusterRequestMetadata {
        cluster_uuid: "c-1".into(),
        resource_kind: "Deployment".into(),
        resource_name: name.into(),
        managers: vec!["helm".into()],
        allowed: true,
        cli_evaluation_id: -1,
        ..Default::default()
    }
}

#[tokio::test]
async fn identical_records_collapse() {
    let (agg, _rx) = aggregator(false);
    assert!(agg.record(rec("web")).unwrap().is_none());
    assert!(agg.record(rec("web")).unwrap().is_none());
    assert_eq!(agg.len(), 1);
    assert_eq!(agg.snapshot()[0].occurrences, 2);

    agg.record(rec("api")).unwrap();
    assert_eq!(agg.len(), 2);
}

#[tokio::test]
async fn incoming_occurrences_do_not_split_keys() {
    let (agg, _rx) = aggregator(false);
    let mut r = rec("web");
    r.occurrences = 9;
    agg.record(r).unwrap();
    agg.record(rec("web")).unwrap();
    let snap = agg.snapshot();
    assert_eq!(snap.len(), 1);
    assert_eq!(snap[0].occurrences, 2);
}

#[tokio::test]
async fn flush_empties_and_restarts_counts() {
    let (agg, mut rx) = aggregator(false);
    agg.record(rec("web")).unwrap();
    agg.record(rec("web")).unwrap();
    assert_eq!(agg.flush().await, 1);
    let batch = rx.recv().await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].occurrences, 2);
    assert!(agg.is_empty());

    agg.record(rec("web")).unwrap();
    assert_eq!(agg.snapshot()[0].occurrences, 1);
}

#[tokio::test]
async fn empty_flush_sends_nothing() {
    let (agg, mut rx) = aggregator(false);
    assert_eq!(agg.flush().await, 0);
    assert_eq!(agg.flush_count(), 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn threshold_triggers_one_batch() {
    let (agg, mut rx) = aggregator(false);
    for i in 0..499 {
        assert!(agg.record(rec(&format!("obj-{i}"))).unwrap().is_none());
    }
    assert_eq!(agg.len(), 499);

    let handle = agg.record(rec("obj-499")).unwrap().expect("threshold flush");
    assert_eq!(agg.len(), 0);
    handle.await.unwrap();

    let batch = rx.recv().await.unwrap();
    assert_eq!(batch.len(), 500);
    assert!(rx.try_recv().is_err());

    agg.record(rec("obj-500")).unwrap();
    assert_eq!(agg.len(), 1);
    assert_eq!(agg.flush_count(), 1);
}

#[tokio::test]
async fn sink_failure_is_dropped_not_retried() {
    let (agg, mut rx) = aggregator(true);
    agg.record(rec("web")).unwrap();
    assert_eq!(agg.flush().await, 1);
    assert_eq!(rx.recv().await.unwrap().len(), 1);
    assert!(agg.is_empty());
    assert_eq!(agg.flush().await, 0);
    assert!(rx.try_recv().is_err());
}

struct StuckSink;

#[async_trait::async_trait]
impl TelemetrySink for StuckSink {
    async fn send_batch(&self, _batch: Vec<ClusterRequestMetadata>) -> Result<(), SinkError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn slow_sink_is_bounded_by_timeout() {
    let cfg = AggregatorConfig { send_timeout: Duration::from_millis(50), ..Default::default() };
    let agg = TelemetryAggregator::new(Arc::new(StuckSink), cfg);
    agg.record(rec("web")).unwrap();
    assert_eq!(agg.flush().await, 1);
    assert!(agg.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_records_and_flushes_keep_every_occurrence() {
    const WRITERS: usize = 8;
    const PER_WRITER: usize = 2000;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cfg = AggregatorConfig { threshold: 37, ..Default::default() };
    let agg = Arc::new(TelemetryAggregator::new(Arc::new(RecordingSink { tx, fail: false }), cfg));

    let mut writers = Vec::new();
    for w in 0..WRITERS {
        let agg = agg.clone();
        writers.push(tokio::spawn(async move {
            let mut sends = Vec::new();
            for i in 0..PER_WRITER {
                if let Some(send) = agg.record(rec(&format!("obj-{}", (i * 7 + w) % 50))).unwrap() {
                    sends.push(send);
                }
                if i % 64 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            sends
        }));
    }
    let flusher = {
        let agg = agg.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                agg.flush().await;
                tokio::task::yield_now().await;
            }
        })
    };
    for w in writers {
        for send in w.await.unwrap() {
            send.await.unwrap();
        }
    }
    flusher.await.unwrap();
    agg.flush().await;
    assert!(agg.is_empty());

    let mut total = 0u64;
    let mut batches = 0;
    while let Ok(batch) = rx.try_recv() {
        let mut names: Vec<_> = batch.iter().map(|r| r.resource_name.clone()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), batch.len(), "a batch carried the same key twice");
        total += batch.iter().map(|r| u64::from(r.occurrences)).sum::<u64>();
        batches += 1;
    }
    assert!(batches > 1);
    assert_eq!(total, (WRITERS * PER_WRITER) as u64);
}
