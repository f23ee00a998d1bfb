#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use vigil_kubehub::{ClusterApi, ClusterFacts, ClusterFactsProvider, FactsReporter, LeaderState};

#[derive(Default)]
struct FakeCluster {
    uid_calls: AtomicUsize,
    node_calls: AtomicUsize,
    fail_first_uid: bool,
    fail_nodes: bool,
}

#[async_trait::async_trait]
impl ClusterApi for FakeCluster {
    async fn namespace_uid(&self, name: &str) -> Result<String> {
        assert_eq!(name, "kube-system");
        let n = self.uid_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_first_uid && n == 0 {
            return Err(anyhow!("apiserver unavailable"));
        }
        Ok("3f1c-uid".into())
    }

    async fn node_count(&self) -> Result<usize> {
        self.node_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_nodes {
            return Err(anyhow!("nodes is forbidden"));
        }
        Ok(3)
    }

    async fn server_version(&self) -> Result<String> { Ok("v1.29.2".into()) }
}

#[derive(Default)]
struct RecordingFacts {
    seen: Mutex<Vec<(String, ClusterFacts)>>,
}

#[async_trait::async_trait]
impl FactsReporter for RecordingFacts {
    async fn report_facts(&self, cluster_uuid: &str, facts: &ClusterFacts) -> Result<()> {
        self.seen.lock().unwrap().push((cluster_uuid.to_string(), facts.clone()));
        Ok(())
    }
}

#[tokio::test]
async fn uuid_is_memoized_after_success() {
    let api = Arc::new(FakeCluster::default());
    let p = ClusterFactsProvider::new(Some(api.clone()), LeaderState::new(false));
    assert_eq!(p.cluster_uuid().await.unwrap(), "3f1c-uid");
    assert_eq!(p.cluster_uuid().await.unwrap(), "3f1c-uid");
    assert_eq!(api.uid_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn uuid_failure_is_retried() {
    let api = Arc::new(FakeCluster { fail_first_uid: true, ..Default::default() });
    let p = ClusterFactsProvider::new(Some(api.clone()), LeaderState::new(false));
    assert!(p.cluster_uuid().await.is_err());
    assert_eq!(p.cluster_uuid_or_empty().await, "3f1c-uid");
    assert_eq!(p.cluster_uuid().await.unwrap(), "3f1c-uid");
    assert_eq!(api.uid_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn followers_never_query_nodes() {
    let api = Arc::new(FakeCluster::default());
    let p = ClusterFactsProvider::new(Some(api.clone()), LeaderState::new(false));
    p.bootstrap().await;
    assert_eq!(p.k8s_version(), "v1.29.2");
    assert!(!p.refresh().await);
    assert_eq!(api.node_calls.load(Ordering::SeqCst), 0);
    assert_eq!(p.facts().node_count, None);
}

#[tokio::test]
async fn leader_refresh_updates_and_reports() {
    let api = Arc::new(FakeCluster::default());
    let sink = Arc::new(RecordingFacts::default());
    let p = ClusterFactsProvider::new(Some(api.clone()), LeaderState::new(true)).with_reporter(sink.clone());
    assert!(p.refresh().await);
    assert_eq!(p.facts().node_count, Some(3));
    assert_eq!(p.k8s_version(), "v1.29.2");
    let seen = sink.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "3f1c-uid");
}

#[tokio::test]
async fn node_errors_are_kept_as_facts() {
    let api = Arc::new(FakeCluster { fail_nodes: true, ..Default::default() });
    let p = ClusterFactsProvider::new(Some(api), LeaderState::new(true));
    assert!(p.refresh().await);
    let f = p.facts();
    assert_eq!(f.node_count, None);
    assert!(f.node_count_error.as_deref().unwrap().contains("forbidden"));
}

#[tokio::test]
async fn detached_provider_is_empty() {
    let p = ClusterFactsProvider::new(None, LeaderState::new(true));
    assert_eq!(p.cluster_uuid().await.unwrap(), "");
    p.bootstrap().await;
    assert_eq!(p.k8s_version(), "");
    assert!(!p.refresh().await);
}

struct HangingCluster;

#[async_trait::async_trait]
impl ClusterApi for HangingCluster {
    async fn namespace_uid(&self, _name: &str) -> Result<String> {
        tokio::time::sleep(std::time::Duration::from_secs(300)).await;
        Ok("late".into())
    }

    async fn node_count(&self) -> Result<usize> { Ok(1) }

    async fn server_version(&self) -> Result<String> { Ok("v1.30.0".into()) }
}

#[tokio::test(start_paused = true)]
async fn stuck_uid_lookup_is_bounded_and_never_blocks_readers() {
    let p = ClusterFactsProvider::new(Some(Arc::new(HangingCluster)), LeaderState::new(false));
    assert_eq!(p.cached_uuid(), "");
    let t0 = tokio::time::Instant::now();
    assert!(p.cluster_uuid().await.is_err());
    assert!(t0.elapsed() <= vigil_kubehub::UUID_LOOKUP_TIMEOUT + std::time::Duration::from_millis(10));
    p.bootstrap().await;
    assert_eq!(p.cached_uuid(), "");
    assert_eq!(p.k8s_version(), "v1.30.0");
}

#[tokio::test]
async fn refresh_resolves_uid_for_followers() {
    let api = Arc::new(FakeCluster { fail_first_uid: true, ..Default::default() });
    let p = ClusterFactsProvider::new(Some(api.clone()), LeaderState::new(false));
    p.bootstrap().await;
    assert_eq!(p.cached_uuid(), "");
    assert!(!p.refresh().await);
    assert_eq!(p.cached_uuid(), "3f1c-uid");
    assert_eq!(api.node_calls.load(Ordering::SeqCst), 0);
}
