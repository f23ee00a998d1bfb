//! Lease-based leader election.
//!
//! One background loop per process tries to acquire or renew a
//! `coordination.k8s.io/v1` Lease every `retry_period`. Leadership is
//! published through [`LeaderState`], a lock-free flag read by request tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use metrics::gauge;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vigil_core::ErrorReporter;

/// Longest time `LeaderElector::start` waits for the first verdict.
pub const BOOTSTRAP_WINDOW: Duration = Duration::from_secs(5);

/// Shared leadership flag. Written by the election loop only.
#[derive(Debug, Clone, Default)]
pub struct LeaderState(Arc<AtomicBool>);

impl LeaderState {
    pub fn new(leader: bool) -> Self { Self(Arc::new(AtomicBool::new(leader))) }

    pub fn is_leader(&self) -> bool { self.0.load(Ordering::Acquire) }

    fn set(&self, leader: bool) {
        self.0.store(leader, Ordering::Release);
        gauge!("leader_is_leader", if leader { 1.0 } else { 0.0 });
    }
}

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub lease_name: String,
    pub namespace: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
    pub bootstrap_window: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease_name: "vigil-webhook-server-lease".into(),
            namespace: "vigil".into(),
            identity: String::new(),
            lease_duration: Duration::from_secs(12),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
            bootstrap_window: BOOTSTRAP_WINDOW,
        }
    }
}

/// The parts of a Lease the election reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseRecord {
    pub holder: Option<String>,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub lease_duration_secs: i32,
    pub transitions: i32,
    /// Optimistic-concurrency token; `None` for records not read from the store.
    pub resource_version: Option<String>,
}

impl LeaseRecord {
    fn held_by_other(&self, identity: &str, now: DateTime<Utc>) -> Option<&str> {
        let holder = self.holder.as_deref().filter(|h| !h.is_empty() && *h != identity)?;
        let renewed = self.renew_time?;
        let expiry = renewed + chrono::Duration::seconds(i64::from(self.lease_duration_secs));
        (expiry > now).then_some(holder)
    }
}

/// Storage for the single lease the election contends on.
#[async_trait::async_trait]
pub trait LeaseStore: Send + Sync {
    async fn get(&self) -> Result<Option<LeaseRecord>>;
    /// Returns `false` if the lease already exists.
    async fn create(&self, rec: &LeaseRecord) -> Result<bool>;
    /// Returns `false` if `rec.resource_version` is stale.
    async fn replace(&self, rec: &LeaseRecord) -> Result<bool>;
}

/// `LeaseStore` over a `coordination.k8s.io/v1` Lease.
pub struct KubeLeaseStore {
    api: Api<Lease>,
    name: String,
}

impl KubeLeaseStore {
    pub fn new(client: kube::Client, namespace: &str, name: &str) -> Self {
        Self { api: Api::namespaced(client, namespace), name: name.to_string() }
    }

    fn to_lease(&self, rec: &LeaseRecord) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                resource_version: rec.resource_version.clone(),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: rec.holder.clone(),
                acquire_time: rec.acquire_time.map(MicroTime),
                renew_time: rec.renew_time.map(MicroTime),
                lease_duration_seconds: Some(rec.lease_duration_secs),
                lease_transitions: Some(rec.transitions),
            }),
        }
    }
}

fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 409)
}

#[async_trait::async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self) -> Result<Option<LeaseRecord>> {
        let lease = self.api.get_opt(&self.name).await.with_context(|| format!("reading lease {}", self.name))?;
        Ok(lease.map(|l| {
            let spec = l.spec.unwrap_or_default();
            LeaseRecord {
                holder: spec.holder_identity,
                acquire_time: spec.acquire_time.map(|t| t.0),
                renew_time: spec.renew_time.map(|t| t.0),
                lease_duration_secs: spec.lease_duration_seconds.unwrap_or(0),
                transitions: spec.lease_transitions.unwrap_or(0),
                resource_version: l.metadata.resource_version,
            }
        }))
    }

    async fn create(&self, rec: &LeaseRecord) -> Result<bool> {
        let mut lease = self.to_lease(rec);
        lease.metadata.resource_version = None;
        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("creating lease {}", self.name)),
        }
    }

    async fn replace(&self, rec: &LeaseRecord) -> Result<bool> {
        match self.api.replace(&self.name, &PostParams::default(), &self.to_lease(rec)).await {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("updating lease {}", self.name)),
        }
    }
}

/// A completed lease attempt. Errors reaching the store are not a verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Leading,
    Following(String),
}

async fn try_acquire_or_renew(store: &dyn LeaseStore, cfg: &ElectionConfig) -> Result<Verdict> {
    let now = Utc::now();
    let duration_secs = i32::try_from(cfg.lease_duration.as_secs()).unwrap_or(i32::MAX);
    let Some(current) = store.get().await? else {
        let rec = LeaseRecord {
            holder: Some(cfg.identity.clone()),
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_duration_secs: duration_secs,
            transitions: 0,
            resource_version: None,
        };
        return Ok(if store.create(&rec).await? { Verdict::Leading } else { Verdict::Following(String::new()) });
    };
    if let Some(holder) = current.held_by_other(&cfg.identity, now) {
        return Ok(Verdict::Following(holder.to_string()));
    }
    let renewing = current.holder.as_deref() == Some(cfg.identity.as_str());
    let rec = LeaseRecord {
        holder: Some(cfg.identity.clone()),
        acquire_time: if renewing { current.acquire_time } else { Some(now) },
        renew_time: Some(now),
        lease_duration_secs: duration_secs,
        transitions: if renewing { current.transitions } else { current.transitions + 1 },
        resource_version: current.resource_version.clone(),
    };
    if store.replace(&rec).await? {
        Ok(Verdict::Leading)
    } else {
        Ok(Verdict::Following(current.holder.unwrap_or_default()))
    }
}

/// Give the lease up so another replica can take it without waiting for expiry.
async fn release(store: &dyn LeaseStore, cfg: &ElectionConfig) -> Result<()> {
    let Some(current) = store.get().await? else { return Ok(()) };
    if current.holder.as_deref() != Some(cfg.identity.as_str()) {
        return Ok(());
    }
    let rec = LeaseRecord {
        holder: None,
        acquire_time: current.acquire_time,
        renew_time: Some(Utc::now()),
        lease_duration_secs: 1,
        transitions: current.transitions,
        resource_version: current.resource_version,
    };
    store.replace(&rec).await?;
    Ok(())
}

fn on_started_leading(state: &LeaderState, identity: &str) {
    state.set(true);
    info!(identity, "leader: started leading");
}

fn on_stopped_leading(state: &LeaderState, identity: &str) {
    state.set(false);
    info!(identity, "leader: stopped leading");
}

async fn run(
    store: Arc<dyn LeaseStore>,
    cfg: ElectionConfig,
    state: LeaderState,
    verdict_tx: watch::Sender<Option<bool>>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Whether we actually hold the lease; `state` may also be forced by a bootstrap fallback.
    let mut held = false;
    let mut last_renew = Instant::now();
    loop {
        match try_acquire_or_renew(store.as_ref(), &cfg).await {
            Ok(Verdict::Leading) => {
                held = true;
                last_renew = Instant::now();
                if !state.is_leader() {
                    on_started_leading(&state, &cfg.identity);
                }
                let _ = verdict_tx.send(Some(true));
            }
            Ok(Verdict::Following(holder)) => {
                debug!(holder = %holder, "leader: lease held elsewhere");
                held = false;
                if state.is_leader() {
                    on_stopped_leading(&state, &cfg.identity);
                }
                let _ = verdict_tx.send(Some(false));
            }
            Err(e) => {
                warn!(error = %e, "leader: lease attempt failed");
                if held && last_renew.elapsed() > cfg.renew_deadline {
                    held = false;
                    on_stopped_leading(&state, &cfg.identity);
                }
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(cfg.retry_period) => {}
            _ = shutdown.changed() => break,
        }
    }
    if held {
        match release(store.as_ref(), &cfg).await {
            Ok(()) => info!(lease = %cfg.lease_name, "leader: lease released"),
            Err(e) => warn!(error = %e, "leader: releasing lease failed"),
        }
    }
    if state.is_leader() {
        on_stopped_leading(&state, &cfg.identity);
    }
}

/// Handle on a running election; `state()` tells whether this replica leads.
pub struct LeaderElector {
    state: LeaderState,
    task: Option<JoinHandle<()>>,
}

impl LeaderElector {
    /// Start the election loop and wait up to `cfg.bootstrap_window` for a
    /// first verdict.
    ///
    /// Without a store, or when the window elapses, this replica assumes
    /// leadership; the latter is also reported. The loop ends when `shutdown`
    /// changes, releasing the lease if held.
    pub async fn start(
        store: Option<Arc<dyn LeaseStore>>,
        cfg: ElectionConfig,
        reporter: Arc<dyn ErrorReporter>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let state = LeaderState::new(false);
        let Some(store) = store else {
            info!("leader: no lease client; assuming leadership");
            state.set(true);
            return Self { state, task: None };
        };
        let (verdict_tx, mut verdict_rx) = watch::channel(None);
        let window = cfg.bootstrap_window;
        let t0 = Instant::now();
        let task = tokio::spawn(run(store, cfg, state.clone(), verdict_tx, shutdown));
        match tokio::time::timeout(window, verdict_rx.wait_for(|v| v.is_some())).await {
            Ok(Ok(v)) => {
                info!(leader = ?*v, took_ms = %t0.elapsed().as_millis(), "leader: first verdict");
            }
            Ok(Err(_)) => {
                // Loop ended (shutdown) before any verdict.
                debug!("leader: election ended before a verdict");
            }
            Err(_) => {
                warn!(window_ms = %window.as_millis(), "leader: no verdict in bootstrap window; assuming leadership");
                state.set(true);
                reporter.report_unexpected(&format!(
                    "leader election produced no verdict within {}s; assuming leadership",
                    window.as_secs()
                ));
            }
        }
        Self { state, task: Some(task) }
    }

    pub fn state(&self) -> LeaderState { self.state.clone() }

    pub fn is_leader(&self) -> bool { self.state.is_leader() }

    /// Wait for the election loop to finish after shutdown was signalled.
    pub async fn stopped(self) {
        if let Some(task) = self.task {
            if let Err(e) = task.await {
                warn!(error = %e, "leader: election task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_foreign_lease_is_held() {
        let now = Utc::now();
        let rec = LeaseRecord {
            holder: Some("other".into()),
            renew_time: Some(now),
            lease_duration_secs: 12,
            ..Default::default()
        };
        assert_eq!(rec.held_by_other("me", now), Some("other"));
        assert_eq!(rec.held_by_other("other", now), None);
        assert_eq!(rec.held_by_other("me", now + chrono::Duration::seconds(13)), None);
    }

    #[test]
    fn empty_holder_is_free() {
        let now = Utc::now();
        let rec = LeaseRecord { holder: Some(String::new()), renew_time: Some(now), lease_duration_secs: 12, ..Default::default() };
        assert_eq!(rec.held_by_other("me", now), None);
    }
}
