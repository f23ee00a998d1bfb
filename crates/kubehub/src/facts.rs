//! Cluster identity, version and size.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;
use k8s_openapi::api::core::v1::{Namespace, Node};
use kube::api::{Api, ListParams};
use metrics::counter;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::leader::LeaderState;

/// The namespace whose uid identifies the cluster.
pub const CLUSTER_ID_NAMESPACE: &str = "kube-system";
/// Upper bound on one uid lookup.
pub const UUID_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Queries the facts provider needs from the API server.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    async fn namespace_uid(&self, name: &str) -> Result<String>;
    async fn node_count(&self) -> Result<usize>;
    async fn server_version(&self) -> Result<String>;
}

/// `ClusterApi` backed by a kube client.
pub struct KubeClusterApi {
    client: kube::Client,
}

impl KubeClusterApi {
    pub fn new(client: kube::Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl ClusterApi for KubeClusterApi {
    async fn namespace_uid(&self, name: &str) -> Result<String> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = api.get(name).await.with_context(|| format!("reading namespace {name}"))?;
        ns.metadata.uid.filter(|u| !u.is_empty()).ok_or_else(|| anyhow!("namespace {name} has no uid"))
    }

    async fn node_count(&self) -> Result<usize> {
        let api: Api<Node> = Api::all(self.client.clone());
        let list = api.list_metadata(&ListParams::default()).await.context("listing nodes")?;
        Ok(list.items.len())
    }

    async fn server_version(&self) -> Result<String> {
        let info = self.client.apiserver_version().await.context("reading server version")?;
        Ok(info.git_version)
    }
}

/// Last refreshed facts. The uid lives separately since it never changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterFacts {
    pub k8s_version: String,
    pub node_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_count_error: Option<String>,
}

/// Receives facts after every leader refresh.
#[async_trait::async_trait]
pub trait FactsReporter: Send + Sync {
    async fn report_facts(&self, cluster_uuid: &str, facts: &ClusterFacts) -> Result<()>;
}

/// Cluster uid, server version and node count, cached for cheap reads.
pub struct ClusterFactsProvider {
    api: Option<Arc<dyn ClusterApi>>,
    leader: LeaderState,
    uuid: OnceCell<String>,
    facts: ArcSwap<ClusterFacts>,
    reporter: Option<Arc<dyn FactsReporter>>,
}

impl ClusterFactsProvider {
    /// `api = None` runs detached from any cluster: empty uid and version.
    pub fn new(api: Option<Arc<dyn ClusterApi>>, leader: LeaderState) -> Self {
        Self { api, leader, uuid: OnceCell::new(), facts: ArcSwap::from_pointee(ClusterFacts::default()), reporter: None }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn FactsReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Cluster uid, resolved once. Failures are not cached.
    pub async fn cluster_uuid(&self) -> Result<String> {
        let Some(api) = &self.api else { return Ok(String::new()) };
        let uuid = self
            .uuid
            .get_or_try_init(|| async {
                let uid = tokio::time::timeout(UUID_LOOKUP_TIMEOUT, api.namespace_uid(CLUSTER_ID_NAMESPACE))
                    .await
                    .map_err(|_| anyhow!("reading namespace {CLUSTER_ID_NAMESPACE} timed out"))??;
                info!(cluster_uuid = %uid, "facts: cluster uuid resolved");
                Ok::<_, anyhow::Error>(uid)
            })
            .await?;
        Ok(uuid.clone())
    }

    /// The uid if an earlier lookup succeeded, else empty. Never touches the
    /// API server.
    pub fn cached_uuid(&self) -> String { self.uuid.get().cloned().unwrap_or_default() }

    /// Cluster uid, or empty if it cannot be resolved right now.
    pub async fn cluster_uuid_or_empty(&self) -> String {
        match self.cluster_uuid().await {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "facts: cluster uuid unavailable");
                String::new()
            }
        }
    }

    pub fn facts(&self) -> Arc<ClusterFacts> { self.facts.load_full() }

    pub fn k8s_version(&self) -> String { self.facts.load().k8s_version.clone() }

    /// Startup lookup every replica performs: uid and server version.
    pub async fn bootstrap(&self) {
        let Some(api) = &self.api else { return };
        let _ = self.cluster_uuid_or_empty().await;
        match api.server_version().await {
            Ok(v) => {
                info!(k8s_version = %v, "facts: server version");
                self.facts.rcu(|f| ClusterFacts { k8s_version: v.clone(), ..(**f).clone() });
            }
            Err(e) => warn!(error = %e, "facts: server version unavailable"),
        }
    }

    /// Retry an unresolved uid, then re-query version and node count. Only
    /// the leader queries the latter two; returns whether it did.
    pub async fn refresh(&self) -> bool {
        if self.uuid.get().is_none() {
            let _ = self.cluster_uuid_or_empty().await;
        }
        if !self.leader.is_leader() {
            debug!("facts: not leader, skipping refresh");
            return false;
        }
        let Some(api) = &self.api else { return false };
        let t0 = Instant::now();
        let mut next = (*self.facts.load_full()).clone();
        match api.server_version().await {
            Ok(v) => next.k8s_version = v,
            Err(e) => warn!(error = %e, "facts: server version unavailable"),
        }
        match api.node_count().await {
            Ok(n) => {
                next.node_count = Some(n);
                next.node_count_error = None;
            }
            Err(e) => {
                warn!(error = %e, "facts: node count unavailable");
                next.node_count = None;
                next.node_count_error = Some(format!("{e:#}"));
            }
        }
        self.facts.store(Arc::new(next.clone()));
        counter!("cluster_facts_refresh_total", 1u64);
        info!(
            k8s_version = %next.k8s_version,
            nodes = ?next.node_count,
            took_ms = %t0.elapsed().as_millis(),
            "facts: refreshed"
        );
        if let Some(reporter) = &self.reporter {
            let uuid = self.cluster_uuid_or_empty().await;
            if let Err(e) = reporter.report_facts(&uuid, &next).await {
                warn!(error = %e, "facts: reporting failed");
            }
        }
        true
    }
}
