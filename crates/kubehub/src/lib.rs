//! Vigil kubehub: lease-based leader election and the cluster facts that only
//! the leader is allowed to query.

#![forbid(unsafe_code)]

mod facts;
mod leader;

pub use facts::{ClusterApi, ClusterFacts, ClusterFactsProvider, FactsReporter, KubeClusterApi, CLUSTER_ID_NAMESPACE, UUID_LOOKUP_TIMEOUT};
pub use leader::{
    ElectionConfig, KubeLeaseStore, LeaderElector, LeaderState, LeaseRecord, LeaseStore, BOOTSTRAP_WINDOW,
};

/// In-cluster (or kubeconfig) client; `None` when neither is available.
pub async fn try_client() -> Option<kube::Client> {
    match kube::Client::try_default().await {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(error = %e, "kube client unavailable; running without cluster access");
            None
        }
    }
}
