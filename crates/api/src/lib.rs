//! Vigil admission API: the pipeline that turns one AdmissionReview into one
//! verdict, and the collaborators it calls out to.
//!
//! The pipeline depends only on the traits below; `http` and `engine` hold the
//! production implementations and `mock` the in-memory ones used by tests.

#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use vigil_classify::SkipList;
use vigil_core::EvaluationOutcome;

pub mod catalog;
pub mod engine;
pub mod http;
pub mod mock;
mod pipeline;

pub use catalog::{
    ActionOnFailure, BypassPermissions, NamespaceRestrictions, PoliciesDocument, PolicyCatalog, PolicyDefinition,
};
pub use engine::CommandEvaluator;
pub use http::{BackendClient, BackendSettings};
pub use mock::{MockBackend, MockBehavior, MockEvaluator, RecordingReporter};
pub use pipeline::{AdmissionPipeline, PANIC_WARNING, SAVE_FAILED_WARNING, SUCCESS_MESSAGE};

/// Input the webhook could not even interpret as an admission request.
/// Maps to HTTP 400; no admission semantics apply.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("{0}")]
    Decode(#[from] serde_json::Error),
    #[error("request is nil")]
    MissingRequest,
    #[error("Content-Type header is not application/json")]
    ContentType,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend request to {path} failed: {msg}")]
    Network { path: String, msg: String },
    #[error("backend returned {status} for {path}")]
    Status { path: String, status: u16 },
    #[error("backend response from {path} could not be decoded: {msg}")]
    Decode { path: String, msg: String },
    #[error("{0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EvaluatorError {
    #[error("policy engine could not be started: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("policy engine exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("policy engine output is not an evaluation result: {0}")]
    Output(#[from] serde_json::Error),
}

/// Faults inside one admission decision. Most degrade to a warning; the
/// pipeline decides which.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("malformed admission object: {0}")]
    MalformedObject(#[from] vigil_core::meta::MetadataError),
    #[error("evaluation failed: {0}")]
    Evaluator(#[from] EvaluatorError),
    #[error("evaluation timed out after {0:?}")]
    EvaluatorTimeout(Duration),
    #[error("an error occurred when pulling your policy: {0}")]
    Backend(#[from] BackendError),
    #[error("no policy named \"{0}\" and no default policy configured")]
    NoPolicy(String),
}

/// Body of `POST /cli/evaluation/policyCheck/result`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResultRequest {
    pub client_id: String,
    pub token: String,
    pub k8s_version: String,
    pub policy_name: String,
    pub cluster_uuid: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub kind: String,
    pub metadata_name: String,
    pub webhook_version: String,
    pub is_enforce_mode: bool,
    pub is_bypassed_by_permissions: bool,
    pub evaluation_duration_seconds: f64,
    pub rules_count: u32,
    pub passed_checks: u32,
    pub policy_check_results: serde_json::Value,
}

/// The account backend: policy catalog, result store, version notices.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn prerun(&self, token: &str, cluster_uuid: &str) -> Result<PolicyCatalog, BackendError>;
    /// Store the result; returns the evaluation id.
    async fn save_evaluation(&self, req: &EvaluationResultRequest) -> Result<i64, BackendError>;
    async fn version_messages(&self, webhook_version: &str) -> Result<Vec<String>, BackendError>;
}

/// The external policy engine.
#[async_trait::async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        policy: &PolicyDefinition,
        object: &serde_json::Value,
    ) -> Result<EvaluationOutcome, EvaluatorError>;
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub token: String,
    pub client_id: String,
    pub policy_name: String,
    pub enforce: bool,
    /// When set, the catalog's action, ignore patterns and bypass list are ignored.
    pub config_from_helm: bool,
    pub no_record: bool,
    pub webhook_version: String,
    pub skip_list: SkipList,
    pub bypass_permissions: Option<BypassPermissions>,
    pub eval_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            client_id: String::new(),
            policy_name: String::new(),
            enforce: false,
            config_from_helm: false,
            no_record: false,
            webhook_version: env!("CARGO_PKG_VERSION").to_string(),
            skip_list: SkipList::default(),
            bypass_permissions: None,
            eval_timeout: Duration::from_secs(20),
        }
    }
}
