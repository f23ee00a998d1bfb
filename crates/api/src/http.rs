//! HTTP client for the account backend.
//!
//! One client serves every outbound concern: the pipeline's [`Backend`],
//! the telemetry sink, the facts reporter and the error reporter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vigil_core::{ClusterRequestMetadata, ErrorReporter};
use vigil_kubehub::{ClusterFacts, FactsReporter};
use vigil_telemetry::{SinkError, TelemetrySink};

use crate::{Backend, BackendError, EvaluationResultRequest, PolicyCatalog};

const PANIC_PATH: &str = "/cli/public/report-webhook-panic-error";
const UNEXPECTED_PATH: &str = "/cli/public/report-webhook-unexpected-error";

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub base_url: String,
    pub timeout: Duration,
    pub token: String,
    pub client_id: String,
    pub cluster_name: String,
    pub policy_name: String,
    pub verbose: bool,
    pub output: String,
    pub no_record: bool,
    pub enforce: bool,
    pub webhook_version: String,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: Duration::from_secs(10),
            token: String::new(),
            client_id: String::new(),
            cluster_name: String::new(),
            policy_name: String::new(),
            verbose: false,
            output: String::new(),
            no_record: false,
            enforce: false,
            webhook_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Cluster identity attached to error reports once known.
#[derive(Debug, Clone, Default)]
struct ReportContext {
    cluster_uuid: String,
    k8s_version: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveResultResponse {
    evaluation_id: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionMessagesResponse {
    #[serde(default)]
    message_text_array: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetadataBatch<'a> {
    metadata_logs: &'a [ClusterRequestMetadata],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterEvent<'a> {
    cluster_uuid: &'a str,
    token: &'a str,
    nodes_count: usize,
    nodes_count_err: &'a str,
    k8s_version: &'a str,
    action_on_failure: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorReport {
    client_id: String,
    token: String,
    cluster_uuid: String,
    cluster_name: String,
    k8s_version: String,
    policy_name: String,
    is_enforce_mode: bool,
    webhook_version: String,
    error_message: String,
    stack_trace: String,
}

pub struct BackendClient {
    http: reqwest::Client,
    settings: BackendSettings,
    context: ArcSwap<ReportContext>,
}

fn flag_headers(s: &BackendSettings) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let flags: [(&'static str, String); 6] = [
        ("x-cli-flags-policyname", s.policy_name.clone()),
        ("x-cli-flags-verbose", s.verbose.to_string()),
        ("x-cli-flags-output", s.output.clone()),
        ("x-cli-flags-norecord", s.no_record.to_string()),
        ("x-cli-flags-enforce", s.enforce.to_string()),
        ("x-cli-flags-clustername", s.cluster_name.clone()),
    ];
    for (name, value) in flags {
        if let Ok(v) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), v);
        }
    }
    headers
}

impl BackendClient {
    pub fn new(settings: BackendSettings) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .default_headers(flag_headers(&settings))
            .build()
            .map_err(|e| BackendError::Unavailable(format!("building http client: {e}")))?;
        Ok(Self { http, settings, context: ArcSwap::from_pointee(ReportContext::default()) })
    }

    /// Attach cluster identity to subsequent error reports.
    pub fn set_cluster_context(&self, cluster_uuid: &str, k8s_version: &str) {
        self.context.store(Arc::new(ReportContext {
            cluster_uuid: cluster_uuid.to_string(),
            k8s_version: k8s_version.to_string(),
        }));
    }

    fn url(&self, path: &str) -> String { format!("{}{}", self.settings.base_url.trim_end_matches('/'), path) }

    async fn send(&self, req: reqwest::RequestBuilder, path: &str) -> Result<reqwest::Response, BackendError> {
        let t0 = Instant::now();
        let res = req.send().await.map_err(|e| BackendError::Network { path: path.to_string(), msg: e.to_string() })?;
        let status = res.status();
        debug!(path, status = status.as_u16(), took_ms = %t0.elapsed().as_millis(), "backend: response");
        if !status.is_success() {
            return Err(BackendError::Status { path: path.to_string(), status: status.as_u16() });
        }
        Ok(res)
    }

    async fn decode<T: DeserializeOwned>(res: reqwest::Response, path: &str) -> Result<T, BackendError> {
        res.json::<T>().await.map_err(|e| BackendError::Decode { path: path.to_string(), msg: e.to_string() })
    }

    /// Base URL extended with `segments`, each percent-encoded so caller
    /// values cannot change the route.
    fn segment_url(&self, segments: &[&str]) -> Result<reqwest::Url, BackendError> {
        let mut url = reqwest::Url::parse(&self.settings.base_url)
            .map_err(|e| BackendError::Unavailable(format!("invalid backend url: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| BackendError::Unavailable("backend url cannot carry a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// GET `segments`; `label` names the route in logs and errors.
    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str], label: &str) -> Result<T, BackendError> {
        let url = self.segment_url(segments)?;
        let res = self.send(self.http.get(url), label).await?;
        Self::decode(res, label).await
    }

    async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<reqwest::Response, BackendError> {
        self.send(self.http.post(self.url(path)).json(body), path).await
    }

    fn report(&self, path: &'static str, message: &str) {
        let ctx = self.context.load_full();
        let body = ErrorReport {
            client_id: self.settings.client_id.clone(),
            token: self.settings.token.clone(),
            cluster_uuid: ctx.cluster_uuid.clone(),
            cluster_name: self.settings.cluster_name.clone(),
            k8s_version: ctx.k8s_version.clone(),
            policy_name: self.settings.policy_name.clone(),
            is_enforce_mode: self.settings.enforce,
            webhook_version: self.settings.webhook_version.clone(),
            error_message: message.to_string(),
            stack_trace: std::backtrace::Backtrace::force_capture().to_string(),
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(path, message, "backend: no runtime, error report dropped");
            return;
        };
        let req = self.http.post(self.url(path)).json(&body);
        handle.spawn(async move {
            if let Err(e) = req.send().await.and_then(|r| r.error_for_status()) {
                warn!(path, error = %e, "backend: error report failed");
            }
        });
    }
}

#[async_trait::async_trait]
impl Backend for BackendClient {
    async fn prerun(&self, token: &str, cluster_uuid: &str) -> Result<PolicyCatalog, BackendError> {
        let segments = ["cli", "evaluation", "policyCheck", "tokens", token, "clusters", cluster_uuid, "prerun"];
        self.get_json(&segments, "/cli/evaluation/policyCheck/tokens/{token}/clusters/{uuid}/prerun").await
    }

    async fn save_evaluation(&self, req: &EvaluationResultRequest) -> Result<i64, BackendError> {
        let path = "/cli/evaluation/policyCheck/result";
        let res = self.post_json(path, req).await?;
        let body: SaveResultResponse = Self::decode(res, path).await?;
        Ok(body.evaluation_id)
    }

    async fn version_messages(&self, webhook_version: &str) -> Result<Vec<String>, BackendError> {
        if webhook_version.is_empty() {
            return Err(BackendError::Unavailable("can't get current webhook version".into()));
        }
        let segments = ["cli", "messages", "versions", webhook_version, "webhook"];
        let body: VersionMessagesResponse = self.get_json(&segments, "/cli/messages/versions/{version}/webhook").await?;
        Ok(body.message_text_array)
    }
}

#[async_trait::async_trait]
impl TelemetrySink for BackendClient {
    async fn send_batch(&self, batch: Vec<ClusterRequestMetadata>) -> Result<(), SinkError> {
        let body = MetadataBatch { metadata_logs: &batch };
        self.post_json("/cli/evaluation/clusterRequestMetadataBatch", &body)
            .await
            .map(|_| ())
            .map_err(|e| SinkError::Transport(e.to_string()))
    }
}

#[async_trait::async_trait]
impl FactsReporter for BackendClient {
    async fn report_facts(&self, cluster_uuid: &str, facts: &ClusterFacts) -> anyhow::Result<()> {
        self.set_cluster_context(cluster_uuid, &facts.k8s_version);
        let body = ClusterEvent {
            cluster_uuid,
            token: &self.settings.token,
            nodes_count: facts.node_count.unwrap_or(0),
            nodes_count_err: facts.node_count_error.as_deref().unwrap_or(""),
            k8s_version: &facts.k8s_version,
            action_on_failure: if self.settings.enforce { "enforce" } else { "monitor" },
        };
        self.post_json("/cli/clusterEvents", &body).await?;
        Ok(())
    }
}

impl ErrorReporter for BackendClient {
    fn report_panic(&self, message: &str) { self.report(PANIC_PATH, message) }

    fn report_unexpected(&self, message: &str) { self.report(UNEXPECTED_PATH, message) }
}
