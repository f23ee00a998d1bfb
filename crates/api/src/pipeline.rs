//! One admission request in, one admission response out.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use vigil_classify::{classify, should_skip_by_scanning_filters, SkipList};
use vigil_core::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, ClusterRequestMetadata, ErrorReporter, EvaluationOutcome,
    ObjectMetadata, ScanningFilters, EVALUATION_ID_NOT_RECORDED, EVALUATION_ID_SAVE_FAILED,
};
use vigil_kubehub::ClusterFactsProvider;
use vigil_telemetry::TelemetryAggregator;

use crate::catalog::{ActionOnFailure, BypassPermissions, PolicyCatalog, PolicyDefinition};
use crate::{Backend, EvaluationResultRequest, PipelineConfig, PipelineError, PolicyEvaluator, TransportError};

pub const SUCCESS_MESSAGE: &str = "We're good!";
pub const PANIC_WARNING: &str = "failed to validate the applied resource, check the pod logs for more details";
pub const SAVE_FAILED_WARNING: &str = "saving evaluation results failed";
const BYPASS_WARNING: &str = "Your resource failed the policy check, but it has been applied due to your bypass privileges";

/// Settings in force for one request once the catalog has been applied.
struct Effective {
    enforce: bool,
    skip_list: SkipList,
    bypass: Option<BypassPermissions>,
}

/// Values every exit path of one request needs.
struct RequestContext<'a> {
    req: &'a AdmissionRequest,
    meta: ObjectMetadata,
    cluster_uuid: String,
    k8s_version: String,
}

impl RequestContext<'_> {
    fn resource_name(&self) -> &str {
        if self.req.name.is_empty() { &self.meta.name } else { &self.req.name }
    }

    fn namespace(&self) -> &str {
        if self.req.namespace.is_empty() { &self.meta.namespace } else { &self.req.namespace }
    }
}

struct Decided {
    response: AdmissionResponse,
    skipped: bool,
}

/// Turns admission requests into verdicts using the backend, the policy
/// engine, cluster facts and the telemetry aggregator.
pub struct AdmissionPipeline {
    cfg: PipelineConfig,
    backend: Arc<dyn Backend>,
    evaluator: Arc<dyn PolicyEvaluator>,
    facts: Arc<ClusterFactsProvider>,
    telemetry: Arc<TelemetryAggregator>,
    reporter: Arc<dyn ErrorReporter>,
}

impl AdmissionPipeline {
    pub fn new(
        cfg: PipelineConfig,
        backend: Arc<dyn Backend>,
        evaluator: Arc<dyn PolicyEvaluator>,
        facts: Arc<ClusterFactsProvider>,
        telemetry: Arc<TelemetryAggregator>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self { cfg, backend, evaluator, facts, telemetry, reporter }
    }

    pub fn config(&self) -> &PipelineConfig { &self.cfg }

    pub fn telemetry(&self) -> &Arc<TelemetryAggregator> { &self.telemetry }

    /// Decode an AdmissionReview body and answer it.
    ///
    /// Only undecodable input is an error; every decodable request gets a
    /// well-formed response, including when a fault or panic occurs downstream.
    pub async fn handle(&self, body: &[u8]) -> Result<AdmissionReview, TransportError> {
        let review: AdmissionReview = serde_json::from_slice(body)?;
        let req = review.request.ok_or(TransportError::MissingRequest)?;
        Ok(self.admit(&req).await.into_review())
    }

    pub async fn admit(&self, req: &AdmissionRequest) -> AdmissionResponse {
        let t0 = Instant::now();
        info!(
            uid = %req.uid,
            kind = %req.kind.kind,
            namespace = %req.namespace,
            name = %req.name,
            operation = ?req.operation,
            "admission: incoming"
        );
        let (response, skipped, outcome) = match AssertUnwindSafe(self.decide(req)).catch_unwind().await {
            Ok(Ok(d)) => {
                let outcome = if d.skipped {
                    "skipped"
                } else if d.response.allowed {
                    "allowed"
                } else {
                    "denied"
                };
                (d.response, d.skipped, outcome)
            }
            Ok(Err(e)) => {
                error!(uid = %req.uid, error = %e, "admission: request could not be processed");
                self.reporter.report_unexpected(&e.to_string());
                (AdmissionResponse::new(&req.uid, false, e.to_string(), vec![PANIC_WARNING.to_string()]), false, "error")
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                counter!("admission_panics_total", 1u64);
                error!(uid = %req.uid, panic = %msg, "admission: recovered from panic");
                self.reporter.report_panic(&msg);
                (AdmissionResponse::new(&req.uid, false, msg, vec![PANIC_WARNING.to_string()]), false, "panic")
            }
        };
        let took = t0.elapsed();
        histogram!("admission_latency_ms", took.as_secs_f64() * 1000.0);
        counter!("admission_requests_total", 1u64, "outcome" => outcome);
        info!(
            uid = %req.uid,
            allowed = response.allowed,
            skipped,
            warnings = response.warnings.len(),
            took_ms = %took.as_millis(),
            "admission: outgoing"
        );
        response
    }

    async fn decide(&self, req: &AdmissionRequest) -> Result<Decided, PipelineError> {
        // DELETE requests carry no object; they project to empty metadata and are skipped.
        let meta = match &req.object {
            Some(obj) => ObjectMetadata::from_object(Some(obj))?,
            None => ObjectMetadata::default(),
        };
        let ctx = RequestContext {
            req,
            meta,
            cluster_uuid: self.facts.cached_uuid(),
            k8s_version: self.facts.k8s_version(),
        };
        if self.cfg.token.is_empty() {
            warn!("admission: no token configured");
            self.reporter.report_unexpected("no VIGIL_TOKEN was found in env");
        }

        let configured = self.effective(None);
        let decision = classify(req, &ctx.meta);
        if !decision.should_validate() {
            return Ok(self.skip(&ctx, &configured, decision.rule()));
        }

        let mut warnings = Vec::new();
        let catalog = match self.backend.prerun(&self.cfg.token, &ctx.cluster_uuid).await {
            Ok(c) => c,
            Err(e) => return Ok(self.degrade(&ctx, &configured, e.into(), warnings, "")),
        };
        let eff = self.effective(Some(&catalog));
        if should_skip_by_scanning_filters(req, &ctx.meta, &eff.skip_list) {
            return Ok(self.skip(&ctx, &eff, "scanning-filter"));
        }
        let policy = match catalog.resolve(&self.cfg.policy_name) {
            Ok((policy, fallback)) => {
                warnings.extend(fallback);
                policy
            }
            Err(e) => return Ok(self.degrade(&ctx, &eff, e, warnings, &self.cfg.policy_name)),
        };
        if !policy.runs_in(ctx.namespace()) {
            return Ok(self.skip(&ctx, &eff, "policy-namespace"));
        }

        let null = Value::Null;
        let object = req.object.as_ref().unwrap_or(&null);
        let t_eval = Instant::now();
        let outcome = match tokio::time::timeout(self.cfg.eval_timeout, self.evaluator.evaluate(policy, object)).await {
            Ok(Ok(o)) => o,
            Ok(Err(e)) => return Ok(self.degrade(&ctx, &eff, e.into(), warnings, &policy.name)),
            Err(_) => {
                let e = PipelineError::EvaluatorTimeout(self.cfg.eval_timeout);
                return Ok(self.degrade(&ctx, &eff, e, warnings, &policy.name));
            }
        };
        let eval_elapsed = t_eval.elapsed();
        debug!(policy = %policy.name, passed = outcome.passed_checks, took_ms = %eval_elapsed.as_millis(), "admission: evaluated");

        let failed = !outcome.passed();
        let bypassed = failed && eff.bypass.as_ref().is_some_and(|b| b.allows(&req.user_info));
        let evaluation_id = self.save_result(&ctx, &eff, &outcome, policy, bypassed, eval_elapsed, &mut warnings).await;
        let allowed = !(failed && eff.enforce && !bypassed);

        let mut lead = Vec::new();
        if bypassed {
            lead.push(BYPASS_WARNING.to_string());
        } else if !eff.enforce {
            let (name, kind) = (ctx.resource_name(), &req.kind.kind);
            let verb = if failed { "failed" } else { "passed" };
            lead.push(format!(
                "Object with name \"{name}\" and kind \"{kind}\" {verb} the policy check for policy \"{}\"",
                policy.name
            ));
            lead.push(format!("Get the full report {}", catalog.report_link(evaluation_id)));
            if failed && !outcome.report.is_empty() {
                lead.push(outcome.report.clone());
            }
        }
        lead.append(&mut warnings);
        let mut warnings = lead;
        self.append_version_notices(&mut warnings).await;

        let message = if allowed { SUCCESS_MESSAGE.to_string() } else { format!("\n---\n{}", outcome.report) };
        self.record(&ctx, &eff, false, allowed, evaluation_id, &policy.name);
        Ok(Decided { response: AdmissionResponse::new(&req.uid, allowed, message, warnings), skipped: false })
    }

    fn effective(&self, catalog: Option<&PolicyCatalog>) -> Effective {
        let mut eff = Effective {
            enforce: self.cfg.enforce,
            skip_list: self.cfg.skip_list.clone(),
            bypass: self.cfg.bypass_permissions.clone(),
        };
        let Some(c) = catalog.filter(|_| !self.cfg.config_from_helm) else { return eff };
        if let Some(action) = c.action_on_failure {
            eff.enforce = action == ActionOnFailure::Enforce;
        }
        if !c.ignore_patterns.is_empty() {
            eff.skip_list = eff.skip_list.extended(&c.ignore_patterns);
        }
        if c.bypass_permissions.is_some() {
            eff.bypass = c.bypass_permissions.clone();
        }
        eff
    }

    fn skip(&self, ctx: &RequestContext<'_>, eff: &Effective, rule: &str) -> Decided {
        debug!(uid = %ctx.req.uid, rule, "admission: skipped");
        self.record(ctx, eff, true, true, EVALUATION_ID_NOT_RECORDED, "");
        let warning = format!("Object with name \"{}\" was skipped by the policy check.", ctx.resource_name());
        Decided { response: AdmissionResponse::new(&ctx.req.uid, true, "", vec![warning]), skipped: true }
    }

    /// No usable outcome: deny in enforce mode, otherwise allow with a warning.
    fn degrade(
        &self,
        ctx: &RequestContext<'_>,
        eff: &Effective,
        err: PipelineError,
        mut warnings: Vec<String>,
        policy_name: &str,
    ) -> Decided {
        warn!(uid = %ctx.req.uid, error = %err, enforce = eff.enforce, "admission: policy check could not complete");
        self.reporter.report_unexpected(&err.to_string());
        warnings.push(format!("failed to run policy check: {err}"));
        let allowed = !eff.enforce;
        let message = if allowed {
            String::new()
        } else {
            format!("policy check could not be completed and enforce mode is on: {err}")
        };
        self.record(ctx, eff, false, allowed, EVALUATION_ID_NOT_RECORDED, policy_name);
        Decided { response: AdmissionResponse::new(&ctx.req.uid, allowed, message, warnings), skipped: false }
    }

    #[allow(clippy::too_many_arguments)]
    async fn save_result(
        &self,
        ctx: &RequestContext<'_>,
        eff: &Effective,
        outcome: &EvaluationOutcome,
        policy: &PolicyDefinition,
        bypassed: bool,
        elapsed: Duration,
        warnings: &mut Vec<String>,
    ) -> i64 {
        if self.cfg.no_record {
            return EVALUATION_ID_NOT_RECORDED;
        }
        let body = EvaluationResultRequest {
            client_id: self.cfg.client_id.clone(),
            token: self.cfg.token.clone(),
            k8s_version: ctx.k8s_version.clone(),
            policy_name: policy.name.clone(),
            cluster_uuid: ctx.cluster_uuid.clone(),
            namespace: ctx.req.namespace.clone(),
            kind: ctx.req.kind.kind.clone(),
            metadata_name: ctx.resource_name().to_string(),
            webhook_version: self.cfg.webhook_version.clone(),
            is_enforce_mode: eff.enforce,
            is_bypassed_by_permissions: bypassed,
            evaluation_duration_seconds: elapsed.as_secs_f64(),
            rules_count: outcome.rules_count,
            passed_checks: outcome.passed_checks,
            policy_check_results: outcome.raw_results.clone(),
        };
        match self.backend.save_evaluation(&body).await {
            Ok(id) => id,
            Err(e) => {
                warn!(uid = %ctx.req.uid, error = %e, "admission: saving evaluation result failed");
                self.reporter.report_unexpected(SAVE_FAILED_WARNING);
                warnings.push(SAVE_FAILED_WARNING.to_string());
                EVALUATION_ID_SAVE_FAILED
            }
        }
    }

    async fn append_version_notices(&self, warnings: &mut Vec<String>) {
        match self.backend.version_messages(&self.cfg.webhook_version).await {
            Ok(lines) => warnings.extend(lines),
            Err(e) => warnings.push(e.to_string()),
        }
    }

    fn record(
        &self,
        ctx: &RequestContext<'_>,
        eff: &Effective,
        skipped: bool,
        allowed: bool,
        cli_evaluation_id: i64,
        policy_name: &str,
    ) {
        let rec = ClusterRequestMetadata {
            cluster_uuid: ctx.cluster_uuid.clone(),
            webhook_version: self.cfg.webhook_version.clone(),
            cli_evaluation_id,
            token: self.cfg.token.clone(),
            skipped,
            allowed,
            resource_kind: ctx.req.kind.kind.clone(),
            resource_name: ctx.resource_name().to_string(),
            managers: ctx.meta.managers(),
            policy_name: policy_name.to_string(),
            k8s_version: ctx.k8s_version.clone(),
            namespace: ctx.req.namespace.clone(),
            config_map_scanning_filters: ScanningFilters { skip_list: eff.skip_list.raw_entries() },
            owner_references: ctx.meta.owner_references.clone(),
            occurrences: 1,
        };
        if let Err(e) = self.telemetry.record(rec) {
            warn!(error = %e, "admission: telemetry record could not be keyed");
            self.reporter.report_unexpected(&e.to_string());
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
