//! In-memory collaborators for tests and local runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use vigil_core::{ErrorReporter, EvaluationOutcome};

use crate::{
    Backend, BackendError, EvaluationResultRequest, EvaluatorError, PoliciesDocument, PolicyCatalog, PolicyDefinition,
    PolicyEvaluator,
};

/// Backend answering from fixed data. `catalog = None` makes prerun fail;
/// `evaluation_id = None` makes saving fail.
#[derive(Default)]
pub struct MockBackend {
    pub catalog: Option<PolicyCatalog>,
    pub evaluation_id: Option<i64>,
    pub version_messages: Vec<String>,
    pub saved: Mutex<Vec<EvaluationResultRequest>>,
    pub prerun_calls: AtomicUsize,
}

impl MockBackend {
    /// A backend whose catalog holds one default policy.
    pub fn with_default_policy(name: &str) -> Self {
        let catalog = PolicyCatalog {
            policies_json: PoliciesDocument {
                policies: vec![PolicyDefinition { name: name.to_string(), is_default: true, ..Default::default() }],
                ..Default::default()
            },
            registration_url: "https://app.vigil.test/login".into(),
            ..Default::default()
        };
        Self { catalog: Some(catalog), evaluation_id: Some(1), ..Default::default() }
    }

    pub fn saved(&self) -> Vec<EvaluationResultRequest> {
        self.saved.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait::async_trait]
impl Backend for MockBackend {
    async fn prerun(&self, _token: &str, _cluster_uuid: &str) -> Result<PolicyCatalog, BackendError> {
        self.prerun_calls.fetch_add(1, Ordering::SeqCst);
        self.catalog.clone().ok_or_else(|| BackendError::Unavailable("prerun unavailable".into()))
    }

    async fn save_evaluation(&self, req: &EvaluationResultRequest) -> Result<i64, BackendError> {
        let id = self.evaluation_id.ok_or_else(|| BackendError::Status { path: "/result".into(), status: 503 })?;
        self.saved.lock().unwrap_or_else(|p| p.into_inner()).push(req.clone());
        Ok(id)
    }

    async fn version_messages(&self, _webhook_version: &str) -> Result<Vec<String>, BackendError> {
        Ok(self.version_messages.clone())
    }
}

/// What [`MockEvaluator`] does when called.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    Return(EvaluationOutcome),
    Fail(String),
    Panic(String),
    Sleep(Duration),
}

pub struct MockEvaluator {
    pub behavior: MockBehavior,
    pub calls: AtomicUsize,
}

impl MockEvaluator {
    pub fn new(behavior: MockBehavior) -> Self { Self { behavior, calls: AtomicUsize::new(0) } }

    pub fn passing() -> Self {
        Self::new(MockBehavior::Return(EvaluationOutcome { passed_checks: 1, rules_count: 4, ..Default::default() }))
    }

    pub fn failing(report: &str) -> Self {
        Self::new(MockBehavior::Return(EvaluationOutcome {
            passed_checks: 0,
            rules_count: 4,
            report: report.to_string(),
            ..Default::default()
        }))
    }

    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

#[async_trait::async_trait]
impl PolicyEvaluator for MockEvaluator {
    async fn evaluate(
        &self,
        policy: &PolicyDefinition,
        _object: &serde_json::Value,
    ) -> Result<EvaluationOutcome, EvaluatorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            MockBehavior::Return(o) => Ok(EvaluationOutcome { policy_name: policy.name.clone(), ..o.clone() }),
            MockBehavior::Fail(msg) => Err(EvaluatorError::Failed { status: "exit status: 1".into(), stderr: msg.clone() }),
            MockBehavior::Panic(msg) => panic!("{msg}"),
            MockBehavior::Sleep(d) => {
                tokio::time::sleep(*d).await;
                Ok(EvaluationOutcome::default())
            }
        }
    }
}

/// Reporter that keeps every message.
#[derive(Default)]
pub struct RecordingReporter {
    pub panics: Mutex<Vec<String>>,
    pub unexpected: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn panics(&self) -> Vec<String> { self.panics.lock().unwrap_or_else(|p| p.into_inner()).clone() }

    pub fn unexpected(&self) -> Vec<String> { self.unexpected.lock().unwrap_or_else(|p| p.into_inner()).clone() }
}

impl ErrorReporter for RecordingReporter {
    fn report_panic(&self, message: &str) {
        self.panics.lock().unwrap_or_else(|p| p.into_inner()).push(message.to_string());
    }

    fn report_unexpected(&self, message: &str) {
        self.unexpected.lock().unwrap_or_else(|p| p.into_inner()).push(message.to_string());
    }
}
