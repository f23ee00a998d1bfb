//! Vigil core types: the admission envelope, the metadata projection every
//! classification runs on, and the telemetry record shipped to the backend.

#![forbid(unsafe_code)]

pub mod meta;
pub mod record;
pub mod review;

use serde::{Deserialize, Serialize};

pub use meta::{FieldManager, ObjectMetadata, OwnerReference};
pub use record::{ClusterRequestMetadata, ScanningFilters};
pub use review::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, GroupVersionKind, Operation, ResponseStatus, UserInfo,
};

pub mod prelude {
    pub use super::{
        AdmissionRequest, AdmissionResponse, AdmissionReview, ClusterRequestMetadata, ErrorReporter, EvaluationOutcome,
        FieldManager, ObjectMetadata, Operation, OwnerReference, ScanningFilters,
    };
}

/// Evaluation id used when nothing was recorded upstream.
pub const EVALUATION_ID_NOT_RECORDED: i64 = -1;
/// Evaluation id used when recording the result upstream failed.
pub const EVALUATION_ID_SAVE_FAILED: i64 = -2;

/// Result of running one policy against one object. Produced by the external
/// engine; the pipeline only inspects it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationOutcome {
    /// Number of configurations that passed every rule of the policy.
    pub passed_checks: u32,
    /// Total number of rules the policy ran.
    #[serde(default)]
    pub rules_count: u32,
    /// Human-readable report, already formatted by the engine.
    #[serde(default)]
    pub report: String,
    /// Policy the engine actually used.
    #[serde(default)]
    pub policy_name: String,
    /// Raw per-rule results, forwarded untouched when the result is recorded.
    #[serde(default)]
    pub raw_results: serde_json::Value,
}

impl EvaluationOutcome {
    pub fn passed(&self) -> bool { self.passed_checks > 0 }
}

/// Sink for faults that should reach a human even though the request keeps going.
///
/// Calls are fire-and-forget: implementations must not block the caller.
pub trait ErrorReporter: Send + Sync {
    fn report_panic(&self, message: &str);
    fn report_unexpected(&self, message: &str);
}
