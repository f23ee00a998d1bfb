//! Vigil classify: decides from request provenance whether an object is
//! evaluated or passed through.
//!
//! Rules are plain tables evaluated in a fixed order:
//!
//! 1. [`EXCLUSIONS`]: the first matching rule skips the object.
//! 2. [`PROVENANCE`]: the object is validated iff at least one field manager
//!    satisfies at least one rule.
//!
//! Everything here is pure: no I/O, and absent input fields read as empty.

#![forbid(unsafe_code)]

mod filters;

pub use filters::{should_skip_by_scanning_filters, SkipEntry, SkipList};

use tracing::debug;
use vigil_core::{AdmissionRequest, ObjectMetadata, Operation};

/// Outcome of classification, naming the rule that decided it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Validate { rule: &'static str },
    Skip { rule: &'static str },
}

impl Decision {
    pub fn should_validate(&self) -> bool { matches!(self, Decision::Validate { .. }) }

    pub fn rule(&self) -> &'static str {
        match self {
            Decision::Validate { rule } | Decision::Skip { rule } => rule,
        }
    }
}

/// Rule name reported when no field manager matched any provenance rule.
pub const NO_PROVENANCE: &str = "no-known-manager";

/// Request shape that is never validated, whoever applied it.
pub struct ExclusionRule {
    pub name: &'static str,
    pub matches: fn(&AdmissionRequest, &ObjectMetadata) -> bool,
}

/// Field manager pattern that marks an object as user-applied.
pub struct ProvenanceRule {
    pub name: &'static str,
    pub matches: fn(manager: &str, &AdmissionRequest, &ObjectMetadata) -> bool,
}

const UNSUPPORTED_KINDS: &[&str] = &["Event", "GitRepository"];
const SYSTEM_NAMESPACES: &[&str] = &["kube-public", "kube-node-lease"];
// Default `--field-manager` values of kubectl apply/create/edit/patch.
const KUBECTL_MANAGERS: &[&str] = &["kubectl-client-side-apply", "kubectl-create", "kubectl-edit", "kubectl-patch"];
const OPENSHIFT_MANAGERS: &[&str] = &["openshift-controller-manager", "openshift-apiserver", "oc"];
// Controller-driven kinds that are re-applied on every status change; validate on create only.
const ARGO_CREATE_ONLY_KINDS: &[&str] = &["Application", "Workflow", "Rollout"];
const FLUX_LABEL_MARKER: &str = "kustomize.toolkit.fluxcd.io";

pub static EXCLUSIONS: &[ExclusionRule] = &[
    ExclusionRule { name: "missing-name", matches: |_, meta| meta.name.is_empty() },
    ExclusionRule { name: "unsupported-kind", matches: |req, _| UNSUPPORTED_KINDS.contains(&req.kind.kind.as_str()) },
    ExclusionRule { name: "being-deleted", matches: |_, meta| meta.is_deleted() },
    ExclusionRule { name: "system-namespace", matches: |req, _| SYSTEM_NAMESPACES.contains(&req.namespace.as_str()) },
    // Children are validated through their owning controller's apply.
    ExclusionRule { name: "owned-object", matches: |_, meta| meta.has_owner() },
];

pub static PROVENANCE: &[ProvenanceRule] = &[
    ProvenanceRule { name: "kubectl", matches: |m, _, _| KUBECTL_MANAGERS.contains(&m) },
    ProvenanceRule { name: "helm", matches: |m, _, _| m == "helm" },
    ProvenanceRule { name: "terraform", matches: |m, _, _| is_terraform(m) },
    ProvenanceRule { name: "flux", matches: is_flux },
    ProvenanceRule { name: "argocd", matches: is_argo },
    ProvenanceRule { name: "openshift", matches: |m, _, _| OPENSHIFT_MANAGERS.contains(&m) },
];

fn is_terraform(manager: &str) -> bool {
    let m = manager.to_ascii_lowercase();
    m.contains("terraform") || m.contains("hashicorp")
}

fn is_flux(manager: &str, req: &AdmissionRequest, meta: &ObjectMetadata) -> bool {
    if !manager.starts_with("kustomize-controller") {
        return false;
    }
    let flux_object = req.namespace == "flux-system" || meta.labels.keys().any(|k| k.contains(FLUX_LABEL_MARKER));
    flux_object && !meta.labels.is_empty() && !req.is_dry_run()
}

fn is_argo(manager: &str, req: &AdmissionRequest, _meta: &ObjectMetadata) -> bool {
    // "argo" is a prefix of "argocd"; kept explicit to mirror the documented list.
    if !(manager.starts_with("argocd") || manager.starts_with("argo")) {
        return false;
    }
    !ARGO_CREATE_ONLY_KINDS.contains(&req.kind.kind.as_str()) || req.operation == Operation::Create
}

/// Run the rule tables and report which rule decided.
pub fn classify(req: &AdmissionRequest, meta: &ObjectMetadata) -> Decision {
    if let Some(rule) = EXCLUSIONS.iter().find(|r| (r.matches)(req, meta)) {
        debug!(rule = rule.name, kind = %req.kind.kind, name = %meta.name, "classify: excluded");
        return Decision::Skip { rule: rule.name };
    }
    for field in meta.managed_fields.iter() {
        if let Some(rule) = PROVENANCE.iter().find(|r| (r.matches)(&field.manager, req, meta)) {
            debug!(rule = rule.name, manager = %field.manager, "classify: provenance matched");
            return Decision::Validate { rule: rule.name };
        }
    }
    debug!(kind = %req.kind.kind, name = %meta.name, "classify: no known field manager");
    Decision::Skip { rule: NO_PROVENANCE }
}

pub fn should_validate(req: &AdmissionRequest, meta: &ObjectMetadata) -> bool {
    classify(req, meta).should_validate()
}
