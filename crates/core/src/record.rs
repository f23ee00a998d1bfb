//! Telemetry record describing one admission outcome.

use serde::{Deserialize, Serialize};

use crate::meta::OwnerReference;

/// Snapshot of the scanning filters active when the record was produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScanningFilters {
    #[serde(default)]
    pub skip_list: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRequestMetadata {
    pub cluster_uuid: String,
    pub webhook_version: String,
    pub cli_evaluation_id: i64,
    pub token: String,
    pub skipped: bool,
    pub allowed: bool,
    pub resource_kind: String,
    pub resource_name: String,
    pub managers: Vec<String>,
    pub policy_name: String,
    pub k8s_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default)]
    pub config_map_scanning_filters: ScanningFilters,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    pub occurrences: u32,
}

impl ClusterRequestMetadata {
    /// Canonical identity of the event: every field except `occurrences`,
    /// serialized with sorted object keys.
    pub fn canonical_key(&self) -> Result<String, serde_json::Error> {
        let mut v = serde_json::to_value(self)?;
        if let Some(obj) = v.as_object_mut() {
            obj.remove("occurrences");
        }
        serde_json::to_string(&v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_occurrences_only() {
        let a = ClusterRequestMetadata { resource_name: "a".into(), occurrences: 1, ..Default::default() };
        let mut b = a.clone();
        b.occurrences = 7;
        assert_eq!(a.canonical_key().unwrap(), b.canonical_key().unwrap());
        b.allowed = !a.allowed;
        assert_ne!(a.canonical_key().unwrap(), b.canonical_key().unwrap());
    }

    #[test]
    fn key_is_stable_across_field_order() {
        let r = ClusterRequestMetadata { namespace: "ns".into(), occurrences: 1, ..Default::default() };
        let key = r.canonical_key().unwrap();
        let back: serde_json::Value = serde_json::from_str(&key).unwrap();
        let keys: Vec<_> = back.as_object().unwrap().keys().cloned().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(!key.contains("occurrences"));
    }
}
