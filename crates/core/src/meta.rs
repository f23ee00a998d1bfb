//! Metadata projection of the raw admission object.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use smallvec::SmallVec;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldManager {
    pub manager: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
    #[serde(default)]
    pub block_owner_deletion: bool,
}

impl OwnerReference {
    /// An owner counts only when it names both a kind and an object.
    pub fn is_set(&self) -> bool { !self.kind.is_empty() && !self.name.is_empty() }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("admission request carries no object")]
    MissingObject,
    #[error("admission object is not a JSON object (got {0})")]
    NotAnObject(&'static str),
}

/// Read-only projection of `metadata` used by classification and telemetry.
///
/// Absent fields project to empty values; an empty `deletion_timestamp` means
/// the object is not being deleted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub name: String,
    pub namespace: String,
    pub deletion_timestamp: String,
    pub managed_fields: SmallVec<[FieldManager; 4]>,
    pub labels: BTreeMap<String, String>,
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMetadata {
    pub fn from_object(raw: Option<&Json>) -> Result<Self, MetadataError> {
        let raw = raw.ok_or(MetadataError::MissingObject)?;
        if !raw.is_object() {
            return Err(MetadataError::NotAnObject(json_type(raw)));
        }
        let meta = match raw.get("metadata").and_then(|m| m.as_object()) {
            Some(m) => m,
            None => return Ok(Self::default()),
        };
        let str_field = |k: &str| meta.get(k).and_then(|v| v.as_str()).unwrap_or("").to_string();

        let managed_fields = meta
            .get("managedFields")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .map(|e| FieldManager {
                        manager: e.get("manager").and_then(|m| m.as_str()).unwrap_or("").to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut labels = BTreeMap::new();
        if let Some(lbls) = meta.get("labels").and_then(|m| m.as_object()) {
            for (k, v) in lbls.iter() {
                if let Some(val) = v.as_str() { labels.insert(k.clone(), val.to_string()); }
            }
        }

        // Entries that fail to decode are dropped rather than failing the whole projection.
        let owner_references = meta
            .get("ownerReferences")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|o| serde_json::from_value::<OwnerReference>(o.clone()).ok()).collect())
            .unwrap_or_default();

        Ok(Self {
            name: str_field("name"),
            namespace: str_field("namespace"),
            deletion_timestamp: str_field("deletionTimestamp"),
            managed_fields,
            labels,
            owner_references,
        })
    }

    pub fn managers(&self) -> Vec<String> {
        self.managed_fields.iter().map(|f| f.manager.clone()).collect()
    }

    pub fn is_deleted(&self) -> bool { !self.deletion_timestamp.is_empty() }

    pub fn has_owner(&self) -> bool { self.owner_references.iter().any(OwnerReference::is_set) }
}

fn json_type(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn projects_known_fields() {
        let raw = json!({
            "metadata": {
                "name": "web",
                "namespace": "default",
                "managedFields": [{"manager": "kubectl-client-side-apply"}, {"operation": "Update"}],
                "labels": {"app": "web", "weird": 3},
                "ownerReferences": [{"kind": "ReplicaSet", "name": "web-abc", "uid": "u1"}]
            }
        });
        let m = ObjectMetadata::from_object(Some(&raw)).unwrap();
        assert_eq!(m.name, "web");
        assert_eq!(m.managers(), vec!["kubectl-client-side-apply".to_string(), String::new()]);
        assert_eq!(m.labels.len(), 1);
        assert!(m.has_owner());
        assert!(!m.is_deleted());
    }

    #[test]
    fn missing_metadata_projects_empty() {
        let m = ObjectMetadata::from_object(Some(&json!({"spec": {}}))).unwrap();
        assert_eq!(m, ObjectMetadata::default());
    }

    #[test]
    fn non_object_is_rejected() {
        assert_eq!(ObjectMetadata::from_object(None), Err(MetadataError::MissingObject));
        assert_eq!(ObjectMetadata::from_object(Some(&json!([1]))), Err(MetadataError::NotAnObject("array")));
    }

    #[test]
    fn owner_without_name_does_not_count() {
        let raw = json!({"metadata": {"name": "x", "ownerReferences": [{"kind": "Deployment"}]}});
        assert!(!ObjectMetadata::from_object(Some(&raw)).unwrap().has_owner());
    }
}
