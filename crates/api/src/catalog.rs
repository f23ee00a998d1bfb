//! Per-request policy catalog fetched from the backend before evaluation.

use regex::Regex;
use serde::{Deserialize, Serialize};
use vigil_core::UserInfo;

use crate::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionOnFailure {
    Enforce,
    Monitor,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDefinition {
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
    /// Rule configuration, handed to the evaluator untouched.
    #[serde(default)]
    pub rules: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<NamespaceRestrictions>,
}

impl PolicyDefinition {
    /// Whether this policy runs for objects in `namespace`. Unrestricted
    /// policies run everywhere.
    pub fn runs_in(&self, namespace: &str) -> bool {
        self.namespaces.as_ref().map_or(true, |n| n.allows(namespace))
    }
}

/// Namespace regexes limiting where a policy runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceRestrictions {
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

impl NamespaceRestrictions {
    /// An exclude match wins; otherwise an include pattern must match.
    /// Malformed patterns never match.
    pub fn allows(&self, namespace: &str) -> bool {
        !any_match(&self.exclude_patterns, namespace) && any_match(&self.include_patterns, namespace)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoliciesDocument {
    #[serde(default)]
    pub policies: Vec<PolicyDefinition>,
    #[serde(default)]
    pub custom_rules: serde_json::Value,
}

/// Regexes naming principals whose failing objects are admitted anyway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BypassPermissions {
    #[serde(default)]
    pub user_accounts: Vec<String>,
    #[serde(default)]
    pub service_accounts: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

fn any_match(patterns: &[String], value: &str) -> bool {
    patterns.iter().any(|p| Regex::new(p).map(|re| re.is_match(value)).unwrap_or(false))
}

impl BypassPermissions {
    /// True when the user name or one of its groups matches. Malformed
    /// patterns never match.
    pub fn allows(&self, user: &UserInfo) -> bool {
        any_match(&self.user_accounts, &user.username)
            || any_match(&self.service_accounts, &user.username)
            || user.groups.iter().any(|g| any_match(&self.groups, g))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyCatalog {
    #[serde(default)]
    pub policies_json: PoliciesDocument,
    #[serde(default, rename = "registrationURL")]
    pub registration_url: String,
    #[serde(default)]
    pub action_on_failure: Option<ActionOnFailure>,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default)]
    pub bypass_permissions: Option<BypassPermissions>,
}

impl PolicyCatalog {
    pub fn find(&self, name: &str) -> Option<&PolicyDefinition> {
        self.policies_json.policies.iter().find(|p| p.name == name)
    }

    pub fn default_policy(&self) -> Option<&PolicyDefinition> {
        self.policies_json.policies.iter().find(|p| p.is_default)
    }

    /// Pick the configured policy, or the account default when the name is
    /// empty or unknown. The second value is a warning for the fallback case.
    pub fn resolve(&self, name: &str) -> Result<(&PolicyDefinition, Option<String>), PipelineError> {
        if !name.is_empty() {
            if let Some(p) = self.find(name) {
                return Ok((p, None));
            }
        }
        let default = self.default_policy().ok_or_else(|| PipelineError::NoPolicy(name.to_string()))?;
        let warning = (!name.is_empty())
            .then(|| format!("Policy \"{name}\" not found, falling back to default policy \"{}\"", default.name));
        Ok((default, warning))
    }

    /// `{base}/cli/invocations/{id}?webhook=true`, where base is the
    /// registration URL cut after its host.
    pub fn report_link(&self, evaluation_id: i64) -> String {
        format!("{}/cli/invocations/{evaluation_id}?webhook=true", url_base(&self.registration_url))
    }
}

fn url_base(url: &str) -> &str {
    let after_scheme = url.find("://").map(|i| i + 3).unwrap_or(0);
    match url[after_scheme..].find('/') {
        Some(i) => &url[..after_scheme + i],
        None => url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> PolicyCatalog {
        serde_json::from_value(serde_json::json!({
            "policiesJson": { "policies": [
                { "name": "Starter", "isDefault": true, "rules": [] },
                { "name": "Strict", "rules": [{ "identifier": "CONTAINERS_MISSING_LIVENESSPROBE_KEY" }] }
            ]},
            "registrationURL": "https://app.example.io/login?t=abc",
            "actionOnFailure": "monitor",
            "ignorePatterns": ["kube-system;.*;.*"]
        }))
        .unwrap()
    }

    #[test]
    fn named_policy_wins() {
        let c = catalog();
        let (p, w) = c.resolve("Strict").unwrap();
        assert_eq!(p.name, "Strict");
        assert!(w.is_none());
    }

    #[test]
    fn unknown_policy_falls_back_with_warning() {
        let c = catalog();
        let (p, w) = c.resolve("Missing").unwrap();
        assert_eq!(p.name, "Starter");
        assert!(w.unwrap().contains("\"Missing\" not found"));
        let (p, w) = c.resolve("").unwrap();
        assert_eq!(p.name, "Starter");
        assert!(w.is_none());
    }

    #[test]
    fn no_default_is_an_error() {
        let c = PolicyCatalog::default();
        assert!(matches!(c.resolve("x"), Err(PipelineError::NoPolicy(_))));
    }

    #[test]
    fn link_uses_registration_host() {
        assert_eq!(catalog().report_link(42), "https://app.example.io/cli/invocations/42?webhook=true");
        let bare = PolicyCatalog { registration_url: "https://app.example.io".into(), ..Default::default() };
        assert_eq!(bare.report_link(-2), "https://app.example.io/cli/invocations/-2?webhook=true");
    }

    #[test]
    fn bypass_by_user_or_group() {
        let b = BypassPermissions {
            user_accounts: vec!["^alice$".into()],
            service_accounts: vec!["^system:serviceaccount:ci:".into()],
            groups: vec!["(broken".into(), "^platform-admins$".into()],
        };
        let user = |name: &str, groups: &[&str]| UserInfo {
            username: name.into(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            ..Default::default()
        };
        assert!(b.allows(&user("alice", &[])));
        assert!(b.allows(&user("system:serviceaccount:ci:deployer", &[])));
        assert!(b.allows(&user("bob", &["devs", "platform-admins"])));
        assert!(!b.allows(&user("bob", &["devs"])));
    }

    #[test]
    fn namespace_restrictions() {
        let open = PolicyDefinition::default();
        assert!(open.runs_in("anything"));
        let p = PolicyDefinition {
            namespaces: Some(NamespaceRestrictions {
                include_patterns: vec!["^team-".into(), "(broken".into()],
                exclude_patterns: vec!["^team-sandbox$".into()],
            }),
            ..Default::default()
        };
        assert!(p.runs_in("team-payments"));
        assert!(!p.runs_in("team-sandbox"));
        assert!(!p.runs_in("default"));
    }
}
