//! Process configuration: flags backed by environment variables.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use tracing::{debug, info, warn};
use vigil_api::{BackendSettings, PipelineConfig};
use vigil_classify::SkipList;
use vigil_kubehub::ElectionConfig;
use vigil_telemetry::AggregatorConfig;

pub const WEBHOOK_VERSION: &str = env!("CARGO_PKG_VERSION");
const SKIP_LIST_FILE: &str = "skiplist";

#[derive(Parser, Debug, Clone)]
#[command(name = "vigil-webhook", version, about = "Validating admission webhook")]
pub struct Cli {
    #[arg(long, env = "LISTEN_PORT", default_value_t = 8443)]
    pub port: u16,
    #[arg(long, env = "VIGIL_TOKEN", default_value = "", hide_env_values = true)]
    pub token: String,
    #[arg(long, env = "VIGIL_CLIENT_ID", default_value = "")]
    pub client_id: String,
    #[arg(long, env = "VIGIL_POLICY", default_value = "")]
    pub policy: String,
    #[arg(long, env = "VIGIL_ENFORCE", action = ArgAction::Set, default_value = "false", value_parser = BoolishValueParser::new())]
    pub enforce: bool,
    #[arg(long, env = "VIGIL_VERBOSE", action = ArgAction::Set, default_value = "false", value_parser = BoolishValueParser::new())]
    pub verbose: bool,
    #[arg(long, env = "VIGIL_OUTPUT", default_value = "")]
    pub output: String,
    #[arg(long, env = "VIGIL_NO_RECORD", action = ArgAction::Set, default_value = "false", value_parser = BoolishValueParser::new())]
    pub no_record: bool,
    #[arg(long, env = "VIGIL_CONFIG_FROM_HELM", action = ArgAction::Set, default_value = "false", value_parser = BoolishValueParser::new())]
    pub config_from_helm: bool,
    #[arg(long, env = "VIGIL_CLUSTER_NAME", default_value = "")]
    pub cluster_name: String,
    #[arg(long, env = "VIGIL_BACKEND_URL")]
    pub backend_url: String,
    /// Namespace holding the leader lease.
    #[arg(long, env = "VIGIL_NAMESPACE", default_value = "vigil")]
    pub namespace: String,
    /// Lease identity; a random one is generated when empty.
    #[arg(long, env = "POD_NAME", default_value = "")]
    pub pod_name: String,
    #[arg(long, env = "VIGIL_TLS_DIR", default_value = "/run/secrets/tls")]
    pub tls_dir: PathBuf,
    #[arg(long, env = "VIGIL_CONFIG_DIR", default_value = "/config")]
    pub config_dir: PathBuf,
    #[arg(long, env = "VIGIL_ENGINE_CMD", default_value = "vigil-engine")]
    pub engine_cmd: String,
    #[arg(long, env = "VIGIL_EVAL_TIMEOUT_SECS", default_value_t = 20)]
    pub eval_timeout_secs: u64,
    #[arg(long, env = "VIGIL_BACKEND_TIMEOUT_SECS", default_value_t = 10)]
    pub backend_timeout_secs: u64,
    #[arg(long, env = "VIGIL_FLUSH_INTERVAL_SECS", default_value_t = 3600)]
    pub flush_interval_secs: u64,
}

impl Cli {
    pub fn identity(&self) -> String {
        if self.pod_name.is_empty() { format!("vigil-{}", uuid::Uuid::new_v4()) } else { self.pod_name.clone() }
    }

    pub fn flush_interval(&self) -> Duration { Duration::from_secs(self.flush_interval_secs.max(1)) }

    pub fn pipeline_config(&self, skip_list: SkipList) -> PipelineConfig {
        PipelineConfig {
            token: self.token.clone(),
            client_id: self.client_id.clone(),
            policy_name: self.policy.clone(),
            enforce: self.enforce,
            config_from_helm: self.config_from_helm,
            no_record: self.no_record,
            webhook_version: WEBHOOK_VERSION.to_string(),
            skip_list,
            bypass_permissions: None,
            eval_timeout: Duration::from_secs(self.eval_timeout_secs),
        }
    }

    pub fn election_config(&self) -> ElectionConfig {
        ElectionConfig { namespace: self.namespace.clone(), identity: self.identity(), ..Default::default() }
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig { send_timeout: Duration::from_secs(self.backend_timeout_secs), ..Default::default() }
    }

    pub fn backend_settings(&self) -> BackendSettings {
        BackendSettings {
            base_url: self.backend_url.clone(),
            timeout: Duration::from_secs(self.backend_timeout_secs),
            token: self.token.clone(),
            client_id: self.client_id.clone(),
            cluster_name: self.cluster_name.clone(),
            policy_name: self.policy.clone(),
            verbose: self.verbose,
            output: self.output.clone(),
            no_record: self.no_record,
            enforce: self.enforce,
            webhook_version: WEBHOOK_VERSION.to_string(),
        }
    }
}

/// Read `<dir>/skiplist`, a YAML list of `namespace;kind;name` entries.
/// A missing, unreadable or malformed file yields an empty list.
pub fn load_skip_list(dir: &Path) -> SkipList {
    let path = dir.join(SKIP_LIST_FILE);
    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "config: no skip list");
            return SkipList::default();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config: skip list unreadable");
            return SkipList::default();
        }
    };
    match serde_yaml::from_str::<Option<Vec<String>>>(&text) {
        Ok(entries) => {
            let list = SkipList::new(entries.unwrap_or_default());
            info!(entries = list.len(), "config: skip list loaded");
            list
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "config: skip list is not a YAML list of strings");
            SkipList::default()
        }
    }
}
