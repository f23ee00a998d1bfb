//! Policy engine run as a child process.
//!
//! The engine reads `{"policy": …, "object": …}` on stdin and writes one
//! [`EvaluationOutcome`] as JSON on stdout. It is killed if the caller stops
//! waiting for it.

use std::process::Stdio;

use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use vigil_core::EvaluationOutcome;

use crate::{EvaluatorError, PolicyDefinition, PolicyEvaluator};

#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    program: String,
    args: Vec<String>,
}

impl CommandEvaluator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self { Self { program: program.into(), args } }

    /// Split a whitespace-separated command line; `None` if it is blank.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self { program, args: parts.collect() })
    }
}

#[async_trait::async_trait]
impl PolicyEvaluator for CommandEvaluator {
    async fn evaluate(
        &self,
        policy: &PolicyDefinition,
        object: &serde_json::Value,
    ) -> Result<EvaluationOutcome, EvaluatorError> {
        let input = serde_json::to_vec(&json!({ "policy": policy, "object": object }))?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take();
        let write = async move {
            if let Some(mut stdin) = stdin {
                // The engine may exit without reading everything; its exit status decides.
                let _ = stdin.write_all(&input).await;
            }
        };
        let ((), out) = tokio::join!(write, child.wait_with_output());
        let out = out?;
        if !out.status.success() {
            return Err(EvaluatorError::Failed {
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        let mut outcome: EvaluationOutcome = serde_json::from_slice(&out.stdout)?;
        if outcome.policy_name.is_empty() {
            outcome.policy_name = policy.name.clone();
        }
        debug!(program = %self.program, passed = outcome.passed_checks, "engine: evaluated");
        Ok(outcome)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandEvaluator { CommandEvaluator::new("sh", vec!["-c".into(), script.into()]) }

    fn policy() -> PolicyDefinition { PolicyDefinition { name: "Starter".into(), is_default: true, ..Default::default() } }

    #[tokio::test]
    async fn parses_engine_output() {
        let ev = sh(r#"cat >/dev/null; echo '{"passedChecks":0,"rulesCount":3,"report":"missing probes"}'"#);
        let out = ev.evaluate(&policy(), &json!({"kind": "Pod"})).await.unwrap();
        assert_eq!(out.rules_count, 3);
        assert!(!out.passed());
        assert_eq!(out.policy_name, "Starter");
    }

    #[tokio::test]
    async fn engine_sees_policy_and_object() {
        let ev = sh(r#"grep -q '"kind":"Pod"' && echo '{"passedChecks":1}'"#);
        let out = ev.evaluate(&policy(), &json!({"kind": "Pod"})).await.unwrap();
        assert!(out.passed());
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let err = sh("echo boom >&2; exit 3").evaluate(&policy(), &json!({})).await.unwrap_err();
        match err {
            EvaluatorError::Failed { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_output_is_an_error() {
        let err = sh("echo not-json").evaluate(&policy(), &json!({})).await.unwrap_err();
        assert!(matches!(err, EvaluatorError::Output(_)));
    }

    #[test]
    fn command_line_split() {
        let ev = CommandEvaluator::from_command_line("  vigil-engine  --format json ").unwrap();
        assert_eq!(ev.program, "vigil-engine");
        assert_eq!(ev.args, vec!["--format", "json"]);
        assert!(CommandEvaluator::from_command_line("   ").is_none());
    }
}
