//! Agent backend and QA dispatcher over a local agent CLI.
//!
//! The CLI receives a JSON payload on stdin and must answer with a single
//! JSON document on stdout:
//!
//! ```json
//! {"session_id": "...", "outputs": {"content-output.json": {...}}, "diagnostics": {}}
//! ```
//!
//! Sessions are resumed only by explicit id (`resume <session>`); the CLI's
//! continue-most-recent mode is never used: in a daemon, "most recent" is
//! whichever run touched the backend last, which is not necessarily ours.

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::run_command;
use crate::caps::{
    AgentBackend, AgentRequest, AgentResult, ModelDispatcher, QaHistoryEntry, SessionHandle,
};
use crate::error::{CapError, ToolKind};
use crate::types::QaCritique;

/// Exit code the agent CLI uses for retryable conditions (rate limits,
/// upstream timeouts), mirroring BSD `EX_TEMPFAIL`.
const EXIT_TEMPFAIL: i32 = 75;

/// Exit code for refused work on cost grounds.
const EXIT_QUOTA: i32 = 77;

/// Subprocess-backed agent executor.
pub struct AgentCliBackend {
    binary: String,
    name: &'static str,
}

impl AgentCliBackend {
    #[must_use]
    pub fn new(binary: impl Into<String>, name: &'static str) -> Self {
        Self {
            binary: binary.into(),
            name,
        }
    }

    fn payload(request: &AgentRequest) -> String {
        serde_json::json!({
            "run_id": request.run_id.to_string(),
            "stage": request.stage,
            "inputs": request.inputs,
            "instructions": request.instructions,
            "expected_outputs": request.expected_outputs,
            "model": request.model,
        })
        .to_string()
    }

    fn classify_exit(&self, code: i32, stderr_tail: &str) -> CapError {
        match code {
            EXIT_TEMPFAIL => CapError::transient(self.name, stderr_tail.to_string()),
            EXIT_QUOTA => CapError::tool(self.name, ToolKind::QuotaExceeded, stderr_tail.to_string()),
            _ => CapError::tool(
                self.name,
                ToolKind::CapabilityUnavailable,
                format!("agent CLI exited {code}: {stderr_tail}"),
            ),
        }
    }

    fn parse_result(&self, stdout: &str) -> Result<AgentResult, CapError> {
        let value: serde_json::Value = serde_json::from_str(stdout)
            .map_err(|e| CapError::parse(self.name, format!("agent output is not JSON: {e}")))?;
        let session = value
            .get("session_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CapError::parse(self.name, "agent output lacks session_id"))?;
        let outputs: BTreeMap<String, serde_json::Value> = value
            .get("outputs")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .ok_or_else(|| CapError::parse(self.name, "agent output lacks outputs map"))?;
        let diagnostics: BTreeMap<String, serde_json::Value> = value
            .get("diagnostics")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        Ok(AgentResult {
            session: SessionHandle(session.to_string()),
            raw_output: stdout.to_string(),
            artifacts: outputs,
            diagnostics,
        })
    }

    async fn invoke(&self, args: Vec<String>, payload: String) -> Result<AgentResult, CapError> {
        let output = run_command(self.name, &self.binary, &args, Some(&payload)).await?;
        if !output.success() {
            return Err(self.classify_exit(output.status_code, output.stderr_tail()));
        }
        self.parse_result(&output.stdout)
    }
}

#[async_trait]
impl AgentBackend for AgentCliBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, request: &AgentRequest) -> Result<AgentResult, CapError> {
        self.invoke(
            vec!["run".to_string(), "--output-format".to_string(), "json".to_string()],
            Self::payload(request),
        )
        .await
    }

    async fn resume(
        &self,
        session: &SessionHandle,
        request: &AgentRequest,
    ) -> Result<AgentResult, CapError> {
        self.invoke(
            vec![
                "resume".to_string(),
                session.0.clone(),
                "--output-format".to_string(),
                "json".to_string(),
            ],
            Self::payload(request),
        )
        .await
    }

    async fn fork(&self, session: &SessionHandle) -> Result<SessionHandle, CapError> {
        let output = run_command(
            self.name,
            &self.binary,
            &["fork".to_string(), session.0.clone()],
            None,
        )
        .await?;
        if !output.success() {
            return Err(self.classify_exit(output.status_code, output.stderr_tail()));
        }
        let value: serde_json::Value = serde_json::from_str(&output.stdout)
            .map_err(|e| CapError::parse(self.name, format!("fork output is not JSON: {e}")))?;
        value
            .get("session_id")
            .and_then(|v| v.as_str())
            .map(|s| SessionHandle(s.to_string()))
            .ok_or_else(|| CapError::parse(self.name, "fork output lacks session_id"))
    }
}

/// QA dispatcher over the same agent CLI's `qa` subcommand.
pub struct AgentCliDispatcher {
    binary: String,
    critic_model: String,
}

impl AgentCliDispatcher {
    #[must_use]
    pub fn new(binary: impl Into<String>, critic_model: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            critic_model: critic_model.into(),
        }
    }

    async fn dispatch(
        &self,
        model: &str,
        payload: serde_json::Value,
    ) -> Result<QaCritique, CapError> {
        let output = run_command(
            "critic",
            &self.binary,
            &["qa".to_string(), "--model".to_string(), model.to_string()],
            Some(&payload.to_string()),
        )
        .await?;
        if !output.success() {
            return Err(match output.status_code {
                EXIT_TEMPFAIL => CapError::transient("critic", output.stderr_tail().to_string()),
                EXIT_QUOTA => CapError::tool(
                    "critic",
                    ToolKind::QuotaExceeded,
                    output.stderr_tail().to_string(),
                ),
                code => CapError::tool(
                    "critic",
                    ToolKind::CapabilityUnavailable,
                    format!("critic exited {code}: {}", output.stderr_tail()),
                ),
            });
        }
        let raw: serde_json::Value = serde_json::from_str(&output.stdout)
            .map_err(|e| CapError::parse("critic", format!("critique is not JSON: {e}")))?;
        QaCritique::from_json(&raw).map_err(|e| CapError::parse("critic", e.to_string()))
    }
}

#[async_trait]
impl ModelDispatcher for AgentCliDispatcher {
    async fn dispatch_qa(
        &self,
        artifact: &serde_json::Value,
        requirements: &str,
        history: &[QaHistoryEntry],
    ) -> Result<QaCritique, CapError> {
        self.dispatch(
            &self.critic_model,
            serde_json::json!({
                "task": "qa",
                "artifact": artifact,
                "requirements": requirements,
                "history": history,
            }),
        )
        .await
    }

    async fn dispatch_review(&self, diff: &str, standards: &str) -> Result<QaCritique, CapError> {
        self.dispatch(
            &self.critic_model,
            serde_json::json!({"task": "review", "diff": diff, "standards": standards}),
        )
        .await
    }

    async fn consensus(&self, models: &[String], task: &str) -> Result<QaCritique, CapError> {
        let mut critiques = Vec::with_capacity(models.len());
        for model in models {
            critiques
                .push(self.dispatch(model, serde_json::json!({"task": task})).await?);
        }
        critiques
            .into_iter()
            .max_by_key(|c| (c.score, std::cmp::Reverse(c.blockers.len())))
            .ok_or_else(|| CapError::parse("critic", "consensus over zero models"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_classify_into_the_taxonomy() {
        let backend = AgentCliBackend::new("agent", "agent-cli");
        assert_eq!(
            backend.classify_exit(EXIT_TEMPFAIL, "rate limited").class,
            crate::error::ErrorClass::Transient
        );
        assert_eq!(
            backend.classify_exit(EXIT_QUOTA, "budget spent").class,
            crate::error::ErrorClass::Tool(ToolKind::QuotaExceeded)
        );
        assert_eq!(
            backend.classify_exit(1, "boom").class,
            crate::error::ErrorClass::Tool(ToolKind::CapabilityUnavailable)
        );
    }

    #[test]
    fn agent_output_parse_requires_session_and_outputs() {
        let backend = AgentCliBackend::new("agent", "agent-cli");
        assert!(backend.parse_result("not json").is_err());
        assert!(backend.parse_result(r#"{"outputs": {}}"#).is_err());

        let parsed = backend
            .parse_result(r#"{"session_id": "s-1", "outputs": {"router-output.json": {}}}"#)
            .unwrap();
        assert_eq!(parsed.session.0, "s-1");
        assert!(parsed.artifacts.contains_key("router-output.json"));
    }
}
