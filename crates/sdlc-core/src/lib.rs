pub mod events;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// One end-to-end pipeline invocation as listed by `GET /api/runs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub phase_status: String,
    #[serde(default)]
    pub prd_url: String,
    #[serde(default)]
    pub issue_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Orders runs newest `created_at` first. Equal timestamps keep fetch order.
pub fn sort_runs_newest_first(runs: &mut [Run]) {
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionType {
    #[default]
    Phase,
    Issue,
}

impl ExecutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionType::Phase => "phase",
            ExecutionType::Issue => "issue",
        }
    }
}

impl fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionType {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "phase" => Ok(ExecutionType::Phase),
            "issue" => Ok(ExecutionType::Issue),
            other => Err(format!("Unknown execution type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    WaitingInput,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::WaitingInput => "waiting_input",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses are never left once entered.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Statuses under which the execution is likely to change soon.
    pub fn is_live(&self) -> bool {
        matches!(self, ExecutionStatus::Running | ExecutionStatus::WaitingInput)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "running" => Ok(ExecutionStatus::Running),
            "waiting_input" | "waiting-input" => Ok(ExecutionStatus::WaitingInput),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" | "canceled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("Unknown execution status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    Assistant,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionMessage {
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
}

/// One unit of orchestrated work inside a run. Root executions have no
/// `parent_id`; per-issue sub-executions point at the phase execution that
/// spawned them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub id: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(rename = "type", default)]
    pub kind: ExecutionType,
    #[serde(default)]
    pub phase: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_non_empty"
    )]
    pub issue_id: Option<String>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub session_id: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub messages: Vec<ExecutionMessage>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub params: HashMap<String, String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_non_empty"
    )]
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tokens_in: i64,
    #[serde(default)]
    pub tokens_out: i64,
}

impl Execution {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Sidebar label: the issue id for issue executions, the phase otherwise.
    pub fn label(&self) -> &str {
        match (self.kind, self.issue_id.as_deref()) {
            (ExecutionType::Issue, Some(issue_id)) => issue_id,
            _ => &self.phase,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoConfig {
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub team: String,
    #[serde(default)]
    pub language: Option<String>,
}

/// Summary of the server-designated active run (`GET /api/status`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSummary {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub phase_status: String,
    #[serde(default)]
    pub prd_url: String,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub repos: Vec<RepoConfig>,
    #[serde(default)]
    pub issue_count: u32,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub artifacts: HashMap<String, String>,
    #[serde(default)]
    pub updated_at: String,
}

impl StatusSummary {
    pub fn active_run_id(&self) -> Option<&str> {
        let run_id = self.run_id.trim();
        if run_id.is_empty() {
            None
        } else {
            Some(run_id)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateExecutionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: ExecutionType,
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreatedExecution {
    pub id: String,
    #[serde(default)]
    pub session_id: String,
    pub status: ExecutionStatus,
}

/// Generic `{status}` acknowledgement returned by command endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandAck {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectRunRequest {
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunPhaseRequest {
    #[serde(default)]
    pub params: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Blocked,
    Ready,
    Implementing,
    Reviewing,
    AwaitingHuman,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IssueState {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub repo: String,
    pub status: IssueStatus,
    #[serde(default)]
    pub linear_id: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub worktree: Option<String>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub iterations: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IssuesOverview {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub issues: HashMap<String, IssueState>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub grouped: HashMap<IssueStatus, Vec<IssueState>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentUsage {
    #[serde(default)]
    pub tokens_in: i64,
    #[serde(default)]
    pub tokens_out: i64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub calls: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSummary {
    #[serde(default)]
    pub tokens_in: i64,
    #[serde(default)]
    pub tokens_out: i64,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub by_agent: HashMap<String, AgentUsage>,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub phase_timings: HashMap<String, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrationHealth {
    pub name: String,
    pub ok: bool,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub checked_at: String,
}

/// Treats `null` the same as an absent field.
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// The server omits some optional ids and sends `""` for others.
pub(crate) fn deserialize_non_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|raw| !raw.trim().is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(id: &str, created_at: &str) -> Run {
        Run {
            id: id.to_string(),
            phase: "design".to_string(),
            phase_status: "running".to_string(),
            prd_url: String::new(),
            issue_count: 0,
            created_at: created_at.parse().expect("timestamp"),
            updated_at: created_at.parse().expect("timestamp"),
        }
    }

    #[test]
    fn execution_type_defaults_to_phase() {
        assert_eq!(ExecutionType::default(), ExecutionType::Phase);
        assert_eq!(ExecutionType::default().to_string(), "phase");
    }

    #[test]
    fn runs_sort_newest_first() {
        let mut runs = vec![
            run("old", "2026-01-01T10:00:00Z"),
            run("new", "2026-01-03T10:00:00Z"),
            run("mid", "2026-01-02T10:00:00Z"),
        ];
        sort_runs_newest_first(&mut runs);
        let ids: Vec<_> = runs.iter().map(|run| run.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn execution_decodes_server_shape_with_empty_optional_ids() {
        let execution: Execution = serde_json::from_str(
            r#"{
                "id": "exec-1",
                "run_id": "run-1",
                "type": "issue",
                "phase": "executing",
                "issue_id": "ISS-4",
                "status": "waiting_input",
                "session_id": "sess-1",
                "messages": [
                    {"role": "assistant", "content": "ready?", "timestamp": "2026-02-07T21:00:00Z"}
                ],
                "params": null,
                "parent_id": "",
                "created_at": "2026-02-07T20:59:00.123456789Z",
                "updated_at": "2026-02-07T21:00:00+00:00",
                "tokens_in": 120,
                "tokens_out": 30
            }"#,
        )
        .expect("decode execution");

        assert_eq!(execution.kind, ExecutionType::Issue);
        assert_eq!(execution.status, ExecutionStatus::WaitingInput);
        assert!(execution.is_root());
        assert!(execution.params.is_empty());
        assert_eq!(execution.label(), "ISS-4");
        assert_eq!(execution.messages.len(), 1);
        assert_eq!(execution.messages[0].role, MessageRole::Assistant);
    }

    #[test]
    fn execution_status_classification() {
        assert!(ExecutionStatus::Running.is_live());
        assert!(ExecutionStatus::WaitingInput.is_live());
        assert!(!ExecutionStatus::Completed.is_live());
        for status in [
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
        }
        assert_eq!(
            "canceled".parse::<ExecutionStatus>(),
            Ok(ExecutionStatus::Cancelled)
        );
        assert!("paused".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn create_request_omits_absent_optionals() {
        let request = CreateExecutionRequest {
            run_id: None,
            kind: ExecutionType::Phase,
            phase: "design".to_string(),
            issue_id: None,
            params: HashMap::new(),
        };
        let encoded = serde_json::to_value(&request).expect("encode");
        assert_eq!(
            encoded,
            serde_json::json!({"type": "phase", "phase": "design", "params": {}})
        );
    }

    #[test]
    fn status_summary_tolerates_missing_fields() {
        let status: StatusSummary =
            serde_json::from_str(r#"{"run_id":"  ","repos":null}"#).expect("decode status");
        assert_eq!(status.active_run_id(), None);
        assert!(status.repos.is_empty());
    }
}
