//! Scripted in-memory orchestrator used by the unit tests.

use crate::api::SdlcApi;
use crate::error::ClientError;
use async_trait::async_trait;
use sdlc_core::{
    CommandAck, CreateExecutionRequest, CreatedExecution, Execution, ExecutionStatus,
    ExecutionType, IntegrationHealth, IssuesOverview, MetricsSummary, Run, StatusSummary,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

pub fn run(id: &str, created_at: &str) -> Run {
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

pub fn execution(
    id: &str,
    run_id: &str,
    parent_id: Option<&str>,
    status: ExecutionStatus,
    created_at: &str,
) -> Execution {
    Execution {
        id: id.to_string(),
        run_id: run_id.to_string(),
        kind: if parent_id.is_some() {
            ExecutionType::Issue
        } else {
            ExecutionType::Phase
        },
        phase: "design".to_string(),
        issue_id: parent_id.map(|_| format!("ISS-{id}")),
        status,
        session_id: format!("sess-{id}"),
        messages: Vec::new(),
        params: HashMap::new(),
        parent_id: parent_id.map(str::to_string),
        created_at: created_at.parse().expect("timestamp"),
        updated_at: created_at.parse().expect("timestamp"),
        tokens_in: 0,
        tokens_out: 0,
    }
}

#[derive(Default)]
struct FakeState {
    runs: Vec<Run>,
    status: StatusSummary,
    executions: Vec<Execution>,
    calls: Vec<String>,
    gates: HashMap<String, Arc<Semaphore>>,
    fail_runs: bool,
    fail_status: bool,
    fail_get: bool,
    fail_list: bool,
    fail_commands: bool,
    created: usize,
}

/// Every call is recorded as `"<method>"` plus `"<method>:<arg>"`; a call whose
/// keyed name is held blocks until [`FakeApi::release`] is called.
#[derive(Default)]
pub struct FakeApi {
    state: Mutex<FakeState>,
}

impl FakeApi {
    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().expect("fake state");
        f(&mut state)
    }

    pub fn set_runs(&self, runs: Vec<Run>) {
        self.with_state(|state| state.runs = runs);
    }

    pub fn set_active_run(&self, run_id: &str) {
        self.with_state(|state| state.status.run_id = run_id.to_string());
    }

    pub fn put_execution(&self, execution: Execution) {
        self.with_state(|state| {
            match state.executions.iter_mut().find(|item| item.id == execution.id) {
                Some(existing) => *existing = execution,
                None => state.executions.push(execution),
            }
        });
    }

    pub fn set_execution_status(&self, execution_id: &str, status: ExecutionStatus) {
        self.with_state(|state| {
            if let Some(existing) = state
                .executions
                .iter_mut()
                .find(|item| item.id == execution_id)
            {
                existing.status = status;
            }
        });
    }

    pub fn fail_runs(&self, fail: bool) {
        self.with_state(|state| state.fail_runs = fail);
    }

    pub fn fail_status(&self, fail: bool) {
        self.with_state(|state| state.fail_status = fail);
    }

    pub fn fail_get(&self, fail: bool) {
        self.with_state(|state| state.fail_get = fail);
    }

    pub fn fail_list(&self, fail: bool) {
        self.with_state(|state| state.fail_list = fail);
    }

    pub fn fail_commands(&self, fail: bool) {
        self.with_state(|state| state.fail_commands = fail);
    }

    pub fn hold(&self, key: &str) {
        self.with_state(|state| {
            state
                .gates
                .insert(key.to_string(), Arc::new(Semaphore::new(0)));
        });
    }

    pub fn release(&self, key: &str) {
        self.with_state(|state| {
            if let Some(gate) = state.gates.remove(key) {
                gate.add_permits(Semaphore::MAX_PERMITS / 2);
            }
        });
    }

    pub fn calls(&self, key: &str) -> usize {
        self.with_state(|state| state.calls.iter().filter(|call| *call == key).count())
    }

    async fn enter(&self, method: &str, arg: Option<&str>) {
        let keyed = arg.map(|arg| format!("{method}:{arg}"));
        let gate = self.with_state(|state| {
            state.calls.push(method.to_string());
            if let Some(keyed) = &keyed {
                state.calls.push(keyed.clone());
            }
            keyed
                .as_ref()
                .and_then(|keyed| state.gates.get(keyed).cloned())
                .or_else(|| state.gates.get(method).cloned())
        });
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate").forget();
        }
    }

    fn command_result(&self) -> Result<CommandAck, ClientError> {
        self.with_state(|state| {
            if state.fail_commands {
                Err(server_error())
            } else {
                Ok(CommandAck {
                    status: "ok".to_string(),
                    phase: None,
                })
            }
        })
    }
}

fn server_error() -> ClientError {
    ClientError::Status {
        status: 500,
        body: "orchestrator unavailable".to_string(),
    }
}

#[async_trait]
impl SdlcApi for FakeApi {
    async fn status(&self) -> Result<StatusSummary, ClientError> {
        self.enter("status", None).await;
        self.with_state(|state| {
            if state.fail_status {
                Err(ClientError::Transport("connection refused".to_string()))
            } else {
                Ok(state.status.clone())
            }
        })
    }

    async fn list_runs(&self) -> Result<Vec<Run>, ClientError> {
        self.enter("list_runs", None).await;
        self.with_state(|state| {
            if state.fail_runs {
                Err(ClientError::Transport("connection refused".to_string()))
            } else {
                Ok(state.runs.clone())
            }
        })
    }

    async fn select_run(&self, run_id: &str) -> Result<CommandAck, ClientError> {
        self.enter("select_run", Some(run_id)).await;
        let ack = self.command_result()?;
        self.set_active_run(run_id);
        Ok(ack)
    }

    async fn list_executions(&self, run_id: Option<&str>) -> Result<Vec<Execution>, ClientError> {
        self.enter("list_executions", run_id).await;
        self.with_state(|state| {
            if state.fail_list {
                return Err(ClientError::Transport("connection reset".to_string()));
            }
            Ok(state
                .executions
                .iter()
                .filter(|item| run_id.map(|run_id| item.run_id == run_id).unwrap_or(true))
                .cloned()
                .collect())
        })
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Execution, ClientError> {
        self.enter("get_execution", Some(execution_id)).await;
        self.with_state(|state| {
            if state.fail_get {
                return Err(server_error());
            }
            state
                .executions
                .iter()
                .find(|item| item.id == execution_id)
                .cloned()
                .ok_or_else(|| ClientError::Status {
                    status: 404,
                    body: "execution not found".to_string(),
                })
        })
    }

    async fn create_execution(
        &self,
        request: &CreateExecutionRequest,
    ) -> Result<CreatedExecution, ClientError> {
        self.enter("create_execution", None).await;
        self.with_state(|state| {
            if state.fail_commands {
                return Err(server_error());
            }
            state.created += 1;
            let id = format!("exec-new-{}", state.created);
            let run_id = request
                .run_id
                .clone()
                .unwrap_or_else(|| state.status.run_id.clone());
            let mut created = execution(
                &id,
                &run_id,
                None,
                ExecutionStatus::Running,
                "2026-02-07T21:00:00Z",
            );
            created.kind = request.kind;
            created.phase = request.phase.clone();
            created.issue_id = request.issue_id.clone();
            created.params = request.params.clone();
            state.executions.push(created);
            Ok(CreatedExecution {
                id: id.clone(),
                session_id: format!("sess-{id}"),
                status: ExecutionStatus::Running,
            })
        })
    }

    async fn send_message(
        &self,
        execution_id: &str,
        _content: &str,
    ) -> Result<CommandAck, ClientError> {
        self.enter("send_message", Some(execution_id)).await;
        self.command_result()
    }

    async fn approve_execution(&self, execution_id: &str) -> Result<CommandAck, ClientError> {
        self.enter("approve_execution", Some(execution_id)).await;
        self.command_result()
    }

    async fn cancel_execution(&self, execution_id: &str) -> Result<CommandAck, ClientError> {
        self.enter("cancel_execution", Some(execution_id)).await;
        let ack = self.command_result()?;
        self.set_execution_status(execution_id, ExecutionStatus::Cancelled);
        Ok(ack)
    }

    async fn run_pipeline(&self) -> Result<CommandAck, ClientError> {
        self.enter("run_pipeline", None).await;
        self.command_result()
    }

    async fn run_phase(
        &self,
        phase: &str,
        _params: &HashMap<String, String>,
    ) -> Result<CommandAck, ClientError> {
        self.enter("run_phase", Some(phase)).await;
        self.command_result()
    }

    async fn issues(&self) -> Result<IssuesOverview, ClientError> {
        self.enter("issues", None).await;
        Ok(IssuesOverview::default())
    }

    async fn metrics(&self) -> Result<MetricsSummary, ClientError> {
        self.enter("metrics", None).await;
        Ok(MetricsSummary::default())
    }

    async fn integration_health(&self) -> Result<Vec<IntegrationHealth>, ClientError> {
        self.enter("integration_health", None).await;
        Ok(Vec::new())
    }
}
