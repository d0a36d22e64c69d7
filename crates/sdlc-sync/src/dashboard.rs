//! One dashboard session: every sync component wired together, plus the
//! commands a view issues against the orchestrator.

use crate::api::SdlcApi;
use crate::config::SyncTimings;
use crate::error::ClientError;
use crate::event_channel::EventChannel;
use crate::execution_tree::ExecutionTree;
use crate::prefs::{DashboardTab, PreferenceStore, PrefsError, SELECTED_EXECUTION_KEY};
use crate::reconciler::Reconciler;
use crate::run_registry::RunRegistry;
use crate::status::StatusMonitor;
use sdlc_core::events::Event;
use sdlc_core::{CommandAck, CreateExecutionRequest, CreatedExecution};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

pub struct Dashboard {
    api: Arc<dyn SdlcApi>,
    prefs: Arc<dyn PreferenceStore>,
    channel: EventChannel,
    runs: RunRegistry,
    status: StatusMonitor,
    tree: ExecutionTree,
    reconciler: Reconciler,
}

impl Dashboard {
    pub fn new(
        api: Arc<dyn SdlcApi>,
        events_url: Url,
        prefs: Arc<dyn PreferenceStore>,
        timings: SyncTimings,
    ) -> Self {
        Self {
            channel: EventChannel::new(events_url, timings.event_capacity, timings.reconnect_delay),
            runs: RunRegistry::new(api.clone(), timings.runs_interval),
            status: StatusMonitor::new(api.clone(), timings.status_interval),
            tree: ExecutionTree::new(api.clone(), timings.active_run_interval),
            reconciler: Reconciler::new(
                api.clone(),
                timings.execution_live_interval,
                timings.execution_idle_interval,
            ),
            api,
            prefs,
        }
    }

    /// Restores the persisted selection and starts every component.
    pub fn start(&mut self) {
        let restored = self.prefs.load(SELECTED_EXECUTION_KEY);
        if let Some(execution_id) = &restored {
            info!("dashboard_restore_selection: {execution_id}");
        }
        self.reconciler.select(restored);

        self.channel.start();
        self.runs.start();
        self.status.start();
        self.tree.start(self.channel.log(), self.status.active_run());
        self.reconciler.start(self.channel.log());
    }

    pub fn stop(&mut self) {
        self.reconciler.stop();
        self.tree.stop();
        self.status.stop();
        self.runs.stop();
        self.channel.stop();
    }

    pub fn is_running(&self) -> bool {
        self.channel.is_running()
            || self.runs.is_running()
            || self.status.is_running()
            || self.tree.is_running()
            || self.reconciler.is_running()
    }

    pub fn api(&self) -> &Arc<dyn SdlcApi> {
        &self.api
    }

    pub fn channel(&self) -> &EventChannel {
        &self.channel
    }

    pub fn runs(&self) -> &RunRegistry {
        &self.runs
    }

    pub fn status(&self) -> &StatusMonitor {
        &self.status
    }

    pub fn tree(&self) -> &ExecutionTree {
        &self.tree
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Buffered events that belong to the active run or to no run.
    pub fn events_for_active_run(&self) -> Vec<Arc<Event>> {
        let log = self.channel.log();
        match self.status.active_run_id() {
            Some(run_id) => log.events_for_run(&run_id),
            None => log.snapshot(),
        }
    }

    pub fn select_execution(&self, execution_id: Option<String>) {
        if !self.reconciler.select(execution_id.clone()) {
            return;
        }
        let persisted = match &execution_id {
            Some(execution_id) => self.prefs.save(SELECTED_EXECUTION_KEY, execution_id),
            None => self.prefs.remove(SELECTED_EXECUTION_KEY),
        };
        if let Err(err) = persisted {
            warn!("dashboard_persist_selection_error: {err}");
        }
    }

    pub fn tab(&self) -> DashboardTab {
        DashboardTab::load(self.prefs.as_ref())
    }

    pub fn set_tab(&self, tab: DashboardTab) -> Result<(), PrefsError> {
        tab.save(self.prefs.as_ref())
    }

    /// Creates an execution, selects it, and refreshes every cache that may
    /// now be missing it.
    pub async fn create_execution(
        &self,
        request: &CreateExecutionRequest,
    ) -> Result<CreatedExecution, ClientError> {
        let created = self.api.create_execution(request).await?;
        info!(
            "execution_created: id={} phase={} kind={}",
            created.id, request.phase, request.kind
        );
        self.select_execution(Some(created.id.clone()));
        self.runs.refresh().await;
        self.tree.invalidate_all();
        self.tree.reload_expanded().await;
        Ok(created)
    }

    pub async fn send_message(
        &self,
        execution_id: &str,
        content: &str,
    ) -> Result<CommandAck, ClientError> {
        let ack = self.api.send_message(execution_id, content).await?;
        self.refresh_if_selected(execution_id);
        Ok(ack)
    }

    pub async fn approve(&self, execution_id: &str) -> Result<CommandAck, ClientError> {
        let ack = self.api.approve_execution(execution_id).await?;
        self.refresh_if_selected(execution_id);
        Ok(ack)
    }

    pub async fn cancel(&self, execution_id: &str) -> Result<CommandAck, ClientError> {
        let ack = self.api.cancel_execution(execution_id).await?;
        self.refresh_if_selected(execution_id);
        Ok(ack)
    }

    pub async fn select_run(&self, run_id: &str) -> Result<CommandAck, ClientError> {
        self.status.select_run(run_id).await
    }

    pub async fn run_pipeline(&self) -> Result<CommandAck, ClientError> {
        let ack = self.api.run_pipeline().await?;
        self.runs.refresh().await;
        Ok(ack)
    }

    pub async fn run_phase(
        &self,
        phase: &str,
        params: &HashMap<String, String>,
    ) -> Result<CommandAck, ClientError> {
        let ack = self.api.run_phase(phase, params).await?;
        self.runs.refresh().await;
        Ok(ack)
    }

    fn refresh_if_selected(&self, execution_id: &str) {
        if self.reconciler.selected().as_deref() == Some(execution_id) {
            self.reconciler.refresh();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_api::{execution, run, FakeApi};
    use crate::prefs::MemoryPreferences;
    use sdlc_core::{ExecutionStatus, ExecutionType};
    use std::time::Duration;

    fn dashboard(api: Arc<FakeApi>, prefs: Arc<MemoryPreferences>) -> Dashboard {
        let url = Url::parse("ws://127.0.0.1:9/ws/events").expect("url");
        Dashboard::new(api, url, prefs, SyncTimings::default())
    }

    fn seeded_api() -> Arc<FakeApi> {
        let api = Arc::new(FakeApi::default());
        api.set_active_run("run-1");
        api.set_runs(vec![run("run-1", "2026-02-07T09:00:00Z")]);
        api.put_execution(execution(
            "exec-a",
            "run-1",
            None,
            ExecutionStatus::WaitingInput,
            "2026-02-07T10:00:00Z",
        ));
        api
    }

    #[tokio::test]
    async fn create_selects_and_invalidates() {
        let api = seeded_api();
        let prefs = Arc::new(MemoryPreferences::default());
        let dashboard = dashboard(api.clone(), prefs.clone());
        dashboard.tree().expand("run-1").await;
        dashboard.tree().ensure("run-2").await;

        let request = CreateExecutionRequest {
            run_id: Some("run-1".to_string()),
            kind: ExecutionType::Phase,
            phase: "plan".to_string(),
            issue_id: None,
            params: HashMap::new(),
        };
        let created = dashboard.create_execution(&request).await.expect("create");

        assert_eq!(dashboard.reconciler().selected(), Some(created.id.clone()));
        assert_eq!(prefs.load(SELECTED_EXECUTION_KEY), Some(created.id.clone()));
        assert_eq!(api.calls("list_runs"), 1);
        assert_eq!(dashboard.runs().runs().len(), 1);
        assert_eq!(api.calls("list_executions:run-1"), 2);
        assert!(dashboard.tree().executions("run-2").is_none());
        let listed = dashboard.tree().executions("run-1").expect("reloaded");
        assert!(listed.iter().any(|item| item.id == created.id));
    }

    #[tokio::test]
    async fn failed_command_is_returned_without_side_effects() {
        let api = seeded_api();
        api.fail_commands(true);
        let prefs = Arc::new(MemoryPreferences::default());
        let dashboard = dashboard(api.clone(), prefs.clone());

        let request = CreateExecutionRequest {
            run_id: None,
            kind: ExecutionType::Phase,
            phase: "plan".to_string(),
            issue_id: None,
            params: HashMap::new(),
        };
        let err = dashboard
            .create_execution(&request)
            .await
            .expect_err("create must fail");
        assert_eq!(err.to_string(), "orchestrator unavailable");
        assert_eq!(api.calls("create_execution"), 1);
        assert_eq!(api.calls("list_runs"), 0);
        assert_eq!(dashboard.reconciler().selected(), None);

        assert!(dashboard.approve("exec-a").await.is_err());
        assert_eq!(api.calls("approve_execution"), 1);
    }

    #[tokio::test]
    async fn selection_is_persisted_and_cleared() {
        let api = seeded_api();
        let prefs = Arc::new(MemoryPreferences::default());
        let dashboard = dashboard(api, prefs.clone());

        dashboard.select_execution(Some("exec-a".to_string()));
        assert_eq!(prefs.load(SELECTED_EXECUTION_KEY).as_deref(), Some("exec-a"));
        dashboard.select_execution(None);
        assert_eq!(prefs.load(SELECTED_EXECUTION_KEY), None);

        dashboard.set_tab(DashboardTab::Runs).expect("save tab");
        assert_eq!(dashboard.tab(), DashboardTab::Runs);
    }

    #[tokio::test]
    async fn start_restores_selection_and_stop_halts_everything() {
        let api = seeded_api();
        let prefs = Arc::new(MemoryPreferences::default());
        prefs
            .save(SELECTED_EXECUTION_KEY, "exec-a")
            .expect("seed selection");
        let mut dashboard = dashboard(api.clone(), prefs);
        dashboard.start();
        assert!(dashboard.is_running());
        assert_eq!(dashboard.reconciler().selected().as_deref(), Some("exec-a"));

        let mut view = dashboard.reconciler().subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            view.wait_for(|view| view.execution.is_some()),
        )
        .await
        .expect("fetch in time")
        .expect("reconciler alive");
        assert_eq!(
            dashboard.reconciler().view().status(),
            Some(ExecutionStatus::WaitingInput)
        );

        dashboard.approve("exec-a").await.expect("approve");
        assert_eq!(api.calls("approve_execution:exec-a"), 1);

        dashboard.stop();
        assert!(!dashboard.is_running());
        assert!(!dashboard.channel().is_connected());
    }
}
