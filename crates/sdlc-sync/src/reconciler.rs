//! Converges one selected execution to server state.
//!
//! Two signals trigger a fetch of `GET /api/executions/<id>`: a timer whose
//! period follows the last known status, and pushed transition events for the
//! selected id. Every fetch replaces the cached execution wholesale. Results
//! that arrive after the selection changed are dropped.

use crate::api::SdlcApi;
use crate::error::ClientError;
use crate::event_log::EventLog;
use crate::scheduler::Poller;
use sdlc_core::{Execution, ExecutionMessage, ExecutionStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct ExecutionView {
    pub execution_id: Option<String>,
    pub execution: Option<Arc<Execution>>,
    pub loading: bool,
    /// Message of the last failed fetch. Cleared by the next successful one;
    /// `execution` keeps the last good copy meanwhile.
    pub error: Option<String>,
}

impl ExecutionView {
    pub fn messages(&self) -> &[ExecutionMessage] {
        self.execution
            .as_deref()
            .map(|execution| execution.messages.as_slice())
            .unwrap_or_default()
    }

    pub fn status(&self) -> Option<ExecutionStatus> {
        self.execution.as_ref().map(|execution| execution.status)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Selection {
    execution_id: Option<String>,
    epoch: u64,
}

struct ReconcilerShared {
    api: Arc<dyn SdlcApi>,
    view: watch::Sender<ExecutionView>,
    selection: watch::Sender<Selection>,
    refresh: Notify,
}

impl ReconcilerShared {
    fn apply(&self, result: Result<Execution, ClientError>) {
        self.view.send_modify(|view| {
            view.loading = false;
            match result {
                Ok(execution) => {
                    view.execution = Some(Arc::new(execution));
                    view.error = None;
                }
                Err(err) => {
                    warn!("reconciler_fetch_error: {err}");
                    view.error = Some(err.to_string());
                }
            }
        });
    }
}

type FetchResult = (u64, Result<Execution, ClientError>);

pub struct Reconciler {
    shared: Arc<ReconcilerShared>,
    live_interval: Duration,
    idle_interval: Duration,
    poller: Poller,
}

impl Reconciler {
    pub fn new(api: Arc<dyn SdlcApi>, live_interval: Duration, idle_interval: Duration) -> Self {
        let (view, _) = watch::channel(ExecutionView::default());
        let (selection, _) = watch::channel(Selection::default());
        Self {
            shared: Arc::new(ReconcilerShared {
                api,
                view,
                selection,
                refresh: Notify::new(),
            }),
            live_interval,
            idle_interval,
            poller: Poller::new("reconciler"),
        }
    }

    /// Switches the selected execution. The previous view is discarded at once
    /// and a fetch is issued for the new id. Returns `false` if `execution_id`
    /// was already selected.
    pub fn select(&self, execution_id: Option<String>) -> bool {
        let changed = self.shared.selection.send_if_modified(|selection| {
            if selection.execution_id == execution_id {
                return false;
            }
            selection.execution_id = execution_id.clone();
            selection.epoch += 1;
            true
        });
        if changed {
            debug!("reconciler_select: {:?}", execution_id);
            self.shared.view.send_replace(ExecutionView {
                loading: execution_id.is_some(),
                execution_id,
                execution: None,
                error: None,
            });
        }
        changed
    }

    pub fn selected(&self) -> Option<String> {
        self.shared.selection.borrow().execution_id.clone()
    }

    /// Requests an immediate fetch of the selected execution.
    pub fn refresh(&self) {
        self.shared.refresh.notify_one();
    }

    pub fn view(&self) -> ExecutionView {
        self.shared.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ExecutionView> {
        self.shared.view.subscribe()
    }

    pub fn start(&mut self, log: Arc<EventLog>) {
        let driver = Driver {
            shared: self.shared.clone(),
            log,
            live_interval: self.live_interval,
            idle_interval: self.idle_interval,
        };
        self.poller.spawn(driver.run());
    }

    pub fn stop(&mut self) {
        self.poller.stop();
    }

    pub fn is_running(&self) -> bool {
        self.poller.is_running()
    }
}

struct Driver {
    shared: Arc<ReconcilerShared>,
    log: Arc<EventLog>,
    live_interval: Duration,
    idle_interval: Duration,
}

impl Driver {
    fn poll_interval(&self) -> Duration {
        let live = self
            .shared
            .view
            .borrow()
            .status()
            .map(|status| status.is_live())
            .unwrap_or(false);
        if live {
            self.live_interval
        } else {
            self.idle_interval
        }
    }

    /// Returns `false` when nothing is selected.
    fn spawn_fetch(&self, fetches: &mut JoinSet<FetchResult>, selection: &Selection) -> bool {
        let Some(execution_id) = selection.execution_id.clone() else {
            return false;
        };
        let epoch = selection.epoch;
        let api = self.shared.api.clone();
        self.shared.view.send_if_modified(|view| {
            let changed = !view.loading;
            view.loading = true;
            changed
        });
        fetches.spawn(async move { (epoch, api.get_execution(&execution_id).await) });
        true
    }

    async fn run(self) {
        let mut selection_rx = self.shared.selection.subscribe();
        let mut appended = self.log.subscribe();
        let mut cursor = self.log.cursor();
        let mut fetches: JoinSet<FetchResult> = JoinSet::new();
        let mut deadline: Option<Instant> = None;
        // Fetches of the current selection still running. Stale ones left in
        // `fetches` after a switch never hold back the poll timer.
        let mut pending: usize = 0;

        let mut current = selection_rx.borrow_and_update().clone();
        if self.spawn_fetch(&mut fetches, &current) {
            pending += 1;
        }

        loop {
            tokio::select! {
                changed = selection_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    current = selection_rx.borrow_and_update().clone();
                    cursor = self.log.cursor();
                    deadline = None;
                    pending = 0;
                    if self.spawn_fetch(&mut fetches, &current) {
                        pending += 1;
                    }
                }
                _ = self.shared.refresh.notified() => {
                    if self.spawn_fetch(&mut fetches, &current) {
                        pending += 1;
                    }
                }
                changed = appended.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let batch = self.log.read_since(&mut cursor);
                    let Some(execution_id) = current.execution_id.as_deref() else {
                        continue;
                    };
                    if let Some(status) = batch
                        .events
                        .iter()
                        .find_map(|event| event.transition_for(execution_id))
                    {
                        debug!("reconciler_event_refetch: {execution_id} {status}");
                        if self.spawn_fetch(&mut fetches, &current) {
                            pending += 1;
                        }
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() && pending == 0 =>
                {
                    deadline = None;
                    if self.spawn_fetch(&mut fetches, &current) {
                        pending += 1;
                    }
                }
                Some(joined) = fetches.join_next() => {
                    match joined {
                        Ok((epoch, result)) if epoch == current.epoch => {
                            pending = pending.saturating_sub(1);
                            self.shared.apply(result);
                            if pending == 0 && current.execution_id.is_some() {
                                deadline = Some(Instant::now() + self.poll_interval());
                            }
                        }
                        Ok(_) => debug!("reconciler_discard_stale"),
                        Err(err) => {
                            warn!("reconciler_fetch_join_error: {err}");
                            pending = pending.saturating_sub(1);
                            if pending == 0 && current.execution_id.is_some() {
                                deadline = Some(Instant::now() + self.poll_interval());
                            }
                        }
                    }
                }
            }
        }
    }
}
