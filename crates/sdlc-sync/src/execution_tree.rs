//! Lazily loaded execution lists, one per expanded run.
//!
//! A run's list is fetched the first time the run is expanded and then reused
//! until something invalidates it. Invalidation is deliberately coarse: a new
//! execution anywhere clears the lists of every run, since the creator cannot
//! always tell which run the execution's parent belongs to. The active run is
//! the only one re-polled on a timer, and only while it stays expanded.

use crate::api::SdlcApi;
use crate::error::ClientError;
use crate::event_log::{EventBatch, EventLog};
use crate::scheduler::Poller;
use futures_util::future::join_all;
use sdlc_core::events::EventPayload;
use sdlc_core::Execution;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// A root execution followed by the executions it spawned.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionGroup {
    pub parent: Execution,
    pub children: Vec<Execution>,
}

/// Two-level grouping of a run's flat execution list: roots newest first,
/// each followed by its children in fetch order. Children whose parent is not
/// in the list are left out.
pub fn group_executions(executions: &[Execution]) -> Vec<ExecutionGroup> {
    let mut children: HashMap<&str, Vec<Execution>> = HashMap::new();
    let mut parents: Vec<&Execution> = Vec::new();
    for execution in executions {
        match execution.parent_id.as_deref() {
            Some(parent_id) => children
                .entry(parent_id)
                .or_default()
                .push(execution.clone()),
            None => parents.push(execution),
        }
    }
    parents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    parents
        .into_iter()
        .map(|parent| ExecutionGroup {
            parent: parent.clone(),
            children: children.remove(parent.id.as_str()).unwrap_or_default(),
        })
        .collect()
}

#[derive(Default)]
struct TreeState {
    entries: HashMap<String, Arc<Vec<Execution>>>,
    /// Run id to the invalidation generation its fetch started under.
    in_flight: HashMap<String, u64>,
    expanded: HashSet<String>,
    active_run: Option<String>,
    generation: u64,
}

enum FetchOutcome {
    Done,
    Retry,
}

struct TreeShared {
    api: Arc<dyn SdlcApi>,
    state: Mutex<TreeState>,
    changes: watch::Sender<u64>,
}

impl TreeShared {
    fn lock(&self) -> MutexGuard<'_, TreeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    fn begin_fetch(&self, run_id: &str, force: bool) -> Option<u64> {
        let generation = {
            let mut state = self.lock();
            if state.in_flight.contains_key(run_id) {
                return None;
            }
            if !force && state.entries.contains_key(run_id) {
                return None;
            }
            let generation = state.generation;
            state.in_flight.insert(run_id.to_string(), generation);
            generation
        };
        self.touch();
        Some(generation)
    }

    fn finish_fetch(
        &self,
        run_id: &str,
        generation: u64,
        result: Result<Vec<Execution>, ClientError>,
    ) -> FetchOutcome {
        let outcome = {
            let mut state = self.lock();
            state.in_flight.remove(run_id);
            if generation != state.generation {
                if state.expanded.contains(run_id) {
                    debug!("execution_tree_refetch_after_invalidate: {run_id}");
                    FetchOutcome::Retry
                } else {
                    FetchOutcome::Done
                }
            } else {
                match result {
                    Ok(executions) => {
                        debug!(
                            "execution_tree_loaded: run={run_id} executions={}",
                            executions.len()
                        );
                        state
                            .entries
                            .insert(run_id.to_string(), Arc::new(executions));
                    }
                    Err(err) => warn!("execution_tree_fetch_error: run={run_id} {err}"),
                }
                FetchOutcome::Done
            }
        };
        self.touch();
        outcome
    }

    async fn fetch(&self, run_id: &str, mut force: bool) {
        loop {
            let Some(generation) = self.begin_fetch(run_id, force) else {
                return;
            };
            let result = self.api.list_executions(Some(run_id)).await;
            match self.finish_fetch(run_id, generation, result) {
                FetchOutcome::Done => return,
                FetchOutcome::Retry => force = false,
            }
        }
    }

    async fn ensure(&self, run_id: &str) {
        self.fetch(run_id, false).await;
    }

    async fn refresh_run(&self, run_id: &str) {
        self.fetch(run_id, true).await;
    }

    fn mark_expanded(&self, run_id: &str, expanded: bool) -> bool {
        let changed = {
            let mut state = self.lock();
            if expanded {
                state.expanded.insert(run_id.to_string())
            } else {
                state.expanded.remove(run_id)
            }
        };
        if changed {
            self.touch();
        }
        changed
    }

    fn invalidate_all(&self) {
        {
            let mut state = self.lock();
            state.generation += 1;
            state.entries.clear();
        }
        debug!("execution_tree_invalidated");
        self.touch();
    }

    fn expanded_runs(&self) -> Vec<String> {
        let mut runs: Vec<String> = self.lock().expanded.iter().cloned().collect();
        runs.sort();
        runs
    }

    async fn reload_expanded(&self) {
        let runs = self.expanded_runs();
        join_all(runs.iter().map(|run_id| self.ensure(run_id))).await;
    }

    async fn set_active_run(&self, run_id: Option<String>) {
        {
            let mut state = self.lock();
            state.active_run = run_id.clone();
            if let Some(run_id) = &run_id {
                state.expanded.insert(run_id.clone());
            }
        }
        self.touch();
        if let Some(run_id) = run_id {
            self.ensure(&run_id).await;
        }
    }

    fn polled_run(&self) -> Option<String> {
        let state = self.lock();
        state
            .active_run
            .as_ref()
            .filter(|run_id| state.expanded.contains(run_id.as_str()))
            .cloned()
    }

    async fn poll_active(&self) {
        if let Some(run_id) = self.polled_run() {
            self.refresh_run(&run_id).await;
        }
    }

    /// Runs touched by the batch that are expanded and worth re-fetching, or
    /// `None` when the batch announces a new execution.
    fn runs_touched(&self, batch: &EventBatch) -> Option<Vec<String>> {
        let state = self.lock();
        let mut touched = Vec::new();
        for event in &batch.events {
            let execution_id = match &event.payload {
                EventPayload::ExecutionStarted(_) => return None,
                EventPayload::ExecutionTransition(transition) => &transition.execution_id,
                _ => continue,
            };
            let run_id = event.run_id.clone().or_else(|| {
                state.entries.iter().find_map(|(run_id, executions)| {
                    executions
                        .iter()
                        .any(|execution| &execution.id == execution_id)
                        .then(|| run_id.clone())
                })
            });
            if let Some(run_id) = run_id {
                if state.expanded.contains(&run_id) && !touched.contains(&run_id) {
                    touched.push(run_id);
                }
            }
        }
        Some(touched)
    }

    async fn apply_events(&self, batch: &EventBatch) {
        if batch.skipped > 0 {
            debug!("execution_tree_events_skipped: {}", batch.skipped);
        }
        match self.runs_touched(batch) {
            None => {
                self.invalidate_all();
                self.reload_expanded().await;
            }
            Some(runs) => {
                join_all(runs.iter().map(|run_id| self.refresh_run(run_id))).await;
            }
        }
    }
}

pub struct ExecutionTree {
    shared: Arc<TreeShared>,
    active_interval: Duration,
    poller: Poller,
}

impl ExecutionTree {
    pub fn new(api: Arc<dyn SdlcApi>, active_interval: Duration) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            shared: Arc::new(TreeShared {
                api,
                state: Mutex::new(TreeState::default()),
                changes,
            }),
            active_interval,
            poller: Poller::new("execution_tree"),
        }
    }

    /// Loads the run's list unless it is cached or already being fetched.
    pub async fn ensure(&self, run_id: &str) {
        self.shared.ensure(run_id).await;
    }

    /// Re-fetches the run's list even if cached. A fetch already in flight
    /// for the run absorbs the request.
    pub async fn refresh_run(&self, run_id: &str) {
        self.shared.refresh_run(run_id).await;
    }

    pub async fn expand(&self, run_id: &str) {
        self.shared.mark_expanded(run_id, true);
        self.shared.ensure(run_id).await;
    }

    /// Hides the run; its cached list is kept for the next expand.
    pub fn collapse(&self, run_id: &str) {
        self.shared.mark_expanded(run_id, false);
    }

    pub async fn toggle(&self, run_id: &str) {
        if self.is_expanded(run_id) {
            self.collapse(run_id);
        } else {
            self.expand(run_id).await;
        }
    }

    pub fn is_expanded(&self, run_id: &str) -> bool {
        self.shared.lock().expanded.contains(run_id)
    }

    pub fn expanded_runs(&self) -> Vec<String> {
        self.shared.expanded_runs()
    }

    /// Records the server's active run. The active run is expanded and loaded.
    pub async fn set_active_run(&self, run_id: Option<String>) {
        self.shared.set_active_run(run_id).await;
    }

    pub fn active_run(&self) -> Option<String> {
        self.shared.lock().active_run.clone()
    }

    /// Drops every cached list. Lists being fetched when this is called are
    /// discarded on arrival and re-fetched if their run is still expanded.
    pub fn invalidate_all(&self) {
        self.shared.invalidate_all();
    }

    /// Loads every expanded run that has no cached list.
    pub async fn reload_expanded(&self) {
        self.shared.reload_expanded().await;
    }

    pub fn executions(&self, run_id: &str) -> Option<Arc<Vec<Execution>>> {
        self.shared.lock().entries.get(run_id).cloned()
    }

    pub fn groups(&self, run_id: &str) -> Vec<ExecutionGroup> {
        self.executions(run_id)
            .map(|executions| group_executions(&executions))
            .unwrap_or_default()
    }

    pub fn is_loading(&self, run_id: &str) -> bool {
        self.shared.lock().in_flight.contains_key(run_id)
    }

    /// Bumped on every change to lists, expansion or loading markers.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.changes.subscribe()
    }

    /// Follows the active run, re-polls it while expanded and reacts to pushed
    /// execution events read from `log`.
    pub fn start(&mut self, log: Arc<EventLog>, active_run: watch::Receiver<Option<String>>) {
        let shared = self.shared.clone();
        let interval = self.active_interval;
        self.poller.spawn(drive_tree(shared, log, active_run, interval));
    }

    pub fn stop(&mut self) {
        self.poller.stop();
    }

    pub fn is_running(&self) -> bool {
        self.poller.is_running()
    }
}

async fn drive_tree(
    shared: Arc<TreeShared>,
    log: Arc<EventLog>,
    mut active_run: watch::Receiver<Option<String>>,
    interval: Duration,
) {
    let mut cursor = log.cursor();
    let mut appended = log.subscribe();
    let initial = active_run.borrow_and_update().clone();
    if initial.is_some() {
        shared.set_active_run(initial).await;
    }
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut follow_active = true;
    loop {
        tokio::select! {
            _ = ticker.tick() => shared.poll_active().await,
            changed = appended.changed() => {
                if changed.is_err() {
                    return;
                }
                let batch = log.read_since(&mut cursor);
                shared.apply_events(&batch).await;
            }
            changed = active_run.changed(), if follow_active => {
                if changed.is_err() {
                    follow_active = false;
                    continue;
                }
                let run_id = active_run.borrow_and_update().clone();
                shared.set_active_run(run_id).await;
                ticker.reset();
            }
        }
    }
}
