//! Cached, periodically refreshed list of pipeline runs.

use crate::api::SdlcApi;
use crate::scheduler::Poller;
use chrono::{DateTime, Utc};
use sdlc_core::{sort_runs_newest_first, Run};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// One complete fetch of the run list, newest first. Snapshots are replaced
/// wholesale and never edited in place.
#[derive(Debug, Clone, Default)]
pub struct RunSnapshot {
    pub runs: Arc<Vec<Run>>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl RunSnapshot {
    pub fn is_loaded(&self) -> bool {
        self.fetched_at.is_some()
    }

    pub fn find(&self, run_id: &str) -> Option<&Run> {
        self.runs.iter().find(|run| run.id == run_id)
    }
}

struct RegistryShared {
    api: Arc<dyn SdlcApi>,
    snapshot: watch::Sender<RunSnapshot>,
}

impl RegistryShared {
    async fn refresh(&self) -> bool {
        match self.api.list_runs().await {
            Ok(mut runs) => {
                sort_runs_newest_first(&mut runs);
                debug!("run_registry_refreshed: runs={}", runs.len());
                self.snapshot.send_replace(RunSnapshot {
                    runs: Arc::new(runs),
                    fetched_at: Some(Utc::now()),
                });
                true
            }
            Err(err) => {
                warn!("run_registry_refresh_error: {err}");
                false
            }
        }
    }
}

pub struct RunRegistry {
    shared: Arc<RegistryShared>,
    interval: Duration,
    poller: Poller,
}

impl RunRegistry {
    pub fn new(api: Arc<dyn SdlcApi>, interval: Duration) -> Self {
        let (snapshot, _) = watch::channel(RunSnapshot::default());
        Self {
            shared: Arc::new(RegistryShared { api, snapshot }),
            interval,
            poller: Poller::new("run_registry"),
        }
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    pub fn runs(&self) -> Arc<Vec<Run>> {
        self.shared.snapshot.borrow().runs.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunSnapshot> {
        self.shared.snapshot.subscribe()
    }

    /// Fetches and publishes a fresh snapshot. On failure the previous
    /// snapshot stays in place and `false` is returned.
    pub async fn refresh(&self) -> bool {
        self.shared.refresh().await
    }

    /// Refreshes immediately and then on every interval tick until stopped.
    pub fn start(&mut self) {
        let shared = self.shared.clone();
        let interval = self.interval;
        self.poller.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                shared.refresh().await;
            }
        });
    }

    pub fn stop(&mut self) {
        self.poller.stop();
    }

    pub fn is_running(&self) -> bool {
        self.poller.is_running()
    }
}
