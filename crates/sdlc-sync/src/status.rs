//! Poller for the server-designated active run.

use crate::api::SdlcApi;
use crate::error::ClientError;
use crate::scheduler::Poller;
use sdlc_core::{CommandAck, StatusSummary};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

struct StatusShared {
    api: Arc<dyn SdlcApi>,
    summary: watch::Sender<Option<Arc<StatusSummary>>>,
    active_run: watch::Sender<Option<String>>,
}

impl StatusShared {
    async fn refresh(&self) -> bool {
        match self.api.status().await {
            Ok(summary) => {
                let run_id = summary.active_run_id().map(str::to_string);
                self.summary.send_replace(Some(Arc::new(summary)));
                self.active_run.send_if_modified(|current| {
                    if *current == run_id {
                        return false;
                    }
                    info!("active_run_changed: {:?} -> {:?}", current, run_id);
                    *current = run_id;
                    true
                });
                true
            }
            Err(err) => {
                warn!("status_refresh_error: {err}");
                false
            }
        }
    }
}

pub struct StatusMonitor {
    shared: Arc<StatusShared>,
    interval: Duration,
    poller: Poller,
}

impl StatusMonitor {
    pub fn new(api: Arc<dyn SdlcApi>, interval: Duration) -> Self {
        let (summary, _) = watch::channel(None);
        let (active_run, _) = watch::channel(None);
        Self {
            shared: Arc::new(StatusShared {
                api,
                summary,
                active_run,
            }),
            interval,
            poller: Poller::new("status_monitor"),
        }
    }

    /// Latest summary; `None` until the first successful fetch.
    pub fn summary(&self) -> Option<Arc<StatusSummary>> {
        self.shared.summary.borrow().clone()
    }

    pub fn active_run_id(&self) -> Option<String> {
        self.shared.active_run.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<StatusSummary>>> {
        self.shared.summary.subscribe()
    }

    /// Fires only when the active run id actually changes.
    pub fn active_run(&self) -> watch::Receiver<Option<String>> {
        self.shared.active_run.subscribe()
    }

    pub async fn refresh(&self) -> bool {
        self.shared.refresh().await
    }

    /// Asks the server to switch the active run, then re-reads the status.
    pub async fn select_run(&self, run_id: &str) -> Result<CommandAck, ClientError> {
        let ack = self.shared.api.select_run(run_id).await?;
        debug!("select_run_ok: {run_id}");
        self.shared.refresh().await;
        Ok(ack)
    }

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
