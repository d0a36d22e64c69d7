//! Client-side state sync for the SDLC orchestrator dashboard.
//!
//! A push channel feeds a bounded [`EventLog`]; polling caches for runs,
//! per-run execution lists and the selected execution use those events as
//! re-fetch hints while their timers keep them correct when pushes are lost.

pub mod api;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod event_channel;
pub mod event_log;
pub mod execution_tree;
pub mod prefs;
pub mod reconciler;
pub mod run_registry;
pub mod scheduler;
pub mod status;

#[cfg(test)]
mod fake_api;

pub use api::{HttpApi, SdlcApi};
pub use config::{resolve_state_dir, ClientConfig, SyncTimings};
pub use dashboard::Dashboard;
pub use error::ClientError;
pub use event_channel::EventChannel;
pub use event_log::{EventBatch, EventCursor, EventLog};
pub use execution_tree::{group_executions, ExecutionGroup, ExecutionTree};
pub use prefs::{
    DashboardTab, FilePreferences, MemoryPreferences, PreferenceStore, PrefsError,
    SELECTED_EXECUTION_KEY, TAB_KEY,
};
pub use reconciler::{ExecutionView, Reconciler};
pub use run_registry::{RunRegistry, RunSnapshot};
pub use scheduler::Poller;
pub use status::StatusMonitor;
