use crate::error::ClientError;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";
pub const EVENTS_PATH: &str = "/ws/events";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 20;

pub const EVENT_BUFFER_CAPACITY: usize = 500;
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);
pub const RUNS_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const ACTIVE_RUN_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const EXECUTION_LIVE_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const EXECUTION_IDLE_POLL_INTERVAL: Duration = Duration::from_secs(5);

const ENV_BASE_URL: &str = "SDLC_BASE_URL";
const ENV_EVENTS_URL: &str = "SDLC_EVENTS_URL";
const ENV_REQUEST_TIMEOUT: &str = "SDLC_REQUEST_TIMEOUT_SECS";
const ENV_STATE_DIR: &str = "SDLC_STATE_DIR";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: Url,
    pub events_url: Url,
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let base_url = parse_base_url(base_url)?;
        let events_url = derive_events_url(&base_url)?;
        Ok(Self {
            base_url,
            events_url,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        })
    }

    pub fn from_env() -> Result<Self, ClientError> {
        let base = env_value(ENV_BASE_URL).unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let mut config = Self::new(&base)?;
        if let Some(events) = env_value(ENV_EVENTS_URL) {
            config = config.with_events_url(&events)?;
        }
        if let Some(raw) = env_value(ENV_REQUEST_TIMEOUT) {
            let secs = raw.parse::<u64>().map_err(|_| {
                ClientError::Config(format!(
                    "{ENV_REQUEST_TIMEOUT} must be an integer number of seconds"
                ))
            })?;
            if secs == 0 {
                return Err(ClientError::Config(format!(
                    "{ENV_REQUEST_TIMEOUT} must be greater than zero"
                )));
            }
            config.request_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    pub fn with_events_url(mut self, events_url: &str) -> Result<Self, ClientError> {
        let url = Url::parse(events_url.trim()).map_err(|err| {
            ClientError::Config(format!("invalid events url '{events_url}': {err}"))
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ClientError::Config(format!(
                "events url must use ws or wss, got '{}'",
                url.scheme()
            )));
        }
        self.events_url = url;
        Ok(self)
    }

    /// REST endpoint under `/api/`; each segment is percent-encoded.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ClientError::Config(format!(
                    "base url '{}' cannot carry a path",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .push("api")
            .extend(segments);
        Ok(url)
    }
}

/// Timers and bounds used by the sync components. Defaults follow the
/// dashboard's production cadence; tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct SyncTimings {
    pub event_capacity: usize,
    pub reconnect_delay: Duration,
    pub runs_interval: Duration,
    pub status_interval: Duration,
    pub active_run_interval: Duration,
    pub execution_live_interval: Duration,
    pub execution_idle_interval: Duration,
}

impl Default for SyncTimings {
    fn default() -> Self {
        Self {
            event_capacity: EVENT_BUFFER_CAPACITY,
            reconnect_delay: RECONNECT_DELAY,
            runs_interval: RUNS_POLL_INTERVAL,
            status_interval: STATUS_POLL_INTERVAL,
            active_run_interval: ACTIVE_RUN_POLL_INTERVAL,
            execution_live_interval: EXECUTION_LIVE_POLL_INTERVAL,
            execution_idle_interval: EXECUTION_IDLE_POLL_INTERVAL,
        }
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ClientError> {
    let url = Url::parse(raw.trim())
        .map_err(|err| ClientError::Config(format!("invalid base url '{raw}': {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ClientError::Config(format!(
            "base url must use http or https, got '{}'",
            url.scheme()
        )));
    }
    Ok(url)
}

/// Push feed location: same host as the REST base, `wss` for `https`.
pub fn derive_events_url(base_url: &Url) -> Result<Url, ClientError> {
    let scheme = match base_url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(ClientError::Config(format!(
                "cannot derive events url from scheme '{other}'"
            )))
        }
    };
    let mut url = base_url.clone();
    url.set_scheme(scheme)
        .map_err(|_| ClientError::Config(format!("cannot switch '{base_url}' to {scheme}")))?;
    url.set_path(EVENTS_PATH);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

pub fn resolve_state_dir() -> PathBuf {
    if let Some(value) = env_value(ENV_STATE_DIR) {
        return PathBuf::from(value);
    }
    if let Some(value) = env_value("XDG_STATE_HOME") {
        return PathBuf::from(value).join("sdlc");
    }
    if let Some(value) = env_value("HOME") {
        return PathBuf::from(value)
            .join(".local")
            .join("state")
            .join("sdlc");
    }
    PathBuf::from(".sdlc/state")
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
