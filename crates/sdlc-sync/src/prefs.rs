//! Small key-value port for cosmetic UI state (selected tab, selected
//! execution). Nothing stored here is needed for correctness.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::warn;

pub const TAB_KEY: &str = "sdlc:tab";
pub const SELECTED_EXECUTION_KEY: &str = "sdlc:selectedExecutionId";
pub const PREFERENCES_FILE: &str = "preferences.json";

#[derive(Debug, Error)]
pub enum PrefsError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode preferences: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait PreferenceStore: Send + Sync {
    fn load(&self, key: &str) -> Option<String>;
    fn save(&self, key: &str, value: &str) -> Result<(), PrefsError>;
    fn remove(&self, key: &str) -> Result<(), PrefsError>;
}

#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryPreferences {
    fn values(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PreferenceStore for MemoryPreferences {
    fn load(&self, key: &str) -> Option<String> {
        self.values().get(key).cloned()
    }

    fn save(&self, key: &str, value: &str) -> Result<(), PrefsError> {
        self.values().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PrefsError> {
        self.values().remove(key);
        Ok(())
    }
}

/// JSON object on disk, rewritten whole through a temp file and rename.
/// A missing or unreadable file behaves as an empty store.
#[derive(Debug)]
pub struct FilePreferences {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FilePreferences {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = read_values(&path);
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::open(state_dir.join(PREFERENCES_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update(&self, apply: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<(), PrefsError> {
        let mut values = self
            .values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = values.clone();
        apply(&mut next);
        let payload = serde_json::to_string_pretty(&next)?;
        write_atomic(&self.path, &payload)?;
        *values = next;
        Ok(())
    }
}

impl PreferenceStore for FilePreferences {
    fn load(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    fn save(&self, key: &str, value: &str) -> Result<(), PrefsError> {
        self.update(|values| {
            values.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<(), PrefsError> {
        self.update(|values| {
            values.remove(key);
        })
    }
}

fn read_values(path: &Path) -> BTreeMap<String, String> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(err) => {
            warn!("prefs_read_error: {}: {err}", path.display());
            return BTreeMap::new();
        }
    };
    match serde_json::from_str(&content) {
        Ok(values) => values,
        Err(err) => {
            warn!("prefs_parse_error: {}: {err}", path.display());
            BTreeMap::new()
        }
    }
}

fn write_atomic(path: &Path, payload: &str) -> Result<(), PrefsError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    let temp_path = match path.file_name() {
        Some(name) => path.with_file_name(format!("{}.tmp", name.to_string_lossy())),
        None => path.with_extension("tmp"),
    };
    fs::write(&temp_path, payload).map_err(io_error(&temp_path))?;
    fs::rename(&temp_path, path).map_err(io_error(path))?;
    Ok(())
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> PrefsError {
    let path = path.to_path_buf();
    move |source| PrefsError::Io { path, source }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DashboardTab {
    #[default]
    Dashboard,
    Runs,
    Issues,
    Logs,
    Config,
    Help,
}

impl DashboardTab {
    pub const ALL: [DashboardTab; 6] = [
        DashboardTab::Dashboard,
        DashboardTab::Runs,
        DashboardTab::Issues,
        DashboardTab::Logs,
        DashboardTab::Config,
        DashboardTab::Help,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DashboardTab::Dashboard => "dashboard",
            DashboardTab::Runs => "runs",
            DashboardTab::Issues => "issues",
            DashboardTab::Logs => "logs",
            DashboardTab::Config => "config",
            DashboardTab::Help => "help",
        }
    }

    /// Stored tab, or the default when absent or unrecognised.
    pub fn load(store: &dyn PreferenceStore) -> Self {
        store
            .load(TAB_KEY)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default()
    }

    pub fn save(self, store: &dyn PreferenceStore) -> Result<(), PrefsError> {
        store.save(TAB_KEY, self.as_str())
    }
}

impl fmt::Display for DashboardTab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DashboardTab {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        DashboardTab::ALL
            .into_iter()
            .find(|tab| tab.as_str() == normalized)
            .ok_or_else(|| format!("Unknown tab: {normalized}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FilePreferences::in_state_dir(&dir.path().join("nested"));
        store
            .save(SELECTED_EXECUTION_KEY, "exec-7")
            .expect("save selection");
        DashboardTab::Issues.save(&store).expect("save tab");

        let reopened = FilePreferences::open(store.path());
        assert_eq!(
            reopened.load(SELECTED_EXECUTION_KEY).as_deref(),
            Some("exec-7")
        );
        assert_eq!(DashboardTab::load(&reopened), DashboardTab::Issues);

        reopened.remove(SELECTED_EXECUTION_KEY).expect("remove");
        assert_eq!(FilePreferences::open(store.path()).load(SELECTED_EXECUTION_KEY), None);
        assert!(!store.path().with_file_name("preferences.json.tmp").exists());
    }

    #[test]
    fn corrupt_file_loads_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(PREFERENCES_FILE);
        fs::write(&path, "{not json").expect("write");
        let store = FilePreferences::open(&path);
        assert_eq!(store.load(TAB_KEY), None);
        store.save(TAB_KEY, "logs").expect("save over corrupt file");
        assert_eq!(DashboardTab::load(&FilePreferences::open(&path)), DashboardTab::Logs);
    }

    #[test]
    fn unknown_tab_falls_back_to_default() {
        let store = MemoryPreferences::default();
        store.save(TAB_KEY, "manifest").expect("save");
        assert_eq!(DashboardTab::load(&store), DashboardTab::Dashboard);
        assert_eq!(" Runs ".parse::<DashboardTab>(), Ok(DashboardTab::Runs));
    }
}
