//! Durable resume state.
//!
//! The store keeps an in-memory copy of the state behind a mutex and
//! coalesces disk writes through the auto-save interval; step completion
//! and orchestrator exit always force a save. A missing state file starts a
//! fresh session, which makes a first run and a resumed run the same code
//! path.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::ResumeConfig;
use crate::error::Result;

/// Per-step progress: which records are done and where the cursor stood.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    pub resource_type: Option<String>,
    /// Serialized as a sequence; duplicates collapse on load.
    pub processed_ids: BTreeSet<String>,
    pub last_processed_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// The document persisted to the resume file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeState {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    pub completed_steps: Vec<String>,
    pub current_step: Option<String>,
    #[serde(default)]
    pub step_states: BTreeMap<String, StepState>,
    #[serde(default)]
    pub global_metadata: BTreeMap<String, Value>,
}

impl ResumeState {
    fn fresh() -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            start_time: now,
            last_update_time: now,
            completed_steps: Vec::new(),
            current_step: None,
            step_states: BTreeMap::new(),
            global_metadata: BTreeMap::new(),
        }
    }
}

struct StoreInner {
    state: ResumeState,
    dirty: bool,
    last_save: Instant,
}

/// Loads, queries, and persists [`ResumeState`].
pub struct ResumeStore {
    enabled: bool,
    path: PathBuf,
    auto_save_interval: Duration,
    inner: Mutex<StoreInner>,
}

impl ResumeStore {
    /// Load state from the configured file, or start fresh when it is
    /// missing or resume is disabled.
    pub fn load(config: &ResumeConfig) -> Result<Self> {
        let state = if config.enabled {
            match std::fs::read_to_string(&config.state_file) {
                Ok(text) => {
                    let state: ResumeState = serde_yaml::from_str(&text)?;
                    info!(
                        "resuming session {} ({} completed steps)",
                        state.session_id,
                        state.completed_steps.len()
                    );
                    state
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(
                        "resume file {} missing; starting fresh",
                        config.state_file.display()
                    );
                    ResumeState::fresh()
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            ResumeState::fresh()
        };
        Ok(Self {
            enabled: config.enabled,
            path: config.state_file.clone(),
            auto_save_interval: Duration::from_millis(config.auto_save_interval),
            inner: Mutex::new(StoreInner {
                state,
                dirty: false,
                last_save: Instant::now(),
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn session_id(&self) -> String {
        self.lock().state.session_id.clone()
    }

    /// A completed step is skipped wholesale on the next run.
    pub fn is_step_complete(&self, step: &str) -> bool {
        self.lock()
            .state
            .completed_steps
            .iter()
            .any(|s| s == step)
    }

    pub fn set_current_step(&self, step: &str) {
        let mut inner = self.lock();
        inner.state.current_step = Some(step.to_owned());
        inner.state.last_update_time = Utc::now();
        inner.dirty = true;
    }

    /// Mark a step finished and persist immediately.
    pub fn mark_step_complete(&self, step: &str) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.state.current_step.as_deref() == Some(step) {
                inner.state.current_step = None;
            }
            if !inner.state.completed_steps.iter().any(|s| s == step) {
                inner.state.completed_steps.push(step.to_owned());
            }
            inner.state.last_update_time = Utc::now();
            inner.dirty = true;
        }
        self.save()
    }

    /// Record a processed id, persisting when the auto-save interval has
    /// elapsed since the last save.
    pub fn record_processed(&self, step: &str, record_id: &str) -> Result<()> {
        let save_due = {
            let mut inner = self.lock();
            let step_state = inner.state.step_states.entry(step.to_owned()).or_default();
            step_state.processed_ids.insert(record_id.to_owned());
            step_state.last_processed_id = Some(record_id.to_owned());
            inner.state.last_update_time = Utc::now();
            inner.dirty = true;
            inner.last_save.elapsed() >= self.auto_save_interval
        };
        if save_due {
            self.save()?;
        }
        Ok(())
    }

    pub fn is_processed(&self, step: &str, record_id: &str) -> bool {
        self.lock()
            .state
            .step_states
            .get(step)
            .is_some_and(|s| s.processed_ids.contains(record_id))
    }

    pub fn set_step_resource(&self, step: &str, resource_type: &str) {
        let mut inner = self.lock();
        let step_state = inner.state.step_states.entry(step.to_owned()).or_default();
        step_state.resource_type = Some(resource_type.to_owned());
        inner.dirty = true;
    }

    pub fn set_global_metadata(&self, key: &str, value: Value) {
        let mut inner = self.lock();
        inner.state.global_metadata.insert(key.to_owned(), value);
        inner.dirty = true;
    }

    pub fn snapshot(&self) -> ResumeState {
        self.lock().state.clone()
    }

    /// Persist the current state via temp-file rename.
    pub fn save(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let yaml = {
            let mut inner = self.lock();
            if !inner.dirty {
                return Ok(());
            }
            inner.dirty = false;
            inner.last_save = Instant::now();
            serde_yaml::to_string(&inner.state)?
        };
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = tmp_path(&self.path);
        std::fs::write(&tmp, yaml)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("resume state saved to {}", self.path.display());
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_owned()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path, enabled: bool) -> ResumeConfig {
        ResumeConfig {
            enabled,
            state_file: dir.join("resume.yaml"),
            auto_save_interval: 5_000,
        }
    }

    #[test]
    fn missing_file_starts_fresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResumeStore::load(&config(dir.path(), true)).expect("load");
        assert!(!store.is_step_complete("areas"));
        assert!(!store.session_id().is_empty());
    }

    #[test]
    fn state_round_trips_through_yaml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = config(dir.path(), true);
        let session_id = {
            let store = ResumeStore::load(&cfg).expect("load");
            store.set_current_step("resources");
            store.record_processed("resources", "41").expect("record");
            store.record_processed("resources", "42").expect("record");
            store.mark_step_complete("areas").expect("complete");
            store.save().expect("save");
            store.session_id()
        };
        let store = ResumeStore::load(&cfg).expect("reload");
        assert_eq!(store.session_id(), session_id);
        assert!(store.is_step_complete("areas"));
        assert!(store.is_processed("resources", "42"));
        assert!(!store.is_processed("resources", "43"));
    }

    #[test]
    fn completing_a_step_clears_its_current_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResumeStore::load(&config(dir.path(), true)).expect("load");
        store.set_current_step("users");
        store.mark_step_complete("users").expect("complete");
        let state = store.snapshot();
        assert_eq!(state.current_step, None);
        assert_eq!(state.completed_steps, vec!["users".to_string()]);
        // Completion is idempotent.
        store.mark_step_complete("users").expect("again");
        assert_eq!(store.snapshot().completed_steps.len(), 1);
    }

    #[test]
    fn duplicate_ids_collapse_on_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("resume.yaml");
        std::fs::write(
            &path,
            concat!(
                "sessionId: s1\n",
                "startTime: 2026-01-01T00:00:00Z\n",
                "lastUpdateTime: 2026-01-01T00:00:00Z\n",
                "completedSteps: []\n",
                "currentStep: null\n",
                "stepStates:\n",
                "  resources:\n",
                "    resourceType: issues\n",
                "    processedIds: [\"1\", \"1\", \"2\"]\n",
                "    lastProcessedId: \"2\"\n",
            ),
        )
        .expect("write");
        let store = ResumeStore::load(&ResumeConfig {
            enabled: true,
            state_file: path,
            auto_save_interval: 5_000,
        })
        .expect("load");
        let state = store.snapshot();
        let step = state.step_states.get("resources").expect("step state");
        assert_eq!(step.processed_ids.len(), 2);
    }

    #[test]
    fn disabled_store_never_touches_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ResumeStore::load(&config(dir.path(), false)).expect("load");
        store.record_processed("areas", "1").expect("record");
        store.mark_step_complete("areas").expect("complete");
        assert!(!dir.path().join("resume.yaml").exists());
    }
}
