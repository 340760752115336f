//! Periodic YAML progress report.
//!
//! A ticker serializes the current counters to a single YAML file. Every
//! write goes to a temp file first and is renamed into place under an
//! advisory lock, so the report always parses even while a concurrent
//! reader polls it. Lock contention beyond the timeout skips the write;
//! progress reporting must never take the crawl down with it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::ProgressConfig;
use crate::error::{CrawlError, Result};

/// Bound on the error ring.
const MAX_ERRORS: usize = 50;
/// Poll interval while waiting for the advisory lock.
const LOCK_POLL: std::time::Duration = std::time::Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReportMetadata {
    pub session_id: String,
    pub host: String,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub total_steps: u32,
    pub current_step: Option<String>,
    pub completed_steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReportStats {
    pub areas_discovered: u64,
    pub records_written: u64,
    pub records_filtered: u64,
    pub requests_failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub elapsed_seconds: u64,
    pub records_per_minute: u64,
    pub estimated_remaining_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCounters {
    pub total: u64,
    pub processed: u64,
    pub filtered: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedError {
    pub timestamp: DateTime<Utc>,
    pub step: String,
    pub message: String,
    pub recoverable: bool,
}

/// The document serialized to the progress file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub metadata: ReportMetadata,
    pub stats: ReportStats,
    pub performance: PerformanceMetrics,
    pub resources: BTreeMap<String, ResourceCounters>,
    pub errors: Vec<ReportedError>,
}

struct ReporterState {
    report: ProgressReport,
    started: Option<Instant>,
}

/// Samples crawl counters into a YAML file on a fixed interval.
pub struct ProgressReporter {
    config: ProgressConfig,
    state: Arc<Mutex<ReporterState>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressReporter {
    pub fn new(config: ProgressConfig, session_id: String, host: String) -> Self {
        let report = ProgressReport {
            metadata: ReportMetadata {
                session_id,
                host,
                ..ReportMetadata::default()
            },
            ..ProgressReport::default()
        };
        Self {
            config,
            state: Arc::new(Mutex::new(ReporterState {
                report,
                started: None,
            })),
            ticker: Mutex::new(None),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ReporterState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Begin the periodic ticker. No-op when disabled.
    pub fn start(&self) {
        if !self.config.enabled {
            return;
        }
        {
            let mut state = self.lock_state();
            state.started = Some(Instant::now());
            state.report.metadata.started_at = Some(Utc::now());
        }
        let config = self.config.clone();
        let state = Arc::clone(&self.state);
        let interval = std::time::Duration::from_millis(self.config.interval.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = write_report(&config, &state).await {
                    warn!("progress write skipped: {e}");
                }
            }
        });
        if let Ok(mut ticker) = self.ticker.lock() {
            *ticker = Some(handle);
        }
    }

    /// Stop the ticker and flush a final report.
    pub async fn stop(&self) {
        let handle = self.ticker.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        if self.config.enabled
            && let Err(e) = self.write_now().await
        {
            warn!("final progress write skipped: {e}");
        }
    }

    pub fn set_total_steps(&self, total: u32) {
        if !self.config.enabled {
            return;
        }
        self.lock_state().report.metadata.total_steps = total;
    }

    pub fn update_current_step(&self, step: &str) {
        if !self.config.enabled {
            return;
        }
        self.lock_state().report.metadata.current_step = Some(step.to_owned());
    }

    pub fn complete_step(&self, step: &str) {
        if !self.config.enabled {
            return;
        }
        let mut state = self.lock_state();
        if state.report.metadata.current_step.as_deref() == Some(step) {
            state.report.metadata.current_step = None;
        }
        if !state.report.metadata.completed_steps.iter().any(|s| s == step) {
            state.report.metadata.completed_steps.push(step.to_owned());
        }
    }

    /// Add deltas to one resource type's counters.
    pub fn update_resource_count(
        &self,
        resource_type: &str,
        total: u64,
        processed: u64,
        filtered: u64,
        errors: u64,
    ) {
        if !self.config.enabled {
            return;
        }
        let mut state = self.lock_state();
        if self.config.detailed {
            let counters = state
                .report
                .resources
                .entry(resource_type.to_owned())
                .or_default();
            counters.total += total;
            counters.processed += processed;
            counters.filtered += filtered;
            counters.errors += errors;
        }
        state.report.stats.records_written += processed;
        state.report.stats.records_filtered += filtered;
    }

    pub fn record_area_discovered(&self) {
        if !self.config.enabled {
            return;
        }
        self.lock_state().report.stats.areas_discovered += 1;
    }

    pub fn update_performance_metrics(&self) {
        if !self.config.enabled {
            return;
        }
        let mut state = self.lock_state();
        let Some(started) = state.started else {
            return;
        };
        let elapsed = started.elapsed().as_secs();
        state.report.performance.elapsed_seconds = elapsed;
        if elapsed > 0 {
            state.report.performance.records_per_minute =
                state.report.stats.records_written * 60 / elapsed;
        }
    }

    pub fn update_estimated_time_remaining(&self, seconds: Option<u64>) {
        if !self.config.enabled {
            return;
        }
        self.lock_state()
            .report
            .performance
            .estimated_remaining_seconds = seconds;
    }

    /// Record an error, keeping only the most recent [`MAX_ERRORS`].
    pub fn add_error(&self, step: &str, message: &str, recoverable: bool) {
        if !self.config.enabled {
            return;
        }
        let mut state = self.lock_state();
        state.report.stats.requests_failed += 1;
        state.report.errors.push(ReportedError {
            timestamp: Utc::now(),
            step: step.to_owned(),
            message: message.to_owned(),
            recoverable,
        });
        let len = state.report.errors.len();
        if len > MAX_ERRORS {
            state.report.errors.drain(..len - MAX_ERRORS);
        }
    }

    pub fn current_report(&self) -> ProgressReport {
        self.lock_state().report.clone()
    }

    /// Serialize the report and atomically replace the file.
    ///
    /// When disabled this must not create the file.
    pub async fn force_write(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        self.write_now().await
    }

    async fn write_now(&self) -> Result<()> {
        write_report(&self.config, &self.state).await
    }
}

/// Refresh derived metrics and serialize the report to its file.
async fn write_report(config: &ProgressConfig, state: &Arc<Mutex<ReporterState>>) -> Result<()> {
    let yaml = {
        let mut state = match state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(started) = state.started {
            let elapsed = started.elapsed().as_secs();
            state.report.performance.elapsed_seconds = elapsed;
            if elapsed > 0 {
                state.report.performance.records_per_minute =
                    state.report.stats.records_written * 60 / elapsed;
            }
        }
        state.report.metadata.updated_at = Some(Utc::now());
        serde_yaml::to_string(&state.report)?
    };
    let timeout = std::time::Duration::from_millis(config.lock_timeout);
    locked_write(&config.file, yaml.as_bytes(), timeout).await?;
    debug!("progress report written to {}", config.file.display());
    Ok(())
}

/// Replace `path` under an advisory lock on a sidecar `.lock` file.
///
/// The lock is polled up to `timeout`; contention past the deadline yields
/// a lock-timeout error the caller logs and swallows. The temp-file rename
/// keeps the report parseable at every instant.
async fn locked_write(path: &Path, bytes: &[u8], timeout: std::time::Duration) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let lock_path = lock_path(path);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    let mut lock = fd_lock::RwLock::new(file);
    let deadline = Instant::now() + timeout;
    loop {
        match lock.try_write() {
            Ok(guard) => {
                write_atomic(path, bytes)?;
                drop(guard);
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(CrawlError::LockTimeout {
                        path: path.to_owned(),
                        timeout,
                    });
                }
                tokio::time::sleep(LOCK_POLL).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_owned()).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp_name = path.file_name().map(|n| n.to_owned()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
