//! Crawl orchestration.
//!
//! The orchestrator drives the four workflow steps, isolates failures per
//! step, fans projects out across a bounded worker pool, and aggregates the
//! final summary. It owns the cancellation signal: on shutdown no new work
//! starts, in-flight writes finish, and the resume state and progress file
//! are flushed.

mod steps;
mod strategy;

pub use strategy::{COMMON_RESOURCES, Protocol, REPOSITORY_RESOURCES, ResourceSpec};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{error, info, warn};
use serde_json::Value;
use tokio::sync::watch;

use crate::api::{AuthState, GraphqlClient, RestClient};
use crate::callback::{CallbackPipeline, InlineCallback};
use crate::config::Config;
use crate::error::Result;
use crate::models::{Area, CallbackContext, CrawlResult, CrawlSummary, record_id};
use crate::output::{HierarchicalWriter, ProgressReporter, ResumeStore};

pub const STEP_AREAS: &str = "areas";
pub const STEP_USERS: &str = "users";
pub const STEP_RESOURCES: &str = "resources";
pub const STEP_REPOSITORY: &str = "repository";

/// Default step order when no selection is given.
pub const ALL_STEPS: &[&str] = &[STEP_AREAS, STEP_USERS, STEP_RESOURCES, STEP_REPOSITORY];

/// Resume metadata key carrying the discovered project list between steps
/// and across sessions.
const PROJECTS_METADATA_KEY: &str = "projects";

#[derive(Default)]
struct Tally {
    resources_crawled: u64,
    errors: u64,
    warnings: u64,
    details: BTreeMap<String, u64>,
}

pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) account_id: String,
    pub(crate) graphql: GraphqlClient,
    pub(crate) rest: RestClient,
    pub(crate) callbacks: CallbackPipeline,
    pub(crate) writer: HierarchicalWriter,
    pub(crate) progress: Arc<ProgressReporter>,
    pub(crate) resume: Arc<ResumeStore>,
    cancel: watch::Receiver<bool>,
    tally: Mutex<Tally>,
}

/// Drives a complete crawl session.
pub struct Crawler {
    inner: Arc<Inner>,
}

impl Crawler {
    /// Wire the crawl pipeline together.
    ///
    /// `auth` is shared between the REST and GraphQL transports so a token
    /// refreshed through one is immediately visible to the other.
    pub fn new(
        config: Config,
        account_id: String,
        auth: Arc<AuthState>,
        progress: Arc<ProgressReporter>,
        resume: Arc<ResumeStore>,
        inline_callback: Option<InlineCallback>,
        cancel: watch::Receiver<bool>,
    ) -> Result<Self> {
        let host = config.host_url()?;
        let timeout = config.gitlab.timeout_duration();
        let rate_limit = config.gitlab.rate_limit;
        let rest = RestClient::new(host.clone(), Arc::clone(&auth), timeout, rate_limit)?;
        let graphql = GraphqlClient::new(RestClient::new(host, auth, timeout, rate_limit)?);
        let callbacks = CallbackPipeline::from_config(&config.callbacks, inline_callback);
        let writer = HierarchicalWriter::new(&config.output);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                account_id,
                graphql,
                rest,
                callbacks,
                writer,
                progress,
                resume,
                cancel,
                tally: Mutex::new(Tally::default()),
            }),
        })
    }

    /// Run the selected steps in order and return the session summary.
    ///
    /// Every step runs in an error-isolated frame: a failing step is
    /// recorded and the next one still runs. The result is only `success`
    /// when no step recorded an error.
    pub async fn run(&self, steps: &[String]) -> CrawlResult {
        let started = Instant::now();
        let inner = &self.inner;
        inner.progress.start();

        let selected: Vec<&String> = steps
            .iter()
            .filter(|step| {
                if ALL_STEPS.contains(&step.as_str()) {
                    true
                } else {
                    warn!("unknown step '{step}' skipped");
                    inner.record_warning();
                    false
                }
            })
            .collect();
        inner.progress.set_total_steps(selected.len() as u32);

        let mut projects = inner.load_saved_projects();

        for step in selected {
            if inner.is_cancelled() {
                info!("cancellation requested; stopping before step '{step}'");
                break;
            }
            if inner.resume.is_step_complete(step) {
                info!("step '{step}' already complete; skipping");
                inner.progress.complete_step(step);
                continue;
            }
            inner.progress.update_current_step(step);
            inner.resume.set_current_step(step);
            let result = match step.as_str() {
                STEP_AREAS => steps::step_areas(inner, &mut projects).await,
                STEP_USERS => steps::step_users(inner).await,
                STEP_RESOURCES => steps::step_resources(inner, &projects).await,
                STEP_REPOSITORY => steps::step_repository(inner, &projects).await,
                _ => Ok(()),
            };
            match result {
                Ok(()) => {
                    if inner.is_cancelled() {
                        // An interrupted step is not complete; leave it
                        // resumable.
                        break;
                    }
                    if let Err(e) = inner.resume.mark_step_complete(step) {
                        warn!("could not checkpoint step '{step}': {e}");
                    }
                    inner.progress.complete_step(step);
                }
                Err(e) => {
                    error!("step '{step}' failed: {e}");
                    inner.progress.add_error(step, &e.to_string(), false);
                    inner.record_error();
                }
            }
        }

        if let Err(e) = inner.resume.save() {
            warn!("final resume save failed: {e}");
        }
        inner.progress.stop().await;
        inner.callbacks.shutdown().await;

        let tally = inner.lock_tally();
        CrawlResult {
            success: tally.errors == 0,
            total_processing_time_ms: started.elapsed().as_millis() as u64,
            summary: CrawlSummary {
                resources_crawled: tally.resources_crawled,
                errors: tally.errors,
                warnings: tally.warnings,
                details: tally.details.clone(),
            },
        }
    }
}

impl Inner {
    pub(crate) fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn lock_tally(&self) -> std::sync::MutexGuard<'_, Tally> {
        match self.tally.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn record_error(&self) {
        self.lock_tally().errors += 1;
    }

    pub(crate) fn record_warning(&self) {
        self.lock_tally().warnings += 1;
    }

    /// Record a recoverable failure scoped to one step, without aborting
    /// it.
    pub(crate) fn report_recoverable(&self, step: &str, message: &str) {
        warn!("recoverable failure in step '{step}': {message}");
        self.progress.add_error(step, message, true);
        self.record_error();
    }

    /// Push one batch through callback → resume filter → writer, updating
    /// counters. The batch's records all target the same file.
    pub(crate) async fn deliver(
        &self,
        step: &str,
        resource_type: &str,
        path: PathBuf,
        records: Vec<Value>,
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let fetched = records.len() as u64;
        let ctx = CallbackContext {
            host: self.config.gitlab.host.clone(),
            account_id: self.account_id.clone(),
            resource_type: resource_type.to_owned(),
        };
        let (survivors, outcome) = self.callbacks.process_objects(&ctx, records).await;

        let mut fresh = Vec::with_capacity(survivors.len());
        for record in survivors {
            if let Some(id) = record_id(&record)
                && self.resume.is_processed(step, &id)
            {
                continue;
            }
            fresh.push(record);
        }
        self.writer.append_records(&path, &fresh)?;
        for record in &fresh {
            if let Some(id) = record_id(record) {
                self.resume.record_processed(step, &id)?;
            }
        }

        let written = fresh.len() as u64;
        self.progress.update_resource_count(
            resource_type,
            fetched,
            written,
            outcome.filtered as u64,
            outcome.errors as u64,
        );
        let mut tally = self.lock_tally();
        tally.resources_crawled += written;
        *tally.details.entry(resource_type.to_owned()).or_default() += written;
        tally.warnings += outcome.errors as u64;
        Ok(())
    }

    fn load_saved_projects(&self) -> Vec<Area> {
        let state = self.resume.snapshot();
        state
            .global_metadata
            .get(PROJECTS_METADATA_KEY)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }

    pub(crate) fn save_projects(&self, projects: &[Area]) {
        match serde_json::to_value(projects) {
            Ok(value) => self.resume.set_global_metadata(PROJECTS_METADATA_KEY, value),
            Err(e) => warn!("could not record discovered projects: {e}"),
        }
    }
}
