//! Discovery and refresh sweeps over the shared schedule.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use roapid_core::{parse_category, JobId, JobState};
use roapid_wiki::WikiError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::FileConfig;
use crate::error::{ErrorPolicy, JobError};
use crate::executor::JobExecutor;
use crate::schedule::ScheduleStore;

#[derive(Debug, Clone)]
pub struct SweepReport {
    pub sweep_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Labels returned by the wiki (discovery) or entries in the snapshot (refresh).
    pub considered: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub not_due: usize,
    pub invalid: usize,
    /// Already executing on another task.
    pub busy: usize,
}

impl SweepReport {
    fn start() -> Self {
        let now = Utc::now();
        Self {
            sweep_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            considered: 0,
            succeeded: 0,
            failed: 0,
            not_due: 0,
            invalid: 0,
            busy: 0,
        }
    }

    fn record(&mut self, run: RunResult) {
        match run {
            RunResult::Succeeded => self.succeeded += 1,
            RunResult::Failed => self.failed += 1,
            RunResult::Busy => self.busy += 1,
            RunResult::NotDue => self.not_due += 1,
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    Succeeded,
    Failed,
    Busy,
    /// Another task ran the job after the caller decided it was due.
    NotDue,
}

#[derive(Clone)]
pub struct SyncEngine {
    schedule: Arc<ScheduleStore>,
    executor: Arc<JobExecutor>,
    config: Arc<FileConfig>,
}

impl SyncEngine {
    pub fn new(
        schedule: Arc<ScheduleStore>,
        executor: Arc<JobExecutor>,
        config: Arc<FileConfig>,
    ) -> Self {
        Self {
            schedule,
            executor,
            config,
        }
    }

    pub fn schedule(&self) -> &Arc<ScheduleStore> {
        &self.schedule
    }

    pub fn executor(&self) -> &Arc<JobExecutor> {
        &self.executor
    }

    pub fn config(&self) -> &Arc<FileConfig> {
        &self.config
    }

    pub fn prefix(&self) -> &str {
        &self.config.dynamic_endpoints.category_prefix
    }

    pub async fn run_job(&self, category: &str, job: &JobId) -> RunResult {
        self.run_job_at(Utc::now(), category, job).await
    }

    /// Executes one job and, on success, reschedules it one interval after completion.
    /// Failures leave the entry exactly as it was.
    ///
    /// The entry is re-read once the claim is held, so a caller working from an older
    /// snapshot does not repeat a run that finished in the meantime.
    pub async fn run_job_at(&self, now: DateTime<Utc>, category: &str, job: &JobId) -> RunResult {
        let Some(_guard) = self.schedule.try_claim(job) else {
            debug!(category, "job already running, skipping");
            return RunResult::Busy;
        };
        if self.schedule.state(category, now) == JobState::NotYetDue {
            debug!(category, "job already refreshed, skipping");
            return RunResult::NotDue;
        }

        match self.executor.execute(job, category).await {
            Ok(outcome) => {
                let entry = self.schedule.upsert(category, job, None, |ty| {
                    self.config.resolve_interval(ty)
                });
                debug!(
                    category,
                    changed = outcome.changed,
                    published = outcome.published,
                    content_hash = %outcome.content_hash,
                    next_run = %entry.next_run,
                    "job complete"
                );
                RunResult::Succeeded
            }
            Err(err) => {
                log_job_error(category, &err);
                RunResult::Failed
            }
        }
    }

    /// Lists categories on the wiki; runs unknown ones immediately and known ones when due.
    pub async fn discovery_sweep(&self) -> Result<SweepReport, WikiError> {
        info!("checking for new wanted categories");
        let mut report = SweepReport::start();
        let categories = self
            .executor
            .wiki()
            .categories_with_prefix(self.prefix())
            .await?;
        report.considered = categories.len();

        for category in categories {
            let job = match parse_category(&category, self.prefix()) {
                Ok(job) => job,
                Err(err) => {
                    log_job_error(&category, &JobError::from(err));
                    report.invalid += 1;
                    continue;
                }
            };

            let category = match self.schedule.label_for(&job) {
                Some(scheduled) if scheduled != category => {
                    debug!(listed = %category, %scheduled, "job already scheduled under another label");
                    scheduled
                }
                _ => category,
            };

            match self.schedule.state(&category, Utc::now()) {
                JobState::Unknown => {
                    info!(%category, "processing new endpoint");
                    report.record(self.run_job(&category, &job).await);
                }
                JobState::Due => {
                    info!(%category, "refreshing endpoint");
                    report.record(self.run_job(&category, &job).await);
                }
                JobState::NotYetDue => report.not_due += 1,
            }
        }

        Ok(report.finish())
    }

    pub async fn refresh_sweep(&self) -> SweepReport {
        self.refresh_sweep_at(Utc::now()).await
    }

    /// Runs every scheduled entry whose `next_run` is at or before `now`, listed or not.
    pub async fn refresh_sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        info!("refreshing existing data");
        let mut report = SweepReport::start();
        let snapshot = self.schedule.snapshot_all();
        report.considered = snapshot.len();

        for (category, entry) in snapshot {
            if !entry.is_due(now) {
                debug!(%category, next_run = %entry.next_run, "not due, skipping");
                report.not_due += 1;
                continue;
            }
            let job = match parse_category(&category, self.prefix()) {
                Ok(job) => job,
                Err(err) => {
                    log_job_error(&category, &JobError::from(err));
                    report.invalid += 1;
                    continue;
                }
            };
            info!(%category, "refreshing endpoint");
            report.record(self.run_job_at(now, &category, &job).await);
        }

        report.finish()
    }

    /// Labels of entries due at `now`, with their parsed identities.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Vec<(String, JobId)> {
        self.schedule
            .snapshot_all()
            .into_iter()
            .filter(|(_, entry)| entry.is_due(now))
            .filter_map(|(category, _)| {
                parse_category(&category, self.prefix())
                    .ok()
                    .map(|job| (category, job))
            })
            .collect()
    }
}

pub(crate) fn log_job_error(category: &str, err: &JobError) {
    match err.policy() {
        ErrorPolicy::SkipAndLog => warn!(category, error = %err, "skipping job"),
        ErrorPolicy::RetryNextSweep => {
            warn!(category, error = %err, "job failed, will retry next sweep")
        }
        ErrorPolicy::Fatal => error!(category, error = %err, "job failed"),
    }
}
