//! Rebuilds the schedule from artifacts persisted by earlier runs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use roapid_core::parse_artifact_file_name;
use roapid_storage::ArtifactStore;
use tracing::{debug, error, info};

use crate::schedule::ScheduleStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Category labels seeded as immediately due.
    pub scheduled: Vec<String>,
    pub skipped_existing: usize,
    /// Files that do not follow `<type>-<id>.json`, e.g. static docs.
    pub ignored: usize,
}

pub async fn recover(
    store: &ScheduleStore,
    artifacts: &ArtifactStore,
    prefix: &str,
    resolve_interval: impl Fn(&str) -> Duration,
) -> RecoveryReport {
    recover_at(Utc::now(), store, artifacts, prefix, resolve_interval).await
}

/// Seeds one due entry per artifact file. Never fails: a missing directory means a fresh
/// install, any other listing error is logged and recovery is abandoned for this run.
pub async fn recover_at(
    now: DateTime<Utc>,
    store: &ScheduleStore,
    artifacts: &ArtifactStore,
    prefix: &str,
    resolve_interval: impl Fn(&str) -> Duration,
) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    let names = match artifacts.list_file_names().await {
        Ok(Some(names)) => names,
        Ok(None) => {
            debug!(root = %artifacts.root().display(), "data directory not found; nothing to schedule yet");
            return report;
        }
        Err(err) => {
            error!(error = %err, "cannot read data directory, skipping bootstrap");
            return report;
        }
    };

    for name in names {
        let Some(job) = parse_artifact_file_name(&name) else {
            report.ignored += 1;
            continue;
        };
        let category = job.category_label(prefix);
        if store.contains_job(&job) {
            report.skipped_existing += 1;
            continue;
        }

        debug!(%category, file = %name, "scheduling from existing data file");
        store.upsert_at(now, &category, &job, Some(now), &resolve_interval);
        report.scheduled.push(category);
    }

    info!(
        scheduled = report.scheduled.len(),
        ignored = report.ignored,
        "bootstrap recovered schedule from data files"
    );
    report
}
