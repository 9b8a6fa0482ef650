//! Startup sequence, periodic tasks and graceful shutdown.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use roapid_wiki::ModuleStatus;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bootstrap::{recover, RecoveryReport};
use crate::config::{ConfigError, FileConfig};
use crate::docs::{bootstrap_module, DocsMirror, ModuleParams};
use crate::engine::{SweepReport, SyncEngine};

/// Periods of the four background tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskIntervals {
    pub category_check: Duration,
    pub data_refresh: Duration,
    pub about: Duration,
    pub docs: Duration,
}

impl TaskIntervals {
    pub fn from_config(config: &FileConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            category_check: config.category_check_interval()?,
            data_refresh: config.data_refresh_interval()?,
            about: config.task_interval("about")?,
            docs: config.task_interval("badges")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OnceSummary {
    pub recovery: RecoveryReport,
    pub discovery: Option<SweepReport>,
    pub refresh: SweepReport,
}

pub struct Orchestrator {
    engine: SyncEngine,
    docs: Arc<DocsMirror>,
    docs_dir: PathBuf,
    intervals: TaskIntervals,
}

impl Orchestrator {
    pub fn new(
        engine: SyncEngine,
        docs: DocsMirror,
        docs_dir: impl Into<PathBuf>,
        intervals: TaskIntervals,
    ) -> Self {
        Self {
            engine,
            docs: Arc::new(docs),
            docs_dir: docs_dir.into(),
            intervals,
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub async fn setup_module(&self) -> Result<Option<ModuleStatus>> {
        let config = self.engine.config();
        let params = ModuleParams {
            namespace: &config.wiki.namespace,
            category_prefix: &config.dynamic_endpoints.category_prefix,
            queue_note: config.queue_note(),
            field_path_not_found: config.field_path_not_found(),
        };
        bootstrap_module(self.engine.executor().wiki().as_ref(), &self.docs_dir, &params)
            .await
            .context("setting up Roapid module on wiki")
    }

    pub async fn sync_docs(&self) {
        if let Err(err) = self.docs.sync_about().await {
            warn!(error = %err, "about sync failed");
        }
        if let Err(err) = self.docs.sync_guides().await {
            warn!(error = %err, "documentation sync failed");
        }
    }

    pub async fn recover(&self) -> RecoveryReport {
        let config = Arc::clone(self.engine.config());
        recover(
            self.engine.schedule(),
            self.engine.executor().artifacts(),
            self.engine.prefix(),
            |ty| config.resolve_interval(ty),
        )
        .await
    }

    /// Spawns one task per entry that is due right now.
    fn dispatch_due(&self, tasks: &mut JoinSet<()>, cancel: &CancellationToken) -> usize {
        let due = self.engine.due_jobs(Utc::now());
        let count = due.len();
        for (category, job) in due {
            let engine = self.engine.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                if cancel.is_cancelled() {
                    debug!(%category, "skipping immediate refresh due to shutdown");
                    return;
                }
                debug!(%category, "immediate refresh");
                engine.run_job(&category, &job).await;
            });
        }
        count
    }

    /// Runs until `cancel` fires, then waits for every spawned task to finish.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        self.setup_module().await?;
        self.sync_docs().await;
        self.recover().await;

        info!(
            categories = ?self.intervals.category_check,
            refresh = ?self.intervals.data_refresh,
            "starting with intervals"
        );

        let mut tasks = JoinSet::new();
        let dispatched = self.dispatch_due(&mut tasks, &cancel);
        debug!(dispatched, "immediate dispatch started");

        if !cancel.is_cancelled() {
            if let Err(err) = self.engine.discovery_sweep().await {
                error!(error = %err, "error fetching queue categories");
            }
        }

        let docs = Arc::clone(&self.docs);
        spawn_ticker(&mut tasks, &cancel, "about sync", self.intervals.about, move || {
            let docs = Arc::clone(&docs);
            async move {
                if let Err(err) = docs.sync_about().await {
                    warn!(error = %err, "scheduled about sync failed");
                }
            }
        });

        let docs = Arc::clone(&self.docs);
        spawn_ticker(&mut tasks, &cancel, "documentation sync", self.intervals.docs, move || {
            let docs = Arc::clone(&docs);
            async move {
                if let Err(err) = docs.sync_guides().await {
                    warn!(error = %err, "scheduled documentation sync failed");
                }
            }
        });

        let engine = self.engine.clone();
        spawn_ticker(&mut tasks, &cancel, "category scan", self.intervals.category_check, move || {
            let engine = engine.clone();
            async move {
                if let Err(err) = engine.discovery_sweep().await {
                    error!(error = %err, "error fetching queue categories");
                }
            }
        });

        let engine = self.engine.clone();
        spawn_ticker(&mut tasks, &cancel, "data refresh", self.intervals.data_refresh, move || {
            let engine = engine.clone();
            async move {
                engine.refresh_sweep().await;
            }
        });

        cancel.cancelled().await;
        info!("shutdown signal received, waiting for workers to finish");
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "background task failed");
            }
        }
        info!("shutdown complete");
        Ok(())
    }

    /// Bootstrap, one discovery sweep and one refresh sweep, then return.
    pub async fn run_once(&self) -> Result<OnceSummary> {
        self.setup_module().await?;
        self.sync_docs().await;
        let recovery = self.recover().await;
        let discovery = match self.engine.discovery_sweep().await {
            Ok(report) => Some(report),
            Err(err) => {
                error!(error = %err, "error fetching queue categories");
                None
            }
        };
        let refresh = self.engine.refresh_sweep().await;
        Ok(OnceSummary {
            recovery,
            discovery,
            refresh,
        })
    }
}

/// Calls `tick` every `period`, first one period from now, until `cancel` fires.
/// A tick in progress always runs to completion.
fn spawn_ticker<F, Fut>(
    tasks: &mut JoinSet<()>,
    cancel: &CancellationToken,
    name: &'static str,
    period: Duration,
    tick: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if period.is_zero() {
        return;
    }
    let cancel = cancel.clone();
    tasks.spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(task = name, "ticker stopping");
                    return;
                }
                _ = ticker.tick() => tick().await,
            }
        }
    });
}
