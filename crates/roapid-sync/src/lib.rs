//! Scheduling and synchronization engine: discovers jobs on the wiki, refreshes their
//! data on a per-endpoint cadence and publishes real changes back.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use roapid_core::ScheduleEntry;
use roapid_storage::{ArtifactStore, Fetch, HttpClientConfig, HttpFetcher};
use roapid_wiki::{MediaWikiClient, WikiApi, WikiCredentials};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod bootstrap;
pub mod config;
pub mod docs;
pub mod engine;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod schedule;

pub use bootstrap::{recover, recover_at, RecoveryReport};
pub use config::{ConfigError, FileConfig, SyncConfig};
pub use docs::{DocsMirror, StaticDoc};
pub use engine::{RunResult, SweepReport, SyncEngine};
pub use error::{ErrorPolicy, JobError};
pub use executor::{EndpointSettings, JobExecutor, JobOutcome};
pub use orchestrator::{OnceSummary, Orchestrator, TaskIntervals};
pub use schedule::{RunGuard, ScheduleStore};

pub const CRATE_NAME: &str = "roapid-sync";

/// Reads and validates the config file named by `sync.config_path`.
pub fn load_file_config(sync: &SyncConfig) -> Result<FileConfig> {
    let file = FileConfig::load(&sync.config_path)?;
    file.validate()
        .with_context(|| format!("validating {}", sync.config_path.display()))?;
    Ok(file)
}

/// Wires the engine around already-built collaborators.
pub fn assemble(
    sync: &SyncConfig,
    file: FileConfig,
    fetcher: Arc<dyn Fetch>,
    wiki: Arc<dyn WikiApi>,
) -> Result<Orchestrator> {
    let intervals = TaskIntervals::from_config(&file)?;
    let artifacts = ArtifactStore::new(sync.data_dir.clone());
    let settings = EndpointSettings {
        api_map: file.dynamic_endpoints.api_map.clone(),
        api_key: file.api_key().map(str::to_string),
        namespace: file.wiki.namespace.clone(),
    };

    let executor = Arc::new(JobExecutor::new(
        fetcher,
        artifacts.clone(),
        Arc::clone(&wiki),
        settings,
    ));
    let docs = DocsMirror::new(
        sync.docs_dir.clone(),
        artifacts,
        wiki,
        file.wiki.namespace.clone(),
    );
    let engine = SyncEngine::new(Arc::new(ScheduleStore::new()), executor, Arc::new(file));
    Ok(Orchestrator::new(engine, docs, sync.docs_dir.clone(), intervals))
}

/// Logs into the wiki and builds the HTTP fetcher, then assembles the orchestrator.
pub async fn connect(sync: &SyncConfig, file: FileConfig) -> Result<Orchestrator> {
    let wiki = MediaWikiClient::login(&WikiCredentials {
        api_url: file.wiki.api_url.clone(),
        username: file.wiki.username.clone(),
        password: file.wiki.password.clone(),
        user_agent: sync.user_agent.clone(),
    })
    .await
    .context("creating wiki client")?;

    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(sync.http_timeout_secs),
        user_agent: Some(sync.user_agent.clone()),
        ..Default::default()
    })?;

    assemble(sync, file, Arc::new(fetcher), Arc::new(wiki))
}

pub async fn run_daemon_from_env(cancel: CancellationToken) -> Result<()> {
    let sync = SyncConfig::from_env();
    let file = load_file_config(&sync)?;
    info!(config = %sync.config_path.display(), data = %sync.data_dir.display(), "starting roapid");
    connect(&sync, file).await?.run(cancel).await
}

pub async fn run_once_from_env() -> Result<OnceSummary> {
    let sync = SyncConfig::from_env();
    let file = load_file_config(&sync)?;
    connect(&sync, file).await?.run_once().await
}

/// The schedule a fresh start would recover from the data directory, without touching the wiki.
pub async fn recovered_schedule(
    sync: &SyncConfig,
    file: &FileConfig,
) -> BTreeMap<String, ScheduleEntry> {
    let store = ScheduleStore::new();
    let artifacts = ArtifactStore::new(sync.data_dir.clone());
    recover(
        &store,
        &artifacts,
        &file.dynamic_endpoints.category_prefix,
        |ty| file.resolve_interval(ty),
    )
    .await;
    store.snapshot_all()
}
