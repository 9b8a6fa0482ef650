//! fetch -> change check -> persist -> publish -> purge, for one job.

use std::collections::HashMap;
use std::sync::Arc;

use roapid_core::{format_endpoint_url, JobId};
use roapid_storage::{ArtifactStore, Fetch};
use roapid_wiki::WikiApi;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::JobError;

/// Endpoint settings the executor consumes from the config file.
#[derive(Debug, Clone, Default)]
pub struct EndpointSettings {
    /// Endpoint type -> fetch URL template with one `{}`/`%s` placeholder.
    pub api_map: HashMap<String, String>,
    pub api_key: Option<String>,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub changed: bool,
    pub published: bool,
    pub content_hash: String,
}

pub struct JobExecutor {
    fetcher: Arc<dyn Fetch>,
    artifacts: ArtifactStore,
    wiki: Arc<dyn WikiApi>,
    settings: EndpointSettings,
}

impl JobExecutor {
    pub fn new(
        fetcher: Arc<dyn Fetch>,
        artifacts: ArtifactStore,
        wiki: Arc<dyn WikiApi>,
        settings: EndpointSettings,
    ) -> Self {
        Self {
            fetcher,
            artifacts,
            wiki,
            settings,
        }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn wiki(&self) -> &Arc<dyn WikiApi> {
        &self.wiki
    }

    pub fn settings(&self) -> &EndpointSettings {
        &self.settings
    }

    /// Runs one job end to end. Any error leaves the caller's schedule entry untouched.
    pub async fn execute(&self, job: &JobId, category: &str) -> Result<JobOutcome, JobError> {
        let span = info_span!(
            "execute_job",
            category,
            endpoint_type = %job.endpoint_type,
            instance_id = %job.instance_id
        );
        self.execute_inner(job, category).instrument(span).await
    }

    async fn execute_inner(&self, job: &JobId, category: &str) -> Result<JobOutcome, JobError> {
        let template = self
            .settings
            .api_map
            .get(&job.endpoint_type)
            .ok_or_else(|| JobError::UnknownEndpoint(job.endpoint_type.clone()))?;
        let url = format_endpoint_url(job, template)?;
        let headers = self.request_headers(job)?;

        let payload = self
            .fetcher
            .fetch(&url, &headers)
            .await
            .map_err(|source| JobError::Fetch {
                url: url.clone(),
                source,
            })?;

        let relative_path = job.artifact_file_name();
        let changed = self.artifacts.has_changed(&relative_path, &payload).await?;
        let stored = self.artifacts.save(&relative_path, &payload).await?;

        let title = job.wiki_title(&self.settings.namespace);
        let should_push = changed || self.page_missing(&title).await;

        if should_push {
            info!(%url, %title, changed, "pushing to wiki");
            let content = String::from_utf8_lossy(&stored.bytes);
            self.wiki
                .push(&title, &content, &format!("Automated update from {url}"))
                .await
                .map_err(|source| JobError::Publish {
                    title: title.clone(),
                    source,
                })?;
        } else {
            debug!(%url, "no meaningful changes, skipping wiki push");
        }

        if let Err(err) = self.wiki.purge_category_members(category).await {
            warn!(category, error = %err, "error purging category members");
        }

        Ok(JobOutcome {
            changed,
            published: should_push,
            content_hash: stored.content_hash,
        })
    }

    fn request_headers(&self, job: &JobId) -> Result<Vec<(String, String)>, JobError> {
        if !job.requires_api_key() {
            return Ok(Vec::new());
        }
        let key = self
            .settings
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| JobError::MissingApiKey(job.endpoint_type.clone()))?;
        Ok(vec![
            ("x-api-key".to_string(), key.to_string()),
            ("Accept".to_string(), "application/json".to_string()),
        ])
    }

    /// True only when the wiki positively reports the page as absent.
    async fn page_missing(&self, title: &str) -> bool {
        match self.wiki.page_exists(title).await {
            Ok(true) => false,
            Ok(false) => {
                info!(title, "page missing on wiki, forcing upload");
                true
            }
            Err(err) => {
                warn!(title, error = %err, "error checking page existence");
                false
            }
        }
    }
}
