//! Static wiki documents: `about.json`, the per-endpoint usage guides and the Lua module.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use roapid_storage::ArtifactStore;
use roapid_wiki::{ensure_versioned_page, ModuleStatus, WikiApi, WikiError};
use tracing::{debug, info, warn};

use crate::error::JobError;

pub const MODULE_VERSION: &str = "0.0.17";
pub const MODULE_SOURCE_FILE: &str = "roapid.lua";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticDoc {
    pub file_name: &'static str,
    pub summary: &'static str,
}

pub const ABOUT_DOC: StaticDoc = StaticDoc {
    file_name: "about.json",
    summary: "Automated sync of about information",
};

pub const GUIDE_DOCS: [StaticDoc; 6] = [
    StaticDoc {
        file_name: "badges.json",
        summary: "Automated sync of legacy badges usage guide",
    },
    StaticDoc {
        file_name: "users.json",
        summary: "Automated sync of users usage guide",
    },
    StaticDoc {
        file_name: "groups.json",
        summary: "Automated sync of groups usage guide",
    },
    StaticDoc {
        file_name: "universes.json",
        summary: "Automated sync of universes usage guide",
    },
    StaticDoc {
        file_name: "places.json",
        summary: "Automated sync of places usage guide",
    },
    StaticDoc {
        file_name: "games.json",
        summary: "Automated sync of legacy games API guide",
    },
];

/// Mirrors local JSON documents onto `<namespace>:roapid/<file>`.
pub struct DocsMirror {
    docs_dir: PathBuf,
    artifacts: ArtifactStore,
    wiki: Arc<dyn WikiApi>,
    namespace: String,
}

impl DocsMirror {
    pub fn new(
        docs_dir: impl Into<PathBuf>,
        artifacts: ArtifactStore,
        wiki: Arc<dyn WikiApi>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            docs_dir: docs_dir.into(),
            artifacts,
            wiki,
            namespace: namespace.into(),
        }
    }

    pub fn title_for(&self, doc: &StaticDoc) -> String {
        format!("{}:roapid/{}", self.namespace, doc.file_name)
    }

    /// Pushes `doc` when its content drifted from the stored copy. Returns whether it was pushed.
    pub async fn sync_doc(&self, doc: &StaticDoc) -> Result<bool, JobError> {
        let path = self.docs_dir.join(doc.file_name);
        let content = tokio::fs::read(&path)
            .await
            .map_err(|source| JobError::LocalDocument {
                path: path.clone(),
                source,
            })?;

        if !self.artifacts.has_changed(doc.file_name, &content).await? {
            debug!(file = doc.file_name, "unchanged; skipping wiki update");
            return Ok(false);
        }

        let stored = self.artifacts.save(doc.file_name, &content).await?;
        let title = self.title_for(doc);
        self.wiki
            .push(&title, &String::from_utf8_lossy(&stored.bytes), doc.summary)
            .await
            .map_err(|source| JobError::Publish {
                title: title.clone(),
                source,
            })?;

        if let Err(err) = self.wiki.purge_pages(std::slice::from_ref(&title)).await {
            warn!(%title, error = %err, "error purging page");
        }
        info!(%title, "synced static document");
        Ok(true)
    }

    pub async fn sync_about(&self) -> Result<bool, JobError> {
        self.sync_doc(&ABOUT_DOC).await
    }

    /// Tries every guide and returns the first error, if any.
    pub async fn sync_guides(&self) -> Result<usize, JobError> {
        let mut pushed = 0;
        let mut first_err = None;
        for doc in &GUIDE_DOCS {
            match self.sync_doc(doc).await {
                Ok(true) => pushed += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(file = doc.file_name, error = %err, "error syncing document");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(pushed),
        }
    }
}

/// Values substituted into the module template.
#[derive(Debug, Clone)]
pub struct ModuleParams<'a> {
    pub namespace: &'a str,
    pub category_prefix: &'a str,
    pub queue_note: &'a str,
    pub field_path_not_found: &'a str,
}

/// Fills the template placeholders and makes sure the first line carries the version.
/// A different `-- x.y.z` first line is replaced rather than kept below the new one.
pub fn render_module(source: &str, params: &ModuleParams<'_>) -> String {
    let rendered = source
        .replace("{{NAMESPACE}}", params.namespace)
        .replace("{{CATEGORY_PREFIX}}", params.category_prefix)
        .replace("{{MSG_QUEUE_NOTE}}", params.queue_note)
        .replace("{{MSG_FIELD_PATH_NOT_FOUND}}", params.field_path_not_found);

    let header = format!("-- {MODULE_VERSION}");
    let (first, rest) = rendered.split_once('\n').unwrap_or((rendered.as_str(), ""));
    let first = first.trim();
    if first == header {
        rendered
    } else if is_version_header(first) {
        format!("{header}\n{rest}")
    } else {
        format!("{header}\n{rendered}")
    }
}

fn is_version_header(line: &str) -> bool {
    line.strip_prefix("-- ").is_some_and(|version| {
        let parts: Vec<&str> = version.split('.').collect();
        parts.len() == 3
            && parts
                .iter()
                .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
    })
}

/// Ensures `<namespace>:Roapid` runs [`MODULE_VERSION`]. `Ok(None)` when no module source exists.
pub async fn bootstrap_module(
    wiki: &dyn WikiApi,
    docs_dir: &Path,
    params: &ModuleParams<'_>,
) -> Result<Option<ModuleStatus>, WikiError> {
    let path = docs_dir.join(MODULE_SOURCE_FILE);
    let source = match tokio::fs::read_to_string(&path).await {
        Ok(source) => source,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "module source unavailable, skipping module setup");
            return Ok(None);
        }
    };

    let title = format!("{}:Roapid", params.namespace);
    let content = render_module(&source, params);
    ensure_versioned_page(wiki, &title, MODULE_VERSION, &content)
        .await
        .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ModuleParams<'static> {
        ModuleParams {
            namespace: "Module",
            category_prefix: "roapid",
            queue_note: "wait",
            field_path_not_found: "missing %s",
        }
    }

    #[test]
    fn module_placeholders_are_substituted() {
        let source = "-- 0.0.17\nlocal ns = \"{{NAMESPACE}}\"\nlocal p = \"{{CATEGORY_PREFIX}}\"\n\
                      local q = \"{{MSG_QUEUE_NOTE}}\"\nlocal f = \"{{MSG_FIELD_PATH_NOT_FOUND}}\"\n";
        let rendered = render_module(source, &params());
        assert_eq!(
            rendered,
            "-- 0.0.17\nlocal ns = \"Module\"\nlocal p = \"roapid\"\nlocal q = \"wait\"\nlocal f = \"missing %s\"\n"
        );
    }

    #[test]
    fn module_without_version_header_gets_one() {
        let rendered = render_module("return {}\n", &params());
        assert!(rendered.starts_with("-- 0.0.17\nreturn {}"));

        let comment = render_module("-- helpers\nreturn {}\n", &params());
        assert_eq!(comment, "-- 0.0.17\n-- helpers\nreturn {}\n");
    }

    #[test]
    fn stale_version_header_is_replaced() {
        let stale = render_module("-- 0.0.1\nreturn {}\n", &params());
        assert_eq!(stale, "-- 0.0.17\nreturn {}\n");

        let only_header = render_module("-- 0.0.16", &params());
        assert_eq!(only_header, "-- 0.0.17\n");
    }

    #[test]
    fn guide_list_has_no_job_shaped_names() {
        for doc in GUIDE_DOCS.iter().chain(std::iter::once(&ABOUT_DOC)) {
            assert!(roapid_core::parse_artifact_file_name(doc.file_name).is_none());
        }
    }
}
