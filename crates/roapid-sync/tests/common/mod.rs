#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use roapid_storage::{Fetch, FetchError};
use roapid_sync::{assemble, FileConfig, Orchestrator, SyncConfig};
use roapid_wiki::{WikiApi, WikiError};

pub const PREFIX: &str = "roapid";
pub const BADGE_URL: &str = "https://badges.example/v1/badges/";

#[derive(Default)]
pub struct FakeFetcher {
    responses: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    pub calls: Mutex<Vec<(String, Vec<(String, String)>)>>,
}

impl FakeFetcher {
    pub fn respond(&self, url: &str, body: &str) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), body.as_bytes().to_vec());
    }

    pub fn fail(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    pub fn recover(&self, url: &str) {
        self.failing.lock().unwrap().remove(url);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetch for FakeFetcher {
    async fn fetch(&self, url: &str, headers: &[(String, String)]) -> Result<Vec<u8>, FetchError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), headers.to_vec()));
        if self.failing.lock().unwrap().contains(url) {
            return Err(FetchError::HttpStatus {
                status: 503,
                url: url.to_string(),
            });
        }
        self.responses
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
    }
}

#[derive(Default)]
pub struct FakeWiki {
    pub categories: Mutex<Vec<String>>,
    pub pages: Mutex<HashMap<String, String>>,
    /// (title, summary) per edit, in order.
    pub pushes: Mutex<Vec<(String, String)>>,
    pub purged_categories: Mutex<Vec<String>>,
    pub purged_pages: Mutex<Vec<String>>,
    pub fail_listing: Mutex<bool>,
    pub fail_purge: Mutex<bool>,
}

impl FakeWiki {
    pub fn with_categories(labels: &[&str]) -> Self {
        let wiki = Self::default();
        *wiki.categories.lock().unwrap() = labels.iter().map(|s| s.to_string()).collect();
        wiki
    }

    pub fn push_count(&self) -> usize {
        self.pushes.lock().unwrap().len()
    }

    pub fn pushed_titles(&self) -> Vec<String> {
        self.pushes
            .lock()
            .unwrap()
            .iter()
            .map(|(title, _)| title.clone())
            .collect()
    }

    pub fn delete_page(&self, title: &str) {
        self.pages.lock().unwrap().remove(title);
    }
}

#[async_trait]
impl WikiApi for FakeWiki {
    async fn categories_with_prefix(&self, _prefix: &str) -> Result<Vec<String>, WikiError> {
        if *self.fail_listing.lock().unwrap() {
            return Err(WikiError::Status(502));
        }
        Ok(self.categories.lock().unwrap().clone())
    }

    async fn category_members(&self, category: &str) -> Result<Vec<String>, WikiError> {
        Ok(vec![format!("Page using {category}")])
    }

    async fn page_exists(&self, title: &str) -> Result<bool, WikiError> {
        Ok(self.pages.lock().unwrap().contains_key(title))
    }

    async fn page_content(&self, title: &str) -> Result<Option<String>, WikiError> {
        Ok(self.pages.lock().unwrap().get(title).cloned())
    }

    async fn push(&self, title: &str, content: &str, summary: &str) -> Result<(), WikiError> {
        self.pages
            .lock()
            .unwrap()
            .insert(title.to_string(), content.to_string());
        self.pushes
            .lock()
            .unwrap()
            .push((title.to_string(), summary.to_string()));
        Ok(())
    }

    async fn purge_pages(&self, titles: &[String]) -> Result<(), WikiError> {
        self.purged_pages.lock().unwrap().extend(titles.iter().cloned());
        Ok(())
    }

    async fn purge_category_members(&self, category: &str) -> Result<(), WikiError> {
        if *self.fail_purge.lock().unwrap() {
            return Err(WikiError::Status(500));
        }
        self.purged_categories
            .lock()
            .unwrap()
            .push(category.to_string());
        Ok(())
    }
}

pub fn file_config() -> FileConfig {
    let mut cfg = FileConfig::default();
    cfg.server.category_check_interval = "1m".into();
    cfg.server.data_refresh_interval = "5m".into();
    cfg.wiki.api_url = "https://wiki.example/api.php".into();
    cfg.wiki.namespace = "Module".into();
    cfg.dynamic_endpoints.category_prefix = PREFIX.into();
    cfg.dynamic_endpoints
        .api_map
        .insert("badges".into(), format!("{BADGE_URL}%s"));
    cfg.dynamic_endpoints
        .api_map
        .insert("users".into(), "https://apis.example/cloud/v2/users/{}".into());
    cfg.dynamic_endpoints
        .api_map
        .insert("places".into(), "https://apis.example/cloud/v2/{}".into());
    cfg.dynamic_endpoints
        .refresh_intervals
        .insert("badges".into(), "10m".into());
    cfg
}

pub fn sync_config(root: &Path) -> SyncConfig {
    SyncConfig {
        config_path: root.join("config.json"),
        data_dir: root.join("data"),
        docs_dir: root.join("docs"),
        user_agent: "roapid-tests".into(),
        http_timeout_secs: 5,
    }
}

pub struct Harness {
    pub fetcher: Arc<FakeFetcher>,
    pub wiki: Arc<FakeWiki>,
    pub orchestrator: Orchestrator,
}

pub fn harness(root: &Path, file: FileConfig, wiki: FakeWiki) -> Harness {
    let fetcher = Arc::new(FakeFetcher::default());
    let wiki = Arc::new(wiki);
    let orchestrator = assemble(
        &sync_config(root),
        file,
        Arc::clone(&fetcher) as Arc<dyn Fetch>,
        Arc::clone(&wiki) as Arc<dyn WikiApi>,
    )
    .unwrap();
    Harness {
        fetcher,
        wiki,
        orchestrator,
    }
}
