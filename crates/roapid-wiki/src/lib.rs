//! MediaWiki client contract + action API implementation used to discover and publish jobs.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "roapid-wiki";

pub const DEFAULT_USER_AGENT: &str = "roapid/0.1 (wiki data bridge)";

/// Minimum spacing between two edits issued by one client.
pub const EDIT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum WikiError {
    #[error("wiki request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("wiki http status {0}")]
    Status(u16),
    #[error("wiki api error [{code}]: {info}")]
    Api { code: String, info: String },
    #[error("unexpected wiki response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("login failed: {0}")]
    Login(String),
    #[error("user does not have bot user rights, you may not proceed without it")]
    MissingBotRight,
    #[error("edit of {title} was not accepted: {result}")]
    EditRejected { title: String, result: String },
    #[error("{0} cannot be empty")]
    EmptyArgument(&'static str),
}

/// Everything the sync engine needs from the wiki: the discovery signal and the publish path.
#[async_trait]
pub trait WikiApi: Send + Sync {
    /// Full `Category:` titles of every category whose name starts with `prefix`.
    async fn categories_with_prefix(&self, prefix: &str) -> Result<Vec<String>, WikiError>;

    async fn category_members(&self, category: &str) -> Result<Vec<String>, WikiError>;

    async fn page_exists(&self, title: &str) -> Result<bool, WikiError>;

    /// Current wikitext of `title`, or `None` when the page does not exist.
    async fn page_content(&self, title: &str) -> Result<Option<String>, WikiError>;

    async fn push(&self, title: &str, content: &str, summary: &str) -> Result<(), WikiError>;

    async fn purge_pages(&self, titles: &[String]) -> Result<(), WikiError>;

    async fn purge_category_members(&self, category: &str) -> Result<(), WikiError> {
        let titles = self.category_members(category).await?;
        self.purge_pages(&titles).await
    }
}

/// Serializes writers so that at most one edit starts per [`EDIT_INTERVAL`].
#[derive(Debug)]
pub struct EditThrottle {
    min_gap: Duration,
    last_edit: Mutex<Option<Instant>>,
}

impl EditThrottle {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            last_edit: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last_edit.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_gap {
                tokio::time::sleep(self.min_gap - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

impl Default for EditThrottle {
    fn default() -> Self {
        Self::new(EDIT_INTERVAL)
    }
}

#[derive(Debug, Clone)]
pub struct WikiCredentials {
    pub api_url: String,
    pub username: String,
    pub password: String,
    pub user_agent: String,
}

/// Action API client holding a logged-in cookie session.
#[derive(Debug)]
pub struct MediaWikiClient {
    client: reqwest::Client,
    api_url: String,
    throttle: EditThrottle,
}

#[derive(Debug, Deserialize)]
struct QueryEnvelope<T> {
    query: Option<T>,
    #[serde(default, rename = "continue")]
    continuation: Option<Continuation>,
}

#[derive(Debug, Default, Deserialize)]
struct Continuation {
    accontinue: Option<String>,
    cmcontinue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokensQuery {
    tokens: Tokens,
}

#[derive(Debug, Deserialize)]
struct Tokens {
    logintoken: Option<String>,
    csrftoken: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfoQuery {
    userinfo: UserInfo,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(default)]
    rights: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AllCategoriesQuery {
    #[serde(default)]
    allcategories: Vec<CategoryRow>,
}

#[derive(Debug, Deserialize)]
struct CategoryRow {
    #[serde(default, alias = "*")]
    category: String,
}

#[derive(Debug, Deserialize)]
struct CategoryMembersQuery {
    #[serde(default)]
    categorymembers: Vec<TitleRow>,
}

#[derive(Debug, Deserialize)]
struct TitleRow {
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct PagesQuery {
    #[serde(default)]
    pages: Vec<PageRow>,
}

#[derive(Debug, Deserialize)]
struct PageRow {
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    invalid: bool,
    #[serde(default)]
    revisions: Vec<Revision>,
}

#[derive(Debug, Deserialize)]
struct Revision {
    slots: RevisionSlots,
}

#[derive(Debug, Deserialize)]
struct RevisionSlots {
    main: MainSlot,
}

#[derive(Debug, Deserialize)]
struct MainSlot {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    login: LoginResult,
}

#[derive(Debug, Deserialize)]
struct LoginResult {
    result: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EditResponse {
    edit: EditResult,
}

#[derive(Debug, Deserialize)]
struct EditResult {
    result: String,
}

impl MediaWikiClient {
    /// Logs in with a bot password and refuses accounts without the `bot` right.
    pub async fn login(credentials: &WikiCredentials) -> Result<Self, WikiError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .user_agent(credentials.user_agent.clone())
            .build()?;
        let wiki = Self {
            client,
            api_url: credentials.api_url.clone(),
            throttle: EditThrottle::default(),
        };

        let login_token = wiki.token("login").await?;
        let response: LoginResponse = serde_json::from_value(
            wiki.post(&[
                ("action", "login"),
                ("lgname", credentials.username.as_str()),
                ("lgpassword", credentials.password.as_str()),
                ("lgtoken", login_token.as_str()),
            ])
            .await?,
        )?;
        if response.login.result != "Success" {
            return Err(WikiError::Login(
                response.login.reason.unwrap_or(response.login.result),
            ));
        }

        let info: UserInfoQuery = wiki
            .query(&[("meta", "userinfo"), ("uiprop", "rights")])
            .await?;
        if !info.userinfo.rights.iter().any(|r| r == "bot") {
            return Err(WikiError::MissingBotRight);
        }

        info!(user = %credentials.username, api = %credentials.api_url, "logged in to wiki");
        Ok(wiki)
    }

    async fn token(&self, kind: &str) -> Result<String, WikiError> {
        let tokens: TokensQuery = self.query(&[("meta", "tokens"), ("type", kind)]).await?;
        let token = match kind {
            "login" => tokens.tokens.logintoken,
            _ => tokens.tokens.csrftoken,
        };
        token.ok_or_else(|| WikiError::Login(format!("no {kind} token returned")))
    }

    async fn query<T: DeserializeOwned>(&self, params: &[(&str, &str)]) -> Result<T, WikiError> {
        let (query, _) = self.query_page::<T>(params).await?;
        Ok(query)
    }

    async fn query_page<T: DeserializeOwned>(
        &self,
        params: &[(&str, &str)],
    ) -> Result<(T, Continuation), WikiError> {
        let mut full = vec![("action", "query")];
        full.extend_from_slice(params);
        let envelope: QueryEnvelope<T> = serde_json::from_value(self.get(&full).await?)?;
        let query = match envelope.query {
            Some(query) => query,
            // an empty result set omits the `query` key entirely
            None => serde_json::from_value(JsonValue::Object(Default::default()))?,
        };
        Ok((query, envelope.continuation.unwrap_or_default()))
    }

    async fn get(&self, params: &[(&str, &str)]) -> Result<JsonValue, WikiError> {
        let resp = self
            .client
            .get(&self.api_url)
            .query(&[("format", "json"), ("formatversion", "2")])
            .query(params)
            .send()
            .await?;
        decode_api_response(resp).await
    }

    async fn post(&self, params: &[(&str, &str)]) -> Result<JsonValue, WikiError> {
        let mut form = vec![("format", "json"), ("formatversion", "2")];
        form.extend_from_slice(params);
        let resp = self.client.post(&self.api_url).form(&form).send().await?;
        decode_api_response(resp).await
    }
}

async fn decode_api_response(resp: reqwest::Response) -> Result<JsonValue, WikiError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(WikiError::Status(status.as_u16()));
    }
    let payload: JsonValue = resp.json().await?;
    if let Some(error) = payload.get("error") {
        let field = |key: &str| {
            error
                .get(key)
                .and_then(JsonValue::as_str)
                .unwrap_or("unknown")
                .to_string()
        };
        return Err(WikiError::Api {
            code: field("code"),
            info: field("info"),
        });
    }
    Ok(payload)
}

/// MediaWiki stores category names with an upper-cased first letter.
pub fn category_search_prefix(prefix: &str) -> String {
    let mut chars = prefix.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn with_category_namespace(category: &str) -> String {
    if category.to_lowercase().starts_with("category:") {
        category.to_string()
    } else {
        format!("Category:{category}")
    }
}

#[async_trait]
impl WikiApi for MediaWikiClient {
    async fn categories_with_prefix(&self, prefix: &str) -> Result<Vec<String>, WikiError> {
        if prefix.is_empty() {
            return Err(WikiError::EmptyArgument("prefix"));
        }
        let search = category_search_prefix(prefix);

        let mut titles = Vec::new();
        let mut next: Option<String> = None;
        loop {
            let mut params = vec![
                ("list", "allcategories"),
                ("acprefix", search.as_str()),
                ("aclimit", "max"),
            ];
            if let Some(token) = next.as_deref() {
                params.push(("accontinue", token));
            }
            let (page, cont) = self.query_page::<AllCategoriesQuery>(&params).await?;
            titles.extend(
                page.allcategories
                    .into_iter()
                    .filter(|row| !row.category.is_empty())
                    .map(|row| format!("Category:{}", row.category)),
            );
            match cont.accontinue {
                Some(token) => next = Some(token),
                None => break,
            }
        }
        debug!(count = titles.len(), prefix, "listed categories");
        Ok(titles)
    }

    async fn category_members(&self, category: &str) -> Result<Vec<String>, WikiError> {
        if category.is_empty() {
            return Err(WikiError::EmptyArgument("category"));
        }
        let category = with_category_namespace(category);

        let mut titles = Vec::new();
        let mut next: Option<String> = None;
        loop {
            let mut params = vec![
                ("list", "categorymembers"),
                ("cmtitle", category.as_str()),
                ("cmlimit", "max"),
            ];
            if let Some(token) = next.as_deref() {
                params.push(("cmcontinue", token));
            }
            let (page, cont) = self.query_page::<CategoryMembersQuery>(&params).await?;
            titles.extend(
                page.categorymembers
                    .into_iter()
                    .map(|row| row.title)
                    .filter(|title| !title.is_empty()),
            );
            match cont.cmcontinue {
                Some(token) => next = Some(token),
                None => break,
            }
        }
        Ok(titles)
    }

    async fn page_exists(&self, title: &str) -> Result<bool, WikiError> {
        let pages: PagesQuery = self.query(&[("prop", "info"), ("titles", title)]).await?;
        Ok(pages
            .pages
            .first()
            .is_some_and(|page| !page.missing && !page.invalid))
    }

    async fn page_content(&self, title: &str) -> Result<Option<String>, WikiError> {
        let pages: PagesQuery = self
            .query(&[
                ("prop", "revisions"),
                ("titles", title),
                ("rvprop", "content"),
                ("rvslots", "main"),
            ])
            .await?;
        let Some(page) = pages.pages.into_iter().next() else {
            return Ok(None);
        };
        if page.missing || page.invalid {
            return Ok(None);
        }
        Ok(page
            .revisions
            .into_iter()
            .next()
            .map(|rev| rev.slots.main.content))
    }

    async fn push(&self, title: &str, content: &str, summary: &str) -> Result<(), WikiError> {
        self.throttle.wait().await;
        debug!(title, summary, "pushing page");

        let token = self.token("csrf").await?;
        let response: EditResponse = serde_json::from_value(
            self.post(&[
                ("action", "edit"),
                ("title", title),
                ("text", content),
                ("summary", summary),
                ("bot", "true"),
                ("token", token.as_str()),
            ])
            .await?,
        )?;
        if response.edit.result != "Success" {
            return Err(WikiError::EditRejected {
                title: title.to_string(),
                result: response.edit.result,
            });
        }

        info!(title, "pushed page");
        Ok(())
    }

    async fn purge_pages(&self, titles: &[String]) -> Result<(), WikiError> {
        if titles.is_empty() {
            return Ok(());
        }
        let joined = titles.join("|");
        self.post(&[("action", "purge"), ("titles", joined.as_str())])
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleStatus {
    Created,
    Updated { from: Option<String> },
    UpToDate,
}

/// Keeps a page whose first line is `-- <version>` at `version`.
pub async fn ensure_versioned_page(
    wiki: &dyn WikiApi,
    title: &str,
    version: &str,
    content: &str,
) -> Result<ModuleStatus, WikiError> {
    let Some(existing) = wiki.page_content(title).await? else {
        info!(title, version, "module page not found, creating");
        wiki.push(title, content, &format!("Initializing Roapid module, version {version}"))
            .await?;
        return Ok(ModuleStatus::Created);
    };

    let first_line = existing.lines().next().unwrap_or_default();
    let Some(existing_version) = first_line.strip_prefix("-- ").map(str::trim) else {
        warn!(title, version, "module page has no version comment, overwriting");
        wiki.push(title, content, &format!("Updating Roapid module to version {version}"))
            .await?;
        return Ok(ModuleStatus::Updated { from: None });
    };

    if existing_version == version {
        info!(title, version, "module page is up to date");
        return Ok(ModuleStatus::UpToDate);
    }

    info!(title, from = existing_version, to = version, "updating module page");
    wiki.push(
        title,
        content,
        &format!("Updating Roapid module from {existing_version} to {version}"),
    )
    .await?;
    Ok(ModuleStatus::Updated {
        from: Some(existing_version.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct PageWiki {
        pages: StdMutex<HashMap<String, String>>,
        pushes: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl WikiApi for PageWiki {
        async fn categories_with_prefix(&self, _prefix: &str) -> Result<Vec<String>, WikiError> {
            Ok(Vec::new())
        }

        async fn category_members(&self, _category: &str) -> Result<Vec<String>, WikiError> {
            Ok(vec!["A".into(), "B".into()])
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
            self.pushes
                .lock()
                .unwrap()
                .push(("purge".to_string(), titles.join("|")));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_spaces_writes_by_one_second() {
        let throttle = EditThrottle::default();
        let started = Instant::now();
        throttle.wait().await;
        throttle.wait().await;
        throttle.wait().await;
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_does_not_delay_spaced_writes() {
        let throttle = EditThrottle::default();
        throttle.wait().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        let before = Instant::now();
        throttle.wait().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[test]
    fn search_prefix_capitalizes_first_letter() {
        assert_eq!(category_search_prefix("roapid"), "Roapid");
        assert_eq!(category_search_prefix("Roapid"), "Roapid");
        assert_eq!(category_search_prefix(""), "");
    }

    #[test]
    fn category_namespace_is_added_once() {
        assert_eq!(with_category_namespace("Foo"), "Category:Foo");
        assert_eq!(with_category_namespace("category:Foo"), "category:Foo");
    }

    #[test]
    fn empty_query_payload_decodes_as_default() {
        let envelope: QueryEnvelope<AllCategoriesQuery> =
            serde_json::from_str(r#"{"batchcomplete":true}"#).unwrap();
        assert!(envelope.query.is_none());
        let rows: AllCategoriesQuery = serde_json::from_str("{}").unwrap();
        assert!(rows.allcategories.is_empty());

        let pages: PagesQuery =
            serde_json::from_str(r#"{"pages":[{"title":"X","missing":true}]}"#).unwrap();
        assert!(pages.pages[0].missing);
    }

    #[tokio::test]
    async fn purge_category_members_purges_listed_pages() {
        let wiki = PageWiki::default();
        wiki.purge_category_members("Category:roapid-badges-1")
            .await
            .unwrap();
        assert_eq!(
            wiki.pushes.lock().unwrap().as_slice(),
            &[("purge".to_string(), "A|B".to_string())]
        );
    }

    #[tokio::test]
    async fn versioned_page_lifecycle() {
        let wiki = PageWiki::default();
        let v1 = "-- 0.0.1\nreturn {}";
        let v2 = "-- 0.0.2\nreturn {}";

        let status = ensure_versioned_page(&wiki, "Module:Roapid", "0.0.1", v1).await.unwrap();
        assert_eq!(status, ModuleStatus::Created);

        let status = ensure_versioned_page(&wiki, "Module:Roapid", "0.0.1", v1).await.unwrap();
        assert_eq!(status, ModuleStatus::UpToDate);

        let status = ensure_versioned_page(&wiki, "Module:Roapid", "0.0.2", v2).await.unwrap();
        assert_eq!(
            status,
            ModuleStatus::Updated {
                from: Some("0.0.1".into())
            }
        );

        wiki.push("Module:Roapid", "return {}", "manual").await.unwrap();
        let status = ensure_versioned_page(&wiki, "Module:Roapid", "0.0.2", v2).await.unwrap();
        assert_eq!(status, ModuleStatus::Updated { from: None });
        assert_eq!(wiki.pushes.lock().unwrap().len(), 4);
    }
}
