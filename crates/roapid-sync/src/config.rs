//! Process settings (environment) and the daemon config file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_QUEUE_NOTE: &str =
    "Publish this page and wait at least a minute for data to be fetched.";
pub const DEFAULT_FIELD_PATH_NOT_FOUND: &str = "Field path not found (%s), [[%s|see fields]].";

/// Used when neither the endpoint nor the global refresh interval is usable.
pub const FALLBACK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("invalid {name} interval {value:?}: {reason}")]
    Interval {
        name: String,
        value: String,
        reason: String,
    },
    #[error("missing required setting {0}")]
    Missing(&'static str),
}

/// Settings read from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub docs_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            config_path: std::env::var("ROAPID_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config/config.json")),
            data_dir: std::env::var("ROAPID_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data")),
            docs_dir: std::env::var("ROAPID_DOCS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config")),
            user_agent: std::env::var("ROAPID_USER_AGENT")
                .unwrap_or_else(|_| roapid_wiki::DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: std::env::var("ROAPID_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileConfig {
    pub server: ServerConfig,
    pub wiki: WikiConfig,
    pub dynamic_endpoints: DynamicEndpointsConfig,
    pub open_cloud: OpenCloudConfig,
    pub lua_messages: LuaMessagesConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub category_check_interval: String,
    pub data_refresh_interval: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WikiConfig {
    pub api_url: String,
    pub username: String,
    pub password: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DynamicEndpointsConfig {
    pub category_prefix: String,
    pub api_map: HashMap<String, String>,
    pub refresh_intervals: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OpenCloudConfig {
    pub api_key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LuaMessagesConfig {
    pub queue_note: String,
    pub field_path_not_found: String,
}

impl FileConfig {
    /// Reads the file, expands `$VAR`/`${VAR}` references, then parses it as
    /// YAML for `.yaml`/`.yml` paths and JSON otherwise.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &expand_env(&raw, |name| std::env::var(name).ok()))
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml")
        );
        let parsed = if is_yaml {
            serde_yaml::from_str(text).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(text).map_err(|e| e.to_string())
        };
        parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Startup validation: both global intervals must parse and the wiki must be addressable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.category_check_interval()?;
        self.data_refresh_interval()?;
        if self.wiki.api_url.trim().is_empty() {
            return Err(ConfigError::Missing("wiki.apiUrl"));
        }
        if self.dynamic_endpoints.category_prefix.trim().is_empty() {
            return Err(ConfigError::Missing("dynamicEndpoints.categoryPrefix"));
        }
        Ok(())
    }

    pub fn category_check_interval(&self) -> Result<Duration, ConfigError> {
        parse_interval("categoryCheckInterval", &self.server.category_check_interval)
    }

    pub fn data_refresh_interval(&self) -> Result<Duration, ConfigError> {
        parse_interval("dataRefreshInterval", &self.server.data_refresh_interval)
    }

    /// Per-endpoint interval, or the global data refresh interval when none is configured.
    pub fn refresh_interval(&self, endpoint_type: &str) -> Result<Duration, ConfigError> {
        match self.dynamic_endpoints.refresh_intervals.get(endpoint_type) {
            Some(raw) if !raw.trim().is_empty() => parse_interval(endpoint_type, raw),
            _ => self.data_refresh_interval(),
        }
    }

    /// Never fails: a bad endpoint interval falls back to the global one, then to a minute.
    pub fn resolve_interval(&self, endpoint_type: &str) -> Duration {
        match self.refresh_interval(endpoint_type) {
            Ok(interval) => interval,
            Err(err) => {
                warn!(endpoint_type, error = %err, "invalid refresh interval, using default");
                self.data_refresh_interval().unwrap_or(FALLBACK_INTERVAL)
            }
        }
    }

    /// Interval for a periodic task, falling back to the data refresh interval.
    pub fn task_interval(&self, name: &str) -> Result<Duration, ConfigError> {
        match self.refresh_interval(name) {
            Ok(interval) => Ok(interval),
            Err(err) => {
                let fallback = self.data_refresh_interval()?;
                warn!(task = name, error = %err, fallback = ?fallback, "invalid task interval");
                Ok(fallback)
            }
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        Some(self.open_cloud.api_key.as_str()).filter(|k| !k.is_empty())
    }

    pub fn queue_note(&self) -> &str {
        non_empty_or(&self.lua_messages.queue_note, DEFAULT_QUEUE_NOTE)
    }

    pub fn field_path_not_found(&self) -> &str {
        non_empty_or(
            &self.lua_messages.field_path_not_found,
            DEFAULT_FIELD_PATH_NOT_FOUND,
        )
    }
}

fn non_empty_or<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() {
        default
    } else {
        value
    }
}

/// Parses a human duration (`30s`, `5m`, `1h 30m`); zero is rejected.
pub fn parse_interval(name: &str, value: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason: String| ConfigError::Interval {
        name: name.to_string(),
        value: value.to_string(),
        reason,
    };
    let interval = humantime::parse_duration(value.trim()).map_err(|e| invalid(e.to_string()))?;
    if interval.is_zero() {
        return Err(invalid("must be positive".to_string()));
    }
    Ok(interval)
}

/// Shell-style `$VAR` / `${VAR}` expansion; unset variables expand to nothing.
pub fn expand_env(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some((_, '{')) => {
                let start = idx + 2;
                match input[start..].find('}') {
                    Some(len) => {
                        let name = &input[start..start + len];
                        out.push_str(&lookup(name).unwrap_or_default());
                        while chars.peek().is_some_and(|(i, _)| *i <= start + len) {
                            chars.next();
                        }
                    }
                    None => out.push(c),
                }
            }
            Some((start, next)) if next == '_' || next.is_ascii_alphabetic() => {
                let mut end = start;
                while let Some((i, ch)) = chars.peek().copied() {
                    if ch == '_' || ch.is_ascii_alphanumeric() {
                        end = i + ch.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&lookup(&input[start..end]).unwrap_or_default());
            }
            _ => out.push(c),
        }
    }
    out
}
