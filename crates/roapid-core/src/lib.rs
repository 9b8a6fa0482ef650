//! Core job identity model and category label codec for roapid.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "roapid-core";

pub const CATEGORY_NAMESPACE: &str = "Category:";
pub const ARTIFACT_EXTENSION: &str = ".json";

/// Field injected into every persisted artifact and ignored by change detection.
pub const LAST_UPDATED_FIELD: &str = "lastUpdated";

/// Endpoint types whose fetch requires the Open Cloud API key.
pub const AUTHENTICATED_ENDPOINTS: [&str; 4] = ["users", "groups", "universes", "places"];

const PLACES_ENDPOINT: &str = "places";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("invalid category format: {0}")]
    InvalidFormat(String),
    #[error("invalid place identifier {0:?}, expected universeId-placeId")]
    InvalidPlaceId(String),
    #[error("url template {0:?} has no placeholder")]
    InvalidTemplate(String),
}

/// One unit of recurring fetch-and-publish work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId {
    pub endpoint_type: String,
    pub instance_id: String,
}

impl JobId {
    pub fn new(endpoint_type: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            endpoint_type: endpoint_type.into(),
            instance_id: instance_id.into(),
        }
    }

    pub fn requires_api_key(&self) -> bool {
        AUTHENTICATED_ENDPOINTS.contains(&self.endpoint_type.as_str())
    }

    /// `Category:<prefix>-<endpointType>-<instanceID>`
    pub fn category_label(&self, prefix: &str) -> String {
        render_category(self, prefix)
    }

    /// `<endpointType>-<instanceID>.json`, relative to the artifact root.
    pub fn artifact_file_name(&self) -> String {
        format!("{self}{ARTIFACT_EXTENSION}")
    }

    /// Title of the published page under the configured namespace.
    pub fn wiki_title(&self, namespace: &str) -> String {
        format!("{namespace}:roapid/{}", self.artifact_file_name())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.endpoint_type, self.instance_id)
    }
}

/// Trims the label and strips commas plus non-breaking and narrow no-break spaces.
///
/// Unicode dash variants are left untouched; only the ASCII `-` acts as a separator.
pub fn normalize_category(label: &str) -> String {
    label
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '\u{00a0}' | '\u{202f}'))
        .collect()
}

/// Parses `Category:<prefix>-<endpointType>-<instanceID>` into a [`JobId`].
///
/// The `Category:<prefix>-` head is matched case-insensitively, with Unicode case
/// folding. Only the first `-` of the remainder splits type from id, so composite ids
/// like `123-456` survive.
pub fn parse_category(label: &str, prefix: &str) -> Result<JobId, CoreError> {
    let normalized = normalize_category(label);
    let expected = format!("{CATEGORY_NAMESPACE}{prefix}-");
    let invalid = || CoreError::InvalidFormat(label.to_string());

    let remainder = strip_prefix_ignore_case(&normalized, &expected).ok_or_else(invalid)?;
    match remainder.split_once('-') {
        Some((endpoint_type, instance_id))
            if !endpoint_type.is_empty() && !instance_id.is_empty() =>
        {
            Ok(JobId::new(endpoint_type, instance_id))
        }
        _ => Err(invalid()),
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let mut chars = s.chars();
    for expected in prefix.chars() {
        let actual = chars.next()?;
        if !actual.to_lowercase().eq(expected.to_lowercase()) {
            return None;
        }
    }
    Some(chars.as_str())
}

pub fn render_category(job: &JobId, prefix: &str) -> String {
    format!("{CATEGORY_NAMESPACE}{prefix}-{job}")
}

/// Inverse of [`JobId::artifact_file_name`]. Names outside the pattern yield `None`.
pub fn parse_artifact_file_name(name: &str) -> Option<JobId> {
    let base = name.strip_suffix(ARTIFACT_EXTENSION)?;
    let (endpoint_type, instance_id) = base.split_once('-')?;
    if endpoint_type.is_empty() || instance_id.is_empty() {
        return None;
    }
    Some(JobId::new(endpoint_type, instance_id))
}

/// Substitutes the job's instance id into a fetch template.
///
/// Templates carry one `{}` or `%s` placeholder. `places` ids are composite
/// `<universeId>-<placeId>` and expand to `universes/<u>/places/<p>`.
pub fn format_endpoint_url(job: &JobId, template: &str) -> Result<String, CoreError> {
    let arg = if job.endpoint_type == PLACES_ENDPOINT {
        match job.instance_id.split_once('-') {
            Some((universe, place)) if !universe.is_empty() && !place.is_empty() => {
                format!("universes/{universe}/places/{place}")
            }
            _ => return Err(CoreError::InvalidPlaceId(job.instance_id.clone())),
        }
    } else {
        job.instance_id.clone()
    };

    for placeholder in ["{}", "%s"] {
        if template.contains(placeholder) {
            return Ok(template.replacen(placeholder, &arg, 1));
        }
    }
    Err(CoreError::InvalidTemplate(template.to_string()))
}

/// Scheduling state for one category label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub endpoint_type: String,
    pub interval: Duration,
    pub next_run: DateTime<Utc>,
}

impl ScheduleEntry {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_run
    }

    pub fn state(&self, now: DateTime<Utc>) -> JobState {
        if self.is_due(now) {
            JobState::Due
        } else {
            JobState::NotYetDue
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Unknown,
    Due,
    NotYetDue,
}

impl JobState {
    pub fn of(entry: Option<&ScheduleEntry>, now: DateTime<Utc>) -> Self {
        entry.map_or(JobState::Unknown, |e| e.state(now))
    }
}

/// `now + interval`, saturating at the latest representable instant.
pub fn advance(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(interval)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_simple_category() {
        let job = parse_category("Category:roapid-badges-123", "roapid").unwrap();
        assert_eq!(job, JobId::new("badges", "123"));
    }

    #[test]
    fn prefix_match_is_case_insensitive() {
        let job = parse_category("category:ROAPID-users-42", "roapid").unwrap();
        assert_eq!(job, JobId::new("users", "42"));
    }

    #[test]
    fn prefix_match_folds_non_ascii_case() {
        let job = parse_category("Category:Ärger-badges-3", "ärger").unwrap();
        assert_eq!(job, JobId::new("badges", "3"));

        let job = parse_category("Category:ΡΟΑΠΙΔ-users-4", "ροαπιδ").unwrap();
        assert_eq!(job, JobId::new("users", "4"));
    }

    #[test]
    fn composite_ids_split_on_first_separator_only() {
        let job = parse_category("Category:roapid-places-111-222", "roapid").unwrap();
        assert_eq!(job.endpoint_type, "places");
        assert_eq!(job.instance_id, "111-222");
    }

    #[test]
    fn strips_commas_and_narrow_spaces() {
        let job = parse_category("  Category:roapid-badges-1,234\u{a0}5\u{202f}6 ", "roapid").unwrap();
        assert_eq!(job.instance_id, "123456");
    }

    #[test]
    fn unicode_dashes_are_not_separators() {
        let err = parse_category("Category:roapid\u{2013}badges\u{2013}1", "roapid").unwrap_err();
        assert!(matches!(err, CoreError::InvalidFormat(_)));

        let job = parse_category("Category:roapid-badges-1\u{2013}2", "roapid").unwrap();
        assert_eq!(job.instance_id, "1\u{2013}2");
    }

    #[test]
    fn malformed_labels_fail_without_panicking() {
        for label in [
            "",
            "Category:",
            "Category:roapid",
            "Category:roapid-",
            "Category:roapid-badges",
            "Category:roapid-badges-",
            "Category:roapid--123",
            "Category:other-badges-123",
            "Page:roapid-badges-123",
            "Categ\u{00e9}ry:roapid-badges-1",
            "\u{1F600}\u{1F600}\u{1F600}\u{1F600}\u{1F600}",
        ] {
            assert!(
                matches!(parse_category(label, "roapid"), Err(CoreError::InvalidFormat(_))),
                "expected InvalidFormat for {label:?}"
            );
        }
    }

    #[test]
    fn render_then_parse_round_trips() {
        for label in [
            "Category:roapid-badges-123",
            "CATEGORY:Roapid-groups-9,001",
            "Category:roapid-places-1-2",
            "Category:roapid-users-7\u{a0}7",
            "Category:roapid-games-a\u{2212}b",
        ] {
            let job = parse_category(label, "roapid").unwrap();
            let rendered = render_category(&job, "roapid");
            assert_eq!(parse_category(&rendered, "roapid").unwrap(), job);
        }
    }

    #[test]
    fn artifact_file_names_mirror_category_rendering() {
        let job = JobId::new("places", "10-20");
        assert_eq!(job.artifact_file_name(), "places-10-20.json");
        assert_eq!(parse_artifact_file_name("places-10-20.json"), Some(job.clone()));
        assert_eq!(
            parse_category(&job.category_label("roapid"), "roapid").unwrap(),
            job
        );

        assert_eq!(parse_artifact_file_name("about.json"), None);
        assert_eq!(parse_artifact_file_name("badges-.json"), None);
        assert_eq!(parse_artifact_file_name("-1.json"), None);
        assert_eq!(parse_artifact_file_name("badges-1.txt"), None);
    }

    #[test]
    fn wiki_title_uses_namespace() {
        let job = JobId::new("badges", "5");
        assert_eq!(job.wiki_title("Module"), "Module:roapid/badges-5.json");
    }

    #[test]
    fn formats_plain_and_place_urls() {
        let badge = JobId::new("badges", "77");
        assert_eq!(
            format_endpoint_url(&badge, "https://badges.roblox.com/v1/badges/%s").unwrap(),
            "https://badges.roblox.com/v1/badges/77"
        );

        let place = JobId::new("places", "1-2");
        assert_eq!(
            format_endpoint_url(&place, "https://apis.roblox.com/cloud/v2/{}").unwrap(),
            "https://apis.roblox.com/cloud/v2/universes/1/places/2"
        );

        let bad_place = JobId::new("places", "12");
        assert_eq!(
            format_endpoint_url(&bad_place, "https://x/{}"),
            Err(CoreError::InvalidPlaceId("12".into()))
        );
        assert!(matches!(
            format_endpoint_url(&badge, "https://x/static"),
            Err(CoreError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn job_state_follows_next_run() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap();
        let entry = ScheduleEntry {
            endpoint_type: "badges".into(),
            interval: Duration::from_secs(60),
            next_run: t0,
        };
        assert_eq!(JobState::of(None, t0), JobState::Unknown);
        assert_eq!(JobState::of(Some(&entry), t0), JobState::Due);
        assert_eq!(
            JobState::of(Some(&entry), t0 - chrono::Duration::seconds(1)),
            JobState::NotYetDue
        );
    }

    #[test]
    fn advance_saturates() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap();
        assert_eq!(
            advance(t0, Duration::from_secs(90)),
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 1, 30).single().unwrap()
        );
        assert_eq!(advance(t0, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
