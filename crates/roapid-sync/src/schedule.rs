//! In-memory schedule: one entry per category label, guarded by a single lock.
//!
//! MediaWiki capitalizes the first letter of category names, so the label listed by the
//! wiki and the label rendered from an artifact file can differ for the same job. Each
//! job keeps the label it was first scheduled under, and in-flight claims are held per
//! job rather than per label.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use roapid_core::{advance, JobId, JobState, ScheduleEntry};

use crate::config::FALLBACK_INTERVAL;

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, ScheduleEntry>,
    labels: HashMap<JobId, String>,
    running: HashSet<JobId>,
}

/// Category label -> schedule entry. The lock is only held for map access, never across I/O.
#[derive(Debug, Default)]
pub struct ScheduleStore {
    inner: Mutex<Inner>,
}

impl ScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<ScheduleEntry> {
        self.lock().entries.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    /// Label the job is scheduled under, whatever casing it was listed with.
    pub fn label_for(&self, job: &JobId) -> Option<String> {
        self.lock().labels.get(job).cloned()
    }

    pub fn contains_job(&self, job: &JobId) -> bool {
        self.lock().labels.contains_key(job)
    }

    pub fn state(&self, key: &str, now: DateTime<Utc>) -> JobState {
        JobState::of(self.lock().entries.get(key), now)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every entry, ordered by key, for iteration without the lock.
    pub fn snapshot_all(&self) -> BTreeMap<String, ScheduleEntry> {
        self.lock()
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn upsert(
        &self,
        key: &str,
        job: &JobId,
        explicit_next: Option<DateTime<Utc>>,
        resolve_interval: impl FnOnce(&str) -> Duration,
    ) -> ScheduleEntry {
        self.upsert_at(Utc::now(), key, job, explicit_next, resolve_interval)
    }

    /// Creates or updates the entry for `key`.
    ///
    /// An existing positive interval is kept; otherwise `resolve_interval` supplies one
    /// (zero becomes one minute). `next_run` is `explicit_next` or `now + interval`, and
    /// never moves earlier than the entry's current `next_run`. The first label seen for
    /// `job` becomes the one [`label_for`](Self::label_for) returns.
    pub fn upsert_at(
        &self,
        now: DateTime<Utc>,
        key: &str,
        job: &JobId,
        explicit_next: Option<DateTime<Utc>>,
        resolve_interval: impl FnOnce(&str) -> Duration,
    ) -> ScheduleEntry {
        let mut inner = self.lock();
        let existing = inner.entries.get(key);

        let interval = match existing.map(|e| e.interval) {
            Some(interval) if !interval.is_zero() => interval,
            _ => Some(resolve_interval(&job.endpoint_type))
                .filter(|i| !i.is_zero())
                .unwrap_or(FALLBACK_INTERVAL),
        };

        let mut next_run = explicit_next.unwrap_or_else(|| advance(now, interval));
        if let Some(existing) = existing {
            next_run = next_run.max(existing.next_run);
        }

        let entry = ScheduleEntry {
            endpoint_type: job.endpoint_type.clone(),
            interval,
            next_run,
        };
        inner.entries.insert(key.to_string(), entry.clone());
        inner
            .labels
            .entry(job.clone())
            .or_insert_with(|| key.to_string());
        entry
    }

    /// Marks `job` as executing. Returns `None` when another task already holds it,
    /// under any label.
    pub fn try_claim(self: &Arc<Self>, job: &JobId) -> Option<RunGuard> {
        if !self.lock().running.insert(job.clone()) {
            return None;
        }
        Some(RunGuard {
            store: Arc::clone(self),
            job: job.clone(),
        })
    }

    pub fn is_running(&self, job: &JobId) -> bool {
        self.lock().running.contains(job)
    }
}

/// Releases the in-flight claim on drop.
#[derive(Debug)]
pub struct RunGuard {
    store: Arc<ScheduleStore>,
    job: JobId,
}

impl RunGuard {
    pub fn job(&self) -> &JobId {
        &self.job
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.store.lock().running.remove(&self.job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const KEY: &str = "Category:roapid-badges-123";

    fn badge() -> JobId {
        JobId::new("badges", "123")
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_800_000_000 + secs, 0).single().unwrap()
    }

    fn five_minutes(_: &str) -> Duration {
        Duration::from_secs(300)
    }

    #[test]
    fn upsert_twice_advances_with_same_interval() {
        let store = ScheduleStore::new();
        let first = store.upsert_at(t(0), KEY, &badge(), None, five_minutes);
        let second = store.upsert_at(t(10), KEY, &badge(), None, five_minutes);

        assert!(second.next_run > first.next_run);
        assert_eq!(first.interval, second.interval);
        assert_eq!(second.next_run, t(310));
    }

    #[test]
    fn established_interval_is_sticky() {
        let store = ScheduleStore::new();
        store.upsert_at(t(0), KEY, &badge(), None, five_minutes);
        let entry = store.upsert_at(t(400), KEY, &badge(), None, |_| Duration::from_secs(5));
        assert_eq!(entry.interval, Duration::from_secs(300));
        assert_eq!(entry.next_run, t(700));
    }

    #[test]
    fn zero_interval_is_never_scheduled() {
        let store = ScheduleStore::new();
        let entry = store.upsert_at(t(0), KEY, &badge(), None, |_| Duration::ZERO);
        assert_eq!(entry.interval, FALLBACK_INTERVAL);
        assert_eq!(entry.next_run, t(60));
    }

    #[test]
    fn resolver_sees_endpoint_type() {
        let store = ScheduleStore::new();
        let entry = store.upsert_at(t(0), "Category:roapid-users-1", &JobId::new("users", "1"), None, |ty| {
            assert_eq!(ty, "users");
            Duration::from_secs(42)
        });
        assert_eq!(entry.interval, Duration::from_secs(42));
    }

    #[test]
    fn explicit_next_run_is_used_verbatim_for_new_entries() {
        let store = ScheduleStore::new();
        let entry = store.upsert_at(t(100), KEY, &badge(), Some(t(100)), five_minutes);
        assert_eq!(entry.next_run, t(100));
        assert_eq!(store.state(KEY, t(100)), JobState::Due);
    }

    #[test]
    fn next_run_never_rewinds() {
        let store = ScheduleStore::new();
        store.upsert_at(t(0), KEY, &badge(), None, five_minutes);
        let entry = store.upsert_at(t(0), KEY, &badge(), Some(t(-1000)), five_minutes);
        assert_eq!(entry.next_run, t(300));
    }

    #[test]
    fn snapshot_is_detached_from_store() {
        let store = ScheduleStore::new();
        store.upsert_at(t(0), KEY, &badge(), None, five_minutes);
        let snapshot = store.snapshot_all();
        store.upsert_at(
            t(0),
            "Category:roapid-groups-9",
            &JobId::new("groups", "9"),
            None,
            five_minutes,
        );

        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.state("Category:roapid-users-404", t(0)), JobState::Unknown);
    }

    #[test]
    fn claims_are_exclusive_until_dropped() {
        let store = Arc::new(ScheduleStore::new());
        let guard = store.try_claim(&badge()).unwrap();
        assert_eq!(guard.job(), &badge());
        assert!(store.is_running(&badge()));
        assert!(store.try_claim(&badge()).is_none());

        drop(guard);
        assert!(!store.is_running(&badge()));
        assert!(store.try_claim(&badge()).is_some());
    }

    #[test]
    fn job_keeps_its_first_label() {
        let store = ScheduleStore::new();
        store.upsert_at(t(0), KEY, &badge(), Some(t(0)), five_minutes);
        store.upsert_at(t(0), "Category:Roapid-badges-123", &badge(), None, five_minutes);

        assert_eq!(store.label_for(&badge()).as_deref(), Some(KEY));
        assert!(store.contains_job(&badge()));
        assert!(!store.contains_job(&JobId::new("badges", "124")));
    }

    #[test]
    fn concurrent_upserts_keep_one_entry_per_key() {
        let store = Arc::new(ScheduleStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        store.upsert_at(t(i * 50 + j), KEY, &badge(), None, five_minutes);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let entry = store.get(KEY).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(entry.next_run, t(399 + 300));
    }
}
