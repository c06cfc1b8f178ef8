//! In-memory + on-disk partitioning of event instances by calendar month.
//!
//! The cache object privately owns both the month map and the pending-load
//! registry; nothing outside this module mutates either. Each month lives in
//! `months/YYYY-MM.json` and moves through `absent → loading → cached` — there
//! is no eviction for the dataset sizes the engine targets.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::NaiveDate;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{VaultError, VaultResult};
use crate::month::{MonthKey, day_bounds_local, overlaps_day};
use crate::schema::EventInstance;

const MONTHS_DIR: &str = "months";

pub struct MonthShardCache {
    dir: PathBuf,
    state: Mutex<CacheState>,
    #[cfg(test)]
    disk_reads: std::sync::atomic::AtomicUsize,
}

#[derive(Default)]
struct CacheState {
    months: HashMap<MonthKey, Vec<EventInstance>>,
    /// One receiver per in-flight load, removed when the load settles so a
    /// failed load can be retried.
    pending: HashMap<MonthKey, watch::Receiver<()>>,
}

enum LoadRole {
    AlreadyCached,
    Leader(watch::Sender<()>),
    Follower(watch::Receiver<()>),
}

/// Clears a pending-registry entry on drop, so the entry is removed even when
/// the leader's future is dropped at its read await and never settles.
struct ClearPending<'a> {
    cache: &'a MonthShardCache,
    key: MonthKey,
}

impl Drop for ClearPending<'_> {
    fn drop(&mut self) {
        self.cache.lock_state().pending.remove(&self.key);
    }
}

impl MonthShardCache {
    pub fn new(root: &Path) -> Self {
        MonthShardCache {
            dir: root.join(MONTHS_DIR),
            state: Mutex::new(CacheState::default()),
            #[cfg(test)]
            disk_reads: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn month_path(&self, key: MonthKey) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Load one month into the cache. Idempotent: a cached month is a no-op,
    /// and concurrent callers for the same key observe exactly one underlying
    /// disk read via the pending registry.
    pub async fn load_month(&self, key: MonthKey) -> VaultResult<()> {
        loop {
            let role = {
                let mut state = self.lock_state();
                if state.months.contains_key(&key) {
                    LoadRole::AlreadyCached
                } else if let Some(rx) = state.pending.get(&key) {
                    LoadRole::Follower(rx.clone())
                } else {
                    let (tx, rx) = watch::channel(());
                    state.pending.insert(key, rx);
                    LoadRole::Leader(tx)
                }
            };

            match role {
                LoadRole::AlreadyCached => return Ok(()),
                LoadRole::Leader(tx) => {
                    let guard = ClearPending { cache: self, key };
                    let result = self.read_month_file(key).await;
                    let outcome = match result {
                        Ok(rows) => {
                            self.lock_state().months.insert(key, rows);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    };
                    drop(guard);
                    let _ = tx.send(());
                    return outcome;
                }
                LoadRole::Follower(mut rx) => {
                    // Wakes on completion or sender drop; either way loop and
                    // re-check. An entry whose sender is gone belongs to a
                    // leader that never settled; evict it so the next pass
                    // can lead instead of waiting on a closed channel.
                    if rx.changed().await.is_err() {
                        let mut state = self.lock_state();
                        if let Some(pending) = state.pending.get(&key)
                            && pending.has_changed().is_err()
                        {
                            state.pending.remove(&key);
                        }
                    }
                }
            }
        }
    }

    /// Load a set of months concurrently.
    pub async fn ensure_months(self: &Arc<Self>, keys: &[MonthKey]) -> VaultResult<()> {
        let mut unique: Vec<MonthKey> = Vec::new();
        for key in keys {
            if !unique.contains(key) {
                unique.push(*key);
            }
        }

        let mut set = JoinSet::new();
        for key in unique {
            let cache = Arc::clone(self);
            set.spawn(async move { cache.load_month(key).await });
        }
        // Drain every task before reporting: returning on the first failure
        // would drop the set and abort the in-flight loads.
        let mut first_err: Option<VaultError> = None;
        while let Some(joined) = set.join_next().await {
            let result = joined
                .map_err(|e| VaultError::Task(e.to_string()))
                .and_then(|r| r);
            if let Err(e) = result
                && first_err.is_none()
            {
                first_err = Some(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Warm `span` months on either side of `center`. A performance
    /// optimization, not a correctness requirement.
    pub async fn prefetch_range(self: &Arc<Self>, center: MonthKey, span: u32) -> VaultResult<()> {
        self.ensure_months(&center.range(span)).await
    }

    /// Synchronous read over whatever is currently cached for the date's
    /// month — never triggers a load; callers ensure the month first.
    pub fn get_instances_for_date(&self, date: NaiveDate) -> Vec<EventInstance> {
        let (day_start, day_end) = day_bounds_local(date);
        let key = MonthKey::from_date(date);
        let state = self.lock_state();
        state.months.get(&key).map_or_else(Vec::new, |rows| {
            rows.iter()
                .filter(|row| overlaps_day(row, day_start, day_end))
                .cloned()
                .collect()
        })
    }

    /// Replace one month's entire content, on disk (temp file + rename) and
    /// in memory (whole-map entry replacement). A full replace, not a merge:
    /// callers have already computed the final row set.
    pub async fn upsert_month(&self, key: MonthKey, rows: Vec<EventInstance>) -> VaultResult<()> {
        let contents = serde_json::to_string_pretty(&rows)
            .map_err(|e| VaultError::Serialization(e.to_string()))?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let temp = self.dir.join(format!("{key}.json.tmp"));
        tokio::fs::write(&temp, contents).await?;
        tokio::fs::rename(&temp, self.month_path(key)).await?;

        self.lock_state().months.insert(key, rows);
        Ok(())
    }

    /// Months currently cached in memory, sorted.
    pub fn cached_months(&self) -> Vec<MonthKey> {
        let mut keys: Vec<MonthKey> = self.lock_state().months.keys().copied().collect();
        keys.sort();
        keys
    }

    /// A copy of one cached month's rows, if that month is cached.
    pub fn cached_rows(&self, key: MonthKey) -> Option<Vec<EventInstance>> {
        self.lock_state().months.get(&key).cloned()
    }

    /// Month keys that have a shard file on disk, sorted. Used by compaction
    /// to apply dateless deletes globally.
    pub async fn months_on_disk(&self) -> VaultResult<Vec<MonthKey>> {
        let mut keys = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".json")
                && let Ok(key) = stem.parse::<MonthKey>()
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn read_month_file(&self, key: MonthKey) -> VaultResult<Vec<EventInstance>> {
        #[cfg(test)]
        self.disk_reads
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        let path = self.month_path(key);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(%key, "no shard file, initializing empty month");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str(&text) {
            Ok(rows) => Ok(rows),
            Err(e) => {
                warn!(%key, error = %e, "month shard unparsable, treating as empty");
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{instance, march};
    use chrono::Duration;
    use std::sync::atomic::Ordering;

    fn key() -> MonthKey {
        MonthKey::new(2026, 3).unwrap()
    }

    #[tokio::test]
    async fn missing_month_initializes_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MonthShardCache::new(dir.path());
        cache.load_month(key()).await.unwrap();
        assert_eq!(cache.cached_rows(key()), Some(vec![]));
    }

    #[tokio::test]
    async fn upsert_month_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![instance("i1", "evt1", march(14, 9))];

        let cache = MonthShardCache::new(dir.path());
        cache.upsert_month(key(), rows.clone()).await.unwrap();

        // Fresh cache over the same directory must read the same rows back.
        let reloaded = MonthShardCache::new(dir.path());
        reloaded.load_month(key()).await.unwrap();
        assert_eq!(reloaded.cached_rows(key()), Some(rows));
    }

    #[tokio::test]
    async fn corrupt_shard_file_is_absorbed_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MonthShardCache::new(dir.path());
        tokio::fs::create_dir_all(dir.path().join(MONTHS_DIR))
            .await
            .unwrap();
        tokio::fs::write(cache.month_path(key()), "[ not json")
            .await
            .unwrap();
        cache.load_month(key()).await.unwrap();
        assert_eq!(cache.cached_rows(key()), Some(vec![]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_loads_observe_one_disk_read() {
        let dir = tempfile::tempdir().unwrap();
        let seed = MonthShardCache::new(dir.path());
        seed.upsert_month(key(), vec![instance("i1", "evt1", march(14, 9))])
            .await
            .unwrap();

        let cache = Arc::new(MonthShardCache::new(dir.path()));
        let mut set = JoinSet::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            set.spawn(async move { cache.load_month(key()).await });
        }
        while let Some(joined) = set.join_next().await {
            joined.unwrap().unwrap();
        }

        assert_eq!(cache.disk_reads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.cached_rows(key()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cached_month_is_not_reread() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MonthShardCache::new(dir.path());
        cache.load_month(key()).await.unwrap();
        cache.load_month(key()).await.unwrap();
        assert_eq!(cache.disk_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn aborted_leader_does_not_strand_later_callers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MonthShardCache::new(dir.path()));

        let task = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.load_month(key()).await }
        });
        task.abort();
        let _ = task.await;

        tokio::time::timeout(std::time::Duration::from_secs(2), cache.load_month(key()))
            .await
            .expect("load after a cancelled leader must complete")
            .unwrap();
        assert_eq!(cache.cached_rows(key()), Some(vec![]));
    }

    #[tokio::test]
    async fn closed_pending_entry_is_evicted_not_waited_on() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MonthShardCache::new(dir.path());

        // A registry entry whose sender is gone, as left behind by a load
        // future dropped before it settled.
        {
            let (tx, rx) = watch::channel(());
            cache.lock_state().pending.insert(key(), rx);
            drop(tx);
        }

        tokio::time::timeout(std::time::Duration::from_secs(2), cache.load_month(key()))
            .await
            .expect("stale registry entry must not block loading")
            .unwrap();
        assert_eq!(cache.cached_rows(key()), Some(vec![]));
    }

    #[tokio::test]
    async fn ensure_months_drains_all_loads_when_one_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MonthShardCache::new(dir.path()));

        // A directory squatting on one shard path fails that month's load;
        // its neighbors must still land.
        tokio::fs::create_dir_all(cache.month_path(key()))
            .await
            .unwrap();
        let keys = [key().pred(), key(), key().succ()];
        assert!(cache.ensure_months(&keys).await.is_err());
        assert_eq!(cache.cached_months(), vec![key().pred(), key().succ()]);

        // And the failed month stays retryable.
        tokio::fs::remove_dir(cache.month_path(key())).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), cache.load_month(key()))
            .await
            .expect("failed month must stay loadable")
            .unwrap();
        assert_eq!(cache.cached_rows(key()), Some(vec![]));
    }

    #[tokio::test]
    async fn failed_load_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MonthShardCache::new(dir.path());

        // A directory where the shard file should be forces a read error
        // that is not NotFound.
        tokio::fs::create_dir_all(cache.month_path(key()))
            .await
            .unwrap();
        assert!(cache.load_month(key()).await.is_err());

        tokio::fs::remove_dir(cache.month_path(key())).await.unwrap();
        cache.load_month(key()).await.unwrap();
        assert_eq!(cache.cached_rows(key()), Some(vec![]));
    }

    #[tokio::test]
    async fn ensure_months_loads_all_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MonthShardCache::new(dir.path()));
        let keys = [key().pred(), key(), key().succ(), key()];
        cache.ensure_months(&keys).await.unwrap();
        assert_eq!(cache.cached_months(), vec![key().pred(), key(), key().succ()]);
    }

    #[tokio::test]
    async fn prefetch_range_warms_neighbors() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MonthShardCache::new(dir.path()));
        cache.prefetch_range(key(), 2).await.unwrap();
        assert_eq!(cache.cached_months().len(), 5);
    }

    #[tokio::test]
    async fn date_query_applies_overlap_rule_to_cached_month_only() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MonthShardCache::new(dir.path());
        let date = chrono::NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let (day_start, _) = day_bounds_local(date);

        let mut spillover = instance("ends-at-midnight", "evt1", day_start - Duration::hours(2));
        spillover.end_at = day_start;
        let mut previous = instance("previous-day", "evt2", day_start - Duration::hours(5));
        previous.end_at = day_start - Duration::hours(4);
        let during = instance("during", "evt3", day_start + Duration::hours(10));

        cache
            .upsert_month(key(), vec![spillover, previous, during])
            .await
            .unwrap();

        let hits = cache.get_instances_for_date(date);
        let ids: Vec<&str> = hits.iter().map(|r| r.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["ends-at-midnight", "during"]);

        // Not cached for that month → empty, never a load.
        let far = chrono::NaiveDate::from_ymd_opt(2027, 1, 1).unwrap();
        assert!(cache.get_instances_for_date(far).is_empty());
        assert_eq!(cache.disk_reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn months_on_disk_lists_shard_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MonthShardCache::new(dir.path());
        assert!(cache.months_on_disk().await.unwrap().is_empty());

        cache.upsert_month(key(), vec![]).await.unwrap();
        cache.upsert_month(key().succ(), vec![]).await.unwrap();
        tokio::fs::write(dir.path().join(MONTHS_DIR).join("notes.txt"), "x")
            .await
            .unwrap();

        assert_eq!(cache.months_on_disk().await.unwrap(), vec![key(), key().succ()]);
    }
}
