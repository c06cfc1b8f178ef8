//! The engine object: one explicit owner of the snapshot store, operation
//! log, month shard cache, and UI-facing index, constructed once per process.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{VaultError, VaultResult};
use crate::index::InstanceIndex;
use crate::merge::{MergeOutcome, SyncStats, merge_diff};
use crate::month::MonthKey;
use crate::oplog::OperationLog;
use crate::schema::{EventInstance, Operation, occurrence_key};
use crate::shards::MonthShardCache;
use crate::snapshot::SnapshotStore;
use crate::sync::DiffSource;

/// How many months on either side of the current one [`bootstrap`] warms.
///
/// [`bootstrap`]: SyncEngine::bootstrap
const BOOTSTRAP_PREFETCH_SPAN: u32 = 1;

pub struct SyncEngine {
    config: StoreConfig,
    pub(crate) snapshot: SnapshotStore,
    pub(crate) oplog: OperationLog,
    pub(crate) shards: Arc<MonthShardCache>,
    pub(crate) index: InstanceIndex,
}

impl SyncEngine {
    pub async fn open(config: StoreConfig) -> VaultResult<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        Ok(SyncEngine {
            snapshot: SnapshotStore::new(&config.data_dir),
            oplog: OperationLog::new(&config.data_dir),
            shards: Arc::new(MonthShardCache::new(&config.data_dir)),
            index: InstanceIndex::default(),
            config,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The UI-facing index this engine pushes into.
    pub fn index(&self) -> &InstanceIndex {
        &self.index
    }

    pub fn shards(&self) -> &Arc<MonthShardCache> {
        &self.shards
    }

    /// Load the last persisted state, seed the in-memory index, and warm the
    /// shards around the current month.
    pub async fn bootstrap(&self) -> VaultResult<()> {
        let schema = self.snapshot.load().await;
        info!(
            instances = schema.instances.len(),
            calendars = schema.calendars.len(),
            "seeded index from snapshot"
        );
        self.index.replace_all(schema.instances);
        self.shards
            .prefetch_range(MonthKey::current(), BOOTSTRAP_PREFETCH_SPAN)
            .await
    }

    /// One incremental sync round: fold uncompacted offline edits into the
    /// snapshot, fetch the diff since its cursor, merge last-write-wins,
    /// persist, refresh touched shards, and push the merged set into the
    /// index.
    ///
    /// A fetch failure aborts the round with the prior snapshot untouched —
    /// the caller stays offline and retries later. A persistence failure
    /// after a successful merge propagates, since silently dropping a merge
    /// would lose data. Callers must not start a second round while one is
    /// in flight; the engine performs no cross-round locking.
    pub async fn run_incremental_sync<S: DiffSource>(&self, source: &S) -> VaultResult<SyncStats> {
        // The shard and index rebuild below works from the merged snapshot
        // alone, so edits still living only in the log must reach the
        // snapshot before the merge or the rebuild would erase them.
        self.oplog.compact(&self.snapshot, &self.shards).await?;

        let current = self.snapshot.load().await;
        let since = current.last_sync_cursor.clone();
        debug!(cursor = since.as_deref().unwrap_or("<full>"), "fetching server diff");

        let diff = source
            .fetch_diff(since.as_deref())
            .await
            .map_err(|e| VaultError::Sync(format!("diff fetch failed: {e}")))?;

        let MergeOutcome {
            mut schema,
            touched_months,
            stats,
        } = merge_diff(current, &diff);
        schema.last_sync_cursor = Some(diff.cursor);
        schema.last_sync_at = Some(Utc::now());

        self.snapshot.save(&schema).await?;

        for key in &touched_months {
            let rows: Vec<EventInstance> = schema
                .instances
                .iter()
                .filter(|row| MonthKey::from_datetime(&row.start_at) == *key)
                .cloned()
                .collect();
            self.shards.upsert_month(*key, rows).await?;
        }

        self.index.replace_all(schema.instances);
        info!(
            upserted = stats.upserted_instances,
            deleted = stats.deleted_instances,
            remapped = stats.remapped_instances,
            months = touched_months.len(),
            "incremental sync complete"
        );
        Ok(stats)
    }

    /// Record an offline edit: append to the operation log and refresh the
    /// touched shard and the index in place.
    pub async fn record_local_upsert(&self, mut row: EventInstance) -> VaultResult<()> {
        if row.occurrence_key.is_none() {
            row.occurrence_key = Some(occurrence_key(&row.event_id, row.start_at));
        }
        let op = Operation::UpsertInstance { row: row.clone() };
        self.oplog.append(std::slice::from_ref(&op)).await?;

        let key = MonthKey::from_datetime(&row.start_at);
        self.shards.load_month(key).await?;
        let mut rows = self.shards.cached_rows(key).unwrap_or_default();
        match rows.iter_mut().find(|r| r.instance_id == row.instance_id) {
            Some(existing) => *existing = row.clone(),
            None => rows.push(row.clone()),
        }
        self.shards.upsert_month(key, rows).await?;

        let mut all = self.index.rows();
        match all.iter_mut().find(|r| r.instance_id == row.instance_id) {
            Some(existing) => *existing = row,
            None => all.push(row),
        }
        self.index.replace_all(all);
        Ok(())
    }

    /// Record an offline delete. The log entry carries no date, so only the
    /// currently cached months are swept here; compaction applies the delete
    /// globally.
    pub async fn record_local_delete(&self, instance_id: &str) -> VaultResult<()> {
        let op = Operation::DeleteInstance {
            instance_id: instance_id.to_string(),
            updated_at: Some(Utc::now()),
        };
        self.oplog.append(std::slice::from_ref(&op)).await?;

        for key in self.shards.cached_months() {
            let Some(rows) = self.shards.cached_rows(key) else {
                continue;
            };
            if rows.iter().any(|r| r.instance_id == instance_id) {
                let rows: Vec<EventInstance> = rows
                    .into_iter()
                    .filter(|r| r.instance_id != instance_id)
                    .collect();
                self.shards.upsert_month(key, rows).await?;
            }
        }

        let mut all = self.index.rows();
        if all.iter().any(|r| r.instance_id == instance_id) {
            all.retain(|r| r.instance_id != instance_id);
            self.index.replace_all(all);
        }
        Ok(())
    }

    /// Fold the operation log into the month shards and snapshot, then
    /// truncate it. All-or-nothing; see [`OperationLog::compact`].
    pub async fn compact_oplog(&self) -> VaultResult<()> {
        self.oplog.compact(&self.snapshot, &self.shards).await
    }
}
