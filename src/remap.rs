//! Temp → confirmed event-identifier propagation across the stores.
//!
//! When the server confirms an event created offline, every store that might
//! hold rows under the temporary identifier is rewritten: the in-memory
//! index, the snapshot (only if one exists on disk), and the month shards.
//! The operation log is deliberately left alone — its entries are replayed
//! against post-remap state at compaction time.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::engine::SyncEngine;
use crate::error::VaultResult;
use crate::month::MonthKey;
use crate::schema::{EventInstance, occurrence_key};

/// Rewrite one row if it references `old_id`, either as its event id or in
/// the temp-id field left behind by an earlier substitution.
fn rewrite_instance(row: &mut EventInstance, old_id: &str, new_id: &str) -> bool {
    let matches = row.event_id == old_id || row.temp_event_id.as_deref() == Some(old_id);
    if !matches {
        return false;
    }
    row.event_id = new_id.to_string();
    row.temp_event_id = None;
    row.occurrence_key = Some(occurrence_key(new_id, row.start_at));
    true
}

impl SyncEngine {
    /// Propagate an event-identifier substitution everywhere it matters.
    ///
    /// Shard rewrites are driven by the months where `new_id` appears in the
    /// in-memory index after the rewrite. A shard file for a month absent
    /// from the index is not touched here; it converges the next time that
    /// month is refreshed from a sync.
    pub async fn remap_event_id(&self, old_id: &str, new_id: &str) -> VaultResult<()> {
        let mut rows = self.index.rows();
        let mut index_changed = false;
        for row in &mut rows {
            index_changed |= rewrite_instance(row, old_id, new_id);
        }
        if index_changed {
            self.index.replace_all(rows.clone());
        }

        // Never create a snapshot just to record a remap.
        if self.snapshot.exists().await {
            let mut schema = self.snapshot.load().await;
            let mut snapshot_changed = false;
            for row in &mut schema.instances {
                snapshot_changed |= rewrite_instance(row, old_id, new_id);
            }
            if snapshot_changed {
                self.snapshot.save(&schema).await?;
            }
        }

        let months: BTreeSet<MonthKey> = rows
            .iter()
            .filter(|row| row.event_id == new_id)
            .map(|row| MonthKey::from_datetime(&row.start_at))
            .collect();
        for key in months {
            self.shards.load_month(key).await?;
            let mut shard_rows = self.shards.cached_rows(key).unwrap_or_default();
            let mut shard_changed = false;
            for row in &mut shard_rows {
                shard_changed |= rewrite_instance(row, old_id, new_id);
            }
            if shard_changed {
                debug!(month = %key, old_id, new_id, "rewrote shard for remapped event");
                self.shards.upsert_month(key, shard_rows).await?;
            }
        }

        info!(old_id, new_id, "propagated event identifier remap");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::schema::LocalStoreSchema;
    use crate::testutil::{instance, march};

    async fn engine_at(dir: &std::path::Path) -> SyncEngine {
        let config = StoreConfig {
            data_dir: dir.to_path_buf(),
            ..StoreConfig::default()
        };
        SyncEngine::open(config).await.unwrap()
    }

    #[tokio::test]
    async fn remap_rewrites_index_snapshot_and_shards() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_at(dir.path()).await;
        let key = MonthKey::new(2026, 3).unwrap();

        let by_event_id = instance("i1", "tmp_a", march(14, 9));
        let mut by_temp_field = instance("i2", "evt-other", march(15, 9));
        by_temp_field.temp_event_id = Some("tmp_a".into());
        let untouched = instance("i3", "evt3", march(16, 9));
        let rows = vec![by_event_id, by_temp_field, untouched];

        let schema = LocalStoreSchema {
            instances: rows.clone(),
            ..LocalStoreSchema::empty()
        };
        engine.snapshot.save(&schema).await.unwrap();
        engine.shards.upsert_month(key, rows.clone()).await.unwrap();
        engine.index.replace_all(rows);

        engine.remap_event_id("tmp_a", "EVT1").await.unwrap();

        let index = engine.index().rows();
        assert_eq!(index[0].event_id, "EVT1");
        assert_eq!(
            index[0].occurrence_key.as_deref(),
            Some(occurrence_key("EVT1", march(14, 9)).as_str())
        );
        assert_eq!(index[1].event_id, "EVT1");
        assert_eq!(index[1].temp_event_id, None);
        assert_eq!(index[2].event_id, "evt3");

        let snapshot = engine.snapshot.load().await;
        assert_eq!(snapshot.instances[0].event_id, "EVT1");
        assert_eq!(snapshot.instances[1].event_id, "EVT1");

        let shard = engine.shards.cached_rows(key).unwrap();
        assert_eq!(shard[0].event_id, "EVT1");
        assert_eq!(shard[1].event_id, "EVT1");
        assert_eq!(shard[2].event_id, "evt3");
    }

    #[tokio::test]
    async fn remap_never_creates_a_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_at(dir.path()).await;
        engine
            .index
            .replace_all(vec![instance("i1", "tmp_a", march(14, 9))]);

        engine.remap_event_id("tmp_a", "EVT1").await.unwrap();

        assert!(!engine.snapshot.exists().await);
        assert_eq!(engine.index().rows()[0].event_id, "EVT1");
    }

    #[tokio::test]
    async fn remap_touches_every_month_the_event_spans() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_at(dir.path()).await;
        let march_key = MonthKey::new(2026, 3).unwrap();
        let april_key = MonthKey::new(2026, 4).unwrap();
        let april = chrono::TimeZone::with_ymd_and_hms(&chrono::Utc, 2026, 4, 2, 9, 0, 0).unwrap();

        let rows = vec![
            instance("i1", "tmp_a", march(30, 9)),
            instance("i2", "tmp_a", april),
        ];
        engine
            .shards
            .upsert_month(march_key, vec![rows[0].clone()])
            .await
            .unwrap();
        engine
            .shards
            .upsert_month(april_key, vec![rows[1].clone()])
            .await
            .unwrap();
        engine.index.replace_all(rows);

        engine.remap_event_id("tmp_a", "EVT1").await.unwrap();

        assert_eq!(
            engine.shards.cached_rows(march_key).unwrap()[0].event_id,
            "EVT1"
        );
        assert_eq!(
            engine.shards.cached_rows(april_key).unwrap()[0].event_id,
            "EVT1"
        );
    }

    #[tokio::test]
    async fn remap_leaves_the_operation_log_alone() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_at(dir.path()).await;

        let row = instance("i1", "tmp_a", march(14, 9));
        engine.record_local_upsert(row).await.unwrap();
        let before = engine.oplog.read_all().await.unwrap();

        engine.remap_event_id("tmp_a", "EVT1").await.unwrap();

        // Log entries still carry the temporary id; only the stores changed.
        assert_eq!(engine.oplog.read_all().await.unwrap(), before);
        assert_eq!(engine.index().rows()[0].event_id, "EVT1");
    }

    #[tokio::test]
    async fn shard_for_month_missing_from_index_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_at(dir.path()).await;
        let key = MonthKey::new(2026, 3).unwrap();

        // On disk only; the index knows nothing about this month.
        engine
            .shards
            .upsert_month(key, vec![instance("i1", "tmp_a", march(14, 9))])
            .await
            .unwrap();
        let fresh = engine_at(dir.path()).await;

        fresh.remap_event_id("tmp_a", "EVT1").await.unwrap();

        fresh.shards.load_month(key).await.unwrap();
        assert_eq!(fresh.shards.cached_rows(key).unwrap()[0].event_id, "tmp_a");
    }
}
