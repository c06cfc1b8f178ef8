//! Append-only operation log (`ops.ndjson`) and its compaction into the
//! month shards and snapshot.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{VaultError, VaultResult};
use crate::month::MonthKey;
use crate::schema::{EventInstance, Operation};
use crate::shards::MonthShardCache;
use crate::snapshot::SnapshotStore;

const OPLOG_FILE: &str = "ops.ndjson";

/// Exclusive owner of the append-only log. Operations are immutable once
/// written; the log only grows until [`compact`] truncates it.
///
/// [`compact`]: OperationLog::compact
pub struct OperationLog {
    path: PathBuf,
}

impl OperationLog {
    pub fn new(dir: &Path) -> Self {
        OperationLog {
            path: dir.join(OPLOG_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a batch, one JSON line per operation. Empty batches are a no-op.
    pub async fn append(&self, ops: &[Operation]) -> VaultResult<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut lines = String::new();
        for op in ops {
            let line =
                serde_json::to_string(op).map_err(|e| VaultError::Serialization(e.to_string()))?;
            lines.push_str(&line);
            lines.push('\n');
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(lines.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read the full log. Lines that fail to parse are skipped with a warning
    /// — a corrupt trailing line must not block replay of prior valid lines.
    pub async fn read_all(&self) -> VaultResult<Vec<Operation>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ops = Vec::new();
        for (number, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Operation>(line) {
                Ok(op) => ops.push(op),
                Err(e) => {
                    warn!(line = number + 1, error = %e, "skipping unparsable oplog line");
                }
            }
        }
        Ok(ops)
    }

    /// Fold the entire log into the month shards it affects and into the
    /// snapshot document, then truncate the log.
    ///
    /// Upserts are bucketed by the month of their `start_at`; deletes carry no
    /// date, so they are applied to every cached or on-disk month. All-or-
    /// nothing per call: any write failure returns before truncation, leaving
    /// the log intact for a future retry (replay is idempotent).
    pub async fn compact(
        &self,
        snapshot: &SnapshotStore,
        shards: &Arc<MonthShardCache>,
    ) -> VaultResult<()> {
        let ops = self.read_all().await?;
        if ops.is_empty() {
            debug!("oplog empty, nothing to compact");
            return Ok(());
        }

        let mut affected: BTreeSet<MonthKey> = BTreeSet::new();
        let mut any_instance_delete = false;
        for op in &ops {
            match op {
                Operation::UpsertInstance { row } => {
                    affected.insert(MonthKey::from_datetime(&row.start_at));
                }
                Operation::DeleteInstance { .. } => any_instance_delete = true,
                Operation::UpsertCalendar { .. } | Operation::DeleteCalendar { .. } => {}
            }
        }
        if any_instance_delete {
            affected.extend(shards.months_on_disk().await?);
            affected.extend(shards.cached_months());
        }

        // Materialize every affected month, then replay the log in order so
        // that a delete followed by an upsert of the same id lands as present.
        let mut months: HashMap<MonthKey, Vec<EventInstance>> = HashMap::new();
        for key in &affected {
            shards.load_month(*key).await?;
            months.insert(*key, shards.cached_rows(*key).unwrap_or_default());
        }

        let mut schema = snapshot.load().await;
        for op in &ops {
            match op {
                Operation::UpsertInstance { row } => {
                    let key = MonthKey::from_datetime(&row.start_at);
                    if let Some(rows) = months.get_mut(&key) {
                        replace_or_push(rows, row);
                    }
                    replace_or_push(&mut schema.instances, row);
                }
                Operation::DeleteInstance { instance_id, .. } => {
                    for rows in months.values_mut() {
                        rows.retain(|r| r.instance_id != *instance_id);
                    }
                    schema.instances.retain(|r| r.instance_id != *instance_id);
                    schema.tombstones.bury_instance(instance_id);
                }
                Operation::UpsertCalendar { row } => {
                    match schema
                        .calendars
                        .iter_mut()
                        .find(|c| c.calendar_id == row.calendar_id)
                    {
                        Some(existing) => *existing = row.clone(),
                        None => schema.calendars.push(row.clone()),
                    }
                }
                Operation::DeleteCalendar { calendar_id, .. } => {
                    schema.calendars.retain(|c| c.calendar_id != *calendar_id);
                    schema.tombstones.bury_calendar(calendar_id);
                }
            }
        }

        for (key, rows) in months {
            shards.upsert_month(key, rows).await?;
        }
        snapshot.save(&schema).await?;

        tokio::fs::write(&self.path, b"").await?;
        info!(ops = ops.len(), months = affected.len(), "oplog compacted");
        Ok(())
    }
}

fn replace_or_push(rows: &mut Vec<EventInstance>, row: &EventInstance) {
    match rows.iter_mut().find(|r| r.instance_id == row.instance_id) {
        Some(existing) => *existing = row.clone(),
        None => rows.push(row.clone()),
    }
}
