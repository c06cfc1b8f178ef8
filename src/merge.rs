//! Last-write-wins merge of a server diff against the local snapshot.
//!
//! Pure: consumes a schema and a diff, produces the merged schema plus the
//! set of month shards the merge touched. Persistence and index refresh are
//! the engine's job.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::month::MonthKey;
use crate::schema::{Calendar, EventInstance, LocalStoreSchema, occurrence_key};
use crate::sync::{IdEntity, ServerDiff};

/// Counters for one merge round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub upserted_calendars: usize,
    pub upserted_instances: usize,
    pub deleted_calendars: usize,
    pub deleted_instances: usize,
    pub remapped_instances: usize,
}

impl SyncStats {
    pub fn has_changes(&self) -> bool {
        self.upserted_calendars > 0
            || self.upserted_instances > 0
            || self.deleted_calendars > 0
            || self.deleted_instances > 0
            || self.remapped_instances > 0
    }
}

pub struct MergeOutcome {
    pub schema: LocalStoreSchema,
    /// Months whose shard content the merge changed (by the start month of
    /// every inserted, replaced, removed, or remapped row).
    pub touched_months: BTreeSet<MonthKey>,
    pub stats: SyncStats,
}

/// `true` when the incoming timestamp should overwrite the existing one:
/// strictly newer wins, a present timestamp beats an absent one, and with
/// both absent the existing row wins (ties are never overwritten).
fn wins_over(incoming: Option<&DateTime<Utc>>, existing: Option<&DateTime<Utc>>) -> bool {
    match (incoming, existing) {
        (Some(incoming), Some(existing)) => incoming > existing,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Apply one diff: deletes first, then upserts in delivered order, then the
/// id-map pass. Tombstones are extended, never shrunk; the cursor and
/// `last_sync_at` are left for the engine to stamp.
pub fn merge_diff(current: LocalStoreSchema, diff: &ServerDiff) -> MergeOutcome {
    let mut stats = SyncStats::default();
    let mut touched: BTreeSet<MonthKey> = BTreeSet::new();
    let mut tombstones = current.tombstones;

    let mut calendar_order: Vec<String> = Vec::new();
    let mut calendars: HashMap<String, Calendar> = HashMap::new();
    for row in current.calendars {
        if !calendars.contains_key(&row.calendar_id) {
            calendar_order.push(row.calendar_id.clone());
        }
        calendars.insert(row.calendar_id.clone(), row);
    }

    let mut instance_order: Vec<String> = Vec::new();
    let mut instances: HashMap<String, EventInstance> = HashMap::new();
    for row in current.instances {
        if !instances.contains_key(&row.instance_id) {
            instance_order.push(row.instance_id.clone());
        }
        instances.insert(row.instance_id.clone(), row);
    }

    // Explicit deletes first; a later upsert in the same round may
    // reintroduce the row.
    for id in &diff.deletes.calendars {
        if calendars.remove(id).is_some() {
            stats.deleted_calendars += 1;
        }
        tombstones.bury_calendar(id);
    }
    for id in &diff.deletes.instances {
        if let Some(removed) = instances.remove(id) {
            stats.deleted_instances += 1;
            touched.insert(MonthKey::from_datetime(&removed.start_at));
        }
        tombstones.bury_instance(id);
    }

    for row in &diff.upserts.calendars {
        let incoming_wins = match calendars.get(&row.calendar_id) {
            None => true,
            Some(existing) => wins_over(row.updated_at.as_ref(), existing.updated_at.as_ref()),
        };
        if !incoming_wins {
            continue;
        }
        if !calendars.contains_key(&row.calendar_id) {
            calendar_order.push(row.calendar_id.clone());
        }
        calendars.insert(row.calendar_id.clone(), row.clone());
        stats.upserted_calendars += 1;
    }

    for row in &diff.upserts.instances {
        let existing = instances.get(&row.instance_id);
        let incoming_wins = match existing {
            None => true,
            Some(existing) => wins_over(row.updated_at.as_ref(), existing.updated_at.as_ref()),
        };
        if !incoming_wins {
            continue;
        }

        // Soft-deleted on the server: remove rather than insert.
        if row.deleted_at.is_some() {
            if let Some(removed) = instances.remove(&row.instance_id) {
                stats.deleted_instances += 1;
                touched.insert(MonthKey::from_datetime(&removed.start_at));
            }
            tombstones.bury_instance(&row.instance_id);
            continue;
        }

        if let Some(existing) = existing {
            touched.insert(MonthKey::from_datetime(&existing.start_at));
        }
        touched.insert(MonthKey::from_datetime(&row.start_at));

        let mut row = row.clone();
        if row.occurrence_key.is_none() {
            row.occurrence_key = Some(occurrence_key(&row.event_id, row.start_at));
        }
        if !instances.contains_key(&row.instance_id) {
            instance_order.push(row.instance_id.clone());
        }
        instances.insert(row.instance_id.clone(), row);
        stats.upserted_instances += 1;
    }

    // Identifier remap always runs after the delete/upsert pass.
    for mapping in &diff.id_maps {
        let IdEntity::Event = mapping.entity;
        for row in instances.values_mut() {
            let matches = row.event_id == mapping.temporary_id
                || row.temp_event_id.as_deref() == Some(mapping.temporary_id.as_str());
            if !matches {
                continue;
            }
            row.event_id = mapping.confirmed_id.clone();
            row.temp_event_id = None;
            row.occurrence_key = Some(occurrence_key(&row.event_id, row.start_at));
            stats.remapped_instances += 1;
            touched.insert(MonthKey::from_datetime(&row.start_at));
        }
    }

    let schema = LocalStoreSchema {
        version: current.version,
        last_sync_at: current.last_sync_at,
        last_sync_cursor: current.last_sync_cursor,
        calendars: calendar_order
            .iter()
            .filter_map(|id| calendars.remove(id))
            .collect(),
        instances: instance_order
            .iter()
            .filter_map(|id| instances.remove(id))
            .collect(),
        tombstones,
    };

    MergeOutcome {
        schema,
        touched_months: touched,
        stats,
    }
}
