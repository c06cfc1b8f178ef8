//! Snapshot schema and operation-log types.
//!
//! Pure data: the full-state snapshot document (`LocalStoreSchema`), the rows
//! it contains, and the append-only `Operation` log entry. No I/O lives here;
//! the stores in `snapshot` and `oplog` own the files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::VaultError;

/// Current snapshot schema revision. Snapshots with a different version are
/// routed through [`migrate`] on load.
pub const SCHEMA_VERSION: u32 = 1;

/// A calendar row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calendar {
    pub calendar_id: String,
    pub name: String,
    pub color: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One occurrence of an event, derived from a recurring or non-recurring
/// event. Belongs to exactly one calendar and exactly one month shard
/// (keyed by its start time).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInstance {
    pub instance_id: String,
    pub event_id: String,
    pub calendar_id: String,
    pub title: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    #[serde(default)]
    pub all_day: bool,
    /// Derived composite of `event_id` and `start_at`; recomputed whenever
    /// an upsert or remap leaves it absent or stale.
    pub occurrence_key: Option<String>,
    /// Client-generated identifier still awaiting server confirmation.
    pub temp_event_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Soft-delete marker: an upsert carrying this removes the row.
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Identifiers of previously-deleted rows, retained for idempotent delete
/// replay and debugging. Extended on every delete, never pruned implicitly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tombstones {
    #[serde(default)]
    pub calendars: Vec<String>,
    #[serde(default)]
    pub instances: Vec<String>,
}

impl Tombstones {
    /// Record a deleted calendar id (deduplicated).
    pub fn bury_calendar(&mut self, id: &str) {
        if !self.calendars.iter().any(|t| t == id) {
            self.calendars.push(id.to_string());
        }
    }

    /// Record a deleted instance id (deduplicated).
    pub fn bury_instance(&mut self, id: &str) {
        if !self.instances.iter().any(|t| t == id) {
            self.instances.push(id.to_string());
        }
    }
}

/// The full snapshot document persisted as `snapshot.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalStoreSchema {
    pub version: u32,
    /// Wall-clock time of the last successful merge.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Server-issued watermark for the next incremental fetch.
    /// `None` means "full sync from the beginning".
    pub last_sync_cursor: Option<String>,
    pub calendars: Vec<Calendar>,
    pub instances: Vec<EventInstance>,
    pub tombstones: Tombstones,
}

impl LocalStoreSchema {
    /// The well-defined empty template every defensive read path falls back to.
    pub fn empty() -> Self {
        LocalStoreSchema {
            version: SCHEMA_VERSION,
            last_sync_at: None,
            last_sync_cursor: None,
            calendars: Vec::new(),
            instances: Vec::new(),
            tombstones: Tombstones::default(),
        }
    }
}

impl Default for LocalStoreSchema {
    fn default() -> Self {
        Self::empty()
    }
}

/// Derived occurrence key: composite of the instance's event identifier and
/// its start time.
pub fn occurrence_key(event_id: &str, start_at: DateTime<Utc>) -> String {
    format!("{}:{}", event_id, start_at.to_rfc3339())
}

/// Generate a client-temporary event identifier for offline creates.
/// Replaced by the server-confirmed id via the remap paths.
pub fn temporary_event_id() -> String {
    format!("tmp_{}", uuid::Uuid::new_v4())
}

/// Defensive coercion of an arbitrary JSON value into a structurally valid
/// schema: per-field type checking with field-by-field fallback to the empty
/// template, so a disk-read or server-sent object of any shape still yields a
/// usable document. Unknown versions are routed through [`migrate`].
pub fn normalize(value: Value) -> LocalStoreSchema {
    let empty = LocalStoreSchema::empty();
    let Value::Object(map) = value else {
        return empty;
    };

    let version = map
        .get("version")
        .and_then(Value::as_u64)
        .map_or(empty.version, |v| v as u32);

    let last_sync_at = map
        .get("last_sync_at")
        .cloned()
        .and_then(|v| serde_json::from_value::<Option<DateTime<Utc>>>(v).ok())
        .flatten();

    let last_sync_cursor = map
        .get("last_sync_cursor")
        .and_then(Value::as_str)
        .map(String::from);

    let mut calendars: Vec<Calendar> = Vec::new();
    if let Some(Value::Array(items)) = map.get("calendars") {
        for item in items {
            if let Ok(row) = serde_json::from_value::<Calendar>(item.clone()) {
                // Unique by calendar_id: later entries win.
                calendars.retain(|c| c.calendar_id != row.calendar_id);
                calendars.push(row);
            }
        }
    }

    let mut instances: Vec<EventInstance> = Vec::new();
    if let Some(Value::Array(items)) = map.get("instances") {
        for item in items {
            if let Ok(row) = serde_json::from_value::<EventInstance>(item.clone()) {
                instances.retain(|i| i.instance_id != row.instance_id);
                instances.push(row);
            }
        }
    }

    let tombstones = map
        .get("tombstones")
        .cloned()
        .and_then(|v| serde_json::from_value::<Tombstones>(v).ok())
        .unwrap_or_default();

    migrate(LocalStoreSchema {
        version,
        last_sync_at,
        last_sync_cursor,
        calendars,
        instances,
        tombstones,
    })
}

/// Migration hook for snapshots written by other schema revisions.
/// A pass-through today; the extension point future revisions plug into.
pub fn migrate(schema: LocalStoreSchema) -> LocalStoreSchema {
    match schema.version {
        SCHEMA_VERSION => schema,
        other => {
            debug!(from = other, to = SCHEMA_VERSION, "no migration registered, passing snapshot through");
            LocalStoreSchema {
                version: SCHEMA_VERSION,
                ..schema
            }
        }
    }
}

/// One entry of the append-only operation log: a tagged union over
/// `(entity, type)`. The on-disk shape is the raw `{entity, type, ...}`
/// object; decoding matches the discriminant pair exhaustively and rejects
/// anything else at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawOperation", into = "RawOperation")]
pub enum Operation {
    UpsertCalendar {
        row: Calendar,
    },
    DeleteCalendar {
        calendar_id: String,
        updated_at: Option<DateTime<Utc>>,
    },
    UpsertInstance {
        row: EventInstance,
    },
    DeleteInstance {
        instance_id: String,
        updated_at: Option<DateTime<Utc>>,
    },
}

/// Wire shape of a log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawOperation {
    entity: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    row: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<RawOperation> for Operation {
    type Error = VaultError;

    fn try_from(raw: RawOperation) -> Result<Self, Self::Error> {
        let op = match (raw.entity.as_str(), raw.kind.as_str()) {
            ("calendar", "upsert") => {
                let row = raw
                    .row
                    .ok_or_else(|| VaultError::Serialization("calendar upsert without row".into()))?;
                Operation::UpsertCalendar {
                    row: serde_json::from_value(row)
                        .map_err(|e| VaultError::Serialization(e.to_string()))?,
                }
            }
            ("calendar", "delete") => Operation::DeleteCalendar {
                calendar_id: raw
                    .id
                    .ok_or_else(|| VaultError::Serialization("calendar delete without id".into()))?,
                updated_at: raw.updated_at,
            },
            ("instance", "upsert") => {
                let row = raw
                    .row
                    .ok_or_else(|| VaultError::Serialization("instance upsert without row".into()))?;
                Operation::UpsertInstance {
                    row: serde_json::from_value(row)
                        .map_err(|e| VaultError::Serialization(e.to_string()))?,
                }
            }
            ("instance", "delete") => Operation::DeleteInstance {
                instance_id: raw
                    .id
                    .ok_or_else(|| VaultError::Serialization("instance delete without id".into()))?,
                updated_at: raw.updated_at,
            },
            (entity, kind) => {
                return Err(VaultError::Serialization(format!(
                    "unknown operation discriminant ({entity}, {kind})"
                )));
            }
        };
        Ok(op)
    }
}

impl From<Operation> for RawOperation {
    fn from(op: Operation) -> Self {
        match op {
            Operation::UpsertCalendar { row } => RawOperation {
                entity: "calendar".into(),
                kind: "upsert".into(),
                updated_at: row.updated_at,
                row: serde_json::to_value(row).ok(),
                id: None,
            },
            Operation::DeleteCalendar {
                calendar_id,
                updated_at,
            } => RawOperation {
                entity: "calendar".into(),
                kind: "delete".into(),
                row: None,
                id: Some(calendar_id),
                updated_at,
            },
            Operation::UpsertInstance { row } => RawOperation {
                entity: "instance".into(),
                kind: "upsert".into(),
                updated_at: row.updated_at,
                row: serde_json::to_value(row).ok(),
                id: None,
            },
            Operation::DeleteInstance {
                instance_id,
                updated_at,
            } => RawOperation {
                entity: "instance".into(),
                kind: "delete".into(),
                row: None,
                id: Some(instance_id),
                updated_at,
            },
        }
    }
}
