//! Offline-first local persistence and incremental sync for a calendar client.
//!
//! The crate keeps event data usable without a network: a full-state snapshot
//! (`snapshot.json`), an append-only operation log for offline edits
//! (`ops.ndjson`), per-month shard files under `months/`, and an AEAD-encrypted
//! copy with generational backups. `SyncEngine` ties the stores together and
//! applies server diffs last-write-wins; the caller supplies the transport via
//! the `DiffSource` trait.

pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod index;
pub mod merge;
pub mod month;
pub mod oplog;
pub mod schema;
pub mod shards;
pub mod snapshot;
pub mod sync;

mod remap;
#[cfg(test)]
mod testutil;

pub use config::StoreConfig;
pub use crypto::{EncryptedStore, KeyStore, PlatformKeyStore, SecretKey, content_hash};
pub use engine::SyncEngine;
pub use error::{VaultError, VaultResult};
pub use index::InstanceIndex;
pub use merge::{MergeOutcome, SyncStats, merge_diff};
pub use month::MonthKey;
pub use oplog::OperationLog;
pub use schema::{
    Calendar, EventInstance, LocalStoreSchema, Operation, Tombstones, occurrence_key,
    temporary_event_id,
};
pub use shards::MonthShardCache;
pub use snapshot::SnapshotStore;
pub use sync::{DiffSource, IdEntity, IdMapping, ServerDiff};
