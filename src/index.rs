//! UI-facing in-memory instance index.
//!
//! The engine pushes merged instance sets here one-way after bootstrap, merge,
//! and remap; it never reads the index back for its own logic except the
//! remap month heuristic. The UI layer owns how it indexes the rows for
//! rendering.

use std::sync::{PoisonError, RwLock};

use crate::schema::EventInstance;

#[derive(Default)]
pub struct InstanceIndex {
    rows: RwLock<Vec<EventInstance>>,
}

impl InstanceIndex {
    /// Replace the entire row set — the ownership-transfer signal consumers
    /// key invalidation off.
    pub fn replace_all(&self, rows: Vec<EventInstance>) {
        *self
            .rows
            .write()
            .unwrap_or_else(PoisonError::into_inner) = rows;
    }

    /// A copy of the current row set.
    pub fn rows(&self) -> Vec<EventInstance> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
