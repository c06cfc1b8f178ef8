//! The sync collaborator boundary: the canonical server-diff payload and the
//! trait the engine consumes to fetch it.
//!
//! The engine never performs the network call itself. Whatever transport the
//! application uses, it hands the engine a [`DiffSource`] and the one
//! canonical [`ServerDiff`] shape below — non-conforming input is rejected or
//! normalized here at ingestion, not probed at every consumption site.

use serde::{Deserialize, Serialize};

use crate::error::VaultResult;
use crate::schema::{Calendar, EventInstance};

/// A server-provided delta since a cursor. The envelope uses the wire's
/// camelCase names; row shapes are the storage rows themselves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDiff {
    /// Watermark to persist for the next incremental fetch.
    pub cursor: String,
    #[serde(default)]
    pub upserts: DiffUpserts,
    #[serde(default)]
    pub deletes: DiffDeletes,
    /// Client-temporary → server-confirmed identifier substitutions.
    #[serde(default)]
    pub id_maps: Vec<IdMapping>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffUpserts {
    #[serde(default)]
    pub calendars: Vec<Calendar>,
    #[serde(default)]
    pub instances: Vec<EventInstance>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffDeletes {
    #[serde(default)]
    pub calendars: Vec<String>,
    #[serde(default)]
    pub instances: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdMapping {
    pub entity: IdEntity,
    pub temporary_id: String,
    pub confirmed_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdEntity {
    Event,
}

/// The sole network seam: "fetch diff since cursor", injected by the caller.
pub trait DiffSource {
    /// `since = None` requests a full sync from the beginning.
    fn fetch_diff(
        &self,
        since: Option<&str>,
    ) -> impl Future<Output = VaultResult<ServerDiff>> + Send;
}
