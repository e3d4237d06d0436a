//! Represents catalog entries, the records that make an upload visible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A durably finalized object, visible to the rest of the application.
///
/// Rows are only ever inserted after the object store confirmed the object,
/// and are never updated afterwards.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub id: Uuid,

    pub owner_id: String,

    /// Key of the finalized object in the store.
    pub object_key: String,

    /// Session that produced this entry.
    pub session_id: Uuid,

    pub created_at: DateTime<Utc>,
}
