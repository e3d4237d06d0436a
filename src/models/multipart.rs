//! Represents the parts of a multipart upload session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A part that has been authorized (and possibly transferred) for a session.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PartRecord {
    /// Reference to the parent upload session.
    pub session_id: Uuid,

    /// Part number (1-based).
    pub part_number: i64,

    /// First byte of the part, if the client announced its range.
    pub range_start: Option<i64>,

    /// One past the last byte of the part, if announced.
    pub range_end: Option<i64>,

    /// Store-issued completion token, present once the transfer succeeded.
    pub completion_token: Option<String>,

    /// When the most recent capability URL for this part was issued.
    pub authorized_at: DateTime<Utc>,

    /// When the store last accepted bytes for this part.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Half-open byte range `[start, end)` of the payload.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// A part number paired with the completion token the store returned for it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: i64,
    pub token: String,
}
