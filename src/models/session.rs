//! Represents server-tracked upload sessions and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of an upload session.
///
/// Transitions are monotonic: `Initiated -> InProgress -> Completed`, and any
/// non-terminal state may move to `Aborted`. Nothing leaves a terminal state.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Initiated,
    InProgress,
    Completed,
    Aborted,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Aborted)
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Initiated, InProgress) => true,
            (Initiated | InProgress, Completed) => true,
            (Initiated | InProgress, Aborted) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Initiated => "INITIATED",
            SessionStatus::InProgress => "IN_PROGRESS",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the payload travels to the object store.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadKind {
    /// One capability URL for the whole object.
    SingleShot,
    /// Store-native multipart session, one capability URL per part.
    Multipart,
}

/// An upload session, the single source of truth for one upload.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    /// Session identifier returned to the client.
    pub id: Uuid,

    /// Key of the object being written.
    pub object_key: String,

    /// Authenticated principal that initiated the upload.
    pub owner_id: String,

    /// Declared MIME type, already checked against the accepted set.
    pub content_type: String,

    /// Base64 SHA-256 of the whole payload, declared before any transfer.
    pub declared_checksum: String,

    pub kind: UploadKind,

    /// Store-side multipart upload id (multipart sessions only).
    #[serde(skip_serializing)]
    pub store_upload_id: Option<String>,

    /// Number of parts announced at initiation, if the client declared it.
    pub expected_parts: Option<i64>,

    /// Total payload size announced at initiation, if declared.
    pub declared_size: Option<i64>,

    pub status: SessionStatus,

    pub created_at: DateTime<Utc>,

    /// Timestamp of the last status change.
    pub updated_at: DateTime<Utc>,
}
