//! Request and response bodies of the upload API.
//!
//! Field names are camelCase on the wire. The same types are used by the
//! server handlers and by the HTTP upload client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    multipart::{ByteRange, CompletedPart, PartRecord},
    session::UploadSession,
};

/// `POST /uploads/initiate`
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadRequest {
    pub content_type: String,
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_count: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadResponse {
    pub session_id: Uuid,
    pub object_key: String,
}

/// `POST /uploads/authorize-part`
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizePartRequest {
    pub session_id: Uuid,
    pub object_key: String,
    pub part_number: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_range: Option<ByteRange>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizePartResponse {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// `POST /uploads/complete`
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadRequest {
    pub session_id: Uuid,
    pub object_key: String,
    pub parts: Vec<CompletedPart>,
}

/// Returned by both `complete` and `confirm`.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadResponse {
    pub catalog_entry_id: Uuid,
    pub object_key: String,
}

/// `POST /uploads/single`
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SingleShotRequest {
    pub content_type: String,
    pub checksum: String,
    pub size: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SingleShotResponse {
    pub session_id: Uuid,
    pub object_key: String,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// `POST /uploads/confirm`
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmUploadRequest {
    pub session_id: Uuid,
    pub object_key: String,
}

/// `POST /uploads/abort`
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AbortUploadRequest {
    pub session_id: Uuid,
}

/// `GET /uploads/{session_id}`
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session: UploadSession,
    pub parts: Vec<PartRecord>,
}

/// One element of `GET /videos`. The URL is a short-lived read capability.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VideoListing {
    pub id: Uuid,
    pub url: String,
    pub object_key: String,
    pub created_at: DateTime<Utc>,
}
