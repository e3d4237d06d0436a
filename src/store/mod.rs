//! Object store collaborator.
//!
//! The upload services only see the [`ObjectStore`] trait: create a multipart
//! session, hand out time-boxed capability URLs, finalize or abort. The
//! [`local::LocalObjectStore`] implementation keeps payloads on local disk
//! and serves the capability URLs itself (see `handlers::store_handlers`).

pub mod local;
pub mod signer;

use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{io, time::Duration};
use thiserror::Error;

pub use local::{LocalObjectStore, StagedObject};
pub use signer::{Capability, StoreOp, UrlSigner};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("multipart upload `{0}` not found")]
    UploadNotFound(String),
    #[error("part {0} was never stored")]
    PartNotFound(u32),
    #[error("token for part {0} does not match the stored part")]
    PartMismatch(u32),
    #[error("parts must be non-empty and strictly ascending")]
    InvalidPartOrder,
    #[error("checksum mismatch: declared {expected}, stored {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("capability signature is invalid")]
    InvalidSignature,
    #[error("capability URL expired")]
    UrlExpired,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::InvalidObjectKey => "INVALID_OBJECT_KEY",
            StoreError::ObjectNotFound(_) => "OBJECT_NOT_FOUND",
            StoreError::UploadNotFound(_) => "UPLOAD_NOT_FOUND",
            StoreError::PartNotFound(_) => "PART_NOT_FOUND",
            StoreError::PartMismatch(_) => "PART_MISMATCH",
            StoreError::InvalidPartOrder => "INVALID_PART_ORDER",
            StoreError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            StoreError::InvalidSignature => "INVALID_SIGNATURE",
            StoreError::UrlExpired => "URL_EXPIRED",
            StoreError::Io(_) | StoreError::Json(_) => "STORE_INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            StoreError::InvalidObjectKey
            | StoreError::PartNotFound(_)
            | StoreError::PartMismatch(_)
            | StoreError::InvalidPartOrder => StatusCode::BAD_REQUEST,
            StoreError::ObjectNotFound(_) | StoreError::UploadNotFound(_) => StatusCode::NOT_FOUND,
            StoreError::ChecksumMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            StoreError::InvalidSignature | StoreError::UrlExpired => StatusCode::FORBIDDEN,
            StoreError::Io(_) | StoreError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Metadata of a durably stored object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub size_bytes: u64,
    /// MD5 hex for single objects, `md5(part digests)-N` for multipart ones.
    pub etag: String,
    /// Base64 SHA-256 of the whole object.
    pub checksum_sha256: String,
    pub content_type: Option<String>,
    pub last_modified: DateTime<Utc>,
}

/// Part number plus the token the store issued when the part was written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartToken {
    pub part_number: u32,
    pub etag: String,
}

/// A capability URL and the instant it stops being accepted.
#[derive(Clone, Debug)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// The primitives the upload services consume from a backing store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open a store-side multipart session for `key`; returns its upload id.
    async fn create_multipart(&self, key: &str, content_type: &str) -> StoreResult<String>;

    /// Capability to write exactly one part of one multipart session.
    fn sign_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> StoreResult<SignedUrl>;

    /// Capability to write the whole object in one request.
    fn sign_put(&self, key: &str, ttl: Duration) -> StoreResult<SignedUrl>;

    /// Capability to read the object.
    fn sign_get(&self, key: &str, ttl: Duration) -> StoreResult<SignedUrl>;

    /// Assemble the parts (ascending) into the final object. Returns only once
    /// the object is durable and visible under `key`.
    async fn finalize_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartToken],
        expected_checksum: Option<&str>,
    ) -> StoreResult<StoredObject>;

    /// Drop a multipart session and its staged parts. Idempotent.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StoreResult<()>;

    async fn head_object(&self, key: &str) -> StoreResult<Option<StoredObject>>;

    async fn delete_object(&self, key: &str) -> StoreResult<()>;
}
