//! Capability URL endpoints of the local object store.
//!
//! These stand in for a cloud store's presigned URLs: the client holds no
//! credentials, only the signed query string. Bodies are streamed to disk,
//! never buffered.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use serde::Deserialize;
use std::io;
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::{
    errors::AppError,
    state::AppState,
    store::{Capability, StoreOp, StoredObject},
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityQuery {
    pub op: StoreOp,
    pub upload_id: Option<String>,
    pub part_number: Option<u32>,
    pub expires: i64,
    pub signature: String,
}

impl CapabilityQuery {
    fn capability<'a>(&'a self, key: &'a str) -> Capability<'a> {
        Capability {
            op: self.op,
            key,
            upload_id: self.upload_id.as_deref(),
            part_number: self.part_number,
            expires: self.expires,
        }
    }
}

/// `PUT /store/{*key}` with a part or object capability.
///
/// Responds with the stored bytes' ETag; for parts that ETag is the
/// completion token the client later hands to `CompleteUpload`.
pub async fn put_to_store(
    State(app): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<CapabilityQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    app.store.verify(&q.capability(&key), &q.signature)?;

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    match q.op {
        StoreOp::Part => {
            let (Some(upload_id), Some(part_number)) = (q.upload_id.as_deref(), q.part_number)
            else {
                return Err(AppError::new(
                    StatusCode::BAD_REQUEST,
                    "part capability requires uploadId and partNumber",
                ));
            };
            let etag = app
                .store
                .put_part_stream(&key, upload_id, part_number, stream)
                .await?;
            if let Err(err) = app
                .coordinator
                .on_part_stored(&key, upload_id, part_number, &etag)
                .await
            {
                warn!(object_key = %key, part_number, error = %err, "could not record part completion");
            }
            Ok(etag_response(&etag))
        }
        StoreOp::Object => {
            // Refuse before writing anything unless an open session wants it.
            let session = app.coordinator.open_single_shot(&key).await?;
            let content_type = headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string());
            let staged = app
                .store
                .stage_object_stream(&key, content_type, stream)
                .await?;
            let published = app
                .coordinator
                .on_object_stored(session.id, &staged.object, || app.store.publish_staged(&staged))
                .await;
            if let Err(err) = published {
                app.store.discard_staged(&staged).await;
                return Err(err.into());
            }
            Ok(etag_response(&staged.object.etag))
        }
        StoreOp::Read => Err(AppError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "read capability does not permit writes",
        )),
    }
}

/// `GET /store/{*key}` with a read capability, as a streaming response.
pub async fn get_from_store(
    State(app): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<CapabilityQuery>,
) -> Result<Response, AppError> {
    if q.op != StoreOp::Read {
        return Err(AppError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "write capability does not permit reads",
        ));
    }
    app.store.verify(&q.capability(&key), &q.signature)?;

    let (meta, file) = app.store.open_object(&key).await?;
    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

fn etag_response(etag: &str) -> Response {
    let mut response = Response::new(Body::empty());
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    response
}

fn set_object_headers(headers: &mut HeaderMap, meta: &StoredObject) {
    let content_type = meta
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size_bytes));
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.etag)) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
