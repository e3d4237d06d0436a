//! JSON handlers for the upload protocol and the catalog listing.
//!
//! Every route requires a bearer token; the [`Principal`] extractor rejects
//! the request with 401 before any handler logic runs.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use uuid::Uuid;

use crate::{
    errors::AppError,
    identity::Principal,
    models::api::{
        AbortUploadRequest, AuthorizePartRequest, AuthorizePartResponse, CompleteUploadRequest,
        CompleteUploadResponse, ConfirmUploadRequest, InitiateUploadRequest,
        InitiateUploadResponse, SessionView, SingleShotRequest, SingleShotResponse, VideoListing,
    },
    state::AppState,
    store::ObjectStore,
};

/// `POST /uploads/initiate`
pub async fn initiate_upload(
    State(app): State<AppState>,
    principal: Principal,
    Json(req): Json<InitiateUploadRequest>,
) -> Result<(StatusCode, Json<InitiateUploadResponse>), AppError> {
    let session = app.authority.initiate_upload(&principal, &req).await?;
    Ok((
        StatusCode::CREATED,
        Json(InitiateUploadResponse {
            session_id: session.id,
            object_key: session.object_key,
        }),
    ))
}

/// `POST /uploads/authorize-part`
pub async fn authorize_part(
    State(app): State<AppState>,
    principal: Principal,
    Json(req): Json<AuthorizePartRequest>,
) -> Result<Json<AuthorizePartResponse>, AppError> {
    let signed = app.authority.authorize_part(&principal, &req).await?;
    Ok(Json(AuthorizePartResponse {
        url: signed.url,
        expires_at: signed.expires_at,
    }))
}

/// `POST /uploads/complete`
pub async fn complete_upload(
    State(app): State<AppState>,
    principal: Principal,
    Json(req): Json<CompleteUploadRequest>,
) -> Result<Json<CompleteUploadResponse>, AppError> {
    let entry = app.coordinator.complete_upload(&principal, &req).await?;
    Ok(Json(CompleteUploadResponse {
        catalog_entry_id: entry.id,
        object_key: entry.object_key,
    }))
}

/// `POST /uploads/single`
pub async fn initiate_single_shot(
    State(app): State<AppState>,
    principal: Principal,
    Json(req): Json<SingleShotRequest>,
) -> Result<(StatusCode, Json<SingleShotResponse>), AppError> {
    let (session, signed) = app.authority.initiate_single_shot(&principal, &req).await?;
    Ok((
        StatusCode::CREATED,
        Json(SingleShotResponse {
            session_id: session.id,
            object_key: session.object_key,
            url: signed.url,
            expires_at: signed.expires_at,
        }),
    ))
}

/// `POST /uploads/confirm`
pub async fn confirm_upload(
    State(app): State<AppState>,
    principal: Principal,
    Json(req): Json<ConfirmUploadRequest>,
) -> Result<Json<CompleteUploadResponse>, AppError> {
    let entry = app.coordinator.confirm_single_shot(&principal, &req).await?;
    Ok(Json(CompleteUploadResponse {
        catalog_entry_id: entry.id,
        object_key: entry.object_key,
    }))
}

/// `POST /uploads/abort`
pub async fn abort_upload(
    State(app): State<AppState>,
    principal: Principal,
    Json(req): Json<AbortUploadRequest>,
) -> Result<StatusCode, AppError> {
    app.authority.abort_upload(&principal, req.session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /uploads/{session_id}`
pub async fn get_session(
    State(app): State<AppState>,
    principal: Principal,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionView>, AppError> {
    Ok(Json(app.authority.session_view(&principal, session_id).await?))
}

/// `GET /videos`: the caller's catalog, newest first, each with a read URL.
pub async fn list_videos(
    State(app): State<AppState>,
    principal: Principal,
) -> Result<Json<Vec<VideoListing>>, AppError> {
    let entries = app.catalog.list(&principal.owner_id).await?;
    let mut listings = Vec::with_capacity(entries.len());
    for entry in entries {
        let signed = app.store.sign_get(&entry.object_key, app.read_url_ttl)?;
        listings.push(VideoListing {
            id: entry.id,
            url: signed.url,
            object_key: entry.object_key,
            created_at: entry.created_at,
        });
    }
    Ok(Json(listings))
}
