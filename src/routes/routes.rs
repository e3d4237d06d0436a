//! Router composition.
//!
//! ## Structure
//! - **Health**: `GET /healthz`, `GET /readyz`
//! - **Upload protocol** (bearer token required)
//!   - `POST /uploads/initiate`, `POST /uploads/authorize-part`, `POST /uploads/complete`
//!   - `POST /uploads/single`, `POST /uploads/confirm`
//!   - `POST /uploads/abort`, `GET /uploads/{session_id}`
//! - **Catalog**: `GET /videos`
//! - **Store capability URLs** (signature in the query string)
//!   - `PUT /store/{*key}` writes a part or an object
//!   - `GET /store/{*key}` reads an object
//!
//! The wildcard `*key` carries nested keys like `videos/alice/clip.webm`.

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        store_handlers::{get_from_store, put_to_store},
        upload_handlers::{
            abort_upload, authorize_part, complete_upload, confirm_upload, get_session,
            initiate_single_shot, initiate_upload, list_videos,
        },
    },
    state::AppState,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/uploads/initiate", post(initiate_upload))
        .route("/uploads/authorize-part", post(authorize_part))
        .route("/uploads/complete", post(complete_upload))
        .route("/uploads/single", post(initiate_single_shot))
        .route("/uploads/confirm", post(confirm_upload))
        .route("/uploads/abort", post(abort_upload))
        .route("/uploads/{session_id}", get(get_session))
        .route("/videos", get(list_videos))
        // Part bodies are streamed to disk, so no request size cap here.
        .route(
            "/store/{*key}",
            put(put_to_store)
                .get(get_from_store)
                .layer(DefaultBodyLimit::disable()),
        )
}
