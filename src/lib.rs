//! Media ingest: resumable, integrity-checked uploads of large media objects
//! from an untrusted client into object storage.
//!
//! The server side (`services`, `handlers`, `store`) owns session state and
//! is the only writer of catalog entries. The client side (`client`) plans
//! parts, checksums the payload and drives a bounded pool of part uploads.

pub mod client;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod identity;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;

use axum::Router;

use crate::state::AppState;

/// The complete HTTP application for `state`.
pub fn app(state: AppState) -> Router {
    routes::routes::routes().with_state(state)
}
