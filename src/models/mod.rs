//! Core data models for the media ingest service.
//!
//! Sessions, parts and catalog entries map to SQLite tables via
//! `sqlx::FromRow`; the request/response shapes of the HTTP surface live in
//! `api` and are shared with the upload client.

pub mod api;
pub mod catalog;
pub mod multipart;
pub mod session;
