//! Upload client: plans parts, checksums the payload and drives a bounded
//! pool of part transfers against the upload API.
//!
//! Nothing here depends on a UI. [`state::UploadTracker`] carries the
//! user-visible state, [`uploader::Uploader`] runs an upload end to end.

pub mod checksum;
pub mod error;
pub mod payload;
pub mod planner;
pub mod retry;
pub mod state;
pub mod transport;
pub mod uploader;
pub mod workers;

pub use error::ClientError;
pub use payload::Payload;
pub use uploader::{UploadOutcome, Uploader};
