//! Server-side upload orchestration.
//!
//! - [`authority::UploadAuthority`] creates sessions and issues capability URLs.
//! - [`coordinator::CompletionCoordinator`] finalizes objects and is the only
//!   writer of catalog entries.
//! - [`reaper::SessionReaper`] aborts sessions abandoned past their TTL.

pub mod authority;
pub mod catalog;
pub mod coordinator;
pub mod reaper;
pub mod session_repo;

use tracing::{info, warn};

use crate::{
    errors::{UploadError, UploadResult},
    identity::Principal,
    models::session::{SessionStatus, UploadKind, UploadSession},
    store::ObjectStore,
};
use session_repo::SessionRepo;

/// Fetch a session and check it belongs to `principal`.
pub(crate) async fn fetch_owned(
    sessions: &SessionRepo,
    principal: &Principal,
    session_id: uuid::Uuid,
) -> UploadResult<UploadSession> {
    let session = sessions.fetch(session_id).await?;
    if session.owner_id != principal.owner_id {
        return Err(UploadError::Unauthorized);
    }
    Ok(session)
}

/// Move a session to ABORTED from whatever non-terminal status it is in,
/// then drop any store-side multipart state. Already-written single-shot
/// objects are left to the caller.
///
/// Returns whether this call performed the transition. `Ok(false)` means the
/// session was (or concurrently became) terminal.
pub(crate) async fn abort_session(
    sessions: &SessionRepo,
    store: &dyn ObjectStore,
    session: &UploadSession,
    reason: &str,
) -> UploadResult<bool> {
    let mut observed = session.status;
    // Statuses only move forward, so this settles within a few rounds.
    loop {
        if observed.is_terminal() {
            return Ok(false);
        }
        if sessions
            .transition(session.id, observed, SessionStatus::Aborted)
            .await?
        {
            break;
        }
        observed = sessions.fetch(session.id).await?.status;
    }
    info!(session_id = %session.id, object_key = %session.object_key, reason, "aborted upload session");

    if session.kind == UploadKind::Multipart {
        if let Some(upload_id) = session.store_upload_id.as_deref() {
            if let Err(err) = store.abort_multipart(&session.object_key, upload_id).await {
                warn!(
                    session_id = %session.id,
                    error = %err,
                    "store-side abort failed; staged parts left for store cleanup"
                );
            }
        }
    }
    Ok(true)
}
