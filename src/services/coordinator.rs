//! Completion coordinator.
//!
//! The only code path that writes catalog entries. An entry is inserted in
//! the same transaction that moves its session to COMPLETED, and only after
//! the store has confirmed the object durable: a successful multipart
//! finalize, or a verified single-shot object.

use sqlx::SqlitePool;
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{abort_session, catalog::Catalog, fetch_owned, session_repo::SessionRepo};
use crate::{
    errors::{UploadError, UploadResult},
    identity::Principal,
    models::{
        api::{CompleteUploadRequest, ConfirmUploadRequest},
        catalog::CatalogEntry,
        multipart::CompletedPart,
        session::{SessionStatus, UploadKind, UploadSession},
    },
    store::{ObjectStore, PartToken, StoreError, StoredObject},
};

#[derive(Clone)]
pub struct CompletionCoordinator {
    db: Arc<SqlitePool>,
    sessions: SessionRepo,
    catalog: Catalog,
    store: Arc<dyn ObjectStore>,
    max_parts: u64,
    /// Serializes completion attempts of one session within this process.
    /// Racing processes are still settled by the status compare-and-swap.
    settling: Arc<Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>>,
}

impl CompletionCoordinator {
    pub fn new(
        db: Arc<SqlitePool>,
        sessions: SessionRepo,
        catalog: Catalog,
        store: Arc<dyn ObjectStore>,
        max_parts: u64,
    ) -> Self {
        Self {
            db,
            sessions,
            catalog,
            store,
            max_parts,
            settling: Arc::default(),
        }
    }

    /// Finalize a multipart upload and commit its catalog entry.
    ///
    /// Idempotent: completing a COMPLETED session returns the entry it
    /// already has. A rejected part set leaves the session open so the caller
    /// can resubmit; a failed finalize aborts it.
    pub async fn complete_upload(
        &self,
        principal: &Principal,
        req: &CompleteUploadRequest,
    ) -> UploadResult<CatalogEntry> {
        let _settling = self.settle_lock(req.session_id).await;
        let session = fetch_owned(&self.sessions, principal, req.session_id).await?;
        ensure_key(&session, &req.object_key)?;
        match session.status {
            SessionStatus::Completed => return self.existing_entry(&session).await,
            SessionStatus::Aborted => {
                return Err(UploadError::SessionClosed {
                    id: session.id,
                    status: session.status,
                });
            }
            _ => {}
        }
        if session.kind != UploadKind::Multipart {
            return Err(UploadError::InvalidRequest(
                "single-shot sessions are confirmed, not completed".into(),
            ));
        }
        let upload_id = session.store_upload_id.as_deref().ok_or_else(|| {
            UploadError::InvalidRequest("session has no store-side upload".into())
        })?;

        let parts = validate_part_set(&req.parts, session.expected_parts, self.max_parts)?;

        match self
            .store
            .finalize_multipart(
                &session.object_key,
                upload_id,
                &parts,
                Some(&session.declared_checksum),
            )
            .await
        {
            Ok(object) => {
                info!(
                    session_id = %session.id,
                    object_key = %session.object_key,
                    parts = parts.len(),
                    size_bytes = object.size_bytes,
                    "store finalized object"
                );
                self.commit(&session).await
            }
            Err(err) => self.finalize_failed(&session, err).await,
        }
    }

    /// Client-reported single-shot success. Commits only if the store holds
    /// the object with the declared checksum.
    pub async fn confirm_single_shot(
        &self,
        principal: &Principal,
        req: &ConfirmUploadRequest,
    ) -> UploadResult<CatalogEntry> {
        let _settling = self.settle_lock(req.session_id).await;
        let session = fetch_owned(&self.sessions, principal, req.session_id).await?;
        ensure_key(&session, &req.object_key)?;
        if session.kind != UploadKind::SingleShot {
            return Err(UploadError::InvalidRequest(
                "multipart sessions are completed with their part list".into(),
            ));
        }
        match session.status {
            SessionStatus::Completed => return self.existing_entry(&session).await,
            SessionStatus::Aborted => {
                return Err(UploadError::SessionClosed {
                    id: session.id,
                    status: session.status,
                });
            }
            _ => {}
        }

        let Some(object) = self.store.head_object(&session.object_key).await? else {
            return Err(UploadError::ObjectMissing(session.object_key.clone()));
        };
        self.settle_single_shot(&session, &object).await
    }

    /// The open single-shot session that may receive bytes for `object_key`.
    /// Checked before a single-shot PUT touches disk.
    pub async fn open_single_shot(&self, object_key: &str) -> UploadResult<UploadSession> {
        let Some(session) = self.sessions.find_by_object_key(object_key).await? else {
            return Err(UploadError::InvalidRequest(
                "no upload session for this key".into(),
            ));
        };
        if session.kind != UploadKind::SingleShot {
            return Err(UploadError::InvalidRequest(
                "key belongs to a multipart session".into(),
            ));
        }
        if session.status.is_terminal() {
            return Err(UploadError::SessionClosed {
                id: session.id,
                status: session.status,
            });
        }
        Ok(session)
    }

    /// Store notification: the bytes of a single-shot object are staged.
    ///
    /// Under the session's settle lock, `publish` makes the object visible
    /// only if the session is still open and the bytes match the declared
    /// checksum; the catalog entry is committed right after. On any error the
    /// caller discards the staged bytes.
    pub async fn on_object_stored<F, Fut>(
        &self,
        session_id: Uuid,
        object: &StoredObject,
        publish: F,
    ) -> UploadResult<CatalogEntry>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), StoreError>>,
    {
        let _settling = self.settle_lock(session_id).await;
        let session = self.sessions.fetch(session_id).await?;
        if session.kind != UploadKind::SingleShot || session.object_key != object.key {
            return Err(UploadError::InvalidRequest(
                "object does not belong to this session".into(),
            ));
        }
        if session.status.is_terminal() {
            debug!(session_id = %session.id, status = %session.status, "refusing object for closed session");
            return Err(UploadError::SessionClosed {
                id: session.id,
                status: session.status,
            });
        }
        if object.checksum_sha256 != session.declared_checksum {
            warn!(
                session_id = %session.id,
                object_key = %session.object_key,
                "staged object does not match declared checksum"
            );
            abort_session(&self.sessions, self.store.as_ref(), &session, "checksum mismatch").await?;
            return Err(UploadError::IntegrityMismatch(format!(
                "declared {}, stored {}",
                session.declared_checksum, object.checksum_sha256
            )));
        }
        publish().await?;
        self.commit(&session).await
    }

    /// Store notification: one part of a multipart session was written.
    pub async fn on_part_stored(
        &self,
        object_key: &str,
        upload_id: &str,
        part_number: u32,
        token: &str,
    ) -> UploadResult<()> {
        let Some(session) = self.sessions.find_by_object_key(object_key).await? else {
            return Ok(());
        };
        if session.store_upload_id.as_deref() != Some(upload_id) || session.status.is_terminal() {
            return Ok(());
        }
        self.sessions
            .record_part_completion(session.id, part_number as i64, token)
            .await?;
        debug!(session_id = %session.id, part_number, "part stored");
        Ok(())
    }

    async fn settle_lock(&self, session_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.settling.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(session_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn settle_single_shot(
        &self,
        session: &UploadSession,
        object: &StoredObject,
    ) -> UploadResult<CatalogEntry> {
        if object.checksum_sha256 != session.declared_checksum {
            warn!(
                session_id = %session.id,
                object_key = %session.object_key,
                "stored object does not match declared checksum"
            );
            abort_session(&self.sessions, self.store.as_ref(), session, "checksum mismatch").await?;
            self.discard_object(&session.object_key).await;
            return Err(UploadError::IntegrityMismatch(format!(
                "declared {}, stored {}",
                session.declared_checksum, object.checksum_sha256
            )));
        }
        self.commit(session).await
    }

    async fn finalize_failed(
        &self,
        session: &UploadSession,
        err: StoreError,
    ) -> UploadResult<CatalogEntry> {
        // A concurrent completion may have finalized the key first, consuming
        // the staged parts.
        if let Some(object) = self.store.head_object(&session.object_key).await? {
            if object.checksum_sha256 == session.declared_checksum {
                return self.commit(session).await;
            }
        }

        warn!(
            session_id = %session.id,
            object_key = %session.object_key,
            error = %err,
            "finalize failed"
        );
        if !abort_session(&self.sessions, self.store.as_ref(), session, "finalize failed").await? {
            let current = self.sessions.fetch(session.id).await?;
            if current.status == SessionStatus::Completed {
                return self.existing_entry(&current).await;
            }
        }
        Err(match err {
            StoreError::ChecksumMismatch { expected, actual } => {
                UploadError::IntegrityMismatch(format!("declared {expected}, stored {actual}"))
            }
            other => UploadError::FinalizationFailed(other.to_string()),
        })
    }

    /// COMPLETED transition and catalog insert in one transaction. The status
    /// compare-and-swap decides between racing completions.
    async fn commit(&self, session: &UploadSession) -> UploadResult<CatalogEntry> {
        let mut tx = self.db.begin().await?;
        if SessionRepo::complete_in(&mut *tx, session.id).await? {
            let entry =
                Catalog::create_in(&mut *tx, &session.owner_id, &session.object_key, session.id)
                    .await?;
            tx.commit().await?;
            info!(
                session_id = %session.id,
                object_key = %session.object_key,
                catalog_entry_id = %entry.id,
                "upload completed"
            );
            return Ok(entry);
        }
        tx.rollback().await?;

        let current = self.sessions.fetch(session.id).await?;
        if current.status == SessionStatus::Completed {
            return self.existing_entry(&current).await;
        }
        // Aborted while the store was finalizing: the object has no session
        // left to vouch for it.
        self.discard_object(&current.object_key).await;
        Err(UploadError::SessionClosed {
            id: current.id,
            status: current.status,
        })
    }

    async fn existing_entry(&self, session: &UploadSession) -> UploadResult<CatalogEntry> {
        self.catalog
            .find_by_object_key(&session.object_key)
            .await?
            .ok_or_else(|| {
                UploadError::FinalizationFailed(format!(
                    "session {} is completed but has no catalog entry",
                    session.id
                ))
            })
    }

    async fn discard_object(&self, object_key: &str) {
        if let Err(err) = self.store.delete_object(object_key).await {
            warn!(object_key, error = %err, "failed to delete orphaned object");
        }
    }
}

fn ensure_key(session: &UploadSession, object_key: &str) -> UploadResult<()> {
    if session.object_key != object_key {
        return Err(UploadError::InvalidRequest(
            "objectKey does not belong to this session".into(),
        ));
    }
    Ok(())
}

/// Check a submitted part list is exactly `{1..N}` with one non-empty token
/// per part, and return it sorted ascending for the store.
pub fn validate_part_set(
    parts: &[CompletedPart],
    expected_parts: Option<i64>,
    max_parts: u64,
) -> UploadResult<Vec<PartToken>> {
    if parts.is_empty() {
        return Err(UploadError::IncompletePartSet("no parts submitted".into()));
    }

    let mut seen = HashSet::with_capacity(parts.len());
    for part in parts {
        if part.part_number < 1 || part.part_number as u64 > max_parts {
            return Err(UploadError::IncompletePartSet(format!(
                "part number {} is out of range",
                part.part_number
            )));
        }
        if part.token.trim().is_empty() {
            return Err(UploadError::IncompletePartSet(format!(
                "part {} has an empty token",
                part.part_number
            )));
        }
        if !seen.insert(part.part_number) {
            return Err(UploadError::IncompletePartSet(format!(
                "part {} submitted more than once",
                part.part_number
            )));
        }
    }

    let mut sorted: Vec<&CompletedPart> = parts.iter().collect();
    sorted.sort_by_key(|p| p.part_number);
    if let Some(missing) = (1..=sorted.len() as i64).zip(&sorted).find(|(n, p)| p.part_number != *n) {
        return Err(UploadError::IncompletePartSet(format!("part {} is missing", missing.0)));
    }
    if let Some(expected) = expected_parts {
        if sorted.len() as i64 != expected {
            return Err(UploadError::IncompletePartSet(format!(
                "expected {expected} parts, got {}",
                sorted.len()
            )));
        }
    }

    Ok(sorted
        .into_iter()
        .map(|p| PartToken {
            part_number: p.part_number as u32,
            etag: p.token.clone(),
        })
        .collect())
}
