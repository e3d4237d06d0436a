//! Upload session authority: creates sessions and issues capability URLs
//! scoped to one object (and, for multipart sessions, one part).

use base64::{Engine as _, engine::general_purpose};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};
use uuid::Uuid;

use super::{abort_session, fetch_owned, session_repo::SessionRepo};
use crate::{
    config::UploadPolicy,
    errors::{UploadError, UploadResult},
    identity::Principal,
    models::{
        api::{
            AuthorizePartRequest, InitiateUploadRequest, SessionView, SingleShotRequest,
        },
        session::{SessionStatus, UploadKind, UploadSession},
    },
    store::{ObjectStore, SignedUrl},
};

const SHA256_LEN: usize = 32;

#[derive(Clone)]
pub struct UploadAuthority {
    sessions: SessionRepo,
    store: Arc<dyn ObjectStore>,
    policy: Arc<UploadPolicy>,
    /// Validity window of every write capability.
    url_ttl: Duration,
}

impl UploadAuthority {
    pub fn new(
        sessions: SessionRepo,
        store: Arc<dyn ObjectStore>,
        policy: Arc<UploadPolicy>,
        url_ttl: Duration,
    ) -> Self {
        Self {
            sessions,
            store,
            policy,
            url_ttl,
        }
    }

    /// Start a multipart upload: open a store-side multipart session and
    /// record an INITIATED upload session.
    pub async fn initiate_upload(
        &self,
        principal: &Principal,
        req: &InitiateUploadRequest,
    ) -> UploadResult<UploadSession> {
        self.validate_declaration(&req.content_type, &req.checksum)?;
        if matches!(req.total_size, Some(size) if size <= 0) {
            return Err(UploadError::EmptyPayload);
        }
        if let Some(count) = req.part_count {
            if count < 1 || count as u64 > self.policy.max_parts {
                return Err(UploadError::InvalidRequest(format!(
                    "partCount must be between 1 and {}",
                    self.policy.max_parts
                )));
            }
        }

        let object_key = object_key_for(principal, &req.content_type);
        let upload_id = self
            .store
            .create_multipart(&object_key, &req.content_type)
            .await?;

        let now = Utc::now();
        let session = UploadSession {
            id: Uuid::new_v4(),
            object_key,
            owner_id: principal.owner_id.clone(),
            content_type: req.content_type.clone(),
            declared_checksum: req.checksum.clone(),
            kind: UploadKind::Multipart,
            store_upload_id: Some(upload_id.clone()),
            expected_parts: req.part_count,
            declared_size: req.total_size,
            status: SessionStatus::Initiated,
            created_at: now,
            updated_at: now,
        };
        if let Err(err) = self.sessions.insert(&session).await {
            let _ = self.store.abort_multipart(&session.object_key, &upload_id).await;
            return Err(err);
        }

        info!(
            session_id = %session.id,
            object_key = %session.object_key,
            owner_id = %session.owner_id,
            "initiated multipart upload"
        );
        Ok(session)
    }

    /// Issue a capability URL for one part. Safe to repeat for the same part
    /// number: each call returns a fresh URL and the store keeps the last
    /// successful write.
    pub async fn authorize_part(
        &self,
        principal: &Principal,
        req: &AuthorizePartRequest,
    ) -> UploadResult<SignedUrl> {
        let session = fetch_owned(&self.sessions, principal, req.session_id).await?;
        if session.status.is_terminal() {
            return Err(UploadError::SessionClosed {
                id: session.id,
                status: session.status,
            });
        }
        if session.object_key != req.object_key {
            return Err(UploadError::InvalidRequest(
                "objectKey does not belong to this session".into(),
            ));
        }
        if session.kind != UploadKind::Multipart {
            return Err(UploadError::InvalidRequest(
                "single-shot sessions do not take parts".into(),
            ));
        }
        let max_part = session
            .expected_parts
            .map(|n| n as u64)
            .unwrap_or(self.policy.max_parts);
        if req.part_number < 1 || req.part_number as u64 > max_part {
            return Err(UploadError::InvalidPartNumber(req.part_number));
        }
        if matches!(req.byte_range, Some(range) if range.is_empty()) {
            return Err(UploadError::InvalidRequest("byteRange is empty".into()));
        }
        let upload_id = session.store_upload_id.as_deref().ok_or_else(|| {
            UploadError::InvalidRequest("session has no store-side upload".into())
        })?;

        if session.status == SessionStatus::Initiated {
            let won = self
                .sessions
                .transition(session.id, SessionStatus::Initiated, SessionStatus::InProgress)
                .await?;
            if !won {
                // Lost the race: fine unless the session closed meanwhile.
                let current = self.sessions.fetch(session.id).await?;
                if current.status.is_terminal() {
                    return Err(UploadError::SessionClosed {
                        id: current.id,
                        status: current.status,
                    });
                }
            }
        }

        self.sessions
            .authorize_part(session.id, req.part_number, req.byte_range)
            .await?;
        let url = self.store.sign_part(
            &session.object_key,
            upload_id,
            req.part_number as u32,
            self.url_ttl,
        )?;
        debug!(
            session_id = %session.id,
            part_number = req.part_number,
            "authorized part"
        );
        Ok(url)
    }

    /// Single-shot upload: one session and one capability URL for the whole
    /// object. No catalog entry is written here; that waits for a confirmed
    /// store write (see `CompletionCoordinator::confirm_single_shot`).
    pub async fn initiate_single_shot(
        &self,
        principal: &Principal,
        req: &SingleShotRequest,
    ) -> UploadResult<(UploadSession, SignedUrl)> {
        self.validate_declaration(&req.content_type, &req.checksum)?;
        if req.size <= 0 {
            return Err(UploadError::EmptyPayload);
        }

        let object_key = object_key_for(principal, &req.content_type);
        let now = Utc::now();
        // Issuing the URL is the authorization, so the session starts IN_PROGRESS.
        let session = UploadSession {
            id: Uuid::new_v4(),
            object_key,
            owner_id: principal.owner_id.clone(),
            content_type: req.content_type.clone(),
            declared_checksum: req.checksum.clone(),
            kind: UploadKind::SingleShot,
            store_upload_id: None,
            expected_parts: None,
            declared_size: Some(req.size),
            status: SessionStatus::InProgress,
            created_at: now,
            updated_at: now,
        };
        self.sessions.insert(&session).await?;
        let url = self.store.sign_put(&session.object_key, self.url_ttl)?;

        info!(
            session_id = %session.id,
            object_key = %session.object_key,
            owner_id = %session.owner_id,
            "initiated single-shot upload"
        );
        Ok((session, url))
    }

    /// Explicit abort. Idempotent on an already aborted session.
    pub async fn abort_upload(
        &self,
        principal: &Principal,
        session_id: Uuid,
    ) -> UploadResult<UploadSession> {
        let session = fetch_owned(&self.sessions, principal, session_id).await?;
        match session.status {
            SessionStatus::Aborted => return Ok(session),
            SessionStatus::Completed => {
                return Err(UploadError::SessionClosed {
                    id: session.id,
                    status: session.status,
                });
            }
            _ => {}
        }

        abort_session(&self.sessions, self.store.as_ref(), &session, "client abort").await?;
        let current = self.sessions.fetch(session_id).await?;
        if current.status != SessionStatus::Aborted {
            // Completed concurrently.
            return Err(UploadError::SessionClosed {
                id: current.id,
                status: current.status,
            });
        }
        Ok(current)
    }

    pub async fn session_view(
        &self,
        principal: &Principal,
        session_id: Uuid,
    ) -> UploadResult<SessionView> {
        let session = fetch_owned(&self.sessions, principal, session_id).await?;
        let parts = self.sessions.list_parts(session_id).await?;
        Ok(SessionView { session, parts })
    }

    /// Content type and checksum checks shared by both initiation paths.
    /// Runs before any store or database access.
    fn validate_declaration(&self, content_type: &str, checksum: &str) -> UploadResult<()> {
        if !self.policy.accepts(content_type) {
            return Err(UploadError::UnsupportedMediaType(content_type.to_string()));
        }
        let digest = general_purpose::STANDARD
            .decode(checksum)
            .map_err(|_| UploadError::InvalidRequest("checksum must be base64".into()))?;
        if digest.len() != SHA256_LEN {
            return Err(UploadError::InvalidRequest(
                "checksum must be a SHA-256 digest".into(),
            ));
        }
        Ok(())
    }
}

/// `videos/{owner}/{uuid}.{ext}`, with the owner id reduced to a path-safe slug.
fn object_key_for(principal: &Principal, content_type: &str) -> String {
    let slug: String = principal
        .owner_id
        .chars()
        .take(64)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "videos/{}/{}.{}",
        slug,
        Uuid::new_v4(),
        UploadPolicy::extension_for(content_type)
    )
}
