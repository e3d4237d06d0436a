//! SQLite persistence for upload sessions and their part records.
//!
//! Status changes are compare-and-swap updates: the `WHERE` clause names the
//! status the caller observed, and `rows_affected()` tells whether this caller
//! won. Concurrent `AuthorizePart` calls of one session rely on this.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    errors::{UploadError, UploadResult},
    models::{
        multipart::{ByteRange, PartRecord},
        session::{SessionStatus, UploadSession},
    },
};

#[derive(Clone)]
pub struct SessionRepo {
    pub(crate) db: Arc<SqlitePool>,
}

impl SessionRepo {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn insert(&self, session: &UploadSession) -> UploadResult<()> {
        sqlx::query(
            "INSERT INTO upload_sessions (
                id, object_key, owner_id, content_type, declared_checksum, kind,
                store_upload_id, expected_parts, declared_size, status, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id)
        .bind(&session.object_key)
        .bind(&session.owner_id)
        .bind(&session.content_type)
        .bind(&session.declared_checksum)
        .bind(session.kind)
        .bind(&session.store_upload_id)
        .bind(session.expected_parts)
        .bind(session.declared_size)
        .bind(session.status)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Fetch a session by id. Returns SessionNotFound if missing.
    pub async fn fetch(&self, id: Uuid) -> UploadResult<UploadSession> {
        sqlx::query_as::<_, UploadSession>(
            "SELECT id, object_key, owner_id, content_type, declared_checksum, kind,
                    store_upload_id, expected_parts, declared_size, status, created_at, updated_at
             FROM upload_sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(UploadError::SessionNotFound(id))
    }

    pub async fn find_by_object_key(&self, object_key: &str) -> UploadResult<Option<UploadSession>> {
        let session = sqlx::query_as::<_, UploadSession>(
            "SELECT id, object_key, owner_id, content_type, declared_checksum, kind,
                    store_upload_id, expected_parts, declared_size, status, created_at, updated_at
             FROM upload_sessions WHERE object_key = ?",
        )
        .bind(object_key)
        .fetch_optional(&*self.db)
        .await?;
        Ok(session)
    }

    /// Move `id` from `from` to `to` if it is still in `from`.
    ///
    /// Returns `Ok(false)` when another caller changed the status first, or
    /// when `from -> to` is not a legal transition.
    pub async fn transition(
        &self,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
    ) -> UploadResult<bool> {
        let mut conn = self.db.acquire().await?;
        Ok(Self::transition_in(&mut *conn, id, from, to).await?)
    }

    pub(crate) async fn transition_in(
        conn: &mut SqliteConnection,
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<bool, sqlx::Error> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE upload_sessions SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(to)
        .bind(Utc::now())
        .bind(id)
        .bind(from)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Move a session from whichever non-terminal state it is in to
    /// COMPLETED. Returns `Ok(false)` if it was already terminal.
    pub(crate) async fn complete_in(conn: &mut SqliteConnection, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE upload_sessions SET status = ?, updated_at = ?
             WHERE id = ? AND status IN (?, ?)",
        )
        .bind(SessionStatus::Completed)
        .bind(Utc::now())
        .bind(id)
        .bind(SessionStatus::Initiated)
        .bind(SessionStatus::InProgress)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Create or refresh the placeholder for an authorized part.
    ///
    /// Re-authorizing keeps any completion token already recorded; a later
    /// successful transfer overwrites it.
    pub async fn authorize_part(
        &self,
        session_id: Uuid,
        part_number: i64,
        range: Option<ByteRange>,
    ) -> UploadResult<()> {
        sqlx::query(
            "INSERT INTO upload_parts (session_id, part_number, range_start, range_end, authorized_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(session_id, part_number) DO UPDATE SET
                range_start = COALESCE(excluded.range_start, upload_parts.range_start),
                range_end = COALESCE(excluded.range_end, upload_parts.range_end),
                authorized_at = excluded.authorized_at",
        )
        .bind(session_id)
        .bind(part_number)
        .bind(range.map(|r| r.start as i64))
        .bind(range.map(|r| r.end as i64))
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Record the token the store issued for a transferred part.
    pub async fn record_part_completion(
        &self,
        session_id: Uuid,
        part_number: i64,
        token: &str,
    ) -> UploadResult<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO upload_parts (session_id, part_number, completion_token, authorized_at, completed_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(session_id, part_number) DO UPDATE SET
                completion_token = excluded.completion_token,
                completed_at = excluded.completed_at",
        )
        .bind(session_id)
        .bind(part_number)
        .bind(token)
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn list_parts(&self, session_id: Uuid) -> UploadResult<Vec<PartRecord>> {
        let parts = sqlx::query_as::<_, PartRecord>(
            "SELECT session_id, part_number, range_start, range_end, completion_token,
                    authorized_at, completed_at
             FROM upload_parts WHERE session_id = ? ORDER BY part_number ASC",
        )
        .bind(session_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(parts)
    }

    /// Non-terminal sessions created before `cutoff`, oldest first.
    pub async fn list_expired(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> UploadResult<Vec<UploadSession>> {
        let sessions = sqlx::query_as::<_, UploadSession>(
            "SELECT id, object_key, owner_id, content_type, declared_checksum, kind,
                    store_upload_id, expected_parts, declared_size, status, created_at, updated_at
             FROM upload_sessions
             WHERE status IN (?, ?) AND created_at < ?
             ORDER BY created_at ASC LIMIT ?",
        )
        .bind(SessionStatus::Initiated)
        .bind(SessionStatus::InProgress)
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&*self.db)
        .await?;
        Ok(sessions)
    }
}
