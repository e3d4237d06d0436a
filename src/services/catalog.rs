//! Catalog store: persisted records of durably finalized objects.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;

use crate::{errors::UploadResult, models::catalog::CatalogEntry};

#[derive(Clone)]
pub struct Catalog {
    db: Arc<SqlitePool>,
}

impl Catalog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert an entry inside the caller's transaction.
    ///
    /// Only the completion coordinator calls this, after the store confirmed
    /// the object and in the same transaction that marks the session
    /// COMPLETED.
    pub(crate) async fn create_in(
        conn: &mut SqliteConnection,
        owner_id: &str,
        object_key: &str,
        session_id: Uuid,
    ) -> Result<CatalogEntry, sqlx::Error> {
        sqlx::query_as::<_, CatalogEntry>(
            "INSERT INTO catalog_entries (id, owner_id, object_key, session_id, created_at)
             VALUES (?, ?, ?, ?, ?)
             RETURNING id, owner_id, object_key, session_id, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(object_key)
        .bind(session_id)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
    }

    pub async fn find_by_object_key(&self, object_key: &str) -> UploadResult<Option<CatalogEntry>> {
        let entry = sqlx::query_as::<_, CatalogEntry>(
            "SELECT id, owner_id, object_key, session_id, created_at
             FROM catalog_entries WHERE object_key = ?",
        )
        .bind(object_key)
        .fetch_optional(&*self.db)
        .await?;
        Ok(entry)
    }

    /// Entries owned by `owner_id`, newest first.
    pub async fn list(&self, owner_id: &str) -> UploadResult<Vec<CatalogEntry>> {
        let entries = sqlx::query_as::<_, CatalogEntry>(
            "SELECT id, owner_id, object_key, session_id, created_at
             FROM catalog_entries WHERE owner_id = ? ORDER BY created_at DESC",
        )
        .bind(owner_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn entries_are_unique_per_object_key() {
        let pool = Arc::new(db::memory_pool().await.unwrap());
        let catalog = Catalog::new(pool.clone());

        let mut conn = pool.acquire().await.unwrap();
        let entry = Catalog::create_in(&mut *conn, "alice", "videos/alice/a.webm", Uuid::new_v4())
            .await
            .unwrap();
        let dup = Catalog::create_in(&mut *conn, "alice", "videos/alice/a.webm", Uuid::new_v4()).await;
        assert!(dup.is_err());
        drop(conn);

        let found = catalog
            .find_by_object_key("videos/alice/a.webm")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, entry);
        assert_eq!(catalog.list("alice").await.unwrap().len(), 1);
        assert!(catalog.list("bob").await.unwrap().is_empty());
    }
}
