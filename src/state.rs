//! Shared router state.

use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};

use crate::{
    config::AppConfig,
    identity::IdentityProvider,
    services::{
        authority::UploadAuthority, catalog::Catalog, coordinator::CompletionCoordinator,
        reaper::SessionReaper, session_repo::SessionRepo,
    },
    store::{LocalObjectStore, ObjectStore},
};

/// Everything a handler may need. The store client is constructed once by
/// the binary and injected here; services see it only as `dyn ObjectStore`.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub store: Arc<LocalObjectStore>,
    pub sessions: SessionRepo,
    pub catalog: Catalog,
    pub authority: UploadAuthority,
    pub coordinator: CompletionCoordinator,
    pub identity: Arc<dyn IdentityProvider>,
    pub read_url_ttl: Duration,
}

impl AppState {
    pub fn new(
        db: Arc<SqlitePool>,
        store: Arc<LocalObjectStore>,
        identity: Arc<dyn IdentityProvider>,
        cfg: &AppConfig,
    ) -> Self {
        let object_store: Arc<dyn ObjectStore> = store.clone();
        let policy = Arc::new(cfg.policy.clone());
        let sessions = SessionRepo::new(db.clone());
        let catalog = Catalog::new(db.clone());

        let authority = UploadAuthority::new(
            sessions.clone(),
            object_store.clone(),
            policy.clone(),
            cfg.part_url_ttl,
        );
        let coordinator = CompletionCoordinator::new(
            db.clone(),
            sessions.clone(),
            catalog.clone(),
            object_store,
            policy.max_parts,
        );

        Self {
            db,
            store,
            sessions,
            catalog,
            authority,
            coordinator,
            identity,
            read_url_ttl: cfg.read_url_ttl,
        }
    }

    pub fn reaper(&self, cfg: &AppConfig) -> SessionReaper {
        SessionReaper::new(
            self.sessions.clone(),
            self.store.clone(),
            cfg.session_ttl,
            cfg.reap_interval,
        )
    }
}
