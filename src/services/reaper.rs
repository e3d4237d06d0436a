//! Background reaping of abandoned upload sessions.

use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{abort_session, session_repo::SessionRepo};
use crate::{errors::UploadResult, models::session::UploadKind, store::ObjectStore};

const REAP_BATCH: i64 = 100;

/// Aborts sessions still open `ttl` after creation, along with their
/// store-side multipart state.
#[derive(Clone)]
pub struct SessionReaper {
    sessions: SessionRepo,
    store: Arc<dyn ObjectStore>,
    ttl: Duration,
    interval: Duration,
}

impl SessionReaper {
    pub fn new(
        sessions: SessionRepo,
        store: Arc<dyn ObjectStore>,
        ttl: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            sessions,
            store,
            ttl,
            interval,
        }
    }

    /// One sweep. Returns how many sessions this call aborted.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> UploadResult<usize> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(ttl).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut reaped = 0;
        loop {
            let expired = self.sessions.list_expired(cutoff, REAP_BATCH).await?;
            if expired.is_empty() {
                break;
            }
            let batch_len = expired.len();
            let mut progressed = false;
            for session in expired {
                if !abort_session(&self.sessions, self.store.as_ref(), &session, "expired").await? {
                    continue;
                }
                progressed = true;
                reaped += 1;
                // A single-shot object that landed but was never confirmed
                // has no session left to commit it.
                if session.kind == UploadKind::SingleShot {
                    if let Err(err) = self.store.delete_object(&session.object_key).await {
                        warn!(object_key = %session.object_key, error = %err, "failed to delete unconfirmed object");
                    }
                }
            }
            if !progressed || (batch_len as i64) < REAP_BATCH {
                break;
            }
        }
        if reaped > 0 {
            info!(reaped, "reaped expired upload sessions");
        }
        Ok(reaped)
    }

    /// Run sweeps every `interval` until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.reap_expired(Utc::now()).await {
                            warn!(error = %err, "session reaping failed");
                        }
                    }
                }
            }
        })
    }
}
