//! Part upload workers.
//!
//! A fixed pool of `workers` transfers drains one shared queue of every
//! planned part, so a slow part only occupies its own slot. Each transfer
//! asks the service for a part URL, PUTs the byte range and keeps the
//! returned completion token. The first part that fails for good stops
//! dispatch and drops every in-flight transfer.

use futures::{StreamExt, stream};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    error::ClientError,
    payload::Payload,
    planner::{PartPlan, PlannedPart},
    retry::RetryPolicy,
    transport::{PartTransport, UploadApi},
};
use crate::models::{api::AuthorizePartRequest, multipart::CompletedPart};

/// Snapshot handed to a [`ProgressCallback`] after each finished part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub completed_parts: u32,
    pub total_parts: u32,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
}

pub trait ProgressCallback: Send + Sync {
    /// Return `false` to cancel the upload.
    fn on_progress(&self, progress: &UploadProgress) -> bool;
}

/// A progress callback that always continues.
pub struct NoOpProgress;

impl ProgressCallback for NoOpProgress {
    fn on_progress(&self, _progress: &UploadProgress) -> bool {
        true
    }
}

impl<F> ProgressCallback for F
where
    F: Fn(&UploadProgress) -> bool + Send + Sync,
{
    fn on_progress(&self, progress: &UploadProgress) -> bool {
        self(progress)
    }
}

/// The session the parts belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub object_key: String,
}

pub struct PartUploader {
    api: Arc<dyn UploadApi>,
    transport: Arc<dyn PartTransport>,
    retry: RetryPolicy,
    workers: usize,
}

impl PartUploader {
    pub fn new(
        api: Arc<dyn UploadApi>,
        transport: Arc<dyn PartTransport>,
        retry: RetryPolicy,
        workers: usize,
    ) -> Self {
        Self {
            api,
            transport,
            retry,
            workers: workers.max(1),
        }
    }

    /// Upload every part of `plan` and return the completion tokens in
    /// ascending part order.
    ///
    /// Fails with `PartUploadFailed` for the first part that exhausts its
    /// retries or is refused by the service, and with `Cancelled` when
    /// `cancel` fires or `progress` asks to stop. Parts already stored are
    /// left to the caller's abort.
    pub async fn upload_all_parts(
        &self,
        session: &SessionHandle,
        payload: &Payload,
        plan: &PartPlan,
        cancel: &CancellationToken,
        progress: &dyn ProgressCallback,
    ) -> Result<Vec<CompletedPart>, ClientError> {
        let halt = cancel.child_token();
        let total_parts = plan.len() as u32;
        let total_bytes = plan.total_bytes();

        let mut transfers = stream::iter(plan.parts.iter().copied())
            .map(|part| {
                let halt = &halt;
                async move {
                    self.upload_part(session, payload, part, halt)
                        .await
                        .map(|token| (part, token))
                }
            })
            .buffer_unordered(self.workers);

        // Results arrive in completion order; this loop is their only writer.
        let mut completed: Vec<CompletedPart> = Vec::with_capacity(plan.len());
        let mut uploaded_bytes = 0u64;
        while let Some(outcome) = transfers.next().await {
            let (part, token) = match outcome {
                Ok(done) => done,
                Err(err) => {
                    halt.cancel();
                    if !matches!(err, ClientError::Cancelled) {
                        warn!(session_id = %session.session_id, error = %err, "part upload failed; stopping workers");
                    }
                    return Err(err);
                }
            };
            uploaded_bytes += part.range.len();
            completed.push(CompletedPart {
                part_number: part.part_number as i64,
                token,
            });

            let snapshot = UploadProgress {
                completed_parts: completed.len() as u32,
                total_parts,
                uploaded_bytes,
                total_bytes,
            };
            if !progress.on_progress(&snapshot) {
                halt.cancel();
                return Err(ClientError::Cancelled);
            }
        }

        completed.sort_by_key(|p| p.part_number);
        info!(
            session_id = %session.session_id,
            parts = completed.len(),
            bytes = uploaded_bytes,
            "all parts uploaded"
        );
        Ok(completed)
    }

    async fn upload_part(
        &self,
        session: &SessionHandle,
        payload: &Payload,
        part: PlannedPart,
        halt: &CancellationToken,
    ) -> Result<String, ClientError> {
        if halt.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let failed = |cause: ClientError| match cause {
            ClientError::Cancelled => ClientError::Cancelled,
            cause => ClientError::PartUploadFailed {
                part_number: part.part_number,
                cause: Box::new(cause),
            },
        };

        let body = payload.read_range(part.range).await.map_err(|e| failed(e.into()))?;
        self.retry
            .run(halt, |attempt| {
                let body = body.clone();
                async move {
                    // A fresh URL per attempt; re-authorizing a part is idempotent
                    // and the last successful write wins.
                    let signed = self
                        .api
                        .authorize_part(&AuthorizePartRequest {
                            session_id: session.session_id,
                            object_key: session.object_key.clone(),
                            part_number: part.part_number as i64,
                            byte_range: Some(part.range),
                        })
                        .await?;
                    debug!(part_number = part.part_number, attempt, bytes = body.len(), "transferring part");
                    self.transport.put(&signed.url, None, body).await
                }
            })
            .await
            .map_err(failed)
    }
}
