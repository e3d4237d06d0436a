//! End-to-end upload of one payload.
//!
//! Validation, checksumming and planning happen before the first request.
//! Once the service has opened a session, any failure or cancellation
//! aborts it so the store can drop whatever bytes were already sent.

use std::{future::Future, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    error::ClientError,
    payload::Payload,
    planner::{self, PartPlan, PreparedUpload, Strategy},
    state::SharedTracker,
    transport::{PartTransport, UploadApi},
    workers::{PartUploader, SessionHandle},
};
use crate::{
    config::UploadPolicy,
    models::api::{
        CompleteUploadRequest, CompleteUploadResponse, ConfirmUploadRequest,
        InitiateUploadRequest, SingleShotRequest,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub session_id: Uuid,
    pub object_key: String,
    pub catalog_entry_id: Uuid,
    pub strategy: Strategy,
}

pub struct Uploader {
    api: Arc<dyn UploadApi>,
    transport: Arc<dyn PartTransport>,
    policy: UploadPolicy,
}

impl Uploader {
    pub fn new(api: Arc<dyn UploadApi>, transport: Arc<dyn PartTransport>, policy: UploadPolicy) -> Self {
        Self {
            api,
            transport,
            policy,
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Upload `payload` and return the catalog entry it produced.
    ///
    /// A tracker left `Failed` or `Cancelled` by an earlier attempt is reset;
    /// the retry runs in a new session.
    pub async fn upload(
        &self,
        payload: &Payload,
        content_type: &str,
        cancel: &CancellationToken,
        tracker: &SharedTracker,
    ) -> Result<UploadOutcome, ClientError> {
        tracker.update(|t| {
            if t.can_retry() {
                t.reset()?;
            }
            t.begin()
        })?;

        match self.run(payload, content_type, cancel, tracker).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                tracker.update(|t| t.failed(&err));
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        payload: &Payload,
        content_type: &str,
        cancel: &CancellationToken,
        tracker: &SharedTracker,
    ) -> Result<UploadOutcome, ClientError> {
        let prepared = planner::prepare(&self.policy, payload, content_type).await?;
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        match &prepared.plan {
            Some(plan) => self.multipart(&prepared, plan, payload, cancel, tracker).await,
            None => self.single_shot(&prepared, payload, cancel, tracker).await,
        }
    }

    async fn multipart(
        &self,
        prepared: &PreparedUpload,
        plan: &PartPlan,
        payload: &Payload,
        cancel: &CancellationToken,
        tracker: &SharedTracker,
    ) -> Result<UploadOutcome, ClientError> {
        let started = cancellable(
            cancel,
            self.api.initiate(&InitiateUploadRequest {
                content_type: prepared.content_type.clone(),
                checksum: prepared.checksum.clone(),
                total_size: Some(prepared.total_size as i64),
                part_count: Some(plan.len() as i64),
            }),
        )
        .await?;
        let session = SessionHandle {
            session_id: started.session_id,
            object_key: started.object_key,
        };
        info!(
            session_id = %session.session_id,
            object_key = %session.object_key,
            parts = plan.len(),
            chunk_size = plan.chunk_size,
            "multipart upload started"
        );

        let settled = async {
            tracker.update(|t| {
                t.session_started(
                    session.session_id,
                    session.object_key.as_str(),
                    plan.len() as u32,
                    prepared.total_size,
                )
            })?;
            let workers = PartUploader::new(
                self.api.clone(),
                self.transport.clone(),
                self.policy.retry,
                self.policy.workers,
            );
            let parts = workers
                .upload_all_parts(&session, payload, plan, cancel, tracker)
                .await?;

            tracker.update(|t| t.completing())?;
            let request = CompleteUploadRequest {
                session_id: session.session_id,
                object_key: session.object_key.clone(),
                parts,
            };
            self.policy
                .retry
                .run_if(cancel, lost_in_transit, |_| self.api.complete(&request))
                .await
        }
        .await;

        self.settle(&session, Strategy::Multipart, settled, tracker)
            .await
    }

    async fn single_shot(
        &self,
        prepared: &PreparedUpload,
        payload: &Payload,
        cancel: &CancellationToken,
        tracker: &SharedTracker,
    ) -> Result<UploadOutcome, ClientError> {
        let started = cancellable(
            cancel,
            self.api.initiate_single_shot(&SingleShotRequest {
                content_type: prepared.content_type.clone(),
                checksum: prepared.checksum.clone(),
                size: prepared.total_size as i64,
            }),
        )
        .await?;
        let session = SessionHandle {
            session_id: started.session_id,
            object_key: started.object_key,
        };
        info!(session_id = %session.session_id, object_key = %session.object_key, "single-shot upload started");

        let settled = async {
            tracker.update(|t| {
                t.session_started(
                    session.session_id,
                    session.object_key.as_str(),
                    1,
                    prepared.total_size,
                )
            })?;
            let body = payload.read_all().await?;
            let retry = self.policy.retry;
            retry
                .run(cancel, |_| {
                    self.transport
                        .put(&started.url, Some(prepared.content_type.as_str()), body.clone())
                })
                .await?;
            tracker.update(|t| {
                t.record_progress(1, prepared.total_size);
                t.completing()
            })?;

            let request = ConfirmUploadRequest {
                session_id: session.session_id,
                object_key: session.object_key.clone(),
            };
            retry
                .run_if(cancel, lost_in_transit, |_| self.api.confirm(&request))
                .await
        }
        .await;

        self.settle(&session, Strategy::SingleShot, settled, tracker)
            .await
    }

    async fn settle(
        &self,
        session: &SessionHandle,
        strategy: Strategy,
        settled: Result<CompleteUploadResponse, ClientError>,
        tracker: &SharedTracker,
    ) -> Result<UploadOutcome, ClientError> {
        match settled {
            Ok(done) => {
                tracker.update(|t| t.completed(done.catalog_entry_id))?;
                info!(
                    session_id = %session.session_id,
                    catalog_entry_id = %done.catalog_entry_id,
                    "upload completed"
                );
                Ok(UploadOutcome {
                    session_id: session.session_id,
                    object_key: done.object_key,
                    catalog_entry_id: done.catalog_entry_id,
                    strategy,
                })
            }
            Err(err) => {
                self.abort_quietly(session.session_id).await;
                Err(err)
            }
        }
    }

    async fn abort_quietly(&self, session_id: Uuid) {
        match self.api.abort(session_id).await {
            Ok(()) => info!(%session_id, "upload session aborted"),
            Err(err) => warn!(%session_id, error = %err, "failed to abort upload session"),
        }
    }
}

/// Settlement is idempotent on the service side, so a request that may never
/// have arrived is safe to repeat. A settlement the service answered, even
/// with a 5xx, has already moved the session and is final.
fn lost_in_transit(err: &ClientError) -> bool {
    matches!(err, ClientError::Transport(_))
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    request: impl Future<Output = Result<T, ClientError>>,
) -> Result<T, ClientError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ClientError::Cancelled),
        result = request => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::{retry::RetryPolicy, state::UploadPhase},
        models::api::{
            AuthorizePartRequest, AuthorizePartResponse, InitiateUploadResponse,
            SingleShotResponse,
        },
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use std::{
        collections::BTreeMap,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    /// In-memory upload service and store in one.
    #[derive(Default)]
    struct SimService {
        failing_part: Option<u32>,
        failing_object_put: bool,
        failing_finalize: bool,
        initiated: AtomicUsize,
        completions: Mutex<Vec<CompleteUploadRequest>>,
        confirms: AtomicUsize,
        aborted: Mutex<Vec<Uuid>>,
        stored: Mutex<BTreeMap<u32, usize>>,
        object: Mutex<Option<(String, usize)>>,
    }

    impl SimService {
        fn completions(&self) -> usize {
            self.completions.lock().unwrap().len()
        }

        fn aborted(&self) -> Vec<Uuid> {
            self.aborted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UploadApi for SimService {
        async fn initiate(&self, req: &InitiateUploadRequest) -> Result<InitiateUploadResponse, ClientError> {
            self.initiated.fetch_add(1, Ordering::SeqCst);
            assert!(req.part_count.unwrap() > 0);
            Ok(InitiateUploadResponse {
                session_id: Uuid::new_v4(),
                object_key: "videos/alice/clip.webm".into(),
            })
        }

        async fn authorize_part(
            &self,
            req: &AuthorizePartRequest,
        ) -> Result<AuthorizePartResponse, ClientError> {
            Ok(AuthorizePartResponse {
                url: format!("sim://part/{}", req.part_number),
                expires_at: Utc::now(),
            })
        }

        async fn complete(&self, req: &CompleteUploadRequest) -> Result<CompleteUploadResponse, ClientError> {
            self.completions.lock().unwrap().push(req.clone());
            if self.failing_finalize {
                return Err(ClientError::Rejected {
                    status: 502,
                    code: "FINALIZATION_FAILED".into(),
                    message: "store could not finalize".into(),
                });
            }
            Ok(CompleteUploadResponse {
                catalog_entry_id: Uuid::new_v4(),
                object_key: req.object_key.clone(),
            })
        }

        async fn initiate_single_shot(
            &self,
            req: &SingleShotRequest,
        ) -> Result<SingleShotResponse, ClientError> {
            self.initiated.fetch_add(1, Ordering::SeqCst);
            assert!(req.size > 0);
            Ok(SingleShotResponse {
                session_id: Uuid::new_v4(),
                object_key: "videos/alice/short.webm".into(),
                url: "sim://object".into(),
                expires_at: Utc::now(),
            })
        }

        async fn confirm(&self, req: &ConfirmUploadRequest) -> Result<CompleteUploadResponse, ClientError> {
            self.confirms.fetch_add(1, Ordering::SeqCst);
            if self.object.lock().unwrap().is_none() {
                return Err(ClientError::Rejected {
                    status: 404,
                    code: "OBJECT_MISSING".into(),
                    message: "nothing stored".into(),
                });
            }
            Ok(CompleteUploadResponse {
                catalog_entry_id: Uuid::new_v4(),
                object_key: req.object_key.clone(),
            })
        }

        async fn abort(&self, session_id: Uuid) -> Result<(), ClientError> {
            self.aborted.lock().unwrap().push(session_id);
            Ok(())
        }
    }

    #[async_trait]
    impl PartTransport for SimService {
        async fn put(&self, url: &str, content_type: Option<&str>, body: Bytes) -> Result<String, ClientError> {
            if url == "sim://object" {
                if self.failing_object_put {
                    return Err(ClientError::Transport("connection reset".into()));
                }
                let content_type = content_type.unwrap_or_default().to_string();
                *self.object.lock().unwrap() = Some((content_type, body.len()));
                return Ok("object".into());
            }
            let part_number: u32 = url.rsplit('/').next().unwrap().parse().unwrap();
            if self.failing_part == Some(part_number) {
                return Err(ClientError::Transport("connection reset".into()));
            }
            self.stored.lock().unwrap().insert(part_number, body.len());
            Ok(format!("etag-{part_number}"))
        }
    }

    fn policy() -> UploadPolicy {
        UploadPolicy::default()
            .with_threshold(100)
            .with_min_part_size(1)
            .with_tiers(vec![], 100)
            .with_workers(2)
            .with_retry(RetryPolicy {
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                multiplier: 2.0,
            })
    }

    fn uploader(sim: &Arc<SimService>) -> Uploader {
        Uploader::new(sim.clone(), sim.clone(), policy())
    }

    #[tokio::test]
    async fn multipart_upload_completes_with_every_token_in_order() {
        let sim = Arc::new(SimService::default());
        let tracker = SharedTracker::new();
        let payload = Payload::from_bytes(vec![7u8; 450]);

        let outcome = uploader(&sim)
            .upload(&payload, "video/webm", &CancellationToken::new(), &tracker)
            .await
            .unwrap();

        assert_eq!(outcome.strategy, Strategy::Multipart);
        let completions = sim.completions.lock().unwrap();
        assert_eq!(completions.len(), 1);
        let numbers: Vec<i64> = completions[0].parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert_eq!(sim.stored.lock().unwrap().get(&5), Some(&50));
        assert!(sim.aborted().is_empty());

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.phase(), UploadPhase::Completed);
        assert_eq!(snapshot.catalog_entry_id(), Some(outcome.catalog_entry_id));
        assert_eq!(snapshot.progress_percent(), 100);
    }

    #[tokio::test]
    async fn failed_part_aborts_without_completing() {
        let sim = Arc::new(SimService {
            failing_part: Some(3),
            ..SimService::default()
        });
        let tracker = SharedTracker::new();
        let payload = Payload::from_bytes(vec![1u8; 500]);

        let err = uploader(&sim)
            .upload(&payload, "video/webm", &CancellationToken::new(), &tracker)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::PartUploadFailed { part_number: 3, .. }));
        assert_eq!(sim.completions(), 0);
        let snapshot = tracker.snapshot();
        assert_eq!(sim.aborted(), vec![snapshot.session_id().unwrap()]);
        assert_eq!(snapshot.phase(), UploadPhase::Failed);
        assert!(snapshot.can_retry());
    }

    #[tokio::test]
    async fn finalize_failure_reaches_the_caller_unchanged() {
        let sim = Arc::new(SimService {
            failing_finalize: true,
            ..SimService::default()
        });
        let tracker = SharedTracker::new();

        let err = uploader(&sim)
            .upload(
                &Payload::from_bytes(vec![2u8; 300]),
                "video/webm",
                &CancellationToken::new(),
                &tracker,
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), Some("FINALIZATION_FAILED"));
        assert_eq!(sim.completions(), 1);
        assert_eq!(sim.aborted().len(), 1);
        assert_eq!(tracker.snapshot().phase(), UploadPhase::Failed);
    }

    #[tokio::test]
    async fn single_shot_puts_then_confirms() {
        let sim = Arc::new(SimService::default());
        let tracker = SharedTracker::new();
        let payload = Payload::from_bytes(vec![3u8; 80]);

        let outcome = uploader(&sim)
            .upload(&payload, "video/mp4", &CancellationToken::new(), &tracker)
            .await
            .unwrap();

        assert_eq!(outcome.strategy, Strategy::SingleShot);
        assert_eq!(
            *sim.object.lock().unwrap(),
            Some(("video/mp4".to_string(), 80))
        );
        assert_eq!(sim.confirms.load(Ordering::SeqCst), 1);
        assert!(sim.stored.lock().unwrap().is_empty());
        assert_eq!(tracker.snapshot().phase(), UploadPhase::Completed);
    }

    #[tokio::test]
    async fn failed_single_shot_put_never_confirms() {
        let sim = Arc::new(SimService {
            failing_object_put: true,
            ..SimService::default()
        });
        let tracker = SharedTracker::new();
        let payload = Payload::from_bytes(vec![3u8; 80]);

        let err = uploader(&sim)
            .upload(&payload, "video/webm", &CancellationToken::new(), &tracker)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Transport(_)));
        assert_eq!(sim.confirms.load(Ordering::SeqCst), 0);
        assert_eq!(sim.aborted().len(), 1);
        assert_eq!(tracker.snapshot().phase(), UploadPhase::Failed);
    }

    #[tokio::test]
    async fn invalid_payloads_fail_before_any_request() {
        let sim = Arc::new(SimService::default());
        let tracker = SharedTracker::new();

        let err = uploader(&sim)
            .upload(
                &Payload::from_bytes(vec![0u8; 10]),
                "image/png",
                &CancellationToken::new(),
                &tracker,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::UnsupportedMediaType(_)));

        let err = uploader(&sim)
            .upload(
                &Payload::from_bytes(Vec::new()),
                "video/webm",
                &CancellationToken::new(),
                &tracker,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::EmptyPayload));

        assert_eq!(sim.initiated.load(Ordering::SeqCst), 0);
        assert!(sim.aborted().is_empty());
        assert_eq!(tracker.snapshot().phase(), UploadPhase::Failed);
    }

    #[tokio::test]
    async fn cancelled_before_start_opens_no_session() {
        let sim = Arc::new(SimService::default());
        let tracker = SharedTracker::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = uploader(&sim)
            .upload(&Payload::from_bytes(vec![0u8; 300]), "video/webm", &cancel, &tracker)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Cancelled));
        assert_eq!(sim.initiated.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.snapshot().phase(), UploadPhase::Cancelled);
    }

    #[tokio::test]
    async fn retry_after_failure_starts_a_new_session() {
        let failing = Arc::new(SimService {
            failing_part: Some(2),
            ..SimService::default()
        });
        let tracker = SharedTracker::new();
        let payload = Payload::from_bytes(vec![9u8; 250]);
        uploader(&failing)
            .upload(&payload, "video/webm", &CancellationToken::new(), &tracker)
            .await
            .unwrap_err();
        let first_session = tracker.snapshot().session_id().unwrap();

        let healthy = Arc::new(SimService::default());
        let outcome = uploader(&healthy)
            .upload(&payload, "video/webm", &CancellationToken::new(), &tracker)
            .await
            .unwrap();

        assert_ne!(outcome.session_id, first_session);
        assert_eq!(tracker.snapshot().phase(), UploadPhase::Completed);
    }
}
