//! End-to-end upload flows against a real server on an ephemeral port.

use async_trait::async_trait;
use bytes::Bytes;
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use media_ingest::{
    client::{
        ClientError, Payload, Uploader,
        checksum::sha256_base64,
        planner::Strategy,
        retry::RetryPolicy,
        state::{SharedTracker, UploadPhase},
        transport::{HttpUploadClient, PartTransport, UploadApi},
    },
    config::{AppConfig, UploadPolicy},
    db,
    identity::JwtIdentity,
    models::{
        api::{
            AuthorizePartRequest, CompleteUploadRequest, ConfirmUploadRequest,
            InitiateUploadRequest, SingleShotRequest,
        },
        multipart::{ByteRange, CompletedPart},
        session::SessionStatus,
    },
    state::AppState,
    store::{LocalObjectStore, UrlSigner},
};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

struct TestServer {
    base_url: String,
    identity: Arc<JwtIdentity>,
    policy: UploadPolicy,
    server: JoinHandle<()>,
    _dir: TempDir,
}

impl TestServer {
    async fn start(policy: UploadPolicy) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let storage_dir = dir.path().join("objects");
        std::fs::create_dir_all(&storage_dir).unwrap();
        let cfg = AppConfig {
            storage_dir: storage_dir.display().to_string(),
            database_url: format!("sqlite://{}", dir.path().join("meta.db").display()),
            public_url: base_url.clone(),
            policy: policy.clone(),
            ..AppConfig::default()
        };

        let pool = db::connect(&cfg.database_url).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let store = Arc::new(LocalObjectStore::new(
            &cfg.storage_dir,
            UrlSigner::new(&cfg.signing_secret, base_url.clone()),
        ));
        let identity = Arc::new(JwtIdentity::new(&cfg.jwt_secret));
        let state = AppState::new(Arc::new(pool), store, identity.clone(), &cfg);
        let app = media_ingest::app(state);

        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            identity,
            policy,
            server,
            _dir: dir,
        }
    }

    fn token(&self, owner: &str) -> String {
        self.identity
            .issue(owner, Duration::from_secs(600))
            .unwrap()
    }

    fn client(&self, owner: &str) -> Arc<HttpUploadClient> {
        Arc::new(HttpUploadClient::new(&self.base_url, self.token(owner)))
    }

    fn uploader(&self, client: Arc<HttpUploadClient>) -> Uploader {
        Uploader::new(client.clone(), client, self.policy.clone())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        multiplier: 2.0,
    }
}

/// 64 KiB parts, single-shot up to 64 KiB.
fn small_policy() -> UploadPolicy {
    UploadPolicy::default()
        .with_threshold(64 * KIB)
        .with_tiers(vec![], 64 * KIB)
        .with_min_part_size(64 * KIB)
        .with_workers(3)
        .with_retry(fast_retry())
}

fn pattern(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Wraps the real transport and fails every PUT that matches `fails`.
struct FaultyTransport {
    inner: Arc<HttpUploadClient>,
    fails: fn(&str) -> bool,
}

#[async_trait]
impl PartTransport for FaultyTransport {
    async fn put(&self, url: &str, content_type: Option<&str>, body: Bytes) -> Result<String, ClientError> {
        if (self.fails)(url) {
            return Err(ClientError::Transport("connection reset by peer".into()));
        }
        self.inner.put(url, content_type, body).await
    }
}

/// Stores every part for real but reports a wrong token for part 1, so the
/// store refuses to assemble the object.
struct MislabelingTransport {
    inner: Arc<HttpUploadClient>,
}

#[async_trait]
impl PartTransport for MislabelingTransport {
    async fn put(&self, url: &str, content_type: Option<&str>, body: Bytes) -> Result<String, ClientError> {
        let token = self.inner.put(url, content_type, body).await?;
        if url.contains("partNumber=1&") {
            return Ok("0".repeat(token.len()));
        }
        Ok(token)
    }
}

#[tokio::test]
async fn large_payload_uploads_in_parts_and_lands_in_catalog() {
    let server = TestServer::start(UploadPolicy::default().with_retry(fast_retry())).await;
    let client = server.client("alice");
    let data = pattern(50 * MIB);
    let payload = Payload::from_bytes(data.clone());
    let tracker = SharedTracker::new();

    let outcome = server
        .uploader(client.clone())
        .upload(&payload, "video/webm", &CancellationToken::new(), &tracker)
        .await
        .unwrap();

    assert_eq!(outcome.strategy, Strategy::Multipart);
    let snapshot = tracker.snapshot();
    assert_eq!(snapshot.total_parts(), 2);
    assert_eq!(snapshot.phase(), UploadPhase::Completed);

    let view = client.session(outcome.session_id).await.unwrap();
    assert_eq!(view.session.status, SessionStatus::Completed);
    assert_eq!(view.parts.len(), 2);

    let videos = client.list_videos().await.unwrap();
    assert_eq!(videos.len(), 1);
    assert_eq!(videos[0].id, outcome.catalog_entry_id);
    assert_eq!(videos[0].object_key, outcome.object_key);

    let stored = reqwest::get(&videos[0].url).await.unwrap();
    assert!(stored.status().is_success());
    let body = stored.bytes().await.unwrap();
    assert_eq!(body.len(), data.len());
    assert!(body.as_ref() == data.as_slice());
}

#[tokio::test]
async fn small_payload_uploads_in_one_shot() {
    let server = TestServer::start(small_policy()).await;
    let client = server.client("alice");

    let outcome = server
        .uploader(client.clone())
        .upload(
            &Payload::from_bytes(pattern(40 * KIB)),
            "video/mp4",
            &CancellationToken::new(),
            &SharedTracker::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.strategy, Strategy::SingleShot);
    let videos = client.list_videos().await.unwrap();
    assert_eq!(videos.len(), 1);
    assert!(videos[0].object_key.ends_with(".mp4"));
}

#[tokio::test]
async fn failed_single_shot_leaves_no_catalog_entry() {
    let server = TestServer::start(small_policy()).await;
    let client = server.client("bob");
    let transport = Arc::new(FaultyTransport {
        inner: client.clone(),
        fails: |_| true,
    });
    let uploader = Uploader::new(client.clone(), transport, server.policy.clone());
    let tracker = SharedTracker::new();

    let err = uploader
        .upload(
            &Payload::from_bytes(pattern(10 * KIB)),
            "video/webm",
            &CancellationToken::new(),
            &tracker,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Transport(_)));
    assert_eq!(tracker.snapshot().phase(), UploadPhase::Failed);
    assert!(client.list_videos().await.unwrap().is_empty());

    let session_id = tracker.snapshot().session_id().unwrap();
    let view = client.session(session_id).await.unwrap();
    assert_eq!(view.session.status, SessionStatus::Aborted);
}

#[tokio::test]
async fn confirming_before_the_object_lands_is_refused() {
    let server = TestServer::start(small_policy()).await;
    let client = server.client("bob");
    let payload = Payload::from_bytes(pattern(10 * KIB));

    let started = client
        .initiate_single_shot(&SingleShotRequest {
            content_type: "video/webm".into(),
            checksum: sha256_base64(&payload).await.unwrap(),
            size: payload.len() as i64,
        })
        .await
        .unwrap();

    let err = client
        .confirm(&ConfirmUploadRequest {
            session_id: started.session_id,
            object_key: started.object_key.clone(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("OBJECT_MISSING"));
    assert!(client.list_videos().await.unwrap().is_empty());

    // The session stays open; a late PUT still completes it.
    client
        .put(&started.url, Some("video/webm"), payload.read_all().await.unwrap())
        .await
        .unwrap();
    let done = client
        .confirm(&ConfirmUploadRequest {
            session_id: started.session_id,
            object_key: started.object_key,
        })
        .await
        .unwrap();
    let videos = client.list_videos().await.unwrap();
    assert_eq!(videos.len(), 1);
    assert_eq!(videos[0].id, done.catalog_entry_id);
}

#[tokio::test]
async fn failing_part_aborts_the_session_without_completion() {
    let server = TestServer::start(small_policy()).await;
    let client = server.client("carol");
    let transport = Arc::new(FaultyTransport {
        inner: client.clone(),
        fails: |url| url.contains("partNumber=3&"),
    });
    let uploader = Uploader::new(client.clone(), transport, server.policy.clone());
    let tracker = SharedTracker::new();

    let err = uploader
        .upload(
            &Payload::from_bytes(pattern(5 * 64 * KIB)),
            "video/webm",
            &CancellationToken::new(),
            &tracker,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::PartUploadFailed { part_number: 3, .. }));
    let snapshot = tracker.snapshot();
    assert_eq!(snapshot.total_parts(), 5);
    assert!(snapshot.can_retry());

    let view = client.session(snapshot.session_id().unwrap()).await.unwrap();
    assert_eq!(view.session.status, SessionStatus::Aborted);
    assert!(client.list_videos().await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_part_authorizations_all_succeed() {
    let server = TestServer::start(small_policy()).await;
    let client = server.client("dave");
    let data = pattern(256 * KIB);
    let payload = Payload::from_bytes(data.clone());

    let started = client
        .initiate(&InitiateUploadRequest {
            content_type: "video/webm".into(),
            checksum: sha256_base64(&payload).await.unwrap(),
            total_size: Some(data.len() as i64),
            part_count: Some(4),
        })
        .await
        .unwrap();

    let requests: Vec<_> = (1..=4)
        .map(|n: u64| AuthorizePartRequest {
            session_id: started.session_id,
            object_key: started.object_key.clone(),
            part_number: n as i64,
            byte_range: Some(ByteRange::new((n - 1) * 64 * KIB, n * 64 * KIB)),
        })
        .collect();
    let results =
        futures::future::join_all(requests.iter().map(|req| client.authorize_part(req))).await;

    assert!(results.iter().all(Result::is_ok));
    let view = client.session(started.session_id).await.unwrap();
    assert_eq!(view.session.status, SessionStatus::InProgress);
    assert_eq!(view.parts.len(), 4);

    // Upload through the concurrently issued URLs, then complete with the
    // part list out of order.
    let puts = requests.iter().zip(&results).map(|(req, authorized)| {
        let client = client.clone();
        let payload = payload.clone();
        let url = authorized.as_ref().unwrap().url.clone();
        let range = req.byte_range.unwrap();
        let part_number = req.part_number;
        async move {
            let body = payload.read_range(range).await.unwrap();
            let token = client.put(&url, None, body).await.unwrap();
            CompletedPart { part_number, token }
        }
    });
    let mut parts = futures::future::join_all(puts).await;
    parts.reverse();

    let done = client
        .complete(&CompleteUploadRequest {
            session_id: started.session_id,
            object_key: started.object_key.clone(),
            parts,
        })
        .await
        .unwrap();

    let view = client.session(started.session_id).await.unwrap();
    assert_eq!(view.session.status, SessionStatus::Completed);
    let videos = client.list_videos().await.unwrap();
    assert_eq!(videos.len(), 1);
    assert_eq!(videos[0].id, done.catalog_entry_id);
    let stored = reqwest::get(&videos[0].url).await.unwrap().bytes().await.unwrap();
    assert!(stored.as_ref() == data.as_slice());
}

#[tokio::test]
async fn reauthorized_part_url_still_completes() {
    let server = TestServer::start(small_policy()).await;
    let client = server.client("erin");
    let data = pattern(100 * KIB);
    let payload = Payload::from_bytes(data.clone());
    let ranges = [ByteRange::new(0, 64 * KIB), ByteRange::new(64 * KIB, 100 * KIB)];

    let started = client
        .initiate(&InitiateUploadRequest {
            content_type: "video/webm".into(),
            checksum: sha256_base64(&payload).await.unwrap(),
            total_size: Some(data.len() as i64),
            part_count: Some(2),
        })
        .await
        .unwrap();

    let mut parts = Vec::new();
    for (i, range) in ranges.iter().enumerate() {
        let request = AuthorizePartRequest {
            session_id: started.session_id,
            object_key: started.object_key.clone(),
            part_number: i as i64 + 1,
            byte_range: Some(*range),
        };
        client.authorize_part(&request).await.unwrap();
        let second = client.authorize_part(&request).await.unwrap();
        let token = client
            .put(&second.url, None, payload.read_range(*range).await.unwrap())
            .await
            .unwrap();
        parts.push(CompletedPart {
            part_number: i as i64 + 1,
            token,
        });
    }

    let done = client
        .complete(&CompleteUploadRequest {
            session_id: started.session_id,
            object_key: started.object_key.clone(),
            parts: parts.clone(),
        })
        .await
        .unwrap();
    assert_eq!(done.object_key, started.object_key);

    // Completing again returns the same entry.
    let again = client
        .complete(&CompleteUploadRequest {
            session_id: started.session_id,
            object_key: started.object_key,
            parts,
        })
        .await
        .unwrap();
    assert_eq!(again.catalog_entry_id, done.catalog_entry_id);
    assert_eq!(client.list_videos().await.unwrap().len(), 1);
}

#[tokio::test]
async fn requests_without_a_valid_token_are_rejected() {
    let server = TestServer::start(small_policy()).await;
    let http = reqwest::Client::new();

    let anonymous = http
        .get(format!("{}/videos", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status(), reqwest::StatusCode::UNAUTHORIZED);

    let forged = http
        .post(format!("{}/uploads/initiate", server.base_url))
        .bearer_auth(JwtIdentity::new("not-the-server-secret").issue("mallory", Duration::from_secs(60)).unwrap())
        .json(&serde_json::json!({"contentType": "video/webm", "checksum": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(forged.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn another_owner_cannot_touch_a_session() {
    let server = TestServer::start(small_policy()).await;
    let owner = server.client("alice");
    let intruder = server.client("mallory");

    let started = owner
        .initiate(&InitiateUploadRequest {
            content_type: "video/webm".into(),
            checksum: sha256_base64(&Payload::from_bytes(pattern(KIB))).await.unwrap(),
            total_size: Some(KIB as i64),
            part_count: Some(1),
        })
        .await
        .unwrap();

    let err = intruder
        .authorize_part(&AuthorizePartRequest {
            session_id: started.session_id,
            object_key: started.object_key.clone(),
            part_number: 1,
            byte_range: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("UNAUTHORIZED"));

    let err = intruder.abort(started.session_id).await.unwrap_err();
    assert_eq!(err.code(), Some("UNAUTHORIZED"));

    let unknown = owner.session(Uuid::new_v4()).await.unwrap_err();
    assert_eq!(unknown.code(), Some("SESSION_NOT_FOUND"));
}

#[tokio::test]
async fn tampered_capability_url_is_refused() {
    let server = TestServer::start(small_policy()).await;
    let client = server.client("alice");
    let payload = Payload::from_bytes(pattern(KIB));

    let started = client
        .initiate_single_shot(&SingleShotRequest {
            content_type: "video/webm".into(),
            checksum: sha256_base64(&payload).await.unwrap(),
            size: payload.len() as i64,
        })
        .await
        .unwrap();

    let tampered = started.url.replace(&started.object_key, "videos/alice/other.webm");
    let err = client
        .put(&tampered, Some("video/webm"), payload.read_all().await.unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Rejected { status, .. } if status == 403));
}

#[tokio::test]
async fn finalize_failure_is_reported_as_such() {
    let server = TestServer::start(small_policy()).await;
    let client = server.client("frank");
    let transport = Arc::new(MislabelingTransport {
        inner: client.clone(),
    });
    let uploader = Uploader::new(client.clone(), transport, server.policy.clone());
    let tracker = SharedTracker::new();

    let err = uploader
        .upload(
            &Payload::from_bytes(pattern(3 * 64 * KIB)),
            "video/webm",
            &CancellationToken::new(),
            &tracker,
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some("FINALIZATION_FAILED"));
    assert!(matches!(err, ClientError::Rejected { status: 502, .. }));
    let snapshot = tracker.snapshot();
    assert_eq!(snapshot.phase(), UploadPhase::Failed);
    let view = client.session(snapshot.session_id().unwrap()).await.unwrap();
    assert_eq!(view.session.status, SessionStatus::Aborted);
    assert!(client.list_videos().await.unwrap().is_empty());
}

#[tokio::test]
async fn completed_single_shot_url_cannot_overwrite_the_object() {
    let server = TestServer::start(small_policy()).await;
    let client = server.client("grace");
    let data = pattern(10 * KIB);
    let payload = Payload::from_bytes(data.clone());

    let started = client
        .initiate_single_shot(&SingleShotRequest {
            content_type: "video/webm".into(),
            checksum: sha256_base64(&payload).await.unwrap(),
            size: data.len() as i64,
        })
        .await
        .unwrap();
    client
        .put(&started.url, Some("video/webm"), payload.read_all().await.unwrap())
        .await
        .unwrap();
    client
        .confirm(&ConfirmUploadRequest {
            session_id: started.session_id,
            object_key: started.object_key.clone(),
        })
        .await
        .unwrap();

    let err = client
        .put(&started.url, Some("video/webm"), Bytes::from(vec![0u8; 3 * KIB as usize]))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Rejected { status: 410, .. }));
    assert_eq!(err.code(), Some("SESSION_CLOSED"));

    let videos = client.list_videos().await.unwrap();
    assert_eq!(videos.len(), 1);
    let stored = reqwest::get(&videos[0].url).await.unwrap().bytes().await.unwrap();
    assert!(stored.as_ref() == data.as_slice());
}

#[tokio::test]
async fn aborted_single_shot_url_accepts_nothing() {
    let server = TestServer::start(small_policy()).await;
    let client = server.client("heidi");
    let payload = Payload::from_bytes(pattern(10 * KIB));

    let started = client
        .initiate_single_shot(&SingleShotRequest {
            content_type: "video/webm".into(),
            checksum: sha256_base64(&payload).await.unwrap(),
            size: payload.len() as i64,
        })
        .await
        .unwrap();
    client.abort(started.session_id).await.unwrap();

    let err = client
        .put(&started.url, Some("video/webm"), payload.read_all().await.unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("SESSION_CLOSED"));

    let view = client.session(started.session_id).await.unwrap();
    assert_eq!(view.session.status, SessionStatus::Aborted);
    assert!(client.list_videos().await.unwrap().is_empty());
}
