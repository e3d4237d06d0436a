//! The client's two network seams and their HTTP implementation.
//!
//! [`UploadApi`] talks to the upload service; [`PartTransport`] moves bytes
//! to a capability URL. Tests substitute either one.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response, header};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

use super::error::ClientError;
use crate::models::api::{
    AbortUploadRequest, AuthorizePartRequest, AuthorizePartResponse, CompleteUploadRequest,
    CompleteUploadResponse, ConfirmUploadRequest, InitiateUploadRequest, InitiateUploadResponse,
    SessionView, SingleShotRequest, SingleShotResponse, VideoListing,
};

#[async_trait]
pub trait UploadApi: Send + Sync {
    async fn initiate(&self, req: &InitiateUploadRequest)
    -> Result<InitiateUploadResponse, ClientError>;

    async fn authorize_part(
        &self,
        req: &AuthorizePartRequest,
    ) -> Result<AuthorizePartResponse, ClientError>;

    async fn complete(&self, req: &CompleteUploadRequest)
    -> Result<CompleteUploadResponse, ClientError>;

    async fn initiate_single_shot(
        &self,
        req: &SingleShotRequest,
    ) -> Result<SingleShotResponse, ClientError>;

    async fn confirm(&self, req: &ConfirmUploadRequest)
    -> Result<CompleteUploadResponse, ClientError>;

    async fn abort(&self, session_id: Uuid) -> Result<(), ClientError>;
}

#[async_trait]
pub trait PartTransport: Send + Sync {
    /// PUT `body` to a capability URL and return the ETag the store answered
    /// with; for parts this is the completion token.
    async fn put(
        &self,
        url: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> Result<String, ClientError>;
}

/// `reqwest` implementation of both seams, authenticated with a bearer token.
#[derive(Clone)]
pub struct HttpUploadClient {
    http: Client,
    base_url: String,
    token: String,
}

impl HttpUploadClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url, token)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, ClientError>
    where
        B: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R, ClientError> {
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Ok(check(resp).await?.json().await?)
    }

    /// The caller's catalog.
    pub async fn list_videos(&self) -> Result<Vec<VideoListing>, ClientError> {
        self.get_json("/videos").await
    }

    pub async fn session(&self, session_id: Uuid) -> Result<SessionView, ClientError> {
        self.get_json(&format!("/uploads/{}", session_id)).await
    }
}

#[async_trait]
impl UploadApi for HttpUploadClient {
    async fn initiate(
        &self,
        req: &InitiateUploadRequest,
    ) -> Result<InitiateUploadResponse, ClientError> {
        self.post_json("/uploads/initiate", req).await
    }

    async fn authorize_part(
        &self,
        req: &AuthorizePartRequest,
    ) -> Result<AuthorizePartResponse, ClientError> {
        self.post_json("/uploads/authorize-part", req).await
    }

    async fn complete(
        &self,
        req: &CompleteUploadRequest,
    ) -> Result<CompleteUploadResponse, ClientError> {
        self.post_json("/uploads/complete", req).await
    }

    async fn initiate_single_shot(
        &self,
        req: &SingleShotRequest,
    ) -> Result<SingleShotResponse, ClientError> {
        self.post_json("/uploads/single", req).await
    }

    async fn confirm(
        &self,
        req: &ConfirmUploadRequest,
    ) -> Result<CompleteUploadResponse, ClientError> {
        self.post_json("/uploads/confirm", req).await
    }

    async fn abort(&self, session_id: Uuid) -> Result<(), ClientError> {
        let resp = self
            .http
            .post(format!("{}/uploads/abort", self.base_url))
            .bearer_auth(&self.token)
            .json(&AbortUploadRequest { session_id })
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl PartTransport for HttpUploadClient {
    async fn put(
        &self,
        url: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> Result<String, ClientError> {
        // Capability URLs carry their own authorization; no bearer token.
        let mut req = self.http.put(url).body(body);
        if let Some(content_type) = content_type {
            req = req.header(header::CONTENT_TYPE, content_type);
        }
        let resp = check(req.send().await?).await?;
        resp.headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ClientError::Transport("store response carried no ETag".into()))
    }
}

/// Turn an error status into `ClientError::Rejected`, reading the service's
/// `{error, code, status}` body when there is one.
async fn check(resp: Response) -> Result<Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let body: Option<Value> = serde_json::from_str(&text).ok();
    let field = |name: &str| {
        body.as_ref()
            .and_then(|b| b.get(name))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    Err(ClientError::Rejected {
        status: status.as_u16(),
        code: field("code").unwrap_or_else(|| "HTTP_ERROR".into()),
        message: field("error").unwrap_or(text),
    })
}
