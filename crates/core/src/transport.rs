//! Wire protocol for resumable drive uploads
//!
//! [`UploadTransport`] is the seam between the upload logic and the network.
//! [`GraphTransport`] speaks the Microsoft Graph upload-session protocol over
//! reqwest; it issues exactly one request per call and leaves retries to
//! [`RetryPolicy`](crate::retry::RetryPolicy).

use crate::auth::TokenCache;
use crate::config::ConfigFile;
use crate::error::{Error, Result};
use crate::path;
use async_trait::async_trait;
use http::StatusCode;
use reqwest::{header, Client, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What the remote does when the destination name already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictBehavior {
    #[default]
    Replace,
    Fail,
    Rename,
}

impl ConflictBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictBehavior::Replace => "replace",
            ConflictBehavior::Fail => "fail",
            ConflictBehavior::Rename => "rename",
        }
    }
}

/// Which drive receives the files
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveAddressing {
    /// Default document library of a site
    Site { site_id: String },
    /// A drive addressed directly
    Drive { drive_id: String },
}

impl DriveAddressing {
    /// Drive root URL, e.g. `{base}/sites/{site}/drive/root`
    pub fn root_url(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        match self {
            DriveAddressing::Site { site_id } => format!("{}/sites/{}/drive/root", base, site_id),
            DriveAddressing::Drive { drive_id } => format!("{}/drives/{}/root", base, drive_id),
        }
    }

    /// `createUploadSession` URL for an already normalized path
    pub fn create_session_url(&self, base_url: &str, normalized_path: &str) -> String {
        format!(
            "{}:/{}:/createUploadSession",
            self.root_url(base_url),
            normalized_path
        )
    }
}

/// Inclusive byte range of one chunk write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ChunkRange {
    /// Range covering `len` bytes from `start`; `len` must be non-zero
    pub fn new(start: u64, len: u64, total: u64) -> Self {
        Self {
            start,
            end: start + len - 1,
            total,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` header value
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Status, body and throttling hint of one remote reply
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: StatusCode,
    pub body: String,
    pub retry_after: Option<Duration>,
}

impl HttpReply {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    async fn from_response(response: Response) -> Result<Self> {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await?;
        Ok(Self {
            status,
            body,
            retry_after,
        })
    }

    /// Upload session fields carried by the body, if it is one
    pub fn session_info(&self) -> Option<UploadSessionInfo> {
        if self.body.trim().is_empty() {
            return None;
        }
        serde_json::from_str(&self.body).ok()
    }

    /// First offset the server still expects, if the body says so
    pub fn next_expected_offset(&self) -> Option<u64> {
        self.session_info()
            .and_then(|info| parse_next_expected(&info.next_expected_ranges))
    }

    /// Turn a non-success reply into a classified error
    pub fn into_error(self) -> Error {
        Error::from_status(self.status.as_u16(), self.body)
    }
}

/// Upload session resource as returned by the remote
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSessionInfo {
    #[serde(default)]
    pub upload_url: Option<String>,
    #[serde(default)]
    pub expiration_date_time: Option<String>,
    #[serde(default)]
    pub next_expected_ranges: Vec<String>,
}

/// Start offset of the first `"<start>-[<end>]"` range
pub fn parse_next_expected(ranges: &[String]) -> Option<u64> {
    let first = ranges.first()?;
    first.split('-').next()?.trim().parse().ok()
}

/// `Retry-After` in delta-seconds form
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Remote operations an upload needs
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Open a session for an already normalized destination path
    async fn create_session(&self, destination: &str, conflict: ConflictBehavior) -> Result<HttpReply>;

    /// Write one chunk to the session
    async fn put_chunk(&self, upload_url: &str, range: ChunkRange, data: &[u8]) -> Result<HttpReply>;

    /// Ask the session which bytes it still expects
    async fn query_session(&self, upload_url: &str) -> Result<HttpReply>;

    /// Cancel the session on the remote
    async fn delete_session(&self, upload_url: &str) -> Result<HttpReply>;
}

/// Microsoft Graph implementation of [`UploadTransport`]
pub struct GraphTransport {
    http_client: Client,
    tokens: Arc<TokenCache>,
    base_url: String,
    addressing: DriveAddressing,
    send_auth_to_upload_url: bool,
}

impl GraphTransport {
    pub fn new(
        http_client: Client,
        tokens: Arc<TokenCache>,
        base_url: String,
        addressing: DriveAddressing,
    ) -> Self {
        Self {
            http_client,
            tokens,
            base_url,
            addressing,
            send_auth_to_upload_url: false,
        }
    }

    /// Attach the bearer to requests against the pre-authenticated upload URL
    pub fn send_auth_to_upload_url(mut self, enabled: bool) -> Self {
        self.send_auth_to_upload_url = enabled;
        self
    }

    pub fn from_config(config: &ConfigFile, http_client: Client, tokens: Arc<TokenCache>) -> Result<Self> {
        Ok(Self::new(
            http_client,
            tokens,
            config.graph.base_url.clone(),
            config.addressing()?,
        )
        .send_auth_to_upload_url(config.upload.send_auth_to_upload_url))
    }

    pub fn addressing(&self) -> &DriveAddressing {
        &self.addressing
    }

    /// Request builder against the upload URL, with the bearer if enabled
    async fn upload_url_request(&self, method: reqwest::Method, upload_url: &str) -> Result<reqwest::RequestBuilder> {
        let request = self.http_client.request(method, upload_url);
        if self.send_auth_to_upload_url {
            let credential = self.tokens.credential().await?;
            Ok(request.header(header::AUTHORIZATION, credential.bearer()))
        } else {
            Ok(request)
        }
    }
}

/// Build the HTTP client with the configured per-request timeout
pub fn build_http_client(config: &ConfigFile) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(config.advanced().timeout))
        .build()
        .map_err(|e| Error::HttpClient(e.to_string()))
}

#[async_trait]
impl UploadTransport for GraphTransport {
    async fn create_session(&self, destination: &str, conflict: ConflictBehavior) -> Result<HttpReply> {
        let url = self.addressing.create_session_url(&self.base_url, destination);
        let body = serde_json::json!({
            "item": {
                "@microsoft.graph.conflictBehavior": conflict.as_str(),
                "name": path::leaf_name(destination),
            }
        });

        let credential = self.tokens.credential().await?;
        debug!(url = %url, "Creating upload session");
        let response = self
            .http_client
            .post(&url)
            .header(header::AUTHORIZATION, credential.bearer())
            .json(&body)
            .send()
            .await?;

        let reply = HttpReply::from_response(response).await?;
        if reply.status == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }
        Ok(reply)
    }

    async fn put_chunk(&self, upload_url: &str, range: ChunkRange, data: &[u8]) -> Result<HttpReply> {
        let response = self
            .upload_url_request(reqwest::Method::PUT, upload_url)
            .await?
            .header(header::CONTENT_LENGTH, data.len())
            .header(header::CONTENT_RANGE, range.content_range())
            .body(data.to_vec())
            .send()
            .await?;

        HttpReply::from_response(response).await
    }

    async fn query_session(&self, upload_url: &str) -> Result<HttpReply> {
        let response = self
            .upload_url_request(reqwest::Method::GET, upload_url)
            .await?
            .send()
            .await?;

        HttpReply::from_response(response).await
    }

    async fn delete_session(&self, upload_url: &str) -> Result<HttpReply> {
        let response = self
            .upload_url_request(reqwest::Method::DELETE, upload_url)
            .await?
            .send()
            .await?;

        HttpReply::from_response(response).await
    }
}
