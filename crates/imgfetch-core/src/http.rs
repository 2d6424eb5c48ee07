//! HTTP client abstraction
//!
//! The download engine never talks to reqwest directly. Operations issue an
//! [`HttpRequest`] through the [`HttpClient`] trait and consume the streamed
//! body, which keeps the engine testable with scripted clients. Dropping the
//! body stream aborts the transfer.

use crate::error::DownloadError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use imgfetch_types::HeaderSet;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, PRAGMA};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// How the client should treat a shared response cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDirective {
    /// Standard protocol cache semantics
    Default,
    /// Skip any shared cache and always hit the origin
    Bypass,
}

/// Basic-auth credentials attached to a request
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A streaming GET request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: Url,
    pub headers: HeaderSet,
    pub cache: CacheDirective,
    pub credentials: Option<Credentials>,
}

/// Response head plus the incremental body
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderSet,
    /// Value of the content-length header, if any
    pub content_length: Option<u64>,
    /// Response was served from a cache rather than the origin
    pub from_cache: bool,
    pub body: BoxStream<'static, Result<Bytes, DownloadError>>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) || (self.from_cache && self.status == 304)
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("content_length", &self.content_length)
            .field("from_cache", &self.from_cache)
            .finish_non_exhaustive()
    }
}

/// Trait for HTTP client operations.
///
/// Implementations resolve once the response head is available; the body is
/// pulled chunk by chunk afterwards.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, DownloadError>;
}

/// Real HTTP client implementation using reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: Client,
}

impl ReqwestClient {
    /// Creates a new ReqwestClient with default configuration.
    pub fn new() -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(concat!("imgfetch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DownloadError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Wrap an already configured reqwest client
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn to_header_map(request: &HttpRequest) -> Result<HeaderMap, DownloadError> {
    let mut map = HeaderMap::new();
    for (name, value) in request.headers.iter() {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| DownloadError::InvalidRequest(format!("Invalid header name: {}", name)))?;
        let value = HeaderValue::from_str(value).map_err(|_| {
            DownloadError::InvalidRequest(format!("Invalid value for header {}", name))
        })?;
        map.insert(name, value);
    }

    if request.cache == CacheDirective::Bypass {
        map.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        map.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    }

    Ok(map)
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, DownloadError> {
        debug!("GET {} (cache: {:?})", request.url, request.cache);

        let mut builder = self
            .client
            .get(request.url.clone())
            .headers(to_header_map(request)?);
        if let Some(credentials) = &request.credentials {
            builder = builder.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = builder.send().await?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
            .collect::<HeaderSet>();

        Ok(HttpResponse {
            status: status.as_u16(),
            headers,
            content_length: response.content_length(),
            from_cache: status == StatusCode::NOT_MODIFIED,
            body: response
                .bytes_stream()
                .map(|chunk| chunk.map_err(DownloadError::from))
                .boxed(),
        })
    }
}
