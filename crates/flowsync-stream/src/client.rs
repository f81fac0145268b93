//! Shared HTTP plumbing for every backend call.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use flowsync_core::errors::{Result, SyncError};
use flowsync_core::ids::SessionId;
use flowsync_core::text::truncate_str;
use flowsync_settings::SyncSettings;
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use tracing::warn;

/// Source of the bearer token attached to every request.
pub trait TokenProvider: Send + Sync {
    /// Current token, or `None` to send the request unauthenticated.
    fn token(&self) -> Option<SecretString>;
}

/// Reads the token from an environment variable on every request.
#[derive(Clone, Debug)]
pub struct EnvTokenProvider {
    var: String,
}

impl EnvTokenProvider {
    /// Provider backed by `var`.
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl TokenProvider for EnvTokenProvider {
    fn token(&self) -> Option<SecretString> {
        std::env::var(&self.var)
            .ok()
            .filter(|v| !v.is_empty())
            .map(SecretString::from)
    }
}

/// A fixed token.
pub struct StaticToken(SecretString);

impl StaticToken {
    /// Wrap `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<SecretString> {
        Some(self.0.clone())
    }
}

/// Backend HTTP client.
///
/// Request/response calls get the configured timeout. Streaming calls do not,
/// their liveness is policed by the registry's idle timeout instead.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    token: Arc<dyn TokenProvider>,
    request_timeout: Option<Duration>,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Client for `base_url` (no trailing slash).
    pub fn new(
        base_url: impl Into<String>,
        token: Arc<dyn TokenProvider>,
        request_timeout: Option<Duration>,
    ) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SyncError::Transport(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            request_timeout,
        })
    }

    /// Client configured from the `api` and `stream` settings sections.
    pub fn from_settings(settings: &SyncSettings) -> Result<Self> {
        Self::new(
            settings.api.base_url.clone(),
            Arc::new(EnvTokenProvider::new(settings.api.token_env.clone())),
            settings.stream.request_timeout(),
        )
    }

    /// Absolute URL for `path`.
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Configured request timeout.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// `GET` with auth and the request timeout.
    pub fn get(&self, path: &str) -> RequestBuilder {
        self.timed(self.authorize(self.http.get(self.url(path))))
    }

    /// `POST` with auth and the request timeout.
    pub fn post(&self, path: &str) -> RequestBuilder {
        self.timed(self.authorize(self.http.post(self.url(path))))
    }

    /// `PUT` with auth and the request timeout.
    pub fn put(&self, path: &str) -> RequestBuilder {
        self.timed(self.authorize(self.http.put(self.url(path))))
    }

    /// `GET` with auth and no overall timeout, for long-lived streams.
    pub fn stream_get(&self, path: &str) -> RequestBuilder {
        self.authorize(self.http.get(self.url(path)))
    }

    /// Send `request`, mapping transport failures and non-success statuses.
    ///
    /// `session_id` marks the request as session-addressed so that a 404 is
    /// classified as [`SyncError::SessionNotFound`].
    pub async fn execute(
        &self,
        request: RequestBuilder,
        session_id: Option<&SessionId>,
    ) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| self.send_error(&e))?;
        check_status(response, session_id).await
    }

    /// Map a reqwest failure into the error taxonomy.
    pub fn send_error(&self, err: &reqwest::Error) -> SyncError {
        match self.request_timeout {
            Some(limit) if err.is_timeout() => SyncError::Timeout(limit),
            _ => SyncError::Transport(err.to_string()),
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token.token() {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    fn timed(&self, request: RequestBuilder) -> RequestBuilder {
        match self.request_timeout {
            Some(limit) => request.timeout(limit),
            None => request,
        }
    }
}

/// Pass a success response through; turn anything else into an error.
pub async fn check_status(response: Response, session_id: Option<&SessionId>) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(
        status = status.as_u16(),
        session_id = session_id.map(SessionId::as_str),
        body = truncate_str(&body, 200),
        "backend request failed"
    );
    Err(SyncError::from_status(status.as_u16(), body, session_id))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
