//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so a settings file only needs the keys it wants to change.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root settings type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// Backend endpoint and credentials.
    pub api: ApiSettings,
    /// Streaming connection behavior.
    pub stream: StreamSettings,
    /// Debounced save pipeline behavior.
    pub persistence: PersistenceSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

/// Backend endpoint and credentials.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiSettings {
    /// Base URL every endpoint path is joined onto.
    pub base_url: String,
    /// Name of the environment variable holding the bearer token.
    pub token_env: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/api/v1".to_string(),
            token_env: "FLOWSYNC_TOKEN".to_string(),
        }
    }
}

/// Streaming connection behavior.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// Timeout for request/response calls. `0` disables it.
    pub request_timeout_ms: u64,
    /// Close a stream that produces no frame for this long. `0` disables it.
    pub idle_timeout_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            idle_timeout_ms: 90_000,
        }
    }
}

impl StreamSettings {
    /// Request timeout, if enabled.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    /// Stream idle timeout, if enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

/// Debounced save pipeline behavior.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistenceSettings {
    /// Quiet period before a change is evaluated for saving.
    pub debounce_ms: u64,
    /// Delay after a drag ends before a save may fire.
    pub drag_settle_ms: u64,
    /// Maximum undo steps kept.
    pub history_limit: usize,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            drag_settle_ms: 300,
            history_limit: 100,
        }
    }
}

impl PersistenceSettings {
    /// Debounce window.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Post-drag settle delay.
    pub fn drag_settle(&self) -> Duration {
        Duration::from_millis(self.drag_settle_ms)
    }
}

/// Log output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level filter; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of the compact human format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl SyncSettings {
    /// Correct invalid combinations instead of rejecting them.
    ///
    /// Called automatically during loading.
    pub fn validate(&mut self) {
        let p = &mut self.persistence;
        if p.debounce_ms == 0 {
            tracing::warn!("debounce_ms must be positive, using 1");
            p.debounce_ms = 1;
        }
        if p.drag_settle_ms < p.debounce_ms {
            tracing::warn!(
                drag_settle_ms = p.drag_settle_ms,
                debounce_ms = p.debounce_ms,
                "drag settle shorter than debounce, raising it"
            );
            p.drag_settle_ms = p.debounce_ms;
        }
        if p.history_limit == 0 {
            tracing::warn!("history_limit must be positive, using 1");
            p.history_limit = 1;
        }
        let trimmed = self.api.base_url.trim_end_matches('/');
        if trimmed.len() != self.api.base_url.len() {
            self.api.base_url = trimmed.to_string();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
