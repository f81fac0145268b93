//! Frame transports.
//!
//! A transport turns a session id into a stream of raw `(event, data)`
//! frames. It knows nothing about event types or subscribers; the registry
//! owns decoding and fan-out.

use std::pin::Pin;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use flowsync_core::errors::{Result, SyncError};
use flowsync_core::ids::SessionId;
use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use tracing::debug;

use crate::client::ApiClient;

/// One server-push frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseFrame {
    /// Event name. The protocol default `message` is used for unnamed frames.
    pub event: String,
    /// Raw data lines, joined with `\n`.
    pub data: String,
}

impl SseFrame {
    /// Frame with the given name and data.
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}

/// Boxed stream of frames. An `Err` item or the end of the stream is a
/// transport failure.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<SseFrame>> + Send>>;

/// Opens the long-lived frame stream of a session.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Connect and return the session's frames.
    async fn open(&self, session_id: &SessionId) -> Result<FrameStream>;
}

/// Server-sent events over `GET /flows/{session_id}/events`.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: ApiClient,
}

impl HttpTransport {
    /// Transport using `client`.
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventTransport for HttpTransport {
    async fn open(&self, session_id: &SessionId) -> Result<FrameStream> {
        let request = self
            .client
            .stream_get(&format!("/flows/{session_id}/events"))
            .header(ACCEPT, "text/event-stream");
        let response = self.client.execute(request, Some(session_id)).await?;
        debug!(session_id = %session_id, "event stream connected");

        let frames = response.bytes_stream().eventsource().map(|item| match item {
            Ok(event) => Ok(SseFrame {
                event: event.event,
                data: event.data,
            }),
            Err(e) => Err(SyncError::Transport(e.to_string())),
        });
        Ok(Box::pin(frames))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
