//! Session-addressed backend calls.

use async_trait::async_trait;
use flowsync_core::agent::AgentState;
use flowsync_core::errors::{Result, SyncError};
use flowsync_core::ids::{FlowId, SessionId};
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::client::ApiClient;

/// Requests the session controller makes besides listening to the stream.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Submit user input to a session.
    ///
    /// Fails with [`SyncError::SessionNotFound`] when the server does not
    /// know `session_id`.
    async fn send_input(&self, session_id: &SessionId, input: &str) -> Result<()>;

    /// Create a concrete session anchored to the flow's base session.
    async fn create_session(&self, flow_id: &FlowId) -> Result<SessionId>;

    /// Fetch the flow's agent state.
    async fn agent_state(&self, flow_id: &FlowId) -> Result<AgentState>;
}

#[derive(Serialize)]
struct InputBody<'a> {
    input: &'a str,
}

#[derive(Deserialize)]
struct CreatedSession {
    session_id: SessionId,
}

/// [`SessionApi`] over HTTP.
#[derive(Clone, Debug)]
pub struct HttpSessionApi {
    client: ApiClient,
}

impl HttpSessionApi {
    /// API using `client`.
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    #[instrument(skip(self, input), fields(session_id = %session_id))]
    async fn send_input(&self, session_id: &SessionId, input: &str) -> Result<()> {
        let request = self
            .client
            .post(&format!("/flows/{session_id}/messages"))
            .header(ACCEPT, "text/event-stream")
            .json(&InputBody { input });
        // The reply body may be a stream; events are consumed from the
        // session's own connection, so only the status matters here.
        let response = self.client.execute(request, Some(session_id)).await?;
        debug!(status = response.status().as_u16(), "input accepted");
        Ok(())
    }

    #[instrument(skip(self), fields(flow_id = %flow_id))]
    async fn create_session(&self, flow_id: &FlowId) -> Result<SessionId> {
        let request = self.client.post(&format!("/flows/{flow_id}/sessions"));
        let response = self.client.execute(request, None).await?;
        let created: CreatedSession = response
            .json()
            .await
            .map_err(|e| SyncError::Protocol(format!("invalid create-session response: {e}")))?;
        debug!(session_id = %created.session_id, "fallback session created");
        Ok(created.session_id)
    }

    #[instrument(skip(self), fields(flow_id = %flow_id))]
    async fn agent_state(&self, flow_id: &FlowId) -> Result<AgentState> {
        let request = self.client.get(&format!("/flows/{flow_id}/agent-state"));
        let response = self
            .client
            .execute(request, None)
            .await
            .map_err(|e| fetch_error(&e))?;
        response
            .json()
            .await
            .map_err(|e| SyncError::Fetch(format!("invalid agent state: {e}")))
    }
}

fn fetch_error(err: &SyncError) -> SyncError {
    match err {
        SyncError::Timeout(_) => err.clone(),
        other => SyncError::Fetch(other.to_string()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
