//! Fetch and save of flow records.

use async_trait::async_trait;
use flowsync_core::document::FlowRecord;
use flowsync_core::errors::{Result, SyncError};
use flowsync_core::ids::FlowId;
use flowsync_stream::ApiClient;
use tracing::{debug, instrument};

/// Storage for persisted flows.
#[async_trait]
pub trait DocumentService: Send + Sync {
    /// Fetch a flow. Failures are [`SyncError::Fetch`] or
    /// [`SyncError::Timeout`].
    async fn fetch(&self, flow_id: &FlowId) -> Result<FlowRecord>;

    /// Persist a flow. Failures are [`SyncError::Save`] or
    /// [`SyncError::Timeout`].
    async fn save(&self, record: &FlowRecord) -> Result<()>;
}

/// [`DocumentService`] over HTTP: `GET` and `PUT /flows/{id}`.
#[derive(Clone, Debug)]
pub struct HttpDocumentService {
    client: ApiClient,
}

impl HttpDocumentService {
    /// Service using `client`.
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DocumentService for HttpDocumentService {
    #[instrument(skip(self), fields(flow_id = %flow_id))]
    async fn fetch(&self, flow_id: &FlowId) -> Result<FlowRecord> {
        let request = self.client.get(&format!("/flows/{flow_id}"));
        let response = self
            .client
            .execute(request, None)
            .await
            .map_err(|e| rewrap(e, SyncError::Fetch))?;
        let record: FlowRecord = response
            .json()
            .await
            .map_err(|e| SyncError::Fetch(format!("invalid flow record: {e}")))?;
        debug!(nodes = record.flow_data.nodes.len(), "flow fetched");
        Ok(record)
    }

    #[instrument(skip(self, record), fields(flow_id = %record.id))]
    async fn save(&self, record: &FlowRecord) -> Result<()> {
        let request = self.client.put(&format!("/flows/{}", record.id)).json(record);
        let _ = self
            .client
            .execute(request, None)
            .await
            .map_err(|e| rewrap(e, SyncError::Save))?;
        debug!("flow saved");
        Ok(())
    }
}

fn rewrap(err: SyncError, wrap: fn(String) -> SyncError) -> SyncError {
    match err {
        SyncError::Timeout(_) => err,
        other => wrap(other.to_string()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
