//! In-memory [`DocumentService`] for tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use flowsync_core::document::FlowRecord;
use flowsync_core::errors::{Result, SyncError};
use flowsync_core::ids::FlowId;
use parking_lot::Mutex;

use crate::service::DocumentService;

#[derive(Default)]
struct Backing {
    records: HashMap<FlowId, FlowRecord>,
    saves: Vec<FlowRecord>,
    fetches: usize,
    fail_saves: bool,
    save_delay: Option<Duration>,
    fetch_delay: Option<Duration>,
}

/// Records kept in a map; every save is logged.
#[derive(Default)]
pub struct MemoryDocumentService {
    backing: Mutex<Backing>,
}

impl MemoryDocumentService {
    /// Empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `record` as if it had been saved earlier.
    pub fn insert(&self, record: FlowRecord) {
        let _ = self
            .backing
            .lock()
            .records
            .insert(record.id.clone(), record);
    }

    /// Current stored copy of a flow.
    pub fn record(&self, flow_id: &FlowId) -> Option<FlowRecord> {
        self.backing.lock().records.get(flow_id).cloned()
    }

    /// Every record passed to a successful save, oldest first.
    pub fn saves(&self) -> Vec<FlowRecord> {
        self.backing.lock().saves.clone()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.backing.lock().saves.len()
    }

    /// Number of fetch calls.
    pub fn fetch_count(&self) -> usize {
        self.backing.lock().fetches
    }

    /// Make saves fail until reset.
    pub fn set_fail_saves(&self, fail: bool) {
        self.backing.lock().fail_saves = fail;
    }

    /// Hold every save for `delay` before it completes.
    pub fn set_save_delay(&self, delay: Option<Duration>) {
        self.backing.lock().save_delay = delay;
    }

    /// Hold every fetch for `delay` before it completes.
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.backing.lock().fetch_delay = delay;
    }
}

#[async_trait]
impl DocumentService for MemoryDocumentService {
    async fn fetch(&self, flow_id: &FlowId) -> Result<FlowRecord> {
        let delay = self.backing.lock().fetch_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut backing = self.backing.lock();
        backing.fetches += 1;
        backing
            .records
            .get(flow_id)
            .cloned()
            .ok_or_else(|| SyncError::Fetch(format!("no such flow: {flow_id}")))
    }

    async fn save(&self, record: &FlowRecord) -> Result<()> {
        let delay = self.backing.lock().save_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut backing = self.backing.lock();
        if backing.fail_saves {
            return Err(SyncError::Save("injected failure".into()));
        }
        backing.saves.push(record.clone());
        let _ = backing.records.insert(record.id.clone(), record.clone());
        Ok(())
    }
}
