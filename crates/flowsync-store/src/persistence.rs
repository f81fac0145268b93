//! Debounced, dirty-checked persistence.
//!
//! The pipeline watches [`ReconciliationStore`] changes and decides when the
//! document should be written back through a [`DocumentService`]:
//!
//! ```text
//! Idle ──change──▶ PendingEvaluation ──unchanged──▶ Idle
//!                         │
//!                         └──changed──▶ Saving ──ok──▶ Idle (snapshot advances)
//!                                          └──err──▶ Idle (snapshot kept)
//! ```
//!
//! Bursts of edits collapse into one evaluation. Drag gestures suppress
//! evaluation until the drag ends and a settle delay passes. Saves never
//! overlap; an edit that lands during a save is picked up by the evaluation
//! scheduled when the save finishes. Fetches and saves share one I/O lock, so
//! a load waits for an in-flight save and no save starts while a fetch runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use flowsync_core::document::{Document, SaveSnapshot};
use flowsync_core::errors::{Result, SyncError};
use flowsync_core::ids::FlowId;
use flowsync_settings::PersistenceSettings;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::scheduler::Debouncer;
use crate::service::DocumentService;
use crate::store::{DocumentChange, ReconciliationStore};

const NOTICE_CHANNEL_CAPACITY: usize = 64;

/// Timing of the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PersistenceConfig {
    /// Quiet period after an edit before the document is evaluated.
    pub debounce: Duration,
    /// Quiet period after a drag ends before the document is evaluated.
    pub drag_settle: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            drag_settle: Duration::from_millis(300),
        }
    }
}

impl From<&PersistenceSettings> for PersistenceConfig {
    fn from(settings: &PersistenceSettings) -> Self {
        Self {
            debounce: settings.debounce(),
            drag_settle: settings.drag_settle(),
        }
    }
}

/// Outcome of a save, for the UI.
#[derive(Clone, Debug)]
pub enum PersistenceNotice {
    /// The document was written.
    Saved {
        /// Saved flow.
        flow_id: FlowId,
    },
    /// The write failed; the next real edit retries it.
    SaveFailed {
        /// Flow that failed to save.
        flow_id: FlowId,
        /// Why.
        error: SyncError,
    },
}

struct PipelineInner {
    store: Arc<ReconciliationStore>,
    service: Arc<dyn DocumentService>,
    config: PersistenceConfig,
    snapshot: Mutex<Option<SaveSnapshot>>,
    loading: AtomicBool,
    saving: AtomicBool,
    dragging: AtomicBool,
    /// Held across every fetch and save.
    io: tokio::sync::Mutex<()>,
    /// Bumped by every load.
    epoch: AtomicU64,
    debouncer: Debouncer,
    notices: broadcast::Sender<PersistenceNotice>,
}

impl PipelineInner {
    fn on_change(self: &Arc<Self>, change: DocumentChange) {
        match change {
            DocumentChange::Loaded => return,
            DocumentChange::Moved { dragging: true } => {
                if !self.dragging.swap(true, Ordering::SeqCst) {
                    trace!("drag started; pending evaluation cancelled");
                }
                let _ = self.debouncer.cancel();
                return;
            }
            DocumentChange::Moved { dragging: false } if self.dragging.swap(false, Ordering::SeqCst) => {
                self.request_evaluation(self.config.drag_settle);
                return;
            }
            _ => {}
        }
        if !change.affects_document() {
            return;
        }
        if self.loading.load(Ordering::SeqCst)
            || self.saving.load(Ordering::SeqCst)
            || self.dragging.load(Ordering::SeqCst)
        {
            trace!(?change, "change observed while busy; not scheduling");
            return;
        }
        self.request_evaluation(self.config.debounce);
    }

    fn request_evaluation(self: &Arc<Self>, delay: Duration) {
        let this = Arc::clone(self);
        self.debouncer.schedule(delay, async move {
            // failures are logged and announced inside
            let _ = this.evaluate().await;
        });
    }

    /// Save if the document differs from the snapshot. Returns whether a save
    /// was issued.
    async fn evaluate(self: &Arc<Self>) -> Result<bool> {
        if self.loading.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if self
            .saving
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("save in flight; evaluation dropped");
            return Ok(false);
        }
        let epoch = self.epoch.load(Ordering::SeqCst);
        let result = {
            let _io = self.io.lock().await;
            if self.loading.load(Ordering::SeqCst) {
                Ok(false)
            } else {
                self.save_if_dirty(epoch).await
            }
        };
        self.saving.store(false, Ordering::SeqCst);

        let reloading = self.loading.load(Ordering::SeqCst) || self.epoch.load(Ordering::SeqCst) != epoch;
        if matches!(result, Ok(true)) && !reloading {
            // catch edits that landed while the save was in flight
            self.request_evaluation(self.config.debounce);
        }
        result
    }

    async fn save_if_dirty(&self, epoch: u64) -> Result<bool> {
        let Some(record) = self.store.record() else {
            return Err(SyncError::InvalidState("no document loaded".into()));
        };
        let document = Document::from_record(&record);
        let dirty = self
            .snapshot
            .lock()
            .as_ref()
            .is_none_or(|snapshot| !snapshot.matches(&document));
        if !dirty {
            trace!(flow_id = %record.id, "document unchanged; skipping save");
            return Ok(false);
        }

        match self.service.save(&record).await {
            Ok(()) => {
                if self.epoch.load(Ordering::SeqCst) != epoch {
                    debug!(flow_id = %record.id, "document reloaded during save; snapshot kept");
                    return Ok(false);
                }
                *self.snapshot.lock() = Some(SaveSnapshot::of(&document));
                info!(flow_id = %record.id, nodes = document.nodes.len(), "document saved");
                let _ = self.notices.send(PersistenceNotice::Saved {
                    flow_id: record.id,
                });
                Ok(true)
            }
            Err(error) => {
                warn!(
                    flow_id = %record.id,
                    error_kind = error.error_kind(),
                    error = %error,
                    "document save failed"
                );
                let _ = self.notices.send(PersistenceNotice::SaveFailed {
                    flow_id: record.id,
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }
}

/// Writes the store's document back whenever it settles into a new state.
pub struct PersistencePipeline {
    inner: Arc<PipelineInner>,
    cancel: CancellationToken,
}

impl PersistencePipeline {
    /// Start observing `store`. Must be called inside a Tokio runtime.
    pub fn new(
        store: Arc<ReconciliationStore>,
        service: Arc<dyn DocumentService>,
        config: PersistenceConfig,
    ) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        let mut changes = store.subscribe();
        let inner = Arc::new(PipelineInner {
            store,
            service,
            config,
            snapshot: Mutex::new(None),
            loading: AtomicBool::new(false),
            saving: AtomicBool::new(false),
            dragging: AtomicBool::new(false),
            io: tokio::sync::Mutex::new(()),
            epoch: AtomicU64::new(0),
            debouncer: Debouncer::new(),
            notices,
        });
        let cancel = CancellationToken::new();

        let observer = Arc::clone(&inner);
        let token = cancel.clone();
        drop(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    received = changes.recv() => match received {
                        Ok(change) => observer.on_change(change),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "persistence observer lagged; re-evaluating");
                            observer.request_evaluation(observer.config.debounce);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("persistence observer stopped");
        }));

        Self { inner, cancel }
    }

    /// Fetch `flow_id` and load it into the store. Waits for a save in
    /// flight to finish first. Edits observed while the fetch is outstanding
    /// do not schedule saves.
    pub async fn load(&self, flow_id: &FlowId) -> Result<()> {
        let inner = &self.inner;
        inner.loading.store(true, Ordering::SeqCst);
        let _ = inner.debouncer.cancel();
        let io = inner.io.lock().await;
        let _ = inner.epoch.fetch_add(1, Ordering::SeqCst);
        let fetched = inner.service.fetch(flow_id).await;
        let result = match fetched {
            Ok(record) => {
                inner.store.load(&record);
                inner.dragging.store(false, Ordering::SeqCst);
                *inner.snapshot.lock() = Some(SaveSnapshot::of(&Document::from_record(&record)));
                info!(flow_id = %flow_id, nodes = record.flow_data.nodes.len(), "document loaded");
                Ok(())
            }
            Err(error) => {
                warn!(flow_id = %flow_id, error_kind = error.error_kind(), error = %error, "document fetch failed");
                Err(error)
            }
        };
        drop(io);
        inner.loading.store(false, Ordering::SeqCst);
        result
    }

    /// Evaluate immediately, bypassing the debounce. Returns whether a save
    /// was issued; `Ok(false)` if the document is clean or a save is already
    /// in flight.
    pub async fn save_now(&self) -> Result<bool> {
        let _ = self.inner.debouncer.cancel();
        self.inner.evaluate().await
    }

    /// Last document state known to match the server.
    pub fn snapshot(&self) -> Option<SaveSnapshot> {
        self.inner.snapshot.lock().clone()
    }

    /// Whether the store's document differs from the snapshot.
    pub fn is_dirty(&self) -> bool {
        let document = self.inner.store.document();
        self.inner
            .snapshot
            .lock()
            .as_ref()
            .is_none_or(|snapshot| !snapshot.matches(&document))
    }

    /// Whether a save is in flight.
    pub fn is_saving(&self) -> bool {
        self.inner.saving.load(Ordering::SeqCst)
    }

    /// Whether an evaluation is waiting on its timer.
    pub fn is_pending(&self) -> bool {
        self.inner.debouncer.is_pending()
    }

    /// Receive save outcomes.
    pub fn notices(&self) -> broadcast::Receiver<PersistenceNotice> {
        self.inner.notices.subscribe()
    }

    /// Cancel pending evaluations and stop observing the store. Idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.inner.debouncer.shutdown();
    }
}

impl Drop for PersistencePipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryDocumentService;
    use crate::store::NodeChange;
    use assert_matches::assert_matches;
    use flowsync_core::document::{Edge, FlowData, FlowRecord, Node, Position};

    const DEBOUNCE: Duration = Duration::from_millis(100);
    const SETTLE: Duration = Duration::from_millis(300);

    fn record() -> FlowRecord {
        record_of("F1")
    }

    fn record_of(flow_id: &str) -> FlowRecord {
        FlowRecord {
            id: FlowId::from(flow_id),
            name: "Trip".into(),
            flow_data: FlowData {
                nodes: vec![
                    Node::new("a", "Start", Position::new(0.0, 0.0)),
                    Node::new("b", "End", Position::new(200.0, 0.0)),
                ],
                edges: vec![Edge::between("a", "b")],
            },
            updated_at: Some("2026-01-01T00:00:00Z".into()),
        }
    }

    struct Harness {
        store: Arc<ReconciliationStore>,
        service: Arc<MemoryDocumentService>,
        pipeline: PersistencePipeline,
    }

    async fn loaded() -> Harness {
        let store = Arc::new(ReconciliationStore::new(100));
        let service = Arc::new(MemoryDocumentService::new());
        service.insert(record());
        let pipeline = PersistencePipeline::new(
            Arc::clone(&store),
            Arc::clone(&service) as Arc<dyn DocumentService>,
            PersistenceConfig::default(),
        );
        pipeline.load(&FlowId::from("F1")).await.unwrap();
        Harness {
            store,
            service,
            pipeline,
        }
    }

    fn relabel(store: &ReconciliationStore, label: &str) {
        store.apply_node_changes([NodeChange::Label {
            id: "a".into(),
            label: label.into(),
        }]);
    }

    fn drag(store: &ReconciliationStore, x: f64, dragging: bool) {
        store.apply_node_changes([NodeChange::Position {
            id: "a".into(),
            position: Position::new(x, 0.0),
            dragging,
        }]);
    }

    async fn wait(duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    #[tokio::test(start_paused = true)]
    async fn label_edit_saves_once_after_debounce() {
        let h = loaded().await;
        relabel(&h.store, "Departure");

        wait(DEBOUNCE / 2).await;
        assert_eq!(h.service.save_count(), 0);

        wait(DEBOUNCE * 5).await;
        let saves = h.service.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].flow_data.nodes[0].data.label, "Departure");
        assert!(!h.pipeline.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_edits_collapses_into_one_save() {
        let h = loaded().await;
        for i in 0..10 {
            relabel(&h.store, &format!("Label {i}"));
            wait(DEBOUNCE / 4).await;
        }
        assert_eq!(h.service.save_count(), 0);

        wait(DEBOUNCE * 5).await;
        let saves = h.service.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].flow_data.nodes[0].data.label, "Label 9");
    }

    #[tokio::test(start_paused = true)]
    async fn drag_defers_save_until_settled() {
        let h = loaded().await;
        drag(&h.store, 10.0, true);
        wait(DEBOUNCE * 3).await;
        drag(&h.store, 50.0, true);
        wait(DEBOUNCE * 3).await;
        assert_eq!(h.service.save_count(), 0);

        drag(&h.store, 80.0, false);
        wait(SETTLE - Duration::from_millis(10)).await;
        assert_eq!(h.service.save_count(), 0);

        wait(Duration::from_millis(50)).await;
        let saves = h.service.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].flow_data.nodes[0].position.x, 80.0);
    }

    #[tokio::test(start_paused = true)]
    async fn edit_during_drag_waits_for_drag_end() {
        let h = loaded().await;
        drag(&h.store, 10.0, true);
        relabel(&h.store, "Moved");
        wait(DEBOUNCE * 5).await;
        assert_eq!(h.service.save_count(), 0);

        drag(&h.store, 20.0, false);
        wait(SETTLE * 2).await;
        assert_eq!(h.service.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_document_is_not_saved() {
        let h = loaded().await;
        relabel(&h.store, "Departure");
        relabel(&h.store, "Start");
        wait(DEBOUNCE * 5).await;
        assert_eq!(h.service.save_count(), 0);

        assert!(!h.pipeline.save_now().await.unwrap());
        assert_eq!(h.service.save_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn load_does_not_trigger_save() {
        let h = loaded().await;
        wait(DEBOUNCE * 10).await;
        assert_eq!(h.service.save_count(), 0);
        assert_eq!(h.service.fetch_count(), 1);
        assert!(h.pipeline.snapshot().is_some());
        assert!(!h.pipeline.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn load_waits_for_save_in_flight() {
        let h = loaded().await;
        h.service.insert(record_of("F2"));
        h.service.set_save_delay(Some(Duration::from_millis(500)));
        relabel(&h.store, "Departure");
        wait(DEBOUNCE + Duration::from_millis(50)).await;
        assert!(h.pipeline.is_saving());

        let f2 = FlowId::from("F2");
        let (result, ()) = tokio::join!(h.pipeline.load(&f2), async {
            wait(Duration::from_millis(100)).await;
            // the fetch has not started yet
            assert_eq!(h.service.fetch_count(), 1);
            assert!(h.pipeline.is_saving());
        });
        result.unwrap();
        assert_eq!(h.service.fetch_count(), 2);
        assert_eq!(h.store.flow_id(), Some(f2.clone()));
        assert!(!h.pipeline.is_dirty());

        wait(Duration::from_millis(2_000)).await;
        let saved: Vec<_> = h.service.saves().into_iter().map(|record| record.id).collect();
        assert_eq!(saved, vec![FlowId::from("F1")]);
        assert_eq!(h.service.record(&f2), Some(record_of("F2")));
    }

    #[tokio::test(start_paused = true)]
    async fn no_save_while_fetch_is_pending() {
        let h = loaded().await;
        h.service.set_fetch_delay(Some(Duration::from_millis(500)));
        relabel(&h.store, "Departure");

        let f1 = FlowId::from("F1");
        let (result, ()) = tokio::join!(h.pipeline.load(&f1), async {
            wait(Duration::from_millis(50)).await;
            assert!(!h.pipeline.save_now().await.unwrap());
            relabel(&h.store, "Arrival");
            wait(DEBOUNCE * 2).await;
            assert_eq!(h.service.save_count(), 0);
        });
        result.unwrap();

        wait(DEBOUNCE * 10).await;
        assert_eq!(h.service.save_count(), 0);
        assert_eq!(h.store.document().nodes[0].data.label, "Start");
        assert!(!h.pipeline.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_save_keeps_snapshot_and_retries_on_next_edit() {
        let h = loaded().await;
        let mut notices = h.pipeline.notices();
        h.service.set_fail_saves(true);
        relabel(&h.store, "Departure");
        wait(DEBOUNCE * 5).await;

        assert_matches!(
            notices.recv().await.unwrap(),
            PersistenceNotice::SaveFailed { error: SyncError::Save(_), .. }
        );
        assert!(h.pipeline.is_dirty());
        // no automatic retry
        wait(DEBOUNCE * 10).await;
        assert_eq!(h.service.save_count(), 0);

        h.service.set_fail_saves(false);
        relabel(&h.store, "Departure!");
        wait(DEBOUNCE * 5).await;
        assert_matches!(notices.recv().await.unwrap(), PersistenceNotice::Saved { .. });
        assert_eq!(h.service.save_count(), 1);
        assert!(!h.pipeline.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn edit_during_save_is_saved_afterwards() {
        let h = loaded().await;
        h.service.set_save_delay(Some(Duration::from_millis(500)));
        relabel(&h.store, "First");
        wait(DEBOUNCE + Duration::from_millis(50)).await;
        assert!(h.pipeline.is_saving());

        relabel(&h.store, "Second");
        wait(Duration::from_millis(2_000)).await;

        let saves = h.service.saves();
        assert_eq!(saves.len(), 2);
        assert_eq!(saves[0].flow_data.nodes[0].data.label, "First");
        assert_eq!(saves[1].flow_data.nodes[0].data.label, "Second");
    }

    #[tokio::test(start_paused = true)]
    async fn saved_document_round_trips() {
        let h = loaded().await;
        relabel(&h.store, "Departure");
        h.store.set_flow_name("Trip v2");
        wait(DEBOUNCE * 5).await;

        let store = Arc::new(ReconciliationStore::new(100));
        let reloaded = PersistencePipeline::new(
            Arc::clone(&store),
            Arc::clone(&h.service) as Arc<dyn DocumentService>,
            PersistenceConfig::default(),
        );
        reloaded.load(&FlowId::from("F1")).await.unwrap();
        assert_eq!(store.document(), h.store.document());
        assert!(!reloaded.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_failure_is_returned() {
        let store = Arc::new(ReconciliationStore::new(100));
        let pipeline = PersistencePipeline::new(
            Arc::clone(&store),
            Arc::new(MemoryDocumentService::new()),
            PersistenceConfig::default(),
        );
        let err = pipeline.load(&FlowId::from("missing")).await.unwrap_err();
        assert_matches!(err, SyncError::Fetch(_));
        assert!(store.flow_id().is_none());

        let err = pipeline.save_now().await.unwrap_err();
        assert_matches!(err, SyncError::InvalidState(_));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_evaluation() {
        let h = loaded().await;
        relabel(&h.store, "Departure");
        tokio::task::yield_now().await;
        h.pipeline.shutdown();
        wait(DEBOUNCE * 5).await;
        assert_eq!(h.service.save_count(), 0);
    }
}
