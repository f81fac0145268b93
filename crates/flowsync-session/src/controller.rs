//! Session lifecycle controller.
//!
//! One controller per edited flow, with at most one active session:
//!
//! ```text
//! Idle ──start_processing──▶ Dispatching ──sent──▶ Streaming ──terminal event──▶ Settled
//!   ▲                            │                                                 │
//!   └────────── send failed ─────┘◀──────────── cleanup / reset ───────────────────┘
//! ```
//!
//! All subscriptions of the active session feed one channel drained by a
//! dispatch loop, which checks each event's session against the active one
//! before it may touch the store.

use std::sync::Arc;

use dashmap::DashMap;
use flowsync_core::errors::{Result, SyncError};
use flowsync_core::events::{EventType, SessionEvent, StateUpdate, StreamEvent, TaskProgress};
use flowsync_core::ids::{FlowId, SessionId};
use flowsync_store::ReconciliationStore;
use flowsync_stream::{ConnectionRegistry, EventSink, SessionApi, Subscription};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::guard::{is_active_session, should_apply_state_update};

const NOTICE_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle phase of the active session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing in progress.
    #[default]
    Idle,
    /// A work request is being sent.
    Dispatching,
    /// The request was accepted; events are streaming.
    Streaming,
    /// The session ended or failed; teardown is done.
    Settled,
}

/// What the UI hears from the controller.
#[derive(Clone, Debug)]
pub enum ControllerNotice {
    /// A derived session was unknown and a fallback took its place.
    FallbackAdopted {
        /// Rejected derived id.
        derived: SessionId,
        /// Server-created replacement.
        fallback: SessionId,
    },
    /// Text fragment of the reply.
    Token(String),
    /// A server tool started.
    ToolStarted {
        /// Tool name, if reported.
        name: Option<String>,
    },
    /// A server tool finished.
    ToolFinished {
        /// Tool name, if reported.
        name: Option<String>,
    },
    /// Progress of one generated task.
    TaskProgress(TaskProgress),
    /// The agent state was merged from a stream update.
    AgentStateChanged {
        /// Whether generated nodes were rebuilt.
        tasks_changed: bool,
    },
    /// A failure ended or prevented the session.
    Error {
        /// Affected session.
        session_id: SessionId,
        /// What went wrong.
        error: SyncError,
    },
    /// The session finished and its subscriptions were released.
    Settled {
        /// Finished session.
        session_id: SessionId,
    },
}

#[derive(Default)]
struct ActiveSession {
    session_id: Option<SessionId>,
    state: SessionState,
    subscriptions: Vec<Subscription>,
    /// Bumped by explicit cleanup; a terminal event does not count.
    cleanups: u64,
}

struct ControllerInner {
    flow_id: FlowId,
    registry: Arc<ConnectionRegistry>,
    api: Arc<dyn SessionApi>,
    store: Arc<ReconciliationStore>,
    /// Derived id → adopted fallback id.
    fallbacks: DashMap<SessionId, SessionId>,
    active: Mutex<ActiveSession>,
    sink: EventSink,
    notices: broadcast::Sender<ControllerNotice>,
}

impl ControllerInner {
    fn notify(&self, notice: ControllerNotice) {
        // no listeners is fine
        let _ = self.notices.send(notice);
    }

    /// Release the active session's subscriptions and connection.
    fn teardown(&self, active: &mut ActiveSession) -> Option<SessionId> {
        let session_id = active.session_id.take();
        for mut subscription in active.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        if let Some(id) = &session_id {
            let closed = self.registry.close_connection(id);
            debug!(session_id = %id, closed, "session torn down");
        }
        session_id
    }

    fn fail(&self, session_id: &SessionId, error: SyncError) -> SyncError {
        {
            let mut active = self.active.lock();
            let _ = self.teardown(&mut active);
            active.state = SessionState::Idle;
        }
        warn!(
            session_id = %session_id,
            error_kind = error.error_kind(),
            error = %error,
            "processing request failed"
        );
        self.notify(ControllerNotice::Error {
            session_id: session_id.clone(),
            error: error.clone(),
        });
        error
    }

    /// Send `content`, recovering once from an unknown derived id.
    async fn send(&self, target: &SessionId, effective: SessionId, content: &str) -> Result<SessionId> {
        let error = match self.api.send_input(&effective, content).await {
            Ok(()) => return Ok(effective),
            Err(error) => error,
        };

        let is_fallback = &effective != target;
        if !error.is_not_found() || effective.is_base_of(&self.flow_id) || is_fallback {
            if is_fallback && error.is_not_found() {
                // the server forgot it; the next request starts from the derived id again
                let _ = self.fallbacks.remove(target);
            }
            return Err(error);
        }

        warn!(session_id = %effective, "derived session unknown; creating fallback");
        let fallback = self.api.create_session(&self.flow_id).await?;
        self.api.send_input(&fallback, content).await?;

        let _ = self.fallbacks.insert(target.clone(), fallback.clone());
        info!(derived = %target, fallback = %fallback, "fallback session adopted");
        self.notify(ControllerNotice::FallbackAdopted {
            derived: target.clone(),
            fallback: fallback.clone(),
        });
        Ok(fallback)
    }

    fn handle(&self, SessionEvent { session_id, event }: SessionEvent) {
        let event_type = event.event_type();
        let tracked = self.active.lock().session_id.clone();
        if !is_active_session(tracked.as_ref(), &session_id) {
            trace!(session_id = %session_id, %event_type, "event for inactive session ignored");
            return;
        }

        match event {
            StreamEvent::StateUpdated(update) => self.apply_state_update(&session_id, update),
            StreamEvent::Token(text) => self.notify(ControllerNotice::Token(text)),
            StreamEvent::ToolStart { name } => self.notify(ControllerNotice::ToolStarted { name }),
            StreamEvent::ToolEnd { name } => self.notify(ControllerNotice::ToolFinished { name }),
            StreamEvent::TaskProgress(progress) => self.notify(ControllerNotice::TaskProgress(progress)),
            StreamEvent::Ping | StreamEvent::MessageSaved => {
                trace!(session_id = %session_id, %event_type, "informational event");
            }
            StreamEvent::StreamEnd | StreamEvent::Close => self.settle(&session_id, None),
            StreamEvent::ServerError { message } => {
                let message = message.unwrap_or_else(|| "server reported an error".into());
                self.settle(&session_id, Some(SyncError::Application(message)));
            }
            StreamEvent::ConnectionError { message } => {
                let message = message.unwrap_or_else(|| "connection lost".into());
                self.settle(&session_id, Some(SyncError::Transport(message)));
            }
        }
    }

    fn apply_state_update(&self, session_id: &SessionId, update: StateUpdate) {
        let Some(update_flow) = update.flow_id.as_deref() else {
            warn!(session_id = %session_id, "state update without flow_id discarded");
            return;
        };
        if !should_apply_state_update(&self.flow_id, Some(update_flow)) {
            debug!(
                session_id = %session_id,
                flow_id = %self.flow_id,
                update_flow,
                "state update for another flow discarded"
            );
            return;
        }
        let Some(patch) = update.agent_state else {
            warn!(session_id = %session_id, "state update without agent_state discarded");
            return;
        };

        let outcome = self.store.merge_agent_state(patch);
        debug!(
            session_id = %session_id,
            changed = outcome.changed,
            tasks_changed = outcome.tasks_changed,
            "agent state merged"
        );
        if outcome.changed {
            self.notify(ControllerNotice::AgentStateChanged {
                tasks_changed: outcome.tasks_changed,
            });
        }
    }

    fn settle(&self, session_id: &SessionId, error: Option<SyncError>) {
        {
            let mut active = self.active.lock();
            if active.session_id.as_ref() != Some(session_id) {
                return;
            }
            let _ = self.teardown(&mut active);
            active.state = SessionState::Settled;
        }
        match error {
            Some(error) => {
                warn!(
                    session_id = %session_id,
                    error_kind = error.error_kind(),
                    error = %error,
                    "session ended with error"
                );
                self.notify(ControllerNotice::Error {
                    session_id: session_id.clone(),
                    error,
                });
            }
            None => info!(session_id = %session_id, "session settled"),
        }
        self.notify(ControllerNotice::Settled {
            session_id: session_id.clone(),
        });
    }
}

/// Sends work to a flow's sessions and applies what they stream back.
pub struct SessionController {
    inner: Arc<ControllerInner>,
    dispatch: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl SessionController {
    /// Controller for `flow_id`. Spawns the dispatch loop, so it must be
    /// called inside a Tokio runtime.
    pub fn new(
        flow_id: FlowId,
        registry: Arc<ConnectionRegistry>,
        api: Arc<dyn SessionApi>,
        store: Arc<ReconciliationStore>,
    ) -> Self {
        let (sink, mut events) = mpsc::unbounded_channel::<SessionEvent>();
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        let inner = Arc::new(ControllerInner {
            flow_id,
            registry,
            api,
            store,
            fallbacks: DashMap::new(),
            active: Mutex::new(ActiveSession::default()),
            sink,
            notices,
        });
        let cancel = CancellationToken::new();

        let dispatcher = Arc::clone(&inner);
        let token = cancel.clone();
        drop(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => dispatcher.handle(event),
                        None => break,
                    },
                }
            }
            debug!(flow_id = %dispatcher.flow_id, "dispatch loop stopped");
        }));

        Self {
            inner,
            dispatch: tokio::sync::Mutex::new(()),
            cancel,
        }
    }

    /// Flow this controller works on.
    pub fn flow_id(&self) -> &FlowId {
        &self.inner.flow_id
    }

    /// Send `content` to the flow, or to one of its tasks or task details,
    /// and start streaming the session's events.
    ///
    /// Returns the session that accepted the request: the computed id, or a
    /// fallback if the derived id was unknown to the server. Calls are
    /// serialized.
    #[instrument(skip(self, content), fields(flow_id = %self.inner.flow_id))]
    pub async fn start_processing(
        &self,
        content: &str,
        task_index: Option<usize>,
        detail_index: Option<usize>,
    ) -> Result<SessionId> {
        let _serial = self.dispatch.lock().await;
        let inner = &self.inner;

        let target = SessionId::derived(&inner.flow_id, task_index, detail_index);
        let effective = inner
            .fallbacks
            .get(&target)
            .map_or_else(|| target.clone(), |entry| entry.value().clone());

        let cleanups = {
            let mut active = inner.active.lock();
            if active.session_id.as_ref().is_some_and(|current| current != &effective) {
                let _ = inner.teardown(&mut active);
            }
            active.session_id = Some(effective.clone());
            active.state = SessionState::Dispatching;
            active.cleanups
        };
        inner.store.set_user_request(content);
        info!(session_id = %effective, "dispatching request");

        let accepted = match inner.send(&target, effective.clone(), content).await {
            Ok(accepted) => accepted,
            Err(error) => return Err(inner.fail(&effective, error)),
        };

        let mut active = inner.active.lock();
        if active.cleanups != cleanups {
            drop(active);
            let error = SyncError::InvalidState("session was cleaned up during dispatch".into());
            return Err(inner.fail(&accepted, error));
        }
        if active.session_id.as_ref() != Some(&effective) {
            // the previous request's stream ended meanwhile; this one still runs
            debug!(session_id = %accepted, "session settled during dispatch; resubscribing");
        }
        active.session_id = Some(accepted.clone());
        let subscribed = active
            .subscriptions
            .first()
            .is_some_and(|subscription| subscription.session_id() == &accepted);
        if !subscribed {
            for mut stale in active.subscriptions.drain(..) {
                stale.unsubscribe();
            }
            active.subscriptions = EventType::SESSION_EVENTS
                .iter()
                .map(|&event_type| inner.registry.subscribe(&accepted, event_type, inner.sink.clone()))
                .collect();
        }
        active.state = SessionState::Streaming;
        debug!(session_id = %accepted, resubscribed = !subscribed, "streaming");
        Ok(accepted)
    }

    /// Release every subscription of the active session, forget it, and close
    /// its connection. Idempotent.
    pub fn cleanup_subscriptions(&self) {
        let mut active = self.inner.active.lock();
        let _ = self.inner.teardown(&mut active);
        active.state = SessionState::Idle;
        active.cleanups += 1;
    }

    /// Cleanup plus forgetting every adopted fallback session.
    pub fn reset(&self) {
        self.cleanup_subscriptions();
        let forgotten = self.inner.fallbacks.len();
        self.inner.fallbacks.clear();
        info!(flow_id = %self.inner.flow_id, forgotten, "session controller reset");
    }

    /// Fetch the flow's agent state and replace the store's copy with it.
    #[instrument(skip(self), fields(flow_id = %self.inner.flow_id))]
    pub async fn refresh_agent_state(&self) -> Result<()> {
        match self.inner.api.agent_state(&self.inner.flow_id).await {
            Ok(state) => {
                self.inner.store.replace_agent_state(state);
                debug!("agent state refreshed");
                Ok(())
            }
            Err(error) => {
                warn!(error_kind = error.error_kind(), error = %error, "agent state refresh failed");
                Err(error)
            }
        }
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> SessionState {
        self.inner.active.lock().state
    }

    /// Session currently tracked, if any.
    pub fn active_session(&self) -> Option<SessionId> {
        self.inner.active.lock().session_id.clone()
    }

    /// Fallback adopted for a derived session id.
    pub fn fallback_for(&self, derived: &SessionId) -> Option<SessionId> {
        self.inner.fallbacks.get(derived).map(|entry| entry.value().clone())
    }

    /// Receive notices for the UI.
    pub fn notices(&self) -> broadcast::Receiver<ControllerNotice> {
        self.inner.notices.subscribe()
    }

    /// Stop the dispatch loop and release the active session.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.cleanup_subscriptions();
    }
}

impl Drop for SessionController {
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
    use assert_matches::assert_matches;
    use flowsync_core::agent::{AgentState, AgentTask};
    use flowsync_core::document::{FlowData, FlowRecord, Node, Position};
    use flowsync_logging::capture_logs;
    use flowsync_stream::SseFrame;
    use flowsync_stream::mock::{ChannelTransport, ScriptedSessionApi};
    use tracing::Level;

    struct Harness {
        transport: Arc<ChannelTransport>,
        api: Arc<ScriptedSessionApi>,
        store: Arc<ReconciliationStore>,
        registry: Arc<ConnectionRegistry>,
        controller: SessionController,
    }

    fn harness() -> Harness {
        let transport = Arc::new(ChannelTransport::new());
        let api = Arc::new(ScriptedSessionApi::new());
        let store = Arc::new(ReconciliationStore::new(100));
        store.load(&FlowRecord {
            id: FlowId::from("F1"),
            name: "Trip".into(),
            flow_data: FlowData {
                nodes: vec![Node::new("start", "Start", Position::new(0.0, 0.0))],
                edges: vec![],
            },
            updated_at: None,
        });
        let registry = ConnectionRegistry::new(transport.clone(), None);
        let controller = SessionController::new(
            FlowId::from("F1"),
            Arc::clone(&registry),
            api.clone(),
            Arc::clone(&store),
        );
        Harness {
            transport,
            api,
            store,
            registry,
            controller,
        }
    }

    fn sid(s: &str) -> SessionId {
        SessionId::from(s)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn drain(rx: &mut broadcast::Receiver<ControllerNotice>) -> Vec<ControllerNotice> {
        let mut out = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            out.push(notice);
        }
        out
    }

    #[tokio::test]
    async fn base_request_subscribes_every_session_event() {
        let h = harness();
        let session = h.controller.start_processing("plan a trip", None, None).await.unwrap();

        assert_eq!(session, sid("F1"));
        assert_eq!(h.registry.subscriber_count(&session), EventType::SESSION_EVENTS.len());
        assert!(h.registry.is_connected(&session));
        assert_eq!(h.controller.state(), SessionState::Streaming);
        assert_eq!(h.controller.active_session(), Some(sid("F1")));
        assert_eq!(h.api.sends(), vec![(sid("F1"), "plan a trip".to_string())]);
        assert_eq!(h.store.agent_state().user_request, "plan a trip");
    }

    #[tokio::test]
    async fn repeated_request_to_same_session_keeps_subscriptions() {
        let h = harness();
        let _ = h.controller.start_processing("one", None, None).await.unwrap();
        let _ = h.controller.start_processing("two", None, None).await.unwrap();

        assert_eq!(h.registry.subscriber_count(&sid("F1")), EventType::SESSION_EVENTS.len());
        assert_eq!(h.transport.opens(&sid("F1")), 1);
    }

    #[tokio::test]
    async fn stream_end_during_repeat_request_resubscribes() {
        let h = harness();
        let first = h.controller.start_processing("one", None, None).await.unwrap();
        let gate = h.api.gate_sends();

        let (second, ()) = tokio::join!(h.controller.start_processing("two", None, None), async {
            settle().await;
            assert_eq!(h.controller.state(), SessionState::Dispatching);
            assert!(h.transport.push(&first, SseFrame::new("stream_end", "")));
            settle().await;
            assert_eq!(h.registry.subscriber_count(&first), 0);
            gate.add_permits(1);
        });

        assert_eq!(second.unwrap(), sid("F1"));
        assert_eq!(h.controller.state(), SessionState::Streaming);
        assert_eq!(h.controller.active_session(), Some(sid("F1")));
        assert_eq!(h.registry.subscriber_count(&first), EventType::SESSION_EVENTS.len());
        assert!(h.registry.is_connected(&first));
        settle().await;
        assert_eq!(h.transport.opens(&first), 2);
    }

    #[tokio::test]
    async fn cleanup_during_dispatch_cancels_request() {
        let h = harness();
        let gate = h.api.gate_sends();

        let (result, ()) = tokio::join!(h.controller.start_processing("one", None, None), async {
            settle().await;
            h.controller.cleanup_subscriptions();
            gate.add_permits(1);
        });

        assert_matches!(result, Err(SyncError::InvalidState(_)));
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(h.controller.active_session(), None);
        assert_eq!(h.registry.subscriber_count(&sid("F1")), 0);
    }

    #[tokio::test]
    async fn unknown_derived_session_falls_back_once() {
        let h = harness();
        let mut notices = h.controller.notices();
        h.api.reject("F1_task_2");
        h.api.queue_fallback("fb-1");

        let session = h.controller.start_processing("add review", Some(2), None).await.unwrap();
        assert_eq!(session, sid("fb-1"));
        assert_eq!(
            h.api.sends(),
            vec![
                (sid("F1_task_2"), "add review".to_string()),
                (sid("fb-1"), "add review".to_string()),
            ]
        );
        assert_eq!(h.api.created(), vec![FlowId::from("F1")]);
        assert_eq!(h.registry.subscriber_count(&sid("fb-1")), EventType::SESSION_EVENTS.len());
        assert_eq!(h.registry.subscriber_count(&sid("F1_task_2")), 0);
        assert_matches!(
            drain(&mut notices).as_slice(),
            [ControllerNotice::FallbackAdopted { derived, fallback }]
                if derived == &sid("F1_task_2") && fallback == &sid("fb-1")
        );

        // the adopted fallback is targeted directly next time
        let again = h.controller.start_processing("and again", Some(2), None).await.unwrap();
        assert_eq!(again, sid("fb-1"));
        assert_eq!(h.api.sends().len(), 3);
        assert_eq!(h.api.created().len(), 1);
    }

    #[tokio::test]
    async fn detail_sessions_fall_back_independently() {
        let h = harness();
        h.api.reject("F1_task_0_detail_1");
        h.api.reject("F1_task_3");
        h.api.queue_fallback("fb-a");
        h.api.queue_fallback("fb-b");

        let a = h.controller.start_processing("x", Some(0), Some(1)).await.unwrap();
        let b = h.controller.start_processing("y", Some(3), None).await.unwrap();
        assert_eq!(a, sid("fb-a"));
        assert_eq!(b, sid("fb-b"));
        assert_eq!(h.controller.fallback_for(&sid("F1_task_0_detail_1")), Some(sid("fb-a")));
        assert_eq!(h.controller.fallback_for(&sid("F1_task_3")), Some(sid("fb-b")));
        // switching sessions released the first one
        assert!(!h.registry.is_connected(&sid("fb-a")));
    }

    #[tokio::test]
    async fn unknown_base_session_is_fatal() {
        let h = harness();
        let mut notices = h.controller.notices();
        h.api.reject("F1");

        let err = h.controller.start_processing("x", None, None).await.unwrap_err();
        assert_eq!(err.missing_session(), Some(&sid("F1")));
        assert!(h.api.created().is_empty());
        assert_eq!(h.controller.active_session(), None);
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(h.registry.connection_count(), 0);
        assert_matches!(drain(&mut notices).as_slice(), [ControllerNotice::Error { .. }]);
    }

    #[tokio::test]
    async fn unknown_fallback_is_fatal_without_nesting() {
        let h = harness();
        h.api.reject("F1_task_1");
        h.api.reject("fb-1");
        h.api.queue_fallback("fb-1");

        let err = h.controller.start_processing("x", Some(1), None).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(h.api.created().len(), 1);
        assert_eq!(h.api.sends().len(), 2);
        assert_eq!(h.controller.active_session(), None);
        assert_eq!(h.controller.fallback_for(&sid("F1_task_1")), None);
    }

    #[tokio::test]
    async fn other_send_failures_do_not_fall_back() {
        let h = harness();
        h.api.fail_send(
            "F1_task_0",
            SyncError::Http {
                status: 500,
                body: "boom".into(),
            },
        );

        let err = h.controller.start_processing("x", Some(0), None).await.unwrap_err();
        assert_matches!(err, SyncError::Http { status: 500, .. });
        assert!(h.api.created().is_empty());
        assert_eq!(h.registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn stream_end_tears_down() {
        let h = harness();
        let mut notices = h.controller.notices();
        let session = h.controller.start_processing("x", None, None).await.unwrap();

        assert!(h.transport.push(&session, SseFrame::new("stream_end", "")));
        settle().await;

        assert_eq!(h.controller.state(), SessionState::Settled);
        assert_eq!(h.controller.active_session(), None);
        assert_eq!(h.registry.subscriber_count(&session), 0);
        assert!(!h.registry.is_connected(&session));
        assert_matches!(
            drain(&mut notices).as_slice(),
            [ControllerNotice::Settled { session_id }] if session_id == &session
        );
    }

    #[tokio::test]
    async fn server_error_surfaces_and_tears_down() {
        let h = harness();
        let mut notices = h.controller.notices();
        let session = h.controller.start_processing("x", None, None).await.unwrap();

        assert!(h.transport.push(&session, SseFrame::new("server_error_event", r#"{"message":"quota"}"#)));
        settle().await;

        let seen = drain(&mut notices);
        assert_matches!(
            &seen[0],
            ControllerNotice::Error { error: SyncError::Application(msg), .. } if msg == "quota"
        );
        assert_matches!(&seen[1], ControllerNotice::Settled { .. });
        assert!(!h.registry.is_connected(&session));
    }

    #[tokio::test]
    async fn transport_failure_tears_down() {
        let h = harness();
        let mut notices = h.controller.notices();
        let session = h.controller.start_processing("x", None, None).await.unwrap();

        assert!(h.transport.fail(&session, SyncError::Transport("reset by peer".into())));
        settle().await;

        assert_eq!(h.controller.state(), SessionState::Settled);
        assert_eq!(h.registry.connection_count(), 0);
        assert_matches!(
            drain(&mut notices).first(),
            Some(ControllerNotice::Error { error: SyncError::Transport(_), .. })
        );
    }

    #[tokio::test]
    async fn stream_notices_arrive_in_order() {
        let h = harness();
        let mut notices = h.controller.notices();
        let session = h.controller.start_processing("x", None, None).await.unwrap();

        for (name, data) in [
            ("token", r#""Hel""#),
            ("tool_start", r#"{"name":"search"}"#),
            ("tool_end", r#"{"name":"search"}"#),
            ("ping", ""),
            ("token", "lo"),
            ("task_progress", r#"{"task_index":0,"task_name":"Book","status":"running"}"#),
        ] {
            assert!(h.transport.push(&session, SseFrame::new(name, data)));
        }
        settle().await;

        let seen = drain(&mut notices);
        assert_eq!(seen.len(), 5);
        assert_matches!(&seen[0], ControllerNotice::Token(t) if t == "Hel");
        assert_matches!(&seen[1], ControllerNotice::ToolStarted { name: Some(n) } if n == "search");
        assert_matches!(&seen[2], ControllerNotice::ToolFinished { .. });
        assert_matches!(&seen[3], ControllerNotice::Token(t) if t == "lo");
        assert_matches!(&seen[4], ControllerNotice::TaskProgress(p) if p.task_name == "Book");
        assert_eq!(h.controller.state(), SessionState::Streaming);
    }

    #[tokio::test]
    async fn state_update_for_active_flow_regenerates_tasks() {
        let h = harness();
        let session = h.controller.start_processing("x", Some(0), None).await.unwrap();

        let frame = r#"{"flow_id":"F1","agent_state":{"tasks":[{"name":"Book","type":"step"}],"dialog_state":"executing"}}"#;
        assert!(h.transport.push(&session, SseFrame::new("state_updated", frame)));
        settle().await;

        let agent = h.store.agent_state();
        assert_eq!(agent.tasks.len(), 1);
        assert_eq!(agent.user_request, "x");
        assert!(h.store.document().node("task_0").is_some());
    }

    #[tokio::test]
    async fn state_update_for_other_flow_or_incomplete_is_discarded() {
        let h = harness();
        let (logs, _guard) = capture_logs();
        let session = h.controller.start_processing("x", None, None).await.unwrap();

        for frame in [
            r#"{"flow_id":"F2","agent_state":{"tasks":[{"name":"Other"}]}}"#,
            r#"{"agent_state":{"tasks":[{"name":"Orphan"}]}}"#,
            r#"{"flow_id":"F1"}"#,
        ] {
            assert!(h.transport.push(&session, SseFrame::new("state_updated", frame)));
        }
        settle().await;

        assert!(h.store.agent_state().tasks.is_empty());
        assert!(logs.has_message("state update for another flow discarded"));
        assert!(logs.has_message("state update without flow_id discarded"));
        assert!(logs.has_message("state update without agent_state discarded"));
        assert_eq!(h.controller.state(), SessionState::Streaming);
    }

    #[tokio::test]
    async fn switching_sessions_ignores_the_old_one() {
        let h = harness();
        let old = h.controller.start_processing("x", Some(1), None).await.unwrap();
        // queued on the old connection but not yet read
        assert!(h.transport.push(&old, SseFrame::new("stream_end", "")));

        let new = h.controller.start_processing("y", None, None).await.unwrap();
        settle().await;

        assert_eq!(h.registry.subscriber_count(&old), 0);
        assert!(!h.registry.is_connected(&old));
        assert_eq!(h.controller.active_session(), Some(new));
        assert_eq!(h.controller.state(), SessionState::Streaming);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let h = harness();
        let session = h.controller.start_processing("x", None, None).await.unwrap();

        h.controller.cleanup_subscriptions();
        h.controller.cleanup_subscriptions();
        assert_eq!(h.controller.active_session(), None);
        assert_eq!(h.controller.state(), SessionState::Idle);
        assert_eq!(h.registry.subscriber_count(&session), 0);
        assert_eq!(h.registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn reset_forgets_fallbacks() {
        let h = harness();
        h.api.reject("F1_task_2");
        let first = h.controller.start_processing("x", Some(2), None).await.unwrap();
        h.controller.reset();

        assert_eq!(h.controller.fallback_for(&sid("F1_task_2")), None);
        let second = h.controller.start_processing("x", Some(2), None).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(h.api.created().len(), 2);
    }

    #[tokio::test]
    async fn refresh_replaces_agent_state() {
        let h = harness();
        h.api.set_agent_state(AgentState {
            tasks: vec![AgentTask {
                name: "Fetched".into(),
                ..AgentTask::default()
            }],
            user_request: "from server".into(),
            ..AgentState::default()
        });

        h.controller.refresh_agent_state().await.unwrap();
        let agent = h.store.agent_state();
        assert_eq!(agent.user_request, "from server");
        assert_eq!(h.store.document().node("task_0").unwrap().data.label, "Fetched");

        h.api.fail_agent_state(SyncError::Fetch("503".into()));
        let err = h.controller.refresh_agent_state().await.unwrap_err();
        assert_matches!(err, SyncError::Fetch(_));
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped_without_teardown() {
        let h = harness();
        let (logs, _guard) = capture_logs();
        let session = h.controller.start_processing("x", None, None).await.unwrap();

        assert!(h.transport.push(&session, SseFrame::new("state_updated", "{not json")));
        settle().await;

        assert_eq!(h.controller.state(), SessionState::Streaming);
        assert!(logs.count_at_level(Level::WARN) >= 1);
    }
}
