//! In-memory collaborators for tests.
//!
//! [`ChannelTransport`] hands out frame streams that tests feed by hand.
//! [`ScriptedSessionApi`] answers session calls from a script and records
//! what it was asked.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use flowsync_core::agent::AgentState;
use flowsync_core::errors::{Result, SyncError};
use flowsync_core::ids::{FlowId, SessionId};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::api::SessionApi;
use crate::transport::{EventTransport, FrameStream, SseFrame};

type FrameSender = mpsc::UnboundedSender<Result<SseFrame>>;
type FrameReceiver = mpsc::UnboundedReceiver<Result<SseFrame>>;

struct Pipe {
    tx: FrameSender,
    rx: Option<FrameReceiver>,
}

impl Pipe {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

#[derive(Default)]
struct TransportState {
    pipes: HashMap<SessionId, Pipe>,
    opens: HashMap<SessionId, usize>,
    open_failures: HashMap<SessionId, SyncError>,
}

/// Transport whose streams are fed through [`push`](Self::push).
///
/// Frames pushed before a session is opened are buffered for its next open.
#[derive(Default)]
pub struct ChannelTransport {
    state: Mutex<TransportState>,
}

impl ChannelTransport {
    /// Empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame on the session's stream. Returns `false` once the
    /// stream's reader has gone away.
    pub fn push(&self, session_id: &SessionId, frame: SseFrame) -> bool {
        self.send(session_id, Ok(frame))
    }

    /// Make the session's stream yield an error.
    pub fn fail(&self, session_id: &SessionId, error: SyncError) -> bool {
        self.send(session_id, Err(error))
    }

    /// End the session's stream, as if the server hung up.
    pub fn end(&self, session_id: &SessionId) {
        let _ = self.state.lock().pipes.remove(session_id);
    }

    /// Make the next `open` of the session fail with `error`.
    pub fn fail_next_open(&self, session_id: &SessionId, error: SyncError) {
        let _ = self
            .state
            .lock()
            .open_failures
            .insert(session_id.clone(), error);
    }

    /// How many times the session was opened.
    pub fn opens(&self, session_id: &SessionId) -> usize {
        self.state.lock().opens.get(session_id).copied().unwrap_or(0)
    }

    /// Opens across all sessions.
    pub fn total_opens(&self) -> usize {
        self.state.lock().opens.values().sum()
    }

    fn send(&self, session_id: &SessionId, item: Result<SseFrame>) -> bool {
        let mut state = self.state.lock();
        let pipe = state
            .pipes
            .entry(session_id.clone())
            .or_insert_with(Pipe::new);
        pipe.tx.send(item).is_ok()
    }
}

#[async_trait]
impl EventTransport for ChannelTransport {
    async fn open(&self, session_id: &SessionId) -> Result<FrameStream> {
        let mut state = self.state.lock();
        *state.opens.entry(session_id.clone()).or_insert(0) += 1;
        if let Some(error) = state.open_failures.remove(session_id) {
            return Err(error);
        }

        let pipe = state
            .pipes
            .entry(session_id.clone())
            .or_insert_with(Pipe::new);
        let rx = match pipe.rx.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                pipe.tx = tx;
                rx
            }
        };
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

#[derive(Default)]
struct ApiScript {
    rejected: HashSet<SessionId>,
    send_failures: HashMap<SessionId, SyncError>,
    fallbacks: VecDeque<SessionId>,
    sends: Vec<(SessionId, String)>,
    created: Vec<FlowId>,
    agent_state: AgentState,
    agent_state_error: Option<SyncError>,
    send_gate: Option<Arc<Semaphore>>,
}

/// [`SessionApi`] answering from a script.
///
/// Sessions are accepted unless [`reject`](Self::reject)ed. Fallback ids are
/// handed out in the order they were queued, then generated.
#[derive(Default)]
pub struct ScriptedSessionApi {
    script: Mutex<ApiScript>,
}

impl ScriptedSessionApi {
    /// Accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer sends to `session_id` with `SessionNotFound`.
    pub fn reject(&self, session_id: impl Into<SessionId>) {
        let _ = self.script.lock().rejected.insert(session_id.into());
    }

    /// Answer sends to `session_id` with `error`.
    pub fn fail_send(&self, session_id: impl Into<SessionId>, error: SyncError) {
        let _ = self
            .script
            .lock()
            .send_failures
            .insert(session_id.into(), error);
    }

    /// Id returned by the next `create_session`.
    pub fn queue_fallback(&self, session_id: impl Into<SessionId>) {
        self.script.lock().fallbacks.push_back(session_id.into());
    }

    /// State returned by `agent_state`.
    pub fn set_agent_state(&self, state: AgentState) {
        self.script.lock().agent_state = state;
    }

    /// Make `agent_state` fail with `error`.
    pub fn fail_agent_state(&self, error: SyncError) {
        self.script.lock().agent_state_error = Some(error);
    }

    /// Hold every later send until the returned semaphore gets a permit.
    /// Each permit releases one send.
    pub fn gate_sends(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.script.lock().send_gate = Some(Arc::clone(&gate));
        gate
    }

    /// Every `(session, input)` sent, accepted or not.
    pub fn sends(&self) -> Vec<(SessionId, String)> {
        self.script.lock().sends.clone()
    }

    /// Flows a fallback session was created for.
    pub fn created(&self) -> Vec<FlowId> {
        self.script.lock().created.clone()
    }
}

#[async_trait]
impl SessionApi for ScriptedSessionApi {
    async fn send_input(&self, session_id: &SessionId, input: &str) -> Result<()> {
        let gate = {
            let mut script = self.script.lock();
            script.sends.push((session_id.clone(), input.to_string()));
            script.send_gate.clone()
        };
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        let script = self.script.lock();
        if script.rejected.contains(session_id) {
            return Err(SyncError::SessionNotFound {
                session_id: session_id.clone(),
            });
        }
        match script.send_failures.get(session_id) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn create_session(&self, flow_id: &FlowId) -> Result<SessionId> {
        let mut script = self.script.lock();
        script.created.push(flow_id.clone());
        Ok(script
            .fallbacks
            .pop_front()
            .unwrap_or_else(SessionId::new))
    }

    async fn agent_state(&self, _flow_id: &FlowId) -> Result<AgentState> {
        let script = self.script.lock();
        match &script.agent_state_error {
            Some(error) => Err(error.clone()),
            None => Ok(script.agent_state.clone()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn buffered_frames_delivered_on_open() {
        let transport = ChannelTransport::new();
        let s = SessionId::from("S");
        assert!(transport.push(&s, SseFrame::new("ping", "")));

        let mut stream = transport.open(&s).await.unwrap();
        transport.end(&s);
        assert_eq!(stream.next().await.unwrap().unwrap(), SseFrame::new("ping", ""));
        assert!(stream.next().await.is_none());
        assert_eq!(transport.opens(&s), 1);
    }

    #[tokio::test]
    async fn scripted_api_rejects_and_records() {
        let api = ScriptedSessionApi::new();
        api.reject("F1_task_2");
        api.queue_fallback("fb-1");

        let err = api
            .send_input(&SessionId::from("F1_task_2"), "hi")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        let fb = api.create_session(&FlowId::from("F1")).await.unwrap();
        assert_eq!(fb.as_str(), "fb-1");
        api.send_input(&fb, "hi").await.unwrap();

        assert_eq!(api.sends().len(), 2);
        assert_eq!(api.created(), vec![FlowId::from("F1")]);
    }
}
