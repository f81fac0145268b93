//! Connection registry and event dispatcher.
//!
//! Holds at most one live frame stream per session id. Subscribers register
//! an [`EventSink`] for one `(session, event type)` channel and get back a
//! [`Subscription`] that unsubscribes when dropped. When the last subscriber
//! of a session goes away its connection is closed.
//!
//! Each connection is read by its own task. A transport failure (stream
//! error, server EOF, idle timeout) is delivered to the session's
//! `connection_error` subscribers and then closes the connection. No retry
//! happens here.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use flowsync_core::errors::SyncError;
use flowsync_core::events::{DEFAULT_EVENT_NAME, EventType, SessionEvent, StreamEvent};
use flowsync_core::ids::SessionId;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::transport::{EventTransport, FrameStream, SseFrame};

/// Receiving end of a subscription.
pub type EventSink = mpsc::UnboundedSender<SessionEvent>;

struct ConnectionEntry {
    generation: u64,
    cancel: CancellationToken,
    subscribers: usize,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<SessionId, ConnectionEntry>,
    channels: HashMap<(SessionId, EventType), Vec<(u64, EventSink)>>,
    next_subscription: u64,
    next_generation: u64,
}

/// Process-wide multiplexer of server-push connections.
///
/// Construct once and share as `Arc<ConnectionRegistry>`. Methods that may
/// open a connection spawn a reader task and must run inside a Tokio runtime.
pub struct ConnectionRegistry {
    transport: Arc<dyn EventTransport>,
    idle_timeout: Option<Duration>,
    state: Mutex<RegistryState>,
    this: Weak<ConnectionRegistry>,
}

impl ConnectionRegistry {
    /// New registry opening connections through `transport`.
    ///
    /// A connection that produces no frame for `idle_timeout` is treated as
    /// failed.
    pub fn new(transport: Arc<dyn EventTransport>, idle_timeout: Option<Duration>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            transport,
            idle_timeout,
            state: Mutex::new(RegistryState::default()),
            this: this.clone(),
        })
    }

    /// Register `sink` for `event_type` frames of `session_id`, opening the
    /// session's connection if needed.
    pub fn subscribe(&self, session_id: &SessionId, event_type: EventType, sink: EventSink) -> Subscription {
        let mut state = self.state.lock();
        let _ = self.open_locked(&mut state, session_id);

        state.next_subscription += 1;
        let id = state.next_subscription;
        state
            .channels
            .entry((session_id.clone(), event_type))
            .or_default()
            .push((id, sink));
        let subscribers = state.connections.get_mut(session_id).map_or(0, |entry| {
            entry.subscribers += 1;
            entry.subscribers
        });
        debug!(session_id = %session_id, event_type = %event_type, subscribers, "subscribed");

        Subscription {
            registry: self.this.clone(),
            session_id: session_id.clone(),
            event_type,
            id: Some(id),
        }
    }

    /// Open the session's connection unless one is already registered.
    ///
    /// Returns whether a new connection was started. A connection opened here
    /// without any subscriber stays open until [`close_connection`] or a
    /// transport failure.
    ///
    /// [`close_connection`]: Self::close_connection
    pub fn ensure_connection(&self, session_id: &SessionId) -> bool {
        let mut state = self.state.lock();
        self.open_locked(&mut state, session_id)
    }

    /// Close the session's connection and drop all of its channels.
    ///
    /// `close` subscribers receive [`StreamEvent::Close`] first. Returns
    /// `false` if the session had no connection.
    pub fn close_connection(&self, session_id: &SessionId) -> bool {
        let mut state = self.state.lock();
        close_locked(&mut state, session_id)
    }

    /// Close every connection. Returns how many were open.
    pub fn shutdown(&self) -> usize {
        let mut state = self.state.lock();
        let sessions: Vec<SessionId> = state.connections.keys().cloned().collect();
        let closed = sessions
            .iter()
            .filter(|id| close_locked(&mut state, id))
            .count();
        info!(closed, "connection registry shut down");
        closed
    }

    /// Decode and deliver one frame to the session's subscribers.
    ///
    /// Unnamed frames, the generic `message` name, unknown names and
    /// malformed payloads are dropped. A no-op for sessions without a
    /// connection.
    pub fn dispatch_frame(&self, session_id: &SessionId, event_name: &str, data: &str) {
        let state = self.state.lock();
        if state.connections.contains_key(session_id) {
            dispatch_locked(&state, session_id, event_name, data);
        }
    }

    /// Whether the session has a live connection.
    pub fn is_connected(&self, session_id: &SessionId) -> bool {
        self.state.lock().connections.contains_key(session_id)
    }

    /// Total subscribers of the session across all event types.
    pub fn subscriber_count(&self, session_id: &SessionId) -> usize {
        self.state
            .lock()
            .connections
            .get(session_id)
            .map_or(0, |entry| entry.subscribers)
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    fn open_locked(&self, state: &mut RegistryState, session_id: &SessionId) -> bool {
        if state.connections.contains_key(session_id) {
            return false;
        }
        state.next_generation += 1;
        let generation = state.next_generation;
        let cancel = CancellationToken::new();

        let reader = Reader {
            registry: self.this.clone(),
            transport: Arc::clone(&self.transport),
            session_id: session_id.clone(),
            generation,
            cancel: cancel.clone(),
            idle_timeout: self.idle_timeout,
        };
        drop(tokio::spawn(reader.run()));

        let _ = state.connections.insert(
            session_id.clone(),
            ConnectionEntry {
                generation,
                cancel,
                subscribers: 0,
            },
        );
        info!(session_id = %session_id, generation, "opening event stream");
        true
    }

    fn unsubscribe(&self, session_id: &SessionId, event_type: EventType, id: u64) {
        let mut state = self.state.lock();
        let key = (session_id.clone(), event_type);
        let Some(sinks) = state.channels.get_mut(&key) else {
            return;
        };
        let before = sinks.len();
        sinks.retain(|(sink_id, _)| *sink_id != id);
        if sinks.len() == before {
            return;
        }
        if sinks.is_empty() {
            let _ = state.channels.remove(&key);
        }

        let Some(entry) = state.connections.get_mut(session_id) else {
            return;
        };
        entry.subscribers = entry.subscribers.saturating_sub(1);
        let remaining = entry.subscribers;
        debug!(session_id = %session_id, event_type = %event_type, remaining, "unsubscribed");
        if remaining == 0 {
            let _ = close_locked(&mut state, session_id);
        }
    }

    /// Deliver a frame read by connection `generation`. Returns `false` when
    /// that connection is no longer the registered one.
    fn dispatch_from(&self, session_id: &SessionId, generation: u64, frame: &SseFrame) -> bool {
        let state = self.state.lock();
        if !is_current(&state, session_id, generation) {
            return false;
        }
        dispatch_locked(&state, session_id, &frame.event, &frame.data);
        true
    }

    fn fail_connection(&self, session_id: &SessionId, generation: u64, error: &SyncError) {
        let mut state = self.state.lock();
        if !is_current(&state, session_id, generation) {
            return;
        }
        warn!(
            session_id = %session_id,
            error_kind = error.error_kind(),
            error = %error,
            "event stream failed"
        );
        let _ = deliver(
            &state,
            session_id,
            &StreamEvent::ConnectionError {
                message: Some(error.to_string()),
            },
        );
        let _ = close_locked(&mut state, session_id);
    }
}

fn is_current(state: &RegistryState, session_id: &SessionId, generation: u64) -> bool {
    state
        .connections
        .get(session_id)
        .is_some_and(|entry| entry.generation == generation)
}

fn close_locked(state: &mut RegistryState, session_id: &SessionId) -> bool {
    let Some(entry) = state.connections.remove(session_id) else {
        return false;
    };
    entry.cancel.cancel();
    let notified = deliver(state, session_id, &StreamEvent::Close);
    for event_type in EventType::SESSION_EVENTS.into_iter().chain([EventType::Close]) {
        let _ = state.channels.remove(&(session_id.clone(), event_type));
    }
    info!(session_id = %session_id, notified, "event stream closed");
    true
}

fn dispatch_locked(state: &RegistryState, session_id: &SessionId, event_name: &str, data: &str) {
    if event_name.is_empty() || event_name == DEFAULT_EVENT_NAME {
        trace!(session_id = %session_id, "ignoring unnamed frame");
        return;
    }
    let Some(event_type) = EventType::from_wire(event_name) else {
        debug!(session_id = %session_id, event = event_name, "ignoring unknown event");
        return;
    };
    match StreamEvent::decode(event_type, data) {
        Ok(event) => {
            let delivered = deliver(state, session_id, &event);
            trace!(session_id = %session_id, event_type = %event_type, delivered, "frame dispatched");
        }
        Err(error) => {
            warn!(
                session_id = %session_id,
                event_type = %event_type,
                error_kind = error.error_kind(),
                error = %error,
                "dropping malformed frame"
            );
        }
    }
}

fn deliver(state: &RegistryState, session_id: &SessionId, event: &StreamEvent) -> usize {
    let Some(sinks) = state.channels.get(&(session_id.clone(), event.event_type())) else {
        return 0;
    };
    sinks
        .iter()
        .filter(|(_, sink)| {
            sink.send(SessionEvent {
                session_id: session_id.clone(),
                event: event.clone(),
            })
            .is_ok()
        })
        .count()
}

struct Reader {
    registry: Weak<ConnectionRegistry>,
    transport: Arc<dyn EventTransport>,
    session_id: SessionId,
    generation: u64,
    cancel: CancellationToken,
    idle_timeout: Option<Duration>,
}

impl Reader {
    async fn run(self) {
        let opened = tokio::select! {
            () = self.cancel.cancelled() => return,
            result = self.transport.open(&self.session_id) => result,
        };
        let mut frames = match opened {
            Ok(frames) => frames,
            Err(error) => {
                self.fail(&error);
                return;
            }
        };

        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => return,
                next = next_frame(&mut frames, self.idle_timeout) => next,
            };
            let Some(registry) = self.registry.upgrade() else {
                return;
            };
            let failure = match next {
                Ok(Some(Ok(frame))) => {
                    if registry.dispatch_from(&self.session_id, self.generation, &frame) {
                        continue;
                    }
                    return;
                }
                Ok(Some(Err(error))) => error,
                Ok(None) => SyncError::Transport("stream closed by server".into()),
                Err(limit) => SyncError::Timeout(limit),
            };
            registry.fail_connection(&self.session_id, self.generation, &failure);
            return;
        }
    }

    fn fail(&self, error: &SyncError) {
        if let Some(registry) = self.registry.upgrade() {
            registry.fail_connection(&self.session_id, self.generation, error);
        }
    }
}

type NextFrame = Option<flowsync_core::errors::Result<SseFrame>>;

async fn next_frame(frames: &mut FrameStream, idle: Option<Duration>) -> Result<NextFrame, Duration> {
    match idle {
        Some(limit) => tokio::time::timeout(limit, frames.next())
            .await
            .map_err(|_| limit),
        None => Ok(frames.next().await),
    }
}

/// Handle for one registered sink.
///
/// Dropping it, or calling [`unsubscribe`](Self::unsubscribe), removes the
/// sink. Both are idempotent and safe after the connection was closed.
#[derive(Debug)]
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    registry: Weak<ConnectionRegistry>,
    session_id: SessionId,
    event_type: EventType,
    id: Option<u64>,
}

impl Subscription {
    /// Session the sink is registered on.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Event type the sink receives.
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Remove the sink. Later calls do nothing.
    pub fn unsubscribe(&mut self) {
        if let Some(id) = self.id.take() {
            if let Some(registry) = self.registry.upgrade() {
                registry.unsubscribe(&self.session_id, self.event_type, id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
