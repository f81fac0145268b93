//! Server-push event vocabulary.
//!
//! Frames arrive as `(event name, data)` pairs. [`EventType`] names the
//! recognised event kinds and [`StreamEvent::decode`] turns a frame's data
//! into the typed tagged union that subscribers receive.

use std::fmt;

use serde::Deserialize;

use crate::agent::AgentStatePatch;
use crate::errors::SyncError;
use crate::ids::SessionId;
use crate::text::truncate_str;

/// Name the server-push protocol gives to unnamed frames.
pub const DEFAULT_EVENT_NAME: &str = "message";

/// Recognised event kinds. `Close` is synthetic and never arrives on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    /// `state_updated`
    StateUpdated,
    /// `stream_end`
    StreamEnd,
    /// `token`
    Token,
    /// `tool_start`
    ToolStart,
    /// `tool_end`
    ToolEnd,
    /// `connection_error` (also synthesised on transport failure)
    ConnectionError,
    /// `server_error_event`
    ServerError,
    /// `task_progress`
    TaskProgress,
    /// `ping`
    Ping,
    /// `user_message_saved`
    MessageSaved,
    /// Synthetic: the connection for the session was closed.
    Close,
}

impl EventType {
    /// The event types a processing session listens to.
    pub const SESSION_EVENTS: [EventType; 10] = [
        EventType::StateUpdated,
        EventType::StreamEnd,
        EventType::Token,
        EventType::ToolStart,
        EventType::ToolEnd,
        EventType::ConnectionError,
        EventType::ServerError,
        EventType::TaskProgress,
        EventType::Ping,
        EventType::MessageSaved,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StateUpdated => "state_updated",
            Self::StreamEnd => "stream_end",
            Self::Token => "token",
            Self::ToolStart => "tool_start",
            Self::ToolEnd => "tool_end",
            Self::ConnectionError => "connection_error",
            Self::ServerError => "server_error_event",
            Self::TaskProgress => "task_progress",
            Self::Ping => "ping",
            Self::MessageSaved => "user_message_saved",
            Self::Close => "close",
        }
    }

    /// Parse a frame's event name. `Close` is not accepted from the wire.
    pub fn from_wire(name: &str) -> Option<Self> {
        Some(match name {
            "state_updated" => Self::StateUpdated,
            "stream_end" => Self::StreamEnd,
            "token" => Self::Token,
            "tool_start" => Self::ToolStart,
            "tool_end" => Self::ToolEnd,
            "connection_error" => Self::ConnectionError,
            "server_error_event" => Self::ServerError,
            "task_progress" => Self::TaskProgress,
            "ping" => Self::Ping,
            "user_message_saved" => Self::MessageSaved,
            _ => return None,
        })
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of `state_updated`. Both fields are required by the consumer but
/// optional here so that a frame missing them can be logged and discarded by
/// the layer that owns the decision.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StateUpdate {
    /// Flow the update belongs to.
    pub flow_id: Option<String>,
    /// Partial agent state.
    pub agent_state: Option<AgentStatePatch>,
}

/// Payload of `task_progress`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct TaskProgress {
    /// Index into the agent task list.
    pub task_index: usize,
    /// Task title.
    pub task_name: String,
    /// Server-defined status string.
    pub status: String,
    /// Optional detail text.
    #[serde(default)]
    pub details: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct MessagePayload {
    message: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(default)]
struct ToolPayload {
    name: Option<String>,
}

/// Typed event delivered to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Agent state delta.
    StateUpdated(StateUpdate),
    /// The server finished streaming for this request.
    StreamEnd,
    /// Text fragment of the streamed reply.
    Token(String),
    /// A server tool started.
    ToolStart {
        /// Tool name, if reported.
        name: Option<String>,
    },
    /// A server tool finished.
    ToolEnd {
        /// Tool name, if reported.
        name: Option<String>,
    },
    /// Connection-level failure, from the server or synthesised locally.
    ConnectionError {
        /// Human-readable cause.
        message: Option<String>,
    },
    /// Application error reported by the server.
    ServerError {
        /// Human-readable cause.
        message: Option<String>,
    },
    /// Progress of one generated task.
    TaskProgress(TaskProgress),
    /// Keep-alive.
    Ping,
    /// The server persisted the user's message.
    MessageSaved,
    /// Synthetic: the connection was closed.
    Close,
}

impl StreamEvent {
    /// Decode a frame's data for a known event type.
    ///
    /// Empty data is accepted for every type whose payload is optional.
    /// JSON that fails to parse yields [`SyncError::Protocol`].
    pub fn decode(event_type: EventType, data: &str) -> Result<Self, SyncError> {
        Ok(match event_type {
            EventType::StateUpdated => Self::StateUpdated(parse_json(event_type, data)?),
            EventType::StreamEnd => Self::StreamEnd,
            EventType::Token => Self::Token(decode_token(data)),
            EventType::ToolStart => Self::ToolStart {
                name: parse_json::<ToolPayload>(event_type, data)?.name,
            },
            EventType::ToolEnd => Self::ToolEnd {
                name: parse_json::<ToolPayload>(event_type, data)?.name,
            },
            EventType::ConnectionError => Self::ConnectionError {
                message: parse_json::<MessagePayload>(event_type, data)?.message,
            },
            EventType::ServerError => Self::ServerError {
                message: parse_json::<MessagePayload>(event_type, data)?.message,
            },
            EventType::TaskProgress => {
                let data = data.trim();
                Self::TaskProgress(serde_json::from_str(data).map_err(|e| protocol(event_type, data, &e))?)
            }
            EventType::Ping => Self::Ping,
            EventType::MessageSaved => Self::MessageSaved,
            EventType::Close => Self::Close,
        })
    }

    /// The event type this value belongs to.
    pub fn event_type(&self) -> EventType {
        match self {
            Self::StateUpdated(_) => EventType::StateUpdated,
            Self::StreamEnd => EventType::StreamEnd,
            Self::Token(_) => EventType::Token,
            Self::ToolStart { .. } => EventType::ToolStart,
            Self::ToolEnd { .. } => EventType::ToolEnd,
            Self::ConnectionError { .. } => EventType::ConnectionError,
            Self::ServerError { .. } => EventType::ServerError,
            Self::TaskProgress(_) => EventType::TaskProgress,
            Self::Ping => EventType::Ping,
            Self::MessageSaved => EventType::MessageSaved,
            Self::Close => EventType::Close,
        }
    }

    /// Events after which the session has nothing more to say.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::StreamEnd | Self::ConnectionError { .. } | Self::ServerError { .. } | Self::Close
        )
    }
}

/// An event together with the session it was received on.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionEvent {
    /// Session whose connection delivered the frame.
    pub session_id: SessionId,
    /// Decoded event.
    pub event: StreamEvent,
}

fn parse_json<T>(event_type: EventType, data: &str) -> Result<T, SyncError>
where
    T: for<'de> Deserialize<'de> + Default,
{
    let data = data.trim();
    if data.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(data).map_err(|e| protocol(event_type, data, &e))
}

fn protocol(event_type: EventType, data: &str, err: &serde_json::Error) -> SyncError {
    SyncError::Protocol(format!(
        "invalid {event_type} payload ({err}): {}",
        truncate_str(data, 100)
    ))
}

/// Tokens are normally JSON strings; anything else is taken verbatim.
fn decode_token(data: &str) -> String {
    serde_json::from_str::<String>(data).unwrap_or_else(|_| data.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
