//! Branded ID newtypes.
//!
//! A flow (the editable document) and a session (one server-side processing
//! context) are both plain strings on the wire, but they are never
//! interchangeable: a derived session id such as `F1_task_2` is not a flow.
//! The newtypes keep the two apart at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id!(
    /// Identifier of a flow document. Also the id of its base session.
    FlowId
);
branded_id!(
    /// Identifier of a streaming session: a base flow id, a derived
    /// `<flow>_task_<n>[_detail_<m>]` id, or a server-created fallback.
    SessionId
);

impl FlowId {
    /// The base session of this flow, which shares the flow's id.
    #[must_use]
    pub fn base_session(&self) -> SessionId {
        SessionId(self.0.clone())
    }
}

impl SessionId {
    /// Derive the virtual session id for a task, optionally narrowed to one of
    /// its detail steps. A detail index without a task index is ignored.
    #[must_use]
    pub fn derived(flow_id: &FlowId, task_index: Option<usize>, detail_index: Option<usize>) -> Self {
        match (task_index, detail_index) {
            (Some(task), Some(detail)) => Self(format!("{flow_id}_task_{task}_detail_{detail}")),
            (Some(task), None) => Self(format!("{flow_id}_task_{task}")),
            (None, _) => flow_id.base_session(),
        }
    }

    /// Whether this id is the base session of `flow_id`.
    #[must_use]
    pub fn is_base_of(&self, flow_id: &FlowId) -> bool {
        self.0 == flow_id.0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
