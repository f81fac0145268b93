//! Identity checks applied before an event may touch local state.
//!
//! Events keep arriving for a session after the user has moved on, and
//! `state_updated` frames can name a flow other than the one being edited.
//! Both checks take the state they compare against as arguments.

use flowsync_core::ids::{FlowId, SessionId};

/// Whether an event received on `event_session` belongs to the tracked
/// session. Nothing is active when `tracked` is `None`.
pub fn is_active_session(tracked: Option<&SessionId>, event_session: &SessionId) -> bool {
    tracked.is_some_and(|active| active == event_session)
}

/// Whether a `state_updated` payload naming `update_flow` may be merged into
/// the agent state of `active_flow`. A payload without a flow id never is.
pub fn should_apply_state_update(active_flow: &FlowId, update_flow: Option<&str>) -> bool {
    update_flow.is_some_and(|flow| flow == active_flow.as_str())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
