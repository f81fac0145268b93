//! # flowsync-session
//!
//! Drives one processing session at a time for a flow:
//!
//! - [`SessionController`](controller::SessionController): computes the target
//!   session id, sends the work request, recovers from an unknown derived id
//!   with a single fallback session, subscribes to the session's events and
//!   applies them to the [`ReconciliationStore`](flowsync_store::ReconciliationStore)
//! - [`guard`]: pure predicates deciding whether an event still applies

#![deny(unsafe_code)]

pub mod controller;
pub mod guard;

pub use controller::{ControllerNotice, SessionController, SessionState};
pub use guard::{is_active_session, should_apply_state_update};
