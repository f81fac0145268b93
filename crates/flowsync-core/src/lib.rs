//! # flowsync-core
//!
//! Foundation types shared by every flowsync crate:
//!
//! - **Branded IDs**: [`FlowId`](ids::FlowId) and [`SessionId`](ids::SessionId) newtypes
//! - **Document model**: nodes, edges, flow records and the save snapshot
//! - **Agent state**: the server-owned sub-state and its streamed patches
//! - **Wire events**: [`EventType`](events::EventType) and the tagged-union
//!   [`StreamEvent`](events::StreamEvent) decoded from server-push frames
//! - **Errors**: the [`SyncError`](errors::SyncError) taxonomy

#![deny(unsafe_code)]

pub mod agent;
pub mod document;
pub mod errors;
pub mod events;
pub mod ids;
pub mod text;
