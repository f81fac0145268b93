//! # flowsync-store
//!
//! The locally editable side of a flow:
//!
//! - [`ReconciliationStore`](store::ReconciliationStore): single-writer document
//!   with undo/redo plus the server-owned agent state
//! - [`layout`]: deterministic regeneration of task and detail nodes
//! - [`Scheduler`](scheduler::Scheduler) / [`Debouncer`](scheduler::Debouncer):
//!   cancellable delayed tasks
//! - [`PersistencePipeline`](persistence::PersistencePipeline): debounced,
//!   dirty-checked, mutually exclusive saves
//! - [`DocumentService`](service::DocumentService): fetch and save of flow records

#![deny(unsafe_code)]

pub mod layout;
pub mod mock;
pub mod persistence;
pub mod scheduler;
pub mod service;
pub mod store;

pub use layout::{GridLayout, Layout};
pub use persistence::{PersistenceConfig, PersistenceNotice, PersistencePipeline};
pub use scheduler::{Debouncer, ScheduledTask, Scheduler};
pub use service::{DocumentService, HttpDocumentService};
pub use store::{DocumentChange, EdgeChange, NodeChange, ReconciliationStore};
