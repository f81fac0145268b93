//! # flowsync-stream
//!
//! Everything that talks to the flow backend over HTTP, plus the registry that
//! multiplexes server-push connections:
//!
//! - [`ApiClient`](client::ApiClient): base URL, bearer token, request timeout
//! - [`EventTransport`](transport::EventTransport): opens a session's frame
//!   stream; [`HttpTransport`](transport::HttpTransport) is the SSE implementation
//! - [`ConnectionRegistry`](registry::ConnectionRegistry): one connection per
//!   session id, fan-out to `(session, event type)` subscribers, reference-counted
//!   auto-close
//! - [`SessionApi`](api::SessionApi): send work, create fallback sessions,
//!   fetch agent state
//! - [`mock`]: in-memory transport and session API for tests

#![deny(unsafe_code)]

pub mod api;
pub mod client;
pub mod mock;
pub mod registry;
pub mod transport;

pub use api::{HttpSessionApi, SessionApi};
pub use client::{ApiClient, EnvTokenProvider, StaticToken, TokenProvider};
pub use registry::{ConnectionRegistry, EventSink, Subscription};
pub use transport::{EventTransport, FrameStream, HttpTransport, SseFrame};
