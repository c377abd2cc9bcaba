//! `pl-realtime`: realtime transport client for the PromptLab dashboard.
//!
//! Streams progress updates (prompt refinement, pipeline execution) from
//! the server over a long-lived WebSocket that reconnects on its own,
//! heartbeats while open, and replays room joins after every reconnect.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  UI layer                                                   │
//! │                                                             │
//! │   let registry = ConnectionRegistry::new();                 │
//! │   registry.set_token(Some(token));                          │
//! │   let conn = registry.get_or_create("run-42", config);      │
//! │   conn.on("progress_update", |payload| { ... });            │
//! │   conn.join_room("run-42");                                 │
//! │   conn.connect().await;                                     │
//! └─────────────────────────────────────────────────────────────┘
//!            │ get_or_create(key)
//!            ▼
//!   ConnectionRegistry ──▶ Connection ──┬── ReconnectPolicy / ReconnectTimer
//!                                       ├── HeartbeatMonitor
//!                                       ├── RoomMembership
//!                                       └── Dispatcher ──▶ subscribers
//! ```
//!
//! # Failure model
//!
//! Nothing here returns an error for runtime conditions.  Open failures,
//! drops, malformed frames and panicking subscribers are logged and, where
//! relevant, published as [`ConnectionEvent`]s.  Only an invalid
//! [`ConnectionConfig`] is rejected up front.

pub mod builder;
pub mod connection;
pub mod dispatcher;
pub mod heartbeat;
pub mod reconnect;
pub mod registry;
pub mod rooms;
pub mod settings;
pub mod types;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use builder::{ConnectionConfig, ConnectionConfigBuilder};
pub use connection::Connection;
pub use dispatcher::{Dispatcher, Handler, HandlerId};
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor};
pub use reconnect::{ReconnectPolicy, ReconnectTimer};
pub use registry::ConnectionRegistry;
pub use rooms::RoomMembership;
pub use settings::RealtimeSettings;
pub use types::{ConnectionEvent, ConnectionState, RealtimeError};

// Re-export protocol types so callers never need to import pl-protocol directly.
pub use pl_protocol::{ControlMessage, Envelope, ProtocolError, WILDCARD_TOPIC};
