//! # switchboard-core
//!
//! Coordination core for Switchboard, the remote control plane for
//! command-line agent sessions.
//!
//! This crate is framework-agnostic and can be used by:
//! - the HTTP/WebSocket server (via `switchboard-http`)
//! - chat-bot bridges
//! - CLI hooks embedded in the same process (tests, local tooling)
//!
//! ## Key Concepts
//!
//! - **Session**: a CLI agent session and which actor currently controls it
//! - **PendingRequest**: a blocking hook call waiting for a remote decision
//! - **Task**: a prompt executed against the CLI agent on behalf of a remote actor
//! - **Event**: a state delta broadcast to every subscribed observer

pub mod bus;
pub mod chat;
pub mod config;
pub mod context;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod notify;
pub mod permission;
pub mod session;
pub mod shell;
pub mod store;

// Re-export commonly used types
pub use bus::{BusEvent, Event, EventBus, Topic};
pub use config::CoreConfig;
pub use context::Conductor;
pub use error::{CoreError, CoreResult};
pub use session::{Actor, ControlState, Session, SessionId, SessionStatus};
