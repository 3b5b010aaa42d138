//! CLI sessions and the registry that owns them.
//!
//! Sessions are shareable across interfaces: a CLI registers one through its
//! hook, then the web dashboard or a chat bot can observe and take it over.

mod registry;
mod state;

pub use registry::{SessionRegistry, SessionSlot, SlotGuard};
pub(crate) use registry::Waiter;
pub use state::{Actor, ControlState, Session, SessionId, SessionStatus};
