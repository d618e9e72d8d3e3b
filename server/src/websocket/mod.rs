//! WebSocket support for live "state changed" notifications.
//!
//! Clients connect via WebSocket and are told whenever records or the sync
//! status change, so they can refresh without polling.

mod manager;
mod protocol;

pub use manager::{spawn_change_forwarder, ConnectionManager};
pub use protocol::*;
