//! Request handlers.

mod branches;
mod sync;
mod websocket;

pub use branches::*;
pub use sync::*;
pub use websocket::*;
