//! SQLite persistence for the local store, the sync queue and the loopback
//! remote store.

mod operations;
mod pool;
mod records;
mod remote;

pub use operations::*;
pub use pool::*;
pub use records::*;
pub use remote::*;

use branchsync_engine::Error;

/// sqlx failures surface to the engine as storage faults.
pub(crate) fn storage_fault(e: sqlx::Error) -> Error {
    Error::StorageFault(e.to_string())
}
