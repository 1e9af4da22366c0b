//! Remote persistence and synchronization.
//!
//! `RemoteBackend` is the seam to the system of record: tabular
//! select/insert/update/delete plus a change-feed subscription. `SyncClient`
//! pushes local mutations through that seam with retry, backoff and
//! idempotency handling.

mod backend;
mod error;
mod http;
mod memory;
mod sync;

pub use backend::{ChangeEvent, ChangeFeed, ChangeKind, RemoteBackend, SyncOperation};
pub use error::RemoteError;
pub use http::{HttpBackend, HttpBackendConfig};
pub use memory::MemoryBackend;
pub use sync::{SyncClient, SyncOutcome};
