use thiserror::Error;

use crate::remote::RemoteError;

/// Engine-level error taxonomy.
///
/// Validation and not-found errors are fatal for the single operation and
/// never retried. Sync failures mean the local write succeeded and was kept;
/// only the remote push is outstanding. Channel failures require a manual
/// resync. Corrupt local state never surfaces here - the load path treats it
/// as absence.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("entry {id} not found in week {week_id}")]
    NotFound { week_id: String, id: String },

    #[error("saved locally but not synced: {0}")]
    SyncFailed(String),

    #[error("realtime channel failed: {0}")]
    ChannelFailed(String),

    #[error("storage error: {0}")]
    Store(#[from] anyhow::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}
