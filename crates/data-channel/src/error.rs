//! Error types for the data channel.

/// Errors produced by the worker sideband.
#[derive(Debug, thiserror::Error)]
pub enum DataChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cannot hand the buffer region to the worker: {0}")]
    Export(#[source] std::io::Error),

    #[error("buffer pool is not in shared memory")]
    NotShared,

    #[error("reading the local source failed")]
    ReadFailed,

    #[error("writing the local destination failed")]
    WriteFailed,
}
