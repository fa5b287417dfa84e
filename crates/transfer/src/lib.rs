//! Transfer preparation for FTP, SFTP, HTTP and object storage.
//!
//! A [`TransferOp`] drives one file transfer from request to finalized
//! metadata: it resolves the remote file through the directory cache or
//! metadata commands, settles overwrite/resume with the overwrite policy,
//! probes large-file resume support where servers are known to get it wrong,
//! opens the local reader or writer and hands the transfer to the protocol
//! session, and finally carries modification times across.
//!
//! The op never blocks. Each entry point returns an [`OpResult`] telling the
//! dispatcher whether to call again, wait for the next reply, or reap it.

mod backend;
mod capabilities;
mod collaborators;
mod op;
mod options;
mod probe;
mod reply;
mod request;
mod server;
mod timestamps;

pub use backend::{Backend, MetadataProbe};
pub use capabilities::{Capability, CapabilityStore, Tri};
pub use collaborators::{
    DirEntry, DirectoryCache, EntryTime, LookupFlags, LookupResult, OverwriteCheck,
    OverwriteDecision, OverwritePolicy, OverwriteQuery, Precision, ProtocolSession, TransferMode,
    TransferStart,
};
pub use op::{OpState, Outcome, Phase, TransferContext, TransferIo, TransferOp};
pub use options::TransferOptions;
pub use probe::{ProbeDecision, evaluate_resume_probe};
pub use reply::{OpResult, ServerReply, SubcommandOutcome, TransferEndReason};
pub use request::TransferRequest;
pub use server::{RemotePath, ServerInfo, ServerKey};
pub use timestamps::{local_mtime, set_local_mtime};

pub use bulkferry_data_channel::Direction;

/// Resume probe thresholds used when none are configured: 4 GiB, then 2 GiB.
pub const DEFAULT_RESUME_BOUNDARIES: [u64; 2] = [1 << 32, 1 << 31];

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid options: {0}")]
    Options(#[from] serde_json::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}
