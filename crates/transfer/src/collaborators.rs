//! Interfaces to the parts of the client the transfer op only talks to:
//! the directory cache, the protocol session and the overwrite policy.

use std::path::Path;

use bulkferry_data_channel::HandleExporter;
use chrono::{DateTime, Utc};

use crate::Direction;
use crate::reply::OpResult;
use crate::server::{RemotePath, ServerInfo, ServerKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precision {
    Day,
    Minute,
    Second,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryTime {
    pub time: DateTime<Utc>,
    pub precision: Precision,
}

impl EntryTime {
    pub fn has_time_of_day(&self) -> bool {
        self.precision >= Precision::Minute
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub size: Option<u64>,
    pub time: Option<EntryTime>,
    /// The listing may be stale for this entry; re-list before trusting it.
    pub unsure: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupResult {
    pub entry: Option<DirEntry>,
    /// The directory itself is cached.
    pub dir_exists: bool,
    /// The entry's name matches with the same case.
    pub matched_case: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupFlags {
    /// Accept a listing the cache considers outdated. Set once the
    /// directory was just re-listed.
    pub allow_outdated: bool,
}

pub trait DirectoryCache {
    /// Looks up `file` in the cached listing of `path`, ignoring case.
    fn lookup(
        &self,
        server: &ServerKey,
        path: &RemotePath,
        file: &str,
        flags: LookupFlags,
    ) -> LookupResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Download,
    Upload,
    /// Fetch only the last byte to test resume support.
    ResumeTest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferStart {
    pub command: String,
    pub mode: TransferMode,
    /// Offset to ask the server to resume at, 0 for none.
    pub resume_offset: u64,
    pub binary: bool,
}

/// The control connection of one protocol backend.
///
/// `send_command` returns [`OpResult::WouldBlock`] once the command is on its
/// way; the reply arrives through [`TransferOp::on_reply`]. Any other result
/// is a failure to send.
///
/// `change_directory`, `list` and `start_transfer` are nested operations.
/// `WouldBlock` means the outcome arrives through
/// [`TransferOp::on_subcommand_result`]; anything else is the outcome itself.
///
/// [`TransferOp::on_reply`]: crate::TransferOp::on_reply
/// [`TransferOp::on_subcommand_result`]: crate::TransferOp::on_subcommand_result
pub trait ProtocolSession {
    fn server(&self) -> &ServerInfo;
    /// Directory the session is currently in, if known.
    fn current_path(&self) -> Option<&RemotePath>;
    fn send_command(&mut self, command: &str) -> OpResult;
    fn change_directory(&mut self, path: &RemotePath) -> OpResult;
    fn list(&mut self, path: &RemotePath, refresh: bool) -> OpResult;
    fn start_transfer(&mut self, start: TransferStart) -> OpResult;

    /// Exports pool regions to the worker process of worker-based backends.
    fn handle_exporter(&mut self) -> Option<Box<dyn HandleExporter>> {
        #[cfg(unix)]
        {
            Some(Box::new(bulkferry_data_channel::InheritableExporter::new()))
        }
        #[cfg(not(unix))]
        {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverwriteDecision {
    Overwrite,
    Resume,
    /// Transfer to a different name instead: local file name for downloads,
    /// remote file name for uploads.
    Rename(String),
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverwriteCheck {
    NoConflict,
    Decided(OverwriteDecision),
    /// Someone has to be asked. The answer comes through
    /// [`TransferOp::on_overwrite_decision`](crate::TransferOp::on_overwrite_decision).
    Pending,
}

/// What is known about both sides when the target may already exist.
#[derive(Debug, Clone)]
pub struct OverwriteQuery<'a> {
    pub direction: Direction,
    pub local_path: &'a Path,
    pub local_size: Option<u64>,
    pub local_time: Option<DateTime<Utc>>,
    pub remote_path: &'a RemotePath,
    pub remote_file: &'a str,
    pub remote_size: Option<u64>,
    pub remote_time: Option<DateTime<Utc>>,
}

pub trait OverwritePolicy {
    fn check(&mut self, query: &OverwriteQuery<'_>) -> OverwriteCheck;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn time_of_day_needs_minutes() {
        let time = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let day = EntryTime {
            time,
            precision: Precision::Day,
        };
        assert!(!day.has_time_of_day());
        assert!(
            EntryTime {
                precision: Precision::Minute,
                ..day
            }
            .has_time_of_day()
        );
    }
}
