use std::path::PathBuf;

use crate::Direction;
use crate::server::RemotePath;

/// One file to move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub local_path: Option<PathBuf>,
    pub remote_path: RemotePath,
    pub remote_file: String,
    pub direction: Direction,
    pub resume: bool,
    /// Binary mode. Size comparisons are only trusted in binary mode.
    pub binary: bool,
}

impl TransferRequest {
    pub fn download(
        remote_path: RemotePath,
        remote_file: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            local_path: Some(local_path.into()),
            remote_path,
            remote_file: remote_file.into(),
            direction: Direction::Download,
            resume: false,
            binary: true,
        }
    }

    pub fn upload(
        local_path: impl Into<PathBuf>,
        remote_path: RemotePath,
        remote_file: impl Into<String>,
    ) -> Self {
        Self {
            direction: Direction::Upload,
            ..Self::download(remote_path, remote_file, local_path)
        }
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn ascii(mut self) -> Self {
        self.binary = false;
        self
    }

    pub fn is_download(&self) -> bool {
        self.direction == Direction::Download
    }
}
