//! Server identity and remote paths.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::TransferError;
use crate::backend::Backend;

/// Identifies a server for capability lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerKey {
    pub host: String,
    pub port: u16,
    pub backend: Backend,
}

impl ServerKey {
    pub fn new(host: impl Into<String>, port: u16, backend: Backend) -> Self {
        Self {
            host: host.into(),
            port,
            backend,
        }
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.backend.scheme(), self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub key: ServerKey,
    /// Minutes to add to times reported by the server to get UTC.
    pub timezone_offset: i32,
}

impl ServerInfo {
    pub fn new(key: ServerKey) -> Self {
        Self {
            key,
            timezone_offset: 0,
        }
    }

    pub fn backend(&self) -> Backend {
        self.key.backend
    }
}

/// An absolute, slash-separated remote directory.
///
/// For object storage the first segment is the bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RemotePath {
    segments: Vec<String>,
}

impl RemotePath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses an absolute path. Empty segments and `.` are dropped, `..`
    /// removes the previous segment.
    pub fn parse(path: &str) -> Result<Self, TransferError> {
        if !path.starts_with('/') {
            return Err(TransferError::InvalidPath(path.to_string()));
        }
        let mut segments: Vec<String> = Vec::new();
        for part in path.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                s => segments.push(s.to_string()),
            }
        }
        Ok(Self { segments })
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// First segment, the bucket name for object storage.
    pub fn bucket(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Object key of `file` below the bucket.
    pub fn object_key(&self, file: &str) -> String {
        let mut key = String::new();
        for s in self.segments.iter().skip(1) {
            key.push_str(s);
            key.push('/');
        }
        key.push_str(file);
        key
    }

    /// `file` alone when `omit_path` is set (the session already changed
    /// into this directory), the full path otherwise.
    pub fn format_filename(&self, file: &str, omit_path: bool) -> String {
        if omit_path {
            return file.to_string();
        }
        let mut out = self.to_string();
        if !self.is_root() {
            out.push('/');
        }
        out.push_str(file);
        out
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for s in &self.segments {
            write!(f, "/{s}")?;
        }
        Ok(())
    }
}
