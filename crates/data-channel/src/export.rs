//! Making a pool region handle valid inside the worker process.

use bulkferry_aio::SharedMemoryInfo;

use crate::error::DataChannelError;

/// Turns the owner's region handle into a handle value the worker can use.
pub trait HandleExporter: Send {
    fn export(&mut self, info: &SharedMemoryInfo<'_>) -> Result<i64, DataChannelError>;
}

/// Duplicates the region descriptor without close-on-exec so a worker
/// spawned afterwards inherits it under the returned number.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct InheritableExporter {
    exported: Vec<std::os::fd::OwnedFd>,
}

#[cfg(unix)]
impl InheritableExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptors handed out so far. They stay open until [`release`](Self::release).
    pub fn exported(&self) -> &[std::os::fd::OwnedFd] {
        &self.exported
    }

    pub fn release(&mut self) {
        self.exported.clear();
    }
}

#[cfg(unix)]
impl HandleExporter for InheritableExporter {
    fn export(&mut self, info: &SharedMemoryInfo<'_>) -> Result<i64, DataChannelError> {
        use std::os::fd::AsRawFd;

        let fd = info.handle.ok_or(DataChannelError::NotShared)?;
        let dup = rustix::io::dup(fd).map_err(|e| DataChannelError::Export(e.into()))?;
        let raw = dup.as_raw_fd();
        self.exported.push(dup);
        Ok(i64::from(raw))
    }
}
