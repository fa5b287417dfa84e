//! Bounded buffer pipeline for bulk transfers.
//!
//! A [`Reader`] pulls bytes from a source into a fixed ring of pool buffers
//! and a [`Writer`] drains caller-filled buffers into a destination. Stream
//! backed instances own one background worker thread that performs all
//! blocking I/O; the consumer side never blocks and gets [`ReadResult::Wait`]
//! / [`WriteResult::Wait`] instead, followed by exactly one [`AioEvent`] on
//! the event channel once progress is possible again.
//!
//! The buffers come from a [`BufferPool`], which can live in shared memory
//! so a separate worker process can read or fill them without copying.

pub mod event;
pub mod pool;
pub(crate) mod ring;
pub mod reader;
pub mod writer;

pub use event::{AioEvent, AioEventKind, EventReceiver, EventSender, SourceId, event_channel};
pub use pool::{BufferPool, BufferView, PoolConfig, SharedMemoryInfo};
#[cfg(unix)]
pub use pool::MappedRegion;
pub use reader::{ReadBuffer, ReadResult, ReadSource, Reader, ReaderFactory};
pub use writer::{FinalizeResult, MemorySink, WriteBuffer, WriteResult, Writer, WriterFactory};

/// Buffer size aimed for: 256 KiB.
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;

/// Number of buffers in a ring.
pub const DEFAULT_BUFFER_COUNT: usize = 8;

/// Errors raised while setting up the buffer pool.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("invalid pool layout: {0}")]
    InvalidLayout(String),

    #[error("shared memory is not supported on this platform")]
    Unsupported,

    #[error("shared memory error: {0}")]
    SharedMemory(#[from] std::io::Error),

    #[error("mapping returned an empty region")]
    EmptyMapping,
}

/// Errors produced when opening or repositioning a reader or writer.
#[derive(Debug, thiserror::Error)]
pub enum AioError {
    #[error("buffer allocation failed: {0}")]
    Alloc(#[from] AllocError),

    #[error("cannot open {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot seek to offset {offset}: {source}")]
    Seek {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("offset {offset} is beyond the end of the data ({size} bytes)")]
    OffsetOutOfRange { offset: u64, size: u64 },

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("previous I/O failure")]
    Failed,
}

impl AioError {
    /// Whether the failure happened while acquiring buffer memory.
    pub fn is_alloc(&self) -> bool {
        matches!(self, AioError::Alloc(_))
    }
}
