//! Sources of transfer data.
//!
//! A [`ReaderFactory`] describes where bytes come from and can open any
//! number of independent [`Reader`]s at a given offset. File and stream
//! readers are filled by one background thread; memory and string readers
//! copy into the pool synchronously and never return [`ReadResult::Wait`].

use std::cell::OnceCell;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use bytes::Bytes;
use parking_lot::MutexGuard;
use tracing::{debug, warn};

use crate::event::{AioEventKind, EventSender, Notifier, SourceId};
use crate::pool::{BufferPool, PoolConfig, SharedMemoryInfo};
use crate::ring::{Ring, RingState};
use crate::AioError;

/// Anything a reader worker can pull bytes from.
pub trait ReadSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSource for T {}

/// Outcome of [`Reader::read`].
#[derive(Debug)]
pub enum ReadResult<'a> {
    /// A filled buffer. Empty means end of data.
    Ok(ReadBuffer<'a>),
    /// Nothing ready yet; one [`AioEvent`](crate::AioEvent) will follow.
    Wait,
    /// The source failed. Sticky.
    Error,
}

/// Bytes of one pool slot, valid until the next call on the reader.
#[derive(Debug, Clone, Copy)]
pub struct ReadBuffer<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ReadBuffer<'a> {
    /// Position of the slot relative to the pool base.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn as_slice(&self) -> &'a [u8] {
        self.data
    }
}

impl Deref for ReadBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Origin {
    File(PathBuf),
    Memory(Bytes),
    String(String),
}

/// Describes a data source; cheap to clone.
#[derive(Debug, Clone)]
pub struct ReaderFactory {
    name: String,
    origin: Origin,
    size: Arc<OnceLock<Option<u64>>>,
}

impl ReaderFactory {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: path.display().to_string(),
            origin: Origin::File(path),
            size: Arc::default(),
        }
    }

    /// Bytes owned elsewhere. Use `Bytes::from_static` for static data.
    pub fn memory(name: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            origin: Origin::Memory(data),
            size: Arc::default(),
        }
    }

    /// A string each opened reader keeps its own copy of.
    pub fn string(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin: Origin::String(data.into()),
            size: Arc::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.origin {
            Origin::File(p) => Some(p),
            _ => None,
        }
    }

    /// Total size of the source. Computed once per factory and its clones.
    pub fn size(&self) -> Option<u64> {
        *self.size.get_or_init(|| match &self.origin {
            Origin::File(p) => file_size(p),
            Origin::Memory(b) => Some(b.len() as u64),
            Origin::String(s) => Some(s.len() as u64),
        })
    }

    /// Modification time of a file source.
    pub fn mtime(&self) -> Option<std::time::SystemTime> {
        match &self.origin {
            Origin::File(p) => std::fs::metadata(p).and_then(|m| m.modified()).ok(),
            _ => None,
        }
    }

    pub fn open(
        &self,
        offset: u64,
        events: &EventSender,
        pool: PoolConfig,
        use_shared_memory: bool,
    ) -> Result<Reader, AioError> {
        match &self.origin {
            Origin::File(path) => {
                let file = File::open(path).map_err(|source| AioError::Open {
                    name: self.name.clone(),
                    source,
                })?;
                Reader::start_stream(
                    self.name.clone(),
                    Box::new(file),
                    Some(path.clone()),
                    offset,
                    events,
                    pool,
                    use_shared_memory,
                )
            }
            Origin::Memory(data) => Reader::start_memory(
                self.name.clone(),
                data.clone(),
                offset,
                events,
                pool,
                use_shared_memory,
            ),
            Origin::String(s) => Reader::start_memory(
                self.name.clone(),
                Bytes::from(s.clone().into_bytes()),
                offset,
                events,
                pool,
                use_shared_memory,
            ),
        }
    }
}

fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len())
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

enum Backend {
    Stream {
        worker: Option<JoinHandle<Box<dyn ReadSource>>>,
        path: Option<PathBuf>,
    },
    Memory {
        data: Bytes,
        pos: usize,
    },
}

/// An open source with its own buffer ring.
pub struct Reader {
    name: String,
    id: SourceId,
    ring: Arc<Ring>,
    start: u64,
    size: OnceCell<Option<u64>>,
    backend: Backend,
    closed: bool,
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("start", &self.start)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Reader {
    /// Reads from an arbitrary seekable stream through a worker thread.
    pub fn from_stream(
        name: impl Into<String>,
        source: Box<dyn ReadSource>,
        offset: u64,
        events: &EventSender,
        pool: PoolConfig,
        use_shared_memory: bool,
    ) -> Result<Reader, AioError> {
        Self::start_stream(name.into(), source, None, offset, events, pool, use_shared_memory)
    }

    fn start_stream(
        name: String,
        mut source: Box<dyn ReadSource>,
        path: Option<PathBuf>,
        offset: u64,
        events: &EventSender,
        pool: PoolConfig,
        use_shared_memory: bool,
    ) -> Result<Reader, AioError> {
        let size = OnceCell::new();
        if path.is_none() {
            let _ = size.set(source.seek(SeekFrom::End(0)).ok());
        }
        source
            .seek(SeekFrom::Start(offset))
            .map_err(|source| AioError::Seek { offset, source })?;

        let id = SourceId::next();
        let ring = Arc::new(new_ring(id, events, pool, use_shared_memory)?);
        let worker = spawn_worker(&name, id, Arc::clone(&ring), source)?;
        debug!(reader = %name, offset, "opened stream reader");

        Ok(Reader {
            name,
            id,
            ring,
            start: offset,
            size,
            backend: Backend::Stream {
                worker: Some(worker),
                path,
            },
            closed: false,
        })
    }

    fn start_memory(
        name: String,
        data: Bytes,
        offset: u64,
        events: &EventSender,
        pool: PoolConfig,
        use_shared_memory: bool,
    ) -> Result<Reader, AioError> {
        let len = data.len() as u64;
        if offset > len {
            return Err(AioError::OffsetOutOfRange { offset, size: len });
        }
        let id = SourceId::next();
        let ring = Arc::new(new_ring(id, events, pool, use_shared_memory)?);
        let size = OnceCell::from(Some(len));

        Ok(Reader {
            name,
            id,
            ring,
            start: offset,
            size,
            backend: Backend::Memory {
                data,
                pos: offset as usize,
            },
            closed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tag carried by this reader's events.
    pub fn source_id(&self) -> SourceId {
        self.id
    }

    /// Offset the reader was opened at.
    pub fn start_offset(&self) -> u64 {
        self.start
    }

    pub fn pool(&self) -> &BufferPool {
        &self.ring.pool
    }

    pub fn shared_memory_info(&self) -> SharedMemoryInfo<'_> {
        self.ring.pool.shared_memory_info()
    }

    /// Total size of the source, `None` when unknown.
    pub fn size(&self) -> Option<u64> {
        *self.size.get_or_init(|| match &self.backend {
            Backend::Stream { path: Some(p), .. } => file_size(p),
            Backend::Stream { path: None, .. } => None,
            Backend::Memory { data, .. } => Some(data.len() as u64),
        })
    }

    /// Returns the next filled buffer, releasing the previous one.
    pub fn read(&mut self) -> ReadResult<'_> {
        if self.closed {
            return ReadResult::Error;
        }
        let ring = &*self.ring;
        match &mut self.backend {
            Backend::Memory { data, pos } => {
                let n = (data.len() - *pos).min(ring.pool.buffer_size());
                // SAFETY: memory readers have no worker, so slot 0 is ours, and
                // the previous ReadBuffer ended with this &mut self call.
                let slot = unsafe { ring.pool.slot_mut(0) };
                slot[..n].copy_from_slice(&data[*pos..*pos + n]);
                *pos += n;
                ReadResult::Ok(ReadBuffer {
                    data: &slot[..n],
                    offset: ring.pool.views()[0].offset,
                })
            }
            Backend::Stream { .. } => read_ring(ring),
        }
    }

    /// Restarts reading at the offset the reader was opened with.
    pub fn rewind(&mut self) -> Result<(), AioError> {
        if self.closed || self.ring.state.lock().error {
            return Err(AioError::Failed);
        }
        if let Backend::Memory { pos, .. } = &mut self.backend {
            *pos = self.start as usize;
            return Ok(());
        }

        let mut source = self.stop_worker().ok_or(AioError::Failed)?;
        self.ring.state.lock().reset();

        if let Err(e) = source.seek(SeekFrom::Start(self.start)) {
            self.ring.state.lock().error = true;
            return Err(AioError::Seek {
                offset: self.start,
                source: e,
            });
        }

        let handle = spawn_worker(&self.name, self.id, Arc::clone(&self.ring), source)?;
        if let Backend::Stream { worker, .. } = &mut self.backend {
            *worker = Some(handle);
        }
        debug!(reader = %self.name, offset = self.start, "rewound reader");
        Ok(())
    }

    /// Stops the worker and drops pending buffers. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        drop(self.stop_worker());
        self.ring.detach();
        debug!(reader = %self.name, "closed reader");
    }

    fn stop_worker(&mut self) -> Option<Box<dyn ReadSource>> {
        let Backend::Stream { worker, .. } = &mut self.backend else {
            return None;
        };
        let handle = worker.take()?;
        self.ring.request_quit();
        match handle.join() {
            Ok(source) => Some(source),
            Err(_) => {
                warn!(reader = %self.name, "reader worker panicked");
                None
            }
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.close();
    }
}

fn new_ring(
    id: SourceId,
    events: &EventSender,
    config: PoolConfig,
    use_shared_memory: bool,
) -> Result<Ring, AioError> {
    let mut pool = BufferPool::new(config);
    pool.allocate(use_shared_memory)?;
    let notifier = Notifier::new(events.clone(), id, AioEventKind::ReadReady);
    Ok(Ring::new(pool, notifier))
}

fn read_ring(ring: &Ring) -> ReadResult<'_> {
    let capacity = ring.capacity();
    let mut state = ring.state.lock();
    if state.error {
        return ReadResult::Error;
    }

    if state.processing {
        state.processing = false;
        state.ready_pos = (state.ready_pos + 1) % capacity;
        if state.ready_count == capacity {
            ring.cond.notify_one();
        }
        state.ready_count -= 1;
    }

    if state.ready_count == 0 {
        if state.eof {
            return ReadResult::Ok(ReadBuffer {
                data: &[],
                offset: ring.pool.views()[state.ready_pos].offset,
            });
        }
        state.handler_waiting = true;
        return ReadResult::Wait;
    }

    state.processing = true;
    let slot = state.ready_pos;
    let len = state.lens[slot];
    drop(state);

    // SAFETY: the worker never writes a slot between ready_pos and
    // ready_pos + ready_count, and this one stays ours until the next read.
    let data = unsafe { ring.pool.slot(slot, len) };
    ReadResult::Ok(ReadBuffer {
        data,
        offset: ring.pool.views()[slot].offset,
    })
}

fn spawn_worker(
    name: &str,
    id: SourceId,
    ring: Arc<Ring>,
    source: Box<dyn ReadSource>,
) -> Result<JoinHandle<Box<dyn ReadSource>>, AioError> {
    let label = name.to_string();
    std::thread::Builder::new()
        .name(format!("aio-read-{}", id.get()))
        .spawn(move || fill(&label, &ring, source))
        .map_err(AioError::Spawn)
}

/// Worker loop: fills free slots until end of data, an error, or quit.
fn fill(name: &str, ring: &Ring, mut source: Box<dyn ReadSource>) -> Box<dyn ReadSource> {
    let capacity = ring.capacity();
    let mut state = ring.state.lock();

    while !state.quit && !state.error && !state.eof {
        if state.ready_count == capacity {
            ring.cond.wait(&mut state);
            continue;
        }

        let slot = (state.ready_pos + state.ready_count) % capacity;
        state.lens[slot] = 0;
        // SAFETY: slots outside [ready_pos, ready_pos + ready_count) belong to
        // the worker until published below.
        let buf = unsafe { ring.pool.slot_mut(slot) };
        let result = MutexGuard::unlocked(&mut state, || read_retrying(&mut *source, buf));
        if state.quit {
            break;
        }

        publish(name, &mut state, slot, result);
    }
    drop(state);
    source
}

fn publish(name: &str, state: &mut RingState, slot: usize, result: io::Result<usize>) {
    match result {
        Ok(n) => {
            state.lens[slot] = n;
            state.ready_count += 1;
            if n == 0 {
                state.eof = true;
            }
        }
        Err(e) => {
            warn!(reader = %name, error = %e, "read failed");
            state.error = true;
        }
    }
    state.wake_consumer();
}

fn read_retrying(source: &mut dyn ReadSource, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match source.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            r => return r,
        }
    }
}
