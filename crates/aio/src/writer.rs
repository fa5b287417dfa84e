//! Destinations of transfer data.
//!
//! The caller fills pool buffers obtained from [`Writer::get_write_buffer`]
//! and hands them back; a background thread drains them in order into the
//! destination. [`Writer::finalize`] reports success only once everything
//! reached the sink and the sink was flushed.

use std::cell::OnceCell;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::event::{AioEventKind, EventSender, Notifier, SourceId};
use crate::pool::{BufferPool, PoolConfig, SharedMemoryInfo};
use crate::ring::{Ring, RingState};
use crate::AioError;

/// Outcome of [`Writer::get_write_buffer`].
#[derive(Debug)]
pub enum WriteResult {
    Ok(WriteBuffer),
    /// Every slot is queued; one [`AioEvent`](crate::AioEvent) will follow.
    Wait,
    Error,
}

/// Outcome of [`Writer::finalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeResult {
    Ok,
    Wait,
    Error,
}

/// A pool slot checked out to the caller for filling.
pub struct WriteBuffer {
    ring: Arc<Ring>,
    slot: usize,
    len: usize,
    ticket: u64,
    armed: bool,
}

impl std::fmt::Debug for WriteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBuffer")
            .field("slot", &self.slot)
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl WriteBuffer {
    pub fn capacity(&self) -> usize {
        self.ring.pool.buffer_size()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.len
    }

    /// Position of the slot relative to the pool base.
    pub fn offset(&self) -> usize {
        self.ring.pool.views()[self.slot].offset
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the slot is checked out to this buffer until it is handed back.
        unsafe { self.ring.pool.slot(self.slot, self.len) }
    }

    /// The unfilled tail of the slot. Follow up with [`advance`](Self::advance).
    pub fn spare_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; &mut self keeps this the only live reference.
        let slot = unsafe { self.ring.pool.slot_mut(self.slot) };
        &mut slot[self.len..]
    }

    /// Marks `n` more bytes of the spare area as filled.
    pub fn advance(&mut self, n: usize) {
        self.len = (self.len + n).min(self.capacity());
    }

    /// Sets the filled length directly, e.g. after a peer process wrote the slot.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.capacity());
    }

    /// Copies as much of `data` as fits and returns how much that was.
    pub fn extend_from_slice(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining());
        self.spare_mut()[..n].copy_from_slice(&data[..n]);
        self.len += n;
        n
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl Drop for WriteBuffer {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.ring.state.lock();
            if state.ticket == self.ticket {
                state.checked_out = false;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Memory sink
// ---------------------------------------------------------------------------

/// Growable in-memory destination shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MemorySink(Arc<Mutex<Vec<u8>>>);

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Target {
    File(PathBuf),
    Memory(MemorySink),
}

/// Describes a destination; cheap to clone.
#[derive(Debug, Clone)]
pub struct WriterFactory {
    name: String,
    target: Target,
    size: Arc<OnceLock<Option<u64>>>,
}

impl WriterFactory {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: path.display().to_string(),
            target: Target::File(path),
            size: Arc::default(),
        }
    }

    pub fn memory(name: impl Into<String>, sink: MemorySink) -> Self {
        Self {
            name: name.into(),
            target: Target::Memory(sink),
            size: Arc::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.target {
            Target::File(p) => Some(p),
            Target::Memory(_) => None,
        }
    }

    /// Size of what is already at the destination; `None` if nothing is.
    ///
    /// Computed once per factory and its clones.
    pub fn size(&self) -> Option<u64> {
        *self.size.get_or_init(|| self.current_size())
    }

    fn current_size(&self) -> Option<u64> {
        match &self.target {
            Target::File(p) => file_size(p),
            Target::Memory(sink) => Some(sink.len() as u64),
        }
    }

    /// Opens the destination, truncated to `offset`.
    ///
    /// A non-zero offset requires the destination to exist. Opening a file at
    /// offset zero creates missing parent directories.
    pub fn open(
        &self,
        offset: u64,
        events: &EventSender,
        pool: PoolConfig,
        use_shared_memory: bool,
    ) -> Result<Writer, AioError> {
        let open_err = |source| AioError::Open {
            name: self.name.clone(),
            source,
        };
        let (sink, sizer): (Box<dyn Write + Send>, Sizer) = match &self.target {
            Target::File(path) => {
                let file = if offset > 0 {
                    let mut f = OpenOptions::new().write(true).open(path).map_err(open_err)?;
                    f.seek(SeekFrom::Start(offset))
                        .map_err(|source| AioError::Seek { offset, source })?;
                    f.set_len(offset).map_err(open_err)?;
                    f
                } else {
                    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                        fs::create_dir_all(parent).map_err(open_err)?;
                    }
                    File::create(path).map_err(open_err)?
                };
                (Box::new(file), Sizer::Path(path.clone()))
            }
            Target::Memory(sink) => {
                {
                    let mut data = sink.0.lock();
                    let len = data.len() as u64;
                    if offset > len {
                        return Err(AioError::OffsetOutOfRange { offset, size: len });
                    }
                    data.truncate(offset as usize);
                }
                (Box::new(sink.clone()), Sizer::Memory(sink.clone()))
            }
        };
        Writer::start(self.name.clone(), sink, sizer, events, pool, use_shared_memory)
    }
}

fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len())
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

enum Sizer {
    Path(PathBuf),
    Memory(MemorySink),
    Unknown,
}

/// An open destination with its own buffer ring and drain thread.
pub struct Writer {
    name: String,
    id: SourceId,
    ring: Arc<Ring>,
    worker: Option<JoinHandle<()>>,
    sizer: Sizer,
    size: OnceCell<Option<u64>>,
    closed: bool,
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Writer {
    /// Drains into an arbitrary sink through a worker thread.
    pub fn from_sink(
        name: impl Into<String>,
        sink: Box<dyn Write + Send>,
        events: &EventSender,
        pool: PoolConfig,
        use_shared_memory: bool,
    ) -> Result<Writer, AioError> {
        Self::start(name.into(), sink, Sizer::Unknown, events, pool, use_shared_memory)
    }

    fn start(
        name: String,
        sink: Box<dyn Write + Send>,
        sizer: Sizer,
        events: &EventSender,
        config: PoolConfig,
        use_shared_memory: bool,
    ) -> Result<Writer, AioError> {
        let mut pool = BufferPool::new(config);
        pool.allocate(use_shared_memory)?;
        let id = SourceId::next();
        let notifier = Notifier::new(events.clone(), id, AioEventKind::WriteReady);
        let ring = Arc::new(Ring::new(pool, notifier));

        let worker_ring = Arc::clone(&ring);
        let label = name.clone();
        let worker = std::thread::Builder::new()
            .name(format!("aio-write-{}", id.get()))
            .spawn(move || drain(&label, &worker_ring, sink))
            .map_err(AioError::Spawn)?;
        debug!(writer = %name, "opened writer");

        Ok(Writer {
            name,
            id,
            ring,
            worker: Some(worker),
            sizer,
            size: OnceCell::new(),
            closed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tag carried by this writer's events.
    pub fn source_id(&self) -> SourceId {
        self.id
    }

    pub fn pool(&self) -> &BufferPool {
        &self.ring.pool
    }

    pub fn shared_memory_info(&self) -> SharedMemoryInfo<'_> {
        self.ring.pool.shared_memory_info()
    }

    /// Destination size, measured on first call.
    pub fn size(&self) -> Option<u64> {
        *self.size.get_or_init(|| match &self.sizer {
            Sizer::Path(p) => file_size(p),
            Sizer::Memory(sink) => Some(sink.len() as u64),
            Sizer::Unknown => None,
        })
    }

    /// Queues `last` if it holds data, then hands out the next free buffer.
    ///
    /// `Wait` means every slot is queued. A submitted `last` was still
    /// accepted in that case; pass `None` on the next call.
    pub fn get_write_buffer(&mut self, last: Option<WriteBuffer>) -> WriteResult {
        if self.closed {
            return WriteResult::Error;
        }
        let mut state = self.ring.state.lock();
        if !self.take_back(&mut state, last) || state.error {
            return WriteResult::Error;
        }
        if state.finalizing || state.checked_out {
            return WriteResult::Error;
        }

        let capacity = self.ring.capacity();
        if state.ready_count == capacity {
            state.handler_waiting = true;
            return WriteResult::Wait;
        }

        let slot = (state.ready_pos + state.ready_count) % capacity;
        state.lens[slot] = 0;
        state.ticket += 1;
        state.checked_out = true;
        WriteResult::Ok(WriteBuffer {
            ring: Arc::clone(&self.ring),
            slot,
            len: 0,
            ticket: state.ticket,
            armed: true,
        })
    }

    /// Queues `last` and marks the end of data.
    ///
    /// Returns `Ok` once the worker drained every buffer and flushed the sink.
    pub fn finalize(&mut self, last: Option<WriteBuffer>) -> FinalizeResult {
        if self.closed {
            return FinalizeResult::Error;
        }
        let mut state = self.ring.state.lock();
        if !self.take_back(&mut state, last) || state.error || state.checked_out {
            return FinalizeResult::Error;
        }

        if !state.finalizing {
            state.finalizing = true;
            self.ring.cond.notify_one();
        }
        if state.drained {
            FinalizeResult::Ok
        } else {
            state.handler_waiting = true;
            FinalizeResult::Wait
        }
    }

    /// Stops the worker, discarding anything not yet written. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(handle) = self.worker.take() {
            self.ring.request_quit();
            if handle.join().is_err() {
                warn!(writer = %self.name, "writer worker panicked");
            }
        }
        self.ring.detach();
        debug!(writer = %self.name, "closed writer");
    }

    /// Accepts a buffer handed back by the caller. False if it is not ours.
    fn take_back(&self, state: &mut RingState, last: Option<WriteBuffer>) -> bool {
        let Some(mut buf) = last else {
            return true;
        };
        if !Arc::ptr_eq(&buf.ring, &self.ring) {
            return false;
        }
        // Disarm before the drop at the end of this scope; we hold the lock.
        buf.armed = false;
        if !state.checked_out || buf.ticket != state.ticket {
            return false;
        }
        state.checked_out = false;

        if buf.len > 0 && !state.error {
            let capacity = self.ring.capacity();
            let slot = (state.ready_pos + state.ready_count) % capacity;
            debug_assert_eq!(slot, buf.slot);
            state.lens[slot] = buf.len;
            if state.ready_count == 0 {
                self.ring.cond.notify_one();
            }
            state.ready_count += 1;
        }
        true
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Worker loop: writes queued slots in order, flushes once finalized.
fn drain(name: &str, ring: &Ring, mut sink: Box<dyn Write + Send>) {
    let capacity = ring.capacity();
    let mut state = ring.state.lock();

    while !state.quit && !state.error {
        if state.ready_count == 0 {
            if state.finalizing {
                let flushed = MutexGuard::unlocked(&mut state, || sink.flush());
                if state.quit {
                    return;
                }
                match flushed {
                    Ok(()) => state.drained = true,
                    Err(e) => {
                        warn!(writer = %name, error = %e, "flush failed");
                        state.error = true;
                    }
                }
                state.wake_consumer();
                return;
            }
            ring.cond.wait(&mut state);
            continue;
        }

        let slot = state.ready_pos;
        let len = state.lens[slot];
        // SAFETY: queued slots belong to the worker until ready_pos moves past them.
        let data = unsafe { ring.pool.slot(slot, len) };

        let mut written = 0;
        while written < len {
            let result = MutexGuard::unlocked(&mut state, || write_retrying(&mut *sink, &data[written..]));
            if state.quit {
                return;
            }
            match result {
                Ok(0) => {
                    warn!(writer = %name, "sink accepted no data");
                    state.error = true;
                    break;
                }
                Ok(n) => written += n,
                Err(e) => {
                    warn!(writer = %name, error = %e, "write failed");
                    state.error = true;
                    break;
                }
            }
        }

        state.lens[slot] = 0;
        state.ready_pos = (slot + 1) % capacity;
        state.ready_count -= 1;
        state.wake_consumer();
    }
}

fn write_retrying(sink: &mut (dyn Write + Send), data: &[u8]) -> io::Result<usize> {
    loop {
        match sink.write(data) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            r => return r,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event_channel;
    use parking_lot::Condvar;

    fn small() -> PoolConfig {
        PoolConfig {
            buffer_size: 4,
            buffer_count: 2,
        }
    }

    fn finish(w: &mut Writer, rx: &mut crate::EventReceiver, mut last: Option<WriteBuffer>) -> FinalizeResult {
        loop {
            match w.finalize(last.take()) {
                FinalizeResult::Wait => {
                    rx.blocking_recv().unwrap();
                }
                r => return r,
            }
        }
    }

    #[test]
    fn memory_destination_receives_everything() {
        let (tx, mut rx) = event_channel();
        let sink = MemorySink::new();
        let mut w = WriterFactory::memory("mem", sink.clone())
            .open(0, &tx, small(), false)
            .unwrap();

        let mut last = None;
        for chunk in [b"abcd".as_slice(), b"ef".as_slice()] {
            let mut buf = loop {
                match w.get_write_buffer(last.take()) {
                    WriteResult::Ok(b) => break b,
                    WriteResult::Wait => {
                        rx.blocking_recv().unwrap();
                    }
                    WriteResult::Error => panic!("write failed"),
                }
            };
            assert_eq!(buf.extend_from_slice(chunk), chunk.len());
            last = Some(buf);
        }
        assert_eq!(finish(&mut w, &mut rx, last), FinalizeResult::Ok);
        assert_eq!(sink.contents(), b"abcdef");
        assert_eq!(w.size(), Some(6));
    }

    #[test]
    fn extend_stops_at_capacity() {
        let (tx, _rx) = event_channel();
        let mut w = WriterFactory::memory("m", MemorySink::new())
            .open(0, &tx, small(), false)
            .unwrap();
        let WriteResult::Ok(mut buf) = w.get_write_buffer(None) else {
            panic!("no buffer");
        };
        assert_eq!(buf.extend_from_slice(b"123456"), 4);
        assert_eq!(buf.remaining(), 0);
        assert_eq!(buf.as_slice(), b"1234");
    }

    #[test]
    fn full_ring_waits_then_notifies_once() {
        let gate = Arc::new((Mutex::new(false), Condvar::new()));

        struct Gated(Arc<(Mutex<bool>, Condvar)>, MemorySink);
        impl Write for Gated {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                let (open, cv) = &*self.0;
                let mut open = open.lock();
                while !*open {
                    cv.wait(&mut open);
                }
                self.1.write(buf)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let (tx, mut rx) = event_channel();
        let sink = MemorySink::new();
        let mut w = Writer::from_sink(
            "gated",
            Box::new(Gated(Arc::clone(&gate), sink.clone())),
            &tx,
            small(),
            false,
        )
        .unwrap();

        let WriteResult::Ok(mut a) = w.get_write_buffer(None) else {
            panic!("no buffer");
        };
        a.extend_from_slice(b"aaaa");
        let WriteResult::Ok(mut b) = w.get_write_buffer(Some(a)) else {
            panic!("no buffer");
        };
        b.extend_from_slice(b"bb");
        assert!(matches!(w.get_write_buffer(Some(b)), WriteResult::Wait));
        assert!(rx.try_recv().is_err());

        {
            let (open, cv) = &*gate;
            *open.lock() = true;
            cv.notify_all();
        }
        let ev = rx.blocking_recv().unwrap();
        assert_eq!(ev.source, w.source_id());
        assert_eq!(ev.kind, AioEventKind::WriteReady);
        // The worker drains the rest without posting again.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(rx.try_recv().is_err());

        assert_eq!(finish(&mut w, &mut rx, None), FinalizeResult::Ok);
        assert_eq!(sink.contents(), b"aaaabb");
    }

    #[test]
    fn zero_length_write_is_an_error() {
        struct Stuck;
        impl Write for Stuck {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let (tx, mut rx) = event_channel();
        let mut w = Writer::from_sink("stuck", Box::new(Stuck), &tx, small(), false).unwrap();
        let WriteResult::Ok(mut buf) = w.get_write_buffer(None) else {
            panic!("no buffer");
        };
        buf.extend_from_slice(b"x");
        assert_eq!(finish(&mut w, &mut rx, Some(buf)), FinalizeResult::Error);
        assert!(matches!(w.get_write_buffer(None), WriteResult::Error));
    }

    #[test]
    fn buffer_from_other_writer_rejected() {
        let (tx, _rx) = event_channel();
        let mut w1 = WriterFactory::memory("a", MemorySink::new())
            .open(0, &tx, small(), false)
            .unwrap();
        let mut w2 = WriterFactory::memory("b", MemorySink::new())
            .open(0, &tx, small(), false)
            .unwrap();
        let WriteResult::Ok(buf) = w1.get_write_buffer(None) else {
            panic!("no buffer");
        };
        assert!(matches!(w2.get_write_buffer(Some(buf)), WriteResult::Error));
        // w1's slot was released by the drop.
        assert!(matches!(w1.get_write_buffer(None), WriteResult::Ok(_)));
    }

    #[test]
    fn second_checkout_while_holding_rejected() {
        let (tx, _rx) = event_channel();
        let mut w = WriterFactory::memory("a", MemorySink::new())
            .open(0, &tx, small(), false)
            .unwrap();
        let held = w.get_write_buffer(None);
        assert!(matches!(held, WriteResult::Ok(_)));
        assert!(matches!(w.get_write_buffer(None), WriteResult::Error));
        drop(held);
        assert!(matches!(w.get_write_buffer(None), WriteResult::Ok(_)));
    }

    #[test]
    fn file_writer_truncates_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        fs::write(&path, b"0123456789").unwrap();

        let (tx, mut rx) = event_channel();
        let f = WriterFactory::file(&path);
        assert_eq!(f.size(), Some(10));
        let mut w = f.open(4, &tx, small(), false).unwrap();
        let WriteResult::Ok(mut buf) = w.get_write_buffer(None) else {
            panic!("no buffer");
        };
        buf.extend_from_slice(b"ab");
        assert_eq!(finish(&mut w, &mut rx, Some(buf)), FinalizeResult::Ok);
        w.close();
        assert_eq!(fs::read(&path).unwrap(), b"0123ab");
    }

    #[test]
    fn fresh_file_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.txt");
        let (tx, mut rx) = event_channel();
        let mut w = WriterFactory::file(&path).open(0, &tx, small(), false).unwrap();
        assert_eq!(finish(&mut w, &mut rx, None), FinalizeResult::Ok);
        assert!(path.exists());
    }

    #[test]
    fn resume_into_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = event_channel();
        let err = WriterFactory::file(dir.path().join("missing"))
            .open(5, &tx, small(), false)
            .unwrap_err();
        assert!(matches!(err, AioError::Open { .. }));
    }

    #[test]
    fn memory_offset_past_end_rejected() {
        let (tx, _rx) = event_channel();
        let err = WriterFactory::memory("m", MemorySink::new())
            .open(1, &tx, small(), false)
            .unwrap_err();
        assert!(matches!(err, AioError::OffsetOutOfRange { offset: 1, size: 0 }));
    }

    #[test]
    fn close_is_idempotent() {
        let (tx, _rx) = event_channel();
        let mut w = WriterFactory::memory("m", MemorySink::new())
            .open(0, &tx, small(), false)
            .unwrap();
        w.close();
        w.close();
        assert!(matches!(w.get_write_buffer(None), WriteResult::Error));
        assert_eq!(w.finalize(None), FinalizeResult::Error);
    }
}
