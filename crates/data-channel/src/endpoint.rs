//! Owner side of the shared-memory handoff.
//!
//! The worker process asks for the local file to be opened, then repeatedly
//! for the next buffer. [`SharedIoEndpoint`] answers from a [`Reader`]
//! (upload) or [`Writer`] (download) opened on a shared-memory pool. When the
//! answer is not ready yet nothing is sent; the reply goes out once the
//! reader or writer posts its ready event ([`SharedIoEndpoint::on_ready`]).

use bulkferry_aio::{
    AioError, AioEvent, EventReceiver, EventSender, FinalizeResult, PoolConfig, ReadResult,
    Reader, ReaderFactory, WriteBuffer, WriteResult, Writer, WriterFactory,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};
use tracing::{debug, warn};

use crate::error::DataChannelError;
use crate::export::HandleExporter;
use crate::wire::{Reply, Request, write_reply};
use crate::MAX_LINE_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

enum Side {
    Upload(ReaderFactory),
    Download { factory: WriterFactory, resume: bool },
}

pub struct SharedIoEndpoint {
    side: Side,
    reader: Option<Reader>,
    writer: Option<Writer>,
    buffer: Option<WriteBuffer>,
    finalizing: bool,
    finalized: bool,
    open_error: Option<AioError>,
    events: EventSender,
    pool: PoolConfig,
    exporter: Box<dyn HandleExporter>,
}

impl std::fmt::Debug for SharedIoEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedIoEndpoint")
            .field("direction", &self.direction())
            .field("open", &(self.reader.is_some() || self.writer.is_some()))
            .field("finalizing", &self.finalizing)
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl SharedIoEndpoint {
    pub fn upload(
        factory: ReaderFactory,
        events: EventSender,
        pool: PoolConfig,
        exporter: Box<dyn HandleExporter>,
    ) -> Self {
        Self::new(Side::Upload(factory), events, pool, exporter)
    }

    /// With `resume`, writing continues at the current size of the destination.
    pub fn download(
        factory: WriterFactory,
        resume: bool,
        events: EventSender,
        pool: PoolConfig,
        exporter: Box<dyn HandleExporter>,
    ) -> Self {
        Self::new(Side::Download { factory, resume }, events, pool, exporter)
    }

    fn new(
        side: Side,
        events: EventSender,
        pool: PoolConfig,
        exporter: Box<dyn HandleExporter>,
    ) -> Self {
        Self {
            side,
            reader: None,
            writer: None,
            buffer: None,
            finalizing: false,
            finalized: false,
            open_error: None,
            events,
            pool,
            exporter,
        }
    }

    pub fn direction(&self) -> Direction {
        match self.side {
            Side::Upload(_) => Direction::Upload,
            Side::Download { .. } => Direction::Download,
        }
    }

    /// The writer reported that every byte reached the destination.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Why the last open request was answered with a failure.
    pub fn take_open_error(&mut self) -> Option<AioError> {
        self.open_error.take()
    }

    /// Answers a worker request. `Ok(None)` means the reply follows an event.
    ///
    /// An error means the region could not be handed over; the transfer
    /// cannot continue.
    pub fn handle(&mut self, request: Request) -> Result<Option<Reply>, DataChannelError> {
        debug!(%request, "worker request");
        match request {
            Request::Open { offset } => self.on_open(offset),
            Request::Next { processed } => Ok(self.on_next(processed)),
            Request::Finalize { last } => Ok(self.on_finalize(last)),
            Request::Size => Ok(Some(self.on_size())),
        }
    }

    /// Produces the reply a previous request was waiting for.
    pub fn on_ready(&mut self, event: AioEvent) -> Option<Reply> {
        if self.reader.as_ref().is_some_and(|r| r.source_id() == event.source) {
            return self.on_next(0);
        }
        if self.writer.as_ref().is_some_and(|w| w.source_id() == event.source) {
            return if self.finalizing {
                self.on_finalize(0)
            } else {
                self.on_next(0)
            };
        }
        debug!(source = event.source.get(), "ignoring event for another source");
        None
    }

    /// Closes the reader or writer, joining its worker thread.
    pub fn close(&mut self) {
        self.buffer = None;
        if let Some(mut r) = self.reader.take() {
            r.close();
        }
        if let Some(mut w) = self.writer.take() {
            w.close();
        }
    }

    fn on_open(&mut self, offset: u64) -> Result<Option<Reply>, DataChannelError> {
        if self.reader.is_some() || self.writer.is_some() {
            return Ok(Some(Reply::Busy));
        }

        match &self.side {
            Side::Download { factory, resume } => {
                let offset = if *resume {
                    match factory.size() {
                        Some(size) => size,
                        None => return Ok(Some(Reply::ResumeSizeUnknown)),
                    }
                } else {
                    0
                };
                let writer = match factory.open(offset, &self.events, self.pool, true) {
                    Ok(w) => w,
                    Err(e) => return Ok(Some(self.open_failed(e))),
                };
                let info = writer.shared_memory_info();
                let handle = self.exporter.export(&info)?;
                let size = info.size as u64;
                self.writer = Some(writer);
                Ok(Some(Reply::Opened {
                    handle,
                    size,
                    offset: Some(offset),
                }))
            }
            Side::Upload(factory) => {
                let reader = match factory.open(offset, &self.events, self.pool, true) {
                    Ok(r) => r,
                    Err(e) => return Ok(Some(self.open_failed(e))),
                };
                let info = reader.shared_memory_info();
                let handle = self.exporter.export(&info)?;
                let size = info.size as u64;
                self.reader = Some(reader);
                Ok(Some(Reply::Opened {
                    handle,
                    size,
                    offset: None,
                }))
            }
        }
    }

    fn open_failed(&mut self, error: AioError) -> Reply {
        warn!(%error, "cannot open local file for worker");
        self.open_error = Some(error);
        Reply::OpenFailed
    }

    fn on_next(&mut self, processed: u64) -> Option<Reply> {
        if let Some(reader) = &mut self.reader {
            return match reader.read() {
                ReadResult::Wait => None,
                ReadResult::Error => Some(Reply::Error),
                ReadResult::Ok(buf) => Some(Reply::Buffer {
                    offset: buf.offset() as u64,
                    len: buf.len() as u64,
                }),
            };
        }

        let Some(writer) = &mut self.writer else {
            return Some(Reply::Error);
        };
        if let Some(buf) = &mut self.buffer {
            buf.set_len(usize::try_from(processed).unwrap_or(usize::MAX));
        }
        match writer.get_write_buffer(self.buffer.take()) {
            WriteResult::Wait => None,
            WriteResult::Error => Some(Reply::Error),
            WriteResult::Ok(buf) => {
                let reply = Reply::Buffer {
                    offset: buf.offset() as u64,
                    len: buf.capacity() as u64,
                };
                self.buffer = Some(buf);
                Some(reply)
            }
        }
    }

    fn on_finalize(&mut self, last: u64) -> Option<Reply> {
        self.finalizing = true;
        let Some(writer) = &mut self.writer else {
            return Some(Reply::FinalizeFailed);
        };
        if let Some(buf) = &mut self.buffer {
            buf.set_len(usize::try_from(last).unwrap_or(usize::MAX));
        }
        match writer.finalize(self.buffer.take()) {
            FinalizeResult::Wait => None,
            FinalizeResult::Ok => {
                self.finalized = true;
                Some(Reply::Finalized)
            }
            FinalizeResult::Error => Some(Reply::FinalizeFailed),
        }
    }

    fn on_size(&self) -> Reply {
        let size = match (&self.reader, &self.writer) {
            (Some(r), _) => r.size(),
            (None, Some(w)) => w.size(),
            (None, None) => None,
        };
        size.map_or(Reply::Error, Reply::Size)
    }

    /// Answers requests from `input` on `output` until the worker closes its side.
    ///
    /// `events` must be the receiver paired with the sender this endpoint
    /// was created with.
    pub async fn serve<R, W>(
        &mut self,
        input: R,
        output: &mut W,
        events: &mut EventReceiver,
    ) -> Result<(), DataChannelError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        loop {
            let reply = tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        debug!("worker closed the sideband");
                        return Ok(());
                    };
                    if line.len() >= MAX_LINE_LEN {
                        return Err(DataChannelError::Protocol(format!(
                            "line too long: {} bytes",
                            line.len()
                        )));
                    }
                    self.handle(Request::parse(&line)?)?
                }
                Some(event) = events.recv() => self.on_ready(event),
            };
            if let Some(reply) = reply {
                write_reply(output, &reply).await?;
            }
        }
    }
}

impl Drop for SharedIoEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkferry_aio::{MemorySink, event_channel};
    use bytes::Bytes;

    struct FakeExporter;

    impl HandleExporter for FakeExporter {
        fn export(
            &mut self,
            _info: &bulkferry_aio::SharedMemoryInfo<'_>,
        ) -> Result<i64, DataChannelError> {
            Ok(99)
        }
    }

    fn config() -> PoolConfig {
        PoolConfig {
            buffer_size: 8,
            buffer_count: 2,
        }
    }

    #[test]
    fn requests_before_open_are_errors() {
        let (tx, _rx) = event_channel();
        let mut ep = SharedIoEndpoint::download(
            WriterFactory::memory("m", MemorySink::new()),
            false,
            tx,
            config(),
            Box::new(FakeExporter),
        );
        assert_eq!(ep.handle(Request::Next { processed: 0 }).unwrap(), Some(Reply::Error));
        assert_eq!(ep.handle(Request::Size).unwrap(), Some(Reply::Error));
        assert_eq!(
            ep.handle(Request::Finalize { last: 0 }).unwrap(),
            Some(Reply::FinalizeFailed)
        );
    }

    #[test]
    fn resume_without_local_size_reports_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = event_channel();
        let mut ep = SharedIoEndpoint::download(
            WriterFactory::file(dir.path().join("absent")),
            true,
            tx,
            config(),
            Box::new(FakeExporter),
        );
        assert_eq!(
            ep.handle(Request::Open { offset: 0 }).unwrap(),
            Some(Reply::ResumeSizeUnknown)
        );
    }

    #[test]
    fn failed_open_is_reported_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = event_channel();
        let mut ep = SharedIoEndpoint::upload(
            ReaderFactory::file(dir.path().join("absent")),
            tx,
            config(),
            Box::new(FakeExporter),
        );
        assert_eq!(
            ep.handle(Request::Open { offset: 0 }).unwrap(),
            Some(Reply::OpenFailed)
        );
        assert!(matches!(ep.take_open_error(), Some(AioError::Open { .. })));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn upload_hands_out_buffers_then_eof() {
        let (tx, _rx) = event_channel();
        let mut ep = SharedIoEndpoint::upload(
            ReaderFactory::memory("m", Bytes::from_static(b"0123456789")),
            tx,
            config(),
            Box::new(FakeExporter),
        );

        let Some(Reply::Opened { handle, size, offset }) =
            ep.handle(Request::Open { offset: 2 }).unwrap()
        else {
            panic!("not opened");
        };
        assert_eq!(handle, 99);
        assert!(size > 0);
        assert_eq!(offset, None);
        assert_eq!(ep.handle(Request::Open { offset: 0 }).unwrap(), Some(Reply::Busy));
        assert_eq!(ep.handle(Request::Size).unwrap(), Some(Reply::Size(10)));

        let lens: Vec<u64> = (0..3)
            .map(|_| match ep.handle(Request::Next { processed: 0 }).unwrap() {
                Some(Reply::Buffer { len, .. }) => len,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(lens, vec![8, 0, 0]);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn download_finalize_waits_for_event() {
        let (tx, mut rx) = event_channel();
        let sink = MemorySink::new();
        let mut ep = SharedIoEndpoint::download(
            WriterFactory::memory("m", sink.clone()),
            false,
            tx,
            config(),
            Box::new(FakeExporter),
        );
        assert!(matches!(
            ep.handle(Request::Open { offset: 0 }).unwrap(),
            Some(Reply::Opened { offset: Some(0), .. })
        ));
        let Some(Reply::Buffer { len: capacity, .. }) =
            ep.handle(Request::Next { processed: 0 }).unwrap()
        else {
            panic!("no buffer");
        };
        assert_eq!(capacity, 8);

        let mut reply = ep.handle(Request::Finalize { last: 0 }).unwrap();
        while reply.is_none() {
            let ev = rx.blocking_recv().unwrap();
            reply = ep.on_ready(ev);
        }
        assert_eq!(reply, Some(Reply::Finalized));
        assert!(ep.is_finalized());
        assert!(sink.is_empty());
    }
}
