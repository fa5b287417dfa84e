//! End-to-end reader → writer copies through the buffer rings.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bulkferry_aio::{
    EventReceiver, FinalizeResult, PoolConfig, ReadResult, Reader, ReaderFactory, WriteBuffer,
    WriteResult, Writer, WriterFactory, event_channel,
};

const BS: usize = 64;

fn config() -> PoolConfig {
    PoolConfig {
        buffer_size: BS,
        buffer_count: 3,
    }
}

const SIZES: [usize; 6] = [0, 1, BS - 1, BS, BS + 1, 3 * BS + 7];

/// Waits for the single wakeup owed after a `Wait`.
async fn next_event(rx: &mut EventReceiver) {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("missed wakeup")
        .expect("channel closed");
    assert!(rx.try_recv().is_err(), "second wakeup for one wait");
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Copies everything from `reader` into `writer`, waiting on the shared queue.
async fn copy(reader: &mut Reader, writer: &mut Writer, rx: &mut EventReceiver) {
    let mut pending: Option<Vec<u8>> = None;
    let mut last: Option<WriteBuffer> = None;

    loop {
        if pending.is_none() {
            match reader.read() {
                ReadResult::Ok(buf) if buf.is_empty() => break,
                ReadResult::Ok(buf) => pending = Some(buf.to_vec()),
                ReadResult::Wait => {
                    next_event(rx).await;
                    continue;
                }
                ReadResult::Error => panic!("read failed"),
            }
        }

        match writer.get_write_buffer(last.take()) {
            WriteResult::Ok(mut buf) => {
                if let Some(data) = pending.take() {
                    assert_eq!(buf.extend_from_slice(&data), data.len());
                }
                last = Some(buf);
            }
            WriteResult::Wait => next_event(rx).await,
            WriteResult::Error => panic!("write failed"),
        }
    }

    finish(writer, rx, last).await;
}

async fn finish(writer: &mut Writer, rx: &mut EventReceiver, mut last: Option<WriteBuffer>) {
    loop {
        match writer.finalize(last.take()) {
            FinalizeResult::Ok => return,
            FinalizeResult::Wait => next_event(rx).await,
            FinalizeResult::Error => panic!("finalize failed"),
        }
    }
}

async fn read_to_end(reader: &mut Reader, rx: &mut EventReceiver) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        match reader.read() {
            ReadResult::Ok(b) if b.is_empty() => return out,
            ReadResult::Ok(b) => out.extend_from_slice(&b),
            ReadResult::Wait => next_event(rx).await,
            ReadResult::Error => panic!("read failed"),
        }
    }
}

/// Submits `data` in pieces of `chunk` bytes, one buffer per piece. Pieces
/// larger than a buffer spill into the next one.
async fn write_in_chunks(writer: &mut Writer, rx: &mut EventReceiver, data: &[u8], chunk: usize) {
    let mut last: Option<WriteBuffer> = None;
    for piece in data.chunks(chunk) {
        let mut rest = piece;
        while !rest.is_empty() {
            match writer.get_write_buffer(last.take()) {
                WriteResult::Ok(mut buf) => {
                    let n = buf.extend_from_slice(rest);
                    rest = &rest[n..];
                    last = Some(buf);
                }
                WriteResult::Wait => next_event(rx).await,
                WriteResult::Error => panic!("write failed"),
            }
        }
    }
    finish(writer, rx, last).await;
}

#[tokio::test]
async fn file_round_trip_at_buffer_boundaries() {
    let dir = tempfile::tempdir().unwrap();

    for len in SIZES {
        let src = dir.path().join(format!("src-{len}"));
        let dst = dir.path().join(format!("out/dst-{len}"));
        let data = pattern(len);
        std::fs::write(&src, &data).unwrap();

        let (tx, mut rx) = event_channel();
        let mut reader = ReaderFactory::file(&src).open(0, &tx, config(), false).unwrap();
        let mut writer = WriterFactory::file(&dst).open(0, &tx, config(), false).unwrap();
        copy(&mut reader, &mut writer, &mut rx).await;
        writer.close();

        assert_eq!(std::fs::read(&dst).unwrap(), data, "length {len}");
    }
}

#[tokio::test]
async fn resumed_copy_appends_tail() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    let data = pattern(3 * BS + 7);
    std::fs::write(&src, &data).unwrap();
    std::fs::write(&dst, &data[..100]).unwrap();

    let (tx, mut rx) = event_channel();
    let wf = WriterFactory::file(&dst);
    let offset = wf.size().unwrap();
    assert_eq!(offset, 100);

    let mut reader = ReaderFactory::file(&src).open(offset, &tx, config(), false).unwrap();
    let mut writer = wf.open(offset, &tx, config(), false).unwrap();
    copy(&mut reader, &mut writer, &mut rx).await;
    writer.close();

    assert_eq!(std::fs::read(&dst).unwrap(), data);
}

#[tokio::test]
async fn rewind_yields_identical_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    let data = pattern(5 * BS + 3);
    std::fs::write(&src, &data).unwrap();

    let (tx, mut rx) = event_channel();
    let mut reader = ReaderFactory::file(&src).open(10, &tx, config(), false).unwrap();

    let mut first = Vec::new();
    // Stop partway through, then rewind twice.
    while first.len() < 2 * BS {
        match reader.read() {
            ReadResult::Ok(b) => first.extend_from_slice(&b),
            ReadResult::Wait => next_event(&mut rx).await,
            ReadResult::Error => panic!("read failed"),
        }
    }
    reader.rewind().unwrap();
    reader.rewind().unwrap();

    let all = read_to_end(&mut reader, &mut rx).await;
    assert_eq!(all, &data[10..]);
    assert_eq!(&first[..], &data[10..10 + first.len()]);
}

#[tokio::test]
async fn rewind_after_eof_replays_everything() {
    let dir = tempfile::tempdir().unwrap();

    for len in SIZES {
        let src = dir.path().join(format!("src-{len}"));
        let data = pattern(len);
        std::fs::write(&src, &data).unwrap();

        let (tx, mut rx) = event_channel();
        let mut reader = ReaderFactory::file(&src).open(0, &tx, config(), false).unwrap();
        assert_eq!(read_to_end(&mut reader, &mut rx).await, data, "length {len}");
        reader.rewind().unwrap();
        assert_eq!(read_to_end(&mut reader, &mut rx).await, data, "length {len} after rewind");
        reader.close();
        assert!(rx.try_recv().is_err());
    }
}

#[tokio::test]
async fn odd_sized_writes_arrive_byte_exact() {
    for len in SIZES {
        let data = pattern(len);
        for chunk in [1, 7, BS - 1, BS + 1] {
            let (tx, mut rx) = event_channel();
            let sink = bulkferry_aio::MemorySink::new();
            let mut writer = WriterFactory::memory("sink", sink.clone())
                .open(0, &tx, config(), false)
                .unwrap();
            write_in_chunks(&mut writer, &mut rx, &data, chunk).await;
            writer.close();
            assert_eq!(sink.contents(), data, "length {len} in chunks of {chunk}");
        }
    }
}

#[tokio::test]
async fn many_small_buffers_never_miss_a_wakeup() {
    let config = PoolConfig {
        buffer_size: 1,
        buffer_count: 2,
    };
    let data = pattern(2000);
    let (tx, mut rx) = event_channel();
    let mut reader = Reader::from_stream(
        "cursor",
        Box::new(io::Cursor::new(data.clone())),
        0,
        &tx,
        config,
        false,
    )
    .unwrap();
    let sink = bulkferry_aio::MemorySink::new();
    let mut writer = WriterFactory::memory("sink", sink.clone())
        .open(0, &tx, config, false)
        .unwrap();

    copy(&mut reader, &mut writer, &mut rx).await;
    assert_eq!(sink.contents(), data);
}

/// A source whose every read takes a while.
struct Slow {
    reads: Arc<AtomicUsize>,
}

impl Read for Slow {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        std::thread::sleep(Duration::from_millis(50));
        self.reads.fetch_add(1, Ordering::SeqCst);
        buf.fill(0xAB);
        Ok(buf.len())
    }
}

impl Seek for Slow {
    fn seek(&mut self, _: SeekFrom) -> io::Result<u64> {
        Ok(0)
    }
}

#[test]
fn close_while_filling_returns_promptly() {
    let (tx, _rx) = event_channel();
    let reads = Arc::new(AtomicUsize::new(0));
    let mut reader = Reader::from_stream(
        "slow",
        Box::new(Slow {
            reads: Arc::clone(&reads),
        }),
        0,
        &tx,
        config(),
        false,
    )
    .unwrap();

    std::thread::sleep(Duration::from_millis(20));
    let started = Instant::now();
    reader.close();
    assert!(started.elapsed() < Duration::from_secs(2));

    // Nothing is read after close returns.
    let after_close = reads.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(120));
    assert_eq!(reads.load(Ordering::SeqCst), after_close);
    assert!(matches!(reader.read(), ReadResult::Error));
}

#[test]
fn events_from_closed_reader_carry_retired_id() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    std::fs::write(&src, pattern(10)).unwrap();

    let (tx, mut rx) = event_channel();
    let factory = ReaderFactory::file(&src);
    let mut old = factory.open(0, &tx, config(), false).unwrap();
    let old_id = old.source_id();
    let _ = old.read();
    old.close();

    let fresh = factory.open(0, &tx, config(), false).unwrap();
    assert_ne!(fresh.source_id(), old_id);
    while let Ok(ev) = rx.try_recv() {
        assert_eq!(ev.source, old_id);
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[test]
fn shared_memory_reader_exposes_region() {
    let (tx, _rx) = event_channel();
    let mut reader = ReaderFactory::string("s", "payload")
        .open(0, &tx, config(), true)
        .unwrap();
    assert!(reader.pool().is_shared());

    let handle = reader
        .shared_memory_info()
        .handle
        .unwrap()
        .try_clone_to_owned()
        .unwrap();
    let peer = bulkferry_aio::MappedRegion::map(handle).unwrap();

    let offset = match reader.read() {
        ReadResult::Ok(b) => b.offset(),
        other => panic!("unexpected {other:?}"),
    };
    let mut out = [0u8; 7];
    assert!(peer.read_at(offset, &mut out));
    assert_eq!(&out, b"payload");
}
