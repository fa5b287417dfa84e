//! Ready notifications posted by background workers.
//!
//! Workers never touch loop-owned state. They only post an [`AioEvent`] into
//! the loop's queue, which is a tokio unbounded channel so posting works
//! from plain threads.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::trace;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies the reader or writer that posted an event.
///
/// Ids are never reused, so an event queued by an instance that has since
/// been closed can be recognised and dropped by the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

impl SourceId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// What became possible again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioEventKind {
    /// A reader has a filled buffer or hit an error.
    ReadReady,
    /// A writer freed a buffer, finished draining, or hit an error.
    WriteReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AioEvent {
    pub source: SourceId,
    pub kind: AioEventKind,
}

pub type EventSender = mpsc::UnboundedSender<AioEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<AioEvent>;

/// Creates the queue a consumer listens on.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Posts events for one reader or writer.
#[derive(Debug, Clone)]
pub(crate) struct Notifier {
    tx: EventSender,
    event: AioEvent,
}

impl Notifier {
    pub(crate) fn new(tx: EventSender, source: SourceId, kind: AioEventKind) -> Self {
        Self {
            tx,
            event: AioEvent { source, kind },
        }
    }

    pub(crate) fn post(&self) {
        if self.tx.send(self.event).is_err() {
            trace!(source = self.event.source.get(), "event loop gone, dropping ready event");
        }
    }
}
