//! Ring bookkeeping shared between a consumer and its worker thread.

use parking_lot::{Condvar, Mutex};

use crate::event::Notifier;
use crate::pool::BufferPool;

#[derive(Debug, Default)]
pub(crate) struct RingState {
    /// First slot holding data handed from producer to consumer.
    pub ready_pos: usize,
    /// Slots ready for the consumer, including the one it is processing.
    pub ready_count: usize,
    /// The consumer holds the slot at `ready_pos` (reader) or at
    /// `ready_pos + ready_count` (writer).
    pub processing: bool,
    /// Valid bytes per slot.
    pub lens: Vec<usize>,
    pub quit: bool,
    /// Sticky once set.
    pub error: bool,
    pub handler_waiting: bool,
    /// Reader only: the source reported end of data.
    pub eof: bool,
    /// Writer only: no more buffers will be submitted.
    pub finalizing: bool,
    /// Writer only: every buffer was written and the sink flushed.
    pub drained: bool,
    /// Writer only: a [`WriteBuffer`](crate::WriteBuffer) is out with the caller.
    pub checked_out: bool,
    pub ticket: u64,
    /// Cleared on close so nothing gets posted afterwards.
    pub notifier: Option<Notifier>,
}

impl RingState {
    /// Forgets all buffered data. Sticky error survives.
    pub fn reset(&mut self) {
        self.ready_pos = 0;
        self.ready_count = 0;
        self.processing = false;
        self.lens.iter_mut().for_each(|l| *l = 0);
        self.quit = false;
        self.handler_waiting = false;
        self.eof = false;
        self.checked_out = false;
    }

    /// Posts one event if the consumer is waiting for one.
    pub fn wake_consumer(&mut self) {
        if self.handler_waiting {
            self.handler_waiting = false;
            if let Some(n) = &self.notifier {
                n.post();
            }
        }
    }
}

pub(crate) struct Ring {
    pub pool: BufferPool,
    pub state: Mutex<RingState>,
    pub cond: Condvar,
}

impl Ring {
    pub fn new(pool: BufferPool, notifier: Notifier) -> Self {
        let state = RingState {
            lens: vec![0; pool.buffer_count()],
            notifier: Some(notifier),
            ..RingState::default()
        };
        Self {
            pool,
            state: Mutex::new(state),
            cond: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.pool.buffer_count()
    }

    /// Tells the worker to stop and wakes it if it sleeps.
    pub fn request_quit(&self) {
        let mut state = self.state.lock();
        state.quit = true;
        self.cond.notify_all();
    }

    /// Clears the queue and stops posting events.
    pub fn detach(&self) {
        let mut state = self.state.lock();
        state.ready_count = 0;
        state.processing = false;
        state.handler_waiting = false;
        state.notifier = None;
    }
}
