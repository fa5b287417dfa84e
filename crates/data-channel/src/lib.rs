//! Sideband between a transfer and an out-of-process protocol worker.
//!
//! Protocols implemented by a separate worker process (SFTP) do not copy
//! file data over a pipe. The owner opens the local reader or writer with a
//! shared-memory pool, hands the region to the worker, and from then on only
//! exchanges short text lines saying which buffer to use next.
//!
//! # Wire format
//!
//! See [`wire`] module for the line protocol.

pub mod endpoint;
pub mod error;
pub mod export;
pub mod pump;
pub mod wire;

pub use endpoint::{Direction, SharedIoEndpoint};
pub use error::DataChannelError;
pub use export::HandleExporter;
#[cfg(unix)]
pub use export::InheritableExporter;
pub use pump::{DrainPump, FillPump, PumpStatus};
pub use wire::{Expect, Reply, Request};

/// Longest sideband line accepted, newline included.
pub const MAX_LINE_LEN: usize = 256;
