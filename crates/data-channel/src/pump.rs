//! Moving bytes between a blocking stream and a reader or writer ring.
//!
//! Used when the protocol runs in-process and the data connection is an
//! ordinary stream. Both pumps stop with [`PumpStatus::Wait`] as soon as
//! the ring cannot make progress and pick up where they left off on the
//! next call.

use std::io::{self, Read, Write};

use bulkferry_aio::{FinalizeResult, ReadResult, Reader, WriteBuffer, WriteResult, Writer};

use crate::error::DataChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpStatus {
    /// Everything was moved (and, for writers, flushed).
    Done,
    /// Call again after the next ready event.
    Wait,
}

/// Copies a [`Reader`] into a stream.
#[derive(Debug, Default)]
pub struct DrainPump {
    copied: u64,
}

impl DrainPump {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn copied(&self) -> u64 {
        self.copied
    }

    pub fn pump<W: Write + ?Sized>(
        &mut self,
        reader: &mut Reader,
        out: &mut W,
    ) -> Result<PumpStatus, DataChannelError> {
        loop {
            match reader.read() {
                ReadResult::Ok(buf) if buf.is_empty() => {
                    out.flush()?;
                    return Ok(PumpStatus::Done);
                }
                ReadResult::Ok(buf) => {
                    out.write_all(&buf)?;
                    self.copied += buf.len() as u64;
                }
                ReadResult::Wait => return Ok(PumpStatus::Wait),
                ReadResult::Error => return Err(DataChannelError::ReadFailed),
            }
        }
    }
}

/// Copies a stream into a [`Writer`], finalizing it at end of input.
#[derive(Debug, Default)]
pub struct FillPump {
    last: Option<WriteBuffer>,
    eof: bool,
    copied: u64,
}

impl FillPump {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn copied(&self) -> u64 {
        self.copied
    }

    pub fn pump<R: Read + ?Sized>(
        &mut self,
        input: &mut R,
        writer: &mut Writer,
    ) -> Result<PumpStatus, DataChannelError> {
        while !self.eof {
            let mut buf = match writer.get_write_buffer(self.last.take()) {
                WriteResult::Ok(b) => b,
                WriteResult::Wait => return Ok(PumpStatus::Wait),
                WriteResult::Error => return Err(DataChannelError::WriteFailed),
            };
            while buf.remaining() > 0 {
                let n = read_retrying(input, buf.spare_mut())?;
                if n == 0 {
                    self.eof = true;
                    break;
                }
                buf.advance(n);
                self.copied += n as u64;
            }
            self.last = Some(buf);
        }

        match writer.finalize(self.last.take()) {
            FinalizeResult::Ok => Ok(PumpStatus::Done),
            FinalizeResult::Wait => Ok(PumpStatus::Wait),
            FinalizeResult::Error => Err(DataChannelError::WriteFailed),
        }
    }
}

fn read_retrying<R: Read + ?Sized>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match input.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            r => return r,
        }
    }
}
