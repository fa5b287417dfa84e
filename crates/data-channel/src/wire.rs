//! Line protocol between the transfer owner and a worker process.
//!
//! # Wire format
//!
//! One request or reply per `\n`-terminated line, decimal numbers.
//!
//! ```text
//! WORKER -> OWNER:
//!   open <offset>          open the local file, resume offset for uploads
//!   next <processed>       release the current buffer, want the next one
//!   finalize <last>        last buffer holds <last> bytes, end of data
//!   size                   size of the local file
//!
//! OWNER -> WORKER:
//!   -<handle> <size>           opened for upload: region handle and size
//!   -<handle> <size> <offset>  opened for download, writing from <offset>
//!   -<offset> <len>            next buffer: region offset and length/capacity
//!   -<size>                    size reply
//!   -1                         finalized / resume size unknown
//!   -0                         busy (already open) / finalize failed
//!   --                         open failed
//!   --1                        error / size unknown
//! ```
//!
//! Some replies share a spelling, so parsing needs to know which request
//! the reply answers ([`Expect`]).

use std::fmt;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_LINE_LEN;
use crate::error::DataChannelError;

/// A request from the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Open { offset: u64 },
    Next { processed: u64 },
    Finalize { last: u64 },
    Size,
}

/// A reply from the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// The file is open; `handle` is valid in the worker process.
    Opened {
        handle: i64,
        size: u64,
        /// Download only: where writing starts.
        offset: Option<u64>,
    },
    /// Resume requested but the local size is unknown.
    ResumeSizeUnknown,
    /// A reader or writer is already open.
    Busy,
    OpenFailed,
    /// A buffer at `offset` from the region base. For uploads `len` bytes
    /// are valid (zero at end of data); for downloads it is the capacity.
    Buffer { offset: u64, len: u64 },
    Finalized,
    FinalizeFailed,
    Size(u64),
    /// Error, or size unknown in reply to `size`.
    Error,
}

/// Which request a reply line answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Open,
    Next,
    Finalize,
    Size,
}

impl Request {
    pub fn expect(&self) -> Expect {
        match self {
            Request::Open { .. } => Expect::Open,
            Request::Next { .. } => Expect::Next,
            Request::Finalize { .. } => Expect::Finalize,
            Request::Size => Expect::Size,
        }
    }

    pub fn parse(line: &str) -> Result<Self, DataChannelError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (cmd, arg) = match line.split_once(' ') {
            Some((c, a)) => (c, Some(a)),
            None => (line, None),
        };
        let number = |arg: Option<&str>| -> Result<u64, DataChannelError> {
            arg.ok_or_else(|| protocol(format!("missing argument in {line:?}")))
                .and_then(|a| parse_u64(a, line))
        };

        match cmd {
            "open" => Ok(Request::Open { offset: number(arg)? }),
            "next" => Ok(Request::Next { processed: number(arg)? }),
            "finalize" => Ok(Request::Finalize { last: number(arg)? }),
            "size" if arg.is_none() => Ok(Request::Size),
            _ => Err(protocol(format!("unknown request {line:?}"))),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Open { offset } => write!(f, "open {offset}"),
            Request::Next { processed } => write!(f, "next {processed}"),
            Request::Finalize { last } => write!(f, "finalize {last}"),
            Request::Size => f.write_str("size"),
        }
    }
}

impl Reply {
    pub fn parse(line: &str, expect: Expect) -> Result<Self, DataChannelError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let body = line
            .strip_prefix('-')
            .ok_or_else(|| protocol(format!("reply without leading '-': {line:?}")))?;

        match body {
            "-1" => return Ok(Reply::Error),
            "-" if expect == Expect::Open => return Ok(Reply::OpenFailed),
            _ => {}
        }

        let fields = body
            .split(' ')
            .map(|f| parse_u64(f, line))
            .collect::<Result<Vec<_>, _>>()?;

        match (expect, fields.as_slice()) {
            (Expect::Open, [0]) => Ok(Reply::Busy),
            (Expect::Open, [1]) => Ok(Reply::ResumeSizeUnknown),
            (Expect::Open, [handle, size]) => Ok(Reply::Opened {
                handle: to_handle(*handle, line)?,
                size: *size,
                offset: None,
            }),
            (Expect::Open, [handle, size, offset]) => Ok(Reply::Opened {
                handle: to_handle(*handle, line)?,
                size: *size,
                offset: Some(*offset),
            }),
            (Expect::Next, [offset, len]) => Ok(Reply::Buffer {
                offset: *offset,
                len: *len,
            }),
            (Expect::Finalize, [1]) => Ok(Reply::Finalized),
            (Expect::Finalize, [0]) => Ok(Reply::FinalizeFailed),
            (Expect::Size, [size]) => Ok(Reply::Size(*size)),
            _ => Err(protocol(format!("unexpected reply {line:?} to {expect:?}"))),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Opened {
                handle,
                size,
                offset: None,
            } => write!(f, "-{handle} {size}"),
            Reply::Opened {
                handle,
                size,
                offset: Some(offset),
            } => write!(f, "-{handle} {size} {offset}"),
            Reply::ResumeSizeUnknown | Reply::Finalized => f.write_str("-1"),
            Reply::Busy | Reply::FinalizeFailed => f.write_str("-0"),
            Reply::OpenFailed => f.write_str("--"),
            Reply::Buffer { offset, len } => write!(f, "-{offset} {len}"),
            Reply::Size(size) => write!(f, "-{size}"),
            Reply::Error => f.write_str("--1"),
        }
    }
}

fn protocol(msg: String) -> DataChannelError {
    DataChannelError::Protocol(msg)
}

fn parse_u64(field: &str, line: &str) -> Result<u64, DataChannelError> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(protocol(format!("bad number {field:?} in {line:?}")));
    }
    field
        .parse()
        .map_err(|_| protocol(format!("number out of range in {line:?}")))
}

fn to_handle(value: u64, line: &str) -> Result<i64, DataChannelError> {
    i64::try_from(value).map_err(|_| protocol(format!("handle out of range in {line:?}")))
}

// ---------------------------------------------------------------------------
// Async stream helpers
// ---------------------------------------------------------------------------

async fn write_line<W: AsyncWrite + Unpin>(
    writer: &mut W,
    line: String,
) -> Result<(), DataChannelError> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one line of at most `MAX_LINE_LEN` bytes. Returns `None` at end
/// of stream.
async fn read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<String>, DataChannelError> {
    let mut line = String::new();
    let mut limited = (&mut *reader).take(MAX_LINE_LEN as u64 + 1);
    let n = limited.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if line.len() > MAX_LINE_LEN {
        return Err(protocol(format!("line too long: {} bytes", line.len())));
    }
    if !line.ends_with('\n') {
        return Err(protocol("truncated line".into()));
    }
    Ok(Some(line))
}

pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: &Request,
) -> Result<(), DataChannelError> {
    write_line(writer, request.to_string()).await
}

/// Reads a request. Returns `None` once the worker closed its side.
pub async fn read_request<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Request>, DataChannelError> {
    match read_line(reader).await? {
        Some(line) => Request::parse(&line).map(Some),
        None => Ok(None),
    }
}

pub async fn write_reply<W: AsyncWrite + Unpin>(
    writer: &mut W,
    reply: &Reply,
) -> Result<(), DataChannelError> {
    write_line(writer, reply.to_string()).await
}

pub async fn read_reply<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    expect: Expect,
) -> Result<Reply, DataChannelError> {
    let line = read_line(reader)
        .await?
        .ok_or_else(|| protocol("stream closed while waiting for a reply".into()))?;
    Reply::parse(&line, expect)
}
