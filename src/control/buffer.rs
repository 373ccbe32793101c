//! Per-connection byte buffers.
//!
//! The read side accumulates whatever the stream yields until the dispatcher
//! finds a complete packet at the head. The write side queues replies and
//! events; it applies backpressure through a high/low watermark pair and
//! refuses outright past a hard cap, since silently dropping protocol bytes
//! would corrupt the stream.

use std::io::{self, Read, Write};

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const READ_CHUNK: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("write buffer overflow: {queued} queued + {incoming} incoming > cap {cap}")]
pub struct OverflowError {
    pub queued: usize,
    pub incoming: usize,
    pub cap: usize,
}

/// Watermarks governing the write buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferLimits {
    /// Reads are suspended while the write buffer sits above this.
    pub high_water: usize,
    /// Reads resume once the write buffer drains below this.
    pub low_water: usize,
    /// Appending beyond this closes the connection.
    pub hard_cap: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        BufferLimits {
            high_water: 8 * 1024,
            low_water: 2 * 1024,
            hard_cap: 64 * 1024,
        }
    }
}

/// Inbound accumulation buffer.
#[derive(Default)]
pub struct ReadBuffer {
    buf: BytesMut,
}

pub enum FillOutcome {
    /// The stream would block; nothing more to read for now.
    WouldBlock,
    /// The peer closed its write side.
    Eof,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pull everything currently available from `reader`.
    pub fn fill(&mut self, reader: &mut impl Read) -> io::Result<FillOutcome> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => return Ok(FillOutcome::Eof),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FillOutcome::WouldBlock)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Drop `n` bytes from the head (a fully processed packet).
    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n);
    }
}

/// Outbound queue with watermark-based backpressure.
pub struct WriteBuffer {
    buf: BytesMut,
    limits: BufferLimits,
}

impl WriteBuffer {
    pub fn new(limits: BufferLimits) -> Self {
        WriteBuffer {
            buf: BytesMut::new(),
            limits,
        }
    }

    /// Queue bytes for transmission. Fails without queueing anything when
    /// the hard cap would be exceeded.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), OverflowError> {
        if self.buf.len() + bytes.len() > self.limits.hard_cap {
            return Err(OverflowError {
                queued: self.buf.len(),
                incoming: bytes.len(),
                cap: self.limits.hard_cap,
            });
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Write as much as the stream accepts; queued bytes survive a
    /// would-block.
    pub fn flush(&mut self, writer: &mut impl Write) -> io::Result<usize> {
        let mut written = 0;
        while !self.buf.is_empty() {
            match writer.write(&self.buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "stream accepted no bytes",
                    ))
                }
                Ok(n) => {
                    self.buf.advance(n);
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn over_high_water(&self) -> bool {
        self.buf.len() > self.limits.high_water
    }

    pub fn below_low_water(&self) -> bool {
        self.buf.len() < self.limits.low_water
    }
}
