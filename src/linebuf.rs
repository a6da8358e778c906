//! Incremental line reconstruction for one output stream.
//!
//! A [`LineAccumulator`] turns an unbounded byte stream that arrives in
//! arbitrary chunks into display rows. Each call to [`LineAccumulator::read`]
//! consumes one unit of input and reports at most one line boundary:
//!
//! - `\n` completes a line ([`Terminator::Newline`])
//! - `\r` means the row will be overwritten from its start on the next call
//!   ([`Terminator::CarriageReturn`])
//! - anything else is a partial line ([`Terminator::None`])
//!
//! Bytes that follow the first terminator in a chunk are held back as a
//! pending fragment and replayed by the next `read` without touching the
//! source.

use std::io::{self, Read};

/// How the segment returned by [`LineAccumulator::read`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    /// No terminator yet, the line continues.
    None,
    /// Line feed: a completed line.
    Newline,
    /// Carriage return: the row restarts from column zero.
    CarriageReturn,
}

impl Terminator {
    /// The byte this terminator stood for in the input, if any.
    #[cfg(test)]
    pub fn byte(self) -> Option<u8> {
        match self {
            Terminator::None => None,
            Terminator::Newline => Some(b'\n'),
            Terminator::CarriageReturn => Some(b'\r'),
        }
    }
}

/// Bytes added to the row by one [`LineAccumulator::read`] call.
#[derive(Debug, PartialEq, Eq)]
pub struct Segment<'a> {
    pub text: &'a [u8],
    pub terminator: Terminator,
}

/// Per-stream row buffer.
pub struct LineAccumulator {
    /// Row storage, its length is the capacity
    buf: Vec<u8>,
    /// Bytes committed to the current row
    cursor: usize,
    /// Already received bytes that belong after the last reported terminator
    pending: Option<Vec<u8>>,
    /// The last segment ended with `\r`
    carriage_return: bool,
}

impl LineAccumulator {
    /// Create an empty accumulator holding rows of up to `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity.max(1)],
            cursor: 0,
            pending: None,
            carriage_return: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[cfg(test)]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// The visible content of the current row.
    pub fn line(&self) -> &[u8] {
        &self.buf[..self.cursor]
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Change the row capacity. The current row is discarded, a pending
    /// fragment is kept for the next read.
    pub fn resize(&mut self, capacity: usize) {
        self.buf = vec![0; capacity.max(1)];
        self.reset();
    }

    /// Start a new row. The pending fragment survives.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// The row filled up without a terminator and must wrap.
    pub fn is_full(&self) -> bool {
        self.cursor == self.capacity()
    }

    /// Consume one unit of input.
    ///
    /// Replays the pending fragment if there is one, otherwise performs a
    /// single read from `source` into the free part of the row. Returns
    /// `Ok(None)` at end of stream. A source that would block yields an empty
    /// segment rather than an error.
    pub fn read<R: Read + ?Sized>(&mut self, source: &mut R) -> io::Result<Option<Segment<'_>>> {
        if self.carriage_return {
            self.carriage_return = false;
            self.cursor = 0;
        }
        if self.is_full() {
            self.cursor = 0;
        }

        let start = self.cursor;
        let space = self.capacity() - start;
        let count = match self.pending.take() {
            Some(mut fragment) => {
                let count = fragment.len().min(space);
                self.buf[start..start + count].copy_from_slice(&fragment[..count]);
                if count < fragment.len() {
                    fragment.drain(..count);
                    self.pending = Some(fragment);
                }
                count
            }
            None => loop {
                match source.read(&mut self.buf[start..]) {
                    Ok(0) => return Ok(None),
                    Ok(count) => break count,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break 0,
                    Err(e) => return Err(e),
                }
            },
        };

        let end = start + count;
        let found = self.buf[start..end]
            .iter()
            .position(|&b| b == b'\n' || b == b'\r');

        let terminator = match found {
            Some(offset) => {
                let at = start + offset;
                let terminator = if self.buf[at] == b'\n' {
                    Terminator::Newline
                } else {
                    self.carriage_return = true;
                    Terminator::CarriageReturn
                };

                if at + 1 < end {
                    let mut fragment = self.buf[at + 1..end].to_vec();
                    if let Some(rest) = self.pending.take() {
                        fragment.extend_from_slice(&rest);
                    }
                    self.pending = Some(fragment);
                }
                self.cursor = at;
                terminator
            }
            None => {
                self.cursor = end;
                Terminator::None
            }
        };

        Ok(Some(Segment {
            text: &self.buf[start..self.cursor],
            terminator,
        }))
    }
}
