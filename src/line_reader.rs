use std::io;

use bytes::{Bytes, BytesMut};
use itertools::Itertools;
use tokio::io::{AsyncRead, AsyncReadExt};

/// The outcome of a counted-data read: either the payload with its CRLF
/// terminator intact, or the same number of bytes consumed but not followed
/// by CRLF (a client framing error).
#[derive(Debug, Eq, PartialEq)]
pub enum CountedRead {
    Complete(Bytes),
    MissingTerminator,
}

/// Provides a facility to read CRLF-terminated lines, and counted data
/// frames (a job body of a declared length plus trailing CRLF), from a
/// stream.
pub struct LineReader<T: AsyncRead + Unpin> {
    /// Stores data that's been read in but not yet consumed.
    buf: BytesMut,
    /// Index in buf from which a valid CRLF pair may appear (and before which
    /// a CRLF sequence hasn't been seen).
    maybe_crlf_from: usize,
    /// Data source
    reader: T,
    /// On a reading error, this field is set and its value returned once the
    /// buffer is drained of pending lines.
    pending_error: Option<io::Error>,
}

impl<T: AsyncRead + Unpin> LineReader<T> {
    /// Reads a line from the internal buffer and/or reader. On an end-of-stream
    /// condition, returns a None result, discarding any partly-read line in the
    /// internal buffer.
    ///
    /// This function is cancel-safe: its only async operation is a `read_buf`
    /// against the internal `reader`, and so it has the same guarantees:
    /// either a complete read occurs and is processed, or this is cancelled.
    ///
    /// On a read error, the error value is returned after processing all
    /// pending lines in the internal buffer, but calling `read_line` again will
    /// attempt a new read safely.
    pub async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            // We slice and dice buf here to avoid re-reading all but the last
            // byte of the part of the command we've already seen, keeping
            // O(bytes_read) behaviour.
            // Note also we need to scan from one position earlier than the
            // start of the newest bytes in case we received a \r then \n on the
            // next read.
            // The outer loop ensures pipelined lines that arrive in the same
            // read_buf call are handled correctly: we only call read_buf once
            // all pending lines in the internal buffer have been removed.
            if let Some(eoc) = self
                .buf
                .iter()
                .skip(self.maybe_crlf_from)
                .tuple_windows::<(_, _)>()
                .position(|x| x == (&b'\r', &b'\n'))
            {
                // This should be a complete command. Freeze the result to make
                // it read-only.
                let cmd =
                    self.buf.split_to(self.maybe_crlf_from + eoc + 2).freeze();

                // Drop trailing b"\r\n".
                let cmd = cmd.slice(0..cmd.len() - 2);

                // Zero out the maybe_crlf_from position so we restart scanning
                // for commands from the start of the unread buffer section.
                self.maybe_crlf_from = 0;

                return Ok(Some(cmd));
            } else if !self.fill().await? {
                return match self.pending_error.take() {
                    Some(e) => Err(e),
                    None => Ok(None),
                };
            }
        }
    }

    /// Reads exactly `n` bytes of counted data plus the two-byte CRLF
    /// terminator, as sent after an `add` command line. Returns None on an
    /// end-of-stream condition before the full frame arrived.
    ///
    /// The `n + 2` bytes are consumed either way; whether the terminator was
    /// actually CRLF is reported in the result, so a framing error leaves the
    /// stream positioned at the next command.
    ///
    /// Cancel-safe for the same reason as `read_line`: consumed bytes only
    /// leave the internal buffer synchronously, once the full frame is
    /// available.
    pub async fn read_counted(
        &mut self,
        n: usize,
    ) -> io::Result<Option<CountedRead>> {
        let want = n + 2;

        while self.buf.len() < want {
            if !self.fill().await? {
                return match self.pending_error.take() {
                    Some(e) => Err(e),
                    None => Ok(None),
                };
            }
        }

        let frame = self.buf.split_to(want).freeze();

        // Anything the CRLF scan learnt about consumed bytes is now stale.
        self.maybe_crlf_from = 0;

        Ok(Some(if frame.ends_with(b"\r\n") {
            CountedRead::Complete(frame.slice(0..n))
        } else {
            CountedRead::MissingTerminator
        }))
    }

    /// Tries to grow the buffer with a single read, returning false on an
    /// end-of-stream or error condition (the error is parked in
    /// `pending_error` for the caller to surface).
    async fn fill(&mut self) -> io::Result<bool> {
        let n_bytes_read = match self.reader.read_buf(&mut self.buf).await {
            Ok(n) => n,
            Err(e) => {
                self.pending_error = Some(e);
                0
            },
        };

        // Slightly convoluted, but all this does is set maybe_crlf_from
        // to the byte before the first byte returned in the read_buf
        // call (and 0 if buf is empty).
        self.maybe_crlf_from =
            self.buf.len().checked_sub(n_bytes_read + 1).unwrap_or(0);

        Ok(n_bytes_read != 0)
    }
}

impl<T: AsyncRead + Unpin> From<T> for LineReader<T> {
    fn from(value: T) -> Self {
        Self {
            buf: BytesMut::new(),
            maybe_crlf_from: 0,
            reader: value,
            pending_error: None,
        }
    }
}
