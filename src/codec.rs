//! Newline-delimited JSON framing for the custom transfer protocol.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, BufRead, Write};

use crate::messages::{Envelope, Event};
use crate::{Error, Result};

/// Default cap on a single protocol line (10 MiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

const TERMINATE_NEEDLE: &[u8] = b"\"terminate\"";

/// Decode one protocol line into a message type.
pub fn decode<T: DeserializeOwned>(line: &[u8]) -> Result<T> {
    serde_json::from_slice(line).map_err(|e| Error::MalformedMessage(e.to_string()))
}

/// Decode just enough of a line to classify it.
pub fn decode_envelope(line: &[u8]) -> Result<Envelope> {
    decode(line)
}

/// Encode a message as a single line, newline included.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Encode a message onto a writer. Flushing is left to the caller.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let bytes = encode(message)?;
    writer.write_all(&bytes)?;
    Ok(())
}

/// Cheap pre-filter: could this line be a terminate event?
///
/// A hit is only a hint; [`is_terminate`] confirms it with a real parse.
pub fn terminate_hint(line: &[u8]) -> bool {
    line.windows(TERMINATE_NEEDLE.len())
        .any(|w| w == TERMINATE_NEEDLE)
}

/// Whether a line is a terminate event, checked with the substring fast path
/// and then confirmed by decoding.
pub fn is_terminate(line: &[u8]) -> bool {
    terminate_hint(line)
        && matches!(decode_envelope(line), Ok(env) if env.event() == Event::Terminate)
}

/// Pull a well-formed OID out of a truncated request line, so a line too
/// long to parse can still be answered against the object it names.
pub fn oid_hint(head: &[u8]) -> Option<&str> {
    const KEY: &[u8] = b"\"oid\"";
    let at = head.windows(KEY.len()).position(|w| w == KEY)?;
    let rest = trim_start(&head[at + KEY.len()..]);
    let rest = trim_start(rest.strip_prefix(b":")?);
    let rest = rest.strip_prefix(b"\"")?;
    let candidate = rest.get(..64)?;
    if rest.get(64) != Some(&b'"') || !candidate.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    std::str::from_utf8(candidate).ok()
}

fn trim_start(bytes: &[u8]) -> &[u8] {
    let skip = bytes.iter().take_while(|b| b.is_ascii_whitespace()).count();
    &bytes[skip..]
}

/// One line pulled off the input stream.
#[derive(Debug, PartialEq, Eq)]
pub enum Line<'a> {
    /// A complete line, without its terminator.
    Data(&'a [u8]),
    /// A line longer than the cap. Only its first `max_len` bytes were
    /// kept.
    Oversized { len: usize, head: &'a [u8] },
}

/// Reads newline-terminated lines with an upper bound on line length.
///
/// An oversized line is consumed up to its newline but only its head is
/// buffered, so a runaway producer cannot exhaust memory or desynchronise the
/// framing of the lines that follow it.
pub struct LineReader<R> {
    reader: R,
    max_len: usize,
    buf: Vec<u8>,
}

impl<R: BufRead> LineReader<R> {
    pub fn new(reader: R, max_len: usize) -> Self {
        LineReader {
            reader,
            max_len: max_len.max(1),
            buf: Vec::with_capacity(64 * 1024),
        }
    }

    /// Next line, or `None` at end of input.
    ///
    /// A final line without a trailing newline is still returned. A trailing
    /// `\r` is stripped.
    pub fn next_line(&mut self) -> io::Result<Option<Line<'_>>> {
        self.buf.clear();
        let mut len = 0usize;
        let mut read_any = false;

        loop {
            let available = match self.reader.fill_buf() {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if available.is_empty() {
                break;
            }
            read_any = true;

            let (chunk_len, consumed, done) = match available.iter().position(|&b| b == b'\n') {
                Some(i) => (i, i + 1, true),
                None => (available.len(), available.len(), false),
            };

            let keep = chunk_len.min(self.max_len - self.buf.len());
            self.buf.extend_from_slice(&available[..keep]);
            len += chunk_len;

            self.reader.consume(consumed);
            if done {
                break;
            }
        }

        if !read_any {
            return Ok(None);
        }
        if len > self.max_len {
            return Ok(Some(Line::Oversized {
                len,
                head: &self.buf,
            }));
        }
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        Ok(Some(Line::Data(&self.buf)))
    }
}
