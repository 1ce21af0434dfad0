//! Message framing: pull one raw message at a time off a byte stream.

use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::path::Path;

use bepline_config::StreamSettings;
use flate2::read::GzDecoder;

use crate::error::StreamError;
use crate::event::EventRecord;

/// Upper bound on the buffer reserved up front for one frame body.
const INITIAL_FRAME_CAPACITY: usize = 64 * 1024;

/// A forward-only source of raw message bodies.
///
/// Holds no state besides its position in the underlying stream.
pub trait EventSource {
    /// Read the next message body, or `None` at a clean end of stream.
    ///
    /// # Errors
    /// Returns an error if the underlying reader fails or the framing is broken.
    fn next_message(&mut self) -> Result<Option<Vec<u8>>, StreamError>;
}

impl<S: EventSource + ?Sized> EventSource for Box<S> {
    fn next_message(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        (**self).next_message()
    }
}

/// Varint-length-prefixed messages, the framing BEP binary files use.
#[derive(Debug)]
pub struct DelimitedSource<R> {
    reader: R,
    offset: u64,
    max_frame_bytes: u64,
}

impl<R: Read> DelimitedSource<R> {
    pub fn new(reader: R, settings: &StreamSettings) -> Self {
        Self {
            reader,
            offset: 0,
            max_frame_bytes: settings.max_frame_bytes,
        }
    }

    fn read_byte(&mut self) -> Result<Option<u8>, StreamError> {
        let mut byte = [0u8; 1];
        loop {
            match self.reader.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.offset = self.offset.saturating_add(1);
                    return Ok(Some(byte[0]));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(source) => {
                    return Err(StreamError::Io {
                        offset: self.offset,
                        source,
                    })
                }
            }
        }
    }

    /// Read an unsigned LEB128 length. `None` on EOF before the first byte.
    fn read_length(&mut self) -> Result<Option<u64>, StreamError> {
        let start = self.offset;
        let mut value: u64 = 0;
        for shift in (0..64).step_by(7) {
            let Some(byte) = self.read_byte()? else {
                if shift == 0 {
                    return Ok(None);
                }
                return Err(StreamError::Truncated {
                    offset: self.offset,
                });
            };
            // The tenth byte holds only the top bit of a u64.
            if shift == 63 && byte > 1 {
                return Err(StreamError::BadLengthPrefix { offset: start });
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(Some(value));
            }
        }
        Err(StreamError::BadLengthPrefix { offset: start })
    }
}

impl<R: Read> EventSource for DelimitedSource<R> {
    fn next_message(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        let frame_start = self.offset;
        let Some(len) = self.read_length()? else {
            return Ok(None);
        };
        if len > self.max_frame_bytes {
            return Err(StreamError::FrameTooLarge {
                offset: frame_start,
                len,
                max: self.max_frame_bytes,
            });
        }

        let capacity = usize::try_from(len).map_err(|_| StreamError::FrameTooLarge {
            offset: frame_start,
            len,
            max: self.max_frame_bytes,
        })?;
        // The prefix is untrusted until the body arrives; let the buffer grow.
        let mut body = Vec::with_capacity(capacity.min(INITIAL_FRAME_CAPACITY));
        let read = (&mut self.reader)
            .take(len)
            .read_to_end(&mut body)
            .map_err(|source| StreamError::Io {
                offset: self.offset,
                source,
            })?;
        self.offset = self.offset.saturating_add(read as u64);
        if body.len() != capacity {
            return Err(StreamError::Truncated {
                offset: self.offset,
            });
        }
        Ok(Some(body))
    }
}

/// Newline-delimited JSON records. Blank lines are skipped.
#[derive(Debug)]
pub struct JsonLinesSource<R> {
    reader: R,
    offset: u64,
    max_frame_bytes: u64,
}

impl<R: BufRead> JsonLinesSource<R> {
    pub fn new(reader: R, settings: &StreamSettings) -> Self {
        Self {
            reader,
            offset: 0,
            max_frame_bytes: settings.max_frame_bytes,
        }
    }
}

impl<R: BufRead> EventSource for JsonLinesSource<R> {
    fn next_message(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        loop {
            let line_start = self.offset;
            let mut line = Vec::new();
            let read = (&mut self.reader)
                .take(self.max_frame_bytes.saturating_add(1))
                .read_until(b'\n', &mut line)
                .map_err(|source| StreamError::Io {
                    offset: self.offset,
                    source,
                })?;
            if read == 0 {
                return Ok(None);
            }
            self.offset = self.offset.saturating_add(read as u64);
            if line.last() == Some(&b'\n') {
                line.pop();
            } else if read as u64 > self.max_frame_bytes {
                return Err(StreamError::FrameTooLarge {
                    offset: line_start,
                    len: read as u64,
                    max: self.max_frame_bytes,
                });
            }
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(line));
        }
    }
}

/// Open an event stream file, choosing the framing from its extension.
///
/// `.json`, `.jsonl` and `.ndjson` files are read as JSON lines; anything else
/// as length-delimited messages. A trailing `.gz` is decompressed first and
/// the extension before it decides the framing.
///
/// # Errors
/// Returns an error if the file cannot be opened.
pub fn open_path(
    path: &Path,
    settings: &StreamSettings,
) -> Result<Box<dyn EventSource + Send>, StreamError> {
    let file = File::open(path).map_err(|source| StreamError::Open {
        path: path.display().to_string(),
        source,
    })?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let (gzipped, inner) = match name.strip_suffix(".gz") {
        Some(inner) => (true, inner.to_owned()),
        None => (false, name),
    };
    let json_lines = [".json", ".jsonl", ".ndjson"]
        .iter()
        .any(|ext| inner.ends_with(ext));

    let reader: Box<dyn Read + Send> = if gzipped {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    tracing::debug!(
        path = %path.display(),
        gzipped,
        json_lines,
        "opening build event stream"
    );

    if json_lines {
        Ok(Box::new(JsonLinesSource::new(BufReader::new(reader), settings)))
    } else {
        Ok(Box::new(DelimitedSource::new(BufReader::new(reader), settings)))
    }
}

/// Append one varint-length-prefixed record to `writer`.
///
/// # Errors
/// Returns an error if the record cannot be encoded or written.
pub fn write_delimited<W: Write>(writer: &mut W, record: &EventRecord) -> Result<(), StreamError> {
    let body = serde_json::to_vec(record).map_err(|source| StreamError::Encode { source })?;
    let mut prefix = Vec::with_capacity(10);
    let mut len = body.len() as u64;
    loop {
        #[allow(clippy::cast_possible_truncation)]
        let low = (len & 0x7f) as u8;
        len >>= 7;
        if len == 0 {
            prefix.push(low);
            break;
        }
        prefix.push(low | 0x80);
    }
    writer
        .write_all(&prefix)
        .and_then(|()| writer.write_all(&body))
        .map_err(|source| StreamError::Io { offset: 0, source })
}
