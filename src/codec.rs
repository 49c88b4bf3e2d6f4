use std::{
    io::{self, BufRead, BufReader, Read, Write},
    mem,
};

use log::trace;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Frame delimiter on the wire
pub const DELIMITER: u8 = b'\n';

/// Default upper bound on the size of a single frame
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A request sent by the initiator of an exchange
///
/// Encoded as `{"cmd": <command>, "arg": <argument>}`. A missing `arg` decodes as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "cmd")]
    pub command: String,
    #[serde(rename = "arg", default)]
    pub argument: Value,
}

impl Message {
    pub fn new(command: impl Into<String>, argument: Value) -> Self {
        Self {
            command: command.into(),
            argument,
        }
    }
}

/// Result of decoding one unit from a stream
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<T> {
    /// A complete, parsed value
    Item(T),
    /// The peer closed the stream on a frame boundary
    EndOfStream,
}

/// Serialize a value as one frame: a compact JSON document followed by [`DELIMITER`]
///
/// Compact JSON never contains a raw newline, so the delimiter is unambiguous.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(DELIMITER);
    Ok(bytes)
}

/// Reads newline-delimited frames from a byte stream
///
/// A single `read` on a stream socket may return part of a frame, exactly one frame
/// or several frames. Bytes of an incomplete frame are kept between calls, so a
/// read that fails with a timeout can be retried without losing data.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    pending: Vec<u8>,
    max_frame_len: usize,
    discarding: bool,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_frame_len(inner, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            pending: Vec::new(),
            max_frame_len,
            discarding: false,
        }
    }

    /// Get a reference to the underlying reader
    pub fn get_ref(&self) -> &R {
        self.inner.get_ref()
    }

    /// Read the raw bytes of the next frame, without its delimiter
    ///
    /// **Returns** `None` when the stream ends on a frame boundary. A stream that ends
    /// in the middle of a frame fails with [`ProtocolError::ConnectionClosed`].
    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        loop {
            let available = match self.inner.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            if available.is_empty() {
                let partial = !self.pending.is_empty() || self.discarding;
                self.pending.clear();
                self.discarding = false;
                return if partial {
                    Err(ProtocolError::ConnectionClosed)
                } else {
                    Ok(None)
                };
            }

            let (used, complete) = match available.iter().position(|&b| b == DELIMITER) {
                Some(i) => {
                    if !self.discarding {
                        self.pending.extend_from_slice(&available[..i]);
                    }
                    (i + 1, true)
                }
                None => {
                    if !self.discarding {
                        self.pending.extend_from_slice(available);
                    }
                    (available.len(), false)
                }
            };
            self.inner.consume(used);

            if complete && self.discarding {
                self.discarding = false;
                continue;
            }

            if self.pending.len() > self.max_frame_len {
                let len = self.pending.len();
                self.pending.clear();
                self.discarding = !complete;
                return Err(ProtocolError::MalformedMessage(format!(
                    "frame of {len} bytes exceeds the limit of {} bytes",
                    self.max_frame_len
                )));
            }

            if complete {
                let mut frame = mem::take(&mut self.pending);
                if frame.last() == Some(&b'\r') {
                    frame.pop();
                }
                return Ok(Some(frame));
            }
        }
    }

    /// Read and parse the next frame
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Frame<T>, ProtocolError> {
        match self.read_frame()? {
            None => Ok(Frame::EndOfStream),
            Some(bytes) => {
                trace!("received {}", String::from_utf8_lossy(&bytes));
                Ok(Frame::Item(serde_json::from_slice(&bytes)?))
            }
        }
    }
}

/// Writes values as newline-delimited frames
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Get a reference to the underlying writer
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Encode `value` as one frame and flush it to the stream
    pub fn write<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ProtocolError> {
        let bytes = encode(value)?;
        trace!("sending {}", String::from_utf8_lossy(&bytes[..bytes.len() - 1]));
        self.inner.write_all(&bytes)?;
        self.inner.flush()?;
        Ok(())
    }
}
