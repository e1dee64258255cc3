//! Command/result protocol between the cache manager and the cache worker.
//!
//! Two one-directional FIFO queues. In-process they are `mpsc` channels; across
//! the process boundary each message travels as a versioned frame:
//!
//! ```text
//!   [version: u8][len: u32 LE][bincode payload: len bytes]
//! ```
//!
//! Receiving is always done from an `mpsc::Receiver`. For pipes, a reader
//! thread ([`spawn_frame_pump`]) decodes frames and forwards them, so both the
//! worker's idle wait and the manager's non-blocking drain stay plain channel
//! operations.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use log::{debug, error};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound on a single frame payload. Messages carry segment names, not
/// image bytes, so anything near this is garbage.
pub const MAX_FRAME_LEN: usize = 1 << 20;

const HEADER_LEN: usize = 5;

/// What a result refers to: a table index or the fixed logo asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slot {
    Table(usize),
    Logo,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Table(i) => write!(f, "{i}"),
            Slot::Logo => f.write_str("logo"),
        }
    }
}

/// Manager → worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    LoadIndex(usize),
    LoadNext(usize),
    LoadPrevious(usize),
    LoadLogo,
    Quit,
}

/// Worker → manager. Every result names its own slot; arrival order says
/// nothing about which request it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerResult {
    Ready {
        slot: Slot,
        segment: String,
        length: usize,
    },
    Failed {
        message: String,
    },
}

/// `(current + 1) % count`, or `None` when the list is empty.
pub fn wrap_next(current: usize, count: usize) -> Option<usize> {
    (count > 0).then(|| (current % count + 1) % count)
}

/// `(current - 1 + count) % count`, or `None` when the list is empty.
pub fn wrap_previous(current: usize, count: usize) -> Option<usize> {
    (count > 0).then(|| (current % count + count - 1) % count)
}

// ---------------------------------------------------------------------------
// Sink: the sending half, shared by mpsc and framed pipes
// ---------------------------------------------------------------------------

/// Sending half of a message queue.
pub trait Sink<T> {
    fn send(&mut self, msg: T) -> Result<(), ChannelError>;
}

impl<T> Sink<T> for mpsc::Sender<T> {
    fn send(&mut self, msg: T) -> Result<(), ChannelError> {
        mpsc::Sender::send(self, msg).map_err(|_| ChannelError::Closed)
    }
}

// ---------------------------------------------------------------------------
// Frame codec
// ---------------------------------------------------------------------------

/// Payload encoding. The limit bounds every allocation bincode makes while
/// decoding, so a forged length prefix inside a payload cannot reserve more
/// than a frame could ever hold.
fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_FRAME_LEN>()
}

/// Encode one message as a complete frame.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, ChannelError> {
    let payload = bincode::serde::encode_to_vec(msg, wire_config())?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ChannelError::FrameTooLarge {
            len: payload.len(),
            limit: MAX_FRAME_LEN,
        });
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(PROTOCOL_VERSION);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete frame, otherwise
/// the message and the number of bytes consumed.
pub fn decode_frame<T: DeserializeOwned>(buf: &[u8]) -> Result<Option<(T, usize)>, ChannelError> {
    let Some(len) = parse_header(buf)? else {
        return Ok(None);
    };
    let Some(payload) = buf.get(HEADER_LEN..HEADER_LEN + len) else {
        return Ok(None);
    };
    let msg = decode_payload(payload)?;
    Ok(Some((msg, HEADER_LEN + len)))
}

fn parse_header(buf: &[u8]) -> Result<Option<usize>, ChannelError> {
    let Some(header) = buf.get(..HEADER_LEN) else {
        return Ok(None);
    };
    if header[0] != PROTOCOL_VERSION {
        return Err(ChannelError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            got: header[0],
        });
    }
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ChannelError::FrameTooLarge {
            len,
            limit: MAX_FRAME_LEN,
        });
    }
    Ok(Some(len))
}

fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ChannelError> {
    let (msg, used) = bincode::serde::decode_from_slice(payload, wire_config())?;
    if used != payload.len() {
        return Err(ChannelError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} trailing bytes in frame", payload.len() - used),
        )));
    }
    Ok(msg)
}

/// Writes frames to a byte stream (typically a pipe).
pub struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<T: Serialize, W: Write> Sink<T> for FrameWriter<W> {
    fn send(&mut self, msg: T) -> Result<(), ChannelError> {
        let frame = encode_frame(&msg)?;
        match self.inner.write_all(&frame).and_then(|()| self.inner.flush()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Err(ChannelError::Closed),
            Err(e) => Err(e.into()),
        }
    }
}

/// Reads frames from a byte stream.
pub struct FrameReader<R: Read> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Blocking read of the next message. `Ok(None)` on clean end of stream.
    pub fn read_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ChannelError> {
        let mut header = [0u8; HEADER_LEN];
        if !self.fill_or_eof(&mut header)? {
            return Ok(None);
        }
        let Some(len) = parse_header(&header)? else {
            return Ok(None);
        };
        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload)?;
        decode_payload(&payload).map(Some)
    }

    /// Fill `buf` completely. Returns `false` if the stream ends before the
    /// first byte; a stream ending mid-buffer is an error.
    fn fill_or_eof(&mut self, buf: &mut [u8]) -> Result<bool, ChannelError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

/// Spawn a thread that decodes frames from `reader` and forwards them to an
/// `mpsc` channel. The channel disconnects when the stream ends or a frame is
/// malformed.
pub fn spawn_frame_pump<T, R>(name: &str, reader: R) -> io::Result<(mpsc::Receiver<T>, JoinHandle<()>)>
where
    T: DeserializeOwned + Send + 'static,
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let label = name.to_string();
    let handle = thread::Builder::new().name(label.clone()).spawn(move || {
        let mut frames = FrameReader::new(reader);
        loop {
            match frames.read_frame::<T>() {
                Ok(Some(msg)) => {
                    if tx.send(msg).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("{label}: end of stream");
                    break;
                }
                Err(e) => {
                    error!("{label}: dropping channel after bad frame: {e}");
                    break;
                }
            }
        }
    })?;
    Ok((rx, handle))
}
