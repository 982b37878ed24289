//! Wire framing for the push server: an 8-byte little-endian header
//! (`u32` command, `u32` payload length) followed by the payload.

use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: usize = 8;
/// Local cap on a received payload. The header allows any `u32` length;
/// larger frames are drained and reported as `FrameTooLarge` instead of
/// being buffered.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Heartbeat,
    Register,
    Token,
    Push,
    /// Accepted on receipt, never sent.
    Unknown(u32),
}

impl Command {
    pub fn code(self) -> u32 {
        match self {
            Self::Heartbeat => 0,
            Self::Register => 1,
            Self::Token => 2,
            Self::Push => 3,
            Self::Unknown(code) => code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Heartbeat,
            1 => Self::Register,
            2 => Self::Token,
            3 => Self::Push,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Heartbeat => f.write_str("HEARTBEAT"),
            Self::Register => f.write_str("REGISTER"),
            Self::Token => f.write_str("TOKEN"),
            Self::Push => f.write_str("PUSH"),
            Self::Unknown(code) => write!(f, "UNKNOWN({code})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub enum ProtocolError {
    MalformedHeader { available: usize },
    FrameTooLarge { command: Command, length: usize },
    ConnectionClosed,
    Io(io::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedHeader { available } => {
                write!(f, "malformed header: need {HEADER_LEN} bytes, got {available}")
            }
            Self::FrameTooLarge { command, length } => {
                write!(f, "frame too large: {command} with {length} byte payload")
            }
            Self::ConnectionClosed => f.write_str("connection closed by peer"),
            Self::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Builds `header + payload`. Only payloads whose length does not fit in a
/// `u32` are rejected.
pub fn encode(command: Command, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let length = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
        command,
        length: payload.len(),
    })?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&command.code().to_le_bytes());
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn decode_header(bytes: &[u8]) -> Result<(Command, u32), ProtocolError> {
    if bytes.len() < HEADER_LEN {
        return Err(ProtocolError::MalformedHeader {
            available: bytes.len(),
        });
    }
    let command = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let length = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    Ok((Command::from_code(command), length))
}

pub async fn write_frame<W>(writer: &mut W, command: Command, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode(command, payload)?;
    writer.write_all(&bytes).await.map_err(ProtocolError::Io)?;
    writer.flush().await.map_err(ProtocolError::Io)
}

/// Buffered frame reader.
///
/// Bytes are moved into the reader's own buffer as soon as the transport
/// yields them, so dropping a pending `next_frame` / `read_exact` future (for
/// example when a read timeout fires) never loses stream position. The next
/// call resumes where the previous one stopped.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    discard: usize,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            discard: 0,
        }
    }

    /// Returns exactly `n` bytes, or `ConnectionClosed` if the stream ends
    /// first. A partial buffer is never returned.
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, ProtocolError> {
        self.skip_discarded().await?;
        self.fill(n).await?;
        Ok(self.buf.drain(..n).collect())
    }

    /// Reads the next complete frame. Oversized frames are drained from the
    /// stream and reported as `FrameTooLarge`; the reader stays aligned on the
    /// following header.
    pub async fn next_frame(&mut self) -> Result<Frame, ProtocolError> {
        self.skip_discarded().await?;
        self.fill(HEADER_LEN).await?;
        let (command, length) = decode_header(&self.buf[..HEADER_LEN])?;
        let length = length as usize;

        if length > MAX_FRAME_SIZE {
            self.buf.drain(..HEADER_LEN);
            let buffered = self.buf.len().min(length);
            self.buf.drain(..buffered);
            self.discard = length - buffered;
            return Err(ProtocolError::FrameTooLarge { command, length });
        }

        // Buffer the whole frame first; the reads below then never wait.
        self.fill(HEADER_LEN + length).await?;
        self.read_exact(HEADER_LEN).await?;
        let payload = self.read_exact(length).await?;
        Ok(Frame { command, payload })
    }

    async fn fill(&mut self, n: usize) -> Result<(), ProtocolError> {
        let mut chunk = [0u8; READ_CHUNK];
        while self.buf.len() < n {
            let read = self.inner.read(&mut chunk).await.map_err(ProtocolError::Io)?;
            if read == 0 {
                return Err(ProtocolError::ConnectionClosed);
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
        Ok(())
    }

    async fn skip_discarded(&mut self) -> Result<(), ProtocolError> {
        let mut chunk = [0u8; READ_CHUNK];
        while self.discard > 0 {
            let want = self.discard.min(READ_CHUNK);
            let read = self
                .inner
                .read(&mut chunk[..want])
                .await
                .map_err(ProtocolError::Io)?;
            if read == 0 {
                return Err(ProtocolError::ConnectionClosed);
            }
            self.discard -= read;
        }
        Ok(())
    }
}
