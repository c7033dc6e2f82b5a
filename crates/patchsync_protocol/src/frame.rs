//! Length-prefixed framing over tokio byte streams.

use crate::error::{ChannelError, ProtocolError, ProtocolResult, TransportError};
use crate::messages::Message;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Largest accepted frame body (64 MiB).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Encodes `message` as one frame: big-endian `u32` length, then CBOR.
pub fn encode_frame(message: &Message) -> ProtocolResult<Vec<u8>> {
    let body = message.encode()?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Reads framed messages from a stream.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wraps a stream.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads the next message.
    ///
    /// Returns `Ok(None)` when the peer closes the stream on a frame
    /// boundary. End of stream inside a frame is `ConnectionClosed`.
    ///
    /// Not cancel-safe: dropping the future mid-frame loses the partial
    /// frame. Callers that race reads against timers should read from a
    /// dedicated task.
    pub async fn next(&mut self) -> Result<Option<Message>, ChannelError> {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = self.inner.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(TransportError::ConnectionClosed.into());
            }
            filled += n;
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(len).into());
        }

        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body).await.map_err(eof_to_closed)?;
        Ok(Some(Message::decode(&body)?))
    }

    /// Returns the wrapped stream.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Inbound messages read by a background task.
///
/// [`FrameReader::next`] is not cancel-safe, so loops that `select!` over
/// inbound traffic and timers read through an `Inbox` instead: a spawned
/// task owns the reader and forwards each result over a channel, and
/// [`Inbox::recv`] is cancel-safe. The task stops after the first error or
/// end of stream, and is aborted when the inbox is dropped.
pub struct Inbox {
    rx: mpsc::Receiver<Result<Option<Message>, ChannelError>>,
    task: JoinHandle<()>,
}

impl Inbox {
    /// Spawns a reader task over `reader`, buffering up to `capacity`
    /// messages.
    pub fn spawn<R>(reader: R, capacity: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(async move {
            let mut frames = FrameReader::new(reader);
            loop {
                let next = frames.next().await;
                let done = !matches!(next, Ok(Some(_)));
                if tx.send(next).await.is_err() || done {
                    break;
                }
            }
        });
        Self { rx, task }
    }

    /// Receives the next message; `Ok(None)` once the stream has ended.
    pub async fn recv(&mut self) -> Result<Option<Message>, ChannelError> {
        match self.rx.recv().await {
            Some(next) => next,
            None => Ok(None),
        }
    }
}

impl Drop for Inbox {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Writes framed messages to a stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wraps a stream.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes and flushes one message.
    pub async fn send(&mut self, message: &Message) -> Result<(), ChannelError> {
        let frame = encode_frame(message)?;
        self.inner.write_all(&frame).await.map_err(eof_to_closed)?;
        self.inner.flush().await.map_err(eof_to_closed)?;
        Ok(())
    }

    /// Shuts down the write half.
    pub async fn shutdown(&mut self) -> Result<(), ChannelError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    /// Returns the wrapped stream.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

fn eof_to_closed(err: io::Error) -> ChannelError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
            TransportError::ConnectionClosed.into()
        }
        _ => TransportError::Io(err).into(),
    }
}
