//! Framed TCP connection endpoint, shared by the hub and the peer client.
//!
//! A [`Connection`] wraps one established stream with a single reader and a
//! mutex-serialized writer, so frames from concurrent producers never
//! interleave on the wire. Each endpoint carries a cancellation token; any
//! I/O failure trips it and the endpoint is considered dead.

use std::io;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use courier_proto::{FrameError, MAX_FRAME_LEN, Message};

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("connection closed")]
    Closed,
    #[error("frame length {0} outside (0, {MAX_FRAME_LEN}]")]
    FrameLength(u32),
    #[error("malformed frame: {0}")]
    Malformed(#[from] FrameError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One duplex peer link. Cheap to share behind an `Arc`; `send` may be
/// called from any task, `recv` from exactly one reader task.
pub struct Connection {
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        Self::with_cancel(stream, CancellationToken::new())
    }

    /// Builds an endpoint whose lifetime is tied to `cancel`; the hub hands
    /// each connection a child of its shutdown token.
    pub fn with_cancel(stream: TcpStream, cancel: CancellationToken) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(write_half),
            cancel,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Serializes and emits one frame. The length prefix and body are
    /// written and flushed under the writer mutex, so no other frame can
    /// begin in between. On any failure the endpoint is marked dead.
    pub async fn send(&self, msg: &Message) -> Result<(), NetError> {
        if self.cancel.is_cancelled() {
            return Err(NetError::Closed);
        }
        let payload = courier_proto::encode(msg);
        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_u32_le(payload.len() as u32);
        frame.put_slice(&payload);

        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
            res = write => res,
        };
        if let Err(e) = result {
            self.cancel.cancel();
            return Err(e.into());
        }
        Ok(())
    }

    /// Returns the next decoded message, or `None` on orderly close
    /// (peer EOF or local cancellation). Framing errors and mid-frame EOF
    /// are fatal: the token is tripped before the error is returned.
    pub async fn recv(&self) -> Result<Option<Message>, NetError> {
        let mut reader = self.reader.lock().await;
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(None),
            res = Self::read_frame(&mut reader) => res,
        };
        match result {
            Ok(msg) => Ok(msg),
            Err(e) => {
                self.cancel.cancel();
                Err(e)
            }
        }
    }

    async fn read_frame(
        reader: &mut BufReader<OwnedReadHalf>,
    ) -> Result<Option<Message>, NetError> {
        let len = match reader.read_u32_le().await {
            Ok(len) => len,
            // EOF between frames is an orderly close.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len == 0 || len as usize > MAX_FRAME_LEN {
            return Err(NetError::FrameLength(len));
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await?;
        let msg = courier_proto::decode(&payload)?;
        debug!(kind = msg.kind_name(), len, "frame in");
        Ok(Some(msg))
    }

    /// Idempotent. Trips the token, releasing any blocked reads or writes.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
