use futures::StreamExt;
use std::io;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;
use tracing::warn;
use uuid::Uuid;

use crate::codec::{CodecError, FrameCodec};
use crate::frame::Frame;
use crate::memory::MemoryMonitor;
use crate::reply_guard::ReplyGuard;

/// A client connection. Frames are decoded from the read half by [`FrameCodec`], replies are
/// encoded through a [`ReplyGuard`] so their buffers count against the memory budget.
pub struct Connection {
    pub id: Uuid,
    client_address: Option<SocketAddr>,
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: OwnedWriteHalf,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Connection {
        Connection::with_codec(stream, FrameCodec::default())
    }

    pub fn with_codec(stream: TcpStream, codec: FrameCodec) -> Connection {
        let client_address = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();

        Connection {
            id: Uuid::new_v4(),
            client_address,
            reader: FramedRead::new(reader, codec),
            writer,
        }
    }

    pub fn client_address(&self) -> Option<SocketAddr> {
        self.client_address
    }

    /// Returns `None` once the peer closed the connection.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        self.reader.next().await.transpose()
    }

    pub async fn write_frame(&mut self, frame: &Frame, memory: &MemoryMonitor) -> io::Result<()> {
        match ReplyGuard::reserve(memory, frame.encoded_len()) {
            Ok(mut guard) => {
                let bytes = guard.encode(frame);
                self.writer.write_all(bytes).await
            }
            Err(err) => {
                warn!(
                    connection_id = %self.id,
                    reply_bytes = frame.encoded_len(),
                    "Reply refused under memory pressure"
                );
                self.writer.write_all(&err.to_frame().serialize()).await
            }
        }
    }
}
