//! The one collaborator interface this crate needs from a real framed
//! transport (a WebSocket binding or equivalent): read one whole binary
//! frame, write one whole binary frame, close.
//!
//! Idiomatic-Rust note: the wire-level interface this is modeled on returns
//! sentinel integers (-1 closing, -2 cancelled, -3 frame too large, -4
//! non-binary) rather than raising. We fold those into `Result<usize,
//! Error>` instead — `Error::TransportClosed` / `Error::ProtocolViolation`
//! carry the same information through the type system rather than a magic
//! number.

use crate::error::Error;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

#[async_trait]
pub trait FramedSocket: Send + Sync {
    /// Blocks until one whole binary frame is available, copies it into
    /// `buffer`, and returns its length. `Err(Error::TransportClosed)` on a
    /// normal remote close; `Err(Error::ProtocolViolation(_))` if the frame
    /// would not fit in `buffer` or was not a binary frame.
    async fn receive_frame(&self, buffer: &mut [u8]) -> Result<usize, Error>;

    /// Submits one binary frame. Per the collaborator contract this may
    /// fail silently — a failed send is observed on the next `receive_frame`
    /// as a close, not returned here.
    async fn send_frame(&self, buffer: &[u8]);

    /// Initiates close. Idempotent.
    async fn close(&self, reason: &str, wait_for_remote: bool);
}

/// An in-memory [`FramedSocket`] built on a `tokio::io::duplex` pipe, for
/// tests. The duplex pipe is a raw byte stream, so frames are delimited
/// with a 4-byte big-endian length prefix the two ends agree on privately —
/// this framing is internal to the test double and has nothing to do with
/// the wire protocol this crate implements on top of it.
pub struct DuplexFramedSocket<R, W> {
    read_half: Mutex<R>,
    write_half: Mutex<W>,
}

impl<R, W> DuplexFramedSocket<R, W>
where
    R: AsyncReadExt + Unpin + Send,
    W: AsyncWriteExt + Unpin + Send,
{
    pub fn new(read_half: R, write_half: W) -> Self {
        DuplexFramedSocket {
            read_half: Mutex::new(read_half),
            write_half: Mutex::new(write_half),
        }
    }
}

#[async_trait]
impl<R, W> FramedSocket for DuplexFramedSocket<R, W>
where
    R: AsyncReadExt + Unpin + Send,
    W: AsyncWriteExt + Unpin + Send,
{
    async fn receive_frame(&self, buffer: &mut [u8]) -> Result<usize, Error> {
        let mut read_half = self.read_half.lock().await;
        let mut len_prefix = [0u8; 4];
        if let Err(source) = read_half.read_exact(&mut len_prefix).await {
            if source.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(Error::TransportClosed);
            }
            return Err(Error::Io { source });
        }
        let len = u32::from_be_bytes(len_prefix) as usize;
        if len > buffer.len() {
            let mut sink = BytesMut::zeroed(len);
            read_half
                .read_exact(&mut sink)
                .await
                .map_err(|source| Error::Io { source })?;
            return Err(Error::ProtocolViolation(format!(
                "frame of {len} bytes exceeds the {}-byte staging buffer",
                buffer.len()
            )));
        }
        read_half
            .read_exact(&mut buffer[..len])
            .await
            .map_err(|source| Error::Io { source })?;
        Ok(len)
    }

    async fn send_frame(&self, buffer: &[u8]) {
        let mut write_half = self.write_half.lock().await;
        let len = (buffer.len() as u32).to_be_bytes();
        if write_half.write_all(&len).await.is_err() {
            return;
        }
        let _ = write_half.write_all(buffer).await;
    }

    async fn close(&self, _reason: &str, _wait_for_remote: bool) {
        let mut write_half = self.write_half.lock().await;
        let _ = write_half.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_frame_through_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let client_socket = DuplexFramedSocket::new(client_read, client_write);
        let server_socket = DuplexFramedSocket::new(server_read, server_write);

        client_socket.send_frame(b"hello").await;
        let mut buffer = [0u8; 1088];
        let len = server_socket.receive_frame(&mut buffer).await.unwrap();
        assert_eq!(&buffer[..len], b"hello");
    }

    #[tokio::test]
    async fn a_frame_larger_than_the_buffer_is_a_protocol_violation() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let client_socket = DuplexFramedSocket::new(client_read, client_write);
        let server_socket = DuplexFramedSocket::new(server_read, server_write);

        client_socket.send_frame(&[0u8; 16]).await;
        let mut buffer = [0u8; 8];
        let result = server_socket.receive_frame(&mut buffer).await;
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn closing_the_write_half_surfaces_as_transport_closed() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let client_socket = DuplexFramedSocket::new(client_read, client_write);
        let server_socket = DuplexFramedSocket::new(server_read, server_write);

        client_socket.close("done", false).await;
        let mut buffer = [0u8; 1088];
        let result = server_socket.receive_frame(&mut buffer).await;
        assert!(matches!(result, Err(Error::TransportClosed)));
    }
}
