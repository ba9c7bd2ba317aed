//! Length-prefixed `DuplexChannel` binding over `tokio::net::TcpStream`.
//!
//! The session core assumes an ordered, length-preserving, reliable duplex
//! byte stream such as a WebSocket frame channel; a raw TCP socket has no
//! message boundaries of its own, so this adapter adds a 4-byte big-endian
//! length prefix per frame to recover them.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::Error;
use crate::session::{ChannelEvent, DuplexChannel};

const LENGTH_PREFIX_LEN: usize = 4;

/// A `DuplexChannel` over a length-prefixed `TcpStream`, the canonical
/// binding for `ClientSession`.
pub struct TcpDuplexChannel {
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
    max_frame_size: usize,
}

impl TcpDuplexChannel {
    pub fn new(stream: TcpStream, max_frame_size: usize) -> Self {
        let (read_half, write_half) = stream.into_split();
        TcpDuplexChannel {
            read_half,
            write_half,
            max_frame_size,
        }
    }
}

#[async_trait::async_trait]
impl DuplexChannel for TcpDuplexChannel {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), Error> {
        let len = bytes.len() as u32;
        self.write_half.write_all(&len.to_be_bytes()).await?;
        self.write_half.write_all(&bytes).await?;
        self.write_half.flush().await?;
        Ok(())
    }

    async fn close(&mut self, _code: u16, _reason: &str) -> Result<(), Error> {
        self.write_half.shutdown().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<ChannelEvent, Error> {
        let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
        match self.read_half.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(ChannelEvent::Closed(1006, "connection reset".to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > self.max_frame_size {
            return Ok(ChannelEvent::Closed(1009, "frame too large".to_string()));
        }
        let mut body = vec![0u8; len];
        self.read_half.read_exact(&mut body).await?;
        Ok(ChannelEvent::Frame(body))
    }
}

/// Read one length-prefixed frame directly off a read half, for callers
/// (such as the relay) that drive their own state machine rather than a
/// `ClientSession`. Returns `Ok(None)` on clean EOF.
pub async fn read_length_prefixed(
    read_half: &mut OwnedReadHalf,
    max_frame_size: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
    match read_half.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_size {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut body = vec![0u8; len];
    read_half.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write one length-prefixed frame to a write half.
pub async fn write_length_prefixed(write_half: &mut OwnedWriteHalf, bytes: &[u8]) -> std::io::Result<()> {
    write_half.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    write_half.write_all(bytes).await?;
    write_half.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn roundtrip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut channel = TcpDuplexChannel::new(stream, 1 << 20);
            channel.send(b"hello".to_vec()).await.unwrap();
        });

        let client_stream = TcpStream::connect(addr).await.unwrap();
        let mut client = TcpDuplexChannel::new(client_stream, 1 << 20);
        let event = client.recv().await.unwrap();
        match event {
            ChannelEvent::Frame(bytes) => assert_eq!(bytes, b"hello"),
            other => panic!("unexpected event: {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn oversize_frame_closes_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut channel = TcpDuplexChannel::new(stream, 10);
            channel.send(vec![0u8; 100]).await.unwrap();
        });

        let client_stream = TcpStream::connect(addr).await.unwrap();
        let mut client = TcpDuplexChannel::new(client_stream, 10);
        let event = client.recv().await.unwrap();
        assert!(matches!(event, ChannelEvent::Closed(1009, _)));
        server.await.unwrap();
    }
}
