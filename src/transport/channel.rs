//! Framed byte channels that stand in for a physical radio link. The
//! transport state machine runs the same over an in-process pair or a TCP
//! stream.
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Frames larger than this are treated as a protocol violation.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// A bidirectional, frame-oriented byte channel.
#[async_trait]
pub trait Channel: Send {
    async fn send_frame(&mut self, frame: &[u8]) -> std::io::Result<()>;

    /// Receive the next frame; `None` once the peer has hung up.
    async fn recv_frame(&mut self) -> std::io::Result<Option<Vec<u8>>>;

    async fn shutdown(&mut self) -> std::io::Result<()>;
}

/// A TCP stream carrying 4-byte big-endian length-prefixed frames.
pub struct TcpChannel {
    stream: TcpStream,
}

impl TcpChannel {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn send_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        let len = u32::try_from(frame.len()).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large")
        })?;
        self.stream.write_all(&len.to_be_bytes()).await?;
        self.stream.write_all(frame).await?;
        self.stream.flush().await
    }

    async fn recv_frame(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let mut len_bytes = [0u8; 4];
        match self.stream.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame exceeds maximum length",
            ));
        }
        let mut frame = vec![0u8; len];
        self.stream.read_exact(&mut frame).await?;
        Ok(Some(frame))
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }
}

/// One end of an in-process channel pair.
pub struct MemoryChannel {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

/// A connected pair of in-process channels.
pub fn memory_pair() -> (MemoryChannel, MemoryChannel) {
    let (tx_a, rx_b) = mpsc::channel(32);
    let (tx_b, rx_a) = mpsc::channel(32);
    (
        MemoryChannel {
            tx: Some(tx_a),
            rx: rx_a,
        },
        MemoryChannel {
            tx: Some(tx_b),
            rx: rx_b,
        },
    )
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn send_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        let tx = self.tx.as_ref().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "channel is shut down")
        })?;
        tx.send(frame.to_vec()).await.map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer is gone")
        })
    }

    async fn recv_frame(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        self.tx = None;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn memory_pair_roundtrip() {
        let (mut a, mut b) = memory_pair();
        a.send_frame(b"ping").await.unwrap();
        assert_eq!(b.recv_frame().await.unwrap().unwrap(), b"ping");
        b.send_frame(b"pong").await.unwrap();
        assert_eq!(a.recv_frame().await.unwrap().unwrap(), b"pong");
    }

    #[tokio::test]
    async fn shutdown_surfaces_as_eof() {
        let (mut a, mut b) = memory_pair();
        a.shutdown().await.unwrap();
        drop(a);
        assert!(b.recv_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tcp_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut channel = TcpChannel::new(stream);
            let frame = channel.recv_frame().await.unwrap().unwrap();
            channel.send_frame(&frame).await.unwrap();
        });
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut channel = TcpChannel::new(stream);
        channel.send_frame(b"echo").await.unwrap();
        assert_eq!(channel.recv_frame().await.unwrap().unwrap(), b"echo");
        server.await.unwrap();
    }
}
