use async_trait::async_trait;
use std::{net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, info};

use crate::{
    error::{JebaoError, Result},
    protocol::{FrameDecoder, Packet},
};

const READ_CHUNK: usize = 1024;

/// Packet-level connection to a pump
#[async_trait]
pub trait Transport: Send {
    /// Send one packet
    async fn send(&mut self, packet: &Packet) -> Result<()>;

    /// Wait for the next packet from the device
    async fn receive(&mut self, timeout_ms: u64) -> Result<Packet>;

    /// Close the connection
    async fn close(&mut self) -> Result<()>;

    /// Whether the connection is still usable
    fn is_open(&self) -> bool;
}

/// Opens transports to a pump's control port
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `addr` within `timeout_ms`
    async fn connect(&self, addr: SocketAddr, timeout_ms: u64) -> Result<Box<dyn Transport>>;
}

/// Connector for the pump's TCP control server
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: SocketAddr, timeout_ms: u64) -> Result<Box<dyn Transport>> {
        info!("Connecting to pump at {}", addr);

        let stream = timeout(Duration::from_millis(timeout_ms), TcpStream::connect(addr))
            .await
            .map_err(|_| JebaoError::Timeout { timeout_ms })?
            .map_err(|e| JebaoError::ConnectionFailed(format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;

        info!("TCP connection established to {}", addr);
        Ok(Box::new(TcpTransport::new(stream)))
    }
}

/// Transport over any async byte stream
pub struct StreamTransport<S> {
    stream: S,
    decoder: FrameDecoder,
    open: bool,
}

/// Transport over a TCP connection
pub type TcpTransport = StreamTransport<TcpStream>;

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a connected stream
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
            open: true,
        }
    }

    async fn read_packet(&mut self) -> Result<Packet> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(packet) = self.decoder.next_packet() {
                debug!("Received {:?} ({} byte payload)", packet.command, packet.payload.len());
                return Ok(packet);
            }

            let n = self.stream.read(&mut chunk).await.inspect_err(|_| {
                self.open = false;
            })?;
            if n == 0 {
                self.open = false;
                return Err(JebaoError::Disconnected);
            }
            self.decoder.push(&chunk[..n]);
        }
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, packet: &Packet) -> Result<()> {
        if !self.open {
            return Err(JebaoError::Disconnected);
        }

        let data = packet.to_bytes()?;
        debug!("Sending {:?}: {:02X?}", packet.command, &data[..]);

        if let Err(e) = self.stream.write_all(&data).await {
            self.open = false;
            return Err(e.into());
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn receive(&mut self, timeout_ms: u64) -> Result<Packet> {
        if !self.open {
            return Err(JebaoError::Disconnected);
        }

        timeout(Duration::from_millis(timeout_ms), self.read_packet())
            .await
            .map_err(|_| JebaoError::Timeout { timeout_ms })?
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.stream.shutdown().await?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
