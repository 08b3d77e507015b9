//! The `Transport` external interface (spec §6 item 7) and its default
//! TCP implementation (component C7).
//!
//! The core only ever references `Dial`/`Listen`/`Accept` on a
//! `MessageConn`; callers may plug in other transports (WS, WSH, ...)
//! by implementing [`Transport`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{CoreError, Result};

const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// A single bidirectional, message-framed connection, as returned by
/// `Dial` or `Accept`.
#[async_trait]
pub trait MessageConn: Send + Sync {
    /// Sends one length-prefixed message.
    async fn send(&self, bytes: &[u8]) -> Result<()>;

    /// Receives the next length-prefixed message, or `Ok(None)` on a
    /// clean peer-initiated close.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// The peer's address as reported by the transport.
    fn peer_addr(&self) -> &str;

    /// This end's local address.
    fn local_addr(&self) -> &str;
}

/// A bound listener accepting incoming [`MessageConn`]s.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Blocks until a peer dials in.
    async fn accept(&self) -> Result<Box<dyn MessageConn>>;

    /// The address this listener is bound to.
    fn local_addr(&self) -> String;
}

/// Dialer/listener factory, keyed by protocol name.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establishes an outbound connection to `address`, failing with
    /// [`CoreError::Timeout`] if `timeout` elapses first.
    async fn dial(
        &self,
        protocol: &str,
        address: &str,
        timeout: Duration,
    ) -> Result<Box<dyn MessageConn>>;

    /// Binds a listener for `protocol` at `address`.
    async fn listen(&self, protocol: &str, address: &str) -> Result<Box<dyn Listener>>;
}

async fn write_message(write: &AsyncMutex<OwnedWriteHalf>, bytes: &[u8]) -> Result<()> {
    if bytes.len() as u64 > MAX_MESSAGE_SIZE as u64 {
        return Err(CoreError::BadProtocol(format!(
            "message too large: {} bytes (max {MAX_MESSAGE_SIZE})",
            bytes.len()
        )));
    }
    let mut w = write.lock().await;
    w.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    w.write_all(bytes).await?;
    w.flush().await?;
    Ok(())
}

async fn read_message(read: &AsyncMutex<OwnedReadHalf>) -> Result<Option<Vec<u8>>> {
    let mut r = read.lock().await;
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(CoreError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_SIZE {
        return Err(CoreError::BadProtocol(format!(
            "peer announced message of {len} bytes (max {MAX_MESSAGE_SIZE})"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// TCP [`MessageConn`], a thin length-prefix framing over a `TcpStream`.
pub struct TcpMessageConn {
    read: AsyncMutex<OwnedReadHalf>,
    write: AsyncMutex<OwnedWriteHalf>,
    peer_addr: String,
    local_addr: String,
}

impl TcpMessageConn {
    fn from_stream(stream: TcpStream) -> Result<Self> {
        let peer_addr = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        let local_addr = stream.local_addr().map(|a| a.to_string()).unwrap_or_default();
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(TcpMessageConn {
            read: AsyncMutex::new(read),
            write: AsyncMutex::new(write),
            peer_addr,
            local_addr,
        })
    }
}

#[async_trait]
impl MessageConn for TcpMessageConn {
    async fn send(&self, bytes: &[u8]) -> Result<()> {
        write_message(&self.write, bytes).await
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        read_message(&self.read).await
    }

    fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    fn local_addr(&self) -> &str {
        &self.local_addr
    }
}

/// TCP [`Listener`].
pub struct TcpListenerHandle {
    inner: TokioTcpListener,
    local_addr: String,
}

#[async_trait]
impl Listener for TcpListenerHandle {
    async fn accept(&self) -> Result<Box<dyn MessageConn>> {
        let (stream, _) = self.inner.accept().await?;
        Ok(Box::new(TcpMessageConn::from_stream(stream)?))
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }
}

/// Default TCP [`Transport`] (component C7). Test/demo-grade: no TLS,
/// no retry inside dial itself (retry lives in the client's call state
/// machine, per the backoff policy in `retry.rs`).
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    /// Builds a new TCP transport.
    pub fn new() -> Self {
        TcpTransport
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(
        &self,
        protocol: &str,
        address: &str,
        timeout: Duration,
    ) -> Result<Box<dyn MessageConn>> {
        if protocol != "tcp" {
            return Err(CoreError::BadProtocol(format!(
                "TcpTransport cannot dial protocol {protocol:?}"
            )));
        }
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| CoreError::Timeout(timeout))??;
        tracing::debug!(address, "tcp dial succeeded");
        Ok(Box::new(TcpMessageConn::from_stream(stream)?))
    }

    async fn listen(&self, protocol: &str, address: &str) -> Result<Box<dyn Listener>> {
        if protocol != "tcp" {
            return Err(CoreError::BadProtocol(format!(
                "TcpTransport cannot listen on protocol {protocol:?}"
            )));
        }
        let inner = TokioTcpListener::bind(address).await?;
        let local_addr = inner.local_addr()?.to_string();
        tracing::debug!(address = %local_addr, "tcp listening");
        Ok(Box::new(TcpListenerHandle { inner, local_addr }))
    }
}
