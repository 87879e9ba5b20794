// ABOUTME: Secure transport capability traits used by the connection builder and forwarder.
// ABOUTME: Separates raw dialing, the SSH handshake, and per-connection channel operations.

use super::error::BoxError;
use super::host::AddressFamily;
use super::keys::Credential;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A raw duplex byte stream: a TCP socket or a channel inside another connection.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxStream = Box<dyn DuplexStream>;

/// Everything the handshake needs to authenticate one hop.
#[derive(Debug, Clone)]
pub struct HandshakeParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Tried in order until the server accepts one.
    pub credentials: Vec<Credential>,
}

/// Opens raw streams and runs the SSH handshake over them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect a raw stream directly over the network.
    async fn dial(
        &self,
        host: &str,
        port: u16,
        family: AddressFamily,
    ) -> Result<BoxStream, BoxError>;

    /// Perform the SSH handshake and authentication over `stream`.
    async fn handshake(
        &self,
        stream: BoxStream,
        params: &HandshakeParams,
    ) -> Result<Box<dyn Connection>, BoxError>;
}

/// An authenticated connection.
///
/// `open_channel` must be safe to call concurrently from many tasks.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a logical channel to `host:port` through this connection.
    async fn open_channel(&self, host: &str, port: u16) -> Result<BoxStream, BoxError>;

    /// Close the connection.
    async fn close(&self) -> Result<(), BoxError>;

    /// Resolves once the underlying connection has ended, for any reason.
    async fn closed(&self);
}
