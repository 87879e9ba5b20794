// ABOUTME: russh-backed Transport implementation.
// ABOUTME: Dials TCP, runs SSH over any duplex stream, authenticates, opens direct-tcpip channels.

use super::error::BoxError;
use super::host::{AddressFamily, join_host_port};
use super::transport::{BoxStream, Connection, HandshakeParams, Transport};
use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::keys::known_hosts::{
    check_known_hosts, check_known_hosts_path, learn_known_hosts, learn_known_hosts_path,
};
use russh::keys::{PrivateKeyWithHashAlg, ssh_key};
use russh::Disconnect;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;

/// How server host keys are verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any host key.
    AcceptAny,
    /// Verify against a known_hosts file.
    KnownHosts {
        /// Accept and record hosts that are not in the file yet.
        trust_on_first_use: bool,
        /// If None, uses the default ~/.ssh/known_hosts.
        path: Option<PathBuf>,
    },
}

/// Settings shared by every connection a transport opens.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub keepalive_interval: Option<Duration>,
    pub keepalive_max: usize,
    pub inactivity_timeout: Option<Duration>,
    pub host_key_policy: HostKeyPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            inactivity_timeout: None,
            host_key_policy: HostKeyPolicy::AcceptAny,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn keepalive_max(mut self, max: usize) -> Self {
        self.keepalive_max = max;
        self
    }

    pub fn inactivity_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key_policy = policy;
        self
    }

    fn russh_config(&self) -> Config {
        Config {
            inactivity_timeout: self.inactivity_timeout,
            keepalive_interval: self.keepalive_interval,
            keepalive_max: self.keepalive_max,
            ..Default::default()
        }
    }
}

/// Handshake failures that are not protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("server rejected all {tried} credential(s) for user {user}")]
    Rejected { user: String, tried: usize },
}

/// SSH client handler for russh.
///
/// Dropped by russh when the connection task ends, which closes the
/// `closed` channel and wakes anyone waiting in `Connection::closed`.
pub(crate) struct SshHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    _closed: watch::Sender<()>,
}

impl SshHandler {
    fn new(host: String, port: u16, policy: HostKeyPolicy, closed: watch::Sender<()>) -> Self {
        Self {
            host,
            port,
            policy,
            _closed: closed,
        }
    }
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let (trust_on_first_use, known_hosts_path) = match &self.policy {
            HostKeyPolicy::AcceptAny => return Ok(true),
            HostKeyPolicy::KnownHosts {
                trust_on_first_use,
                path,
            } => (*trust_on_first_use, path),
        };

        let check_result = match known_hosts_path {
            Some(path) => check_known_hosts_path(&self.host, self.port, server_public_key, path),
            None => check_known_hosts(&self.host, self.port, server_public_key),
        };

        match check_result {
            Ok(true) => Ok(true),
            Ok(false) if trust_on_first_use => {
                tracing::warn!(
                    "Trust-On-First-Use: accepting unknown host key for {}:{}",
                    self.host,
                    self.port
                );
                let learn_result = match known_hosts_path {
                    Some(path) => {
                        learn_known_hosts_path(&self.host, self.port, server_public_key, path)
                    }
                    None => learn_known_hosts(&self.host, self.port, server_public_key),
                };
                if let Err(e) = learn_result {
                    tracing::warn!("Failed to save host key to known_hosts: {}", e);
                }
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(russh::keys::Error::KeyChanged { .. }) => {
                tracing::warn!("Host key for {}:{} has changed", self.host, self.port);
                Ok(false)
            }
            Err(_) => Ok(trust_on_first_use),
        }
    }
}

/// Transport that speaks SSH through russh.
#[derive(Debug, Clone, Default)]
pub struct RusshTransport {
    config: TransportConfig,
}

impl RusshTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for RusshTransport {
    async fn dial(
        &self,
        host: &str,
        port: u16,
        family: AddressFamily,
    ) -> Result<BoxStream, BoxError> {
        let candidates: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await?
            .filter(|addr| family.allows(addr))
            .collect();

        let mut last_err = std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("no {:?} address found for {}", family, join_host_port(host, port)),
        );

        for addr in candidates {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(Box::new(stream));
                }
                Err(e) => {
                    tracing::debug!("Connect to {} failed: {}", addr, e);
                    last_err = e;
                }
            }
        }

        Err(last_err.into())
    }

    async fn handshake(
        &self,
        stream: BoxStream,
        params: &HandshakeParams,
    ) -> Result<Box<dyn Connection>, BoxError> {
        let (closed_tx, closed_rx) = watch::channel(());
        let handler = SshHandler::new(
            params.host.clone(),
            params.port,
            self.config.host_key_policy.clone(),
            closed_tx,
        );

        let mut handle =
            client::connect_stream(Arc::new(self.config.russh_config()), stream, handler).await?;

        if !authenticate(&mut handle, params).await? {
            let _ = handle.disconnect(Disconnect::ByApplication, "", "en").await;
            return Err(AuthError::Rejected {
                user: params.user.clone(),
                tried: params.credentials.len(),
            }
            .into());
        }

        Ok(Box::new(RusshConnection {
            handle,
            closed: closed_rx,
        }))
    }
}

/// Offer each credential in order until one is accepted.
async fn authenticate(
    handle: &mut Handle<SshHandler>,
    params: &HandshakeParams,
) -> Result<bool, russh::Error> {
    if params.credentials.is_empty() {
        let result = handle.authenticate_none(&params.user).await?;
        return Ok(result.success());
    }

    let hash_alg = handle.best_supported_rsa_hash().await?.flatten();

    for credential in &params.credentials {
        let result = handle
            .authenticate_publickey(
                &params.user,
                PrivateKeyWithHashAlg::new(Arc::clone(credential.key()), hash_alg),
            )
            .await?;
        if result.success() {
            tracing::debug!(
                "Authenticated {}@{}:{} with {}",
                params.user,
                params.host,
                params.port,
                credential.path().display()
            );
            return Ok(true);
        }
        tracing::debug!(
            "Key {} rejected for {}@{}",
            credential.path().display(),
            params.user,
            params.host
        );
    }

    Ok(false)
}

/// An authenticated russh connection.
struct RusshConnection {
    handle: Handle<SshHandler>,
    closed: watch::Receiver<()>,
}

#[async_trait]
impl Connection for RusshConnection {
    async fn open_channel(&self, host: &str, port: u16) -> Result<BoxStream, BoxError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) -> Result<(), BoxError> {
        if self.handle.is_closed() {
            return Ok(());
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        while closed.changed().await.is_ok() {}
    }
}
