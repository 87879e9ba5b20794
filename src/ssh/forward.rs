// ABOUTME: Local TCP port forwarding through an authenticated connection.
// ABOUTME: Accepts local connections and relays each over its own direct-tcpip channel.

use super::error::{Error, Result};
use super::handle::ConnectionHandle;
use super::host::split_host_port;
use super::session::Session;
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Lifecycle of a forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderState {
    Created,
    Listening,
    Closed,
}

impl std::fmt::Display for ForwarderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwarderState::Created => f.write_str("created"),
            ForwarderState::Listening => f.write_str("listening"),
            ForwarderState::Closed => f.write_str("closed"),
        }
    }
}

/// Forwards a local listening port to a fixed remote address.
///
/// The forwarder uses the connection handle but never closes it. Closing the
/// forwarder stops accepting; sessions already running drain on their own.
pub struct Forwarder {
    tunnel: Arc<Tunnel>,
    local_addr: SocketAddr,
    state: Mutex<ForwarderState>,
    listener: Mutex<Option<TcpListener>>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// What each accepted connection needs.
struct Tunnel {
    handle: ConnectionHandle,
    remote: String,
    remote_host: String,
    remote_port: u16,
    descriptor: String,
}

impl Forwarder {
    /// Bind `local_bind` and prepare to forward to `remote` (`host:port`).
    pub async fn new(handle: ConnectionHandle, local_bind: &str, remote: &str) -> Result<Self> {
        let (remote_host, remote_port) =
            split_host_port(remote).ok_or_else(|| Error::InvalidAddress(remote.to_string()))?;

        let listener = TcpListener::bind(local_bind)
            .await
            .map_err(|source| Error::Listen {
                addr: local_bind.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            tunnel: Arc::new(Tunnel {
                handle,
                remote: remote.to_string(),
                remote_host,
                remote_port,
                descriptor: format!("{} -> {}", local_addr.port(), remote),
            }),
            local_addr,
            state: Mutex::new(ForwarderState::Created),
            listener: Mutex::new(Some(listener)),
            shutdown,
            accept_task: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> &str {
        &self.tunnel.remote
    }

    /// `<local port> -> <remote>`, used to tag log lines.
    pub fn descriptor(&self) -> &str {
        &self.tunnel.descriptor
    }

    pub fn state(&self) -> ForwarderState {
        *self.state.lock()
    }

    /// Start accepting connections in the background.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        let listener = match *state {
            ForwarderState::Created => self.listener.lock().take(),
            _ => None,
        };
        let Some(listener) = listener else {
            return Err(Error::InvalidState {
                action: "start",
                state: *state,
            });
        };

        let tunnel = Arc::clone(&self.tunnel);
        let shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            let descriptor = tunnel.descriptor.clone();
            match accept_loop(listener, tunnel, shutdown).await {
                LoopExit::Closed => tracing::debug!("[{}] listener closed", descriptor),
                LoopExit::Failed(e) => tracing::error!("[{}] accept failed: {}", descriptor, e),
            }
        });

        *self.accept_task.lock() = Some(task);
        *state = ForwarderState::Listening;
        tracing::info!("[{}] listening on {}", self.tunnel.descriptor, self.local_addr);
        Ok(())
    }

    /// Stop accepting and release the listener. Idempotent.
    pub async fn close(&self) {
        let task = {
            let mut state = self.state.lock();
            if *state == ForwarderState::Closed {
                return;
            }
            *state = ForwarderState::Closed;
            self.listener.lock().take();
            self.shutdown.send_replace(true);
            self.accept_task.lock().take()
        };

        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl Tunnel {
    /// Open a channel for one accepted connection and relay it.
    async fn forward<S>(&self, local: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match self
            .handle
            .open_channel(&self.remote_host, self.remote_port)
            .await
        {
            Ok(remote) => {
                Session::new(local, remote, format!("{} -> {}", peer, self.remote))
                    .run()
                    .await;
            }
            Err(e) => tracing::warn!("[{}] {}", self.descriptor, e),
        }
    }
}

/// Source of accepted connections.
pub(crate) trait Accept: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(
        &mut self,
    ) -> impl Future<Output = std::io::Result<(Self::Stream, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> std::io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

#[derive(Debug)]
pub(crate) enum LoopExit {
    /// Shutdown was requested.
    Closed,
    /// Accept returned an I/O error.
    Failed(std::io::Error),
}

async fn accept_loop<A: Accept>(
    mut listener: A,
    tunnel: Arc<Tunnel>,
    mut shutdown: watch::Receiver<bool>,
) -> LoopExit {
    loop {
        let accepted = tokio::select! {
            // Any change, or the forwarder being dropped, means stop.
            _ = shutdown.changed() => return LoopExit::Closed,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!("[{}] accepted {}", tunnel.descriptor, peer);
                let tunnel = Arc::clone(&tunnel);
                tokio::spawn(async move { tunnel.forward(stream, peer).await });
            }
            Err(e) => return LoopExit::Failed(e),
        }
    }
}
