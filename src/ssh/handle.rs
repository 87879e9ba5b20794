// ABOUTME: Authenticated connection handle that owns its jump-host chain.
// ABOUTME: A watcher task closes every intermediate hop once the target connection ends.

use super::error::{Error, Result};
use super::transport::{BoxStream, Connection};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

/// An intermediate connection opened while building a chain.
pub(crate) struct Hop {
    pub(crate) label: String,
    pub(crate) conn: Box<dyn Connection>,
}

/// Close hops last-opened first. Failures are logged, never returned.
pub(crate) async fn close_hops(hops: Vec<Hop>) {
    for hop in hops.into_iter().rev() {
        match hop.conn.close().await {
            Ok(()) => tracing::debug!("Closed jump host {}", hop.label),
            Err(e) => tracing::warn!("Failed to close jump host {}: {}", hop.label, e),
        }
    }
}

/// The single handle a caller gets for an alias.
///
/// Clones share the same connection. Intermediate hops are owned by the
/// handle's watcher and are never exposed. The connection and its chain are
/// torn down when `close` is called, when the last clone is dropped, or when
/// the target connection ends on its own.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

struct Inner {
    target: String,
    hops: Vec<String>,
    conn: Arc<dyn Connection>,
    /// Sent by `close`; dropped with the last clone.
    release: Mutex<Option<oneshot::Sender<()>>>,
    torn_down: watch::Receiver<bool>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("target", &self.inner.target)
            .field("hops", &self.inner.hops)
            .finish()
    }
}

impl ConnectionHandle {
    /// Wrap a target connection and take ownership of the chain that reaches it.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn new(target: String, conn: Box<dyn Connection>, chain: Vec<Hop>) -> Self {
        let conn: Arc<dyn Connection> = Arc::from(conn);
        let hops = chain.iter().map(|hop| hop.label.clone()).collect();
        let (release_tx, release_rx) = oneshot::channel();
        let (torn_down_tx, torn_down_rx) = watch::channel(false);

        tokio::spawn(watch_connection(
            target.clone(),
            Arc::clone(&conn),
            chain,
            release_rx,
            torn_down_tx,
        ));

        Self {
            inner: Arc::new(Inner {
                target,
                hops,
                conn,
                release: Mutex::new(Some(release_tx)),
                torn_down: torn_down_rx,
            }),
        }
    }

    /// Description of the target, e.g. `web (deploy@10.0.0.5:22)`.
    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// Descriptions of the jump hosts, outermost first.
    pub fn hops(&self) -> &[String] {
        &self.inner.hops
    }

    /// Open a channel to `host:port` through the target connection.
    pub async fn open_channel(&self, host: &str, port: u16) -> Result<BoxStream> {
        self.inner
            .conn
            .open_channel(host, port)
            .await
            .map_err(|source| Error::ChannelOpen {
                target: super::host::join_host_port(host, port),
                source,
            })
    }

    /// Close the target connection and wait until every jump host is closed.
    pub async fn close(&self) -> Result<()> {
        let result = self.inner.conn.close().await;
        let release = self.inner.release.lock().take();
        if let Some(release) = release {
            let _ = release.send(());
        }
        self.closed().await;
        result.map_err(|source| Error::Close {
            target: self.inner.target.clone(),
            source,
        })
    }

    /// Wait until the connection and its chain have been torn down.
    pub async fn closed(&self) {
        let mut torn_down = self.inner.torn_down.clone();
        let _ = torn_down.wait_for(|done| *done).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.torn_down.borrow()
    }
}

async fn watch_connection(
    target: String,
    conn: Arc<dyn Connection>,
    chain: Vec<Hop>,
    release: oneshot::Receiver<()>,
    torn_down: watch::Sender<bool>,
) {
    let close_target = tokio::select! {
        _ = conn.closed() => {
            tracing::debug!("Connection to {} ended", target);
            false
        }
        released = release => {
            // Ok: close() already closed the target. Err: last handle dropped.
            released.is_err()
        }
    };

    if close_target {
        if let Err(e) = conn.close().await {
            tracing::warn!("Failed to close {}: {}", target, e);
        }
    }

    if !chain.is_empty() {
        tracing::debug!("Closing {} jump host(s) behind {}", chain.len(), target);
    }
    close_hops(chain).await;
    torn_down.send_replace(true);
}
