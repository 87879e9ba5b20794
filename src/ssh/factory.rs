// ABOUTME: Builds authenticated connections for host aliases, including ProxyJump chains.
// ABOUTME: Opens hops strictly in order and unwinds every opened hop when a later one fails.

use super::client::RusshTransport;
use super::error::{BoxError, Error, Result};
use super::handle::{ConnectionHandle, Hop, close_hops};
use super::host::{AddressFamily, DEFAULT_PORT, HostSpec};
use super::keys::{Credential, FileKeyLoader, KeyLoader};
use super::transport::{BoxStream, Connection, HandshakeParams, Transport};
use crate::config::AliasResolver;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// A resolved hop waiting to be connected.
struct PlannedHop {
    spec: HostSpec,
    credentials: Vec<Credential>,
}

impl PlannedHop {
    fn label(&self) -> String {
        format!(
            "{} ({}@{})",
            self.spec.alias,
            self.spec.user,
            self.spec.address()
        )
    }
}

/// Creates connection handles for aliases.
///
/// The resolver is the only shared state; concurrent `create_connection`
/// calls do not interact.
pub struct ClientFactory {
    resolver: Arc<dyn AliasResolver>,
    key_loader: Arc<dyn KeyLoader>,
    transport: Arc<dyn Transport>,
}

impl ClientFactory {
    /// Factory using `resolver`, keys from disk, and the russh transport.
    pub fn new(resolver: impl AliasResolver + 'static) -> Self {
        Self {
            resolver: Arc::new(resolver),
            key_loader: Arc::new(FileKeyLoader),
            transport: Arc::new(RusshTransport::default()),
        }
    }

    pub fn key_loader(mut self, key_loader: impl KeyLoader + 'static) -> Self {
        self.key_loader = Arc::new(key_loader);
        self
    }

    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    /// Connect to `[user@]alias`, going through its ProxyJump chain if any.
    pub async fn create_connection(&self, alias: &str) -> Result<ConnectionHandle> {
        let plan = self.plan(alias)?;
        tracing::debug!(
            "Connecting to {} via {} jump host(s)",
            alias,
            plan.len().saturating_sub(1)
        );
        self.build(alias, plan).await
    }

    /// Connect to a single host without consulting the resolver. Port 0 means 22.
    pub async fn connect_direct(
        &self,
        host: &str,
        port: u16,
        user: &str,
        identity_file: Option<&str>,
    ) -> Result<ConnectionHandle> {
        let port = if port == 0 { DEFAULT_PORT } else { port };
        let credentials = identity_file
            .map(|path| self.key_loader.load(path))
            .transpose()?
            .into_iter()
            .collect();

        let hop = PlannedHop {
            spec: HostSpec {
                alias: host.to_string(),
                hostname: host.to_string(),
                port,
                user: user.to_string(),
                identity_files: identity_file.map(str::to_string).into_iter().collect(),
                connect_timeout: None,
                address_family: AddressFamily::Any,
                proxy_jump: Vec::new(),
            },
            credentials,
        };
        self.build(host, vec![hop]).await
    }

    /// Resolve the alias and every jump host, loading all keys, before any
    /// network activity. A jump host's own ProxyJump is expanded in front of it.
    fn plan(&self, alias: &str) -> Result<Vec<PlannedHop>> {
        let mut plan = Vec::new();
        let mut ancestors = Vec::new();
        self.expand(alias, &mut ancestors, &mut plan)?;
        Ok(plan)
    }

    fn expand(
        &self,
        alias: &str,
        ancestors: &mut Vec<String>,
        plan: &mut Vec<PlannedHop>,
    ) -> Result<()> {
        let spec = HostSpec::resolve(self.resolver.as_ref(), alias)?;

        if ancestors.contains(&spec.alias) {
            let mut cycle = ancestors.clone();
            cycle.push(spec.alias);
            return Err(Error::ProxyJumpCycle(cycle.join(" -> ")));
        }

        let credentials = spec
            .identity_files
            .iter()
            .map(|path| self.key_loader.load(path))
            .collect::<Result<Vec<_>>>()?;

        ancestors.push(spec.alias.clone());
        for jump in &spec.proxy_jump {
            self.expand(jump, ancestors, plan)?;
        }
        ancestors.pop();

        plan.push(PlannedHop { spec, credentials });
        Ok(())
    }

    /// Connect each planned hop in order through the previous one.
    async fn build(&self, alias: &str, plan: Vec<PlannedHop>) -> Result<ConnectionHandle> {
        let Some((target, jumps)) = plan.split_last() else {
            return Err(Error::AliasNotFound(alias.to_string()));
        };

        let mut opened: Vec<Hop> = Vec::with_capacity(jumps.len());
        for hop in jumps {
            match self.connect_hop(hop, opened.last()).await {
                Ok(conn) => opened.push(Hop {
                    label: hop.label(),
                    conn,
                }),
                Err(e) => {
                    tracing::warn!(
                        "Jump host {} failed, unwinding {} hop(s)",
                        hop.label(),
                        opened.len()
                    );
                    close_hops(opened).await;
                    return Err(e);
                }
            }
        }

        match self.connect_hop(target, opened.last()).await {
            Ok(conn) => Ok(ConnectionHandle::new(target.label(), conn, opened)),
            Err(e) => {
                if !opened.is_empty() {
                    tracing::warn!(
                        "Target {} failed, unwinding {} hop(s)",
                        target.label(),
                        opened.len()
                    );
                }
                close_hops(opened).await;
                Err(e)
            }
        }
    }

    /// Reach one hop (dial or channel through `via`) and authenticate.
    async fn connect_hop(
        &self,
        hop: &PlannedHop,
        via: Option<&Hop>,
    ) -> Result<Box<dyn Connection>> {
        let spec = &hop.spec;
        let label = hop.label();

        let stream: BoxStream = match via {
            Some(prev) => {
                tracing::debug!("Opening channel to {} through {}", label, prev.label);
                with_timeout(
                    spec.connect_timeout,
                    prev.conn.open_channel(&spec.hostname, spec.port),
                )
                .await
            }
            None => {
                tracing::debug!("Dialing {}", label);
                with_timeout(
                    spec.connect_timeout,
                    self.transport
                        .dial(&spec.hostname, spec.port, spec.address_family),
                )
                .await
            }
        }
        .map_err(|source| Error::Dial {
            target: label.clone(),
            source,
        })?;

        let params = HandshakeParams {
            host: spec.hostname.clone(),
            port: spec.port,
            user: spec.user.clone(),
            credentials: hop.credentials.clone(),
        };

        let conn = with_timeout(
            spec.connect_timeout,
            self.transport.handshake(stream, &params),
        )
        .await
        .map_err(|source| Error::Handshake {
            target: label.clone(),
            source,
        })?;

        tracing::info!("Connected to {}", label);
        Ok(conn)
    }
}

async fn with_timeout<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = std::result::Result<T, BoxError>>,
) -> std::result::Result<T, BoxError> {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("timed out after {:?}", limit),
            )
            .into()),
        },
        None => fut.await,
    }
}
