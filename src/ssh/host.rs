// ABOUTME: Resolution of a `[user@]alias` string into concrete host settings.
// ABOUTME: Reads hostname, port, user, keys, timeout and ProxyJump from an AliasResolver.

use super::error::{Error, Result};
use crate::config::{AliasResolver, keys};
use std::net::SocketAddr;
use std::time::Duration;

pub(crate) const DEFAULT_PORT: u16 = 22;

/// Socket family restriction for direct dials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    #[default]
    Any,
    Inet,
    Inet6,
}

impl AddressFamily {
    /// Map an `AddressFamily` attribute. Unrecognized values mean `Any`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "inet" => AddressFamily::Inet,
            "inet6" => AddressFamily::Inet6,
            _ => AddressFamily::Any,
        }
    }

    pub fn allows(&self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::Any => true,
            AddressFamily::Inet => addr.is_ipv4(),
            AddressFamily::Inet6 => addr.is_ipv6(),
        }
    }
}

/// Connection settings for one alias, read fresh from the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    /// Alias as looked up in the resolver (without any `user@` prefix).
    pub alias: String,
    pub hostname: String,
    pub port: u16,
    pub user: String,
    /// Identity file paths, in configured order, before home expansion.
    pub identity_files: Vec<String>,
    pub connect_timeout: Option<Duration>,
    pub address_family: AddressFamily,
    /// Jump aliases, outermost first.
    pub proxy_jump: Vec<String>,
}

impl HostSpec {
    /// Resolve `[user@]alias`.
    pub fn resolve(resolver: &dyn AliasResolver, alias: &str) -> Result<Self> {
        let (alias_user, host_alias) = split_user(alias);

        let hostname = resolver
            .get(host_alias, keys::HOSTNAME)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::AliasNotFound(host_alias.to_string()))?;

        let port = match resolver.get(host_alias, keys::PORT).filter(|p| !p.is_empty()) {
            Some(value) => value.trim().parse::<u16>().map_err(|source| Error::InvalidPort {
                alias: host_alias.to_string(),
                value,
                source,
            })?,
            None => DEFAULT_PORT,
        };

        let user = match alias_user {
            Some(user) => user.to_string(),
            None => resolver
                .get(host_alias, keys::USER)
                .filter(|u| !u.is_empty())
                .unwrap_or_else(default_user),
        };

        let connect_timeout = match resolver
            .get(host_alias, keys::CONNECT_TIMEOUT)
            .filter(|t| !t.is_empty())
        {
            Some(value) => {
                let secs = value.trim().parse::<u64>().map_err(|source| Error::TimeoutParse {
                    alias: host_alias.to_string(),
                    value,
                    source,
                })?;
                // Zero means no timeout.
                (secs > 0).then(|| Duration::from_secs(secs))
            }
            None => None,
        };

        let address_family = resolver
            .get(host_alias, keys::ADDRESS_FAMILY)
            .map(|v| AddressFamily::parse(&v))
            .unwrap_or_default();

        let proxy_jump = resolver
            .get(host_alias, keys::PROXY_JUMP)
            .map(|v| parse_proxy_jump(&v))
            .unwrap_or_default();

        Ok(Self {
            alias: host_alias.to_string(),
            hostname,
            port,
            user,
            identity_files: resolver.get_all(host_alias, keys::IDENTITY_FILE),
            connect_timeout,
            address_family,
            proxy_jump,
        })
    }

    /// `hostname:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        join_host_port(&self.hostname, self.port)
    }
}

/// Split `user@alias` on the last `@`. An empty user part is ignored.
pub fn split_user(alias: &str) -> (Option<&str>, &str) {
    match alias.rfind('@') {
        Some(pos) => {
            let user = &alias[..pos];
            let host = &alias[pos + 1..];
            if user.is_empty() {
                (None, host)
            } else {
                (Some(user), host)
            }
        }
        None => (None, alias),
    }
}

/// Parse a comma-separated ProxyJump value. `none` disables jumping.
pub fn parse_proxy_jump(value: &str) -> Vec<String> {
    if value.trim().eq_ignore_ascii_case("none") {
        return Vec::new();
    }
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Split `host:port` (or `[v6]:port`) into its parts.
pub fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let colon = addr.rfind(':')?;
    let host = &addr[..colon];
    let port = addr[colon + 1..].parse::<u16>().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

fn default_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "root".to_string())
}
