// ABOUTME: SSH-specific error types.
// ABOUTME: Covers alias resolution, key loading, dial/handshake, and forwarding failures.

use std::num::ParseIntError;
use std::path::PathBuf;
use thiserror::Error;

/// Boxed error used at the transport seam.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Why an identity file could not be turned into a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLoadErrorKind {
    NotFound,
    Unreadable,
    Unparseable,
}

impl std::fmt::Display for KeyLoadErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KeyLoadErrorKind::NotFound => "not found",
            KeyLoadErrorKind::Unreadable => "unreadable",
            KeyLoadErrorKind::Unparseable => "unparseable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("alias does not exist: {0}")]
    AliasNotFound(String),

    #[error("invalid ConnectTimeout {value:?} for {alias}: {source}")]
    TimeoutParse {
        alias: String,
        value: String,
        #[source]
        source: ParseIntError,
    },

    #[error("invalid Port {value:?} for {alias}: {source}")]
    InvalidPort {
        alias: String,
        value: String,
        #[source]
        source: ParseIntError,
    },

    #[error("ProxyJump cycle detected: {0}")]
    ProxyJumpCycle(String),

    #[error("failed to load key from {path} ({kind}): {reason}")]
    KeyLoad {
        path: PathBuf,
        kind: KeyLoadErrorKind,
        reason: String,
    },

    #[error("failed to connect to {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: BoxError,
    },

    #[error("SSH handshake with {target} failed: {source}")]
    Handshake {
        target: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to close connection to {target}: {source}")]
    Close {
        target: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid address {0:?}: expected host:port")]
    InvalidAddress(String),

    #[error("failed to open channel to {target}: {source}")]
    ChannelOpen {
        target: String,
        #[source]
        source: BoxError,
    },

    #[error("forwarder cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: super::forward::ForwarderState,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
