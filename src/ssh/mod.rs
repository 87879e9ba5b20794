// ABOUTME: SSH connections through ProxyJump chains and local port forwarding over them.
// ABOUTME: Key-based authentication with optional known_hosts verification.

mod client;
mod error;
mod factory;
mod forward;
mod handle;
mod host;
mod keys;
mod session;
mod transport;

pub use client::{AuthError, HostKeyPolicy, RusshTransport, TransportConfig};
pub use error::{BoxError, Error, KeyLoadErrorKind, Result};
pub use factory::ClientFactory;
pub use forward::{Forwarder, ForwarderState};
pub use handle::ConnectionHandle;
pub use host::{AddressFamily, HostSpec, join_host_port, split_host_port, split_user};
pub use keys::{Credential, FileKeyLoader, KeyLoader, expand_home};
pub use session::{Direction, Session, SessionEnd};
pub use transport::{BoxStream, Connection, DuplexStream, HandshakeParams, Transport};
