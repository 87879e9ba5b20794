// ABOUTME: One forwarded flow: relays bytes between a local stream and a remote channel.
// ABOUTME: Ends when either direction finishes, then shuts down and releases both streams.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

/// Which way bytes were flowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LocalToRemote,
    RemoteToLocal,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::LocalToRemote => f.write_str("local -> remote"),
            Direction::RemoteToLocal => f.write_str("remote -> local"),
        }
    }
}

/// How a session ended: the direction that finished first and its copy result.
#[derive(Debug)]
pub struct SessionEnd {
    pub direction: Direction,
    pub result: std::io::Result<u64>,
}

/// Bidirectional relay between one accepted local connection and one channel.
pub struct Session<L, R> {
    local: L,
    remote: R,
    descriptor: String,
}

impl<L, R> Session<L, R>
where
    L: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(local: L, remote: R, descriptor: impl Into<String>) -> Self {
        Self {
            local,
            remote,
            descriptor: descriptor.into(),
        }
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Run the relay on its own task.
    pub fn start(self) -> JoinHandle<SessionEnd> {
        tokio::spawn(self.run())
    }

    /// Relay until the first direction finishes.
    ///
    /// Only that direction's outcome is reported. The other direction is cut
    /// short by the teardown and is never logged as a failure.
    pub async fn run(self) -> SessionEnd {
        let descriptor = self.descriptor;
        tracing::debug!("[{}] started", descriptor);

        let (mut local_rd, mut local_wr) = tokio::io::split(self.local);
        let (mut remote_rd, mut remote_wr) = tokio::io::split(self.remote);

        let end = tokio::select! {
            result = tokio::io::copy(&mut local_rd, &mut remote_wr) => SessionEnd {
                direction: Direction::LocalToRemote,
                result,
            },
            result = tokio::io::copy(&mut remote_rd, &mut local_wr) => SessionEnd {
                direction: Direction::RemoteToLocal,
                result,
            },
        };

        let _ = tokio::join!(remote_wr.shutdown(), local_wr.shutdown());

        match &end.result {
            Ok(bytes) => tracing::debug!(
                "[{}] ended: {} finished after {} bytes",
                descriptor,
                end.direction,
                bytes
            ),
            Err(e) => tracing::warn!("[{} / {}] {}", descriptor, end.direction, e),
        }

        end
    }
}
