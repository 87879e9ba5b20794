// ABOUTME: Integration tests for local port forwarding.
// ABOUTME: Real TCP listeners on loopback, channels served by the echoing mock transport.

mod support;

use hopssh::config::SshConfig;
use hopssh::ssh::{ClientFactory, ConnectionHandle, Error, Forwarder, ForwarderState};
use std::time::Duration;
use support::mock::{Event, MockTransport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const CONFIG: &str = r#"
Host db-gateway
    Hostname gateway.internal
    User tunnel
"#;

const WAIT: Duration = Duration::from_secs(5);

async fn connect(transport: &MockTransport) -> ConnectionHandle {
    ClientFactory::new(SshConfig::parse(CONFIG).unwrap())
        .transport(transport.clone())
        .create_connection("db-gateway")
        .await
        .unwrap()
}

async fn echo(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf
}

/// Test: Bytes written to the local port.
/// Expected: They travel over a channel to the remote address and back.
#[tokio::test]
async fn forwards_bytes_through_channel() {
    support::init_tracing();
    let transport = MockTransport::new();
    let handle = connect(&transport).await;

    let forwarder = Forwarder::new(handle, "127.0.0.1:0", "db:5432").await.unwrap();
    assert_eq!(forwarder.state(), ForwarderState::Created);
    forwarder.start().unwrap();
    assert_eq!(forwarder.state(), ForwarderState::Listening);

    let mut stream = TcpStream::connect(forwarder.local_addr()).await.unwrap();
    assert_eq!(echo(&mut stream, b"SELECT 1;").await, b"SELECT 1;");

    assert!(transport.events().contains(&Event::Channel {
        via: "gateway.internal".to_string(),
        to: "db:5432".to_string(),
    }));
    assert_eq!(
        forwarder.descriptor(),
        format!("{} -> db:5432", forwarder.local_addr().port())
    );
    assert_eq!(forwarder.remote_addr(), "db:5432");

    forwarder.close().await;
}

/// Test: The first channel open fails.
/// Expected: That client is disconnected; the next connection works.
#[tokio::test]
async fn channel_failure_does_not_stop_accepting() {
    support::init_tracing();
    let transport = MockTransport::new();
    transport.fail_channel("db:5432", 1);
    let handle = connect(&transport).await;

    let forwarder = Forwarder::new(handle, "127.0.0.1:0", "db:5432").await.unwrap();
    forwarder.start().unwrap();

    let mut first = TcpStream::connect(forwarder.local_addr()).await.unwrap();
    let mut buf = Vec::new();
    let n = tokio::time::timeout(WAIT, first.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0, "failed session should close the local connection");

    let mut second = TcpStream::connect(forwarder.local_addr()).await.unwrap();
    assert_eq!(echo(&mut second, b"ping").await, b"ping");
    assert_eq!(forwarder.state(), ForwarderState::Listening);

    forwarder.close().await;
}

/// Test: Several clients at once.
/// Expected: Each gets its own channel and sees only its own bytes.
#[tokio::test]
async fn concurrent_clients_get_independent_sessions() {
    let transport = MockTransport::new();
    let handle = connect(&transport).await;
    let forwarder = Forwarder::new(handle, "127.0.0.1:0", "db:5432").await.unwrap();
    forwarder.start().unwrap();
    let addr = forwarder.local_addr();

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        tasks.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let payload = vec![i; 1024];
            assert_eq!(echo(&mut stream, &payload).await, payload);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    forwarder.close().await;
}

/// Test: Close the forwarder.
/// Expected: State is Closed, the port stops accepting, the handle stays open.
#[tokio::test]
async fn close_stops_listening_but_keeps_handle() {
    let transport = MockTransport::new();
    let handle = connect(&transport).await;
    let forwarder = Forwarder::new(handle.clone(), "127.0.0.1:0", "db:5432")
        .await
        .unwrap();
    forwarder.start().unwrap();
    let addr = forwarder.local_addr();

    forwarder.close().await;
    assert_eq!(forwarder.state(), ForwarderState::Closed);
    assert!(TcpStream::connect(addr).await.is_err());

    assert!(!handle.is_closed());
    assert!(transport.closes().is_empty());

    // Idempotent.
    forwarder.close().await;
    assert_eq!(forwarder.state(), ForwarderState::Closed);
}

/// Test: Close while a session is active.
/// Expected: The running session keeps relaying until its peer disconnects.
#[tokio::test]
async fn close_leaves_running_sessions_alone() {
    let transport = MockTransport::new();
    let handle = connect(&transport).await;
    let forwarder = Forwarder::new(handle, "127.0.0.1:0", "db:5432").await.unwrap();
    forwarder.start().unwrap();

    let mut stream = TcpStream::connect(forwarder.local_addr()).await.unwrap();
    assert_eq!(echo(&mut stream, b"before").await, b"before");

    forwarder.close().await;
    assert_eq!(echo(&mut stream, b"after").await, b"after");
}

/// Test: Start called twice, and after close.
/// Expected: InvalidState both times.
#[tokio::test]
async fn start_only_from_created() {
    let transport = MockTransport::new();
    let handle = connect(&transport).await;
    let forwarder = Forwarder::new(handle, "127.0.0.1:0", "db:5432").await.unwrap();

    forwarder.start().unwrap();
    let err = forwarder.start().unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState {
            state: ForwarderState::Listening,
            ..
        }
    ));

    forwarder.close().await;
    let err = forwarder.start().unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState {
            state: ForwarderState::Closed,
            ..
        }
    ));
}

/// Test: Closing a forwarder that never started.
/// Expected: Listener released, state Closed.
#[tokio::test]
async fn close_before_start() {
    let transport = MockTransport::new();
    let handle = connect(&transport).await;
    let forwarder = Forwarder::new(handle, "127.0.0.1:0", "db:5432").await.unwrap();
    let addr = forwarder.local_addr();

    forwarder.close().await;
    assert_eq!(forwarder.state(), ForwarderState::Closed);
    assert!(TcpStream::connect(addr).await.is_err());
}

/// Test: Local port already in use.
/// Expected: Listen error naming the address.
#[tokio::test]
async fn bind_conflict_is_listen_error() {
    let transport = MockTransport::new();
    let handle = connect(&transport).await;
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = taken.local_addr().unwrap().to_string();

    let err = Forwarder::new(handle, &addr, "db:5432").await.err().unwrap();
    assert!(matches!(err, Error::Listen { addr: ref a, .. } if *a == addr));
}
