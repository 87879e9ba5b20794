// ABOUTME: In-memory Transport that records every dial, channel, handshake and close.
// ABOUTME: Failures and delays are scripted per host; channels echo their input.

use async_trait::async_trait;
use hopssh::ssh::{AddressFamily, BoxError, BoxStream, Connection, HandshakeParams, Transport};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Direct network dial.
    Dial {
        host: String,
        port: u16,
        family: AddressFamily,
    },
    /// Channel opened through the connection to `via`, towards `to` (`host:port`).
    Channel { via: String, to: String },
    Handshake {
        host: String,
        user: String,
        keys: Vec<PathBuf>,
    },
    Close(String),
}

#[derive(Default)]
struct State {
    events: Mutex<Vec<Event>>,
    fail_dial: Mutex<HashSet<String>>,
    fail_handshake: Mutex<HashSet<String>>,
    fail_close: Mutex<HashSet<String>>,
    /// Remaining scripted failures per channel destination.
    fail_channel: Mutex<HashMap<String, usize>>,
    dial_delay: Mutex<Option<Duration>>,
    links: Mutex<HashMap<String, Vec<Arc<watch::Sender<bool>>>>>,
}

impl State {
    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<State>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_dial(&self, host: &str) {
        self.state.fail_dial.lock().insert(host.to_string());
    }

    pub fn fail_handshake(&self, host: &str) {
        self.state.fail_handshake.lock().insert(host.to_string());
    }

    pub fn fail_close(&self, host: &str) {
        self.state.fail_close.lock().insert(host.to_string());
    }

    /// Fail the next `times` channel opens towards `to` (`host:port`).
    pub fn fail_channel(&self, to: &str, times: usize) {
        self.state.fail_channel.lock().insert(to.to_string(), times);
    }

    pub fn dial_delay(&self, delay: Duration) {
        *self.state.dial_delay.lock() = Some(delay);
    }

    /// End the connection to `host` as if the server went away.
    pub fn kill(&self, host: &str) {
        if let Some(links) = self.state.links.lock().get(host) {
            for link in links {
                link.send_replace(true);
            }
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.events.lock().clone()
    }

    pub fn closes(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Close(host) => Some(host),
                _ => None,
            })
            .collect()
    }

    /// Poll until `n` closes have been recorded or `limit` passes.
    pub async fn wait_for_closes(&self, n: usize, limit: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let closes = self.closes();
            if closes.len() >= n || tokio::time::Instant::now() >= deadline {
                return closes;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn dial(
        &self,
        host: &str,
        port: u16,
        family: AddressFamily,
    ) -> Result<BoxStream, BoxError> {
        self.state.record(Event::Dial {
            host: host.to_string(),
            port,
            family,
        });
        let delay = *self.state.dial_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_dial.lock().contains(host) {
            return Err(format!("connection refused by {}", host).into());
        }
        let (stream, _peer) = tokio::io::duplex(64);
        Ok(Box::new(stream))
    }

    async fn handshake(
        &self,
        _stream: BoxStream,
        params: &HandshakeParams,
    ) -> Result<Box<dyn Connection>, BoxError> {
        self.state.record(Event::Handshake {
            host: params.host.clone(),
            user: params.user.clone(),
            keys: params
                .credentials
                .iter()
                .map(|c| c.path().to_path_buf())
                .collect(),
        });
        if self.state.fail_handshake.lock().contains(&params.host) {
            return Err(format!("authentication failed for {}", params.user).into());
        }

        let (link, closed) = watch::channel(false);
        let link = Arc::new(link);
        self.state
            .links
            .lock()
            .entry(params.host.clone())
            .or_default()
            .push(Arc::clone(&link));
        Ok(Box::new(MockConnection {
            host: params.host.clone(),
            state: Arc::clone(&self.state),
            link,
            closed,
        }))
    }
}

struct MockConnection {
    host: String,
    state: Arc<State>,
    link: Arc<watch::Sender<bool>>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn open_channel(&self, host: &str, port: u16) -> Result<BoxStream, BoxError> {
        let to = format!("{}:{}", host, port);
        self.state.record(Event::Channel {
            via: self.host.clone(),
            to: to.clone(),
        });

        if *self.closed.borrow() {
            return Err("connection closed".into());
        }
        {
            let mut failures = self.state.fail_channel.lock();
            if let Some(remaining) = failures.get_mut(&to) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(format!("channel to {} rejected", to).into());
                }
            }
        }

        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(server);
            let _ = tokio::io::copy(&mut rd, &mut wr).await;
        });
        Ok(Box::new(client))
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.state.record(Event::Close(self.host.clone()));
        self.link.send_replace(true);
        if self.state.fail_close.lock().contains(&self.host) {
            return Err(format!("close of {} failed", self.host).into());
        }
        Ok(())
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|done| *done).await;
    }
}
