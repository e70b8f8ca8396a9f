//! Opaque bidirectional byte relay.
//!
//! Both ends are expressed as a [`Duplex`]: a stream of inbound chunks plus a
//! sink for outbound chunks. WebSockets, TCP sockets and in-memory channels
//! all adapt to that shape, so the relay never looks at the payload.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

pub type ByteStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;
pub type ByteSink = Pin<Box<dyn Sink<Bytes, Error = std::io::Error> + Send>>;

pub struct Duplex {
    pub reader: ByteStream,
    pub writer: ByteSink,
}

impl Duplex {
    pub fn new(
        reader: impl Stream<Item = Bytes> + Send + 'static,
        writer: impl Sink<Bytes, Error = std::io::Error> + Send + 'static,
    ) -> Self {
        Self {
            reader: Box::pin(reader),
            writer: Box::pin(writer),
        }
    }

    /// Adapt an axum WebSocket. Binary frames carry the payload; text frames
    /// are passed through as their UTF-8 bytes; a close frame ends the stream.
    pub fn from_axum(socket: axum::extract::ws::WebSocket) -> Self {
        use axum::extract::ws::Message;

        let (tx, rx) = socket.split();
        let reader = rx
            .take_while(|msg| futures::future::ready(matches!(msg, Ok(m) if !matches!(m, Message::Close(_)))))
            .filter_map(|msg| {
                futures::future::ready(match msg {
                    Ok(Message::Binary(data)) => Some(data),
                    Ok(Message::Text(text)) => Some(Bytes::copy_from_slice(text.as_str().as_bytes())),
                    _ => None,
                })
            });
        let writer = tx
            .sink_map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
            .with(|data: Bytes| futures::future::ready(Ok::<_, std::io::Error>(Message::Binary(data))));
        Self::new(reader, writer)
    }
}

#[derive(Debug, Clone)]
pub struct RelayLimits {
    /// Tear down when neither side has produced a byte for this long.
    pub idle_timeout: Duration,
    /// How long a write may stay blocked before the consumer is dropped.
    pub slow_consumer_grace: Duration,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            slow_consumer_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToAgent,
    AgentToClient,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ClientToAgent => write!(f, "client->agent"),
            Direction::AgentToClient => write!(f, "agent->client"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    ClientClosed,
    AgentClosed,
    IdleTimeout,
    SlowConsumer(Direction),
    WriteFailed(Direction),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    pub client_to_agent: u64,
    pub agent_to_client: u64,
    pub end: RelayEnd,
}

/// Shared bookkeeping for the two copy loops of one relay.
struct RelayShared {
    started: Instant,
    /// Millis since `started` of the last chunk read on either side.
    last_read: AtomicU64,
    end: OnceLock<RelayEnd>,
    stop: CancellationToken,
    on_activity: Arc<dyn Fn() + Send + Sync>,
}

impl RelayShared {
    fn mark_read(&self) {
        let ms = self.started.elapsed().as_millis() as u64;
        self.last_read.store(ms, Ordering::Release);
        (self.on_activity)();
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_read.load(Ordering::Acquire));
        self.started.elapsed().saturating_sub(last)
    }

    fn finish(&self, end: RelayEnd) {
        let _ = self.end.set(end);
        self.stop.cancel();
    }
}

/// Relay bytes between `client` and `agent` until either side closes, the
/// relay idles out, a consumer stalls, or `cancel` fires.
///
/// `on_activity` runs for every chunk read from either side.
pub async fn relay(
    client: Duplex,
    agent: Duplex,
    limits: RelayLimits,
    cancel: CancellationToken,
    on_activity: Arc<dyn Fn() + Send + Sync>,
) -> RelayReport {
    let shared = Arc::new(RelayShared {
        started: Instant::now(),
        last_read: AtomicU64::new(0),
        end: OnceLock::new(),
        stop: cancel.child_token(),
        on_activity,
    });

    let up = tokio::spawn(pump(
        client.reader,
        agent.writer,
        Direction::ClientToAgent,
        limits.clone(),
        shared.clone(),
    ));
    let down = tokio::spawn(pump(
        agent.reader,
        client.writer,
        Direction::AgentToClient,
        limits,
        shared.clone(),
    ));

    let (up, down) = tokio::join!(up, down);
    RelayReport {
        client_to_agent: up.unwrap_or(0),
        agent_to_client: down.unwrap_or(0),
        end: shared.end.get().copied().unwrap_or(RelayEnd::Cancelled),
    }
}

async fn pump(
    mut src: ByteStream,
    mut dst: ByteSink,
    dir: Direction,
    limits: RelayLimits,
    shared: Arc<RelayShared>,
) -> u64 {
    let mut copied = 0u64;
    let end = loop {
        let next = tokio::select! {
            _ = shared.stop.cancelled() => break RelayEnd::Cancelled,
            r = tokio::time::timeout(limits.idle_timeout, src.next()) => r,
        };
        match next {
            Ok(Some(chunk)) => {
                shared.mark_read();
                let len = chunk.len() as u64;
                let sent = tokio::select! {
                    _ = shared.stop.cancelled() => break RelayEnd::Cancelled,
                    r = tokio::time::timeout(limits.slow_consumer_grace, dst.send(chunk)) => r,
                };
                match sent {
                    Ok(Ok(())) => copied += len,
                    Ok(Err(e)) => {
                        tracing::debug!(direction = %dir, error = %e, "relay write failed");
                        break RelayEnd::WriteFailed(dir);
                    }
                    Err(_) => {
                        tracing::warn!(direction = %dir, "consumer stalled past grace window");
                        break RelayEnd::SlowConsumer(dir);
                    }
                }
            }
            Ok(None) => {
                break match dir {
                    Direction::ClientToAgent => RelayEnd::ClientClosed,
                    Direction::AgentToClient => RelayEnd::AgentClosed,
                }
            }
            Err(_) => {
                // The other direction may still be busy.
                if shared.idle_for() >= limits.idle_timeout {
                    break RelayEnd::IdleTimeout;
                }
            }
        }
    };
    shared.finish(end);
    let _ = tokio::time::timeout(limits.slow_consumer_grace, dst.close()).await;
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use std::sync::atomic::AtomicUsize;

    /// One end of an in-memory duplex plus the handles the test drives.
    struct TestEnd {
        duplex: Duplex,
        inbound: mpsc::Sender<Bytes>,
        outbound: mpsc::Receiver<Bytes>,
    }

    fn test_end(buffer: usize) -> TestEnd {
        let (in_tx, in_rx) = mpsc::channel::<Bytes>(buffer);
        let (out_tx, out_rx) = mpsc::channel::<Bytes>(buffer);
        let writer = out_tx.sink_map_err(|e| std::io::Error::new(std::io::ErrorKind::BrokenPipe, e));
        TestEnd {
            duplex: Duplex::new(in_rx, writer),
            inbound: in_tx,
            outbound: out_rx,
        }
    }

    fn noop() -> Arc<dyn Fn() + Send + Sync> {
        Arc::new(|| {})
    }

    fn limits() -> RelayLimits {
        RelayLimits {
            idle_timeout: Duration::from_secs(5),
            slow_consumer_grace: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn bytes_pass_through_unchanged() {
        let mut client = test_end(16);
        let mut agent = test_end(16);
        let task = tokio::spawn(relay(
            client.duplex,
            agent.duplex,
            limits(),
            CancellationToken::new(),
            noop(),
        ));

        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        client.inbound.send(Bytes::from(payload.clone())).await.unwrap();
        assert_eq!(agent.outbound.next().await.unwrap(), Bytes::from(payload.clone()));

        agent.inbound.send(Bytes::from_static(b"\x00\xffframe")).await.unwrap();
        assert_eq!(client.outbound.next().await.unwrap(), Bytes::from_static(b"\x00\xffframe"));

        drop(client.inbound);
        let report = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(report.end, RelayEnd::ClientClosed);
        assert_eq!(report.client_to_agent, 4096);
        assert_eq!(report.agent_to_client, 7);
    }

    #[tokio::test]
    async fn agent_close_tears_down_both_loops() {
        let client = test_end(16);
        let agent = test_end(16);
        let TestEnd { duplex: client_duplex, inbound: _client_in, outbound: _client_out } = client;
        let TestEnd { duplex: agent_duplex, inbound: agent_in, outbound: _agent_out } = agent;

        let task = tokio::spawn(relay(client_duplex, agent_duplex, limits(), CancellationToken::new(), noop()));
        drop(agent_in);

        let report = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(report.end, RelayEnd::AgentClosed);
    }

    #[tokio::test]
    async fn parent_cancellation_stops_relay() {
        let client = test_end(16);
        let agent = test_end(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(relay(client.duplex, agent.duplex, limits(), cancel.clone(), noop()));

        cancel.cancel();
        let report = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(report.end, RelayEnd::Cancelled);
        drop((client.inbound, agent.inbound));
    }

    #[tokio::test]
    async fn stalled_consumer_is_disconnected() {
        // The client never reads; its one-slot buffer fills up.
        let client = test_end(0);
        let mut agent = test_end(16);
        let task = tokio::spawn(relay(client.duplex, agent.duplex, limits(), CancellationToken::new(), noop()));

        for _ in 0..8 {
            if agent.inbound.send(Bytes::from_static(b"frame")).await.is_err() {
                break;
            }
        }

        let report = tokio::time::timeout(Duration::from_secs(3), task).await.unwrap().unwrap();
        assert_eq!(report.end, RelayEnd::SlowConsumer(Direction::AgentToClient));
        drop(client.outbound);
    }

    #[tokio::test]
    async fn idle_relay_times_out() {
        let client = test_end(16);
        let agent = test_end(16);
        let limits = RelayLimits {
            idle_timeout: Duration::from_millis(100),
            slow_consumer_grace: Duration::from_millis(100),
        };
        let task = tokio::spawn(relay(client.duplex, agent.duplex, limits, CancellationToken::new(), noop()));

        let report = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(report.end, RelayEnd::IdleTimeout);
        drop((client.inbound, agent.inbound));
    }

    #[tokio::test]
    async fn one_busy_direction_keeps_relay_alive() {
        let mut client = test_end(16);
        let mut agent = test_end(16);
        let limits = RelayLimits {
            idle_timeout: Duration::from_millis(150),
            slow_consumer_grace: Duration::from_millis(150),
        };
        let touches = Arc::new(AtomicUsize::new(0));
        let counter = touches.clone();
        let task = tokio::spawn(relay(
            client.duplex,
            agent.duplex,
            limits,
            CancellationToken::new(),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
        ));

        // Only the agent talks; the client side stays silent.
        for _ in 0..6 {
            agent.inbound.send(Bytes::from_static(b"pixels")).await.unwrap();
            assert!(client.outbound.next().await.is_some());
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
        assert!(!task.is_finished());
        assert_eq!(touches.load(Ordering::Relaxed), 6);

        drop(client.inbound);
        let report = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(report.end, RelayEnd::ClientClosed);
    }
}
