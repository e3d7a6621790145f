//! WebSocket distribution server
//!
//! One dispatcher task drains the shared record queue, encodes each record
//! once and pushes it into the outbox of every matching session. Each
//! connection has its own task that flushes its outbox to the socket, so a
//! slow client only ever backs up its own bounded outbox.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use aggregator_core::{
    ServerSettings, SubscriptionFilter, HEARTBEAT_FRAME, INVALID_PARAMETERS_FRAME,
};
use aggregator_feed::SharedRecordQueue;

use crate::session::{ClientSession, SessionGuard, SessionRegistry, SharedFrame};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Dispatcher counters
#[derive(Debug, Default)]
pub struct DispatchStats {
    records: AtomicU64,
    deliveries: AtomicU64,
    encode_failures: AtomicU64,
}

impl DispatchStats {
    /// Records drained from the queue
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    /// Frames pushed into session outboxes
    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::Relaxed)
    }

    pub fn encode_failures(&self) -> u64 {
        self.encode_failures.load(Ordering::Relaxed)
    }
}

pub struct DistributionServer {
    listener: TcpListener,
    settings: ServerSettings,
    registry: Arc<SessionRegistry>,
    queue: Arc<SharedRecordQueue>,
    stats: Arc<DispatchStats>,
}

impl DistributionServer {
    pub async fn bind(
        settings: &ServerSettings,
        registry: Arc<SessionRegistry>,
        queue: Arc<SharedRecordQueue>,
    ) -> anyhow::Result<Self> {
        let address = settings.address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("failed to bind {}", address))?;

        Ok(Self {
            listener,
            settings: settings.clone(),
            registry,
            queue,
            stats: Arc::new(DispatchStats::default()),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }

    /// Accept clients and deliver records until `shutdown` flips to true
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!("Distribution server listening on {}", self.local_addr()?);

        let dispatcher = tokio::spawn(dispatch(
            Arc::clone(&self.queue),
            Arc::clone(&self.registry),
            Arc::clone(&self.stats),
            shutdown.clone(),
        ));

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            continue;
                        }
                    };

                    let connection = Connection {
                        peer,
                        settings: self.settings.clone(),
                        registry: Arc::clone(&self.registry),
                        shutdown: shutdown.clone(),
                    };
                    tokio::spawn(async move {
                        if let Err(e) = connection.run(stream).await {
                            debug!("Connection from {} ended with error: {:#}", peer, e);
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Distribution server shutting down ({} sessions)", self.registry.len());
                        break;
                    }
                }
            }
        }

        dispatcher.await.context("dispatcher task failed")?;
        Ok(())
    }
}

/// Drain the queue and fan records out to matching sessions
async fn dispatch(
    queue: Arc<SharedRecordQueue>,
    registry: Arc<SessionRegistry>,
    stats: Arc<DispatchStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = queue.wait() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }

        for record in queue.drain() {
            stats.records.fetch_add(1, Ordering::Relaxed);

            let sessions = registry.matching(&record);
            if sessions.is_empty() {
                continue;
            }

            let frame: SharedFrame = match record.to_frame() {
                Ok(frame) => frame.into(),
                Err(e) => {
                    let failures = stats.encode_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    if failures == 1 || failures % 100 == 0 {
                        error!("Failed to encode {} ({} failures): {}", record.key(), failures, e);
                    }
                    continue;
                }
            };

            let key = record.key();
            for session in &sessions {
                session.outbox().push(key.clone(), Arc::clone(&frame));
            }
            stats
                .deliveries
                .fetch_add(sessions.len() as u64, Ordering::Relaxed);
        }
    }
}

struct Connection {
    peer: SocketAddr,
    settings: ServerSettings,
    registry: Arc<SessionRegistry>,
    shutdown: watch::Receiver<bool>,
}

impl Connection {
    async fn run(mut self, stream: TcpStream) -> anyhow::Result<()> {
        let mut target = String::new();
        let capture_target = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            target = request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_default();
            Ok(response)
        };

        let handshake_timeout = self.settings.send_timeout();
        let mut ws = tokio::time::timeout(handshake_timeout, accept_hdr_async(stream, capture_target))
            .await
            .map_err(|_| anyhow!("handshake timed out after {:?}", handshake_timeout))?
            .context("WebSocket handshake failed")?;

        let filter = match SubscriptionFilter::parse(&target) {
            Ok(filter) => filter,
            Err(e) => {
                warn!("Rejecting client {} ({}): {}", self.peer, target, e);
                ws.send(Message::Text(INVALID_PARAMETERS_FRAME.to_string())).await?;
                ws.close(None).await?;
                return Ok(());
            }
        };

        let session = Arc::new(ClientSession::new(
            filter,
            Some(self.peer),
            self.settings.session_backlog,
        ));
        let id = self.registry.register(Arc::clone(&session));
        let _guard = SessionGuard::new(Arc::clone(&self.registry), id);
        info!("New session {} from {}: {}", id, self.peer, session.filter());

        let (mut sink, mut stream) = ws.split();
        let outcome = self.deliver(&session, &mut sink, &mut stream).await;

        let lifetime = chrono::Utc::now() - session.connected_at();
        match &outcome {
            Ok(()) => info!(
                "Session {} ended after {}s ({} frames dropped)",
                id,
                lifetime.num_seconds(),
                session.outbox().dropped()
            ),
            Err(e) => info!(
                "Session {} ended after {}s ({} frames dropped): {:#}",
                id,
                lifetime.num_seconds(),
                session.outbox().dropped(),
                e
            ),
        }
        outcome
    }

    async fn deliver(
        &mut self,
        session: &ClientSession,
        sink: &mut WsSink,
        stream: &mut WsStream,
    ) -> anyhow::Result<()> {
        let heartbeat_every = self.settings.heartbeat_interval();
        let send_timeout = self.settings.send_timeout();

        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = session.outbox().ready() => {
                    let frames = session.outbox().take();
                    if frames.is_empty() {
                        continue;
                    }
                    for frame in frames {
                        send(sink, Message::Text(frame.to_string()), send_timeout).await?;
                    }
                    // Heartbeats only fill silence
                    heartbeat.reset();
                }
                _ = heartbeat.tick() => {
                    send(sink, Message::Text(HEARTBEAT_FRAME.to_string()), send_timeout).await?;
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    // Pings are answered by tungstenite on the next write
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("client read failed"),
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        let _ = sink.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn send(sink: &mut WsSink, message: Message, timeout: Duration) -> anyhow::Result<()> {
    tokio::time::timeout(timeout, sink.send(message))
        .await
        .map_err(|_| anyhow!("send timed out after {:?}", timeout))?
        .context("send failed")
}
