//! WebSocket listener and per-connection loop.

use crate::router::Router;
use crate::Collaborators;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use voicelink_core::{
    encode, now_millis, ConfigError, ErrorCode, Message, ServerConfig, SocketConfig,
};

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One open client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    /// Milliseconds since the Unix epoch.
    pub connected_at: u64,
    /// Text frames handled so far.
    pub requests: u64,
}

/// The set of open connections of a server.
#[derive(Debug, Default)]
pub struct LiveConnections {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, ConnectionInfo>>,
}

impl LiveConnections {
    fn entries(&self) -> MutexGuard<'_, HashMap<u64, ConnectionInfo>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Snapshot, oldest connection first.
    pub fn list(&self) -> Vec<ConnectionInfo> {
        let entries = self.entries();
        let mut ids: Vec<&u64> = entries.keys().collect();
        ids.sort();
        ids.into_iter().map(|id| entries[id].clone()).collect()
    }

    fn register(self: &Arc<Self>, peer: SocketAddr) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = ConnectionInfo {
            peer,
            connected_at: now_millis(),
            requests: 0,
        };
        let live = {
            let mut entries = self.entries();
            entries.insert(id, info);
            entries.len()
        };
        tracing::info!("Client connected: {} ({} live)", peer, live);
        Registration {
            set: self.clone(),
            id,
            peer,
        }
    }
}

/// Membership of one connection in [`LiveConnections`]. Removes the entry
/// when dropped, however the connection ends.
struct Registration {
    set: Arc<LiveConnections>,
    id: u64,
    peer: SocketAddr,
}

impl Registration {
    fn record_request(&self) {
        if let Some(info) = self.set.entries().get_mut(&self.id) {
            info.requests += 1;
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let live = {
            let mut entries = self.set.entries();
            entries.remove(&self.id);
            entries.len()
        };
        tracing::info!("Client disconnected: {} ({} live)", self.peer, live);
    }
}

/// A bound voicelink server.
pub struct Server {
    listener: TcpListener,
    router: Arc<Router>,
    socket: SocketConfig,
    connections: Arc<LiveConnections>,
}

impl Server {
    /// Bind the listener. Port 0 picks a free port; see [`Server::local_addr`].
    pub async fn bind(
        config: ServerConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ServerError> {
        config.websocket.validate()?;
        let listener = TcpListener::bind(config.bind)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind,
                source,
            })?;
        let router = Router::new(config.name, collaborators)
            .with_message_limit(config.websocket.max_message_size);
        tracing::info!("Listening on ws://{}", listener.local_addr()?);
        Ok(Self {
            listener,
            router: Arc::new(router),
            socket: config.websocket,
            connections: Arc::new(LiveConnections::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connections(&self) -> Arc<LiveConnections> {
        self.connections.clone()
    }

    /// Accept connections forever.
    pub async fn run(self) -> Result<(), ServerError> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves. Connections already
    /// open keep being served.
    pub async fn serve_with_shutdown(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        tokio::pin!(shutdown);
        loop {
            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutting down listener");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };

            let router = self.router.clone();
            let socket = self.socket.clone();
            let connections = self.connections.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, router, socket, connections).await {
                    tracing::warn!("Connection error from {}: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Arc<Router>,
    socket: SocketConfig,
    connections: Arc<LiveConnections>,
) -> Result<(), WsError> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let registration = connections.register(peer);
    let (mut sink, mut source) = ws.split();

    send(&mut sink, &router.greeting()).await?;

    let idle_limit = socket.ping_interval.saturating_add(socket.ping_timeout);
    let mut keepalive =
        tokio::time::interval_at(Instant::now() + socket.ping_interval, socket.ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            frame = source.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket error from {}: {}", peer, e);
                        break;
                    }
                    None => break,
                };
                last_seen = Instant::now();

                match frame {
                    WsMessage::Text(text) => {
                        registration.record_request();
                        // Handled to completion before the next frame is read.
                        if let Some(reply) = router.route(text.as_str()).await {
                            send(&mut sink, &reply).await?;
                        }
                    }
                    WsMessage::Binary(_) => {
                        let reply = Message::error(
                            None,
                            ErrorCode::BadRequest,
                            "binary frames are not supported",
                        );
                        send(&mut sink, &reply).await?;
                    }
                    WsMessage::Close(_) => break,
                    // Pings are answered by tungstenite; pongs only refresh last_seen.
                    _ => {}
                }
                // Pongs that queued up while a slow request ran are still unread.
                last_seen = Instant::now();
                keepalive.reset();
            }

            _ = keepalive.tick() => {
                if last_seen.elapsed() >= idle_limit {
                    tracing::warn!("Closing {}: silent for {:?}", peer, last_seen.elapsed());
                    break;
                }
                sink.send(WsMessage::Ping(Default::default())).await?;
            }
        }
    }

    // The peer may already be gone.
    let _ = sink.close().await;
    Ok(())
}

async fn send(sink: &mut WsSink, message: &Message) -> Result<(), WsError> {
    match encode(message) {
        Ok(text) => sink.send(WsMessage::Text(text.into())).await,
        Err(e) => {
            tracing::error!("Failed to encode {} message: {}", message.kind(), e);
            Ok(())
        }
    }
}
