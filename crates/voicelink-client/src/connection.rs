//! Connection manager: failover, request correlation and reconnect.

use crate::backoff::Backoff;
use crate::events::ClientEvent;
use crate::health::{self, Probe};
use crate::tracker::RequestTracker;
use crate::{ClientError, ConnectionStats, ConnectionStatus, Reply};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use voicelink_core::{
    decode_bounded, encode, now_millis, Audio, ClientConfig, ConnectionState, Endpoint, ErrorCode,
    InferenceRequest, Message, RequestData, ResponseData, SynthesisRequest, Turn, VoiceReply,
    VoiceRequest,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// Keeps one connection to the best available endpoint.
///
/// State machine:
///
/// ```text
/// disconnected -> connecting -> connected
/// connected -> reconnecting -> connecting -> connected
/// reconnecting -> failed            (retry budget exhausted)
/// failed -> connecting              (explicit connect() only)
/// ```
///
/// Dropping the manager stops its background tasks.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

/// The open socket's write half, tagged with the epoch it belongs to.
struct Link {
    epoch: u64,
    sink: WsSink,
}

/// Which connection is current and which tasks serve it.
///
/// `epoch` changes whenever a connection is installed, lost or torn down, so
/// tasks belonging to an older connection can tell they are stale.
#[derive(Default)]
struct Lifecycle {
    epoch: u64,
    endpoint: Option<Endpoint>,
    reader: Option<JoinHandle<()>>,
    health: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Lifecycle {
    fn take_tasks(&mut self) -> [Option<JoinHandle<()>>; 3] {
        [self.reader.take(), self.health.take(), self.reconnect.take()]
    }
}

pub(crate) struct Shared {
    config: ClientConfig,
    backoff: Backoff,
    state: watch::Sender<ConnectionState>,
    lifecycle: Mutex<Lifecycle>,
    link: tokio::sync::Mutex<Option<Link>>,
    tracker: Mutex<RequestTracker>,
    stats: Mutex<ConnectionStats>,
    events: broadcast::Sender<ClientEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn abort_all(tasks: impl IntoIterator<Item = Option<JoinHandle<()>>>) {
    for task in tasks.into_iter().flatten() {
        task.abort();
    }
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                backoff: Backoff::from_config(&config.retry),
                config,
                state,
                lifecycle: Mutex::new(Lifecycle::default()),
                link: tokio::sync::Mutex::new(None),
                tracker: Mutex::new(RequestTracker::default()),
                stats: Mutex::new(ConnectionStats::default()),
                events,
            }),
        }
    }

    /// Connect to the first reachable endpoint, in priority order.
    ///
    /// Returns true at once if already connected. An explicit connect
    /// supersedes a reconnect in progress and is the only way out of
    /// `Failed`.
    pub async fn connect(&self) -> bool {
        let shared = &self.shared;
        let epoch = {
            let mut lc = lock(&shared.lifecycle);
            if shared.state() == ConnectionState::Connected {
                return true;
            }
            lc.epoch += 1;
            if let Some(task) = lc.reconnect.take() {
                task.abort();
            }
            shared.state.send_replace(ConnectionState::Connecting);
            lc.epoch
        };

        match shared.try_endpoints().await {
            Ok((endpoint, ws)) => shared.install(epoch, endpoint, ws).await,
            Err(e) => {
                let lc = lock(&shared.lifecycle);
                if lc.epoch == epoch {
                    shared.state.send_replace(ConnectionState::Disconnected);
                }
                tracing::error!("All endpoints failed, last error: {}", e);
                false
            }
        }
    }

    /// Tear the connection down and cancel everything waiting on it.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        let tasks = {
            let mut lc = lock(&shared.lifecycle);
            lc.epoch += 1;
            lc.endpoint = None;
            shared.state.send_replace(ConnectionState::Disconnected);
            lc.take_tasks()
        };
        abort_all(tasks);

        let link = shared.link.lock().await.take();
        if let Some(link) = link {
            shared.close_sink(link.sink).await;
        }
        let cancelled = lock(&shared.tracker).fail_all(ClientError::Cancelled);
        tracing::info!("Disconnected ({} pending requests cancelled)", cancelled);
        shared.emit(ClientEvent::Disconnected);
    }

    /// Send a request and wait for its response.
    ///
    /// The timeout is a hard deadline for this request only; a timeout says
    /// nothing about the health of the connection.
    pub async fn send_request(
        &self,
        data: RequestData,
        timeout: Duration,
    ) -> Result<Reply, ClientError> {
        let shared = &self.shared;
        if shared.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }

        let ticket = lock(&shared.tracker).register(timeout);
        let kind = data.kind();
        let text = match encode(&Message::request(ticket.id.clone(), data)) {
            Ok(text) => text,
            Err(e) => {
                lock(&shared.tracker).forget(&ticket.id);
                return Err(ClientError::Encode(e.to_string()));
            }
        };

        if let Err(e) = shared.send_text(text).await {
            lock(&shared.tracker).forget(&ticket.id);
            shared.update_stats(|s| s.requests_failed += 1);
            return Err(e);
        }
        shared.update_stats(|s| s.requests_sent += 1);
        tracing::debug!("Sent {} request {}", kind, ticket.id);

        let answer = match ticket.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, ticket.slot).await,
            None => Ok(ticket.slot.await),
        };
        let outcome = match answer {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClientError::Cancelled),
            Err(_) => {
                lock(&shared.tracker).forget(&ticket.id);
                tracing::warn!("Request {} timed out after {:?}", ticket.id, timeout);
                Err(ClientError::RequestTimeout(ticket.id))
            }
        };
        match &outcome {
            Ok(_) => shared.update_stats(|s| s.requests_succeeded += 1),
            Err(_) => shared.update_stats(|s| s.requests_failed += 1),
        }
        outcome
    }

    /// Ask the language model, filling in defaults from the request config.
    pub async fn infer(
        &self,
        prompt: impl Into<String>,
        history: Vec<Turn>,
    ) -> Result<String, ClientError> {
        let defaults = &self.shared.config.request;
        let request = InferenceRequest {
            prompt: prompt.into(),
            system_prompt: Some(defaults.default_system_prompt.clone()),
            conversation_history: history,
            max_tokens: Some(defaults.max_tokens),
            temperature: Some(defaults.temperature),
        };
        let reply = self
            .send_request(RequestData::Inference(request), defaults.request_timeout)
            .await?;
        Ok(reply.message)
    }

    /// Run a full voice turn: recognition, reply and synthesis.
    pub async fn voice_turn(&self, audio: Vec<u8>) -> Result<VoiceReply, ClientError> {
        let request = RequestData::Voice(VoiceRequest {
            audio_data: Audio(audio),
        });
        let reply = self
            .send_request(request, self.shared.config.request.request_timeout)
            .await?;
        match reply.data {
            Some(ResponseData::Voice(voice)) => Ok(voice),
            other => Err(ClientError::UnexpectedReply(format!(
                "expected voice reply, got {other:?}"
            ))),
        }
    }

    /// Synthesize speech and return the audio bytes.
    pub async fn synthesize(
        &self,
        text: impl Into<String>,
        voice_id: Option<String>,
    ) -> Result<Vec<u8>, ClientError> {
        let request = RequestData::Synthesis(SynthesisRequest {
            text: text.into(),
            voice_id,
        });
        let reply = self
            .send_request(request, self.shared.config.request.request_timeout)
            .await?;
        match reply.data {
            Some(ResponseData::Synthesis(synthesis)) => Ok(synthesis.audio_response.into_bytes()),
            other => Err(ClientError::UnexpectedReply(format!(
                "expected synthesis reply, got {other:?}"
            ))),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    pub fn current_endpoint(&self) -> Option<Endpoint> {
        lock(&self.shared.lifecycle).endpoint.clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        lock(&self.shared.stats).clone()
    }

    pub fn pending_requests(&self) -> usize {
        lock(&self.shared.tracker).len()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Everything an observer might want to log, in one serializable value.
    pub fn status(&self) -> ConnectionStatus {
        let state = self.state();
        ConnectionStatus {
            connected: state == ConnectionState::Connected,
            state,
            endpoint: self.current_endpoint(),
            stats: self.stats(),
            pending_requests: lock(&self.shared.tracker).ids(),
            timestamp: now_millis(),
        }
    }

    /// Write an envelope as is. Nothing correlates a reply to it.
    pub async fn send_raw(&self, message: &Message) -> Result<(), ClientError> {
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let text = encode(message).map_err(|e| ClientError::Encode(e.to_string()))?;
        self.shared.send_text(text).await
    }

    /// Send one ping outside the health check schedule. False if it could
    /// not be written.
    pub async fn ping(&self) -> bool {
        match self.send_raw(&Message::ping()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Ping not sent: {}", e);
                false
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let mut lc = lock(&self.shared.lifecycle);
        lc.epoch += 1;
        abort_all(lc.take_tasks());
    }
}

impl Shared {
    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn emit(&self, event: ClientEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn update_stats(&self, f: impl FnOnce(&mut ConnectionStats)) {
        f(&mut lock(&self.stats));
    }

    /// Try each enabled endpoint in priority order.
    async fn try_endpoints(&self) -> Result<(Endpoint, WsStream), String> {
        let endpoints = self.config.endpoints();
        if endpoints.is_empty() {
            let error = "no enabled endpoints".to_string();
            self.update_stats(|s| s.last_error = Some(error.clone()));
            return Err(error);
        }

        let mut last_error = String::new();
        for endpoint in endpoints {
            let timeout = self.config.connect_timeout(&endpoint);
            tracing::info!("Connecting to {} ({})", endpoint.name, endpoint.url);
            self.update_stats(|s| s.attempts += 1);

            let handshake = tokio_tungstenite::connect_async(endpoint.url.as_str());
            let error = match tokio::time::timeout(timeout, handshake).await {
                Ok(Ok((ws, _))) => {
                    self.update_stats(|s| s.successes += 1);
                    return Ok((endpoint, ws));
                }
                Ok(Err(e)) => format!("{}: {}", endpoint.url, e),
                Err(_) => format!("{}: handshake timed out after {:?}", endpoint.url, timeout),
            };
            tracing::warn!("Failed to connect to {}: {}", endpoint.name, error);
            self.update_stats(|s| {
                s.failures += 1;
                s.last_error = Some(error.clone());
            });
            last_error = error;
        }
        Err(last_error)
    }

    /// Make a freshly opened socket the current connection, unless the
    /// lifecycle moved on (`expected` epoch changed) while it was opening.
    async fn install(self: &Arc<Self>, expected: u64, endpoint: Endpoint, ws: WsStream) -> bool {
        let (sink, source) = ws.split();
        let mut link = self.link.lock().await;

        let stale = {
            let mut lc = lock(&self.lifecycle);
            if lc.epoch != expected {
                Some(sink)
            } else {
                lc.epoch += 1;
                let epoch = lc.epoch;
                // The reconnect task may be the caller; detach it instead.
                lc.reconnect = None;
                abort_all([lc.reader.take(), lc.health.take()]);

                let probe = Arc::new(Probe::default());
                let reader = self.clone().receive_loop(epoch, source, probe.clone());
                lc.reader = Some(tokio::spawn(reader));
                if self.config.health_check.enabled {
                    lc.health = Some(tokio::spawn(health::run(self.clone(), epoch, probe)));
                }
                lc.endpoint = Some(endpoint.clone());
                *link = Some(Link { epoch, sink });
                self.state.send_replace(ConnectionState::Connected);
                None
            }
        };
        drop(link);

        if let Some(sink) = stale {
            tracing::debug!("Discarding connection to {}, superseded", endpoint.url);
            self.close_sink(sink).await;
            return false;
        }
        tracing::info!("Connected to {} ({})", endpoint.name, endpoint.url);
        self.emit(ClientEvent::Connected { endpoint });
        true
    }

    async fn close_sink(&self, mut sink: WsSink) {
        let grace = self.config.websocket.ping_timeout;
        if tokio::time::timeout(grace, sink.close()).await.is_err() {
            tracing::debug!("Close handshake did not finish within {:?}", grace);
        }
    }

    /// Write on whatever connection is current.
    async fn send_text(self: &Arc<Self>, text: String) -> Result<(), ClientError> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(ClientError::NotConnected)?;
        if let Err(e) = link.sink.send(WsMessage::Text(text.into())).await {
            let epoch = link.epoch;
            drop(guard);
            self.link_lost(epoch, format!("send failed: {e}"));
            return Err(ClientError::Transport(e.to_string()));
        }
        Ok(())
    }

    /// Write only if `epoch` is still the current connection.
    pub(crate) async fn send_on(&self, epoch: u64, message: &Message) -> Result<(), ClientError> {
        let text = encode(message).map_err(|e| ClientError::Encode(e.to_string()))?;
        let mut guard = self.link.lock().await;
        match guard.as_mut() {
            Some(link) if link.epoch == epoch => link
                .sink
                .send(WsMessage::Text(text.into()))
                .await
                .map_err(|e| ClientError::Transport(e.to_string())),
            _ => Err(ClientError::NotConnected),
        }
    }

    async fn receive_loop(self: Arc<Self>, epoch: u64, mut source: WsSource, probe: Arc<Probe>) {
        let limit = self.config.websocket.max_message_size;
        let reason = loop {
            let frame = match source.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => break e.to_string(),
                None => break "connection closed".to_string(),
            };
            match frame {
                WsMessage::Text(text) => match decode_bounded(text.as_str(), limit) {
                    Ok(message) => self.dispatch(epoch, message, &probe).await,
                    Err(e) => {
                        tracing::warn!("Undecodable message from server: {}", e);
                        self.emit(ClientEvent::DecodeError { error: e.to_string() });
                    }
                },
                WsMessage::Close(frame) => {
                    break match frame {
                        Some(frame) => format!("closed by server: {} {}", frame.code, frame.reason),
                        None => "closed by server".to_string(),
                    };
                }
                // Binary frames are not part of the protocol; control frames
                // are answered by tungstenite.
                _ => {}
            }
        };
        tracing::info!("Receive loop ended: {}", reason);
        self.link_lost(epoch, reason);
    }

    async fn dispatch(&self, epoch: u64, message: Message, probe: &Probe) {
        match message {
            Message::Response {
                request_id,
                message,
                data,
                timestamp,
            } => {
                let reply = Reply {
                    request_id: request_id.clone(),
                    message,
                    data,
                    timestamp,
                };
                if !lock(&self.tracker).resolve(&request_id, Ok(reply)) {
                    tracing::debug!("Response for unknown or expired request {}", request_id);
                }
            }
            Message::Error {
                request_id: Some(request_id),
                error,
                code,
                ..
            } => {
                let remote = ClientError::Remote {
                    code: code.unwrap_or(ErrorCode::Unknown),
                    message: error.clone(),
                };
                if !lock(&self.tracker).resolve(&request_id, Err(remote)) {
                    tracing::warn!("Server error for unknown request {}: {}", request_id, error);
                    self.emit(ClientEvent::ServerError { code, message: error });
                }
            }
            Message::Error {
                request_id: None,
                error,
                code,
                ..
            } => {
                tracing::warn!("Server error: {}", error);
                self.emit(ClientEvent::ServerError { code, message: error });
            }
            Message::Pong { .. } => probe.pong(),
            Message::Ping { .. } => {
                if let Err(e) = self.send_on(epoch, &Message::pong()).await {
                    tracing::debug!("Could not answer server ping: {}", e);
                }
            }
            Message::Status { message, data, .. } => {
                tracing::debug!("Server status: {}", message);
                self.emit(ClientEvent::Status { message, info: data });
            }
            Message::Request { request_id, .. } => {
                tracing::warn!("Ignoring request {} sent by the server", request_id);
            }
        }
    }

    /// The connection of `epoch` is gone. Starts the one reconnect sequence
    /// for it; later reports for the same epoch are ignored.
    pub(crate) fn link_lost(self: &Arc<Self>, epoch: u64, reason: String) {
        let stale = {
            let mut lc = lock(&self.lifecycle);
            if lc.epoch != epoch || self.state() != ConnectionState::Connected {
                return;
            }
            lc.epoch += 1;
            let next = lc.epoch;
            lc.endpoint = None;
            self.state.send_replace(ConnectionState::Reconnecting);
            tracing::warn!("Connection lost ({}), reconnecting", reason);
            self.update_stats(|s| s.last_error = Some(reason.clone()));
            self.emit(ClientEvent::LinkLost { reason });

            let stale = [lc.reader.take(), lc.health.take()];
            lc.reconnect = Some(tokio::spawn(self.clone().reconnect_loop(next)));
            stale
        };
        abort_all(stale);

        let failed = lock(&self.tracker).fail_all(ClientError::Transport("connection lost".into()));
        if failed > 0 {
            tracing::warn!("{} pending requests failed with the lost connection", failed);
        }
    }

    async fn reconnect_loop(self: Arc<Self>, epoch: u64) {
        let old = {
            let mut guard = self.link.lock().await;
            match guard.as_ref() {
                Some(link) if link.epoch < epoch => guard.take(),
                _ => None,
            }
        };
        if let Some(link) = old {
            self.close_sink(link.sink).await;
        }

        let max = self.config.retry.max_retries;
        for attempt in 1..=max {
            if !self.set_state_if(epoch, ConnectionState::Connecting) {
                return;
            }
            tracing::info!("Reconnect attempt {}/{}", attempt, max);
            self.emit(ClientEvent::ReconnectAttempt { attempt, max });

            match self.try_endpoints().await {
                Ok((endpoint, ws)) => {
                    if self.install(epoch, endpoint, ws).await {
                        tracing::info!("Reconnected after {} attempts", attempt);
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
                    if !self.set_state_if(epoch, ConnectionState::Reconnecting) {
                        return;
                    }
                }
            }

            if attempt < max {
                let delay = self.backoff.delay(attempt);
                tracing::debug!("Next reconnect attempt in {:?}", delay);
                tokio::time::sleep(delay).await;
            }
        }

        {
            let mut lc = lock(&self.lifecycle);
            if lc.epoch != epoch {
                return;
            }
            lc.reconnect = None;
            self.state.send_replace(ConnectionState::Failed);
        }
        tracing::error!("Giving up after {} reconnect attempts", max);
        self.emit(ClientEvent::Failed);
    }

    /// Transition only while `epoch` is current. Returns false when stale.
    fn set_state_if(&self, epoch: u64, state: ConnectionState) -> bool {
        let lc = lock(&self.lifecycle);
        if lc.epoch != epoch {
            return false;
        }
        self.state.send_replace(state);
        true
    }
}
