//! Connection manager against stub WebSocket servers.

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use voicelink_client::{ClientError, ClientEvent, ConnectionManager};
use voicelink_core::{
    decode, encode, ClientConfig, ConnectionState, Endpoint, ErrorCode, InferenceRequest, Message,
    RequestData, RequestId,
};

type Socket = WebSocketStream<TcpStream>;

/// Serve every accepted connection with `serve`. Returns the ws:// url.
async fn stub<F, Fut>(serve: F) -> String
where
    F: Fn(Socket) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let serve = Arc::new(serve);
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let serve = serve.clone();
            tokio::spawn(async move {
                if let Ok(ws) = tokio_tungstenite::accept_async(tcp).await {
                    serve(ws).await;
                }
            });
        }
    });
    url
}

/// An address nothing listens on.
async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);
    url
}

async fn recv(ws: &mut Socket) -> Option<Message> {
    while let Some(Ok(frame)) = ws.next().await {
        if let WsMessage::Text(text) = frame {
            return decode(text.as_str()).ok();
        }
    }
    None
}

async fn send(ws: &mut Socket, message: &Message) {
    let text = encode(message).unwrap();
    ws.send(WsMessage::Text(text.into())).await.unwrap();
}

fn prompt_of(message: &Message) -> Option<(RequestId, String)> {
    match message {
        Message::Request {
            request_id,
            data: RequestData::Inference(req),
            ..
        } => Some((request_id.clone(), req.prompt.clone())),
        _ => None,
    }
}

/// Answers inference requests with the prompt and pings with pongs.
async fn echo(mut ws: Socket) {
    while let Some(message) = recv(&mut ws).await {
        match message {
            Message::Ping { .. } => send(&mut ws, &Message::pong()).await,
            other => {
                if let Some((id, prompt)) = prompt_of(&other) {
                    send(&mut ws, &Message::response(id, prompt, None)).await;
                }
            }
        }
    }
}

/// Reads everything, answers nothing.
async fn silent(mut ws: Socket) {
    while recv(&mut ws).await.is_some() {}
}

fn config(endpoints: Vec<Endpoint>) -> ClientConfig {
    let mut config = ClientConfig::with_endpoints(endpoints);
    config.websocket.timeout = Duration::from_secs(2);
    config.retry.retry_interval = Duration::from_millis(20);
    config.retry.max_retry_interval = Duration::from_millis(100);
    config.retry.max_retries = 3;
    config
}

fn inference(prompt: &str) -> RequestData {
    RequestData::Inference(InferenceRequest::new(prompt))
}

async fn next_event(events: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed");
        if !matches!(event, ClientEvent::Status { .. }) {
            return event;
        }
    }
}

#[tokio::test]
async fn fails_over_to_next_priority() {
    let url = stub(echo).await;
    let manager = ConnectionManager::new(config(vec![
        Endpoint::new(url.clone(), "backup", 2),
        Endpoint::new(dead_url().await, "primary", 1),
    ]));

    assert!(manager.connect().await);
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.current_endpoint().unwrap().name, "backup");

    let stats = manager.stats();
    assert_eq!(stats.attempts, 2);
    assert_eq!(stats.successes, 1);
    assert_eq!(stats.failures, 1);
    assert!(stats.last_error.is_some());
}

#[tokio::test]
async fn connect_is_idempotent() {
    let url = stub(echo).await;
    let manager = ConnectionManager::new(config(vec![Endpoint::new(url, "only", 1)]));

    assert!(manager.connect().await);
    assert!(manager.connect().await);
    assert_eq!(manager.stats().attempts, 1);
}

#[tokio::test]
async fn all_endpoints_down() {
    let manager = ConnectionManager::new(config(vec![
        Endpoint::new(dead_url().await, "a", 1),
        Endpoint::new(dead_url().await, "b", 2),
    ]));

    assert!(!manager.connect().await);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.current_endpoint().is_none());
    assert_eq!(manager.stats().failures, 2);
}

#[tokio::test]
async fn disabled_endpoints_are_skipped() {
    let url = stub(echo).await;
    let manager = ConnectionManager::new(config(vec![Endpoint::new(url, "off", 1).disabled()]));

    assert!(!manager.connect().await);
    assert_eq!(manager.stats().attempts, 0);
}

#[tokio::test]
async fn request_before_connect_is_rejected() {
    let manager = ConnectionManager::new(config(vec![Endpoint::new(dead_url().await, "a", 1)]));
    let result = manager.send_request(inference("hi"), Duration::from_secs(1)).await;
    assert_eq!(result, Err(ClientError::NotConnected));
    assert_eq!(manager.pending_requests(), 0);
}

#[tokio::test]
async fn responses_reach_their_own_callers() {
    // Collects two requests, then answers them in reverse order.
    let url = stub(|mut ws: Socket| async move {
        let mut held = Vec::new();
        while held.len() < 2 {
            match recv(&mut ws).await {
                Some(message) => held.extend(prompt_of(&message)),
                None => return,
            }
        }
        for (id, prompt) in held.into_iter().rev() {
            send(&mut ws, &Message::response(id, format!("re: {prompt}"), None)).await;
        }
        silent(ws).await;
    })
    .await;
    let manager = Arc::new(ConnectionManager::new(config(vec![Endpoint::new(url, "s", 1)])));
    assert!(manager.connect().await);

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .send_request(inference("one"), Duration::from_secs(5))
                .await
        })
    };
    let second = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .send_request(inference("two"), Duration::from_secs(5))
                .await
        })
    };

    assert_eq!(first.await.unwrap().unwrap().message, "re: one");
    assert_eq!(second.await.unwrap().unwrap().message, "re: two");
    assert_eq!(manager.pending_requests(), 0);
    assert_eq!(manager.stats().requests_succeeded, 2);
}

#[tokio::test]
async fn infer_returns_reply_text() {
    let url = stub(echo).await;
    let manager = ConnectionManager::new(config(vec![Endpoint::new(url, "s", 1)]));
    assert!(manager.connect().await);

    let answer = manager.infer("hi there", Vec::new()).await.unwrap();
    assert_eq!(answer, "hi there");
}

#[tokio::test]
async fn error_envelope_fails_only_its_request() {
    let url = stub(|mut ws: Socket| async move {
        while let Some(message) = recv(&mut ws).await {
            if let Some((id, prompt)) = prompt_of(&message) {
                let reply = if prompt == "bad" {
                    Message::error(Some(id), ErrorCode::HandlerFailed, "model exploded")
                } else {
                    Message::response(id, "fine".into(), None)
                };
                send(&mut ws, &reply).await;
            }
        }
    })
    .await;
    let manager = ConnectionManager::new(config(vec![Endpoint::new(url, "s", 1)]));
    assert!(manager.connect().await);

    let failed = manager.send_request(inference("bad"), Duration::from_secs(5)).await;
    assert_eq!(
        failed,
        Err(ClientError::Remote {
            code: ErrorCode::HandlerFailed,
            message: "model exploded".into(),
        })
    );
    let ok = manager.send_request(inference("good"), Duration::from_secs(5)).await;
    assert_eq!(ok.unwrap().message, "fine");
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn timeout_leaves_no_pending_entry() {
    let url = stub(silent).await;
    let manager = ConnectionManager::new(config(vec![Endpoint::new(url, "s", 1)]));
    assert!(manager.connect().await);

    let result = manager.send_request(inference("hello?"), Duration::from_millis(100)).await;
    assert!(matches!(result, Err(ClientError::RequestTimeout(_))), "{result:?}");
    assert_eq!(manager.pending_requests(), 0);
    // One slow answer says nothing about the link.
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.stats().requests_failed, 1);
}

#[tokio::test]
async fn disconnect_cancels_pending_requests() {
    let url = stub(silent).await;
    let manager = Arc::new(ConnectionManager::new(config(vec![Endpoint::new(url, "s", 1)])));
    assert!(manager.connect().await);
    let mut events = manager.subscribe();

    let waiting = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .send_request(inference("wait"), Duration::from_secs(30))
                .await
        })
    };
    while manager.pending_requests() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    manager.disconnect().await;
    assert_eq!(waiting.await.unwrap(), Err(ClientError::Cancelled));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(manager.pending_requests(), 0);
    assert_eq!(next_event(&mut events).await, ClientEvent::Disconnected);
}

#[tokio::test]
async fn reconnects_after_server_drops_link() {
    // The first connection is dropped on its first request; later ones echo.
    let accepted = Arc::new(AtomicUsize::new(0));
    let url = {
        let accepted = accepted.clone();
        stub(move |mut ws: Socket| {
            let n = accepted.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    let _ = recv(&mut ws).await;
                    drop(ws);
                } else {
                    echo(ws).await;
                }
            }
        })
        .await
    };
    let manager = ConnectionManager::new(config(vec![Endpoint::new(url, "s", 1)]));
    let mut events = manager.subscribe();
    assert!(manager.connect().await);
    assert!(matches!(next_event(&mut events).await, ClientEvent::Connected { .. }));

    let lost = manager.send_request(inference("doomed"), Duration::from_secs(10)).await;
    assert_eq!(lost, Err(ClientError::Transport("connection lost".into())));

    assert!(matches!(next_event(&mut events).await, ClientEvent::LinkLost { .. }));
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::ReconnectAttempt { attempt: 1, max: 3 }
    );
    assert!(matches!(next_event(&mut events).await, ClientEvent::Connected { .. }));
    assert_eq!(manager.state(), ConnectionState::Connected);

    let answer = manager.infer("again", Vec::new()).await.unwrap();
    assert_eq!(answer, "again");
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn silent_server_triggers_one_reconnect_then_fails() {
    // Accepts a single connection that never answers pings, then stops
    // listening so every reconnect attempt is refused.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        drop(listener);
        let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        silent(ws).await;
    });

    let mut config = config(vec![Endpoint::new(url, "s", 1)]);
    config.health_check.interval = Duration::from_millis(50);
    config.health_check.timeout = Duration::from_millis(20);
    config.health_check.max_failures = 2;
    config.retry.max_retries = 2;
    let manager = ConnectionManager::new(config);
    let mut events = manager.subscribe();
    assert!(manager.connect().await);

    let mut seen = Vec::new();
    loop {
        let event = next_event(&mut events).await;
        let done = event == ClientEvent::Failed;
        seen.push(event);
        if done {
            break;
        }
    }

    let lost = seen.iter().filter(|e| matches!(e, ClientEvent::LinkLost { .. })).count();
    let attempts = seen
        .iter()
        .filter(|e| matches!(e, ClientEvent::ReconnectAttempt { .. }))
        .count();
    assert_eq!(lost, 1, "{seen:?}");
    assert_eq!(attempts, 2, "{seen:?}");
    assert_eq!(manager.state(), ConnectionState::Failed);
    assert!(manager.current_endpoint().is_none());
}

#[tokio::test]
async fn explicit_connect_leaves_failed_state() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://{addr}");
    let first = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        drop(listener);
        let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        drop(ws);
    });

    let mut config = config(vec![Endpoint::new(url, "s", 1)]);
    config.retry.max_retries = 1;
    let manager = ConnectionManager::new(config);
    let mut state = manager.watch_state();
    assert!(manager.connect().await);
    first.await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == ConnectionState::Failed))
        .await
        .expect("never reached failed")
        .unwrap();

    // Same port, new server.
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        echo(ws).await;
    });
    assert!(manager.connect().await);
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn ping_and_raw_envelopes_reach_the_server() {
    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    let url = stub(move |mut ws: Socket| {
        let seen_tx = seen_tx.clone();
        async move {
            while let Some(message) = recv(&mut ws).await {
                let _ = seen_tx.send(message.kind());
            }
        }
    })
    .await;
    let manager = ConnectionManager::new(config(vec![Endpoint::new(url, "s", 1)]));
    assert!(!manager.ping().await);
    assert_eq!(
        manager.send_raw(&Message::pong()).await,
        Err(ClientError::NotConnected)
    );

    assert!(manager.connect().await);
    assert!(manager.ping().await);
    manager.send_raw(&Message::status("hello", None)).await.unwrap();

    let mut kinds = Vec::new();
    for _ in 0..2 {
        let kind = tokio::time::timeout(Duration::from_secs(5), seen.recv()).await.unwrap();
        kinds.push(kind.unwrap());
    }
    assert_eq!(kinds, ["ping", "status"]);
    assert_eq!(manager.stats().requests_sent, 0);
}

#[tokio::test]
async fn status_snapshot_lists_pending_requests() {
    let url = stub(silent).await;
    let manager = Arc::new(ConnectionManager::new(config(vec![Endpoint::new(url, "s", 1)])));
    assert!(!manager.status().connected);
    assert!(manager.connect().await);

    let waiting = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .send_request(inference("hold"), Duration::from_secs(30))
                .await
        })
    };
    for _ in 0..200 {
        if manager.pending_requests() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let status = manager.status();
    assert!(status.connected);
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.endpoint.as_ref().map(|e| e.name.as_str()), Some("s"));
    assert_eq!(status.stats.successes, 1);
    assert_eq!(status.pending_requests.len(), 1);

    let json: serde_json::Value = serde_json::from_str(&status.to_json().unwrap()).unwrap();
    assert_eq!(json["state"], "connected");
    assert_eq!(json["endpoint"]["name"], "s");
    assert_eq!(json["pending_requests"].as_array().unwrap().len(), 1);

    manager.disconnect().await;
    assert_eq!(waiting.await.unwrap(), Err(ClientError::Cancelled));
    assert!(manager.status().pending_requests.is_empty());
}
