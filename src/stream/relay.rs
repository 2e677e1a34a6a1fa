//! Websocket relay between streaming clients and streaming backends
//!
//! Each client connection gets a session entry; a backend pump task connects
//! outward, authenticates, forwards the request, and relays `reply` frames
//! back through the session until a `finish` or `error` frame closes it.
//! Backend connection loss triggers reconnection with capped backoff for as
//! long as the client session is alive.

use axum::extract::ws::{Message as ClientMessage, WebSocket};
use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as BackendMessage;
use tracing::{debug, error, info, warn};

use crate::auth::Identity;
use crate::dispatch::DispatchRequest;
use crate::registry::{Endpoint, EndpointRegistry};
use crate::stream::{resolve_stream_target, StreamKind};
use crate::utils::errors::DispatchError;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// One frame on either leg of the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum RelayEvent {
    /// Backend authentication, sent once per backend connection.
    Connect(Value),
    /// The dispatch payload, forwarded to the backend.
    Response(Value),
    /// One generated chunk, relayed to the client.
    Reply(Value),
    /// Terminal frame: generation completed.
    Finish(Value),
    /// Terminal frame: generation failed.
    Error(Value),
}

impl RelayEvent {
    fn is_terminal(&self) -> bool {
        matches!(self, RelayEvent::Finish(_) | RelayEvent::Error(_))
    }
}

/// Relays streaming sessions between clients and backends.
pub struct StreamRelay {
    registry: Arc<dyn EndpointRegistry>,
    sessions: RwLock<HashMap<u64, mpsc::UnboundedSender<RelayEvent>>>,
    next_session_id: AtomicU64,
}

impl StreamRelay {
    pub fn new(registry: Arc<dyn EndpointRegistry>) -> Self {
        StreamRelay {
            registry,
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Drive one client websocket to completion. The first text frame must
    /// carry the dispatch payload.
    pub async fn run(self: Arc<Self>, socket: WebSocket, identity: Identity) {
        let (mut client_tx, mut client_rx) = socket.split();

        let request = loop {
            match client_rx.next().await {
                Some(Ok(ClientMessage::Text(text))) => {
                    match serde_json::from_str::<DispatchRequest>(&text) {
                        Ok(request) => break request,
                        Err(e) => {
                            let _ = send_error(&mut client_tx, &format!("Invalid payload: {}", e))
                                .await;
                            return;
                        }
                    }
                }
                Some(Ok(ClientMessage::Close(_))) | None => return,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("Client websocket error before payload: {}", e);
                    return;
                }
            }
        };

        let target = match self.resolve_target(&request) {
            Ok(target) => target,
            Err(e) => {
                let _ = send_error(&mut client_tx, &e.to_string()).await;
                return;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session_id = self.register(tx).await;
        info!(
            "Stream session {} opened to {} by {}",
            session_id,
            target.display_name(),
            identity.log_label()
        );

        let payload = match serde_json::to_value(&request) {
            Ok(payload) => payload,
            Err(e) => {
                let _ = send_error(&mut client_tx, &e.to_string()).await;
                self.remove(session_id).await;
                return;
            }
        };
        let pump = {
            let relay = self.clone();
            let target = target.clone();
            tokio::spawn(async move { relay.pump_backend(session_id, target, payload).await })
        };

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        let terminal = event.is_terminal();
                        let frame = match serde_json::to_string(&event) {
                            Ok(frame) => frame,
                            Err(e) => {
                                error!("Session {}: frame encoding failed: {}", session_id, e);
                                break;
                            }
                        };
                        if client_tx.send(ClientMessage::Text(frame)).await.is_err() {
                            break;
                        }
                        if terminal {
                            break;
                        }
                    }
                    None => break,
                },
                msg = client_rx.next() => match msg {
                    Some(Ok(ClientMessage::Close(_))) | None => {
                        debug!("Session {}: client disconnected", session_id);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Session {}: client websocket error: {}", session_id, e);
                        break;
                    }
                },
            }
        }

        pump.abort();
        self.remove(session_id).await;
        info!("Stream session {} closed", session_id);
    }

    fn resolve_target(&self, request: &DispatchRequest) -> Result<Endpoint, DispatchError> {
        resolve_stream_target(
            self.registry.as_ref(),
            request.llm_name.as_deref(),
            request.capability(),
            StreamKind::Socket,
        )
    }

    /// Connect to the backend and relay its frames into the session. Keeps
    /// reconnecting with capped backoff while the session is alive.
    async fn pump_backend(&self, session_id: u64, llm: Endpoint, payload: Value) {
        let mut delay = INITIAL_RECONNECT_DELAY;

        loop {
            match connect_async(llm.stream_url.as_str()).await {
                Ok((mut backend, _)) => {
                    delay = INITIAL_RECONNECT_DELAY;
                    debug!(
                        "Session {}: connected to {}",
                        session_id,
                        llm.display_name()
                    );

                    let connect = RelayEvent::Connect(json!({
                        "username": llm.username,
                        "password": llm.password,
                    }));
                    let opened = send_backend(&mut backend, &connect).await.is_ok()
                        && send_backend(&mut backend, &RelayEvent::Response(payload.clone()))
                            .await
                            .is_ok();

                    if opened {
                        while let Some(msg) = backend.next().await {
                            match msg {
                                Ok(BackendMessage::Text(text)) => {
                                    let event = match serde_json::from_str::<RelayEvent>(&text) {
                                        Ok(event) => event,
                                        Err(e) => {
                                            warn!(
                                                "Session {}: unrecognized backend frame: {}",
                                                session_id, e
                                            );
                                            continue;
                                        }
                                    };
                                    let terminal = event.is_terminal();
                                    if !self.forward(session_id, event).await {
                                        return;
                                    }
                                    if terminal {
                                        self.remove(session_id).await;
                                        return;
                                    }
                                }
                                Ok(BackendMessage::Close(_)) => break,
                                Ok(_) => {}
                                Err(e) => {
                                    warn!("Session {}: backend error: {}", session_id, e);
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "Session {}: connection to {} failed: {}, retrying in {:?}",
                        session_id,
                        llm.display_name(),
                        e,
                        delay
                    );
                }
            }

            if !self.session_alive(session_id).await {
                return;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
        }
    }

    async fn register(&self, tx: mpsc::UnboundedSender<RelayEvent>) -> u64 {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.write().await.insert(session_id, tx);
        session_id
    }

    async fn remove(&self, session_id: u64) {
        self.sessions.write().await.remove(&session_id);
    }

    async fn session_alive(&self, session_id: u64) -> bool {
        self.sessions.read().await.contains_key(&session_id)
    }

    /// Forward an event into the session. Returns false when the session is
    /// gone, which tells the pump to stop.
    async fn forward(&self, session_id: u64, event: RelayEvent) -> bool {
        match self.sessions.read().await.get(&session_id) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

async fn send_backend(
    backend: &mut (impl Sink<BackendMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    event: &RelayEvent,
) -> Result<(), DispatchError> {
    let frame =
        serde_json::to_string(event).map_err(|e| DispatchError::InvalidPayload(e.to_string()))?;
    backend
        .send(BackendMessage::Text(frame))
        .await
        .map_err(|e| DispatchError::InvalidPayload(e.to_string()))
}

async fn send_error(
    client: &mut (impl Sink<ClientMessage, Error = axum::Error> + Unpin),
    message: &str,
) -> Result<(), axum::Error> {
    let event = RelayEvent::Error(Value::String(message.to_string()));
    match serde_json::to_string(&event) {
        Ok(frame) => client.send(ClientMessage::Text(frame)).await,
        Err(_) => Ok(()),
    }
}
