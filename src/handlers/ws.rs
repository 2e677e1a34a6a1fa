//! Websocket upgrade for the streaming relay

use axum::{
    extract::{State, WebSocketUpgrade},
    http::HeaderMap,
    response::Response,
};
use std::sync::Arc;

use super::AppState;
use crate::auth::Identity;

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = Identity::from_headers(&headers);
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| relay.run(socket, identity))
}
