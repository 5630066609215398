//! GET /ws upgrades to the fan-out socket protocol

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::IntoResponse,
};

use crate::hub::serve_socket;
use crate::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| serve_socket(socket, hub))
}
