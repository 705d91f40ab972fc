//! WebSocket query streaming.
//!
//! The client sends one JSON query request; the server streams tagged
//! [`AgentEvent`] messages (`start`, `iteration`, `thinking`, `stream`,
//! `response_complete`, `state`, `action`, `result`, and a terminal
//! `final`/`timeout`/`error`) and then closes. A client disconnect aborts
//! the in-flight query best-effort.

use crate::agent::AgentEvent;
use crate::gateway::{AppState, QueryRequest};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use tracing::{debug, warn};

pub async fn ws_query_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    // First text frame is the query request.
    let request = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<QueryRequest>(&text) {
                Ok(request) => break request,
                Err(e) => {
                    let err = serde_json::json!({
                        "type": "error",
                        "error": format!("invalid query request: {e}"),
                        "error_type": "invalid_input",
                    });
                    let _ = socket.send(Message::Text(err.to_string().into())).await;
                    return;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
            Some(Ok(_)) => continue,
        }
    };

    let Some(question) = request.question() else {
        let err = serde_json::json!({
            "type": "error",
            "error": "missing 'question' parameter",
            "error_type": "invalid_input",
        });
        let _ = socket.send(Message::Text(err.to_string().into())).await;
        return;
    };

    let opts = request.options(&state.config.agent);
    let (tx, mut rx) = tokio::sync::mpsc::channel::<AgentEvent>(64);

    let worker = {
        let state = state.clone();
        let question = question.clone();
        tokio::spawn(async move {
            let agent = state.agent_loop();
            agent.process(&question, &opts, Some(tx)).await
        })
    };

    // Forward events until the loop finishes (channel closes) or the client
    // goes away.
    while let Some(event) = rx.recv().await {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("ws: cannot serialise event: {e}");
                continue;
            }
        };
        if socket.send(Message::Text(payload.into())).await.is_err() {
            debug!("ws client disconnected; aborting query");
            worker.abort();
            return;
        }
    }

    let _ = worker.await;
    let _ = socket.send(Message::Close(None)).await;
}
