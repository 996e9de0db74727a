//! ScopeInk WebSocket Relay Server
//!
//! Holds per-project document maps and streams changes to subscribers. This
//! is the real-time document store that `RelayDocumentStore` talks to.
//!
//! ## Protocol
//!
//! Messages are JSON text frames tagged by `type`:
//! ```json
//! { "type": "subscribe", "sub_id": 1, "prefix": "projects/p/shapes/" }
//! { "type": "write", "path": "projects/p/shapes/<id>", "value": { ... }, "op_id": "<uuid>" }
//! { "type": "snapshot", "sub_id": 1, "changes": [ ... ] }
//! { "type": "change", "path": "projects/p/shapes/<id>", "value": null, "op_id": "<uuid>" }
//! { "type": "ack", "op_id": "<uuid>", "duplicate": false }
//! ```
//!
//! Writes are idempotent per `(op_id, path)`. Applied writes are echoed to
//! every matching subscription, the writer's included.

mod hub;
mod session;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use hub::DocumentHub;
use scopeink_core::protocol::{ClientMessage, ServerMessage};
use session::Session;
use std::{env, net::SocketAddr, sync::Arc};
use tokio::sync::broadcast::error::RecvError;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_ADDR: &str = "0.0.0.0:3030";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scopeink_server=info,tower_http=info".into()),
        )
        .init();

    let addr: SocketAddr = env::var("SCOPEINK_ADDR")
        .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
        .parse()?;

    let state = Arc::new(DocumentHub::new());

    let app = Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("ScopeInk relay server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Index page
async fn index() -> &'static str {
    "ScopeInk Relay Server - Connect via WebSocket at /ws"
}

/// Health check
async fn health() -> &'static str {
    "ok"
}

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<DocumentHub>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

/// Serialize and send one message. Returns false once the socket is gone.
async fn send(sender: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode {:?}: {}", msg, e);
            true
        }
    }
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, hub: Arc<DocumentHub>) {
    let conn_id = Uuid::new_v4();
    info!("New connection: {}", conn_id);

    let (mut sender, mut receiver) = socket.split();
    // Subscribe before any snapshot is taken so no change falls in between.
    let mut changes = hub.subscribe();
    let mut session = Session::new();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let replies = match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(client_msg) => session.handle(&hub, client_msg),
                            Err(e) => {
                                warn!("Invalid message from {}: {}", conn_id, e);
                                vec![ServerMessage::Error {
                                    message: format!("Invalid message: {}", e),
                                }]
                            }
                        };
                        let mut open = true;
                        for reply in &replies {
                            if !send(&mut sender, reply).await {
                                open = false;
                                break;
                            }
                        }
                        if !open {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // Ignore binary and ping/pong
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", conn_id, e);
                        break;
                    }
                }
            }

            change = changes.recv() => {
                match change {
                    Ok(change) => {
                        if let Some(msg) = session.route(&change) {
                            if !send(&mut sender, &msg).await {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        // The client resubscribes on reconnect and gets fresh snapshots.
                        warn!("Connection {} missed {} changes; closing", conn_id, missed);
                        break;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    info!(
        "Connection closed: {} ({} subscriptions)",
        conn_id,
        session.subscription_count()
    );
}
