//! Caption board: a small HTTP surface plus WebSocket fan-out.
//!
//! Serves the static board assets on `/`, the translation config on
//! `/config`, and upgrades `/ws` for live captions. Every connected client
//! has its own bounded outbound queue (drop-oldest); publishing never blocks
//! the pipeline, and clients that stop draining are disconnected.

use crate::config::{TranslationSettings, WebSettings};
use crate::defaults;
use crate::error::{Result, TranskriboError};
use crate::pipeline::queue::{DropOldestQueue, PushOutcome};
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

/// Messages pushed to every connected caption board client.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BroadcastMessage {
    Partial {
        text: String,
        speaker: Option<String>,
    },
    Final {
        text: String,
        speaker: Option<String>,
        translations: HashMap<String, String>,
    },
}

#[derive(Debug)]
struct ClientHandle {
    queue: Arc<DropOldestQueue<String>>,
    dropped: u64,
    stuck_since: Option<Instant>,
}

#[derive(Debug)]
struct BoardState {
    config_payload: serde_json::Value,
    clients: Mutex<HashMap<u64, ClientHandle>>,
    next_client_id: AtomicU64,
}

#[derive(Debug)]
pub struct CaptionWebServer {
    state: Arc<BoardState>,
    server: Mutex<Option<tokio::task::JoinHandle<()>>>,
    local_addr: SocketAddr,
}

impl CaptionWebServer {
    /// Bind and serve. A port already in use is a startup error directing
    /// the operator to free it, not a retry loop.
    pub async fn start(web: &WebSettings, translation: &TranslationSettings) -> Result<Self> {
        let state = Arc::new(BoardState {
            config_payload: serde_json::json!({
                "targets": translation.targets,
                "defaultVisibility": translation.default_visibility,
            }),
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
        });

        let app = Router::new()
            .route("/config", get(config_handler))
            .route("/ws", get(ws_handler))
            .fallback_service(ServeDir::new(&web.web_root))
            .with_state(Arc::clone(&state));

        let address = format!("{}:{}", web.host, web.port);
        let listener = tokio::net::TcpListener::bind(&address).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                TranskriboError::PortInUse {
                    port: web.port,
                    message: format!(
                        "{e}; stop the process holding it or change WEB_UI_PORT"
                    ),
                }
            } else {
                TranskriboError::WebServer {
                    message: format!("failed to bind {address}: {e}"),
                }
            }
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TranskriboError::WebServer {
                message: format!("failed to read bound address: {e}"),
            })?;
        info!("Caption board running at http://{local_addr}");

        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                warn!("Caption board server stopped: {e}");
            }
        });

        Ok(Self {
            state,
            server: Mutex::new(Some(server)),
            local_addr,
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Fan a message out to all connected clients. Non-blocking: slow
    /// clients lose their oldest pending message, and clients whose queue
    /// has been saturated past the grace period are disconnected.
    pub fn broadcast(&self, message: &BroadcastMessage) {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Broadcast payload failed to serialize: {e}");
                return;
            }
        };

        let mut clients = self
            .state
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut stuck: Vec<u64> = Vec::new();
        for (id, client) in clients.iter_mut() {
            match client.queue.push(payload.clone()) {
                PushOutcome::Accepted => client.stuck_since = None,
                PushOutcome::DroppedOldest => {
                    client.dropped += 1;
                    let since = *client.stuck_since.get_or_insert_with(Instant::now);
                    if since.elapsed() > defaults::WEB_CLIENT_STUCK_GRACE {
                        stuck.push(*id);
                    }
                }
                PushOutcome::Closed => stuck.push(*id),
            }
        }
        for id in stuck {
            if let Some(client) = clients.remove(&id) {
                warn!(
                    "Disconnecting caption board client {id} (queue stuck, {} dropped)",
                    client.dropped,
                );
                client.queue.close();
            }
        }
    }

    /// Connected client count, for diagnostics.
    pub fn client_count(&self) -> usize {
        self.state
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Close all sockets and stop serving.
    pub fn stop(&self) {
        let mut clients = self
            .state
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, client) in clients.drain() {
            client.queue.close();
        }
        drop(clients);

        if let Some(server) = self
            .server
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            server.abort();
        }
    }
}

async fn config_handler(State(state): State<Arc<BoardState>>) -> impl IntoResponse {
    axum::Json(state.config_payload.clone())
}

async fn ws_handler(
    State(state): State<Arc<BoardState>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<BoardState>, socket: WebSocket) {
    let queue = Arc::new(DropOldestQueue::new(defaults::WEB_CLIENT_QUEUE_CAPACITY));
    let id = state.next_client_id.fetch_add(1, Ordering::Relaxed);
    {
        let mut clients = state
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        clients.insert(
            id,
            ClientHandle {
                queue: Arc::clone(&queue),
                dropped: 0,
                stuck_since: None,
            },
        );
    }
    debug!("Caption board client {id} connected");

    let (mut sender, mut receiver) = socket.split();

    let send_queue = Arc::clone(&queue);
    let send_task = tokio::spawn(async move {
        while let Some(payload) = send_queue.pop().await {
            if sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    // Inbound frames are ignored; the read loop only notices disconnects.
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    queue.close();
    let _ = send_task.await;
    let mut clients = state
        .clients
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    clients.remove(&id);
    debug!("Caption board client {id} disconnected");
}
