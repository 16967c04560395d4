use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::aggregator::RenderSink;
use crate::models::{WsChatRequest, WsEvent};
use crate::service::analysis_service::AnalysisService;

/// GET `/ws/chat` — upgrades to a WebSocket for streaming analysis turns.
pub async fn ws_chat_handler(
    ws: WebSocketUpgrade,
    State(svc): State<AnalysisService>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, svc))
}

/// Handles a single WebSocket connection.
///
/// Protocol:
/// - Client sends JSON `{ "session_id": "...", "prompt": "..." }`
/// - Server streams back tagged events:
///   `turn_started`, then any of `code_opened` / `code_updated` /
///   `code_closed` / `code_output_added` / `image_added` / `text_opened` /
///   `text_updated` / `notice`, then `turn_completed`,
///   or `{ "type": "error", "message": "..." }` when the turn is rejected.
async fn handle_socket(mut socket: WebSocket, svc: AnalysisService) {
    info!("WebSocket client connected");

    while let Some(msg) = socket.recv().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!("WebSocket receive error: {e}");
                break;
            }
        };

        // Only handle text messages
        let text = match &msg {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let request: WsChatRequest = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                send_event(&mut socket, &WsEvent::Error {
                    message: format!("Invalid request: {e}"),
                })
                .await;
                continue;
            }
        };

        // ── Prepare: moderate, bind the thread, forward the prompt ────────
        let prepared = match svc.prepare_turn(&request.session_id, &request.prompt).await {
            Ok(prepared) => prepared,
            Err(e) => {
                send_event(&mut socket, &WsEvent::Error { message: e.to_string() }).await;
                continue;
            }
        };

        send_event(&mut socket, &WsEvent::TurnStarted).await;

        // ── Stream the run through a channel ──────────────────────────────
        let (tx, mut rx) = mpsc::unbounded_channel::<WsEvent>();
        let service = svc.clone();
        let run_handle = tokio::spawn(async move {
            let sink = ChannelSink { tx };
            service.run_turn(prepared, &sink).await
        });

        // Forward each event to the client. If the socket dies we drop the
        // receiver; the service sees the sink as closed and stops streaming,
        // keeping whatever was folded so far.
        let mut socket_ok = true;
        while let Some(event) = rx.recv().await {
            if !send_event(&mut socket, &event).await {
                socket_ok = false;
                break;
            }
        }
        drop(rx);

        match run_handle.await {
            Ok(Ok(())) => {
                if socket_ok {
                    send_event(&mut socket, &WsEvent::TurnCompleted).await;
                }
            }
            Ok(Err(e)) => {
                error!("Turn streaming failed: {e}");
                if socket_ok {
                    send_event(&mut socket, &WsEvent::Error { message: e.to_string() }).await;
                }
            }
            Err(e) => {
                error!("Turn task panicked: {e}");
                if socket_ok {
                    send_event(&mut socket, &WsEvent::Error {
                        message: "Internal error during streaming".to_string(),
                    })
                    .await;
                }
            }
        }

        if !socket_ok {
            break;
        }
    }

    info!("WebSocket client disconnected");
}

/// Bridges the aggregator's render callbacks onto the WebSocket channel.
struct ChannelSink {
    tx: mpsc::UnboundedSender<WsEvent>,
}

impl ChannelSink {
    fn send(&self, event: WsEvent) {
        let _ = self.tx.send(event);
    }
}

impl RenderSink for ChannelSink {
    fn code_opened(&self) {
        self.send(WsEvent::CodeOpened);
    }

    fn code_updated(&self, content: &str) {
        self.send(WsEvent::CodeUpdated { content: content.to_string() });
    }

    fn code_closed(&self) {
        self.send(WsEvent::CodeClosed);
    }

    fn code_output(&self, content: &str) {
        self.send(WsEvent::CodeOutputAdded { content: content.to_string() });
    }

    fn image_added(&self, urls: &[String]) {
        self.send(WsEvent::ImageAdded { content: urls.to_vec() });
    }

    fn text_opened(&self) {
        self.send(WsEvent::TextOpened);
    }

    fn text_updated(&self, content: &str) {
        self.send(WsEvent::TextUpdated { content: content.to_string() });
    }

    fn notice(&self, message: &str) {
        self.send(WsEvent::Notice { message: message.to_string() });
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Helper: serialize a `WsEvent` and send it over the socket. Returns false
/// once the socket is gone.
async fn send_event(socket: &mut WebSocket, event: &WsEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            error!("Failed to serialize event: {e}");
            true
        }
    }
}
