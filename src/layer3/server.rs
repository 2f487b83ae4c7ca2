// Downstream Server - axum websocket + health endpoint
// One task per subscriber: drains its session queue, reads pongs

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::core::SyncState;
use crate::layer2::pipeline::SyncStatus;
use crate::layer3::publisher::{ClientMessage, Publisher};
use crate::layer3::sessions::{SessionId, SessionInfo};

#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<Publisher>,
    pub status: watch::Receiver<SyncStatus>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub state: SyncState,
    pub sequence_id: u64,
    /// Epoch of the snapshot request in flight, if any
    pub awaiting_snapshot: Option<u64>,
    pub sessions: usize,
    pub subscribers: Vec<SessionInfo>,
}

pub fn router(state: AppState, ws_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `cancel` fires
pub async fn serve(listener: TcpListener, app: Router, cancel: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Server listening");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = state.status.borrow().clone();
    let subscribers = state.publisher.sessions().sessions();
    Json(HealthResponse {
        status: "OK",
        timestamp: Utc::now().to_rfc3339(),
        state: status.state,
        sequence_id: status.sequence_id,
        awaiting_snapshot: status.awaiting_epoch,
        sessions: subscribers.len(),
        subscribers,
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (id, mut outbound) = state.publisher.subscribe();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            queued = outbound.recv() => match queued {
                Some(payload) => {
                    if let Err(e) = sender.send(Message::Text(payload.to_string())).await {
                        debug!(session_id = %id, error = %e, "Send failed, closing session");
                        break;
                    }
                }
                None => {
                    // Evicted by the session manager or shut down
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => handle_client_text(&state, &id, &text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session_id = %id, error = %e, "Receive failed, closing session");
                    break;
                }
            },
        }
    }

    state.publisher.sessions().unregister(&id);
}

fn handle_client_text(state: &AppState, id: &SessionId, text: &str) {
    match ClientMessage::parse(text) {
        Ok(ClientMessage::Pong) => {
            let _ = state.publisher.sessions().record_pong(id);
        }
        Err(e) => {
            warn!(session_id = %id, error = %e, "Invalid client message ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer2::orderbook::OrderBook;
    use crate::layer2::parser::PriceLevel;
    use crate::layer3::sessions::SessionManager;
    use rust_decimal::Decimal;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    async fn start_server() -> (std::net::SocketAddr, Arc<Publisher>, watch::Sender<SyncStatus>, CancellationToken) {
        let publisher = Arc::new(Publisher::new(5, Arc::new(SessionManager::new(16))));
        let (status_tx, status_rx) = watch::channel(SyncStatus::default());
        let cancel = CancellationToken::new();
        let state = AppState {
            publisher: publisher.clone(),
            status: status_rx,
            cancel: cancel.clone(),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, router(state, "/orderbook"), cancel.clone()));
        (addr, publisher, status_tx, cancel)
    }

    fn sample_book() -> OrderBook {
        let mut ob = OrderBook::new("BTCUSDT");
        ob.replace_from_snapshot(
            7,
            &[PriceLevel::new(Decimal::new(1000, 2), Decimal::new(10, 1))],
            &[PriceLevel::new(Decimal::new(1001, 2), Decimal::new(5, 1))],
        );
        ob
    }

    async fn wait_for_sessions(publisher: &Publisher, count: usize) {
        while publisher.sessions().session_count() != count {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (addr, publisher, status_tx, cancel) = start_server().await;
        status_tx.send_replace(SyncStatus {
            state: SyncState::Synced,
            sequence_id: 42,
            ..SyncStatus::default()
        });

        let body: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "OK");
        assert_eq!(body["state"], "SYNCED");
        assert_eq!(body["sequence_id"], 42);
        assert_eq!(body["sessions"], 0);
        assert!(body["awaiting_snapshot"].is_null());
        assert!(body["timestamp"].as_str().unwrap().contains('T'));

        status_tx.send_replace(SyncStatus {
            state: SyncState::Resyncing,
            sequence_id: 42,
            awaiting_epoch: Some(3),
            ..SyncStatus::default()
        });
        let (id, _rx) = publisher.subscribe();

        let body: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["state"], "RESYNCING");
        assert_eq!(body["awaiting_snapshot"], 3);
        assert_eq!(body["sessions"], 1);
        assert_eq!(body["subscribers"][0]["id"], id.to_string());
        assert_eq!(body["subscribers"][0]["missed_pongs"], 0);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_subscriber_receives_views_and_survives_bad_input() {
        let (addr, publisher, _status_tx, cancel) = start_server().await;
        publisher.publish(&sample_book());

        let (mut ws, _) = connect_async(format!("ws://{}/orderbook", addr)).await.unwrap();

        // Current view arrives immediately on connect
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                assert!(text.starts_with(r#"{"type":"orderbook","symbol":"BTCUSDT""#));
                assert!(text.contains(r#""bids":[["10.00","1.0"]]"#));
            }
            other => panic!("expected view, got {:?}", other),
        }

        ws.send(WsMessage::Text("definitely not json".to_string())).await.unwrap();
        ws.send(WsMessage::Text(r#"{"type":"pong"}"#.to_string())).await.unwrap();
        wait_for_sessions(&publisher, 1).await;

        publisher.sessions().ping_all();
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => assert_eq!(text, r#"{"type":"ping"}"#),
            other => panic!("expected ping, got {:?}", other),
        }

        ws.close(None).await.unwrap();
        wait_for_sessions(&publisher, 0).await;
        cancel.cancel();
    }
}
