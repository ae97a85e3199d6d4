//! ==============================================================================
//! server.rs - dashboard, websocket and json api
//! ==============================================================================
//!
//! purpose:
//!     everything a browser talks to. the websocket is the main surface: on
//!     connect a client gets the history replay, then every live event the
//!     session publishes. it may send "rescan" back at any time.
//!
//! routes:
//!     GET  /             minimal embedded page
//!     GET  /ws           event stream + rescan command
//!     GET  /api/history  current history buffer
//!     GET  /api/status   device, address, scanning flag, counters
//!     POST /api/rescan   same as the websocket command; result also returned
//!
//! relationships:
//!     - used by: main.rs
//!     - uses: session.rs (ProbeSession), hub.rs (Subscription)
//!
//! ==============================================================================

use crate::domain::{ProbeEvent, Reading, RescanResult};
use crate::hub::Subscription;
use crate::session::{ProbeSession, SessionStatus};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{Html, IntoResponse, Json},
    routing::{get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

const INDEX_HTML: &str = include_str!("../static/index.html");

#[derive(Clone)]
pub struct AppState {
    session: Arc<ProbeSession>,
    shutdown: CancellationToken,
}

pub fn router(session: Arc<ProbeSession>, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/ws", get(ws_handler))
        .route("/api/history", get(history_handler))
        .route("/api/status", get(status_handler))
        .route("/api/rescan", post(rescan_handler))
        .layer(CorsLayer::permissive())
        .with_state(AppState { session, shutdown })
}

/// serve until the token fires, then drain
pub async fn serve(
    listener: TcpListener,
    session: Arc<ProbeSession>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(session, shutdown.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

// ==============================================================================
// http handlers
// ==============================================================================

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn history_handler(State(state): State<AppState>) -> Json<Vec<Reading>> {
    Json(state.session.hub().snapshot())
}

async fn status_handler(State(state): State<AppState>) -> Json<SessionStatus> {
    Json(state.session.status())
}

async fn rescan_handler(State(state): State<AppState>) -> Json<RescanResult> {
    Json(state.session.rescan().await)
}

// ==============================================================================
// websocket
// ==============================================================================

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    // history and the live stream come from one snapshot point
    let Subscription { history, mut events } = state.session.hub().connect();
    let (mut sender, mut receiver) = socket.split();
    info!(clients = state.session.hub().client_count(), "client connected");

    let Some(frame) = encode(&ProbeEvent::History(history)) else {
        return;
    };
    if sender.send(Message::Text(frame)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if is_rescan_request(&text) {
                        // answered through the broadcast, so the socket keeps flowing
                        state.session.request_rescan();
                    } else {
                        debug!("ignoring client message: {}", text);
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("websocket receive error: {}", e);
                    break;
                }
            },

            event = events.recv() => match event {
                Ok(event) => {
                    let Some(frame) = encode(&event) else { continue };
                    if sender.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "client lagging, dropped events");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    let _ = sender.close().await;
    info!("client disconnected");
}

fn encode(event: &ProbeEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!("failed to encode event: {}", e);
            None
        }
    }
}

#[derive(Deserialize)]
struct ClientCommand {
    event: String,
}

/// `{"event":"rescan"}` or the bare word
fn is_rescan_request(text: &str) -> bool {
    let text = text.trim();
    if text == "rescan" {
        return true;
    }
    serde_json::from_str::<ClientCommand>(text).is_ok_and(|cmd| cmd.event == "rescan")
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeviceDescriptor;
    use crate::hub::LiveHub;
    use crate::locator::DeviceLocator;
    use crate::profile::ProbeModel;
    use crate::session::SessionSettings;
    use crate::simulated::SimulatedProbe;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    fn simulated_session() -> Arc<ProbeSession> {
        let probe = Arc::new(SimulatedProbe::new("sim-1", Duration::ZERO));
        let device = DeviceDescriptor {
            id: "sim-1".into(),
            local_key: "secret".into(),
            version: 3.4,
            model: ProbeModel::Wt02,
            name: Some("Smoker".into()),
        };
        Arc::new(ProbeSession::new(
            device,
            DeviceLocator::new("sim-1", probe.clone(), 2),
            probe,
            LiveHub::new(900),
            SessionSettings { show_readings: false, ..SessionSettings::default() },
        ))
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn rescan_command_forms() {
        assert!(is_rescan_request("rescan"));
        assert!(is_rescan_request(" rescan\n"));
        assert!(is_rescan_request(r#"{"event":"rescan"}"#));
        assert!(is_rescan_request(r#"{"event":"rescan","data":null}"#));
        assert!(!is_rescan_request(r#"{"event":"history"}"#));
        assert!(!is_rescan_request("hello"));
    }

    #[tokio::test]
    async fn index_is_served() {
        let app = router(simulated_session(), CancellationToken::new());
        let response = app.oneshot(Request::get("/").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn history_reflects_recorded_readings() {
        let session = simulated_session();
        session.tick().await;
        session.tick().await;

        let app = router(session, CancellationToken::new());
        let request = Request::get("/api/history").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let body = json_body(response).await;
        assert_eq!(body.as_array().map(Vec::len), Some(2));
        assert!(body[0]["temp_c"].is_number());
    }

    #[tokio::test]
    async fn rescan_returns_and_broadcasts_result() {
        let session = simulated_session();
        let mut sub = session.hub().connect();

        let app = router(session.clone(), CancellationToken::new());
        let response = app
            .oneshot(Request::post("/api/rescan").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body, serde_json::json!({"success": true, "ip": "127.0.0.1"}));

        match sub.events.try_recv().unwrap() {
            ProbeEvent::RescanResult(result) => assert!(result.success),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(session.locator().address(), Some("127.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn status_does_not_leak_local_key() {
        let app = router(simulated_session(), CancellationToken::new());
        let request = Request::get("/api/status").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let body = json_body(response).await;
        assert_eq!(body["device_id"], "sim-1");
        assert_eq!(body["scanning"], false);
        assert!(!body.to_string().contains("secret"));
    }
}
