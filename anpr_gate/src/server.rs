//! HTTP boundary. Thin adapters over the owned [`CameraService`], the [`EventDistributor`] and
//! the [`StreamCompositor`]; no detection logic lives here.

use crate::events::EventDistributor;
use crate::metrics;
use crate::plate_detection::stream::{StreamCompositor, CONTENT_TYPE};
use crate::service::{CameraService, ServiceStatus};

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use log::{debug, error, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

/// Operator page: the live feed next to a rolling list of websocket detections.
const OPERATOR_PAGE: &str = include_str!("../static/operator.html");

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CameraService>,
    pub distributor: Arc<EventDistributor>,
    pub compositor: StreamCompositor,
    pub stream_fps: u32,
    /// Flips to true when the process is shutting down; long-lived responses end on it.
    pub shutdown: watch::Receiver<bool>,
}

pub fn router(state: AppState) -> Router {
    let auto_access = Router::new()
        .route("/video-feed", get(video_feed))
        .route("/ws", get(ws_handler))
        .route("/status", get(status))
        .route("/ui", get(operator_page))
        .route("/start", post(start))
        .route("/stop", post(stop));

    Router::new()
        .nest("/auto-access", auto_access)
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

async fn status(State(state): State<AppState>) -> Json<ServiceStatus> {
    Json(state.service.status())
}

async fn start(State(state): State<AppState>) -> impl IntoResponse {
    let service = state.service.clone();
    match tokio::task::spawn_blocking(move || service.start()).await {
        Ok(Ok(())) => (StatusCode::OK, Json(state.service.status())).into_response(),
        Ok(Err(e)) => {
            error!("Cannot start capture: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => {
            error!("Start task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn stop(State(state): State<AppState>) -> impl IntoResponse {
    let service = state.service.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || service.stop()).await {
        error!("Stop task failed: {}", e);
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (StatusCode::OK, Json(state.service.status())).into_response()
}

async fn operator_page() -> Html<&'static str> {
    Html(OPERATOR_PAGE)
}

async fn prometheus_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

/// Endless multipart MJPEG response paced at the configured stream rate.
async fn video_feed(State(state): State<AppState>) -> impl IntoResponse {
    let mut ticker = tokio::time::interval(Duration::from_secs(1) / state.stream_fps.max(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let parts = futures::stream::unfold(
        (state.compositor, ticker, state.shutdown),
        |(compositor, mut ticker, shutdown)| async move {
            ticker.tick().await;
            if *shutdown.borrow() {
                return None;
            }
            let next = compositor.clone();
            let part = match tokio::task::spawn_blocking(move || next.compose()).await {
                Ok(part) => part,
                Err(e) => {
                    warn!("Stream compositing failed: {}", e);
                    return None;
                }
            };
            Some((
                Ok::<_, Infallible>(Bytes::from(part)),
                (compositor, ticker, shutdown),
            ))
        },
    );

    ([(header::CONTENT_TYPE, CONTENT_TYPE)], Body::from_stream(parts))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state.distributor, state.shutdown))
}

async fn handle_websocket(
    socket: WebSocket,
    distributor: Arc<EventDistributor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let id = distributor.register(Box::new(tx));

    let mut send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Inbound messages are only read to notice the client leaving.
    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("Websocket error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
        _ = shutdown.wait_for(|stopping| *stopping) => {
            send_task.abort();
            recv_task.abort();
        }
    }
    distributor.deregister(id);
}
