//! Management API: recent connection events and live user counters.
//!
//! Served only when enabled in config; handlers reject anything that is not
//! a loopback peer.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use veil_auth::Authenticator;

use crate::recorder::Recorder;

#[derive(Clone)]
struct ApiState {
    auth: Arc<dyn Authenticator>,
    recorder: Arc<Recorder>,
}

pub(crate) async fn serve(
    listen: String,
    auth: Arc<dyn Authenticator>,
    recorder: Arc<Recorder>,
    cancel: CancellationToken,
) {
    let state = ApiState { auth, recorder };
    let app = Router::new()
        .route("/api/records", get(handle_records))
        .route("/api/users", get(handle_users))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(&listen).await {
        Ok(listener) => listener,
        Err(err) => {
            warn!(listen = %listen, error = %err, "management api failed to bind");
            return;
        }
    };
    info!(listen = %listen, "management api listening");

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await });

    if let Err(err) = serve.await {
        warn!(error = %err, "management api stopped with error");
    }
}

fn require_loopback(peer: SocketAddr) -> Result<(), (StatusCode, Json<serde_json::Value>)> {
    if peer.ip().is_loopback() {
        Ok(())
    } else {
        Err((
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({
                "error": "management api is only accessible from localhost"
            })),
        ))
    }
}

async fn handle_records(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    if let Err(reject) = require_loopback(peer) {
        return reject.into_response();
    }
    Json(state.recorder.snapshot()).into_response()
}

async fn handle_users(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    if let Err(reject) = require_loopback(peer) {
        return reject.into_response();
    }
    let users: Vec<serde_json::Value> = state
        .auth
        .users()
        .iter()
        .map(|user| {
            serde_json::json!({
                "hash": user.hash(),
                "sent": user.sent(),
                "recv": user.recv(),
                "active_ips": user.active_ip_count(),
            })
        })
        .collect();
    Json(users).into_response()
}
