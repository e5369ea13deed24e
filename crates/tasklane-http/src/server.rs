//! The worker trigger endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tasklane_core::{Dispatcher, Engine, Lease, WorkRequest};
use tokio::net::TcpListener;
use tracing::{debug, error, warn};

use crate::nonce::verify;

/// Body of `POST /worker`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerBody {
    /// Action to run.
    pub action: String,
    /// Signature from [`crate::nonce::sign`].
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
}

struct AppState<D> {
    engine: Arc<Engine<D>>,
    secret: Arc<str>,
}

impl<D> Clone for AppState<D> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            secret: self.secret.clone(),
        }
    }
}

/// Routes: `POST /worker` and `GET /status`.
pub fn router<D: Dispatcher>(engine: Arc<Engine<D>>, secret: impl Into<String>) -> Router {
    let state = AppState {
        engine,
        secret: Arc::from(secret.into()),
    };
    Router::new()
        .route("/worker", post(worker::<D>))
        .route("/status", get(status::<D>))
        .with_state(state)
}

/// Serve the router until the listener fails.
pub async fn serve(listener: TcpListener, router: Router) -> std::io::Result<()> {
    axum::serve(listener, router).await
}

async fn worker<D: Dispatcher>(
    State(state): State<AppState<D>>,
    Json(body): Json<WorkerBody>,
) -> Response {
    if state.engine.registry().get(&body.action).is_none() {
        debug!(action = %body.action, "Trigger for unknown action");
        return (StatusCode::NOT_FOUND, Json(json!({"error": "unknown action"}))).into_response();
    }
    if !verify(&state.secret, &body.action, &body.nonce) {
        warn!(action = %body.action, "Trigger with bad nonce");
        return (StatusCode::FORBIDDEN, Json(json!({"error": "bad nonce"}))).into_response();
    }
    let request = WorkRequest {
        action: body.action,
        lease: body.lease,
    };
    let engine = state.engine.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.handle(request).await {
            error!(error = %e, "Cycle failed");
        }
    });
    (StatusCode::ACCEPTED, Json(json!({"ok": true}))).into_response()
}

async fn status<D: Dispatcher>(State(state): State<AppState<D>>) -> Response {
    match state.engine.statuses().await {
        Ok(statuses) => Json(statuses).into_response(),
        Err(e) => {
            error!(error = %e, "Status listing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}
