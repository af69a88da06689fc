use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use relay_core::api::StatusResponse;
use tower_http::trace::TraceLayer;

use crate::dispatch::Dispatcher;
use crate::gateway::SharedGateway;
use crate::heartbeat::Heartbeater;

#[derive(Clone)]
pub struct AppState {
    destination_id: String,
    gateway: SharedGateway,
    dispatcher: Arc<Dispatcher>,
    heartbeat: Arc<Heartbeater>,
}

pub fn router(
    destination_id: String,
    gateway: SharedGateway,
    dispatcher: Arc<Dispatcher>,
    heartbeat: Arc<Heartbeater>,
) -> Router {
    let state = AppState {
        destination_id,
        gateway,
        dispatcher,
        heartbeat,
    };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(status))
        .route("/v1/items/{id}", get(item))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(st): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        destination_id: st.destination_id.clone(),
        status: st.heartbeat.status(),
        active: st.dispatcher.active(),
    })
}

async fn item(State(st): State<AppState>, Path(id): Path<String>) -> Result<Response, AppError> {
    match st.gateway.get_item(&id).await? {
        Some(item) => Ok(Json(item).into_response()),
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(value: E) -> Self {
        Self(value.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "request failed");
        let body = Json(serde_json::json!({
            "error": self.0.to_string()
        }));
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}
