use std::sync::Arc;

use agentflow_protocol::{ApiError, ErrorCode, StartRequest, StartResponse, StopResponse};
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use libagentflow::FireError;
use serde_json::{Value, json};

use crate::AppState;

/// Structured error body with the status implied by its code.
pub struct ApiFailure(pub ApiError);

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0)).into_response()
    }
}

impl From<FireError> for ApiFailure {
    fn from(err: FireError) -> Self {
        Self(err.to_api_error())
    }
}

/// POST /api/fire - Start a run.
pub async fn fire_start(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<StartRequest>, JsonRejection>,
) -> Result<Json<StartResponse>, ApiFailure> {
    let Json(req) = payload.map_err(|rejection| {
        tracing::debug!("rejected fire request: {rejection}");
        ApiFailure(
            ApiError::new(ErrorCode::BadJson, "Request body must be valid JSON.")
                .with_hint("Send {\"tool\":\"codex\",\"maxIterations\":10}."),
        )
    })?;

    let run_id = state.supervisor.start(&req.tool, req.max_iterations)?;
    Ok(Json(StartResponse { ok: true, run_id }))
}

/// POST /api/fire/stop - Stop the active run, if any.
pub async fn fire_stop(State(state): State<Arc<AppState>>) -> Json<StopResponse> {
    let outcome = state.supervisor.stop().await;
    Json(StopResponse {
        ok: true,
        run_id: outcome.run_id,
        stopping: outcome.stopping,
    })
}

/// POST /api/ping - Liveness probe.
pub async fn ping() -> Json<Value> {
    Json(json!({ "ok": true }))
}
