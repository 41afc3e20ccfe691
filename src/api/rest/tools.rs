use std::sync::Arc;

use axum::{extract::Extension, routing::post, Json, Router};

use crate::{
    infrastructure::state::AppState,
    services::{
        dispatch::{DispatchService, ToolCallEnvelope, ToolCallResponse},
        errors::ServiceError,
    },
};

pub fn router() -> Router {
    Router::new().route("/call", post(call))
}

async fn call(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<ToolCallResponse>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let envelope: ToolCallEnvelope = serde_json::from_value(payload)
        .map_err(|err| to_response(ServiceError::MalformedEnvelope(err.to_string())))?;
    let service = DispatchService::new(state);
    let response = service.dispatch(envelope).await.map_err(to_response)?;
    Ok(Json(response))
}

fn to_response(err: ServiceError) -> (axum::http::StatusCode, Json<serde_json::Value>) {
    (
        err.status_code(),
        Json(serde_json::json!({ "error": err.to_string(), "kind": err.kind() })),
    )
}
