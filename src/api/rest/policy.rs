use std::sync::Arc;

use axum::{extract::Extension, routing::post, Json, Router};
use serde::Deserialize;

use crate::{
    domain::models::Role,
    infrastructure::{identity, state::AppState},
    services::errors::ServiceError,
};

pub fn router() -> Router {
    Router::new().route("/reload", post(reload))
}

#[derive(Debug, Deserialize)]
struct ReloadRequest {
    external_user_id: String,
}

/// Re-reads the policy bundle file and swaps it in. Admin identities only; an
/// invalid file leaves the running bundle in place.
async fn reload(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<ReloadRequest>,
) -> Result<Json<serde_json::Value>, (axum::http::StatusCode, Json<serde_json::Value>)> {
    let caller = identity::resolve(&state.pool, &payload.external_user_id)
        .await
        .map_err(to_response)?;
    if caller.role != Role::Admin {
        return Err(to_response(ServiceError::NotAdmin));
    }

    state
        .reload_bundle()
        .map_err(|err| to_response(ServiceError::BundleInvalid(err.to_string())))?;

    Ok(Json(serde_json::json!({ "status": "reloaded" })))
}

fn to_response(err: ServiceError) -> (axum::http::StatusCode, Json<serde_json::Value>) {
    (
        err.status_code(),
        Json(serde_json::json!({ "error": err.to_string(), "kind": err.kind() })),
    )
}
