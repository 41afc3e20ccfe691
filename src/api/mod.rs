use std::sync::Arc;

use axum::{
    http::{HeaderValue, StatusCode},
    Json, Router,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::infrastructure::config::Config;

use self::rest::router as rest_router;

pub mod rest;

pub fn build_router(config: Arc<Config>) -> Router {
    let cors = cors_layer(&config);
    Router::new()
        .nest("/api", rest_router())
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .app
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    if origins.is_empty() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    }
}

pub async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "not_found"})),
    )
}
