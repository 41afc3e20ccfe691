use axum::{routing::get, Router};

use crate::api::rest::{
    approvals::router as approvals_router, policy::router as policy_router,
    tools::router as tools_router,
};

pub mod approvals;
pub mod health;
pub mod policy;
pub mod tools;

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health::healthcheck))
        .nest("/tools", tools_router())
        .nest("/approvals", approvals_router())
        .nest("/policy", policy_router())
}
