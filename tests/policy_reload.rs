use std::sync::Arc;

use analyst_gateway::{
    api,
    infrastructure::{
        config::{
            AppConfig, ApprovalConfig, Config, DatabaseConfig, ExecutorConfig, PolicyConfig,
            StorageConfig,
        },
        state::AppState,
        storage,
    },
};
use anyhow::Result;
use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Extension, Router,
};
use serde_json::{json, Value};
use sqlx::PgPool;
use tower::ServiceExt;
use uuid::Uuid;

#[path = "test_harness.rs"]
mod test_harness;

use test_harness::run_test;

fn build_state(pool: PgPool, bundle_path: Option<String>) -> Result<Arc<AppState>> {
    let config = Arc::new(Config {
        app: AppConfig::default(),
        database: DatabaseConfig {
            url: "postgres://integration".to_string(),
            ..DatabaseConfig::default()
        },
        policy: PolicyConfig { bundle_path },
        approvals: ApprovalConfig {
            token_secret: "integration-secret".to_string(),
            ..ApprovalConfig::default()
        },
        executor: ExecutorConfig::default(),
        storage: StorageConfig {
            provider: "memory".to_string(),
            local_path: None,
        },
    });
    let storage = storage::build_storage(&config.storage)?;
    let state = AppState::new(Arc::clone(&config), pool, storage)?;
    Ok(Arc::new(state))
}

fn build_app(state: Arc<AppState>) -> Router {
    api::build_router(Arc::clone(&state.config)).layer(Extension(state))
}

async fn insert_user(pool: &PgPool, role: &str) -> Result<String> {
    let external_user_id = format!("U{}", Uuid::new_v4().simple());
    sqlx::query(
        "INSERT INTO internal.users (id, external_user_id, display_name, role, region)
         VALUES ($1,$2,$3,$4,NULL)",
    )
    .bind(Uuid::new_v4())
    .bind(&external_user_id)
    .bind("Integration User")
    .bind(role)
    .execute(pool)
    .await?;
    Ok(external_user_id)
}

async fn post_reload(app: &Router, external_user_id: &str) -> Result<(StatusCode, Value)> {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/policy/reload")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({ "external_user_id": external_user_id }).to_string(),
                ))
                .expect("failed to build reload request"),
        )
        .await
        .expect("service error");

    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let body: Value = serde_json::from_slice(&bytes)?;
    Ok((status, body))
}

#[tokio::test]
async fn only_admins_may_reload_the_bundle() -> Result<()> {
    run_test(run_reload_permissions).await
}

async fn run_reload_permissions(pool: PgPool) -> Result<()> {
    let state = build_state(pool.clone(), None)?;
    let app = build_app(state);
    let admin = insert_user(&pool, "admin").await?;
    let marketing = insert_user(&pool, "marketing").await?;

    let (status, body) = post_reload(&app, &marketing).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "approval.not_admin");

    let (status, body) = post_reload(&app, &admin).await?;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["status"], "reloaded");

    Ok(())
}

#[tokio::test]
async fn invalid_bundle_files_keep_the_running_bundle() -> Result<()> {
    run_test(run_invalid_bundle).await
}

async fn run_invalid_bundle(pool: PgPool) -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("bundle.json");
    // Valid at startup.
    std::fs::write(&path, serde_json::to_string(&json!({}))?)?;

    let state = build_state(pool.clone(), Some(path.to_string_lossy().to_string()))?;
    let app = build_app(Arc::clone(&state));
    let admin = insert_user(&pool, "admin").await?;

    // Corrupt the file, then ask for a reload.
    std::fs::write(&path, "{ not json")?;
    let (status, body) = post_reload(&app, &admin).await?;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "policy.bundle_invalid");
    // The engine still evaluates with the previous bundle.
    assert!(state.current_bundle().validate().is_ok());

    Ok(())
}
