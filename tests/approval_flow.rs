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
    services::approvals::ApprovalService,
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

fn build_state(pool: PgPool) -> Result<Arc<AppState>> {
    let config = Arc::new(Config {
        app: AppConfig::default(),
        database: DatabaseConfig {
            url: "postgres://integration".to_string(),
            ..DatabaseConfig::default()
        },
        policy: PolicyConfig::default(),
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

async fn insert_user(pool: &PgPool, role: &str, region: Option<&str>) -> Result<String> {
    let external_user_id = format!("U{}", Uuid::new_v4().simple());
    sqlx::query(
        "INSERT INTO internal.users (id, external_user_id, display_name, role, region)
         VALUES ($1,$2,$3,$4,$5)",
    )
    .bind(Uuid::new_v4())
    .bind(&external_user_id)
    .bind("Integration User")
    .bind(role)
    .bind(region)
    .execute(pool)
    .await?;
    Ok(external_user_id)
}

async fn post_json(app: &Router, uri: &str, payload: Value) -> Result<(StatusCode, Value)> {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(payload.to_string()))
                .expect("failed to build request"),
        )
        .await
        .expect("service error");

    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let body: Value = serde_json::from_slice(&bytes)?;
    Ok((status, body))
}

/// Suspends a raw-schema query from a data analyst and returns
/// `(request_id, approval_id, token)`.
async fn suspend_raw_query(app: &Router, analyst: &str) -> Result<(Uuid, Uuid, String)> {
    let request_id = Uuid::new_v4();
    let envelope = json!({
        "request_id": request_id,
        "external_user_id": analyst,
        "tool_name": "run_sql",
        "inputs": { "query": "SELECT id FROM raw.customers LIMIT 5" },
    });
    let (status, body) = post_json(app, "/api/tools/call", envelope).await?;

    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["status"], "pending");
    assert_eq!(
        body["decision"]["reason"],
        "Access to raw schema requires admin approval"
    );
    assert!(body["decision"]["rule_ids"]
        .as_array()
        .unwrap()
        .contains(&json!("approval.sensitive_schema")));

    let approval_id: Uuid = body["approval_id"].as_str().unwrap().parse()?;
    let token = body["approval_token"].as_str().unwrap().to_string();
    Ok((request_id, approval_id, token))
}

async fn audit_decisions(pool: &PgPool, request_id: Uuid) -> Result<Vec<String>> {
    Ok(sqlx::query_scalar::<_, String>(
        "SELECT decision FROM internal.audit_logs WHERE request_id = $1 ORDER BY created_at ASC, log_id ASC",
    )
    .bind(request_id)
    .fetch_all(pool)
    .await?)
}

#[tokio::test]
async fn admin_approval_resumes_execution() -> Result<()> {
    run_test(run_approve_flow).await
}

async fn run_approve_flow(pool: PgPool) -> Result<()> {
    let state = build_state(pool.clone())?;
    let app = build_app(state);
    let analyst = insert_user(&pool, "data_analyst", None).await?;
    let admin = insert_user(&pool, "admin", None).await?;

    let (request_id, approval_id, token) = suspend_raw_query(&app, &analyst).await?;

    let (status, body) = post_json(
        &app,
        &format!("/api/approvals/{approval_id}"),
        json!({
            "approver_external_id": admin,
            "decision": "approve",
            "reason": "quarterly audit pull",
            "token": token,
        }),
    )
    .await?;

    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["status"], "approved");
    assert_eq!(body["outcome"]["executed"], true);

    // Suspension, approval decision, and execution each leave one entry.
    let mut decisions = audit_decisions(&pool, request_id).await?;
    decisions.sort();
    assert_eq!(decisions, vec!["allow", "approved", "require_approval"]);

    Ok(())
}

#[tokio::test]
async fn admin_denial_closes_without_execution() -> Result<()> {
    run_test(run_deny_flow).await
}

async fn run_deny_flow(pool: PgPool) -> Result<()> {
    let state = build_state(pool.clone())?;
    let app = build_app(state);
    let analyst = insert_user(&pool, "data_analyst", None).await?;
    let admin = insert_user(&pool, "admin", None).await?;

    let (request_id, approval_id, token) = suspend_raw_query(&app, &analyst).await?;

    let (status, body) = post_json(
        &app,
        &format!("/api/approvals/{approval_id}"),
        json!({
            "approver_external_id": admin,
            "decision": "deny",
            "reason": "no justification given",
            "token": token,
        }),
    )
    .await?;

    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["status"], "denied");
    assert_eq!(body["outcome"]["executed"], false);

    let mut decisions = audit_decisions(&pool, request_id).await?;
    decisions.sort();
    assert_eq!(decisions, vec!["denied", "require_approval"]);

    Ok(())
}

#[tokio::test]
async fn resubmission_replays_the_recorded_outcome() -> Result<()> {
    run_test(run_idempotent_submit).await
}

async fn run_idempotent_submit(pool: PgPool) -> Result<()> {
    let state = build_state(pool.clone())?;
    let app = build_app(state);
    let analyst = insert_user(&pool, "data_analyst", None).await?;
    let admin = insert_user(&pool, "admin", None).await?;

    let (request_id, approval_id, token) = suspend_raw_query(&app, &analyst).await?;

    let payload = json!({
        "approver_external_id": admin,
        "decision": "approve",
        "reason": "approved once",
        "token": token,
    });
    let (first_status, first_body) =
        post_json(&app, &format!("/api/approvals/{approval_id}"), payload.clone()).await?;
    assert_eq!(first_status, StatusCode::OK, "body: {first_body}");

    // Same token, same approval: the terminal state is replayed, even if the
    // second submission asks for the opposite decision.
    let mut flipped = payload.clone();
    flipped["decision"] = json!("deny");
    let (second_status, second_body) =
        post_json(&app, &format!("/api/approvals/{approval_id}"), flipped).await?;

    assert_eq!(second_status, StatusCode::OK);
    assert_eq!(second_body["status"], "approved");
    assert_eq!(second_body["outcome"]["already_decided"], true);

    // No extra execution entries appeared.
    let mut decisions = audit_decisions(&pool, request_id).await?;
    decisions.sort();
    assert_eq!(decisions, vec!["allow", "approved", "require_approval"]);

    Ok(())
}

#[tokio::test]
async fn non_admin_approvers_are_rejected() -> Result<()> {
    run_test(run_not_admin).await
}

async fn run_not_admin(pool: PgPool) -> Result<()> {
    let state = build_state(pool.clone())?;
    let app = build_app(state);
    let analyst = insert_user(&pool, "data_analyst", None).await?;
    let marketing = insert_user(&pool, "marketing", None).await?;

    let (request_id, approval_id, token) = suspend_raw_query(&app, &analyst).await?;

    let (status, body) = post_json(
        &app,
        &format!("/api/approvals/{approval_id}"),
        json!({
            "approver_external_id": marketing,
            "decision": "approve",
            "reason": "please",
            "token": token,
        }),
    )
    .await?;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "approval.not_admin");

    // The misuse itself is on the audit trail.
    let mut decisions = audit_decisions(&pool, request_id).await?;
    decisions.sort();
    assert_eq!(decisions, vec!["error", "require_approval"]);

    Ok(())
}

#[tokio::test]
async fn self_approval_is_rejected() -> Result<()> {
    run_test(run_self_approval).await
}

async fn run_self_approval(pool: PgPool) -> Result<()> {
    let state = build_state(pool.clone())?;
    let app = build_app(state);
    // An admin requester still cannot clear their own request.
    let requester = insert_user(&pool, "admin", None).await?;
    let analyst_query_request = Uuid::new_v4();
    let envelope = json!({
        "request_id": analyst_query_request,
        "external_user_id": requester,
        "tool_name": "run_sql",
        "inputs": { "query": "SELECT email FROM reporting.customers LIMIT 5" },
    });
    let (status, body) = post_json(&app, "/api/tools/call", envelope).await?;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["status"], "pending");
    assert!(body["decision"]["rule_ids"]
        .as_array()
        .unwrap()
        .contains(&json!("approval.admin_pii")));

    let approval_id: Uuid = body["approval_id"].as_str().unwrap().parse()?;
    let token = body["approval_token"].as_str().unwrap().to_string();

    let (status, body) = post_json(
        &app,
        &format!("/api/approvals/{approval_id}"),
        json!({
            "approver_external_id": requester,
            "decision": "approve",
            "reason": "self-serve",
            "token": token,
        }),
    )
    .await?;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "approval.self_approval");

    Ok(())
}

#[tokio::test]
async fn forged_tokens_are_rejected() -> Result<()> {
    run_test(run_bad_token).await
}

async fn run_bad_token(pool: PgPool) -> Result<()> {
    let state = build_state(pool.clone())?;
    let app = build_app(state);
    let analyst = insert_user(&pool, "data_analyst", None).await?;
    let admin = insert_user(&pool, "admin", None).await?;

    let (_, approval_id, token) = suspend_raw_query(&app, &analyst).await?;

    let forged = format!("{token}0");
    let (status, body) = post_json(
        &app,
        &format!("/api/approvals/{approval_id}"),
        json!({
            "approver_external_id": admin,
            "decision": "approve",
            "reason": "forged",
            "token": forged,
        }),
    )
    .await?;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["kind"], "approval.token_invalid");

    Ok(())
}

#[tokio::test]
async fn sweep_expires_stale_requests() -> Result<()> {
    run_test(run_sweep).await
}

async fn run_sweep(pool: PgPool) -> Result<()> {
    let state = build_state(pool.clone())?;
    let app = build_app(Arc::clone(&state));
    let analyst = insert_user(&pool, "data_analyst", None).await?;

    let (request_id, approval_id, _token) = suspend_raw_query(&app, &analyst).await?;

    sqlx::query(
        "UPDATE internal.approval_requests SET token_expires_at = now() - interval '1 hour'
         WHERE approval_id = $1",
    )
    .bind(approval_id)
    .execute(&pool)
    .await?;

    let service = ApprovalService::new(Arc::clone(&state));
    let swept = service.sweep().await.expect("sweep should succeed");
    assert!(swept >= 1);

    let status: String = sqlx::query_scalar(
        "SELECT status FROM internal.approval_requests WHERE approval_id = $1",
    )
    .bind(approval_id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(status, "expired");

    let mut decisions = audit_decisions(&pool, request_id).await?;
    decisions.sort();
    assert_eq!(decisions, vec!["expired", "require_approval"]);

    Ok(())
}
