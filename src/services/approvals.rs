//! Second-party approval workflow for suspended tool calls.
//!
//! Backing service for `POST /approvals/:id` in `api/rest/approvals.rs` and
//! the expiry sweep in `jobs`, following the rules in `GOVERNANCE.md`
//! §"Admin Approval Workflow". A pending request freezes the envelope inputs
//! and the analyzed decision input; an admin decision under a valid token
//! either resumes execution (after re-running the access layers, so approval
//! can never widen authorization) or closes the request.

use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{postgres::PgRow, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    domain::{
        decision::{DecisionInput, DecisionOutput},
        models::{ApprovalRequest, ApprovalState, Decision, Role, ToolName, UserIdentity},
        policy,
    },
    infrastructure::{identity, state::AppState, tokens},
    services::{
        audit::{self, AuditDraft},
        dispatch::execute_with_constraints,
        errors::ServiceError,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverDecision {
    Approve,
    Deny,
}

/// Payload accepted by `POST /approvals/:id`.
#[derive(Debug, Deserialize)]
pub struct SubmitDecisionRequest {
    pub approver_external_id: String,
    pub decision: ApproverDecision,
    #[serde(default)]
    pub reason: Option<String>,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub approval_id: Uuid,
    pub signed_token: String,
    pub token_expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub status: ApprovalState,
    pub outcome: Value,
}

pub struct ApprovalService {
    state: Arc<AppState>,
}

impl ApprovalService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Persists a pending approval and mints its single-use token. The
    /// returned token is handed to the chat front-end for the admin prompt.
    pub async fn suspend(
        &self,
        caller: &UserIdentity,
        envelope: &crate::services::dispatch::ToolCallEnvelope,
        tool: ToolName,
        decision_input: &DecisionInput,
        output: &DecisionOutput,
    ) -> Result<PendingApproval, ServiceError> {
        let approval_id = Uuid::new_v4();
        let (signed_token, token_expires_at) = tokens::mint(
            self.state.config.approvals.token_secret.as_bytes(),
            approval_id,
            self.state.config.approval_ttl(),
        );

        let frozen_decision_input = serde_json::to_value(decision_input)
            .map_err(|err| ServiceError::Internal(err.to_string()))?;

        sqlx::query(
            "INSERT INTO internal.approval_requests
                 (approval_id, request_id, external_user_id, role, tool_name, frozen_inputs,
                  frozen_decision_input, reason, rule_ids, status, signed_token,
                  token_expires_at, created_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12, now())",
        )
        .bind(approval_id)
        .bind(envelope.request_id)
        .bind(&caller.external_user_id)
        .bind(caller.role.as_str())
        .bind(tool.as_str())
        .bind(&envelope.inputs)
        .bind(&frozen_decision_input)
        .bind(&output.reason)
        .bind(&output.rule_ids)
        .bind(ApprovalState::Pending.as_str())
        .bind(&signed_token)
        .bind(token_expires_at)
        .execute(&self.state.pool)
        .await
        .map_err(|err| ServiceError::Internal(err.to_string()))?;

        info!(%approval_id, request_id = %envelope.request_id, "tool call suspended for approval");
        Ok(PendingApproval {
            approval_id,
            signed_token,
            token_expires_at,
        })
    }

    /// Validates and applies one approver decision. Re-entry after a terminal
    /// state replays the recorded outcome instead of deciding again.
    pub async fn submit(
        &self,
        approval_id: Uuid,
        payload: SubmitDecisionRequest,
    ) -> Result<SubmitOutcome, ServiceError> {
        let approval = self
            .find_by_id(approval_id)
            .await?
            .ok_or(ServiceError::NotFound)?;

        if let Err(token_err) = tokens::verify(
            self.state.config.approvals.token_secret.as_bytes(),
            &payload.token,
            approval_id,
        ) {
            let err = match token_err {
                tokens::TokenError::Expired => ServiceError::TokenExpired,
                _ => ServiceError::TokenInvalid,
            };
            self.audit_callback_failure(&approval, &err).await?;
            return Err(err);
        }

        let approver =
            identity::resolve(&self.state.pool, &payload.approver_external_id).await?;
        if approver.role != Role::Admin {
            let err = ServiceError::NotAdmin;
            self.audit_callback_failure(&approval, &err).await?;
            return Err(err);
        }
        if approver.external_user_id == approval.external_user_id {
            let err = ServiceError::SelfApproval;
            self.audit_callback_failure(&approval, &err).await?;
            return Err(err);
        }

        if approval.status.is_terminal() {
            return Ok(recorded_outcome(&approval));
        }

        let new_status = match payload.decision {
            ApproverDecision::Approve => ApprovalState::Approved,
            ApproverDecision::Deny => ApprovalState::Denied,
        };

        // Optimistic compare-and-set; a concurrent decision wins and this
        // caller receives the recorded outcome.
        let updated = sqlx::query(
            "UPDATE internal.approval_requests
             SET status = $1, approver_external_id = $2, approver_decision = $3,
                 approver_reason = $4, decided_at = now()
             WHERE approval_id = $5 AND status = 'pending'",
        )
        .bind(new_status.as_str())
        .bind(&approver.external_user_id)
        .bind(match payload.decision {
            ApproverDecision::Approve => "approve",
            ApproverDecision::Deny => "deny",
        })
        .bind(&payload.reason)
        .bind(approval_id)
        .execute(&self.state.pool)
        .await
        .map_err(|err| ServiceError::Internal(err.to_string()))?;

        if updated.rows_affected() == 0 {
            let decided = self
                .find_by_id(approval_id)
                .await?
                .ok_or(ServiceError::NotFound)?;
            return Ok(recorded_outcome(&decided));
        }

        match new_status {
            ApprovalState::Denied => {
                audit::write(
                    &self.state.pool,
                    AuditDraft {
                        request_id: approval.request_id,
                        external_user_id: approval.external_user_id.clone(),
                        role: approval.role.as_str().to_string(),
                        tool_name: approval.tool_name.as_str().to_string(),
                        inputs: approval.frozen_inputs.clone(),
                        outputs: None,
                        decision: "denied".to_string(),
                        rule_ids: vec!["approval.denied".to_string()],
                        constraints: json!({}),
                        latency_ms: None,
                        row_count: None,
                        error: None,
                    },
                )
                .await?;
                Ok(SubmitOutcome {
                    status: ApprovalState::Denied,
                    outcome: json!({
                        "executed": false,
                        "approver_external_id": approver.external_user_id,
                        "reason": payload.reason,
                    }),
                })
            }
            ApprovalState::Approved => {
                audit::write(
                    &self.state.pool,
                    AuditDraft {
                        request_id: approval.request_id,
                        external_user_id: approval.external_user_id.clone(),
                        role: approval.role.as_str().to_string(),
                        tool_name: approval.tool_name.as_str().to_string(),
                        inputs: approval.frozen_inputs.clone(),
                        outputs: None,
                        decision: "approved".to_string(),
                        rule_ids: vec!["approval.approved".to_string()],
                        constraints: json!({}),
                        latency_ms: None,
                        row_count: None,
                        error: None,
                    },
                )
                .await?;
                self.resume(&approval, &approver).await
            }
            _ => unreachable!("submit only transitions to approved or denied"),
        }
    }

    /// Executes the frozen call after approval. The access layers re-run
    /// against the current bundle; a tightened bundle still denies.
    async fn resume(
        &self,
        approval: &ApprovalRequest,
        approver: &UserIdentity,
    ) -> Result<SubmitOutcome, ServiceError> {
        let decision_input: DecisionInput =
            serde_json::from_value(approval.frozen_decision_input.clone())
                .map_err(|err| ServiceError::Internal(err.to_string()))?;

        // Requester identity with the role and region captured at request
        // time; a later role change does not alter the approved call.
        let mut requester =
            identity::resolve(&self.state.pool, &approval.external_user_id).await?;
        requester.role = decision_input.role;
        requester.region = decision_input.region;

        let bundle = self.state.current_bundle();
        let post = policy::evaluate_post_approval(&bundle, &decision_input);

        if post.decision == Decision::Deny {
            warn!(
                approval_id = %approval.approval_id,
                rule_ids = ?post.rule_ids,
                "approved call denied on re-evaluation"
            );
            audit::write(
                &self.state.pool,
                AuditDraft {
                    request_id: approval.request_id,
                    external_user_id: approval.external_user_id.clone(),
                    role: approval.role.as_str().to_string(),
                    tool_name: approval.tool_name.as_str().to_string(),
                    inputs: approval.frozen_inputs.clone(),
                    outputs: None,
                    decision: "deny".to_string(),
                    rule_ids: post.rule_ids.clone(),
                    constraints: json!({}),
                    latency_ms: None,
                    row_count: None,
                    error: None,
                },
            )
            .await?;
            return Ok(SubmitOutcome {
                status: ApprovalState::Approved,
                outcome: json!({
                    "executed": false,
                    "denied_on_reevaluation": true,
                    "reason": post.reason,
                    "rule_ids": post.rule_ids,
                }),
            });
        }

        let executed = execute_with_constraints(
            &self.state,
            &requester,
            approval.request_id,
            approval.tool_name,
            &approval.frozen_inputs,
            &decision_input,
            &post,
        )
        .await;

        match executed {
            Ok(result) => {
                audit::write(
                    &self.state.pool,
                    AuditDraft {
                        request_id: approval.request_id,
                        external_user_id: approval.external_user_id.clone(),
                        role: approval.role.as_str().to_string(),
                        tool_name: approval.tool_name.as_str().to_string(),
                        inputs: approval.frozen_inputs.clone(),
                        outputs: Some(result.output.clone()),
                        decision: "allow".to_string(),
                        rule_ids: post.rule_ids.clone(),
                        constraints: serde_json::to_value(&post.constraints)
                            .unwrap_or_else(|_| json!({})),
                        latency_ms: Some(result.latency_ms),
                        row_count: result.row_count,
                        error: None,
                    },
                )
                .await?;
                Ok(SubmitOutcome {
                    status: ApprovalState::Approved,
                    outcome: json!({
                        "executed": true,
                        "approver_external_id": approver.external_user_id,
                        "result": result.output,
                    }),
                })
            }
            Err(err) => {
                audit::write(
                    &self.state.pool,
                    AuditDraft {
                        request_id: approval.request_id,
                        external_user_id: approval.external_user_id.clone(),
                        role: approval.role.as_str().to_string(),
                        tool_name: approval.tool_name.as_str().to_string(),
                        inputs: approval.frozen_inputs.clone(),
                        outputs: None,
                        decision: "allow".to_string(),
                        rule_ids: post.rule_ids.clone(),
                        constraints: json!({}),
                        latency_ms: None,
                        row_count: None,
                        error: Some(err.kind().to_string()),
                    },
                )
                .await?;
                Err(err)
            }
        }
    }

    /// Lazily expires pending requests whose tokens have lapsed, writing one
    /// audit entry per expiry. Returns how many were swept.
    pub async fn sweep(&self) -> Result<u64, ServiceError> {
        let expired = sqlx::query(
            "UPDATE internal.approval_requests
             SET status = 'expired', decided_at = now()
             WHERE status = 'pending' AND token_expires_at < now()
             RETURNING approval_id, request_id, external_user_id, role, tool_name, frozen_inputs",
        )
        .fetch_all(&self.state.pool)
        .await
        .map_err(|err| ServiceError::Internal(err.to_string()))?;

        for row in &expired {
            let request_id: Uuid = row.get("request_id");
            audit::write(
                &self.state.pool,
                AuditDraft {
                    request_id,
                    external_user_id: row.get("external_user_id"),
                    role: row.get("role"),
                    tool_name: row.get("tool_name"),
                    inputs: row.get("frozen_inputs"),
                    outputs: None,
                    decision: "expired".to_string(),
                    rule_ids: vec!["approval.expired".to_string()],
                    constraints: json!({}),
                    latency_ms: None,
                    row_count: None,
                    error: None,
                },
            )
            .await?;
        }

        Ok(expired.len() as u64)
    }

    pub async fn find_by_id(
        &self,
        approval_id: Uuid,
    ) -> Result<Option<ApprovalRequest>, ServiceError> {
        let row = sqlx::query(APPROVAL_SELECT)
            .bind(approval_id)
            .fetch_optional(&self.state.pool)
            .await
            .map_err(|err| ServiceError::Internal(err.to_string()))?;
        row.map(map_approval).transpose()
    }

    pub async fn find_by_request(
        &self,
        request_id: Uuid,
    ) -> Result<Option<ApprovalRequest>, ServiceError> {
        let row = sqlx::query(APPROVAL_SELECT_BY_REQUEST)
            .bind(request_id)
            .fetch_optional(&self.state.pool)
            .await
            .map_err(|err| ServiceError::Internal(err.to_string()))?;
        row.map(map_approval).transpose()
    }

    /// Approval-callback misuse is audited against the suspended request
    /// before the error response goes out.
    async fn audit_callback_failure(
        &self,
        approval: &ApprovalRequest,
        err: &ServiceError,
    ) -> Result<(), ServiceError> {
        audit::write(
            &self.state.pool,
            AuditDraft {
                request_id: approval.request_id,
                external_user_id: approval.external_user_id.clone(),
                role: approval.role.as_str().to_string(),
                tool_name: approval.tool_name.as_str().to_string(),
                inputs: approval.frozen_inputs.clone(),
                outputs: None,
                decision: "error".to_string(),
                rule_ids: vec![err.kind().to_string()],
                constraints: json!({}),
                latency_ms: None,
                row_count: None,
                error: Some(err.kind().to_string()),
            },
        )
        .await
        .map(|_| ())
    }
}

fn recorded_outcome(approval: &ApprovalRequest) -> SubmitOutcome {
    SubmitOutcome {
        status: approval.status,
        outcome: json!({
            "already_decided": true,
            "status": approval.status.as_str(),
            "approver_external_id": approval.approver_external_id,
            "approver_decision": approval.approver_decision,
            "decided_at": approval.decided_at,
        }),
    }
}

const APPROVAL_SELECT: &str =
    "SELECT approval_id, request_id, external_user_id, role, tool_name, frozen_inputs,
            frozen_decision_input, reason, rule_ids, status, approver_external_id,
            approver_decision, approver_reason, signed_token, token_expires_at, created_at, decided_at
     FROM internal.approval_requests
     WHERE approval_id = $1";

const APPROVAL_SELECT_BY_REQUEST: &str =
    "SELECT approval_id, request_id, external_user_id, role, tool_name, frozen_inputs,
            frozen_decision_input, reason, rule_ids, status, approver_external_id,
            approver_decision, approver_reason, signed_token, token_expires_at, created_at, decided_at
     FROM internal.approval_requests
     WHERE request_id = $1
     ORDER BY created_at DESC
     LIMIT 1";

fn map_approval(row: PgRow) -> Result<ApprovalRequest, ServiceError> {
    let internal = |err: sqlx::Error| ServiceError::Internal(err.to_string());
    let role_raw: String = row.try_get("role").map_err(internal)?;
    let tool_raw: String = row.try_get("tool_name").map_err(internal)?;
    let status_raw: String = row.try_get("status").map_err(internal)?;

    Ok(ApprovalRequest {
        approval_id: row.try_get("approval_id").map_err(internal)?,
        request_id: row.try_get("request_id").map_err(internal)?,
        external_user_id: row.try_get("external_user_id").map_err(internal)?,
        role: Role::from_str(&role_raw).map_err(ServiceError::Internal)?,
        tool_name: ToolName::from_str(&tool_raw).map_err(ServiceError::Internal)?,
        frozen_inputs: row.try_get("frozen_inputs").map_err(internal)?,
        frozen_decision_input: row.try_get("frozen_decision_input").map_err(internal)?,
        reason: row.try_get("reason").map_err(internal)?,
        rule_ids: row.try_get("rule_ids").map_err(internal)?,
        status: ApprovalState::from_str(&status_raw).map_err(ServiceError::Internal)?,
        approver_external_id: row.try_get("approver_external_id").map_err(internal)?,
        approver_decision: row.try_get("approver_decision").map_err(internal)?,
        approver_reason: row.try_get("approver_reason").map_err(internal)?,
        signed_token: row.try_get("signed_token").map_err(internal)?,
        token_expires_at: row.try_get("token_expires_at").map_err(internal)?,
        created_at: row.try_get("created_at").map_err(internal)?,
        decided_at: row.try_get("decided_at").map_err(internal)?,
    })
}
