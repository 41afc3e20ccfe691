//! Request orchestration: Received -> Analyzed -> Decided -> (Executed |
//! Suspended | Refused) -> Logged -> Responded.
//!
//! Backing service for `POST /tools/call` in `api/rest/tools.rs`. The audit
//! write always happens before the response leaves this module; concurrent
//! arrivals sharing a `request_id` collapse onto the first caller's outcome.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    analysis::{rewrite, sql},
    domain::{
        catalog, policy,
        decision::{DecisionInput, DecisionOutput},
        models::{Decision, QueryKind, ToolName, UserIdentity},
    },
    infrastructure::{
        identity,
        state::{AppState, RequestSlot},
    },
    services::{
        approvals::ApprovalService,
        audit::{self, AuditDraft},
        errors::ServiceError,
        executor::{ExecutionResult, SqlInputs, ToolExecutor},
    },
};

/// Envelope accepted by `POST /tools/call`. `request_id` is the caller's
/// idempotency key; identity fields beyond `external_user_id` are ignored.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ToolCallEnvelope {
    pub request_id: Uuid,
    #[validate(length(min = 1, max = 128))]
    pub external_user_id: String,
    #[validate(length(min = 1, max = 64))]
    pub tool_name: String,
    #[serde(default = "empty_inputs")]
    pub inputs: Value,
}

fn empty_inputs() -> Value {
    json!({})
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionSummary {
    pub reason: String,
    pub rule_ids: Vec<String>,
    pub constraints: Value,
}

impl DecisionSummary {
    fn from_output(output: &DecisionOutput) -> Self {
        Self {
            reason: output.reason.clone(),
            rule_ids: output.rule_ids.clone(),
            constraints: serde_json::to_value(&output.constraints).unwrap_or_else(|_| json!({})),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResponse {
    pub status: String,
    pub request_id: Uuid,
    pub decision: DecisionSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<Uuid>,
    /// Token the admin acts under; validated again server-side, so holding
    /// it does not by itself authorize anything.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct DispatchService {
    state: Arc<AppState>,
}

impl DispatchService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn dispatch(
        &self,
        envelope: ToolCallEnvelope,
    ) -> Result<ToolCallResponse, ServiceError> {
        envelope
            .validate()
            .map_err(|err| ServiceError::MalformedEnvelope(err.to_string()))?;
        let tool = ToolName::from_str(&envelope.tool_name)
            .map_err(ServiceError::MalformedEnvelope)?;

        let caller = identity::resolve(&self.state.pool, &envelope.external_user_id).await?;

        // Idempotency: a request id that already reached a terminal outcome
        // replays it instead of executing twice.
        if let Some(entry) = audit::find_latest(&self.state.pool, envelope.request_id).await? {
            return self.replay(envelope.request_id, entry).await;
        }

        let _guard = match self.state.begin_request(envelope.request_id) {
            RequestSlot::Owner(guard) => guard,
            RequestSlot::Follower(mut receiver) => {
                // First caller owns the execution; wait for its audit write,
                // then replay the recorded outcome.
                let _ = receiver.wait_for(|done| *done).await;
                let entry = audit::find_latest(&self.state.pool, envelope.request_id)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::Internal(
                            "collapsed request finished without a recorded outcome".to_string(),
                        )
                    })?;
                return self.replay(envelope.request_id, entry).await;
            }
        };

        self.run(envelope, tool, caller).await
    }

    async fn run(
        &self,
        envelope: ToolCallEnvelope,
        tool: ToolName,
        caller: UserIdentity,
    ) -> Result<ToolCallResponse, ServiceError> {
        let bundle = self.state.current_bundle();

        let decision_input = match self.build_decision_input(&envelope, tool, &caller).await {
            Ok(input) => input,
            Err(BuildInputError::Malformed(err)) => return Err(err),
            Err(BuildInputError::Parse(parse_error)) => {
                // Unparseable SQL is a refusal, not a transport error.
                let output = DecisionOutput {
                    decision: Decision::Deny,
                    reason: format!("SQL could not be analyzed: {parse_error}"),
                    rule_ids: vec!["analyzer.parse_error".to_string()],
                    constraints: Default::default(),
                };
                self.write_audit(
                    &envelope,
                    &caller,
                    &output,
                    None,
                    Some("analyzer.parse_error".to_string()),
                )
                .await?;
                return Ok(refusal(envelope.request_id, &output));
            }
        };

        let output = policy::evaluate(&bundle, &decision_input);
        info!(
            request_id = %envelope.request_id,
            tool = tool.as_str(),
            role = caller.role.as_str(),
            decision = output.decision.as_str(),
            rule_ids = ?output.rule_ids,
            "policy decision"
        );

        match output.decision {
            Decision::Deny => {
                self.write_audit(&envelope, &caller, &output, None, None)
                    .await?;
                Ok(refusal(envelope.request_id, &output))
            }
            Decision::RequireApproval => {
                let approvals = ApprovalService::new(Arc::clone(&self.state));
                let pending = approvals
                    .suspend(&caller, &envelope, tool, &decision_input, &output)
                    .await?;
                self.write_audit(&envelope, &caller, &output, None, None)
                    .await?;
                Ok(ToolCallResponse {
                    status: "pending".to_string(),
                    request_id: envelope.request_id,
                    decision: DecisionSummary::from_output(&output),
                    result: None,
                    approval_id: Some(pending.approval_id),
                    approval_token: Some(pending.signed_token),
                    expires_at: Some(pending.token_expires_at),
                })
            }
            Decision::Allow => {
                let executed = execute_with_constraints(
                    &self.state,
                    &caller,
                    envelope.request_id,
                    tool,
                    &envelope.inputs,
                    &decision_input,
                    &output,
                )
                .await;

                match executed {
                    Ok(result) => {
                        self.write_audit(&envelope, &caller, &output, Some(&result), None)
                            .await?;
                        Ok(ToolCallResponse {
                            status: "allow".to_string(),
                            request_id: envelope.request_id,
                            decision: DecisionSummary::from_output(&output),
                            result: Some(result.output),
                            approval_id: None,
                            approval_token: None,
                            expires_at: None,
                        })
                    }
                    Err(err) => {
                        warn!(
                            request_id = %envelope.request_id,
                            kind = err.kind(),
                            "tool execution failed"
                        );
                        self.write_audit(
                            &envelope,
                            &caller,
                            &output,
                            None,
                            Some(err.kind().to_string()),
                        )
                        .await?;
                        Err(err)
                    }
                }
            }
        }
    }

    async fn build_decision_input(
        &self,
        envelope: &ToolCallEnvelope,
        tool: ToolName,
        caller: &UserIdentity,
    ) -> Result<DecisionInput, BuildInputError> {
        if tool != ToolName::RunSql {
            return Ok(DecisionInput::for_tool(caller.role, caller.region, tool));
        }

        let inputs: SqlInputs = serde_json::from_value(envelope.inputs.clone())
            .map_err(|err| BuildInputError::Malformed(ServiceError::MalformedEnvelope(err.to_string())))?;
        let facts = sql::analyze(&inputs.query).map_err(BuildInputError::Parse)?;

        Ok(DecisionInput {
            role: caller.role,
            region: caller.region,
            tool,
            tables: facts.tables,
            columns: facts.columns,
            query_kind: Some(facts.kind),
            has_limit: facts.has_limit,
            is_aggregate: facts.is_aggregate,
            row_count: inputs.row_count,
        })
    }

    async fn write_audit(
        &self,
        envelope: &ToolCallEnvelope,
        caller: &UserIdentity,
        output: &DecisionOutput,
        result: Option<&ExecutionResult>,
        error: Option<String>,
    ) -> Result<(), ServiceError> {
        audit::write(
            &self.state.pool,
            AuditDraft {
                request_id: envelope.request_id,
                external_user_id: caller.external_user_id.clone(),
                role: caller.role.as_str().to_string(),
                tool_name: envelope.tool_name.clone(),
                inputs: envelope.inputs.clone(),
                outputs: result.map(|r| r.output.clone()),
                decision: output.decision.as_str().to_string(),
                rule_ids: output.rule_ids.clone(),
                constraints: serde_json::to_value(&output.constraints)
                    .unwrap_or_else(|_| json!({})),
                latency_ms: result.map(|r| r.latency_ms),
                row_count: result.and_then(|r| r.row_count),
                error,
            },
        )
        .await?;
        Ok(())
    }

    /// Reconstructs a response for a collapsed duplicate from the audit log.
    async fn replay(
        &self,
        request_id: Uuid,
        entry: crate::domain::models::AuditEntry,
    ) -> Result<ToolCallResponse, ServiceError> {
        let status = match entry.decision.as_str() {
            "allow" | "approved" => "allow",
            "require_approval" => "pending",
            _ => "deny",
        };

        let (approval_id, expires_at) = if status == "pending" {
            let approvals = ApprovalService::new(Arc::clone(&self.state));
            match approvals.find_by_request(request_id).await? {
                Some(approval) => (Some(approval.approval_id), Some(approval.token_expires_at)),
                None => (None, None),
            }
        } else {
            (None, None)
        };

        Ok(ToolCallResponse {
            status: status.to_string(),
            request_id,
            decision: DecisionSummary {
                reason: "outcome replayed from audit log".to_string(),
                rule_ids: entry.rule_ids,
                constraints: entry.constraints,
            },
            result: entry.outputs_redacted,
            approval_id,
            approval_token: None,
            expires_at,
        })
    }
}

enum BuildInputError {
    Malformed(ServiceError),
    Parse(sql::SqlError),
}

fn refusal(request_id: Uuid, output: &DecisionOutput) -> ToolCallResponse {
    ToolCallResponse {
        status: "deny".to_string(),
        request_id,
        decision: DecisionSummary::from_output(output),
        result: None,
        approval_id: None,
        approval_token: None,
        expires_at: None,
    }
}

/// Applies the decision's constraints to the call and runs it. Shared by the
/// dispatch path and the post-approval resume path.
pub(crate) async fn execute_with_constraints(
    state: &Arc<AppState>,
    caller: &UserIdentity,
    request_id: Uuid,
    tool: ToolName,
    inputs: &Value,
    decision_input: &DecisionInput,
    output: &DecisionOutput,
) -> Result<ExecutionResult, ServiceError> {
    let executor = ToolExecutor::new(Arc::clone(state));

    if tool != ToolName::RunSql {
        return executor
            .execute(caller, request_id, tool, inputs, &output.constraints)
            .await;
    }

    let parsed: SqlInputs = serde_json::from_value(inputs.clone())
        .map_err(|err| ServiceError::MalformedEnvelope(err.to_string()))?;
    let mut query = parsed.query;

    if let Some(region) = output.constraints.region_filter {
        if let Some((_, region_column)) = catalog::first_region_bearing(&decision_input.tables) {
            query = rewrite::inject_region_filter(&query, region_column, region)
                .map_err(|err| ServiceError::Internal(err.to_string()))?;
        }
    }

    // Redundant net behind tables.limit_required: aggregate SELECTs from
    // capped roles still get a bound.
    let bundle = state.current_bundle();
    let wants_limit = decision_input.query_kind == Some(QueryKind::Select)
        && !decision_input.has_limit
        && !bundle.tables.unlimited_select_roles.contains(&caller.role);
    if wants_limit {
        query = rewrite::inject_limit(&query, state.config.executor.default_row_cap)
            .map_err(|err| ServiceError::Internal(err.to_string()))?;
    }

    let rewritten = json!({ "query": query, "row_count": parsed.row_count });
    executor
        .execute(caller, request_id, tool, &rewritten, &output.constraints)
        .await
}
