//! Synchronous audit persistence with redaction.
//!
//! Every terminal outcome of a tool invocation lands here exactly once, and
//! the write happens before the caller sees a response. A failed write aborts
//! the request; results are withheld rather than returned unlogged.

use regex::Regex;
use serde_json::Value;
use sqlx::{postgres::PgRow, Row};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::{
    domain::models::AuditEntry,
    infrastructure::db::PgPool,
    services::errors::ServiceError,
};

const REDACTED: &str = "[REDACTED]";

/// Field names whose values are always redacted, regardless of content.
const PII_FIELDS: &[&str] = &[
    "email",
    "phone",
    "address",
    "address_line1",
    "address_line2",
    "contact_name",
    "card_last_four",
    "ssn",
    "tax_id",
];

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email pattern")
    })
}

fn phone_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\+?\d{1,3}[-. (]{1,2}\d{3}[-. )]{1,2}\d{3}[-. ]?\d{2,4}").expect("phone pattern")
    })
}

fn card_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b(?:\d[ -]?){15}\d\b").expect("card pattern"))
}

fn scrub_string(input: &str) -> String {
    let pass = email_pattern().replace_all(input, REDACTED);
    let pass = card_pattern().replace_all(&pass, REDACTED);
    phone_pattern().replace_all(&pass, REDACTED).into_owned()
}

/// Recursive scrub: PII-named fields are overwritten wholesale, string values
/// are pattern-scrubbed. `preserve_keys` names top-level fields kept verbatim
/// (the SQL statement is its own evidence).
pub fn redact(value: &Value, preserve_keys: &[&str]) -> Value {
    match value {
        Value::Object(map) => {
            let mut scrubbed = serde_json::Map::with_capacity(map.len());
            for (key, inner) in map {
                if preserve_keys.iter().any(|p| p.eq_ignore_ascii_case(key)) {
                    scrubbed.insert(key.clone(), inner.clone());
                } else if PII_FIELDS.iter().any(|f| f.eq_ignore_ascii_case(key)) {
                    scrubbed.insert(key.clone(), Value::String(REDACTED.to_string()));
                } else {
                    scrubbed.insert(key.clone(), redact(inner, &[]));
                }
            }
            Value::Object(scrubbed)
        }
        Value::Array(items) => Value::Array(items.iter().map(|item| redact(item, &[])).collect()),
        Value::String(s) => Value::String(scrub_string(s)),
        other => other.clone(),
    }
}

pub fn redact_inputs(tool_name: &str, inputs: &Value) -> Value {
    if tool_name == "run_sql" {
        redact(inputs, &["query"])
    } else {
        redact(inputs, &[])
    }
}

pub fn redact_outputs(outputs: &Value) -> Value {
    redact(outputs, &[])
}

#[derive(Debug, Clone)]
pub struct AuditDraft {
    pub request_id: Uuid,
    pub external_user_id: String,
    pub role: String,
    pub tool_name: String,
    pub inputs: Value,
    pub outputs: Option<Value>,
    pub decision: String,
    pub rule_ids: Vec<String>,
    pub constraints: Value,
    pub latency_ms: Option<i64>,
    pub row_count: Option<i64>,
    pub error: Option<String>,
}

/// Persists one audit entry. Redaction runs here so no caller can forget it.
pub async fn write(pool: &PgPool, draft: AuditDraft) -> Result<Uuid, ServiceError> {
    let inputs_redacted = redact_inputs(&draft.tool_name, &draft.inputs);
    let outputs_redacted = draft.outputs.as_ref().map(redact_outputs);

    let log_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO internal.audit_logs
             (log_id, request_id, external_user_id, role, tool_name, inputs_redacted,
              outputs_redacted, decision, rule_ids, constraints, latency_ms, row_count, error, created_at)
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13, now())",
    )
    .bind(log_id)
    .bind(draft.request_id)
    .bind(&draft.external_user_id)
    .bind(&draft.role)
    .bind(&draft.tool_name)
    .bind(&inputs_redacted)
    .bind(&outputs_redacted)
    .bind(&draft.decision)
    .bind(&draft.rule_ids)
    .bind(&draft.constraints)
    .bind(draft.latency_ms)
    .bind(draft.row_count)
    .bind(&draft.error)
    .execute(pool)
    .await
    .map_err(|err| ServiceError::AuditWriteFailed(err.to_string()))?;

    Ok(log_id)
}

/// Most recent entry for a request id, used to replay collapsed duplicates.
pub async fn find_latest(
    pool: &PgPool,
    request_id: Uuid,
) -> Result<Option<AuditEntry>, ServiceError> {
    let row = sqlx::query(
        "SELECT log_id, request_id, external_user_id, role, tool_name, inputs_redacted,
                outputs_redacted, decision, rule_ids, constraints, latency_ms, row_count, error, created_at
         FROM internal.audit_logs
         WHERE request_id = $1
         ORDER BY created_at DESC, log_id DESC
         LIMIT 1",
    )
    .bind(request_id)
    .fetch_optional(pool)
    .await
    .map_err(|err| ServiceError::Db(err.to_string()))?;

    row.map(map_entry).transpose()
}

pub async fn count_for_request(pool: &PgPool, request_id: Uuid) -> Result<i64, ServiceError> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(1) FROM internal.audit_logs WHERE request_id = $1",
    )
    .bind(request_id)
    .fetch_one(pool)
    .await
    .map_err(|err| ServiceError::Db(err.to_string()))
}

fn map_entry(row: PgRow) -> Result<AuditEntry, ServiceError> {
    let internal = |err: sqlx::Error| ServiceError::Internal(err.to_string());
    Ok(AuditEntry {
        log_id: row.try_get("log_id").map_err(internal)?,
        request_id: row.try_get("request_id").map_err(internal)?,
        external_user_id: row.try_get("external_user_id").map_err(internal)?,
        role: row.try_get("role").map_err(internal)?,
        tool_name: row.try_get("tool_name").map_err(internal)?,
        inputs_redacted: row.try_get("inputs_redacted").map_err(internal)?,
        outputs_redacted: row.try_get("outputs_redacted").map_err(internal)?,
        decision: row.try_get("decision").map_err(internal)?,
        rule_ids: row.try_get("rule_ids").map_err(internal)?,
        constraints: row.try_get("constraints").map_err(internal)?,
        latency_ms: row.try_get("latency_ms").map_err(internal)?,
        row_count: row.try_get("row_count").map_err(internal)?,
        error: row.try_get("error").map_err(internal)?,
        created_at: row.try_get("created_at").map_err(internal)?,
    })
}

/// Redacts a database error message before it reaches a response or log line;
/// identifier fragments in messages can quote row data.
pub fn redact_error_message(message: &str) -> String {
    scrub_string(message)
}
