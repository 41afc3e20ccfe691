//! Tool execution under a scoped database session.
//!
//! Every `run_sql` call runs inside its own transaction with
//! `app.user_role` / `app.user_region` set locally, so the database's row
//! security rules see the caller even if a policy rewrite was bypassed.
//! Wall-clock latency and row counts are measured here for the audit trail.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{postgres::PgRow, Column, Row, TypeInfo};
use tracing::debug;
use uuid::Uuid;

use crate::{
    analysis::rewrite::apply_masks,
    domain::{
        decision::Constraints,
        models::{ToolName, UserIdentity},
    },
    infrastructure::state::AppState,
    services::{audit::redact_error_message, errors::ServiceError},
};

const CHART_TYPES: &[&str] = &["bar", "line", "pie", "scatter", "area"];

#[derive(Debug, Deserialize)]
pub struct SqlInputs {
    pub query: String,
    #[serde(default)]
    pub row_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SearchInputs {
    pub query: String,
    #[serde(default = "default_search_k")]
    pub k: i64,
}

fn default_search_k() -> i64 {
    5
}

#[derive(Debug, Deserialize)]
pub struct ExplainInputs {
    pub metric_name: String,
}

#[derive(Debug, Deserialize)]
pub struct ChartInputs {
    pub data: Vec<Value>,
    pub chart_type: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub output: Value,
    pub row_count: Option<i64>,
    pub latency_ms: i64,
}

pub struct ToolExecutor {
    state: Arc<AppState>,
}

impl ToolExecutor {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Dispatches to the concrete tool handler. `inputs` may have been
    /// rewritten by the constraint applier before arriving here.
    pub async fn execute(
        &self,
        identity: &UserIdentity,
        request_id: Uuid,
        tool: ToolName,
        inputs: &Value,
        constraints: &Constraints,
    ) -> Result<ExecutionResult, ServiceError> {
        let started = Instant::now();
        let (output, row_count) = match tool {
            ToolName::RunSql => self.run_sql(identity, inputs, constraints).await?,
            ToolName::SearchDocs => self.search_docs(identity, inputs).await?,
            ToolName::ExplainMetric => self.explain_metric(inputs).await?,
            ToolName::GenerateChart => self.generate_chart(request_id, inputs).await?,
        };

        Ok(ExecutionResult {
            output,
            row_count,
            latency_ms: started.elapsed().as_millis() as i64,
        })
    }

    async fn run_sql(
        &self,
        identity: &UserIdentity,
        inputs: &Value,
        constraints: &Constraints,
    ) -> Result<(Value, Option<i64>), ServiceError> {
        let inputs: SqlInputs = parse_inputs(inputs)?;
        let cap = self.state.config.row_cap_for(identity.role);
        let timeout = self.state.config.executor_timeout();

        let work = async {
            let mut conn = self.state.pool.acquire().await.map_err(map_sql_error)?;
            let mut tx = sqlx::Connection::begin(&mut *conn).await.map_err(map_sql_error)?;

            // Session context for the database's own row security; local to
            // the transaction, so it resets when the connection returns to
            // the pool.
            sqlx::query("SELECT set_config('app.user_role', $1, true)")
                .bind(identity.role.as_str())
                .execute(tx.as_mut())
                .await
                .map_err(map_sql_error)?;
            if let Some(region) = identity.region {
                sqlx::query("SELECT set_config('app.user_region', $1, true)")
                    .bind(region.as_str())
                    .execute(tx.as_mut())
                    .await
                    .map_err(map_sql_error)?;
            }
            sqlx::query("SELECT set_config('statement_timeout', $1, true)")
                .bind((timeout.as_millis() as i64).to_string())
                .execute(tx.as_mut())
                .await
                .map_err(map_sql_error)?;

            let mut rows: Vec<Value> = Vec::new();
            let mut columns: Vec<String> = Vec::new();
            let mut truncated = false;
            {
                let mut stream = sqlx::query(&inputs.query).fetch(tx.as_mut());
                while let Some(row) = stream.next().await {
                    let row = row.map_err(map_sql_error)?;
                    if columns.is_empty() {
                        columns = row
                            .columns()
                            .iter()
                            .map(|column| column.name().to_string())
                            .collect();
                    }
                    if rows.len() as i64 >= cap {
                        truncated = true;
                        break;
                    }
                    rows.push(row_to_json(&row));
                }
            }

            tx.commit().await.map_err(map_sql_error)?;
            Ok::<_, ServiceError>((rows, columns, truncated))
        };

        let (mut rows, columns, truncated) = tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| ServiceError::Timeout)??;

        apply_masks(&mut rows, &constraints.masked_columns);

        let row_count = rows.len() as i64;
        debug!(row_count, truncated, "sql execution complete");
        Ok((
            json!({
                "columns": columns,
                "rows": rows,
                "row_count": row_count,
                "truncated": truncated,
                // The statement as executed, rewrites included; it is the
                // evidence for what actually ran.
                "query": inputs.query,
            }),
            Some(row_count),
        ))
    }

    async fn search_docs(
        &self,
        identity: &UserIdentity,
        inputs: &Value,
    ) -> Result<(Value, Option<i64>), ServiceError> {
        let inputs: SearchInputs = parse_inputs(inputs)?;
        let k = inputs.k.clamp(1, self.state.config.executor.search_k_cap);

        let work = async {
            sqlx::query(
                r#"
                SELECT d.title, c.chunk_index, c.content, ts_rank(c.tsv, query) AS score
                FROM internal.doc_chunks c
                JOIN internal.documents d ON d.id = c.document_id,
                     websearch_to_tsquery('english', $1) AS query
                WHERE c.tsv @@ query
                  AND $2 = ANY(c.acl_roles)
                ORDER BY score DESC, c.chunk_index ASC
                LIMIT $3
                "#,
            )
            .bind(&inputs.query)
            .bind(identity.role.as_str())
            .bind(k)
            .fetch_all(&self.state.pool)
            .await
            .map_err(map_sql_error)
        };

        let rows = tokio::time::timeout(self.state.config.executor_timeout(), work)
            .await
            .map_err(|_| ServiceError::Timeout)??;

        let chunks: Vec<Value> = rows
            .iter()
            .map(|row| {
                json!({
                    "title": row.get::<String, _>("title"),
                    "chunk_index": row.get::<i32, _>("chunk_index"),
                    "content": row.get::<String, _>("content"),
                    "score": row.get::<f32, _>("score"),
                })
            })
            .collect();

        let count = chunks.len() as i64;
        Ok((json!({ "chunks": chunks, "k": k }), Some(count)))
    }

    async fn explain_metric(&self, inputs: &Value) -> Result<(Value, Option<i64>), ServiceError> {
        let inputs: ExplainInputs = parse_inputs(inputs)?;

        let work = async {
            sqlx::query(
                "SELECT name, definition, formula, owner
                 FROM internal.metrics
                 WHERE name = $1",
            )
            .bind(&inputs.metric_name)
            .fetch_optional(&self.state.pool)
            .await
            .map_err(map_sql_error)
        };

        let row = tokio::time::timeout(self.state.config.executor_timeout(), work)
            .await
            .map_err(|_| ServiceError::Timeout)??;

        match row {
            Some(row) => Ok((
                json!({
                    "name": row.get::<String, _>("name"),
                    "definition": row.get::<String, _>("definition"),
                    "formula": row.get::<Option<String>, _>("formula"),
                    "owner": row.get::<Option<String>, _>("owner"),
                    "found": true,
                }),
                Some(1),
            )),
            None => Ok((
                json!({ "name": inputs.metric_name, "found": false }),
                Some(0),
            )),
        }
    }

    /// Pure render: no data access beyond the rows the caller already holds.
    async fn generate_chart(
        &self,
        request_id: Uuid,
        inputs: &Value,
    ) -> Result<(Value, Option<i64>), ServiceError> {
        let inputs: ChartInputs = parse_inputs(inputs)?;

        if !CHART_TYPES.contains(&inputs.chart_type.as_str()) {
            return Err(ServiceError::MalformedEnvelope(format!(
                "unsupported chart_type '{}'",
                inputs.chart_type
            )));
        }
        if inputs.columns.is_empty() {
            return Err(ServiceError::MalformedEnvelope(
                "chart requires at least one column".to_string(),
            ));
        }
        if let Some(first) = inputs.data.first().and_then(Value::as_object) {
            for column in &inputs.columns {
                if !first.contains_key(column) {
                    return Err(ServiceError::MalformedEnvelope(format!(
                        "chart column '{column}' is not present in the data rows"
                    )));
                }
            }
        }

        let points = inputs.data.len() as i64;
        let spec = json!({
            "chart_type": &inputs.chart_type,
            "columns": &inputs.columns,
            "data": &inputs.data,
        });
        let key = format!("charts/{request_id}.json");
        let body = serde_json::to_vec(&spec)
            .map_err(|err| ServiceError::Internal(err.to_string()))?;
        self.state
            .storage
            .put(&key, Bytes::from(body), "application/json")
            .await
            .map_err(|err| ServiceError::Internal(err.to_string()))?;
        let url = self
            .state
            .storage
            .url_for(&key)
            .await
            .map_err(|err| ServiceError::Internal(err.to_string()))?;

        Ok((
            json!({
                "chart_type": inputs.chart_type,
                "artifact_key": key,
                "artifact_url": url,
                "points": points,
            }),
            Some(points),
        ))
    }
}

fn parse_inputs<T: serde::de::DeserializeOwned>(inputs: &Value) -> Result<T, ServiceError> {
    serde_json::from_value(inputs.clone())
        .map_err(|err| ServiceError::MalformedEnvelope(err.to_string()))
}

fn map_sql_error(err: sqlx::Error) -> ServiceError {
    match err {
        sqlx::Error::PoolTimedOut => ServiceError::PoolExhausted,
        other => ServiceError::Db(redact_error_message(&other.to_string())),
    }
}

fn row_to_json(row: &PgRow) -> Value {
    let mut object = serde_json::Map::with_capacity(row.columns().len());
    for (index, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), column_value(row, index));
    }
    Value::Object(object)
}

/// Decodes a cell by its Postgres type name, falling back to text. Types the
/// ladder does not know render as null rather than failing the whole result.
fn column_value(row: &PgRow, index: usize) -> Value {
    let type_name = row.columns()[index].type_info().name().to_uppercase();
    match type_name.as_str() {
        "BOOL" => opt(row.try_get::<Option<bool>, _>(index), Value::Bool),
        "INT2" => opt(row.try_get::<Option<i16>, _>(index), |v| json!(v)),
        "INT4" => opt(row.try_get::<Option<i32>, _>(index), |v| json!(v)),
        "INT8" => opt(row.try_get::<Option<i64>, _>(index), |v| json!(v)),
        "FLOAT4" => opt(row.try_get::<Option<f32>, _>(index), |v| json!(v)),
        "FLOAT8" => opt(row.try_get::<Option<f64>, _>(index), |v| json!(v)),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" => {
            opt(row.try_get::<Option<String>, _>(index), Value::String)
        }
        "UUID" => opt(row.try_get::<Option<Uuid>, _>(index), |v| {
            Value::String(v.to_string())
        }),
        "DATE" => opt(row.try_get::<Option<chrono::NaiveDate>, _>(index), |v| {
            Value::String(v.to_string())
        }),
        "TIMESTAMP" => opt(
            row.try_get::<Option<chrono::NaiveDateTime>, _>(index),
            |v| Value::String(v.to_string()),
        ),
        "TIMESTAMPTZ" => opt(
            row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index),
            |v| Value::String(v.to_rfc3339()),
        ),
        "JSON" | "JSONB" => opt(row.try_get::<Option<Value>, _>(index), |v| v),
        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

fn opt<T>(result: Result<Option<T>, sqlx::Error>, wrap: impl Fn(T) -> Value) -> Value {
    result.ok().flatten().map(wrap).unwrap_or(Value::Null)
}
