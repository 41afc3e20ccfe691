use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Intern,
    Marketing,
    Sales,
    DataAnalyst,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Intern => "intern",
            Role::Marketing => "marketing",
            Role::Sales => "sales",
            Role::DataAnalyst => "data_analyst",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "intern" => Ok(Role::Intern),
            "marketing" => Ok(Role::Marketing),
            "sales" => Ok(Role::Sales),
            "data_analyst" => Ok(Role::DataAnalyst),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role {other}")),
        }
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Region {
    Na,
    Emea,
    Apac,
    Latam,
}

impl Region {
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Na => "NA",
            Region::Emea => "EMEA",
            Region::Apac => "APAC",
            Region::Latam => "LATAM",
        }
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "NA" => Ok(Region::Na),
            "EMEA" => Ok(Region::Emea),
            "APAC" => Ok(Region::Apac),
            "LATAM" => Ok(Region::Latam),
            other => Err(format!("unknown region {other}")),
        }
    }
}

impl From<Region> for String {
    fn from(region: Region) -> Self {
        region.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    RunSql,
    SearchDocs,
    ExplainMetric,
    GenerateChart,
}

impl ToolName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::RunSql => "run_sql",
            ToolName::SearchDocs => "search_docs",
            ToolName::ExplainMetric => "explain_metric",
            ToolName::GenerateChart => "generate_chart",
        }
    }
}

impl FromStr for ToolName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "run_sql" => Ok(ToolName::RunSql),
            "search_docs" => Ok(ToolName::SearchDocs),
            "explain_metric" => Ok(ToolName::ExplainMetric),
            "generate_chart" => Ok(ToolName::GenerateChart),
            other => Err(format!("unknown tool {other}")),
        }
    }
}

impl From<ToolName> for String {
    fn from(tool: ToolName) -> Self {
        tool.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Select => "select",
            QueryKind::Insert => "insert",
            QueryKind::Update => "update",
            QueryKind::Delete => "delete",
            QueryKind::Create => "create",
            QueryKind::Drop => "drop",
            QueryKind::Alter => "alter",
        }
    }

    pub fn is_select(&self) -> bool {
        matches!(self, QueryKind::Select)
    }
}

impl FromStr for QueryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "select" => Ok(QueryKind::Select),
            "insert" => Ok(QueryKind::Insert),
            "update" => Ok(QueryKind::Update),
            "delete" => Ok(QueryKind::Delete),
            "create" => Ok(QueryKind::Create),
            "drop" => Ok(QueryKind::Drop),
            "alter" => Ok(QueryKind::Alter),
            other => Err(format!("unknown query kind {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
    RequireApproval,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
            Decision::RequireApproval => "require_approval",
        }
    }
}

impl From<Decision> for String {
    fn from(decision: Decision) -> Self {
        decision.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalState::Pending => "pending",
            ApprovalState::Approved => "approved",
            ApprovalState::Denied => "denied",
            ApprovalState::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalState::Pending)
    }
}

impl FromStr for ApprovalState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ApprovalState::Pending),
            "approved" => Ok(ApprovalState::Approved),
            "denied" => Ok(ApprovalState::Denied),
            "expired" => Ok(ApprovalState::Expired),
            other => Err(format!("unknown approval state {other}")),
        }
    }
}

impl From<ApprovalState> for String {
    fn from(state: ApprovalState) -> Self {
        state.as_str().to_string()
    }
}

/// Server-side authoritative identity for a chat user. Role and region come
/// from `internal.users`, never from the request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: Uuid,
    pub external_user_id: String,
    pub display_name: String,
    pub role: Role,
    pub region: Option<Region>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: Uuid,
    pub request_id: Uuid,
    pub external_user_id: String,
    pub role: Role,
    pub tool_name: ToolName,
    pub frozen_inputs: serde_json::Value,
    pub frozen_decision_input: serde_json::Value,
    pub reason: String,
    pub rule_ids: Vec<String>,
    pub status: ApprovalState,
    pub approver_external_id: Option<String>,
    pub approver_decision: Option<String>,
    pub approver_reason: Option<String>,
    pub signed_token: String,
    pub token_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub log_id: Uuid,
    pub request_id: Uuid,
    pub external_user_id: String,
    pub role: String,
    pub tool_name: String,
    pub inputs_redacted: serde_json::Value,
    pub outputs_redacted: Option<serde_json::Value>,
    pub decision: String,
    pub rule_ids: Vec<String>,
    pub constraints: serde_json::Value,
    pub latency_ms: Option<i64>,
    pub row_count: Option<i64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}
