//! Policy bundle and decision aggregation.
//!
//! The five rule layers (`rbac`, `tables`, `columns`, `rows`, `approval`) are
//! pure functions over a [`DecisionInput`] and the data tables in
//! [`PolicyBundle`]. The bundle ships with compiled defaults mirroring the
//! tables in `GOVERNANCE.md` §"Tool Access Matrix" through §"Admin Approval
//! Workflow" and can be overridden by a JSON file, reloaded at runtime
//! without a restart.

pub mod approval;
pub mod columns;
pub mod rbac;
pub mod rows;
pub mod tables;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    decision::{Constraints, DecisionInput, DecisionOutput},
    models::{Decision, Role, ToolName},
};

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("failed to read policy bundle: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse policy bundle: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid policy bundle: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RbacRules {
    pub tools_by_role: BTreeMap<Role, BTreeSet<ToolName>>,
}

impl Default for RbacRules {
    fn default() -> Self {
        let read_only: BTreeSet<ToolName> =
            [ToolName::SearchDocs, ToolName::ExplainMetric].into_iter().collect();
        let full: BTreeSet<ToolName> = [
            ToolName::SearchDocs,
            ToolName::ExplainMetric,
            ToolName::RunSql,
            ToolName::GenerateChart,
        ]
        .into_iter()
        .collect();

        let mut tools_by_role = BTreeMap::new();
        tools_by_role.insert(Role::Intern, read_only);
        tools_by_role.insert(Role::Marketing, full.clone());
        tools_by_role.insert(Role::Sales, full.clone());
        tools_by_role.insert(Role::DataAnalyst, full.clone());
        tools_by_role.insert(Role::Admin, full);

        Self { tools_by_role }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableRules {
    pub schemas_by_role: BTreeMap<Role, BTreeSet<String>>,
    pub blocked_tables_by_role: BTreeMap<Role, BTreeSet<String>>,
    /// Roles permitted to run DDL/DML statement kinds.
    pub ddl_roles: BTreeSet<Role>,
    /// Roles exempt from the explicit-LIMIT requirement on plain SELECTs.
    pub unlimited_select_roles: BTreeSet<Role>,
}

impl Default for TableRules {
    fn default() -> Self {
        let reporting: BTreeSet<String> = ["reporting".to_string()].into_iter().collect();
        // Analysts reach `raw`, but only through the approval layer's
        // sensitive-schema gate.
        let analyst: BTreeSet<String> = [
            "reporting".to_string(),
            "refined".to_string(),
            "raw".to_string(),
        ]
        .into_iter()
        .collect();
        let all: BTreeSet<String> = [
            "reporting".to_string(),
            "refined".to_string(),
            "raw".to_string(),
            "internal".to_string(),
        ]
        .into_iter()
        .collect();

        let mut schemas_by_role = BTreeMap::new();
        schemas_by_role.insert(Role::Intern, BTreeSet::new());
        schemas_by_role.insert(Role::Marketing, reporting.clone());
        schemas_by_role.insert(Role::Sales, reporting);
        schemas_by_role.insert(Role::DataAnalyst, analyst);
        schemas_by_role.insert(Role::Admin, all);

        let mut blocked_tables_by_role = BTreeMap::new();
        blocked_tables_by_role.insert(
            Role::Marketing,
            ["reporting.user_sessions".to_string()].into_iter().collect(),
        );

        Self {
            schemas_by_role,
            blocked_tables_by_role,
            ddl_roles: [Role::Admin].into_iter().collect(),
            unlimited_select_roles: [Role::DataAnalyst, Role::Admin].into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnRules {
    pub pii_columns: BTreeSet<String>,
    pub financial_columns: BTreeSet<String>,
    /// Role names cleared for unmasked PII.
    pub pii_access_roles: BTreeSet<String>,
    /// Role names that receive masked PII instead of a refusal.
    pub mask_roles: BTreeSet<String>,
    /// Role names cleared for financial columns. Kept as names so a bundle
    /// can grant a role the warehouse knows before this service does.
    pub financial_roles: BTreeSet<String>,
}

impl Default for ColumnRules {
    fn default() -> Self {
        Self {
            pii_columns: [
                "email",
                "phone",
                "address",
                "address_line1",
                "address_line2",
                "contact_name",
                "card_last_four",
                "ssn",
                "tax_id",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            financial_columns: ["payment_method", "bank_account", "routing_number"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            pii_access_roles: ["admin", "data_analyst"].into_iter().map(str::to_string).collect(),
            mask_roles: ["sales", "marketing"].into_iter().map(str::to_string).collect(),
            financial_roles: ["admin", "data_analyst", "finance"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalRules {
    pub sensitive_schemas: BTreeSet<String>,
    pub large_row_count_threshold: i64,
}

impl Default for ApprovalRules {
    fn default() -> Self {
        Self {
            sensitive_schemas: ["raw".to_string()].into_iter().collect(),
            large_row_count_threshold: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyBundle {
    pub rbac: RbacRules,
    pub tables: TableRules,
    pub columns: ColumnRules,
    pub approval: ApprovalRules,
}

impl PolicyBundle {
    pub fn from_file(path: &str) -> Result<Self, BundleError> {
        let raw = std::fs::read_to_string(path)?;
        let bundle: PolicyBundle = serde_json::from_str(&raw)?;
        bundle.validate()?;
        Ok(bundle)
    }

    pub fn validate(&self) -> Result<(), BundleError> {
        if self.rbac.tools_by_role.is_empty() {
            return Err(BundleError::Invalid("rbac matrix is empty".into()));
        }
        if self.approval.large_row_count_threshold < 1 {
            return Err(BundleError::Invalid(
                "large_row_count_threshold must be positive".into(),
            ));
        }
        if self.columns.pii_columns.is_empty() {
            return Err(BundleError::Invalid("pii column set is empty".into()));
        }
        Ok(())
    }
}

/// Full evaluation: access layers in order, then the approval layer.
pub fn evaluate(bundle: &PolicyBundle, input: &DecisionInput) -> DecisionOutput {
    let (mut rule_ids, mut constraints) = match run_access_layers(bundle, input) {
        Ok(passed) => passed,
        Err(denied) => return denied,
    };

    let signal = approval::evaluate(&bundle.approval, &bundle.columns, input);
    rule_ids.extend(signal.rule_ids);
    constraints.merge(signal.constraints);

    if signal.required {
        DecisionOutput {
            decision: Decision::RequireApproval,
            reason: signal
                .reason
                .unwrap_or_else(|| "second-party approval required".to_string()),
            rule_ids,
            constraints,
        }
    } else {
        DecisionOutput {
            decision: Decision::Allow,
            reason: allow_reason(&rule_ids),
            rule_ids,
            constraints,
        }
    }
}

/// Re-evaluation after an admin approves: same bundle minus the approval
/// layer, so an approval can never widen what the access layers grant.
pub fn evaluate_post_approval(bundle: &PolicyBundle, input: &DecisionInput) -> DecisionOutput {
    match run_access_layers(bundle, input) {
        Ok((rule_ids, constraints)) => DecisionOutput {
            decision: Decision::Allow,
            reason: allow_reason(&rule_ids),
            rule_ids,
            constraints,
        },
        Err(denied) => denied,
    }
}

fn run_access_layers(
    bundle: &PolicyBundle,
    input: &DecisionInput,
) -> Result<(Vec<String>, Constraints), DecisionOutput> {
    let mut rule_ids = Vec::new();
    let mut constraints = Constraints::default();

    // Deny ordering is rbac -> tables -> columns; the first failing layer
    // supplies the reason and its ids alone.
    for outcome in [
        rbac::evaluate(&bundle.rbac, input),
        tables::evaluate(&bundle.tables, input),
        columns::evaluate(&bundle.columns, input),
        rows::evaluate(input),
    ] {
        if let Some(reason) = outcome.deny_reason {
            return Err(DecisionOutput {
                decision: Decision::Deny,
                reason,
                rule_ids: outcome.rule_ids,
                constraints: Constraints::default(),
            });
        }
        rule_ids.extend(outcome.rule_ids);
        constraints.merge(outcome.constraints);
    }

    Ok((rule_ids, constraints))
}

fn allow_reason(rule_ids: &[String]) -> String {
    if rule_ids.is_empty() {
        "permitted by policy".to_string()
    } else {
        format!("permitted by policy ({})", rule_ids.join(", "))
    }
}
