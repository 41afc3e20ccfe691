//! Value types exchanged between the dispatcher and the policy engine.
//!
//! A `DecisionInput` is a pure description of one tool call; evaluating it
//! has no side effects, so the same input always yields the same
//! `DecisionOutput` for a given bundle.

use serde::{Deserialize, Serialize};

use crate::domain::models::{Decision, QueryKind, Region, Role, ToolName};

/// One `(schema, table)` reference extracted from a SQL statement. A missing
/// schema means the statement did not qualify the table; the tables layer
/// treats that as outside every allow-set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableRef {
    pub schema: Option<String>,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: Option<&str>, table: &str) -> Self {
        Self {
            schema: schema.map(|s| s.to_lowercase()),
            table: table.to_lowercase(),
        }
    }

    /// `schema.table` form used in blocked-table sets and log lines.
    pub fn qualified(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}", self.table),
            None => self.table.clone(),
        }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.qualified())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionInput {
    pub role: Role,
    pub region: Option<Region>,
    pub tool: ToolName,
    #[serde(default)]
    pub tables: Vec<TableRef>,
    #[serde(default)]
    pub columns: Vec<String>,
    pub query_kind: Option<QueryKind>,
    #[serde(default)]
    pub has_limit: bool,
    #[serde(default)]
    pub is_aggregate: bool,
    pub row_count: Option<i64>,
}

impl DecisionInput {
    /// Input for the non-SQL tools, which carry no statement facts.
    pub fn for_tool(role: Role, region: Option<Region>, tool: ToolName) -> Self {
        Self {
            role,
            region,
            tool,
            tables: Vec::new(),
            columns: Vec::new(),
            query_kind: None,
            has_limit: false,
            is_aggregate: false,
            row_count: None,
        }
    }
}

/// Machine-readable rewrite directives accumulated across policy layers.
/// Serializes to an empty object exactly when no rewrite is needed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Constraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region_filter: Option<Region>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub masked_columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_type: Option<String>,
}

impl Constraints {
    pub fn is_empty(&self) -> bool {
        self.region_filter.is_none() && self.masked_columns.is_empty() && self.approval_type.is_none()
    }

    /// Layers constrain disjoint keys, so merging never overwrites.
    pub fn merge(&mut self, other: Constraints) {
        if other.region_filter.is_some() {
            self.region_filter = other.region_filter;
        }
        if !other.masked_columns.is_empty() {
            self.masked_columns = other.masked_columns;
        }
        if other.approval_type.is_some() {
            self.approval_type = other.approval_type;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionOutput {
    pub decision: Decision,
    pub reason: String,
    pub rule_ids: Vec<String>,
    pub constraints: Constraints,
}

/// Verdict of one access layer (rbac, tables, columns, rows).
#[derive(Debug, Clone, Default)]
pub struct LayerOutcome {
    pub deny_reason: Option<String>,
    pub rule_ids: Vec<String>,
    pub constraints: Constraints,
}

impl LayerOutcome {
    pub fn pass() -> Self {
        Self::default()
    }

    pub fn deny(reason: impl Into<String>, rule_id: &str) -> Self {
        Self {
            deny_reason: Some(reason.into()),
            rule_ids: vec![rule_id.to_string()],
            constraints: Constraints::default(),
        }
    }

    pub fn allow_with(rule_id: &str, constraints: Constraints) -> Self {
        Self {
            deny_reason: None,
            rule_ids: vec![rule_id.to_string()],
            constraints,
        }
    }

    pub fn allowed(&self) -> bool {
        self.deny_reason.is_none()
    }
}

/// Verdict of the approval layer, which never denies on its own.
#[derive(Debug, Clone, Default)]
pub struct ApprovalSignal {
    pub required: bool,
    pub reason: Option<String>,
    pub rule_ids: Vec<String>,
    pub constraints: Constraints,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_ref_folds_case_and_formats_qualified_names() {
        let qualified = TableRef::new(Some("Reporting"), "Customers");
        assert_eq!(qualified.qualified(), "reporting.customers");

        let bare = TableRef::new(None, "orders");
        assert_eq!(bare.qualified(), "orders");
    }

    #[test]
    fn empty_constraints_serialize_to_empty_object() {
        let constraints = Constraints::default();
        assert!(constraints.is_empty());
        assert_eq!(
            serde_json::to_value(&constraints).unwrap(),
            serde_json::json!({})
        );
    }

    #[test]
    fn merge_unions_disjoint_keys() {
        let mut constraints = Constraints {
            masked_columns: vec!["email".to_string()],
            ..Constraints::default()
        };
        constraints.merge(Constraints {
            region_filter: Some(crate::domain::models::Region::Na),
            ..Constraints::default()
        });

        assert_eq!(constraints.masked_columns, vec!["email".to_string()]);
        assert_eq!(
            constraints.region_filter,
            Some(crate::domain::models::Region::Na)
        );
    }
}
