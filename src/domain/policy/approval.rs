//! Second-party approval triggers. This layer never denies; it flags calls
//! that must wait for an admin decision.

use crate::domain::{
    decision::{ApprovalSignal, Constraints, DecisionInput},
    models::{Role, ToolName},
    policy::{ApprovalRules, ColumnRules},
};

pub fn evaluate(
    rules: &ApprovalRules,
    columns: &ColumnRules,
    input: &DecisionInput,
) -> ApprovalSignal {
    let mut signal = ApprovalSignal::default();
    if input.tool != ToolName::RunSql {
        return signal;
    }

    let touches_sensitive_schema = input.tables.iter().any(|table| {
        table
            .schema
            .as_deref()
            .map(|schema| rules.sensitive_schemas.contains(schema))
            .unwrap_or(false)
    });
    if touches_sensitive_schema && input.role != Role::Admin {
        require(
            &mut signal,
            "approval.sensitive_schema",
            "sensitive_schema",
            "Access to raw schema requires admin approval",
        );
    }

    if input
        .row_count
        .map(|declared| declared > rules.large_row_count_threshold)
        .unwrap_or(false)
    {
        require(
            &mut signal,
            "approval.large_data",
            "large_data",
            "Declared result size exceeds the large-data threshold and requires admin approval",
        );
    }

    let touches_pii = input
        .columns
        .iter()
        .any(|column| columns.pii_columns.contains(&column.to_lowercase()));
    if input.role == Role::Admin && touches_pii {
        require(
            &mut signal,
            "approval.admin_pii",
            "admin_pii",
            "Admin access to PII columns requires second-party approval",
        );
    }

    signal
}

/// First trigger supplies the reason and approval type; later triggers only
/// add their rule ids.
fn require(signal: &mut ApprovalSignal, rule_id: &str, approval_type: &str, reason: &str) {
    signal.rule_ids.push(rule_id.to_string());
    if !signal.required {
        signal.required = true;
        signal.reason = Some(reason.to_string());
        signal.constraints = Constraints {
            approval_type: Some(approval_type.to_string()),
            ..Constraints::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{decision::TableRef, models::QueryKind};

    fn sql_input(role: Role, tables: Vec<TableRef>, columns: Vec<&str>) -> DecisionInput {
        DecisionInput {
            role,
            region: None,
            tool: ToolName::RunSql,
            tables,
            columns: columns.into_iter().map(str::to_string).collect(),
            query_kind: Some(QueryKind::Select),
            has_limit: true,
            is_aggregate: false,
            row_count: None,
        }
    }

    #[test]
    fn raw_schema_triggers_for_non_admin() {
        let input = sql_input(
            Role::DataAnalyst,
            vec![TableRef::new(Some("raw"), "customers")],
            Vec::new(),
        );
        let signal = evaluate(&ApprovalRules::default(), &ColumnRules::default(), &input);

        assert!(signal.required);
        assert_eq!(
            signal.reason.as_deref(),
            Some("Access to raw schema requires admin approval")
        );
        assert_eq!(
            signal.rule_ids,
            vec!["approval.sensitive_schema".to_string()]
        );
    }

    #[test]
    fn raw_schema_does_not_trigger_for_admin() {
        let input = sql_input(
            Role::Admin,
            vec![TableRef::new(Some("raw"), "customers")],
            Vec::new(),
        );
        let signal = evaluate(&ApprovalRules::default(), &ColumnRules::default(), &input);

        assert!(!signal.required);
    }

    #[test]
    fn declared_large_result_triggers() {
        let mut input = sql_input(
            Role::DataAnalyst,
            vec![TableRef::new(Some("reporting"), "customers")],
            Vec::new(),
        );
        input.row_count = Some(5_000);

        let signal = evaluate(&ApprovalRules::default(), &ColumnRules::default(), &input);

        assert!(signal.required);
        assert_eq!(signal.rule_ids, vec!["approval.large_data".to_string()]);
        assert_eq!(
            signal.constraints.approval_type.as_deref(),
            Some("large_data")
        );
    }

    #[test]
    fn admin_touching_pii_triggers() {
        let input = sql_input(
            Role::Admin,
            vec![TableRef::new(Some("reporting"), "customers")],
            vec!["email"],
        );
        let signal = evaluate(&ApprovalRules::default(), &ColumnRules::default(), &input);

        assert!(signal.required);
        assert_eq!(signal.rule_ids, vec!["approval.admin_pii".to_string()]);
    }

    #[test]
    fn multiple_triggers_keep_first_reason_and_all_ids() {
        let mut input = sql_input(
            Role::DataAnalyst,
            vec![TableRef::new(Some("raw"), "customers")],
            Vec::new(),
        );
        input.row_count = Some(10_000);

        let signal = evaluate(&ApprovalRules::default(), &ColumnRules::default(), &input);

        assert_eq!(
            signal.reason.as_deref(),
            Some("Access to raw schema requires admin approval")
        );
        assert_eq!(
            signal.rule_ids,
            vec![
                "approval.sensitive_schema".to_string(),
                "approval.large_data".to_string()
            ]
        );
        assert_eq!(
            signal.constraints.approval_type.as_deref(),
            Some("sensitive_schema")
        );
    }
}
