//! Sensitive-column screening: PII masking or refusal, financial gating.

use std::collections::BTreeSet;

use crate::domain::{
    decision::{Constraints, DecisionInput, LayerOutcome},
    models::ToolName,
    policy::ColumnRules,
};

pub fn evaluate(rules: &ColumnRules, input: &DecisionInput) -> LayerOutcome {
    if input.tool != ToolName::RunSql {
        return LayerOutcome::pass();
    }

    let referenced: BTreeSet<String> = input
        .columns
        .iter()
        .map(|column| column.to_lowercase())
        .collect();

    let pii_hits: Vec<String> = referenced
        .iter()
        .filter(|column| rules.pii_columns.contains(*column))
        .cloned()
        .collect();
    let financial_hits: Vec<String> = referenced
        .iter()
        .filter(|column| rules.financial_columns.contains(*column))
        .cloned()
        .collect();

    let role_name = input.role.as_str();
    let mut outcome = LayerOutcome::pass();

    if !pii_hits.is_empty() {
        if rules.pii_access_roles.contains(role_name) {
            outcome.rule_ids.push("columns.pii_access".to_string());
        } else if rules.mask_roles.contains(role_name) {
            outcome.rule_ids.push("columns.pii_masked".to_string());
            outcome.constraints.merge(Constraints {
                masked_columns: pii_hits.clone(),
                ..Constraints::default()
            });
        } else {
            return LayerOutcome::deny(
                format!(
                    "role '{role_name}' may not reference PII columns ({})",
                    pii_hits.join(", ")
                ),
                "columns.pii_denied",
            );
        }
    }

    if !financial_hits.is_empty() {
        if rules.financial_roles.contains(role_name) {
            outcome.rule_ids.push("columns.financial_access".to_string());
        } else {
            return LayerOutcome::deny(
                format!(
                    "role '{role_name}' may not reference financial columns ({})",
                    financial_hits.join(", ")
                ),
                "columns.financial_denied",
            );
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{QueryKind, Role};

    fn input(role: Role, columns: Vec<&str>) -> DecisionInput {
        DecisionInput {
            role,
            region: None,
            tool: ToolName::RunSql,
            tables: Vec::new(),
            columns: columns.into_iter().map(str::to_string).collect(),
            query_kind: Some(QueryKind::Select),
            has_limit: true,
            is_aggregate: false,
            row_count: None,
        }
    }

    #[test]
    fn analyst_passes_pii_untouched() {
        let rules = ColumnRules::default();
        let outcome = evaluate(&rules, &input(Role::DataAnalyst, vec!["email", "mrr"]));

        assert!(outcome.allowed());
        assert_eq!(outcome.rule_ids, vec!["columns.pii_access".to_string()]);
        assert!(outcome.constraints.masked_columns.is_empty());
    }

    #[test]
    fn sales_gets_pii_masked_case_insensitively() {
        let rules = ColumnRules::default();
        let outcome = evaluate(&rules, &input(Role::Sales, vec!["Email", "Phone", "mrr"]));

        assert!(outcome.allowed());
        assert_eq!(outcome.rule_ids, vec!["columns.pii_masked".to_string()]);
        assert_eq!(
            outcome.constraints.masked_columns,
            vec!["email".to_string(), "phone".to_string()]
        );
    }

    #[test]
    fn intern_is_refused_pii_outright() {
        let rules = ColumnRules::default();
        let outcome = evaluate(&rules, &input(Role::Intern, vec!["ssn"]));

        assert_eq!(outcome.rule_ids, vec!["columns.pii_denied".to_string()]);
    }

    #[test]
    fn financial_columns_are_gated_separately() {
        let rules = ColumnRules::default();

        let denied = evaluate(&rules, &input(Role::Sales, vec!["bank_account"]));
        assert_eq!(
            denied.rule_ids,
            vec!["columns.financial_denied".to_string()]
        );

        let allowed = evaluate(&rules, &input(Role::Admin, vec!["bank_account"]));
        assert!(allowed.allowed());
        assert_eq!(
            allowed.rule_ids,
            vec!["columns.financial_access".to_string()]
        );
    }

    #[test]
    fn clean_columns_match_nothing() {
        let rules = ColumnRules::default();
        let outcome = evaluate(&rules, &input(Role::Sales, vec!["region", "mrr", "status"]));

        assert!(outcome.allowed());
        assert!(outcome.rule_ids.is_empty());
        assert!(outcome.constraints.is_empty());
    }
}
