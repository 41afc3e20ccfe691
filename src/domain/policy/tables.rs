//! Schema allow-sets, blocked tables, statement kinds, and the LIMIT rule.

use crate::domain::{
    decision::{DecisionInput, LayerOutcome},
    models::{QueryKind, ToolName},
    policy::TableRules,
};

pub fn evaluate(rules: &TableRules, input: &DecisionInput) -> LayerOutcome {
    if input.tool != ToolName::RunSql {
        return LayerOutcome::pass();
    }

    let role = input.role;
    let empty = std::collections::BTreeSet::new();
    let allowed = rules.schemas_by_role.get(&role).unwrap_or(&empty);

    for table in &input.tables {
        // An unqualified reference has no schema to check, which fails
        // closed: it can never be inside the allow-set.
        let in_allow_set = table
            .schema
            .as_deref()
            .map(|schema| allowed.contains(schema))
            .unwrap_or(false);
        if !in_allow_set {
            return LayerOutcome::deny(
                format!(
                    "table '{}' is outside the schemas permitted for role '{}'",
                    table,
                    role.as_str()
                ),
                "tables.schema_denied",
            );
        }
    }

    if let Some(blocked) = rules.blocked_tables_by_role.get(&role) {
        for table in &input.tables {
            if blocked.contains(&table.qualified()) {
                return LayerOutcome::deny(
                    format!(
                        "table '{}' is blocked for role '{}'",
                        table,
                        role.as_str()
                    ),
                    "tables.schema_denied",
                );
            }
        }
    }

    match input.query_kind {
        Some(QueryKind::Select) => {}
        Some(kind) if rules.ddl_roles.contains(&role) => {
            tracing::debug!(kind = kind.as_str(), role = role.as_str(), "ddl permitted");
        }
        Some(kind) => {
            return LayerOutcome::deny(
                format!(
                    "statement kind '{}' is not permitted for role '{}'",
                    kind.as_str(),
                    role.as_str()
                ),
                "tables.query_type_denied",
            );
        }
        None => {
            return LayerOutcome::deny(
                "statement kind could not be determined",
                "tables.query_type_denied",
            );
        }
    }

    let needs_limit = input.query_kind == Some(QueryKind::Select)
        && !input.is_aggregate
        && !rules.unlimited_select_roles.contains(&role);
    if needs_limit && !input.has_limit {
        return LayerOutcome::deny(
            format!(
                "non-aggregate SELECT from role '{}' must carry an explicit LIMIT",
                role.as_str()
            ),
            "tables.limit_required",
        );
    }

    LayerOutcome::pass()
}
