//! Role -> tool matrix, the first gate every call passes.

use crate::domain::{
    decision::{DecisionInput, LayerOutcome},
    policy::RbacRules,
};

pub fn evaluate(rules: &RbacRules, input: &DecisionInput) -> LayerOutcome {
    let Some(allowed) = rules.tools_by_role.get(&input.role) else {
        return LayerOutcome::deny(
            format!("role '{}' is not recognized by policy", input.role.as_str()),
            "rbac.invalid_role",
        );
    };

    if !allowed.contains(&input.tool) {
        return LayerOutcome::deny(
            format!(
                "role '{}' is not permitted to call tool '{}'",
                input.role.as_str(),
                input.tool.as_str()
            ),
            "rbac.tool_denied",
        );
    }

    LayerOutcome::pass()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Role, ToolName};

    fn input(role: Role, tool: ToolName) -> DecisionInput {
        DecisionInput::for_tool(role, None, tool)
    }

    #[test]
    fn intern_may_search_and_explain_only() {
        let rules = RbacRules::default();

        assert!(evaluate(&rules, &input(Role::Intern, ToolName::SearchDocs)).allowed());
        assert!(evaluate(&rules, &input(Role::Intern, ToolName::ExplainMetric)).allowed());

        let denied = evaluate(&rules, &input(Role::Intern, ToolName::RunSql));
        assert_eq!(denied.rule_ids, vec!["rbac.tool_denied".to_string()]);

        let chart = evaluate(&rules, &input(Role::Intern, ToolName::GenerateChart));
        assert!(!chart.allowed());
    }

    #[test]
    fn other_roles_get_the_full_catalogue() {
        let rules = RbacRules::default();
        for role in [Role::Marketing, Role::Sales, Role::DataAnalyst, Role::Admin] {
            for tool in [
                ToolName::RunSql,
                ToolName::SearchDocs,
                ToolName::ExplainMetric,
                ToolName::GenerateChart,
            ] {
                assert!(
                    evaluate(&rules, &input(role, tool)).allowed(),
                    "{role:?} should be allowed {tool:?}"
                );
            }
        }
    }

    #[test]
    fn role_missing_from_matrix_is_invalid() {
        let mut rules = RbacRules::default();
        rules.tools_by_role.remove(&Role::Sales);

        let denied = evaluate(&rules, &input(Role::Sales, ToolName::RunSql));
        assert_eq!(denied.rule_ids, vec!["rbac.invalid_role".to_string()]);
    }
}
