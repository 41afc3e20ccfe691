//! Row-level scoping: sales identities are pinned to their home region.

use crate::domain::{
    decision::{Constraints, DecisionInput, LayerOutcome},
    models::Role,
};

pub fn evaluate(input: &DecisionInput) -> LayerOutcome {
    match (input.role, input.region) {
        (Role::Sales, Some(region)) => LayerOutcome::allow_with(
            "rows.sales_region_filter",
            Constraints {
                region_filter: Some(region),
                ..Constraints::default()
            },
        ),
        _ => LayerOutcome::pass(),
    }
}
