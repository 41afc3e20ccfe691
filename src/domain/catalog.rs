//! Static warehouse catalogue consulted by the constraint applier.
//!
//! Only the facts policy rewrites depend on are listed: which tables carry a
//! region column. The catalogue ships with the engine and is not a substitute
//! for database-side row security, which remains the second line of defence.

use crate::domain::decision::TableRef;

pub struct TableProfile {
    pub schema: &'static str,
    pub table: &'static str,
    pub region_column: Option<&'static str>,
}

pub const CATALOG: &[TableProfile] = &[
    TableProfile {
        schema: "reporting",
        table: "customers",
        region_column: Some("region"),
    },
    TableProfile {
        schema: "reporting",
        table: "daily_kpis",
        region_column: Some("region"),
    },
    TableProfile {
        schema: "reporting",
        table: "user_sessions",
        region_column: None,
    },
    TableProfile {
        schema: "raw",
        table: "customers",
        region_column: None,
    },
    TableProfile {
        schema: "raw",
        table: "payments",
        region_column: None,
    },
];

/// Region column for a referenced table, if the catalogue knows one.
/// Unqualified references never match; the policy engine already treats them
/// as outside every allow-set.
pub fn region_column(table: &TableRef) -> Option<&'static str> {
    let schema = table.schema.as_deref()?;
    CATALOG
        .iter()
        .find(|profile| profile.schema == schema && profile.table == table.table)
        .and_then(|profile| profile.region_column)
}

/// First referenced table that carries a region column.
pub fn first_region_bearing<'a>(tables: &'a [TableRef]) -> Option<(&'a TableRef, &'static str)> {
    tables
        .iter()
        .find_map(|table| region_column(table).map(|column| (table, column)))
}
