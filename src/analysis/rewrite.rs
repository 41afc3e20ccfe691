//! Applies policy constraints to a statement before and after execution:
//! region predicate injection, LIMIT injection, and column masking.

use crate::analysis::sql::{tokenize, SqlError, Token, TokenKind};
use crate::domain::models::Region;

/// Clause keywords that end a top-level WHERE clause.
const WHERE_TERMINATORS: &[&str] = &["GROUP", "HAVING", "ORDER", "LIMIT", "OFFSET", "UNION"];

fn keyword_of(token: &Token) -> Option<String> {
    match &token.kind {
        TokenKind::Ident { text, quoted: false } => Some(text.to_uppercase()),
        _ => None,
    }
}

/// Appends `AND <column> = '<region>'` to the statement's top-level WHERE
/// clause, wrapping the existing predicate so OR branches cannot escape the
/// filter. A statement without a WHERE clause gains one. Nested SELECTs are
/// left to the database's own row security.
pub fn inject_region_filter(
    sql: &str,
    column: &str,
    region: Region,
) -> Result<String, SqlError> {
    let tokens = tokenize(sql)?;
    let statement_end = tokens.last().map(|token| token.end).unwrap_or(sql.len());
    let statement = &sql[..statement_end];
    let predicate = format!("{column} = '{}'", region.as_str());

    let where_token = tokens
        .iter()
        .find(|token| token.depth == 0 && keyword_of(token).as_deref() == Some("WHERE"));

    match where_token {
        Some(where_token) => {
            let clause_end = tokens
                .iter()
                .find(|token| {
                    token.depth == 0
                        && token.start > where_token.end
                        && keyword_of(token)
                            .map(|kw| WHERE_TERMINATORS.contains(&kw.as_str()))
                            .unwrap_or(false)
                })
                .map(|token| token.start)
                .unwrap_or(statement_end);

            let existing = statement[where_token.end..clause_end].trim();
            let head = &statement[..where_token.end];
            let tail = &statement[clause_end..];
            Ok(format!("{head} ({existing}) AND {predicate} {tail}")
                .trim_end()
                .to_string())
        }
        None => {
            let insert_at = tokens
                .iter()
                .find(|token| {
                    token.depth == 0
                        && keyword_of(token)
                            .map(|kw| WHERE_TERMINATORS.contains(&kw.as_str()))
                            .unwrap_or(false)
                })
                .map(|token| token.start)
                .unwrap_or(statement_end);

            let head = statement[..insert_at].trim_end();
            let tail = &statement[insert_at..];
            if tail.is_empty() {
                Ok(format!("{head} WHERE {predicate}"))
            } else {
                Ok(format!("{head} WHERE {predicate} {tail}"))
            }
        }
    }
}

/// Appends `LIMIT <n>` when the statement has no positive top-level LIMIT.
/// This is a redundant safety net behind the policy engine's own LIMIT rule.
pub fn inject_limit(sql: &str, limit: i64) -> Result<String, SqlError> {
    let tokens = tokenize(sql)?;
    let already_limited = tokens.iter().enumerate().any(|(i, token)| {
        token.depth == 0
            && keyword_of(token).as_deref() == Some("LIMIT")
            && matches!(
                tokens.get(i + 1).map(|next| &next.kind),
                Some(TokenKind::Number(n)) if n.parse::<i64>().map(|v| v > 0).unwrap_or(false)
            )
    });
    if already_limited {
        return Ok(sql.to_string());
    }

    let statement_end = tokens.last().map(|token| token.end).unwrap_or(sql.len());
    Ok(format!("{} LIMIT {limit}", sql[..statement_end].trim_end()))
}

/// Sentinel written over a masked output cell.
pub fn mask_sentinel(column: &str) -> &'static str {
    match column.to_lowercase().as_str() {
        "email" => "***@***.***",
        "phone" => "***-***-****",
        "card_last_four" => "****",
        _ => "***",
    }
}

/// Overwrites masked columns in result rows with fixed sentinels. Matching is
/// case-insensitive on the output column name.
pub fn apply_masks(rows: &mut [serde_json::Value], masked_columns: &[String]) {
    if masked_columns.is_empty() {
        return;
    }
    let masked: Vec<String> = masked_columns.iter().map(|c| c.to_lowercase()).collect();
    for row in rows {
        let Some(object) = row.as_object_mut() else {
            continue;
        };
        for (key, value) in object.iter_mut() {
            if masked.contains(&key.to_lowercase()) {
                *value = serde_json::Value::String(mask_sentinel(key).to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wraps_existing_where_clause() {
        let rewritten = inject_region_filter(
            "SELECT region, mrr FROM reporting.customers WHERE status = 'active' LIMIT 100",
            "region",
            Region::Na,
        )
        .unwrap();

        assert_eq!(
            rewritten,
            "SELECT region, mrr FROM reporting.customers WHERE (status = 'active') AND region = 'NA' LIMIT 100"
        );
    }

    #[test]
    fn adds_where_clause_when_missing() {
        let rewritten = inject_region_filter(
            "SELECT region FROM reporting.customers LIMIT 10",
            "region",
            Region::Emea,
        )
        .unwrap();

        assert_eq!(
            rewritten,
            "SELECT region FROM reporting.customers WHERE region = 'EMEA' LIMIT 10"
        );
    }

    #[test]
    fn adds_where_clause_at_end_without_trailing_clauses() {
        let rewritten = inject_region_filter(
            "SELECT region FROM reporting.daily_kpis",
            "region",
            Region::Apac,
        )
        .unwrap();

        assert_eq!(
            rewritten,
            "SELECT region FROM reporting.daily_kpis WHERE region = 'APAC'"
        );
    }

    #[test]
    fn or_branches_cannot_escape_the_filter() {
        let rewritten = inject_region_filter(
            "SELECT mrr FROM reporting.customers WHERE status = 'active' OR status = 'churned' LIMIT 5",
            "region",
            Region::Na,
        )
        .unwrap();

        assert!(rewritten
            .contains("WHERE (status = 'active' OR status = 'churned') AND region = 'NA'"));
    }

    #[test]
    fn limit_injection_is_idempotent() {
        let limited = inject_limit("SELECT region FROM reporting.customers LIMIT 10", 1_000)
            .unwrap();
        assert_eq!(limited, "SELECT region FROM reporting.customers LIMIT 10");

        let injected = inject_limit("SELECT region FROM reporting.customers", 1_000).unwrap();
        assert_eq!(injected, "SELECT region FROM reporting.customers LIMIT 1000");
    }

    #[test]
    fn trailing_semicolons_are_dropped_on_rewrite() {
        let injected = inject_limit("SELECT region FROM reporting.customers;", 500).unwrap();
        assert_eq!(injected, "SELECT region FROM reporting.customers LIMIT 500");
    }

    #[test]
    fn masks_overwrite_matching_cells_case_insensitively() {
        let mut rows = vec![
            json!({"Email": "ada@example.com", "mrr": 120}),
            json!({"Email": "grace@example.com", "mrr": 340}),
        ];

        apply_masks(&mut rows, &["email".to_string()]);

        assert_eq!(rows[0]["Email"], "***@***.***");
        assert_eq!(rows[1]["Email"], "***@***.***");
        assert_eq!(rows[0]["mrr"], 120);
    }

    #[test]
    fn sentinel_shapes_by_column() {
        assert_eq!(mask_sentinel("email"), "***@***.***");
        assert_eq!(mask_sentinel("phone"), "***-***-****");
        assert_eq!(mask_sentinel("card_last_four"), "****");
        assert_eq!(mask_sentinel("ssn"), "***");
    }
}
