//! Structural SQL analysis for policy decisions.
//!
//! This is not a grammar: a tokenizing pass extracts the facts the policy
//! engine reasons about (statement kind, referenced tables, candidate
//! columns, LIMIT presence). Column extraction over-approximates on purpose;
//! surplus candidates can only make the sensitive-column layer stricter.

use std::str::FromStr;

use thiserror::Error;

use crate::domain::{decision::TableRef, models::QueryKind};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SqlError {
    #[error("empty statement")]
    Empty,
    #[error("multiple statements are not permitted")]
    MultipleStatements,
    #[error("unsupported statement '{0}'")]
    Unsupported(String),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unterminated quoted identifier")]
    UnterminatedIdentifier,
    #[error("unterminated block comment")]
    UnterminatedComment,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Ident { text: String, quoted: bool },
    Number(String),
    StringLit,
    Symbol(char),
}

#[derive(Debug, Clone)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
    pub depth: u32,
}

impl Token {
    fn keyword(&self) -> Option<String> {
        match &self.kind {
            TokenKind::Ident { text, quoted: false } => Some(text.to_uppercase()),
            _ => None,
        }
    }

    fn is_keyword(&self, word: &str) -> bool {
        self.keyword().as_deref() == Some(word)
    }

    fn symbol(&self) -> Option<char> {
        match self.kind {
            TokenKind::Symbol(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqlFacts {
    pub kind: QueryKind,
    pub tables: Vec<TableRef>,
    pub columns: Vec<String>,
    pub has_limit: bool,
    pub is_aggregate: bool,
}

/// Everything that reads like an identifier but never names a column.
const KEYWORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "AND", "OR", "NOT", "NULL", "IS", "IN", "AS", "ON", "JOIN",
    "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS", "GROUP", "BY", "ORDER", "HAVING",
    "LIMIT", "OFFSET", "ASC", "DESC", "DISTINCT", "CASE", "WHEN", "THEN", "ELSE", "END",
    "LIKE", "ILIKE", "BETWEEN", "EXISTS", "UNION", "ALL", "ANY", "INSERT", "INTO", "VALUES",
    "UPDATE", "SET", "DELETE", "CREATE", "TABLE", "DROP", "ALTER", "TRUE", "FALSE", "CAST",
    "INTERVAL", "USING", "RETURNING", "IF", "CURRENT_DATE", "CURRENT_TIMESTAMP",
];

const AGGREGATE_FUNCTIONS: &[&str] = &["COUNT", "SUM", "AVG", "MIN", "MAX"];

fn char_at(sql: &str, i: usize) -> Option<char> {
    sql[i..].chars().next()
}

pub(crate) fn tokenize(sql: &str) -> Result<Vec<Token>, SqlError> {
    let mut tokens = Vec::new();
    let mut depth: u32 = 0;
    let mut i = 0;

    while let Some(c) = char_at(sql, i) {
        match c {
            c if c.is_whitespace() => i += c.len_utf8(),
            '-' if char_at(sql, i + 1) == Some('-') => {
                i = sql[i..].find('\n').map(|n| i + n).unwrap_or(sql.len());
            }
            '/' if char_at(sql, i + 1) == Some('*') => {
                let close = sql[i + 2..]
                    .find("*/")
                    .ok_or(SqlError::UnterminatedComment)?;
                i += 2 + close + 2;
            }
            '\'' => {
                let start = i;
                i += 1;
                loop {
                    match char_at(sql, i) {
                        Some('\'') if char_at(sql, i + 1) == Some('\'') => i += 2,
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(inner) => i += inner.len_utf8(),
                        None => return Err(SqlError::UnterminatedString),
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::StringLit,
                    start,
                    end: i,
                    depth,
                });
            }
            '"' => {
                let start = i;
                i += 1;
                let mut text = String::new();
                loop {
                    match char_at(sql, i) {
                        Some('"') if char_at(sql, i + 1) == Some('"') => {
                            text.push('"');
                            i += 2;
                        }
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some(inner) => {
                            text.push(inner);
                            i += inner.len_utf8();
                        }
                        None => return Err(SqlError::UnterminatedIdentifier),
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Ident { text, quoted: true },
                    start,
                    end: i,
                    depth,
                });
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while let Some(inner) = char_at(sql, i) {
                    if inner.is_alphanumeric() || inner == '_' || inner == '$' {
                        i += inner.len_utf8();
                    } else {
                        break;
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Ident {
                        text: sql[start..i].to_string(),
                        quoted: false,
                    },
                    start,
                    end: i,
                    depth,
                });
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while let Some(inner) = char_at(sql, i) {
                    if inner.is_ascii_digit() || inner == '.' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Number(sql[start..i].to_string()),
                    start,
                    end: i,
                    depth,
                });
            }
            '(' => {
                tokens.push(Token {
                    kind: TokenKind::Symbol('('),
                    start: i,
                    end: i + 1,
                    depth,
                });
                depth += 1;
                i += 1;
            }
            ')' => {
                depth = depth.saturating_sub(1);
                tokens.push(Token {
                    kind: TokenKind::Symbol(')'),
                    start: i,
                    end: i + 1,
                    depth,
                });
                i += 1;
            }
            other => {
                tokens.push(Token {
                    kind: TokenKind::Symbol(other),
                    start: i,
                    end: i + other.len_utf8(),
                    depth,
                });
                i += other.len_utf8();
            }
        }
    }

    // Single top-level statement only: a semicolon may trail, nothing more.
    if let Some(split) = tokens
        .iter()
        .position(|token| token.depth == 0 && token.symbol() == Some(';'))
    {
        if split + 1 < tokens.len() {
            return Err(SqlError::MultipleStatements);
        }
        tokens.truncate(split);
    }

    if tokens.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(tokens)
}

pub fn analyze(sql: &str) -> Result<SqlFacts, SqlError> {
    let tokens = tokenize(sql)?;

    let first = tokens[0]
        .keyword()
        .ok_or_else(|| SqlError::Unsupported(snippet(sql, &tokens[0])))?;
    let kind = QueryKind::from_str(&first)
        .map_err(|_| SqlError::Unsupported(first.to_lowercase()))?;

    let tables = extract_tables(&tokens);
    let columns = extract_columns(&tokens);
    let has_limit = top_level_limit(&tokens);
    let is_aggregate = detect_aggregate(&tokens);

    Ok(SqlFacts {
        kind,
        tables,
        columns,
        has_limit,
        is_aggregate,
    })
}

fn snippet(sql: &str, token: &Token) -> String {
    sql[token.start..token.end].to_string()
}

fn ident_text(token: &Token) -> Option<&str> {
    match &token.kind {
        TokenKind::Ident { text, .. } => Some(text),
        _ => None,
    }
}

/// Table references follow FROM / JOIN / INTO / UPDATE / TABLE at any depth,
/// so subquery sources are collected too.
fn extract_tables(tokens: &[Token]) -> Vec<TableRef> {
    let mut tables = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let introduces_table = match tokens[i].keyword().as_deref() {
            Some("FROM") | Some("JOIN") | Some("INTO") | Some("TABLE") => true,
            Some("UPDATE") if i == 0 => true,
            _ => false,
        };
        if !introduces_table {
            i += 1;
            continue;
        }
        let list = tokens[i].is_keyword("FROM");
        i += 1;
        loop {
            // A parenthesis here is a derived table; its own FROM is scanned
            // by the outer loop.
            if tokens.get(i).and_then(Token::symbol) == Some('(') {
                break;
            }
            let Some((table, next)) = parse_table_ref(tokens, i) else {
                break;
            };
            tables.push(table);
            i = next;
            // Skip `AS alias` or a bare alias so `FROM a x, b y` keeps
            // walking the list.
            if tokens.get(i).map(|t| t.is_keyword("AS")).unwrap_or(false) {
                i += 1;
            }
            if let Some(token) = tokens.get(i) {
                let is_alias = ident_text(token).is_some()
                    && token.keyword().map_or(true, |kw| !KEYWORDS.contains(&kw.as_str()));
                if is_alias {
                    i += 1;
                }
            }
            if list && tokens.get(i).and_then(Token::symbol) == Some(',') {
                i += 1;
                continue;
            }
            break;
        }
    }
    dedupe_tables(tables)
}

fn parse_table_ref(tokens: &[Token], i: usize) -> Option<(TableRef, usize)> {
    let head = tokens.get(i)?;
    let first = ident_text(head)?.to_string();
    if head.keyword().map_or(false, |kw| KEYWORDS.contains(&kw.as_str())) {
        return None;
    }
    if tokens.get(i + 1).and_then(Token::symbol) == Some('.') {
        let tail = tokens.get(i + 2).and_then(ident_text)?.to_string();
        Some((TableRef::new(Some(&first), &tail), i + 3))
    } else {
        Some((TableRef::new(None, &first), i + 1))
    }
}

fn dedupe_tables(tables: Vec<TableRef>) -> Vec<TableRef> {
    let mut seen = Vec::new();
    for table in tables {
        if !seen.contains(&table) {
            seen.push(table);
        }
    }
    seen
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Clause {
    Other,
    Projection,
    Where,
    GroupBy,
    Having,
    OrderBy,
}

/// Candidate columns: identifiers in projection / WHERE / HAVING / ORDER BY /
/// GROUP BY positions that are not keywords, function calls, or qualifier
/// segments. Qualified references contribute their final segment.
fn extract_columns(tokens: &[Token]) -> Vec<String> {
    let mut columns = Vec::new();
    let mut clause = Clause::Other;

    for (i, token) in tokens.iter().enumerate() {
        if let Some(keyword) = token.keyword() {
            match keyword.as_str() {
                "SELECT" => {
                    clause = Clause::Projection;
                    continue;
                }
                "FROM" | "JOIN" | "ON" | "SET" | "VALUES" | "LIMIT" | "OFFSET" | "UNION" => {
                    clause = Clause::Other;
                    continue;
                }
                "WHERE" => {
                    clause = Clause::Where;
                    continue;
                }
                "GROUP" => {
                    clause = Clause::GroupBy;
                    continue;
                }
                "HAVING" => {
                    clause = Clause::Having;
                    continue;
                }
                "ORDER" => {
                    clause = Clause::OrderBy;
                    continue;
                }
                _ => {}
            }
            if KEYWORDS.contains(&keyword.as_str()) {
                continue;
            }
        }

        if clause == Clause::Other {
            continue;
        }
        let Some(text) = ident_text(token) else {
            continue;
        };
        // A call is a function, not a column.
        if tokens.get(i + 1).and_then(Token::symbol) == Some('(') {
            continue;
        }
        // A qualifier segment (alias or schema) is skipped; the tail names
        // the column.
        if tokens.get(i + 1).and_then(Token::symbol) == Some('.') {
            continue;
        }
        let folded = text.to_lowercase();
        if !columns.contains(&folded) {
            columns.push(folded);
        }
    }

    columns
}

fn top_level_limit(tokens: &[Token]) -> bool {
    tokens.iter().enumerate().any(|(i, token)| {
        token.depth == 0
            && token.is_keyword("LIMIT")
            && matches!(
                tokens.get(i + 1).map(|next| &next.kind),
                Some(TokenKind::Number(n)) if n.parse::<i64>().map(|v| v > 0).unwrap_or(false)
            )
    })
}

/// Aggregate iff the statement has a top-level GROUP BY or an aggregate call
/// in the top-level projection. Aggregates inside FROM or WHERE subqueries do
/// not count; claiming "aggregate" relaxes the LIMIT rule, so this stays
/// narrow.
fn detect_aggregate(tokens: &[Token]) -> bool {
    if tokens
        .iter()
        .any(|token| token.depth == 0 && token.is_keyword("GROUP"))
    {
        return true;
    }

    let mut in_projection = false;
    for (i, token) in tokens.iter().enumerate() {
        if token.depth == 0 {
            if token.is_keyword("SELECT") {
                in_projection = true;
                continue;
            }
            if token.is_keyword("FROM") {
                in_projection = false;
                continue;
            }
        }
        if in_projection {
            if let Some(keyword) = token.keyword() {
                if AGGREGATE_FUNCTIONS.contains(&keyword.as_str())
                    && tokens.get(i + 1).and_then(Token::symbol) == Some('(')
                {
                    return true;
                }
            }
        }
    }
    false
}
