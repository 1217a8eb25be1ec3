//! Identity Rewriter (spec §4.1).
//!
//! Rewrites a user `SELECT` so every output row carries a stable identity
//! and a monotonically increasing revision, and reports which base tables
//! the query depends on.
//!
//! ## How table dependencies are found without parsing SQL
//!
//! The engine never parses SQL. What follows is a small, explicitly scoped
//! keyword scanner, not a grammar, that locates `FROM`/`JOIN` table
//! references so it knows (a) which base tables to instrument with
//! identity/revision columns and (b) where in the query text to splice the
//! two meta-column expressions. It is a textual heuristic, the same kind
//! of "mix SQL into templates" approach the rest of this codebase's
//! PostgreSQL sync layer already uses (see `full_sync.rs`'s
//! `format!("SELECT * FROM {table_name}")`), just narrowed to the one spot
//! that needs it. Two consequences worth knowing:
//!
//! - Every table reference in the watched query must carry an explicit
//!   alias (`FROM orders o`, not `FROM orders`); the scanner uses that
//!   alias to qualify the injected meta-column references.
//! - SQL keywords that reuse the word `FROM` outside a table reference
//!   (`EXTRACT(... FROM ...)`, `SUBSTRING(... FROM ...)`) are not
//!   special-cased; a query that uses them will see a spurious table
//!   reference. This is a known, accepted limitation (see DESIGN.md).

use crate::error::{Error, Result, UnsupportedRelation};
use crate::quoting::{quote_ident, quote_qualified};
use std::collections::BTreeMap;

/// Shared per-client naming for the two meta columns and the revision
/// sequence every instrumented base table draws from.
#[derive(Debug, Clone)]
pub struct IdentityContext {
    pub id_col: String,
    pub rev_col: String,
    pub sequence: String,
}

impl Default for IdentityContext {
    fn default() -> Self {
        Self {
            id_col: "__id__".to_string(),
            rev_col: "__rev__".to_string(),
            sequence: "__qw__rev_seq".to_string(),
        }
    }
}

impl IdentityContext {
    pub fn new(id_col: impl Into<String>, rev_col: impl Into<String>) -> Self {
        Self {
            id_col: id_col.into(),
            rev_col: rev_col.into(),
            sequence: "__qw__rev_seq".to_string(),
        }
    }

    /// DDL that ensures the shared revision sequence exists. Idempotent.
    pub fn ensure_sequence_sql(&self) -> String {
        format!("CREATE SEQUENCE IF NOT EXISTS {}", quote_ident(&self.sequence))
    }

    /// DDL that ensures `table` carries the identity/revision columns and
    /// the two triggers that maintain them. Idempotent: safe to call once
    /// per watcher that references `table`, or a thousand times.
    pub fn ensure_identity_columns_sql(&self, table: &str) -> Vec<String> {
        let qtable = quote_qualified(table);
        let qid = quote_ident(&self.id_col);
        let qrev = quote_ident(&self.rev_col);
        let fn_name = format!("pg_temp.__qw__meta_{}", sanitize(table));

        vec![
            format!("ALTER TABLE {qtable} ADD COLUMN IF NOT EXISTS {qid} UUID"),
            format!("ALTER TABLE {qtable} ADD COLUMN IF NOT EXISTS {qrev} BIGINT"),
            format!(
                "CREATE OR REPLACE FUNCTION {fn_name}() RETURNS trigger AS $$
                 BEGIN
                   IF TG_OP = 'INSERT' AND NEW.{qid} IS NULL THEN
                     NEW.{qid} := (md5(random()::text || clock_timestamp()::text))::uuid;
                   END IF;
                   NEW.{qrev} := nextval('{seq}');
                   RETURN NEW;
                 END;
                 $$ LANGUAGE plpgsql",
                seq = self.sequence,
            ),
            format!("DROP TRIGGER IF EXISTS __qw__meta ON {qtable}"),
            format!(
                "CREATE TRIGGER __qw__meta BEFORE INSERT OR UPDATE ON {qtable} \
                 FOR EACH ROW EXECUTE FUNCTION {fn_name}()"
            ),
        ]
    }
}

fn sanitize(table: &str) -> String {
    table
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

/// One base table the watched query reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub alias: String,
    pub qualified_name: String,
}

/// Result of rewriting a user query.
#[derive(Debug, Clone)]
pub struct Rewritten {
    pub sql: String,
    /// table-key -> fully-qualified base table identifier (unquoted,
    /// dot-separated). Keys are assigned in discovery order as base-36
    /// counters, matching the short-key scheme in spec §4.1.
    pub tables: BTreeMap<String, String>,
}

/// Rewrite `sql` to carry `ctx`'s meta columns, and report the base
/// tables it reads.
pub fn rewrite(sql: &str, ctx: &IdentityContext) -> Result<Rewritten> {
    let refs = scan_table_references(sql)?;
    if refs.is_empty() {
        return Err(Error::UnsupportedSource(UnsupportedRelation(
            "query has no aliased FROM/JOIN table reference to derive identity from".to_string(),
        )));
    }

    let qid = quote_ident(&ctx.id_col);
    let qrev = quote_ident(&ctx.rev_col);

    let id_parts: Vec<String> = refs
        .iter()
        .map(|t| format!("{}.{}::text", t.alias, qid))
        .collect();
    let rev_parts: Vec<String> = refs.iter().map(|t| format!("{}.{}", t.alias, qrev)).collect();

    // The meta identity column carries the raw concatenation, not its hash:
    // the diff engine (spec §4.5) hashes it once at the point a row's `id`
    // is exposed to subscribers. Keeping it unhashed here lets the shadow
    // table's primary key double as a human-debuggable composite key.
    let id_expr = format!("concat_ws('|', {})", id_parts.join(", "));
    let rev_expr = format!("GREATEST({})", rev_parts.join(", "));

    let prefix_end = find_select_prefix_end(sql).ok_or_else(|| {
        Error::UnsupportedSource(UnsupportedRelation(
            "query does not start with a top-level SELECT".to_string(),
        ))
    })?;

    let inner = format!(
        "{prefix}{id_expr} AS {qid}, {rev_expr} AS {qrev}, {rest}",
        prefix = &sql[..prefix_end],
        rest = &sql[prefix_end..],
    );

    let mut tables = BTreeMap::new();
    for (i, t) in refs.into_iter().enumerate() {
        tables.insert(to_base36(i), t.qualified_name);
    }

    Ok(Rewritten {
        sql: format!("SELECT * FROM ({inner}) AS __qw__src"),
        tables,
    })
}

/// Base-36 encode `n` (0 -> "0", 35 -> "z", 36 -> "10", ...).
fn to_base36(mut n: usize) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[n % 36]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap()
}

/// Find the byte offset right after the leading `SELECT`, `SELECT ALL`,
/// `SELECT DISTINCT`, or `SELECT DISTINCT ON (...)` prefix of `sql`.
/// Meta columns are spliced in at this offset, ahead of the user's
/// original select list.
fn find_select_prefix_end(sql: &str) -> Option<usize> {
    let trimmed_start = sql.len() - sql.trim_start().len();
    let rest = &sql[trimmed_start..];
    let lower = rest.to_ascii_lowercase();
    if !lower.starts_with("select") {
        return None;
    }
    let mut idx = trimmed_start + "select".len();
    idx += skip_ws(&sql[idx..]);

    let lower_rest = sql[idx..].to_ascii_lowercase();
    if lower_rest.starts_with("distinct") {
        idx += "distinct".len();
        idx += skip_ws(&sql[idx..]);
        if sql[idx..].starts_with('(') {
            // DISTINCT ON (...)
            let mut depth = 0i32;
            let bytes = sql.as_bytes();
            let mut i = idx;
            while i < bytes.len() {
                match bytes[i] {
                    b'(' => depth += 1,
                    b')' => {
                        depth -= 1;
                        if depth == 0 {
                            i += 1;
                            break;
                        }
                    }
                    _ => {}
                }
                i += 1;
            }
            idx = i;
            idx += skip_ws(&sql[idx..]);
        }
    } else if lower_rest.starts_with("all") {
        idx += "all".len();
        idx += skip_ws(&sql[idx..]);
    }
    Some(idx)
}

fn skip_ws(s: &str) -> usize {
    s.len() - s.trim_start().len()
}

/// Scan `sql` for `FROM`/`JOIN` table references with an explicit alias.
fn scan_table_references(sql: &str) -> Result<Vec<TableRef>> {
    let tokens = tokenize(sql);
    let mut refs = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let lower = tokens[i].to_ascii_lowercase();
        if lower == "from" || lower == "join" {
            if let Some((table_tok, alias_tok, consumed)) = parse_table_and_alias(&tokens, i + 1) {
                let qualified_name = normalize_identifier(&table_tok);
                refs.push(TableRef {
                    alias: alias_tok,
                    qualified_name,
                });
                i += 1 + consumed;
                continue;
            }
        }
        i += 1;
    }
    Ok(refs)
}

/// Starting at `tokens[start]`, try to read `<table> [AS] <alias>`.
/// Returns `(table_token, alias_token, tokens_consumed)`.
fn parse_table_and_alias(tokens: &[String], start: usize) -> Option<(String, String, usize)> {
    let table_tok = tokens.get(start)?;
    if !looks_like_identifier(table_tok) {
        return None;
    }
    let mut next = start + 1;
    let mut consumed = 1;

    if let Some(tok) = tokens.get(next) {
        if tok.eq_ignore_ascii_case("as") {
            next += 1;
            consumed += 1;
        }
    }

    let alias_tok = tokens.get(next)?;
    if !looks_like_identifier(alias_tok) || is_reserved_after_table(alias_tok) {
        return None;
    }
    consumed += 1;

    Some((table_tok.clone(), alias_tok.clone(), consumed))
}

fn is_reserved_after_table(tok: &str) -> bool {
    matches!(
        tok.to_ascii_lowercase().as_str(),
        "on" | "where" | "join"
            | "inner"
            | "left"
            | "right"
            | "full"
            | "cross"
            | "group"
            | "order"
            | "having"
            | "limit"
            | "offset"
            | "union"
            | "intersect"
            | "except"
    )
}

fn looks_like_identifier(tok: &str) -> bool {
    let mut chars = tok.chars();
    match chars.next() {
        Some(c) if c == '"' || c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    true
}

/// Strip one layer of double-quoting from each dot-separated part,
/// producing a plain `schema.table` (or `table`) string.
fn normalize_identifier(tok: &str) -> String {
    tok.split('.')
        .map(|part| {
            if part.starts_with('"') && part.ends_with('"') && part.len() >= 2 {
                part[1..part.len() - 1].replace("\"\"", "\"")
            } else {
                part.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

fn tokenize(sql: &str) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '\'' {
            let start = i;
            i += 1;
            while i < chars.len() {
                if chars[i] == '\'' {
                    if i + 1 < chars.len() && chars[i + 1] == '\'' {
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
            tokens.push(chars[start..i].iter().collect());
            continue;
        }
        if c == '"' {
            let start = i;
            i += 1;
            while i < chars.len() {
                if chars[i] == '"' {
                    if i + 1 < chars.len() && chars[i + 1] == '"' {
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
            while i < chars.len() && chars[i] == '.' {
                i += 1;
                if i < chars.len() && chars[i] == '"' {
                    i += 1;
                    while i < chars.len() {
                        if chars[i] == '"' {
                            i += 1;
                            break;
                        }
                        i += 1;
                    }
                } else {
                    while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                        i += 1;
                    }
                }
            }
            tokens.push(chars[start..i].iter().collect());
            continue;
        }
        if c.is_alphanumeric() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            tokens.push(chars[start..i].iter().collect());
            continue;
        }
        tokens.push(c.to_string());
        i += 1;
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_base36_roundtrips_small_values() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }

    #[test]
    fn scans_single_table_with_alias() {
        let refs = scan_table_references("SELECT o.id FROM orders o WHERE o.total > 0").unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].alias, "o");
        assert_eq!(refs[0].qualified_name, "orders");
    }

    #[test]
    fn scans_join_with_explicit_as() {
        let refs = scan_table_references(
            "SELECT a.x FROM orders AS a JOIN customers AS b ON a.customer_id = b.id",
        )
        .unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[1].qualified_name, "customers");
        assert_eq!(refs[1].alias, "b");
    }

    #[test]
    fn scans_schema_qualified_and_quoted_tables() {
        let refs = scan_table_references(r#"SELECT x FROM "public"."Orders" o"#).unwrap();
        assert_eq!(refs[0].qualified_name, "public.Orders");
    }

    #[test]
    fn rewrite_fails_without_alias() {
        let ctx = IdentityContext::default();
        let err = rewrite("SELECT a FROM t", &ctx).unwrap_err();
        assert!(matches!(err, Error::UnsupportedSource(_)));
    }

    #[test]
    fn rewrite_injects_meta_columns_and_wraps() {
        let ctx = IdentityContext::default();
        let rewritten = rewrite("SELECT t.a FROM t t", &ctx).unwrap();
        assert!(rewritten.sql.contains("concat_ws"));
        assert!(rewritten.sql.contains("GREATEST(t.\"__rev__\")"));
        assert!(rewritten.sql.starts_with("SELECT * FROM (SELECT"));
        assert_eq!(rewritten.tables.get("0"), Some(&"t".to_string()));
    }

    #[test]
    fn rewrite_handles_select_distinct() {
        let ctx = IdentityContext::default();
        let rewritten = rewrite("SELECT DISTINCT t.a FROM t t", &ctx).unwrap();
        assert!(rewritten.sql.contains("DISTINCT concat_ws"));
    }

    #[test]
    fn rewrite_assigns_base36_keys_per_table_in_order() {
        let ctx = IdentityContext::default();
        let rewritten = rewrite(
            "SELECT a.x FROM orders a JOIN customers b ON a.customer_id = b.id",
            &ctx,
        )
        .unwrap();
        assert_eq!(rewritten.tables.get("0"), Some(&"orders".to_string()));
        assert_eq!(rewritten.tables.get("1"), Some(&"customers".to_string()));
    }
}
