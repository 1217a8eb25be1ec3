//! Diff Engine (spec §4.5).
//!
//! A single composite statement that compares a watcher's shadow table
//! against the current result of its rewritten query and atomically
//! reconciles the two, producing the insert/update/delete change set in
//! the same round trip. Structured as the CTE pipeline the specification
//! prescribes:
//!
//! - `q`: the rewritten query, numbered with `ROW_NUMBER() OVER ()`.
//! - `u`: shadow rows whose identity survives but whose revision
//!           advanced; updates the shadow in place.
//! - `d`: shadow rows whose identity no longer appears in `q`; deletes
//!           them, stamping a freshly drawn revision for monotonicity.
//! - `i`: identities new to the shadow, gated on `last_rev` so a
//!           delete-then-reinsert within the same statement can't
//!           resurrect a row the `d` branch is about to remove.
//!
//! Postgres evaluates all of a statement's CTEs against one snapshot, so
//! `i`'s `NOT EXISTS` against the shadow sees the pre-statement shadow,
//! not `u`/`d`'s effects: exactly the "not already present" condition
//! the specification calls for.

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::identity::IdentityContext;
use crate::quoting::quote_ident;
use serde_json::Value as Json;

/// What happened to a row between the previous and current evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Insert = 1,
    Update = 2,
    Delete = 3,
}

/// One entry of a diff's change set.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub id: String,
    pub op: Op,
    pub rn: Option<i64>,
    pub data: Option<Vec<Json>>,
    /// The revision this row carried after the statement committed. Not
    /// part of the subscriber-facing event payload (spec §6); the
    /// scheduler uses it to advance a watcher's `last_rev`.
    pub rev: i64,
}

/// Run one diff-and-reconcile statement and return its change set.
/// `last_rev` is the watcher's highest revision seen so far; the caller
/// is responsible for folding the returned records' revisions into the
/// next `last_rev` (the diff engine does not track it itself).
pub async fn run(
    conn: &dyn Connection,
    shadow: &str,
    cols: &[String],
    sql_rewritten: &str,
    ctx: &IdentityContext,
    last_rev: i64,
) -> Result<Vec<ChangeRecord>> {
    let sql = build_diff_sql(shadow, cols, sql_rewritten, ctx, last_rev);
    let rows = conn
        .query_json(&sql)
        .await
        .map_err(|source| Error::Diff { source })?;
    rows.into_iter().map(parse_record).collect()
}

fn build_diff_sql(
    shadow: &str,
    cols: &[String],
    sql_rewritten: &str,
    ctx: &IdentityContext,
    last_rev: i64,
) -> String {
    let qshadow = quote_ident(shadow);
    let qid = quote_ident(&ctx.id_col);
    let qrev = quote_ident(&ctx.rev_col);

    let data_expr = if cols.is_empty() {
        "'[]'::jsonb".to_string()
    } else {
        let items = cols.iter().map(|c| format!("q.{}", quote_ident(c))).collect::<Vec<_>>().join(", ");
        format!("jsonb_build_array({items})")
    };

    format!(
        "WITH q AS (
           SELECT *, ROW_NUMBER() OVER () AS __qw__rn
           FROM ({sql_rewritten}) __qw__src
         ),
         u AS (
           UPDATE {qshadow} s SET rev = q.{qrev}
           FROM q
           WHERE s.id = q.{qid} AND q.{qrev} > s.rev
           RETURNING s.id, s.rev
         ),
         d AS (
           DELETE FROM {qshadow} s
           WHERE NOT EXISTS (SELECT 1 FROM q WHERE q.{qid} = s.id)
           RETURNING s.id, nextval('{seq_name}') AS rev
         ),
         i AS (
           INSERT INTO {qshadow} (id, rev)
           SELECT q.{qid}, q.{qrev} FROM q
           WHERE q.{qrev} > {last_rev}
             AND NOT EXISTS (SELECT 1 FROM u WHERE u.id = q.{qid})
             AND NOT EXISTS (SELECT 1 FROM {qshadow} s WHERE s.id = q.{qid})
           RETURNING id, rev
         ),
         envelope AS (
           SELECT md5(i.id) AS id, 1 AS op, q.__qw__rn AS rn, {data_expr} AS data, i.rev AS rev
             FROM i JOIN q ON q.{qid} = i.id
           UNION ALL
           SELECT md5(u.id) AS id, 2 AS op, q.__qw__rn AS rn, {data_expr} AS data, u.rev AS rev
             FROM u JOIN q ON q.{qid} = u.id
           UNION ALL
           SELECT md5(d.id) AS id, 3 AS op, NULL::bigint AS rn, NULL::jsonb AS data, d.rev AS rev
             FROM d
         )
         SELECT row_to_json(envelope) AS __qw__row FROM envelope",
        seq_name = ctx.sequence,
    )
}

fn parse_record(row: Json) -> Result<ChangeRecord> {
    let obj = row.as_object().ok_or_else(|| Error::Diff {
        source: anyhow::anyhow!("diff row was not a JSON object"),
    })?;

    let id = obj
        .get("id")
        .and_then(Json::as_str)
        .ok_or_else(|| Error::Diff { source: anyhow::anyhow!("diff row missing 'id'") })?
        .to_string();

    let op = match obj.get("op").and_then(Json::as_i64) {
        Some(1) => Op::Insert,
        Some(2) => Op::Update,
        Some(3) => Op::Delete,
        other => {
            return Err(Error::Diff {
                source: anyhow::anyhow!("diff row had unexpected op {other:?}"),
            })
        }
    };

    let rn = obj.get("rn").and_then(Json::as_i64);
    let data = obj.get("data").and_then(|v| v.as_array()).map(|a| a.clone());
    let rev = obj
        .get("rev")
        .and_then(Json::as_i64)
        .ok_or_else(|| Error::Diff { source: anyhow::anyhow!("diff row missing 'rev'") })?;

    Ok(ChangeRecord { id, op, rn, data, rev })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> IdentityContext {
        IdentityContext::default()
    }

    #[test]
    fn diff_sql_contains_the_three_ctes_and_union() {
        let sql = build_diff_sql("__qw__0", &["a".to_string()], "SELECT a FROM t", &ctx(), 0);
        assert!(sql.contains("u AS ("));
        assert!(sql.contains("d AS ("));
        assert!(sql.contains("i AS ("));
        assert!(sql.contains("UNION ALL"));
        assert!(sql.contains("ROW_NUMBER() OVER ()"));
    }

    #[test]
    fn diff_sql_gates_insert_on_last_rev() {
        let sql = build_diff_sql("__qw__0", &["a".to_string()], "SELECT a FROM t", &ctx(), 42);
        assert!(sql.contains("q.\"__rev__\" > 42"));
    }

    #[test]
    fn parse_record_reads_insert_row() {
        let row = serde_json::json!({"id": "abc", "op": 1, "rn": 3, "data": [1, "x"], "rev": 7});
        let rec = parse_record(row).unwrap();
        assert_eq!(rec.op, Op::Insert);
        assert_eq!(rec.rn, Some(3));
        assert_eq!(rec.data, Some(vec![Json::from(1), Json::from("x")]));
        assert_eq!(rec.rev, 7);
    }

    #[test]
    fn parse_record_reads_delete_row_with_no_data() {
        let row = serde_json::json!({"id": "abc", "op": 3, "rn": null, "data": null, "rev": 9});
        let rec = parse_record(row).unwrap();
        assert_eq!(rec.op, Op::Delete);
        assert_eq!(rec.rn, None);
        assert_eq!(rec.data, None);
        assert_eq!(rec.rev, 9);
    }

    #[tokio::test]
    async fn run_surfaces_database_errors_as_diff_kind() {
        use crate::connection::mock::MockConnection;
        let conn = MockConnection::new(|_| Err(anyhow::anyhow!("deadlock detected")));
        let err = run(&conn, "__qw__0", &["a".to_string()], "SELECT a FROM t", &ctx(), 0)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Diff");
    }
}
