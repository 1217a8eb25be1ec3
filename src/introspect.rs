//! Column Introspector (spec §4.2).
//!
//! Finds the user-visible output columns of a rewritten query without
//! fetching any rows, by preparing `SELECT * FROM (<sql>) q WHERE 0 = 1`
//! and reading back the column descriptor the server returns.

use crate::connection::Connection;
use crate::error::{Error, Result};

/// Columns reported by the server for `sql_rewritten`, in declared order,
/// with the two meta columns removed.
pub async fn introspect(
    conn: &dyn Connection,
    sql_rewritten: &str,
    id_col: &str,
    rev_col: &str,
) -> Result<Vec<String>> {
    let probe = format!("SELECT * FROM ({sql_rewritten}) q WHERE 0 = 1");
    let columns = conn
        .describe_columns(&probe)
        .await
        .map_err(|source| Error::Introspection { source })?;

    Ok(columns
        .into_iter()
        .filter(|c| c != id_col && c != rev_col)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::{MockConnection, MockResponse};

    #[tokio::test]
    async fn drops_meta_columns_and_preserves_order() {
        let conn = MockConnection::new(|_| {
            Ok(MockResponse::Columns(vec![
                "__id__".to_string(),
                "__rev__".to_string(),
                "a".to_string(),
                "b".to_string(),
            ]))
        });
        let cols = introspect(&conn, "SELECT 1", "__id__", "__rev__").await.unwrap();
        assert_eq!(cols, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn surfaces_introspection_errors() {
        let conn = MockConnection::new(|_| Err(anyhow::anyhow!("syntax error")));
        let err = introspect(&conn, "SELECT 1", "__id__", "__rev__").await.unwrap_err();
        assert_eq!(err.kind(), "Introspection");
    }
}
