//! Trigger Installer (spec §4.4).
//!
//! Wires a base table to the single `__qw__` notification channel: drop
//! any stale trigger of the same name, (re)create a session-local trigger
//! function, then bind a statement-level `AFTER INSERT OR UPDATE OR
//! DELETE OR TRUNCATE` trigger to it. Installation is single-flight per
//! table-key: concurrent watchers referencing the same base table share
//! one attempt.
//!
//! The single-flight cache is a `tokio::sync::OnceCell` per key rather
//! than a hand-rolled completion latch. One nuance worth recording: if
//! the attempt that "owns" a cell fails, `OnceCell::get_or_try_init`
//! leaves the cell empty and the *next* caller (which may be one of the
//! other watchers that were waiting) becomes the new owner and retries
//! from scratch, rather than every waiter observing the same error. That
//! is safe here because every statement in `install` is itself
//! idempotent (`DROP ... IF EXISTS`, `CREATE OR REPLACE`), so retrying
//! is just redoing idempotent work, not a correctness risk.

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::quoting::{quote_ident, quote_literal, quote_qualified};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::debug;

pub struct TriggerInstaller {
    cells: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
}

impl TriggerInstaller {
    pub fn new() -> Self {
        Self { cells: Mutex::new(HashMap::new()) }
    }

    /// Ensure the table identified by `key` (mapping to `table`) has its
    /// notify trigger installed. Returns once installation has succeeded,
    /// whether by this call or a concurrent one.
    pub async fn ensure(&self, conn: &dyn Connection, key: &str, table: &str) -> Result<()> {
        let cell = {
            let mut cells = self.cells.lock().unwrap();
            cells.entry(key.to_string()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };

        cell.get_or_try_init(|| async { install(conn, key, table).await })
            .await?;
        Ok(())
    }
}

impl Default for TriggerInstaller {
    fn default() -> Self {
        Self::new()
    }
}

async fn install(conn: &dyn Connection, key: &str, table: &str) -> Result<()> {
    let install_err = |source: anyhow::Error| Error::TriggerInstall {
        table: table.to_string(),
        source,
    };

    let qtable = quote_qualified(table);
    let trigger_name = quote_ident(&format!("__qw__{key}"));
    let fn_name = format!("pg_temp.__qw__{key}");

    debug!(table, key, "installing notify trigger");

    conn.execute(&format!("DROP TRIGGER IF EXISTS {trigger_name} ON {qtable}"))
        .await
        .map_err(install_err)?;

    conn.execute(&format!(
        "CREATE OR REPLACE FUNCTION {fn_name}() RETURNS trigger AS $$
         BEGIN
           PERFORM pg_notify('__qw__', {key_literal});
           RETURN NULL;
         END;
         $$ LANGUAGE plpgsql",
        key_literal = quote_literal(key),
    ))
    .await
    .map_err(install_err)?;

    conn.execute(&format!(
        "CREATE TRIGGER {trigger_name} AFTER INSERT OR UPDATE OR DELETE OR TRUNCATE ON {qtable} \
         FOR EACH STATEMENT EXECUTE FUNCTION {fn_name}()"
    ))
    .await
    .map_err(install_err)?;

    Ok(())
}
