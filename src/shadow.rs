//! Shadow Table Manager (spec §4.3).
//!
//! Allocates one session-local, two-column table per watcher: `(id TEXT
//! PRIMARY KEY, rev BIGINT NOT NULL)`, named `__qw__<n>` where `n` is a
//! monotonic counter scoped to the engine instance. Session-local because
//! the engine's one long-lived connection is the only thing that ever
//! reads or writes it; nothing survives a reconnect (spec §1 non-goals).

use crate::connection::Connection;
use crate::quoting::quote_ident;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct ShadowTables {
    next: AtomicU64,
}

impl ShadowTables {
    pub fn new() -> Self {
        Self { next: AtomicU64::new(0) }
    }

    /// Create the next shadow table and return its (already-quoted-safe,
    /// plain) identifier.
    pub async fn allocate(&self, conn: &dyn Connection) -> anyhow::Result<String> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let name = format!("__qw__{n}");
        let qname = quote_ident(&name);
        conn.execute(&format!(
            "CREATE TEMPORARY TABLE {qname} (id TEXT PRIMARY KEY, rev BIGINT NOT NULL)"
        ))
        .await?;
        Ok(name)
    }
}

impl Default for ShadowTables {
    fn default() -> Self {
        Self::new()
    }
}
