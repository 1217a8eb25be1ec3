//! Error kinds surfaced by the engine.
//!
//! The variants mirror the error-kind table in the specification: each
//! phase of a watcher's lifecycle (rewrite, introspection, trigger
//! installation, diff) has exactly one variant, plus `ConnectionLost` for
//! failures that are fatal to the whole engine. The underlying cause is
//! kept as `anyhow::Error` rather than `tokio_postgres::Error` directly so
//! that a test `Connection` (see `connection.rs`) can report failures
//! without depending on the wire protocol crate.

use std::fmt;

/// A relation the identity rewriter could not safely wrap with meta
/// columns: a non-updatable view, a foreign table, or anything else that
/// cannot accept the identity/revision columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedRelation(pub String);

impl fmt::Display for UnsupportedRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "relation '{}' cannot be watched", self.0)
    }
}

/// Errors raised by the engine, tagged by the phase that raised them.
///
/// Recovery differs per variant (spec §7):
/// - `UnsupportedSource` / `Introspection` are fatal to the one watcher
///   being set up.
/// - `TriggerInstall` is fatal to every watcher currently awaiting that
///   particular table's trigger; other watchers are unaffected.
/// - `Diff` is reported to the affected watcher, which remains subscribed.
/// - `ConnectionLost` is fatal to the whole engine instance.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The identity rewriter found a base relation it cannot instrument.
    #[error("unsupported source: {0}")]
    UnsupportedSource(UnsupportedRelation),

    /// The `WHERE 0=1` column-introspection query failed.
    #[error("column introspection failed: {source}")]
    Introspection { source: anyhow::Error },

    /// Dropping/creating the trigger function or the trigger itself
    /// failed for the named base table.
    #[error("failed to install trigger on '{table}': {source}")]
    TriggerInstall { table: String, source: anyhow::Error },

    /// The composite diff statement aborted; the shadow table is
    /// unchanged.
    #[error("diff evaluation failed: {source}")]
    Diff { source: anyhow::Error },

    /// The underlying database connection died. Fatal to the engine: all
    /// shadow tables were session-scoped and are implicitly gone.
    #[error("connection lost: {source}")]
    ConnectionLost { source: anyhow::Error },
}

impl Error {
    /// Short, stable tag for the error's phase. Handy for logging and for
    /// subscribers that want to branch on kind without a full `match`.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::UnsupportedSource(_) => "UnsupportedSource",
            Error::Introspection { .. } => "Introspection",
            Error::TriggerInstall { .. } => "TriggerInstall",
            Error::Diff { .. } => "Diff",
            Error::ConnectionLost { .. } => "ConnectionLost",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
