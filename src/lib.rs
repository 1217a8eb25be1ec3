//! Turns an SQL `SELECT` against PostgreSQL into a live, incrementally
//! updated result set.
//!
//! `Engine::watch(sql)` returns a [`Subscription`] that first emits a
//! `ready` event, then one `changes`/`insert`/`update`/`delete` batch per
//! re-evaluation, driven by `LISTEN`/`NOTIFY` traffic off the base tables
//! the query reads (see the crate's `SPEC_FULL.md` for the full design).
//!
//! The engine owns exactly one long-lived [`Connection`] and serializes
//! every statement it issues through the [`Scheduler`]'s single-flight
//! diff loop; see `scheduler.rs` for why that matters.

pub mod connection;
pub mod diff;
pub mod error;
pub mod identity;
pub mod introspect;
pub mod quoting;
pub mod scheduler;
pub mod shadow;
pub mod trigger;
pub mod watcher;

pub use connection::{Connection, PgConnection};
pub use error::{Error, Result};
pub use watcher::{Event, Subscription};

use identity::IdentityContext;
use scheduler::Scheduler;
use shadow::ShadowTables;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;
use trigger::TriggerInstaller;
use watcher::Watcher;

/// Entry point: one `Engine` per database client. Holds every piece of
/// long-lived state the specification's components need: the shared
/// identity context, the shadow-table allocator, the trigger
/// single-flight cache, and the scheduler, and wires a background
/// notification-listener task plus the scheduler's evaluation loop the
/// first time a caller awaits [`Engine::connect`]/[`Engine::new`].
pub struct Engine {
    conn: Arc<dyn Connection>,
    context: IdentityContext,
    shadows: ShadowTables,
    triggers: TriggerInstaller,
    scheduler: Arc<Scheduler>,
    next_watcher_id: AtomicU64,
    listener_started: OnceCell<()>,
}

/// The single literal channel every base-table trigger notifies on
/// (spec §6).
const NOTIFY_CHANNEL: &str = "__qw__";

impl Engine {
    /// Build an engine over an already-connected [`Connection`], with the
    /// default meta-column names `__id__`/`__rev__` (spec §6).
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self::with_context(conn, IdentityContext::default())
    }

    /// Build an engine overriding the meta-column names the identity
    /// rewriter injects. The two names must not otherwise appear in a
    /// watched query's user-visible output; collisions are reported as
    /// `Error::UnsupportedSource` the first time a query that collides is
    /// rewritten (SPEC_FULL.md §B.1).
    pub fn with_names(conn: Arc<dyn Connection>, uid_col: impl Into<String>, rev_col: impl Into<String>) -> Self {
        Self::with_context(conn, IdentityContext::new(uid_col, rev_col))
    }

    fn with_context(conn: Arc<dyn Connection>, context: IdentityContext) -> Self {
        Self {
            conn,
            scheduler: Arc::new(Scheduler::new(context.clone())),
            context,
            shadows: ShadowTables::new(),
            triggers: TriggerInstaller::new(),
            next_watcher_id: AtomicU64::new(0),
            listener_started: OnceCell::new(),
        }
    }

    /// Connect to `connection_string` and build an `Engine` over a fresh
    /// [`PgConnection`]. Convenience wrapper; equivalent to calling
    /// `PgConnection::connect` and passing the result to [`Engine::new`].
    pub async fn connect(connection_string: &str) -> anyhow::Result<Self> {
        let conn = PgConnection::connect(connection_string).await?;
        Ok(Self::new(Arc::new(conn)))
    }

    /// Subscribe to a user `SELECT`. Returns synchronously; the rewrite,
    /// introspection, trigger installation, and first evaluation all
    /// happen on the scheduler's background task (spec §4.7).
    pub async fn watch(&self, sql: &str) -> Result<Subscription> {
        self.ensure_listener_started().await;

        let rewritten = identity::rewrite(sql, &self.context)?;
        let cols = introspect::introspect(
            self.conn.as_ref(),
            &rewritten.sql,
            &self.context.id_col,
            &self.context.rev_col,
        )
        .await?;

        for table in rewritten.tables.values() {
            let ddl = self.context.ensure_identity_columns_sql(table);
            for stmt in ddl {
                self.conn.execute(&stmt).await.map_err(|_| {
                    Error::UnsupportedSource(error::UnsupportedRelation(table.clone()))
                })?;
            }
        }
        self.conn
            .execute(&self.context.ensure_sequence_sql())
            .await
            .map_err(|source| Error::ConnectionLost { source })?;

        let shadow = self
            .shadows
            .allocate(self.conn.as_ref())
            .await
            .map_err(|source| Error::ConnectionLost { source })?;

        for (key, table) in &rewritten.tables {
            self.triggers.ensure(self.conn.as_ref(), key, table).await?;
        }

        let id = self.next_watcher_id.fetch_add(1, Ordering::SeqCst);
        let (watcher, subscription) =
            Watcher::new(id, rewritten.sql.clone(), rewritten.tables.clone(), cols, shadow.clone());

        info!(watcher = id, shadow, tables = rewritten.tables.len(), "watcher registered");

        // `ready` fires here, directly, rather than through the
        // scheduler: the scheduler only ever emits `changes`/row events/
        // `error` off a diff run, and `ready` means exactly "steps 1-4 of
        // §4.7 completed", which is this point.
        watcher.emit(Event::Ready);
        self.scheduler.register(watcher).await;

        Ok(subscription)
    }

    async fn ensure_listener_started(&self) {
        let conn = self.conn.clone();
        let scheduler = self.scheduler.clone();
        self.listener_started
            .get_or_init(|| async move {
                let mut receiver = match conn.listen(NOTIFY_CHANNEL).await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to start listening on notify channel");
                        return;
                    }
                };
                let sched_loop = scheduler.clone();
                let conn_loop = conn.clone();
                tokio::spawn(async move { sched_loop.run(conn_loop).await });

                tokio::spawn(async move {
                    while let Some(n) = receiver.recv().await {
                        scheduler.notify(&n.payload).await;
                    }
                    tracing::error!("notification channel closed; engine can no longer see base-table changes");
                });
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connection::mock::{MockConnection, MockResponse};

    #[tokio::test]
    async fn watch_emits_ready_then_initial_snapshot() {
        let conn = Arc::new(MockConnection::new(|sql| {
            if sql.contains("WHERE 0 = 1") {
                Ok(MockResponse::Columns(vec!["__id__".to_string(), "__rev__".to_string(), "a".to_string()]))
            } else if sql.starts_with("WITH q AS") {
                Ok(MockResponse::Rows(vec![serde_json::json!(
                    {"id": "h1", "op": 1, "rn": 1, "data": [1], "rev": 1}
                )]))
            } else {
                Ok(MockResponse::RowCount(0))
            }
        }));

        let engine = Engine::new(conn);
        let mut sub = engine.watch("SELECT a FROM t t").await.unwrap();

        let first = sub.recv().await.unwrap();
        assert!(matches!(first, Event::Ready));

        // give the scheduler loop a chance to pick up the freshly
        // registered, stale=1 watcher.
        let mut saw_changes = false;
        for _ in 0..5 {
            match tokio::time::timeout(std::time::Duration::from_millis(200), sub.recv()).await {
                Ok(Some(Event::Changes { batch, .. })) => {
                    assert_eq!(batch.len(), 1);
                    saw_changes = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_changes, "expected a changes batch after the initial evaluation");
    }

    #[tokio::test]
    async fn watch_fails_fast_on_unaliased_table() {
        let conn = Arc::new(MockConnection::new(|_| Ok(MockResponse::RowCount(0))));
        let engine = Engine::new(conn);
        let err = engine.watch("SELECT a FROM t").await.unwrap_err();
        assert_eq!(err.kind(), "UnsupportedSource");
    }
}
