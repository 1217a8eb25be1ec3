//! The database collaborator the engine depends on.
//!
//! Per the specification's scope (spec.md §1), the raw database connection
//! is an external collaborator: something that can run SQL and hand back an
//! asynchronous stream of `LISTEN` notifications. The engine only ever
//! wraps user SQL inside larger SQL it composes itself: it never parses
//! SQL and never interpolates caller-supplied values into a query string.
//!
//! `Connection` is the trait that collaborator must implement. `PgConnection`
//! is the default, production implementation over `tokio_postgres`, built
//! the same way the rest of this codebase's PostgreSQL clients are: connect,
//! then spawn the connection future so it keeps driving I/O in the
//! background (see `new_postgresql_client` in the corpus this engine grew
//! out of).

use async_trait::async_trait;
use serde_json::Value as Json;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_postgres::{AsyncMessage, Client, NoTls};
use tracing::{error, warn};

/// One `NOTIFY` delivered on a channel the engine is listening to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// The database surface the engine needs. Everything the engine sends
/// through here is SQL it built itself from validated identifiers, see
/// `quoting.rs`.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run a statement that doesn't need to report rows back (DDL, or
    /// DML where only the outcome matters).
    async fn execute(&self, sql: &str) -> anyhow::Result<u64>;

    /// Run a query whose rows are already shaped as one JSON object per
    /// row: the caller's SQL is expected to project a single `jsonb`
    /// column per row (the diff engine's `row_to_json` envelope), which
    /// this returns unwrapped rather than re-wrapped under a synthetic
    /// column-name key. Column order inside each object is not
    /// significant; callers index by key.
    async fn query_json(&self, sql: &str) -> anyhow::Result<Vec<Json>>;

    /// Describe the output columns `sql` would produce, without fetching
    /// any rows. Used for `SELECT * FROM (<sql>) q WHERE 0=1`.
    async fn describe_columns(&self, sql: &str) -> anyhow::Result<Vec<String>>;

    /// Start receiving notifications published on `channel`. Multiple
    /// calls with the same channel are independent subscriptions; each
    /// gets its own copy of every notification from the point it was
    /// registered.
    async fn listen(&self, channel: &str) -> anyhow::Result<NotificationReceiver>;
}

/// A live subscription to one notification channel.
pub struct NotificationReceiver {
    channel: String,
    inner: broadcast::Receiver<Notification>,
}

impl NotificationReceiver {
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match self.inner.recv().await {
                Ok(n) if n.channel == self.channel => return Some(n),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "notification receiver lagged, continuing");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// The production `Connection`, backed by a single long-lived
/// `tokio_postgres::Client`. The engine serializes all statements through
/// this one connection (spec §5); `client` is therefore guarded by a
/// mutex rather than pooled.
pub struct PgConnection {
    client: Arc<Mutex<Client>>,
    notifications: broadcast::Sender<Notification>,
}

impl PgConnection {
    /// Connect to `connection_string` and spawn the background task that
    /// drives the connection and fans out `NOTIFY` messages.
    pub async fn connect(connection_string: &str) -> anyhow::Result<Self> {
        let (client, mut connection) = tokio_postgres::connect(connection_string, NoTls).await?;

        let (tx, _rx) = broadcast::channel(1024);
        let tx_task = tx.clone();

        tokio::spawn(async move {
            loop {
                match futures::future::poll_fn(|cx| connection.poll_message(cx)).await {
                    Some(Ok(AsyncMessage::Notification(n))) => {
                        let _ = tx_task.send(Notification {
                            channel: n.channel().to_string(),
                            payload: n.payload().to_string(),
                        });
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!(error = %e, "postgres connection error");
                        break;
                    }
                    None => break,
                }
            }
        });

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
            notifications: tx,
        })
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn execute(&self, sql: &str) -> anyhow::Result<u64> {
        let client = self.client.lock().await;
        Ok(client.execute(sql, &[]).await?)
    }

    async fn query_json(&self, sql: &str) -> anyhow::Result<Vec<Json>> {
        let client = self.client.lock().await;
        let rows = client.query(sql, &[]).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let value: Option<Json> = row.try_get(0)?;
            out.push(value.unwrap_or(Json::Null));
        }
        Ok(out)
    }

    async fn describe_columns(&self, sql: &str) -> anyhow::Result<Vec<String>> {
        let client = self.client.lock().await;
        let stmt = client.prepare(sql).await?;
        Ok(stmt.columns().iter().map(|c| c.name().to_string()).collect())
    }

    async fn listen(&self, channel: &str) -> anyhow::Result<NotificationReceiver> {
        // Identifier-quoting is the caller's job (see `quoting.rs`); by the
        // time a channel name reaches here it is always our own literal
        // `__qw__`, never caller-supplied.
        let client = self.client.lock().await;
        client.execute(&format!("LISTEN {channel}"), &[]).await?;
        Ok(NotificationReceiver {
            channel: channel.to_string(),
            inner: self.notifications.subscribe(),
        })
    }
}
