//! Watcher state and the subscriber-facing event stream (spec §3, §4.7, §6).

use crate::diff::ChangeRecord;
use crate::error::Error;
use futures::Stream;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Events delivered to a subscriber over a `Subscription`.
#[derive(Debug, Clone)]
pub enum Event {
    /// Initial setup complete; at least one evaluation is scheduled.
    Ready,
    /// Row newly present in the result.
    Insert { id: String, data: Vec<Json> },
    /// Row whose revision advanced.
    Update { id: String, data: Vec<Json> },
    /// Row no longer in the result.
    Delete { id: String },
    /// One batch per evaluation.
    Changes { batch: Vec<ChangeRecord>, cols: Vec<String> },
    /// Any phase failure.
    Error(Arc<Error>),
}

/// The handle returned by `Engine::watch`. Receives every event emitted
/// for this watcher until dropped or explicitly closed.
///
/// Also implements [`futures::Stream`], matching the way the rest of
/// this codebase's notify-driven sources (the trigger-based CDC crates)
/// expose their change feed as a stream rather than a bare channel.
pub struct Subscription {
    pub(crate) receiver: UnboundedReceiverStream<Event>,
    pub(crate) closed: Arc<AtomicBool>,
}

impl Subscription {
    /// Await the next event. Returns `None` once the watcher is closed
    /// and no further events will arrive.
    pub async fn recv(&mut self) -> Option<Event> {
        use futures::StreamExt;
        self.receiver.next().await
    }

    /// Remove this watcher from the scheduler. Best-effort: an in-flight
    /// diff for this watcher still completes, but its events are
    /// discarded rather than delivered (spec §5).
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Per-subscription state the scheduler owns. Not exposed to callers
/// directly; `Subscription` is the public face.
pub(crate) struct Watcher {
    pub id: u64,
    pub sql_rewritten: String,
    pub tables: BTreeMap<String, String>,
    pub cols: Vec<String>,
    pub shadow: String,
    pub last_rev: i64,
    pub stale: u64,
    pub closed: Arc<AtomicBool>,
    sender: mpsc::UnboundedSender<Event>,
}

impl Watcher {
    pub fn new(
        id: u64,
        sql_rewritten: String,
        tables: BTreeMap<String, String>,
        cols: Vec<String>,
        shadow: String,
    ) -> (Self, Subscription) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let watcher = Self {
            id,
            sql_rewritten,
            tables,
            cols,
            shadow,
            last_rev: 0,
            stale: 0,
            closed: closed.clone(),
            sender,
        };
        let receiver = UnboundedReceiverStream::new(receiver);
        (watcher, Subscription { receiver, closed })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn depends_on(&self, table_key: &str) -> bool {
        self.tables.contains_key(table_key)
    }

    /// Best-effort delivery; a subscriber that has dropped its receiver
    /// simply stops getting events, it does not error the scheduler.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscription_receives_emitted_events() {
        let (watcher, mut sub) = Watcher::new(0, "SELECT 1".to_string(), BTreeMap::new(), vec![], "__qw__0".to_string());
        watcher.emit(Event::Ready);
        let event = sub.recv().await.unwrap();
        assert!(matches!(event, Event::Ready));
    }

    #[tokio::test]
    async fn close_marks_watcher_closed() {
        let (watcher, sub) = Watcher::new(0, "SELECT 1".to_string(), BTreeMap::new(), vec![], "__qw__0".to_string());
        assert!(!watcher.is_closed());
        sub.close();
        assert!(watcher.is_closed());
    }

    #[test]
    fn depends_on_checks_table_key_membership() {
        let mut tables = BTreeMap::new();
        tables.insert("0".to_string(), "orders".to_string());
        let (watcher, _sub) = Watcher::new(0, "SELECT 1".to_string(), tables, vec![], "__qw__0".to_string());
        assert!(watcher.depends_on("0"));
        assert!(!watcher.depends_on("1"));
    }

    #[tokio::test]
    async fn subscription_is_usable_as_a_stream() {
        use futures::StreamExt;
        let (watcher, mut sub) = Watcher::new(0, "SELECT 1".to_string(), BTreeMap::new(), vec![], "__qw__0".to_string());
        watcher.emit(Event::Delete { id: "x".to_string() });
        drop(watcher);
        match sub.next().await {
            Some(Event::Delete { id }) => assert_eq!(id, "x"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(sub.next().await.is_none());
    }
}
