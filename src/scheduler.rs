//! Notify Router / Scheduler (spec §4.6).
//!
//! Exactly one listener per database client is registered on the `__qw__`
//! channel. Every notification marks every watcher whose dependency set
//! contains the carried table-key as one-more-stale; a single background
//! task then repeatedly picks the stalest watcher, clears its counter,
//! and runs its diff: one diff in flight across the whole engine at any
//! instant, which is what keeps every statement this crate issues ordered
//! on the one connection it owns (spec §5).
//!
//! The picking loop is the `O(n)` scan the specification's Design Notes
//! call out as "fine at expected scales (< 10^3 watchers)"; a max-heap
//! keyed on `stale` is named there as a strict improvement, not a
//! requirement, so this stays a linear scan over a `Vec`.

use crate::connection::Connection;
use crate::diff;
use crate::identity::IdentityContext;
use crate::watcher::{Event, Watcher};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

/// Shared, mutable scheduler state: every watcher ever registered, plus
/// the FIFO order new watchers arrived in (used only to break ties
/// between equally-stale watchers, per spec §4.6).
struct State {
    watchers: HashMap<u64, Watcher>,
    order: Vec<u64>,
}

/// Owns the single in-flight-diff discipline (spec §5) and the
/// stalest-first pick (spec §4.6). One `Scheduler` per `Engine`.
pub struct Scheduler {
    state: Mutex<State>,
    wake: Notify,
    context: IdentityContext,
}

impl Scheduler {
    pub fn new(context: IdentityContext) -> Self {
        Self {
            state: Mutex::new(State { watchers: HashMap::new(), order: Vec::new() }),
            wake: Notify::new(),
            context,
        }
    }

    /// Register a newly-built watcher and mark it stale so its first
    /// evaluation runs as soon as the scheduler loop is free (spec §4.7
    /// step 4).
    pub async fn register(&self, watcher: Watcher) {
        let id = watcher.id;
        let mut state = self.state.lock().await;
        state.watchers.insert(id, watcher);
        state.order.push(id);
        if let Some(w) = state.watchers.get_mut(&id) {
            w.stale = 1;
        }
        drop(state);
        self.wake.notify_one();
    }

    /// Apply one incoming notification: every watcher depending on `key`
    /// gets `stale += 1` (spec §4.6 step 1), then the loop is woken.
    pub async fn notify(&self, key: &str) {
        let mut state = self.state.lock().await;
        let mut affected = 0u32;
        for w in state.watchers.values_mut() {
            if w.depends_on(key) {
                w.stale += 1;
                affected += 1;
            }
        }
        drop(state);
        if affected > 0 {
            debug!(key, affected, "notification marked watchers stale");
            self.wake.notify_one();
        }
    }

    /// Run forever, picking the stalest watcher and evaluating it, one
    /// at a time (spec §4.6's single-flight requirement). Intended to be
    /// spawned once per `Engine` and left running for the connection's
    /// lifetime; returns only if the loop is explicitly asked to stop,
    /// which this engine never does (mirrors `ConnectionLost` being
    /// fatal to the whole instance rather than recoverable).
    pub async fn run(self: Arc<Self>, conn: Arc<dyn Connection>) {
        loop {
            let picked = self.pick_and_claim().await;
            let Some(id) = picked else {
                self.wake.notified().await;
                continue;
            };
            self.evaluate(conn.as_ref(), id).await;
        }
    }

    /// Find the stalest, not-closed, stale>0 watcher; reap any closed
    /// watchers along the way (spec §5's best-effort close teardown);
    /// clear the winner's `stale` to zero *before* returning so a
    /// notification arriving mid-diff re-increments it rather than being
    /// lost (spec §4.6 step 2).
    async fn pick_and_claim(&self) -> Option<u64> {
        let mut state = self.state.lock().await;
        state.order.retain(|id| state.watchers.contains_key(id));

        let closed: Vec<u64> = state
            .watchers
            .iter()
            .filter(|(_, w)| w.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for id in closed {
            state.watchers.remove(&id);
        }
        state.order.retain(|id| state.watchers.contains_key(id));

        let mut best: Option<(u64, u64, usize)> = None; // (stale, id, order_index)
        for (idx, id) in state.order.iter().enumerate() {
            let w = state.watchers.get(id).unwrap();
            if w.stale == 0 {
                continue;
            }
            let candidate = (w.stale, *id, idx);
            match &best {
                Some((best_stale, _, best_idx)) => {
                    if candidate.0 > *best_stale || (candidate.0 == *best_stale && candidate.2 < *best_idx) {
                        best = Some(candidate);
                    }
                }
                None => best = Some(candidate),
            }
        }

        let (_, id, _) = best?;
        state.watchers.get_mut(&id).unwrap().stale = 0;
        Some(id)
    }

    async fn evaluate(&self, conn: &dyn Connection, id: u64) {
        let (shadow, cols, sql_rewritten, last_rev, ctx) = {
            let state = self.state.lock().await;
            let Some(w) = state.watchers.get(&id) else { return };
            (
                w.shadow.clone(),
                w.cols.clone(),
                w.sql_rewritten.clone(),
                w.last_rev,
                self.context.clone(),
            )
        };

        match diff::run(conn, &shadow, &cols, &sql_rewritten, &ctx, last_rev).await {
            Ok(batch) => {
                let max_rev = batch.iter().map(|r| r.rev).max();
                let mut state = self.state.lock().await;
                if let Some(w) = state.watchers.get_mut(&id) {
                    if w.is_closed() {
                        return;
                    }
                    if let Some(rev) = max_rev {
                        w.last_rev = w.last_rev.max(rev);
                    }
                    // A watcher notified for a table it depends on but
                    // whose result didn't actually change (e.g. scenario
                    // 5 in spec §8: two watchers on the same table, only
                    // one of them affected by a given row) gets an empty
                    // batch. Stay silent rather than emit an empty
                    // `changes`.
                    if !batch.is_empty() {
                        for rec in &batch {
                            let event = match rec.op {
                                diff::Op::Insert => Event::Insert {
                                    id: rec.id.clone(),
                                    data: rec.data.clone().unwrap_or_default(),
                                },
                                diff::Op::Update => Event::Update {
                                    id: rec.id.clone(),
                                    data: rec.data.clone().unwrap_or_default(),
                                },
                                diff::Op::Delete => Event::Delete { id: rec.id.clone() },
                            };
                            w.emit(event);
                        }
                        w.emit(Event::Changes { batch, cols: w.cols.clone() });
                    }
                }
            }
            Err(err) => {
                warn!(watcher = id, error = %err, "diff failed, watcher remains subscribed");
                let state = self.state.lock().await;
                if let Some(w) = state.watchers.get(&id) {
                    w.emit(Event::Error(Arc::new(err)));
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn stale_of(&self, id: u64) -> Option<u64> {
        self.state.lock().await.watchers.get(&id).map(|w| w.stale)
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, id: u64) -> bool {
        self.state.lock().await.watchers.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::{MockConnection, MockResponse};
    use std::collections::BTreeMap;

    fn watcher(id: u64, table_key: &str) -> (Watcher, crate::watcher::Subscription) {
        let mut tables = BTreeMap::new();
        tables.insert(table_key.to_string(), "t".to_string());
        Watcher::new(id, "SELECT a FROM t t".to_string(), tables, vec!["a".to_string()], format!("__qw__{id}"))
    }

    #[tokio::test]
    async fn register_marks_the_new_watcher_stale() {
        let sched = Scheduler::new(IdentityContext::default());
        let (w, _sub) = watcher(0, "0");
        sched.register(w).await;
        assert_eq!(sched.stale_of(0).await, Some(1));
    }

    #[tokio::test]
    async fn notify_only_increments_dependent_watchers() {
        let sched = Scheduler::new(IdentityContext::default());
        let (w0, _s0) = watcher(0, "0");
        let (w1, _s1) = watcher(1, "1");
        sched.register(w0).await;
        sched.register(w1).await;
        // registering clears neither, both start at stale=1; drain by picking.
        sched.pick_and_claim().await;
        sched.pick_and_claim().await;

        sched.notify("0").await;
        assert_eq!(sched.stale_of(0).await, Some(1));
        assert_eq!(sched.stale_of(1).await, Some(0));
    }

    #[tokio::test]
    async fn pick_and_claim_prefers_stalest_and_clears_it() {
        let sched = Scheduler::new(IdentityContext::default());
        let (w0, _s0) = watcher(0, "0");
        let (w1, _s1) = watcher(1, "1");
        sched.register(w0).await;
        sched.register(w1).await;
        sched.pick_and_claim().await;
        sched.pick_and_claim().await;

        sched.notify("0").await;
        sched.notify("0").await;
        sched.notify("1").await;

        let picked = sched.pick_and_claim().await;
        assert_eq!(picked, Some(0));
        assert_eq!(sched.stale_of(0).await, Some(0));
        assert_eq!(sched.stale_of(1).await, Some(1));
    }

    #[tokio::test]
    async fn pick_and_claim_breaks_ties_by_registration_order() {
        let sched = Scheduler::new(IdentityContext::default());
        let (w0, _s0) = watcher(0, "0");
        let (w1, _s1) = watcher(1, "1");
        sched.register(w0).await;
        sched.register(w1).await;

        let picked = sched.pick_and_claim().await;
        assert_eq!(picked, Some(0));
    }

    #[tokio::test]
    async fn pick_and_claim_reaps_closed_watchers() {
        let sched = Scheduler::new(IdentityContext::default());
        let (w0, sub0) = watcher(0, "0");
        sched.register(w0).await;
        sub0.close();
        let picked = sched.pick_and_claim().await;
        assert_eq!(picked, None);
        assert!(!sched.contains(0).await);
    }

    #[tokio::test]
    async fn evaluate_emits_changes_and_advances_last_rev() {
        let conn = MockConnection::new(|_| {
            Ok(MockResponse::Rows(vec![serde_json::json!(
                {"id": "abc", "op": 1, "rn": 1, "data": [1], "rev": 5}
            )]))
        });
        let sched = Scheduler::new(IdentityContext::default());
        let (w0, mut sub0) = watcher(0, "0");
        sched.register(w0).await;
        sched.pick_and_claim().await;

        sched.evaluate(&conn, 0).await;

        let mut saw_insert = false;
        let mut saw_changes = false;
        for _ in 0..2 {
            match sub0.recv().await.unwrap() {
                Event::Insert { id, .. } => {
                    assert_eq!(id, "abc");
                    saw_insert = true;
                }
                Event::Changes { batch, .. } => {
                    assert_eq!(batch.len(), 1);
                    saw_changes = true;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(saw_insert && saw_changes);
    }

    #[tokio::test]
    async fn evaluate_reports_diff_errors_without_unsubscribing() {
        let conn = MockConnection::new(|_| Err(anyhow::anyhow!("deadlock detected")));
        let sched = Scheduler::new(IdentityContext::default());
        let (w0, mut sub0) = watcher(0, "0");
        sched.register(w0).await;
        sched.pick_and_claim().await;

        sched.evaluate(&conn, 0).await;

        match sub0.recv().await.unwrap() {
            Event::Error(err) => assert_eq!(err.kind(), "Diff"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(sched.contains(0).await);
    }
}
