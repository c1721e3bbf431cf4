//! One generation of coordinated list+watch across every registration.
//!
//! A round starts one session per registration under a child cancellation
//! token, merges their listings into a single checkpoint, then applies their
//! events until any session exits. Any exit tears down the whole round.

use std::sync::Arc;
use std::time::Instant;

use kmirror_core::prelude::*;
use kmirror_store::{RelistTracker, SnapshotCell, Snapshot, Store};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MirrorConfig;
use crate::session::{SessionExit, WatchSession};

pub type Callback = Box<dyn FnMut(Snapshot) + Send + 'static>;

/// Freezes the store, publishes the snapshot and hands it to the callback.
pub(crate) struct Notifier {
    callback: Callback,
    cell: SnapshotCell,
}

impl Notifier {
    pub(crate) fn new(callback: Callback, cell: SnapshotCell) -> Self { Self { callback, cell } }

    fn notify(&mut self, store: &mut Store) {
        let snapshot = store.freeze();
        counter!("mirror_notifications_total", 1u64);
        debug!(epoch = snapshot.epoch(), "notify");
        self.cell.publish(snapshot.clone());
        (self.callback)(snapshot);
    }
}

pub(crate) enum RoundEnd {
    /// A session exited; start the next round (unless the run was canceled).
    Restart,
    Fatal(MirrorError),
}

pub(crate) struct SynchronizationRound<'a> {
    pub(crate) generation: u64,
    pub(crate) client: &'a Arc<dyn ResourceClient>,
    pub(crate) watches: &'a [WatchSpec],
    pub(crate) config: &'a MirrorConfig,
    pub(crate) store: &'a mut Store,
    pub(crate) notifier: &'a mut Notifier,
}

impl SynchronizationRound<'_> {
    pub(crate) async fn run(self, parent: &CancellationToken) -> RoundEnd {
        let scope = parent.child_token();
        counter!("mirror_rounds_total", 1u64);

        if self.watches.is_empty() {
            debug!(generation = self.generation, "no watches registered; idling until canceled");
            scope.cancelled().await;
            return RoundEnd::Restart;
        }

        let (list_tx, mut list_rx) = mpsc::channel::<Listing>(self.config.queue_cap);
        let (event_tx, mut event_rx) = mpsc::channel::<WatchEvent>(self.config.queue_cap);
        let mut sessions = JoinSet::new();
        for spec in self.watches {
            let session = WatchSession::new(spec.clone(), Arc::clone(self.client), scope.clone(), self.config.retry_delay);
            sessions.spawn(session.run(list_tx.clone(), event_tx.clone()));
        }
        drop(list_tx);
        drop(event_tx);
        info!(generation = self.generation, watches = self.watches.len(), "round started");

        // Catch-up: merge every initial listing before anyone is notified.
        let started = Instant::now();
        let mut dirty = false;
        let kinds: Vec<Kind> = self.watches.iter().map(WatchSpec::kind).collect();
        for kind in &kinds {
            dirty |= self.store.ensure_kind(kind);
        }
        let mut tracker = RelistTracker::begin(&kinds);
        let mut listed = 0usize;
        while listed < self.watches.len() {
            tokio::select! {
                Some(listing) = list_rx.recv() => {
                    dirty |= tracker.merge(self.store, listing.items);
                    listed += 1;
                }
                exit = sessions.join_next() => {
                    log_exit(self.generation, exit);
                    return drain(self.generation, scope, sessions, RoundEnd::Restart).await;
                }
            }
        }
        let removed = tracker.sweep(self.store);
        dirty |= removed > 0;
        histogram!("mirror_catchup_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(generation = self.generation, removed, changed = dirty, took_ms = %started.elapsed().as_millis(), "round caught up");
        if dirty {
            self.notifier.notify(self.store);
        }

        // Steady state: apply events, one notification per processing pass.
        loop {
            tokio::select! {
                Some(event) = event_rx.recv() => {
                    match apply_pass(self.store, event, &mut event_rx, self.config.queue_cap) {
                        Ok(true) => self.notifier.notify(self.store),
                        Ok(false) => {}
                        Err(e) => {
                            error!(generation = self.generation, error = %e, "aborting round");
                            return drain(self.generation, scope, sessions, RoundEnd::Fatal(e)).await;
                        }
                    }
                }
                exit = sessions.join_next() => {
                    log_exit(self.generation, exit);
                    return drain(self.generation, scope, sessions, RoundEnd::Restart).await;
                }
            }
        }
    }
}

/// Apply `first` plus up to `max_batch` events already queued behind it.
/// Returns whether the store changed.
pub(crate) fn apply_pass(
    store: &mut Store,
    first: WatchEvent,
    rx: &mut mpsc::Receiver<WatchEvent>,
    max_batch: usize,
) -> Result<bool, MirrorError> {
    let mut dirty = apply_event(store, first)?;
    for _ in 0..max_batch {
        match rx.try_recv() {
            Ok(event) => dirty |= apply_event(store, event)?,
            Err(_) => break,
        }
    }
    Ok(dirty)
}

fn apply_event(store: &mut Store, event: WatchEvent) -> Result<bool, MirrorError> {
    match event.kind {
        EventKind::Added | EventKind::Modified => Ok(store.upsert(event.record)),
        EventKind::Deleted => Ok(store.remove(&event.record.kind, &event.record.uid)),
        EventKind::Other(event_type) => Err(MirrorError::Invariant { kind: event.record.kind, event_type }),
    }
}

fn log_exit(generation: u64, exit: Option<Result<SessionExit, JoinError>>) {
    match exit {
        Some(Ok(SessionExit::Expired)) => info!(generation, "session expired; restarting all watches"),
        Some(Ok(SessionExit::Canceled)) => debug!(generation, "session canceled"),
        Some(Err(e)) => error!(generation, error = %e, "session task failed"),
        None => warn!(generation, "no sessions left"),
    }
}

/// Cancel the round scope and wait for every remaining session.
async fn drain(generation: u64, scope: CancellationToken, mut sessions: JoinSet<SessionExit>, end: RoundEnd) -> RoundEnd {
    scope.cancel();
    let mut remaining = 0usize;
    while let Some(exit) = sessions.join_next().await {
        remaining += 1;
        if let Err(e) = exit {
            error!(generation, error = %e, "session task failed during shutdown");
        }
    }
    debug!(generation, remaining, "round drained");
    end
}
