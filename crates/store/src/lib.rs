//! kmirror store: the kind → uid → record table, detached snapshots, and the
//! published-snapshot handle readers poll or subscribe to.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use kmirror_core::{Kind, ResourceRecord, Uid};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tracing::{debug, trace};

mod snapshot;

pub use snapshot::Snapshot;

pub(crate) type KindTable = FxHashMap<Uid, ResourceRecord>;

/// Records by kind. Owned by exactly one task; readers only ever see
/// `Snapshot`s. Kind tables are shared with snapshots and copied on the
/// first write after a snapshot was taken.
#[derive(Debug, Default)]
pub struct Store {
    kinds: FxHashMap<Kind, Arc<KindTable>>,
    epoch: u64,
}

impl Store {
    pub fn new() -> Self { Self::default() }

    /// Create an empty entry for `kind` if there is none. Returns true if one was created.
    pub fn ensure_kind(&mut self, kind: &Kind) -> bool {
        if self.kinds.contains_key(kind) {
            return false;
        }
        self.kinds.insert(kind.clone(), Arc::default());
        true
    }

    /// Insert or replace `record` unless an entry with the same resourceVersion
    /// is already present. Returns true if the store changed.
    pub fn upsert(&mut self, record: ResourceRecord) -> bool {
        let table = self.kinds.entry(record.kind.clone()).or_default();
        if let Some(old) = table.get(&record.uid) {
            if old.resource_version == record.resource_version {
                trace!(kind = %record.kind, uid = %record.uid, rv = %record.resource_version, "unchanged");
                return false;
            }
        }
        Arc::make_mut(table).insert(record.uid.clone(), record);
        true
    }

    /// Remove one record. Returns true if it was present.
    pub fn remove(&mut self, kind: &Kind, uid: &Uid) -> bool {
        match self.kinds.get_mut(kind) {
            Some(table) if table.contains_key(uid) => Arc::make_mut(table).remove(uid).is_some(),
            _ => false,
        }
    }

    /// Drop every record of `kind` whose uid is not in `keep`. Returns the number removed.
    pub fn retain_uids(&mut self, kind: &Kind, keep: &FxHashSet<Uid>) -> usize {
        let Some(table) = self.kinds.get_mut(kind) else { return 0 };
        if table.keys().all(|uid| keep.contains(uid)) {
            return 0;
        }
        let table = Arc::make_mut(table);
        let before = table.len();
        table.retain(|uid, _| keep.contains(uid));
        before - table.len()
    }

    pub fn get(&self, kind: &Kind, uid: &Uid) -> Option<&ResourceRecord> { self.kinds.get(kind)?.get(uid) }

    pub fn len(&self, kind: &Kind) -> usize { self.kinds.get(kind).map(|t| t.len()).unwrap_or(0) }

    pub fn contains_kind(&self, kind: &Kind) -> bool { self.kinds.contains_key(kind) }

    /// Number of snapshots frozen so far.
    pub fn epoch(&self) -> u64 { self.epoch }

    /// Detached view of the current contents, without advancing the epoch.
    pub fn view(&self) -> Snapshot { Snapshot::new(self.epoch, self.kinds.clone()) }

    /// Advance the epoch and return a detached view for notification.
    pub fn freeze(&mut self) -> Snapshot {
        self.epoch = self.epoch.saturating_add(1);
        for (kind, table) in &self.kinds {
            metrics::gauge!("mirror_objects", table.len() as f64, "kind" => kind.to_string());
        }
        debug!(epoch = self.epoch, kinds = self.kinds.len(), "store frozen");
        self.view()
    }
}

/// Uids confirmed by the listings of one round, per kind.
#[derive(Debug, Default)]
pub struct RelistTracker {
    observed: FxHashMap<Kind, FxHashSet<Uid>>,
}

impl RelistTracker {
    /// Start tracking `kinds`. Kinds not begun here are never swept.
    pub fn begin<'a>(kinds: impl IntoIterator<Item = &'a Kind>) -> Self {
        let observed = kinds.into_iter().map(|k| (k.clone(), FxHashSet::default())).collect();
        Self { observed }
    }

    /// Merge one listing batch into `store`, remembering every uid seen.
    /// Returns true if the store changed.
    pub fn merge(&mut self, store: &mut Store, items: Vec<ResourceRecord>) -> bool {
        let mut dirty = false;
        for record in items {
            self.observed.entry(record.kind.clone()).or_default().insert(record.uid.clone());
            dirty |= store.upsert(record);
        }
        dirty
    }

    /// Remove records of tracked kinds that no listing confirmed. Returns the number removed.
    pub fn sweep(&self, store: &mut Store) -> usize {
        let mut removed = 0;
        for (kind, keep) in &self.observed {
            let n = store.retain_uids(kind, keep);
            if n > 0 {
                debug!(kind = %kind, removed = n, "dropped objects missing from relist");
            }
            removed += n;
        }
        removed
    }

    pub fn observed(&self, kind: &Kind) -> usize { self.observed.get(kind).map(|s| s.len()).unwrap_or(0) }
}

/// Writer side of the published snapshot.
#[derive(Debug)]
pub struct SnapshotCell {
    snap: Arc<ArcSwap<Snapshot>>,
    epoch_tx: watch::Sender<u64>,
}

impl SnapshotCell {
    pub fn publish(&self, snapshot: Snapshot) {
        let epoch = snapshot.epoch();
        self.snap.store(Arc::new(snapshot));
        self.epoch_tx.send_replace(epoch);
    }
}

/// Handle for readers to access the latest published snapshot and subscribe to swaps.
#[derive(Debug, Clone)]
pub struct MirrorHandle {
    snap: Arc<ArcSwap<Snapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl MirrorHandle {
    pub fn current(&self) -> Arc<Snapshot> { self.snap.load_full() }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// Wait until a snapshot with at least `epoch` has been published.
    pub async fn wait_for_epoch(&self, epoch: u64) -> Arc<Snapshot> {
        let mut rx = self.epoch_rx.clone();
        // The sender lives as long as the mirror; if it is gone, return what we have.
        let _ = rx.wait_for(|e| *e >= epoch).await;
        self.current()
    }
}

/// Create a connected writer/reader pair, starting from an empty snapshot.
pub fn snapshot_cell() -> (SnapshotCell, MirrorHandle) {
    let snap = Arc::new(ArcSwap::from_pointee(Snapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    (SnapshotCell { snap: Arc::clone(&snap), epoch_tx }, MirrorHandle { snap, epoch_rx })
}
