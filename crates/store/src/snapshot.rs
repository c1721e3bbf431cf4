use std::sync::Arc;

use kmirror_core::{Kind, ResourceRecord, Uid};
use rustc_hash::FxHashMap;

use crate::KindTable;

/// Read-only view of the store at one point in time. Later store mutations
/// never show through.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    epoch: u64,
    kinds: Arc<FxHashMap<Kind, Arc<KindTable>>>,
}

impl Snapshot {
    pub(crate) fn new(epoch: u64, kinds: FxHashMap<Kind, Arc<KindTable>>) -> Self {
        Self { epoch, kinds: Arc::new(kinds) }
    }

    pub fn epoch(&self) -> u64 { self.epoch }

    /// Copy of every record of `kind`, ordered by uid. Empty for unknown kinds.
    pub fn list(&self, kind: &Kind) -> Vec<ResourceRecord> {
        let Some(table) = self.kinds.get(kind) else { return Vec::new() };
        let mut out: Vec<ResourceRecord> = table.values().cloned().collect();
        out.sort_by(|a, b| a.uid.cmp(&b.uid));
        out
    }

    pub fn get(&self, kind: &Kind, uid: &Uid) -> Option<ResourceRecord> {
        self.kinds.get(kind)?.get(uid).cloned()
    }

    pub fn len(&self, kind: &Kind) -> usize { self.kinds.get(kind).map(|t| t.len()).unwrap_or(0) }

    /// Kinds with an entry, sorted.
    pub fn kinds(&self) -> Vec<Kind> {
        let mut kinds: Vec<Kind> = self.kinds.keys().cloned().collect();
        kinds.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        kinds
    }

    pub fn contains_kind(&self, kind: &Kind) -> bool { self.kinds.contains_key(kind) }
}
