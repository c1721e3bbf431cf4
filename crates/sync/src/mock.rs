//! Scripted in-memory `ResourceClient` for tests and demos.
//!
//! Listings are queued per kind; the last one queued keeps being served.
//! Watches are served from per-kind feeds the caller pushes frames into; a
//! kind with no queued feed gets a stream that never yields. Scripts added
//! with the `*_in` variants apply to one namespace only and take precedence
//! over kind-wide scripts for that namespace.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::channel::mpsc as fmpsc;
use futures::StreamExt;
use kmirror_core::prelude::*;
use tokio::sync::Notify;

#[derive(Clone)]
enum ListStep {
    Items(Listing),
    Fail(String),
}

enum WatchStep {
    Feed(fmpsc::UnboundedReceiver<Result<WatchFrame, ClientError>>),
    Fail(String),
    Expired,
}

/// `None` namespace means the script serves every namespace of the kind.
type Scope = (Kind, Option<Namespace>);

#[derive(Default)]
struct MockState {
    lists: HashMap<Scope, VecDeque<ListStep>>,
    watches: HashMap<Scope, VecDeque<WatchStep>>,
    gates: HashMap<Kind, Arc<Notify>>,
    list_calls: HashMap<Scope, usize>,
    watch_calls: Vec<(Kind, Namespace, ResourceVersion)>,
}

impl MockState {
    /// Namespace-specific script key if one exists, else the kind-wide key.
    fn scope_for<T>(scripts: &HashMap<Scope, T>, kind: &Kind, namespace: &Namespace) -> Scope {
        let exact = (kind.clone(), Some(namespace.clone()));
        if scripts.contains_key(&exact) {
            exact
        } else {
            (kind.clone(), None)
        }
    }
}

/// Sender half of one scripted watch stream. Dropping it ends the stream.
#[derive(Debug, Clone)]
pub struct WatchFeed {
    tx: fmpsc::UnboundedSender<Result<WatchFrame, ClientError>>,
}

impl WatchFeed {
    pub fn send(&self, event: WatchEvent) { let _ = self.tx.unbounded_send(Ok(event.into())); }

    pub fn added(&self, record: ResourceRecord) { self.send(WatchEvent::added(record)) }
    pub fn modified(&self, record: ResourceRecord) { self.send(WatchEvent::modified(record)) }
    pub fn deleted(&self, record: ResourceRecord) { self.send(WatchEvent::deleted(record)) }

    pub fn bookmark(&self, resource_version: &str) {
        let _ = self.tx.unbounded_send(Ok(WatchFrame::Bookmark(ResourceVersion::from(resource_version))));
    }

    /// Report a too-old resourceVersion on the open stream.
    pub fn expire(&self) { let _ = self.tx.unbounded_send(Err(ClientError::Expired("410 Gone".into()))); }

    pub fn fail(&self, message: &str) {
        let _ = self.tx.unbounded_send(Err(ClientError::Transient(anyhow::anyhow!(message.to_string()))));
    }
}

#[derive(Default)]
pub struct MockClient {
    state: Mutex<MockState>,
}

impl std::fmt::Debug for MockClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("MockClient") }
}

impl MockClient {
    pub fn new() -> Self { Self::default() }

    fn state(&self) -> MutexGuard<'_, MockState> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    fn push_list_step(&self, scope: Scope, step: ListStep) {
        self.state().lists.entry(scope).or_default().push_back(step);
    }

    fn push_watch_step(&self, scope: Scope, step: WatchStep) {
        self.state().watches.entry(scope).or_default().push_back(step);
    }

    /// Queue a successful listing for `kind`.
    pub fn push_list(&self, kind: &str, resource_version: &str, items: Vec<ResourceRecord>) {
        let listing = Listing { items, resource_version: ResourceVersion::from(resource_version) };
        self.push_list_step((Kind::from(kind), None), ListStep::Items(listing));
    }

    /// Queue a successful listing for `kind` in `namespace` only.
    pub fn push_list_in(&self, namespace: &str, kind: &str, resource_version: &str, items: Vec<ResourceRecord>) {
        let listing = Listing { items, resource_version: ResourceVersion::from(resource_version) };
        self.push_list_step((Kind::from(kind), Some(Namespace::from(namespace))), ListStep::Items(listing));
    }

    /// Queue a transient list failure for `kind`.
    pub fn fail_list(&self, kind: &str, message: &str) {
        self.push_list_step((Kind::from(kind), None), ListStep::Fail(message.to_string()));
    }

    /// Queue a watch stream for `kind` and return its feed.
    pub fn watch_feed(&self, kind: &str) -> WatchFeed {
        let (tx, rx) = fmpsc::unbounded();
        self.push_watch_step((Kind::from(kind), None), WatchStep::Feed(rx));
        WatchFeed { tx }
    }

    /// Queue a watch stream for `kind` in `namespace` only.
    pub fn watch_feed_in(&self, namespace: &str, kind: &str) -> WatchFeed {
        let (tx, rx) = fmpsc::unbounded();
        self.push_watch_step((Kind::from(kind), Some(Namespace::from(namespace))), WatchStep::Feed(rx));
        WatchFeed { tx }
    }

    /// Queue a transient failure when opening a watch for `kind`.
    pub fn fail_watch(&self, kind: &str, message: &str) {
        self.push_watch_step((Kind::from(kind), None), WatchStep::Fail(message.to_string()));
    }

    /// Queue an expiry when opening a watch for `kind`.
    pub fn expire_watch(&self, kind: &str) { self.push_watch_step((Kind::from(kind), None), WatchStep::Expired); }

    /// Hold every list call for `kind` until the returned `Notify` is signalled
    /// once per call.
    pub fn gate_lists(&self, kind: &str) -> Arc<Notify> {
        Arc::clone(self.state().gates.entry(Kind::from(kind)).or_insert_with(|| Arc::new(Notify::new())))
    }

    /// List calls for `kind` across all namespaces.
    pub fn list_calls(&self, kind: &str) -> usize {
        let kind = Kind::from(kind);
        self.state().list_calls.iter().filter(|((k, _), _)| *k == kind).map(|(_, n)| *n).sum()
    }

    pub fn list_calls_in(&self, namespace: &str, kind: &str) -> usize {
        let scope = (Kind::from(kind), Some(Namespace::from(namespace)));
        self.state().list_calls.get(&scope).copied().unwrap_or(0)
    }

    /// Every watch opened so far, with the resourceVersion it resumed from.
    pub fn watch_calls(&self) -> Vec<(Kind, ResourceVersion)> {
        self.state().watch_calls.iter().map(|(k, _, rv)| (k.clone(), rv.clone())).collect()
    }

    /// Watches opened for `kind` in `namespace`, as the versions they resumed from.
    pub fn watch_calls_in(&self, namespace: &str, kind: &str) -> Vec<ResourceVersion> {
        let (kind, namespace) = (Kind::from(kind), Namespace::from(namespace));
        self.state()
            .watch_calls
            .iter()
            .filter(|(k, ns, _)| *k == kind && *ns == namespace)
            .map(|(_, _, rv)| rv.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl ResourceClient for MockClient {
    async fn list(&self, descriptor: &Arc<dyn KindDescriptor>, namespace: &Namespace) -> Result<Listing, ClientError> {
        let kind = descriptor.kind();
        let gate = self.state().gates.get(&kind).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let mut state = self.state();
        *state.list_calls.entry((kind.clone(), Some(namespace.clone()))).or_default() += 1;
        let scope = MockState::scope_for(&state.lists, &kind, namespace);
        let queue = state.lists.entry(scope).or_default();
        let step = if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() };
        match step {
            Some(ListStep::Items(listing)) => Ok(listing),
            Some(ListStep::Fail(message)) => Err(ClientError::Transient(anyhow::anyhow!(message))),
            None => Ok(Listing { items: Vec::new(), resource_version: ResourceVersion::from("0") }),
        }
    }

    async fn watch(
        &self,
        descriptor: &Arc<dyn KindDescriptor>,
        namespace: &Namespace,
        from: &ResourceVersion,
    ) -> Result<EventStream, ClientError> {
        let kind = descriptor.kind();
        let mut state = self.state();
        state.watch_calls.push((kind.clone(), namespace.clone(), from.clone()));
        let scope = MockState::scope_for(&state.watches, &kind, namespace);
        match state.watches.get_mut(&scope).and_then(|q| q.pop_front()) {
            Some(WatchStep::Feed(rx)) => Ok(rx.boxed()),
            Some(WatchStep::Fail(message)) => Err(ClientError::Transient(anyhow::anyhow!(message))),
            Some(WatchStep::Expired) => Err(ClientError::Expired("410 Gone".into())),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

/// Record of `kind` with `metadata.name` set to the uid.
pub fn record(kind: &str, uid: &str, resource_version: &str) -> ResourceRecord {
    let raw = serde_json::json!({
        "metadata": { "name": uid, "uid": uid, "resourceVersion": resource_version }
    });
    ResourceRecord::new(Kind::from(kind), Uid::from(uid), ResourceVersion::from(resource_version), raw)
}

/// Like [`record`], with `metadata.namespace` set.
pub fn record_in(namespace: &str, kind: &str, uid: &str, resource_version: &str) -> ResourceRecord {
    let raw = serde_json::json!({
        "metadata": { "name": uid, "namespace": namespace, "uid": uid, "resourceVersion": resource_version }
    });
    ResourceRecord::new(Kind::from(kind), Uid::from(uid), ResourceVersion::from(resource_version), raw)
}
