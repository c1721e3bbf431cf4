use std::convert::Infallible;
use std::sync::Arc;

use kmirror_core::prelude::*;
use kmirror_core::KindRegistry;
use kmirror_store::{snapshot_cell, MirrorHandle, Snapshot, Store};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::MirrorConfig;
use crate::round::{Notifier, RoundEnd, SynchronizationRound};

/// Locally cached mirror of the registered resource collections.
///
/// Register watches first, then call [`ClusterMirror::run`]. The callback is
/// invoked on the coordinating task each time the store reaches a consistent
/// state with changes since the previous call.
pub struct ClusterMirror {
    client: Arc<dyn ResourceClient>,
    config: MirrorConfig,
    registry: KindRegistry,
    watches: Vec<WatchSpec>,
    store: Store,
    notifier: Notifier,
    handle: MirrorHandle,
    started: bool,
    generation: u64,
}

impl ClusterMirror {
    pub fn new(client: Arc<dyn ResourceClient>, callback: impl FnMut(Snapshot) + Send + 'static) -> Self {
        Self::with_config(client, MirrorConfig::default(), callback)
    }

    pub fn with_config(
        client: Arc<dyn ResourceClient>,
        config: MirrorConfig,
        callback: impl FnMut(Snapshot) + Send + 'static,
    ) -> Self {
        let (cell, handle) = snapshot_cell();
        Self {
            client,
            config,
            registry: KindRegistry::new(),
            watches: Vec::new(),
            store: Store::new(),
            notifier: Notifier::new(Box::new(callback), cell),
            handle,
            started: false,
            generation: 0,
        }
    }

    /// Add a `(namespace, kind)` watch. Only valid before the first `run`.
    pub fn register_watch(
        &mut self,
        namespace: impl Into<Namespace>,
        descriptor: Arc<dyn KindDescriptor>,
    ) -> Result<(), ConfigError> {
        if self.started {
            return Err(ConfigError::AlreadyStarted);
        }
        let namespace = namespace.into();
        descriptor.validate(&namespace)?;
        let descriptor = self.registry.resolve(descriptor)?;
        info!(kind = %descriptor.kind(), ns = %namespace, "watch registered");
        self.watches.push(WatchSpec { namespace, descriptor });
        Ok(())
    }

    pub fn watches(&self) -> &[WatchSpec] { &self.watches }

    pub fn registry(&self) -> &KindRegistry { &self.registry }

    /// Reader handle for the most recently notified snapshot.
    pub fn handle(&self) -> MirrorHandle { self.handle.clone() }

    /// Detached view of the store as it is now, consistent or not.
    pub fn snapshot(&self) -> Snapshot { self.store.view() }

    /// Run rounds until `shutdown` is canceled. Never returns `Ok`: the result
    /// is `MirrorError::Canceled` on shutdown, or `MirrorError::Invariant` if a
    /// watch produced an event type outside ADDED/MODIFIED/DELETED.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<Infallible, MirrorError> {
        self.started = true;
        info!(watches = self.watches.len(), "mirror starting");
        loop {
            if shutdown.is_cancelled() {
                info!(rounds = self.generation, "mirror stopped");
                return Err(MirrorError::Canceled);
            }
            self.generation += 1;
            let round = SynchronizationRound {
                generation: self.generation,
                client: &self.client,
                watches: &self.watches,
                config: &self.config,
                store: &mut self.store,
                notifier: &mut self.notifier,
            };
            match round.run(&shutdown).await {
                RoundEnd::Restart => {}
                RoundEnd::Fatal(e) => {
                    error!(generation = self.generation, error = %e, "mirror aborted");
                    return Err(e);
                }
            }
        }
    }
}
