//! One registration's list-then-watch loop.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kmirror_core::prelude::*;
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionExit {
    /// The watch horizon was lost; the data for this kind needs a full relist.
    Expired,
    Canceled,
}

pub(crate) struct WatchSession {
    spec: WatchSpec,
    client: Arc<dyn ResourceClient>,
    cancel: CancellationToken,
    retry_delay: Duration,
}

impl WatchSession {
    pub(crate) fn new(
        spec: WatchSpec,
        client: Arc<dyn ResourceClient>,
        cancel: CancellationToken,
        retry_delay: Duration,
    ) -> Self {
        Self { spec, client, cancel, retry_delay }
    }

    /// Emit one listing on `listings`, then every watch event on `events`,
    /// until the watch expires or the session is canceled.
    pub(crate) async fn run(self, listings: mpsc::Sender<Listing>, events: mpsc::Sender<WatchEvent>) -> SessionExit {
        let Some(listing) = self.list().await else { return SessionExit::Canceled };
        let mut cursor = listing.resource_version.clone();
        if !self.emit(&listings, listing).await {
            return SessionExit::Canceled;
        }
        drop(listings);
        self.stream(&mut cursor, &events).await
    }

    async fn list(&self) -> Option<Listing> {
        let kind = self.spec.kind();
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            let res = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                res = self.client.list(&self.spec.descriptor, &self.spec.namespace) => res,
            };
            match res {
                Ok(listing) => {
                    debug!(kind = %kind, ns = %self.spec.namespace, count = listing.items.len(), rv = %listing.resource_version, "listed");
                    return Some(listing);
                }
                Err(ClientError::Canceled) => return None,
                Err(e) => {
                    warn!(kind = %kind, ns = %self.spec.namespace, error = %e, "list failed; retrying");
                    counter!("mirror_list_errors_total", 1u64, "kind" => kind.to_string());
                }
            }
            if !self.pause().await {
                return None;
            }
        }
    }

    async fn stream(&self, cursor: &mut ResourceVersion, events: &mpsc::Sender<WatchEvent>) -> SessionExit {
        let kind = self.spec.kind();
        loop {
            if self.cancel.is_cancelled() {
                return SessionExit::Canceled;
            }
            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SessionExit::Canceled,
                res = self.client.watch(&self.spec.descriptor, &self.spec.namespace, cursor) => res,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(ClientError::Expired(reason)) => {
                    info!(kind = %kind, ns = %self.spec.namespace, rv = %cursor, reason = %reason, "watch expired on open");
                    counter!("mirror_expired_total", 1u64, "kind" => kind.to_string());
                    return SessionExit::Expired;
                }
                Err(ClientError::Canceled) => return SessionExit::Canceled,
                Err(e) => {
                    warn!(kind = %kind, ns = %self.spec.namespace, error = %e, "watch open failed; retrying");
                    counter!("mirror_watch_errors_total", 1u64, "kind" => kind.to_string());
                    if !self.pause().await {
                        return SessionExit::Canceled;
                    }
                    continue;
                }
            };
            debug!(kind = %kind, ns = %self.spec.namespace, rv = %cursor, "watch open");
            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return SessionExit::Canceled,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(WatchFrame::Event(event))) => {
                        trace!(kind = %kind, event = %event.kind, uid = %event.record.uid, rv = %event.record.resource_version, "event");
                        *cursor = event.record.resource_version.clone();
                        if !self.emit(events, event).await {
                            return SessionExit::Canceled;
                        }
                    }
                    Some(Ok(WatchFrame::Bookmark(rv))) => {
                        trace!(kind = %kind, rv = %rv, "bookmark");
                        *cursor = rv;
                    }
                    Some(Err(ClientError::Expired(reason))) => {
                        info!(kind = %kind, ns = %self.spec.namespace, rv = %cursor, reason = %reason, "watch expired");
                        counter!("mirror_expired_total", 1u64, "kind" => kind.to_string());
                        return SessionExit::Expired;
                    }
                    Some(Err(ClientError::Canceled)) => return SessionExit::Canceled,
                    Some(Err(e)) => {
                        warn!(kind = %kind, ns = %self.spec.namespace, error = %e, "watch read failed; reopening");
                        counter!("mirror_watch_errors_total", 1u64, "kind" => kind.to_string());
                        break;
                    }
                    None => {
                        debug!(kind = %kind, ns = %self.spec.namespace, rv = %cursor, "watch closed by server; reopening");
                        break;
                    }
                }
            }
            drop(stream);
            if !self.pause().await {
                return SessionExit::Canceled;
            }
        }
    }

    /// Send unless canceled first. False means stop: canceled or the coordinator is gone.
    async fn emit<T>(&self, tx: &mpsc::Sender<T>, value: T) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            res = tx.send(value) => res.is_ok(),
        }
    }

    /// Wait before the next attempt. False if canceled meanwhile.
    async fn pause(&self) -> bool {
        if self.retry_delay.is_zero() {
            tokio::task::yield_now().await;
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.retry_delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{record, MockClient};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn pod_spec() -> WatchSpec {
        WatchSpec { namespace: Namespace::from("default"), descriptor: Arc::new(StaticKind::namespaced("Pod", "v1", "pods")) }
    }

    struct Harness {
        listings: mpsc::Receiver<Listing>,
        events: mpsc::Receiver<WatchEvent>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<SessionExit>,
    }

    fn start(client: Arc<MockClient>) -> Harness {
        let (list_tx, listings) = mpsc::channel(8);
        let (event_tx, events) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let session = WatchSession::new(pod_spec(), client, cancel.clone(), Duration::ZERO);
        let task = tokio::spawn(session.run(list_tx, event_tx));
        Harness { listings, events, cancel, task }
    }

    async fn wait_for_watch_calls(client: &MockClient, n: usize) {
        timeout(WAIT, async {
            while client.watch_calls().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("watch was not reopened");
    }

    #[tokio::test]
    async fn retries_list_until_success() {
        let client = Arc::new(MockClient::new());
        client.fail_list("Pod", "connection refused");
        client.fail_list("Pod", "connection refused");
        client.push_list("Pod", "10", vec![record("Pod", "p1", "3")]);
        let mut h = start(Arc::clone(&client));

        let listing = timeout(WAIT, h.listings.recv()).await.unwrap().unwrap();
        assert_eq!(listing.items.len(), 1);
        assert_eq!(listing.resource_version.as_str(), "10");
        assert_eq!(client.list_calls("Pod"), 3);

        h.cancel.cancel();
        assert_eq!(timeout(WAIT, h.task).await.unwrap().unwrap(), SessionExit::Canceled);
    }

    #[tokio::test]
    async fn watch_starts_from_listing_version_and_forwards_events() {
        let client = Arc::new(MockClient::new());
        client.push_list("Pod", "10", vec![]);
        let feed = client.watch_feed("Pod");
        let mut h = start(Arc::clone(&client));

        timeout(WAIT, h.listings.recv()).await.unwrap().unwrap();
        feed.added(record("Pod", "p1", "11"));
        let event = timeout(WAIT, h.events.recv()).await.unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Added);
        assert_eq!(event.record.uid.as_str(), "p1");
        assert_eq!(client.watch_calls(), vec![(Kind::from("Pod"), ResourceVersion::from("10"))]);

        h.cancel.cancel();
        assert_eq!(timeout(WAIT, h.task).await.unwrap().unwrap(), SessionExit::Canceled);
    }

    #[tokio::test]
    async fn reopens_from_last_seen_version_after_stream_ends() {
        let client = Arc::new(MockClient::new());
        client.push_list("Pod", "10", vec![]);
        let feed = client.watch_feed("Pod");
        let mut h = start(Arc::clone(&client));

        timeout(WAIT, h.listings.recv()).await.unwrap().unwrap();
        feed.modified(record("Pod", "p1", "12"));
        timeout(WAIT, h.events.recv()).await.unwrap().unwrap();
        drop(feed);

        wait_for_watch_calls(&client, 2).await;
        assert_eq!(client.watch_calls()[1], (Kind::from("Pod"), ResourceVersion::from("12")));
        h.cancel.cancel();
        assert_eq!(timeout(WAIT, h.task).await.unwrap().unwrap(), SessionExit::Canceled);
    }

    #[tokio::test]
    async fn bookmark_moves_cursor_without_emitting() {
        let client = Arc::new(MockClient::new());
        client.push_list("Pod", "10", vec![]);
        let feed = client.watch_feed("Pod");
        let mut h = start(Arc::clone(&client));

        timeout(WAIT, h.listings.recv()).await.unwrap().unwrap();
        feed.modified(record("Pod", "p1", "12"));
        feed.bookmark("40");
        timeout(WAIT, h.events.recv()).await.unwrap().unwrap();
        drop(feed);

        wait_for_watch_calls(&client, 2).await;
        assert_eq!(client.watch_calls()[1], (Kind::from("Pod"), ResourceVersion::from("40")));
        assert!(h.events.try_recv().is_err());
        h.cancel.cancel();
        assert_eq!(timeout(WAIT, h.task).await.unwrap().unwrap(), SessionExit::Canceled);
    }

    #[tokio::test]
    async fn transient_open_and_read_failures_reopen() {
        let client = Arc::new(MockClient::new());
        client.push_list("Pod", "10", vec![]);
        client.fail_watch("Pod", "connection reset");
        let feed = client.watch_feed("Pod");
        let h = start(Arc::clone(&client));

        wait_for_watch_calls(&client, 2).await;
        feed.fail("unexpected EOF");
        wait_for_watch_calls(&client, 3).await;
        assert!(!h.task.is_finished());
        h.cancel.cancel();
        assert_eq!(timeout(WAIT, h.task).await.unwrap().unwrap(), SessionExit::Canceled);
    }

    #[tokio::test]
    async fn expiry_on_open_ends_session() {
        let client = Arc::new(MockClient::new());
        client.push_list("Pod", "10", vec![]);
        client.expire_watch("Pod");
        let h = start(Arc::clone(&client));
        assert_eq!(timeout(WAIT, h.task).await.unwrap().unwrap(), SessionExit::Expired);
    }

    #[tokio::test]
    async fn expiry_on_stream_ends_session() {
        let client = Arc::new(MockClient::new());
        client.push_list("Pod", "10", vec![]);
        let feed = client.watch_feed("Pod");
        let h = start(Arc::clone(&client));
        feed.expire();
        assert_eq!(timeout(WAIT, h.task).await.unwrap().unwrap(), SessionExit::Expired);
        assert_eq!(client.watch_calls().len(), 1);
    }

    #[tokio::test]
    async fn cancel_while_listing_emits_nothing() {
        let client = Arc::new(MockClient::new());
        let _gate = client.gate_lists("Pod");
        let mut h = start(Arc::clone(&client));
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.cancel.cancel();
        assert_eq!(timeout(WAIT, h.task).await.unwrap().unwrap(), SessionExit::Canceled);
        assert!(h.listings.try_recv().is_err());
        assert_eq!(client.list_calls("Pod"), 0);
    }
}
