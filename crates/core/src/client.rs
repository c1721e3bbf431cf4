//! Contract for the transport that performs list and watch calls.

use std::sync::Arc;

use futures::stream::BoxStream;

use crate::descriptor::KindDescriptor;
use crate::record::{Listing, WatchEvent};
use crate::{Namespace, ResourceVersion};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The requested resourceVersion is older than the server still retains.
    #[error("resource version expired: {0}")]
    Expired(String),
    #[error("request canceled")]
    Canceled,
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

impl ClientError {
    pub fn is_expired(&self) -> bool { matches!(self, ClientError::Expired(_)) }
}

impl From<crate::error::DecodeError> for ClientError {
    fn from(e: crate::error::DecodeError) -> Self { ClientError::Transient(e.into()) }
}

/// One item read from an open watch.
#[derive(Debug, Clone)]
pub enum WatchFrame {
    Event(WatchEvent),
    /// Progress marker: the server has sent everything up to this version.
    /// Carries no object change; only the resume cursor moves.
    Bookmark(ResourceVersion),
}

impl From<WatchEvent> for WatchFrame {
    fn from(event: WatchEvent) -> Self { WatchFrame::Event(event) }
}

/// Incremental frames of one open watch. Dropping the stream closes it.
pub type EventStream = BoxStream<'static, Result<WatchFrame, ClientError>>;

/// List/watch transport. Implementations decode wire objects through the
/// descriptor they are handed.
#[async_trait::async_trait]
pub trait ResourceClient: Send + Sync + 'static {
    async fn list(&self, descriptor: &Arc<dyn KindDescriptor>, namespace: &Namespace) -> Result<Listing, ClientError>;

    async fn watch(
        &self,
        descriptor: &Arc<dyn KindDescriptor>,
        namespace: &Namespace,
        from: &ResourceVersion,
    ) -> Result<EventStream, ClientError>;
}
