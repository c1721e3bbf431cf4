//! kmirror core types: identifiers, records, kind descriptors and the client contract.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod client;
pub mod descriptor;
pub mod error;
pub mod record;

pub use client::{ClientError, EventStream, ResourceClient, WatchFrame};
pub use descriptor::{KindDescriptor, KindRegistry, StaticKind};
pub use error::{ConfigError, DecodeError, MirrorError};
pub use record::{EventKind, Listing, ResourceRecord, WatchEvent};

pub mod prelude {
    pub use super::{
        ClientError, ConfigError, EventKind, EventStream, Kind, KindDescriptor, Listing, MirrorError, Namespace,
        ResourceClient, ResourceRecord, ResourceVersion, StaticKind, Uid, WatchEvent, WatchFrame, WatchSpec,
    };
}

macro_rules! shared_str {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn new(s: impl AsRef<str>) -> Self { Self(Arc::from(s.as_ref())) }
            pub fn as_str(&self) -> &str { &self.0 }
            pub fn is_empty(&self) -> bool { self.0.is_empty() }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{:?}", &*self.0) }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self { Self::new(s) }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self { Self(Arc::from(s)) }
        }
    };
}

shared_str!(
    /// Stable identifier of a watched resource type, e.g. `Pod` or `apps/v1/Deployment`.
    Kind
);

shared_str!(
    /// Identifier of one object, unique within its kind.
    Uid
);

impl PartialOrd for Uid {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}

impl Ord for Uid {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering { self.0.cmp(&other.0) }
}

shared_str!(
    /// Server-assigned version token. Only equality is meaningful; there is no ordering.
    ResourceVersion
);

/// Namespace scope of a registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Namespace {
    /// Every namespace (and the only valid choice for cluster-scoped kinds).
    All,
    Named(String),
}

impl Namespace {
    pub fn name(&self) -> Option<&str> {
        match self {
            Namespace::All => None,
            Namespace::Named(ns) => Some(ns),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::All => f.write_str("(all)"),
            Namespace::Named(ns) => f.write_str(ns),
        }
    }
}

impl From<&str> for Namespace {
    fn from(s: &str) -> Self {
        if s.is_empty() { Namespace::All } else { Namespace::Named(s.to_string()) }
    }
}

impl From<Option<&str>> for Namespace {
    fn from(s: Option<&str>) -> Self { s.map(Namespace::from).unwrap_or(Namespace::All) }
}

/// One registered `(namespace, kind)` pair. Immutable once the mirror runs.
#[derive(Debug, Clone)]
pub struct WatchSpec {
    pub namespace: Namespace,
    pub descriptor: Arc<dyn KindDescriptor>,
}

impl WatchSpec {
    pub fn kind(&self) -> Kind { self.descriptor.kind() }
}

impl fmt::Display for WatchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (namespace={})", self.descriptor.kind(), self.namespace)
    }
}
