//! Error taxonomy visible to callers of the mirror.

use crate::{Kind, Namespace};

/// Malformed or late registration. Only ever returned from registration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("watches cannot be registered after the mirror has started")]
    AlreadyStarted,
    #[error("invalid descriptor for {kind}: {reason}")]
    InvalidDescriptor { kind: Kind, reason: String },
    #[error("conflicting descriptor registered for kind {kind}")]
    ConflictingDescriptor { kind: Kind },
    #[error("kind {kind} is cluster-scoped and cannot be watched in namespace {namespace}")]
    ScopeMismatch { kind: Kind, namespace: Namespace },
}

/// Failure to turn a wire object into a record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("{kind}: missing {field}")]
    MissingField { kind: Kind, field: &'static str },
    #[error("{kind}: {message}")]
    Invalid { kind: Kind, message: String },
}

/// Why `ClusterMirror::run` stopped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MirrorError {
    #[error("mirror canceled")]
    Canceled,
    /// A watch stream produced an event type outside ADDED/MODIFIED/DELETED.
    #[error("invariant violation: unexpected watch event type {event_type:?} for kind {kind}")]
    Invariant { kind: Kind, event_type: String },
}
