//! Records, listings and watch events as the engine sees them.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::descriptor::KindDescriptor;
use crate::error::DecodeError;
use crate::{Kind, ResourceVersion, Uid};

/// A single object of some kind. The payload is frozen: updates replace the
/// whole record.
#[derive(Clone, PartialEq)]
pub struct ResourceRecord {
    pub kind: Kind,
    pub uid: Uid,
    pub resource_version: ResourceVersion,
    pub payload: Arc<serde_json::Value>,
}

impl ResourceRecord {
    pub fn new(kind: Kind, uid: Uid, resource_version: ResourceVersion, payload: serde_json::Value) -> Self {
        Self { kind, uid, resource_version, payload: Arc::new(payload) }
    }

    /// Build a record from a wire object, reading `metadata.uid` and
    /// `metadata.resourceVersion`.
    pub fn from_value(kind: Kind, raw: serde_json::Value) -> Result<Self, DecodeError> {
        let meta = raw.get("metadata").ok_or_else(|| DecodeError::MissingField { kind: kind.clone(), field: "metadata" })?;
        let uid = meta
            .get("uid")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(Uid::from)
            .ok_or_else(|| DecodeError::MissingField { kind: kind.clone(), field: "metadata.uid" })?;
        let resource_version = meta
            .get("resourceVersion")
            .and_then(|v| v.as_str())
            .map(ResourceVersion::from)
            .ok_or_else(|| DecodeError::MissingField { kind: kind.clone(), field: "metadata.resourceVersion" })?;
        #[cfg(feature = "strip-managed-fields")]
        let raw = {
            let mut raw = raw;
            strip_managed_fields(&mut raw);
            raw
        };
        Ok(Self::new(kind, uid, resource_version, raw))
    }

    /// Object name from `metadata.name`, if present.
    pub fn name(&self) -> Option<&str> {
        self.payload.get("metadata")?.get("name")?.as_str()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.payload.get("metadata")?.get("namespace")?.as_str()
    }

    /// Deserialize the payload into a typed object.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&*self.payload)
    }
}

impl fmt::Debug for ResourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRecord")
            .field("kind", &self.kind)
            .field("uid", &self.uid)
            .field("resource_version", &self.resource_version)
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(feature = "strip-managed-fields")]
fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Result of a successful list call: the items plus the collection version
/// the follow-up watch resumes from.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub items: Vec<ResourceRecord>,
    pub resource_version: ResourceVersion,
}

impl Default for ResourceVersion {
    fn default() -> Self { ResourceVersion::from("") }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
    /// Anything the wire carried that is not one of the three above.
    Other(String),
}

impl EventKind {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "ADDED" => EventKind::Added,
            "MODIFIED" => EventKind::Modified,
            "DELETED" => EventKind::Deleted,
            other => EventKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Added => f.write_str("ADDED"),
            EventKind::Modified => f.write_str("MODIFIED"),
            EventKind::Deleted => f.write_str("DELETED"),
            EventKind::Other(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub record: ResourceRecord,
}

impl WatchEvent {
    pub fn added(record: ResourceRecord) -> Self { Self { kind: EventKind::Added, record } }
    pub fn modified(record: ResourceRecord) -> Self { Self { kind: EventKind::Modified, record } }
    pub fn deleted(record: ResourceRecord) -> Self { Self { kind: EventKind::Deleted, record } }

    /// Decode a `{"type": ..., "object": {...}}` watch frame.
    pub fn from_wire(descriptor: &dyn KindDescriptor, mut frame: serde_json::Value) -> Result<Self, DecodeError> {
        let event_type = frame
            .get("type")
            .and_then(|v| v.as_str())
            .map(EventKind::from_wire)
            .ok_or_else(|| DecodeError::MissingField { kind: descriptor.kind(), field: "type" })?;
        let object = frame
            .get_mut("object")
            .map(serde_json::Value::take)
            .ok_or_else(|| DecodeError::MissingField { kind: descriptor.kind(), field: "object" })?;
        let record = descriptor.decode_item(object)?;
        Ok(Self { kind: event_type, record })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_value_reads_metadata_and_strips_managed_fields() {
        let raw = json!({
            "metadata": {
                "name": "web",
                "namespace": "default",
                "uid": "u-1",
                "resourceVersion": "42",
                "managedFields": [{"manager": "kubectl"}]
            },
            "spec": {}
        });
        let rec = ResourceRecord::from_value(Kind::from("Pod"), raw).unwrap();
        assert_eq!(rec.uid.as_str(), "u-1");
        assert_eq!(rec.resource_version.as_str(), "42");
        assert_eq!(rec.name(), Some("web"));
        assert_eq!(rec.namespace(), Some("default"));
        #[cfg(feature = "strip-managed-fields")]
        assert!(rec.payload["metadata"].get("managedFields").is_none());
    }

    #[test]
    fn from_value_requires_uid_and_version() {
        let no_uid = json!({"metadata": {"resourceVersion": "1"}});
        let err = ResourceRecord::from_value(Kind::from("Pod"), no_uid).unwrap_err();
        assert!(matches!(err, DecodeError::MissingField { field: "metadata.uid", .. }));

        let no_rv = json!({"metadata": {"uid": "x"}});
        let err = ResourceRecord::from_value(Kind::from("Pod"), no_rv).unwrap_err();
        assert!(matches!(err, DecodeError::MissingField { field: "metadata.resourceVersion", .. }));
    }

    #[test]
    fn watch_frames_decode_through_the_descriptor() {
        let pods = crate::StaticKind::namespaced("Pod", "v1", "pods");
        let object = json!({"metadata": {"name": "web", "uid": "u-1", "resourceVersion": "8"}});

        let added = WatchEvent::from_wire(&pods, json!({"type": "ADDED", "object": object.clone()})).unwrap();
        assert_eq!(added.kind, EventKind::Added);
        assert_eq!(added.record.kind.as_str(), "Pod");
        assert_eq!(added.record.uid.as_str(), "u-1");
        assert_eq!(added.record.resource_version.as_str(), "8");

        let odd = WatchEvent::from_wire(&pods, json!({"type": "ERROR", "object": object.clone()})).unwrap();
        assert_eq!(odd.kind, EventKind::Other("ERROR".into()));

        let err = WatchEvent::from_wire(&pods, json!({"object": object})).unwrap_err();
        assert!(matches!(err, DecodeError::MissingField { field: "type", .. }));
        let err = WatchEvent::from_wire(&pods, json!({"type": "MODIFIED"})).unwrap_err();
        assert!(matches!(err, DecodeError::MissingField { field: "object", .. }));
        let err = WatchEvent::from_wire(&pods, json!({"type": "DELETED", "object": {"metadata": {"uid": "u-1"}}})).unwrap_err();
        assert!(matches!(err, DecodeError::MissingField { field: "metadata.resourceVersion", .. }));
    }

    #[test]
    fn event_kind_parses_wire_names() {
        assert_eq!(EventKind::from_wire("ADDED"), EventKind::Added);
        assert_eq!(EventKind::from_wire("DELETED"), EventKind::Deleted);
        assert_eq!(EventKind::from_wire("BOOKMARK"), EventKind::Other("BOOKMARK".into()));
        assert_eq!(EventKind::Other("ERROR".into()).to_string(), "ERROR");
    }
}
