//! Kind descriptors: how a resource type is listed, decoded and validated.
//!
//! Each watched kind is described by one canonical `KindDescriptor`. The
//! `KindRegistry` holds that table and is resolved once, at registration time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::{ConfigError, DecodeError};
use crate::record::{Listing, ResourceRecord};
use crate::{Kind, Namespace, ResourceVersion};

pub trait KindDescriptor: fmt::Debug + Send + Sync + 'static {
    /// Registry key. Defaults to the wire type name.
    fn kind(&self) -> Kind { Kind::from(self.type_name()) }

    /// Value of the wire `kind` field, e.g. `Pod`.
    fn type_name(&self) -> &str;

    /// `v1` or `group/version`.
    fn api_version(&self) -> &str;

    /// Lower-case plural resource name used in request paths, e.g. `pods`.
    fn plural(&self) -> &str;

    fn namespaced(&self) -> bool;

    /// Turn one wire object into a record of this kind.
    fn decode_item(&self, raw: Value) -> Result<ResourceRecord, DecodeError> {
        ResourceRecord::from_value(self.kind(), raw)
    }

    /// An empty `<Kind>List` body.
    fn empty_list(&self) -> Value {
        json!({
            "apiVersion": self.api_version(),
            "kind": format!("{}List", self.type_name()),
            "metadata": { "resourceVersion": "" },
            "items": [],
        })
    }

    /// Decode a list body: extract `items` and the collection resourceVersion.
    fn decode_list(&self, mut list: Value) -> Result<Listing, DecodeError> {
        let resource_version = list
            .get("metadata")
            .and_then(|m| m.get("resourceVersion"))
            .and_then(|v| v.as_str())
            .map(ResourceVersion::from)
            .unwrap_or_default();
        let items = match list.get_mut("items").map(Value::take) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) => Vec::new(),
            Some(_) => {
                return Err(DecodeError::Invalid { kind: self.kind(), message: "items is not an array".into() })
            }
            None => return Err(DecodeError::MissingField { kind: self.kind(), field: "items" }),
        };
        let items = items.into_iter().map(|raw| self.decode_item(raw)).collect::<Result<Vec<_>, _>>()?;
        Ok(Listing { items, resource_version })
    }

    /// Check the descriptor is usable for a watch in `namespace`.
    fn validate(&self, namespace: &Namespace) -> Result<(), ConfigError> {
        let kind = self.kind();
        let invalid = |reason: String| ConfigError::InvalidDescriptor { kind: kind.clone(), reason };
        if kind.is_empty() || self.type_name().is_empty() {
            return Err(invalid("empty kind".into()));
        }
        if self.api_version().is_empty() {
            return Err(invalid("empty apiVersion".into()));
        }
        if self.plural().is_empty() {
            return Err(invalid("empty plural resource name".into()));
        }
        self.decode_list(self.empty_list())
            .map_err(|e| invalid(format!("cannot decode an empty listing: {e}")))?;
        if !self.namespaced() && *namespace != Namespace::All {
            return Err(ConfigError::ScopeMismatch { kind, namespace: namespace.clone() });
        }
        Ok(())
    }
}

/// Plain descriptor with fixed coordinates and default decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticKind {
    pub type_name: String,
    pub api_version: String,
    pub plural: String,
    pub namespaced: bool,
}

impl StaticKind {
    pub fn namespaced(type_name: &str, api_version: &str, plural: &str) -> Self {
        Self { type_name: type_name.into(), api_version: api_version.into(), plural: plural.into(), namespaced: true }
    }

    pub fn cluster(type_name: &str, api_version: &str, plural: &str) -> Self {
        Self { namespaced: false, ..Self::namespaced(type_name, api_version, plural) }
    }
}

impl KindDescriptor for StaticKind {
    fn type_name(&self) -> &str { &self.type_name }
    fn api_version(&self) -> &str { &self.api_version }
    fn plural(&self) -> &str { &self.plural }
    fn namespaced(&self) -> bool { self.namespaced }
}

fn same_shape(a: &dyn KindDescriptor, b: &dyn KindDescriptor) -> bool {
    a.type_name() == b.type_name()
        && a.api_version() == b.api_version()
        && a.plural() == b.plural()
        && a.namespaced() == b.namespaced()
}

/// Table of canonical descriptors, one per kind.
#[derive(Debug, Default, Clone)]
pub struct KindRegistry {
    by_kind: HashMap<Kind, Arc<dyn KindDescriptor>>,
}

impl KindRegistry {
    pub fn new() -> Self { Self::default() }

    /// Return the canonical descriptor for `descriptor.kind()`, inserting it if
    /// the kind is new. A descriptor that disagrees with the canonical one is
    /// rejected.
    pub fn resolve(&mut self, descriptor: Arc<dyn KindDescriptor>) -> Result<Arc<dyn KindDescriptor>, ConfigError> {
        let kind = descriptor.kind();
        match self.by_kind.get(&kind) {
            Some(existing) if same_shape(existing.as_ref(), descriptor.as_ref()) => Ok(Arc::clone(existing)),
            Some(_) => Err(ConfigError::ConflictingDescriptor { kind }),
            None => {
                self.by_kind.insert(kind, Arc::clone(&descriptor));
                Ok(descriptor)
            }
        }
    }

    pub fn get(&self, kind: &Kind) -> Option<&Arc<dyn KindDescriptor>> { self.by_kind.get(kind) }

    pub fn kinds(&self) -> impl Iterator<Item = &Kind> { self.by_kind.keys() }

    pub fn len(&self) -> usize { self.by_kind.len() }

    pub fn is_empty(&self) -> bool { self.by_kind.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NoItems;

    impl KindDescriptor for NoItems {
        fn type_name(&self) -> &str { "Widget" }
        fn api_version(&self) -> &str { "example.com/v1" }
        fn plural(&self) -> &str { "widgets" }
        fn namespaced(&self) -> bool { true }
        fn empty_list(&self) -> Value { json!({ "metadata": {} }) }
    }

    #[test]
    fn decode_list_extracts_items_and_version() {
        let pods = StaticKind::namespaced("Pod", "v1", "pods");
        let body = json!({
            "metadata": { "resourceVersion": "100" },
            "items": [
                { "metadata": { "uid": "a", "resourceVersion": "7" } },
                { "metadata": { "uid": "b", "resourceVersion": "9" } }
            ]
        });
        let listing = pods.decode_list(body).unwrap();
        assert_eq!(listing.resource_version.as_str(), "100");
        let uids: Vec<_> = listing.items.iter().map(|r| r.uid.as_str()).collect();
        assert_eq!(uids, ["a", "b"]);
        assert!(listing.items.iter().all(|r| r.kind.as_str() == "Pod"));
    }

    #[test]
    fn validate_rejects_descriptor_without_item_list() {
        let err = NoItems.validate(&Namespace::All).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDescriptor { .. }), "{err:?}");
    }

    #[test]
    fn validate_rejects_namespaced_watch_of_cluster_kind() {
        let nodes = StaticKind::cluster("Node", "v1", "nodes");
        assert!(nodes.validate(&Namespace::All).is_ok());
        let err = nodes.validate(&Namespace::from("default")).unwrap_err();
        assert!(matches!(err, ConfigError::ScopeMismatch { .. }));
    }

    #[test]
    fn validate_rejects_empty_coordinates() {
        let blank = StaticKind::namespaced("Pod", "", "pods");
        assert!(matches!(blank.validate(&Namespace::All), Err(ConfigError::InvalidDescriptor { .. })));
    }

    #[test]
    fn registry_keeps_first_descriptor_canonical() {
        let mut reg = KindRegistry::new();
        let first: Arc<dyn KindDescriptor> = Arc::new(StaticKind::namespaced("Pod", "v1", "pods"));
        let second: Arc<dyn KindDescriptor> = Arc::new(StaticKind::namespaced("Pod", "v1", "pods"));
        let a = reg.resolve(Arc::clone(&first)).unwrap();
        let b = reg.resolve(second).unwrap();
        assert!(Arc::ptr_eq(&a, &first));
        assert!(Arc::ptr_eq(&b, &first));
        assert_eq!(reg.len(), 1);

        let conflicting: Arc<dyn KindDescriptor> = Arc::new(StaticKind::namespaced("Pod", "v2", "pods"));
        assert_eq!(
            reg.resolve(conflicting).unwrap_err(),
            ConfigError::ConflictingDescriptor { kind: Kind::from("Pod") }
        );
    }
}
