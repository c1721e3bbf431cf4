//! Kind descriptors for kube resources: dynamic (discovered or spelled out)
//! and typed (any k8s-openapi resource).

use std::fmt;
use std::marker::PhantomData;

use anyhow::Result;
use kmirror_core::{DecodeError, Kind, KindDescriptor, ResourceRecord};
use kube::core::ApiResource;
use kube::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{find_api_resource, gvk_key, parse_gvk_key};

/// Descriptor for a resource known only by its coordinates. Payloads are kept
/// as opaque JSON.
#[derive(Debug, Clone)]
pub struct DynamicKind {
    key: Kind,
    resource: ApiResource,
    namespaced: bool,
}

impl DynamicKind {
    pub fn new(resource: ApiResource, namespaced: bool) -> Self {
        let key = Kind::from(gvk_key(&resource.group, &resource.version, &resource.kind));
        Self { key, resource, namespaced }
    }

    /// Build from a gvk key and plural without asking the server.
    pub fn from_gvk_key(key: &str, plural: &str, namespaced: bool) -> Result<Self> {
        let gvk = parse_gvk_key(key)?;
        Ok(Self::new(ApiResource::from_gvk_with_plural(&gvk, plural), namespaced))
    }

    /// Resolve a gvk key (e.g. `apps/v1/Deployment`) through discovery.
    pub async fn discover(client: Client, key: &str) -> Result<Self> {
        let gvk = parse_gvk_key(key)?;
        let (resource, namespaced) = find_api_resource(client, &gvk).await?;
        Ok(Self::new(resource, namespaced))
    }

    pub fn api_resource(&self) -> &ApiResource { &self.resource }
}

impl KindDescriptor for DynamicKind {
    fn kind(&self) -> Kind { self.key.clone() }
    fn type_name(&self) -> &str { &self.resource.kind }
    fn api_version(&self) -> &str { &self.resource.api_version }
    fn plural(&self) -> &str { &self.resource.plural }
    fn namespaced(&self) -> bool { self.namespaced }
}

/// Scope of a typed resource, read from its k8s-openapi scope marker.
pub trait ScopeInfo {
    const NAMESPACED: bool;
}

impl ScopeInfo for k8s_openapi::NamespaceResourceScope {
    const NAMESPACED: bool = true;
}

impl ScopeInfo for k8s_openapi::ClusterResourceScope {
    const NAMESPACED: bool = false;
}

/// Descriptor for a statically typed resource such as `Pod` or `Node`.
/// Every decoded item must deserialize as `K`; the stored payload stays JSON.
pub struct TypedKind<K> {
    key: Kind,
    type_name: String,
    api_version: String,
    plural: String,
    _marker: PhantomData<fn() -> K>,
}

impl<K> TypedKind<K>
where
    K: kube::Resource<DynamicType = ()> + DeserializeOwned + 'static,
    K::Scope: ScopeInfo,
{
    pub fn new() -> Self {
        let group = K::group(&());
        let version = K::version(&());
        let type_name = K::kind(&()).into_owned();
        Self {
            key: Kind::from(gvk_key(&group, &version, &type_name)),
            api_version: K::api_version(&()).into_owned(),
            plural: K::plural(&()).into_owned(),
            type_name,
            _marker: PhantomData,
        }
    }
}

impl<K> Default for TypedKind<K>
where
    K: kube::Resource<DynamicType = ()> + DeserializeOwned + 'static,
    K::Scope: ScopeInfo,
{
    fn default() -> Self { Self::new() }
}

impl<K> fmt::Debug for TypedKind<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedKind").field("kind", &self.key).field("plural", &self.plural).finish()
    }
}

impl<K> KindDescriptor for TypedKind<K>
where
    K: kube::Resource<DynamicType = ()> + DeserializeOwned + 'static,
    K::Scope: ScopeInfo,
{
    fn kind(&self) -> Kind { self.key.clone() }
    fn type_name(&self) -> &str { &self.type_name }
    fn api_version(&self) -> &str { &self.api_version }
    fn plural(&self) -> &str { &self.plural }
    fn namespaced(&self) -> bool { <K::Scope as ScopeInfo>::NAMESPACED }

    fn decode_item(&self, raw: Value) -> Result<ResourceRecord, DecodeError> {
        K::deserialize(&raw).map_err(|e| DecodeError::Invalid { kind: self.kind(), message: e.to_string() })?;
        ResourceRecord::from_value(self.kind(), raw)
    }
}
