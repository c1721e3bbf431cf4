//! kmirror kubehub: discovery, kind descriptors and a `ResourceClient` backed by kube.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use kube::{
    core::{ApiResource, GroupVersionKind},
    discovery::{ApiCapabilities, Discovery, Scope},
    Client,
};

mod client;
mod kinds;

pub use client::KubeClient;
pub use kinds::{DynamicKind, ScopeInfo, TypedKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    fn from_discovery(ar: &ApiResource, caps: &ApiCapabilities) -> Self {
        Self {
            group: ar.group.clone(),
            version: ar.version.clone(),
            kind: ar.kind.clone(),
            plural: ar.plural.clone(),
            namespaced: is_namespaced(caps),
        }
    }

    pub fn gvk_key(&self) -> String { gvk_key(&self.group, &self.version, &self.kind) }
}

fn is_namespaced(caps: &ApiCapabilities) -> bool { matches!(caps.scope, Scope::Namespaced) }

/// `v1/Kind` for the core group, `group/version/Kind` otherwise.
pub fn gvk_key(group: &str, version: &str, kind: &str) -> String {
    if group.is_empty() {
        format!("{}/{}", version, kind)
    } else {
        format!("{}/{}/{}", group, version, kind)
    }
}

/// Every resource the server recommends, ordered by group, version and kind.
pub async fn discover(client: Client) -> Result<Vec<DiscoveredResource>> {
    let discovery = Discovery::new(client).run().await.context("running API discovery")?;
    let mut out: Vec<_> = discovery
        .groups()
        .flat_map(|group| group.recommended_resources())
        .map(|(ar, caps)| DiscoveredResource::from_discovery(&ar, &caps))
        .collect();
    out.sort_by(|a, b| (&a.group, &a.version, &a.kind).cmp(&(&b.group, &b.version, &b.kind)));
    debug!(count = out.len(), "discovered resources");
    Ok(out)
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Resolve one gvk, querying only the group it belongs to.
async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let key = gvk_key(&gvk.group, &gvk.version, &gvk.kind);
    let discovery = Discovery::new(client)
        .filter(&[gvk.group.as_str()])
        .run()
        .await
        .with_context(|| format!("discovering {key}"))?;
    discovery
        .resolve_gvk(gvk)
        .map(|(ar, caps)| (ar, is_namespaced(&caps)))
        .ok_or_else(|| anyhow!("{key} is not served by the cluster"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_keys_parse_both_forms() {
        let core = parse_gvk_key("v1/ConfigMap").unwrap();
        assert_eq!((core.group.as_str(), core.version.as_str(), core.kind.as_str()), ("", "v1", "ConfigMap"));
        let grouped = parse_gvk_key("cert-manager.io/v1/Certificate").unwrap();
        assert_eq!(grouped.group, "cert-manager.io");
        assert_eq!(gvk_key(&grouped.group, &grouped.version, &grouped.kind), "cert-manager.io/v1/Certificate");
    }

    #[test]
    fn discovered_resources_keep_coordinates_and_scope() {
        let gvk = GroupVersionKind::gvk("apps", "v1", "Deployment");
        let ar = ApiResource::from_gvk_with_plural(&gvk, "deployments");
        let caps = ApiCapabilities { scope: Scope::Namespaced, subresources: Vec::new(), operations: Vec::new() };
        let found = DiscoveredResource::from_discovery(&ar, &caps);
        assert_eq!(found.gvk_key(), "apps/v1/Deployment");
        assert_eq!(found.plural, "deployments");
        assert!(found.namespaced);

        let nodes = ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("", "v1", "Node"), "nodes");
        let cluster = ApiCapabilities { scope: Scope::Cluster, ..caps };
        let found = DiscoveredResource::from_discovery(&nodes, &cluster);
        assert_eq!(found.gvk_key(), "v1/Node");
        assert!(!found.namespaced);
    }

    #[test]
    fn malformed_gvk_keys_are_rejected() {
        for key in ["", "Pod", "v1/", "/v1/Pod", "a/b/c/d"] {
            assert!(parse_gvk_key(key).is_err(), "{key:?} should not parse");
        }
    }
}
