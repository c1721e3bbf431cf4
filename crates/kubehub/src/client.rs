//! `ResourceClient` over the Kubernetes API.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context};
use futures::StreamExt;
use kmirror_core::prelude::*;
use kube::{
    api::{Api, ListParams, WatchEvent as KubeEvent, WatchParams},
    core::{ApiResource, DynamicObject, ErrorResponse},
    Client,
};
use metrics::histogram;
use serde_json::Value;
use tracing::{debug, trace};

/// List/watch transport backed by a kube `Client`. Objects are fetched as
/// `DynamicObject` and decoded through the registration's descriptor.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Client for the current kubeconfig context or in-cluster config.
    pub async fn try_default() -> anyhow::Result<Self> { Ok(Self::new(Client::try_default().await?)) }

    pub fn client(&self) -> Client { self.client.clone() }

    fn api(&self, descriptor: &dyn KindDescriptor, namespace: &Namespace) -> Api<DynamicObject> {
        let ar = api_resource(descriptor);
        match namespace.name() {
            Some(ns) if descriptor.namespaced() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait::async_trait]
impl ResourceClient for KubeClient {
    async fn list(&self, descriptor: &Arc<dyn KindDescriptor>, namespace: &Namespace) -> Result<Listing, ClientError> {
        let kind = descriptor.kind();
        let started = Instant::now();
        let list = self.api(descriptor.as_ref(), namespace).list(&ListParams::default()).await.map_err(classify)?;
        histogram!("kube_list_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => kind.to_string());
        let resource_version = ResourceVersion::from(list.metadata.resource_version.unwrap_or_default());
        let items = list
            .items
            .iter()
            .map(|obj| record_from(descriptor.as_ref(), obj))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(kind = %kind, ns = %namespace, count = items.len(), rv = %resource_version, "kube list");
        Ok(Listing { items, resource_version })
    }

    async fn watch(
        &self,
        descriptor: &Arc<dyn KindDescriptor>,
        namespace: &Namespace,
        from: &ResourceVersion,
    ) -> Result<EventStream, ClientError> {
        let api = self.api(descriptor.as_ref(), namespace);
        let stream = api.watch(&WatchParams::default(), from.as_str()).await.map_err(classify)?;
        let descriptor = Arc::clone(descriptor);
        Ok(stream
            .filter_map(move |item| futures::future::ready(translate(descriptor.as_ref(), item)))
            .boxed())
    }
}

fn api_resource(descriptor: &dyn KindDescriptor) -> ApiResource {
    let api_version = descriptor.api_version();
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    };
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version: api_version.to_string(),
        kind: descriptor.type_name().to_string(),
        plural: descriptor.plural().to_string(),
    }
}

fn is_gone(resp: &ErrorResponse) -> bool { resp.code == 410 || resp.reason == "Expired" || resp.reason == "Gone" }

fn classify(err: kube::Error) -> ClientError {
    match err {
        kube::Error::Api(resp) if is_gone(&resp) => ClientError::Expired(resp.message),
        other => ClientError::Transient(anyhow::Error::new(other)),
    }
}

/// Map one frame of a kube watch. Bookmarks only advance the resume cursor;
/// ones without a version are dropped.
fn translate(
    descriptor: &dyn KindDescriptor,
    item: Result<KubeEvent<DynamicObject>, kube::Error>,
) -> Option<Result<WatchFrame, ClientError>> {
    let (kind, obj) = match item {
        Ok(KubeEvent::Added(obj)) => (EventKind::Added, obj),
        Ok(KubeEvent::Modified(obj)) => (EventKind::Modified, obj),
        Ok(KubeEvent::Deleted(obj)) => (EventKind::Deleted, obj),
        Ok(KubeEvent::Bookmark(bm)) => {
            trace!(kind = %descriptor.kind(), rv = %bm.metadata.resource_version, "bookmark");
            let rv = bm.metadata.resource_version;
            return (!rv.is_empty()).then(|| Ok(WatchFrame::Bookmark(ResourceVersion::from(rv))));
        }
        Ok(KubeEvent::Error(resp)) if is_gone(&resp) => return Some(Err(ClientError::Expired(resp.message))),
        Ok(KubeEvent::Error(resp)) => {
            return Some(Err(ClientError::Transient(anyhow!("watch error {}: {}", resp.code, resp.message))))
        }
        Err(e) => return Some(Err(classify(e))),
    };
    Some(record_from(descriptor, &obj).map(|record| WatchFrame::Event(WatchEvent { kind, record })))
}

/// List items come back without `apiVersion`/`kind`; fill them in so every
/// stored payload is self-describing.
fn record_from(descriptor: &dyn KindDescriptor, obj: &DynamicObject) -> Result<ResourceRecord, ClientError> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    if let Some(map) = raw.as_object_mut() {
        map.entry("apiVersion").or_insert_with(|| Value::from(descriptor.api_version()));
        map.entry("kind").or_insert_with(|| Value::from(descriptor.type_name()));
    }
    Ok(descriptor.decode_item(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DynamicKind;

    fn configmaps() -> DynamicKind { DynamicKind::from_gvk_key("v1/ConfigMap", "configmaps", true).unwrap() }

    fn object(uid: &str, rv: &str) -> DynamicObject {
        let ar = ApiResource::from_gvk_with_plural(&kube::core::GroupVersionKind::gvk("", "v1", "ConfigMap"), "configmaps");
        let mut obj = DynamicObject::new("settings", &ar).within("default");
        obj.metadata.uid = Some(uid.to_string());
        obj.metadata.resource_version = Some(rv.to_string());
        obj
    }

    fn gone() -> ErrorResponse {
        ErrorResponse {
            status: "Failure".into(),
            message: "too old resource version: 5 (9)".into(),
            reason: "Expired".into(),
            code: 410,
        }
    }

    #[test]
    fn api_resource_splits_group_and_version() {
        let core = api_resource(&configmaps());
        assert_eq!((core.group.as_str(), core.version.as_str()), ("", "v1"));
        let apps = api_resource(&DynamicKind::from_gvk_key("apps/v1/Deployment", "deployments", true).unwrap());
        assert_eq!((apps.group.as_str(), apps.version.as_str(), apps.plural.as_str()), ("apps", "v1", "deployments"));
    }

    #[test]
    fn watch_frames_map_to_events() {
        let kind = configmaps();
        let ev = match translate(&kind, Ok(KubeEvent::Modified(object("c-1", "12")))) {
            Some(Ok(WatchFrame::Event(ev))) => ev,
            other => panic!("expected an object event, got {other:?}"),
        };
        assert_eq!(ev.kind, EventKind::Modified);
        assert_eq!(ev.record.uid.as_str(), "c-1");
        assert_eq!(ev.record.resource_version.as_str(), "12");
        assert_eq!(ev.record.payload["kind"], "ConfigMap");
        assert_eq!(ev.record.namespace(), Some("default"));
    }

    #[test]
    fn bookmarks_carry_only_the_resume_version() {
        let kind = configmaps();
        let bookmark: KubeEvent<DynamicObject> = serde_json::from_value(serde_json::json!({
            "type": "BOOKMARK",
            "object": { "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "resourceVersion": "42" } }
        }))
        .unwrap();
        match translate(&kind, Ok(bookmark)) {
            Some(Ok(WatchFrame::Bookmark(rv))) => assert_eq!(rv.as_str(), "42"),
            other => panic!("expected a bookmark, got {other:?}"),
        }
    }

    #[test]
    fn gone_maps_to_expired() {
        let kind = configmaps();
        let err = translate(&kind, Ok(KubeEvent::Error(gone()))).unwrap().unwrap_err();
        assert!(err.is_expired());
        assert!(classify(kube::Error::Api(gone())).is_expired());

        let mut other = gone();
        other.code = 500;
        other.reason = "InternalError".into();
        assert!(!classify(kube::Error::Api(other)).is_expired());
    }

    #[test]
    fn objects_without_uid_are_rejected() {
        let kind = configmaps();
        let mut obj = object("c-1", "12");
        obj.metadata.uid = None;
        let err = translate(&kind, Ok(KubeEvent::Added(obj))).unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Transient(_)));
    }
}
