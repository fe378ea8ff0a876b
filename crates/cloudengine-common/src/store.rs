//! Resource store access
//!
//! Controllers reach the API server only through [`ObjectApi`], so the
//! reconcile logic can run against the in-memory store in tests. Errors are
//! mapped onto [`Error::NotFound`], [`Error::Conflict`] and
//! [`Error::AlreadyExists`] so callers can branch on them.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{DeleteParams, ListParams, PostParams, Preconditions};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::crd::WithStatus;
use crate::{Error, Result};

/// Bounds every object handled through [`ObjectApi`] satisfies
pub trait StoreObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Metadata capabilities the reconciler needs from a managed object
pub trait ManagedObject: StoreObject {
    /// Owner references currently set
    fn owners(&self) -> &[OwnerReference] {
        self.meta().owner_references.as_deref().unwrap_or_default()
    }

    /// Add an owner reference unless one with the same UID exists
    fn add_owner_reference(&mut self, owner: OwnerReference) {
        let refs = self.meta_mut().owner_references.get_or_insert_with(Vec::new);
        if !refs.iter().any(|r| r.uid == owner.uid) {
            refs.push(owner);
        }
    }

    /// Object UID, if assigned
    fn object_uid(&self) -> Option<&str> {
        self.meta().uid.as_deref()
    }

    /// Current resource version token
    fn object_resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    /// `namespace/name` (or `name` when cluster-scoped) for logs and errors
    fn object_key(&self) -> String {
        match self.meta().namespace.as_deref() {
            Some(ns) => format!("{}/{}", ns, self.name_any()),
            None => self.name_any(),
        }
    }

    /// Reference used to attach events to this object
    fn event_reference(&self) -> ObjectReference {
        self.object_ref(&())
    }
}

impl<K: StoreObject> ManagedObject for K {}

/// Optimistic-concurrency guard for deletes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeletePreconditions {
    /// Delete only if the object still has this UID
    pub uid: Option<String>,
    /// Delete only if the object is still at this version
    pub resource_version: Option<String>,
}

impl DeletePreconditions {
    /// Preconditions pinning the object's current UID and version
    pub fn pinned<K: ManagedObject>(obj: &K) -> Self {
        Self {
            uid: obj.object_uid().map(str::to_string),
            resource_version: obj.object_resource_version().map(str::to_string),
        }
    }

    /// Preconditions pinning only the object's UID; later versions of the
    /// same object may still be deleted
    pub fn same_object<K: ManagedObject>(obj: &K) -> Self {
        Self {
            uid: obj.object_uid().map(str::to_string),
            resource_version: None,
        }
    }
}

/// Object-safe access to one resource type in the store
#[async_trait]
pub trait ObjectApi<K: StoreObject>: Send + Sync {
    /// Fetch an object by namespace and name
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K>;

    /// List objects, optionally filtered by an equality label selector
    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<K>>;

    /// Create an object; fails with `AlreadyExists` if the name is taken
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace an object; a stale resource version fails with `Conflict`
    async fn replace(&self, obj: &K) -> Result<K>;

    /// Replace the status sub-resource; a stale version fails with `Conflict`
    async fn replace_status(&self, obj: &K) -> Result<K>;

    /// Delete an object
    async fn delete(
        &self,
        namespace: Option<&str>,
        name: &str,
        preconditions: Option<DeletePreconditions>,
    ) -> Result<()>;

    /// Fetch an object, mapping not-found to `None`
    async fn get_opt(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        match self.get(namespace, name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Write a status, resolving a version conflict with one re-fetch and retry.
///
/// The retry copies only the status onto the freshly fetched object, so
/// concurrent spec or metadata changes are not overwritten.
pub async fn persist_status<K>(api: &dyn ObjectApi<K>, obj: &K) -> Result<K>
where
    K: WithStatus + StoreObject,
{
    match api.replace_status(obj).await {
        Err(e) if e.is_conflict() => {
            debug!(object = %obj.object_key(), "status write conflicted, retrying on latest");
            let mut latest = api.get(obj.meta().namespace.as_deref(), &obj.name_any()).await?;
            if let Some(status) = obj.status() {
                latest.set_status(status.clone());
            }
            api.replace_status(&latest).await.inspect_err(|e| {
                warn!(object = %obj.object_key(), error = %e, "status retry failed");
            })
        }
        other => other,
    }
}

type ScopedApi<K> = fn(Client, Option<&str>) -> Api<K>;

/// [`ObjectApi`] backed by the Kubernetes API server
pub struct KubeApi<K> {
    client: Client,
    scoped: ScopedApi<K>,
}

fn namespaced_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn cluster_api<K>(client: Client, _namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = ClusterResourceScope, DynamicType = ()>,
{
    Api::all(client)
}

impl<K> KubeApi<K>
where
    K: StoreObject + Resource<Scope = NamespaceResourceScope>,
{
    /// Store access for a namespaced resource type
    pub fn namespaced(client: Client) -> Self {
        Self {
            client,
            scoped: namespaced_api::<K>,
        }
    }
}

impl<K> KubeApi<K>
where
    K: StoreObject + Resource<Scope = ClusterResourceScope>,
{
    /// Store access for a cluster-scoped resource type
    pub fn cluster(client: Client) -> Self {
        Self {
            client,
            scoped: cluster_api::<K>,
        }
    }
}

impl<K: StoreObject> KubeApi<K> {
    fn api(&self, namespace: Option<&str>) -> Api<K> {
        (self.scoped)(self.client.clone(), namespace)
    }

    fn api_for(&self, obj: &K) -> Api<K> {
        self.api(obj.meta().namespace.as_deref())
    }
}

fn kind<K: StoreObject>() -> String {
    K::kind(&()).to_string()
}

#[async_trait]
impl<K: StoreObject> ObjectApi<K> for KubeApi<K> {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        self.api(namespace)
            .get(name)
            .await
            .map_err(|e| Error::from_kube(&kind::<K>(), name, e))
    }

    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<K>> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = self
            .api(namespace)
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(&kind::<K>(), namespace.unwrap_or("*"), e))?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        self.api_for(obj)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(&kind::<K>(), &obj.object_key(), e))
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        self.api_for(obj)
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(&kind::<K>(), &obj.object_key(), e))
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let body = serde_json::to_vec(obj)?;
        self.api_for(obj)
            .replace_status(&obj.name_any(), &PostParams::default(), body)
            .await
            .map_err(|e| Error::from_kube(&kind::<K>(), &obj.object_key(), e))
    }

    async fn delete(
        &self,
        namespace: Option<&str>,
        name: &str,
        preconditions: Option<DeletePreconditions>,
    ) -> Result<()> {
        let params = DeleteParams {
            preconditions: preconditions.map(|p| Preconditions {
                uid: p.uid,
                resource_version: p.resource_version,
            }),
            ..DeleteParams::default()
        };
        self.api(namespace)
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(|e| Error::from_kube(&kind::<K>(), name, e))
    }
}
