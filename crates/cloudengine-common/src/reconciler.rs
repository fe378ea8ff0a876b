//! Declarative reconciliation of a single dependent resource
//!
//! [`reconcile_resource`] drives one sub-resource towards an expected object:
//! create it when missing, recreate or update it when the caller's predicates
//! say so, and leave it alone otherwise. Hooks run around each write path.
//! After every invocation the actual object is re-fetched so later steps in
//! the same pass see the latest state.

use std::fmt;
use std::time::Instant;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use tracing::{debug, info, warn};

use crate::store::{DeletePreconditions, ManagedObject, ObjectApi, StoreObject};
use crate::{Error, Result};

type Predicate<'a, K> = Box<dyn Fn(&K, &K) -> bool + Send + Sync + 'a>;
type CreateHook<'a, K> = Box<dyn FnMut(&mut K) -> Result<()> + Send + 'a>;
type UpdateHook<'a, K> = Box<dyn FnMut(&mut K, &K) -> Result<()> + Send + 'a>;
type PostUpdateHook<'a, K> = Box<dyn FnMut(&K) -> Result<()> + Send + 'a>;

fn never<K>(_expected: &K, _actual: &K) -> bool {
    false
}

/// What the reconciler did to the resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceAction {
    /// The resource did not exist and was created
    Created,
    /// The resource was deleted and created again
    Recreated,
    /// The resource was updated in place
    Updated,
    /// The resource already matched
    Unchanged,
}

impl fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Recreated => write!(f, "recreated"),
            Self::Updated => write!(f, "updated"),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Inputs for one [`reconcile_resource`] call
///
/// Predicates receive `(expected, actual)`. `pre_update` receives the object
/// about to be written (initially a copy of `expected`) and the actual one;
/// it may rebuild the write from the actual object.
pub struct ResourceConfig<'a, K> {
    expected: K,
    owner: Option<OwnerReference>,
    invalid: Vec<String>,
    need_update: Predicate<'a, K>,
    need_recreate: Predicate<'a, K>,
    pre_create: Option<CreateHook<'a, K>>,
    pre_update: Option<UpdateHook<'a, K>>,
    post_update: Option<PostUpdateHook<'a, K>>,
}

impl<'a, K: StoreObject> ResourceConfig<'a, K> {
    /// Reconcile towards `expected`; by default an existing object is left alone
    pub fn new(expected: K) -> Self {
        Self {
            expected,
            owner: None,
            invalid: Vec::new(),
            need_update: Box::new(never::<K>),
            need_recreate: Box::new(never::<K>),
            pre_create: None,
            pre_update: None,
            post_update: None,
        }
    }

    /// Make `owner` the controlling owner of the resource
    pub fn owned_by<O>(mut self, owner: &O) -> Self
    where
        O: Resource<DynamicType = ()>,
    {
        match owner.controller_owner_ref(&()) {
            Some(reference) => self.owner = Some(reference),
            None => self
                .invalid
                .push(format!("owner {} has no name or uid", O::kind(&()))),
        }
        self
    }

    /// Predicate deciding whether an existing object needs an update
    pub fn need_update(mut self, f: impl Fn(&K, &K) -> bool + Send + Sync + 'a) -> Self {
        self.need_update = Box::new(f);
        self
    }

    /// Predicate deciding whether an existing object must be replaced
    pub fn need_recreate(mut self, f: impl Fn(&K, &K) -> bool + Send + Sync + 'a) -> Self {
        self.need_recreate = Box::new(f);
        self
    }

    /// Hook run on the expected object before any create
    pub fn pre_create(mut self, f: impl FnMut(&mut K) -> Result<()> + Send + 'a) -> Self {
        self.pre_create = Some(Box::new(f));
        self
    }

    /// Hook run before an update is written
    pub fn pre_update(mut self, f: impl FnMut(&mut K, &K) -> Result<()> + Send + 'a) -> Self {
        self.pre_update = Some(Box::new(f));
        self
    }

    /// Hook run with the written object after an update
    pub fn post_update(mut self, f: impl FnMut(&K) -> Result<()> + Send + 'a) -> Self {
        self.post_update = Some(Box::new(f));
        self
    }
}

/// Result of [`reconcile_resource`]
#[derive(Debug)]
pub struct Reconciled<K> {
    /// Action taken, or the error that aborted it
    pub outcome: Result<ResourceAction>,
    /// Latest actual object, re-fetched on exit; `None` if absent or unreadable
    pub object: Option<K>,
}

impl<K> Reconciled<K> {
    /// Split into the outcome and the re-fetched object
    pub fn into_parts(self) -> (Result<ResourceAction>, Option<K>) {
        (self.outcome, self.object)
    }
}

/// Reconcile one dependent resource towards `config.expected`
pub async fn reconcile_resource<K: StoreObject>(
    api: &dyn ObjectApi<K>,
    config: ResourceConfig<'_, K>,
) -> Reconciled<K> {
    let started = Instant::now();
    let kind = K::kind(&()).to_string();
    let namespace = config.expected.meta().namespace.clone();
    let name = config.expected.meta().name.clone();

    let outcome = converge(api, config).await;

    let object = match name.as_deref() {
        Some(name) => match api.get_opt(namespace.as_deref(), name).await {
            Ok(object) => object,
            Err(e) => {
                debug!(kind = %kind, name, error = %e, "re-fetch after reconcile failed");
                None
            }
        },
        None => None,
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let name = name.unwrap_or_default();
    match &outcome {
        Ok(ResourceAction::Unchanged) => {
            debug!(kind = %kind, name = %name, elapsed_ms, "resource unchanged")
        }
        Ok(action) => info!(kind = %kind, name = %name, action = %action, elapsed_ms, "resource reconciled"),
        Err(e) => warn!(kind = %kind, name = %name, error = %e, elapsed_ms, "resource reconcile failed"),
    }

    Reconciled { outcome, object }
}

async fn converge<K: StoreObject>(
    api: &dyn ObjectApi<K>,
    config: ResourceConfig<'_, K>,
) -> Result<ResourceAction> {
    let ResourceConfig {
        mut expected,
        owner,
        invalid,
        need_update,
        need_recreate,
        mut pre_create,
        mut pre_update,
        mut post_update,
    } = config;

    if let Some(problem) = invalid.into_iter().next() {
        return Err(Error::configuration("reconciler", problem));
    }
    let name = match expected.meta().name.clone() {
        Some(name) if !name.is_empty() => name,
        _ => {
            return Err(Error::configuration(
                "reconciler",
                format!("expected {} has no name", K::kind(&())),
            ))
        }
    };
    let namespace = expected.meta().namespace.clone();

    if let Some(owner) = owner {
        expected.add_owner_reference(owner);
    }

    let actual = match api.get(namespace.as_deref(), &name).await {
        Ok(actual) => actual,
        Err(e) if e.is_not_found() => {
            if let Some(hook) = pre_create.as_mut() {
                hook(&mut expected)?;
            }
            api.create(&expected).await?;
            return Ok(ResourceAction::Created);
        }
        Err(e) => return Err(e),
    };

    let recreate = need_recreate(&expected, &actual);
    let update = !recreate && need_update(&expected, &actual);
    debug!(
        kind = %K::kind(&()),
        name = %name,
        need_recreate = recreate,
        need_update = update,
        "resource decision"
    );

    if recreate {
        let preconditions = DeletePreconditions::pinned(&actual);
        match api.delete(namespace.as_deref(), &name, Some(preconditions)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        if let Some(hook) = pre_create.as_mut() {
            hook(&mut expected)?;
        }
        api.create(&expected).await?;
        return Ok(ResourceAction::Recreated);
    }

    if update {
        let mut persisted = expected.clone();
        if let Some(hook) = pre_update.as_mut() {
            hook(&mut persisted, &actual)?;
        }
        persisted.meta_mut().resource_version = actual.meta().resource_version.clone();
        let written = api.replace(&persisted).await?;
        if let Some(hook) = post_update.as_mut() {
            hook(&written)?;
        }
        return Ok(ResourceAction::Updated);
    }

    Ok(ResourceAction::Unchanged)
}
