//! Bundling objects into `ManagedResource`s and waiting for their reconciliation.
//!
//! A `ManagedResource` references a secret whose data holds the serialized
//! manifests. The gardener-resource-manager applies those manifests, keeps them
//! in sync and reports `ResourcesApplied`/`ResourcesHealthy` conditions, which
//! the wait functions below poll.

use std::{collections::BTreeMap, time::Duration};

use k8s_openapi::{
    api::core::v1::{LocalObjectReference, Secret},
    ByteString, NamespaceResourceScope,
};
use kube::{
    api::{Patch, PatchParams},
    Api, Client, Resource, ResourceExt,
};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::{
    health, kubernetes, meta,
    resources::{ManagedResource, ManagedResourceSpec},
    retry::{self, Outcome},
    Error, Result,
};

/// Resource class handled by the resource manager running in the seed
pub const CLASS_SEED: &str = "seed";
/// Label put on managed resources to mark their origin
pub const LABEL_ORIGIN: &str = "origin";
/// Origin of the managed resources created here
pub const ORIGIN_GARDENER: &str = "gardener";
/// Injected label preventing the shoot cleanup from removing applied objects
pub const LABEL_NO_CLEANUP: &str = "shoot.gardener.cloud/no-cleanup";

/// Interval in which managed resources are polled while waiting
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Collects objects and serializes them into the data of a managed resource secret.
#[derive(Debug, Default)]
pub struct Registry {
    objects: BTreeMap<String, Vec<u8>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key under which an object is stored in the secret.
    pub fn object_key<K>(object: &K) -> String
    where
        K: Resource<DynamicType = ()>,
    {
        format!(
            "{}__{}__{}.yaml",
            K::kind(&()).to_lowercase(),
            object.namespace().unwrap_or_default(),
            object.name_any().replace(':', "_"),
        )
    }

    /// Add an object; every object may only be added once.
    pub fn add<K>(&mut self, object: &K) -> Result<()>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let key = Self::object_key(object);
        if self.objects.contains_key(&key) {
            return Err(Error::DuplicateObject(key));
        }

        let serialized = serde_yaml::to_string(object).map_err(Error::YamlError)?;
        self.objects.insert(key, serialized.into_bytes());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// The secret data for all added objects.
    pub fn serialized_objects(&self) -> BTreeMap<String, ByteString> {
        self.objects
            .iter()
            .map(|(key, value)| (key.clone(), ByteString(value.clone())))
            .collect()
    }
}

/// Name of the secret holding the manifests of a managed resource.
pub fn secret_name(name: &str) -> String {
    format!("managedresource-{name}")
}

/// Builder for a managed resource together with its secret
#[derive(Debug, Clone)]
pub struct Builder {
    namespace: String,
    name: String,
    class: Option<String>,
    keep_objects: bool,
    labels: BTreeMap<String, String>,
    inject_labels: Option<BTreeMap<String, String>>,
}

impl Builder {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            class: None,
            keep_objects: false,
            labels: BTreeMap::new(),
            inject_labels: None,
        }
    }

    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    pub fn keep_objects(mut self, keep: bool) -> Self {
        self.keep_objects = keep;
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn inject_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.inject_labels = Some(labels);
        self
    }

    /// The secret holding the given data.
    pub fn build_secret(&self, data: BTreeMap<String, ByteString>) -> Secret {
        Secret {
            metadata: meta! {
                name: Some(secret_name(&self.name)),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.labels.clone())
            },
            type_: Some("Opaque".into()),
            data: Some(data),

            ..Default::default()
        }
    }

    /// The managed resource referencing the secret.
    pub fn build_managed_resource(&self) -> ManagedResource {
        let mut mr = ManagedResource::new(
            &self.name,
            ManagedResourceSpec {
                class: self.class.clone(),
                secret_refs: vec![LocalObjectReference {
                    name: Some(secret_name(&self.name)),
                }],
                inject_labels: self.inject_labels.clone(),
                keep_objects: Some(self.keep_objects),

                ..Default::default()
            },
        );
        mr.metadata.namespace = Some(self.namespace.clone());
        mr.metadata.labels = Some(self.labels.clone());
        mr
    }

    /// Write the secret first, then the managed resource referencing it.
    pub async fn reconcile(&self, client: Client, data: BTreeMap<String, ByteString>) -> Result<()> {
        let secrets = Api::<Secret>::namespaced(client.clone(), &self.namespace);
        kubernetes::apply(&secrets, &self.build_secret(data)).await?;

        let managed_resources = Api::<ManagedResource>::namespaced(client, &self.namespace);
        kubernetes::apply(&managed_resources, &self.build_managed_resource()).await?;

        info!(
            namespace = %self.namespace,
            name = %self.name,
            "Reconciled managed resource"
        );
        Ok(())
    }
}

/// Create or update a managed resource reconciled by the seed's resource manager.
pub async fn create_for_seed(
    client: Client,
    namespace: &str,
    name: &str,
    keep_objects: bool,
    data: BTreeMap<String, ByteString>,
) -> Result<()> {
    Builder::new(namespace, name)
        .class(CLASS_SEED)
        .keep_objects(keep_objects)
        .reconcile(client, data)
        .await
}

/// Create or update a managed resource whose objects are applied to a shoot.
pub async fn create_for_shoot(
    client: Client,
    namespace: &str,
    name: &str,
    origin: &str,
    keep_objects: bool,
    data: BTreeMap<String, ByteString>,
) -> Result<()> {
    Builder::new(namespace, name)
        .keep_objects(keep_objects)
        .label(LABEL_ORIGIN, origin)
        .inject_labels(BTreeMap::from([(LABEL_NO_CLEANUP.into(), "true".into())]))
        .reconcile(client, data)
        .await
}

/// Delete a managed resource and its secret.
pub async fn delete(client: Client, namespace: &str, name: &str) -> Result<()> {
    let managed_resources = Api::<ManagedResource>::namespaced(client.clone(), namespace);
    kubernetes::delete_if_exists(&managed_resources, name).await?;

    let secrets = Api::<Secret>::namespaced(client, namespace);
    kubernetes::delete_if_exists(&secrets, &secret_name(name)).await
}

/// Toggle whether the applied objects survive the deletion of the managed resource.
pub async fn set_keep_objects(client: Client, namespace: &str, name: &str, keep: bool) -> Result<()> {
    let managed_resources = Api::<ManagedResource>::namespaced(client, namespace);
    let patch = Patch::Merge(json!({ "spec": { "keepObjects": keep } }));

    match managed_resources
        .patch(name, &PatchParams::default(), &patch)
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if kubernetes::is_not_found(&e) => Ok(()),
        Err(e) => Err(Error::KubeError(e)),
    }
}

/// Poll a managed resource until it reports healthy or `timeout` elapses.
pub async fn wait_until_healthy(
    client: Client,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> Result<()> {
    let managed_resources = Api::<ManagedResource>::namespaced(client, namespace);
    let what = format!("managed resource {namespace}/{name}");

    retry::until_timeout(POLL_INTERVAL, timeout, what.clone(), || {
        let managed_resources = managed_resources.clone();
        let what = what.clone();
        async move {
            match kubernetes::get_if_exists(&managed_resources, name).await {
                Ok(Some(mr)) => Outcome::retry_on_error(
                    health::check_managed_resource(&mr)
                        .map_err(|e| Error::Unhealthy(what, e.to_string())),
                ),
                Ok(None) => Outcome::Retry(Error::Unhealthy(what, "not found".into())),
                Err(e) => Outcome::Retry(e),
            }
        }
    })
    .await
}

/// Poll until a managed resource is gone or `timeout` elapses.
pub async fn wait_until_deleted(
    client: Client,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> Result<()> {
    wait_until_gone::<ManagedResource>(client, namespace, name, timeout).await
}

/// Poll until a namespaced object is gone or `timeout` elapses.
pub async fn wait_until_gone<K>(client: Client, namespace: &str, name: &str, timeout: Duration) -> Result<()>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
{
    let api = Api::<K>::namespaced(client, namespace);
    let what = format!("{} {namespace}/{name}", K::kind(&()).to_lowercase());

    retry::until_timeout(POLL_INTERVAL, timeout, what.clone(), || {
        let api = api.clone();
        let what = what.clone();
        async move {
            match kubernetes::get_if_exists(&api, name).await {
                Ok(None) => Outcome::Done,
                Ok(Some(_)) => Outcome::Retry(Error::StillExists(what)),
                Err(e) => Outcome::Retry(e),
            }
        }
    })
    .await
}
