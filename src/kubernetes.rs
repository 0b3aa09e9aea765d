use std::fmt::Debug;

use kube::{
    api::{DeleteParams, Patch, PatchParams},
    Api, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::{Error, Result, FIELD_MANAGER};

/// Whether a kube error is the API server reporting a missing object
pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

/// Server-side apply an object, taking ownership of every field we set.
pub async fn apply<K>(api: &Api<K>, object: &K) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = object.name_any();
    debug!(r#"Applying {} "{name}""#, std::any::type_name::<K>());

    let params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(&name, &params, &Patch::Apply(object))
        .await
        .map_err(Error::KubeError)
}

/// Merge a set of annotations into an existing object.
pub async fn annotate<K>(api: &Api<K>, name: &str, annotations: &[(&str, &str)]) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let annotations: serde_json::Map<String, serde_json::Value> = annotations
        .iter()
        .map(|(key, value)| (key.to_string(), serde_json::Value::from(*value)))
        .collect();

    let patch = Patch::Merge(serde_json::json!({
        "metadata": { "annotations": annotations },
    }));
    api.patch(name, &PatchParams::default(), &patch)
        .await
        .map_err(Error::KubeError)?;

    Ok(())
}

/// Delete an object, treating an already missing object as success.
pub async fn delete_if_exists<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(Error::KubeError(e)),
    }
}

/// Fetch an object, mapping a missing object to `None`.
pub async fn get_if_exists<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    api.get_opt(name).await.map_err(Error::KubeError)
}
