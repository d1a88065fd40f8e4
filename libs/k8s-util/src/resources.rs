use crate::error::{Error, Result};
use crate::types::short_type_name;

use std::fmt::Debug;

use kube::Resource;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

#[inline]
pub fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

#[inline]
pub fn is_already_exists(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 409)
}

/// Get an object, mapping a not-found response to `None`.
pub async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if is_not_found(&e) => {
            trace!(msg = "object not found", kind = kind_of::<K>(), name);
            Ok(None)
        }
        Err(e) => Err(Error::KubeError(
            format!("failed to get {} {name}", kind_of::<K>()),
            Box::new(e),
        )),
    }
}

/// Create or update an object with server-side apply.
pub async fn apply<K>(api: &Api<K>, obj: &K, field_manager: &str) -> Result<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    let name = obj
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::MissingData(format!("{} without name", kind_of::<K>())))?;
    debug!(msg = "applying object", kind = kind_of::<K>(), name);
    api.patch(
        name,
        &PatchParams::apply(field_manager).force(),
        &Patch::Apply(obj),
    )
    .await
    .map_err(|e| {
        Error::KubeError(
            format!("failed to apply {} {name}", kind_of::<K>()),
            Box::new(e),
        )
    })
}

/// Delete an object. Returns `false` when it did not exist.
pub async fn delete_opt<K>(api: &Api<K>, name: &str, dp: &DeleteParams) -> Result<bool>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.delete(name, dp).await {
        Ok(_) => {
            debug!(msg = "object deleted", kind = kind_of::<K>(), name);
            Ok(true)
        }
        Err(e) if is_not_found(&e) => {
            trace!(msg = "object already gone", kind = kind_of::<K>(), name);
            Ok(false)
        }
        Err(e) => Err(Error::KubeError(
            format!("failed to delete {} {name}", kind_of::<K>()),
            Box::new(e),
        )),
    }
}

#[inline]
fn kind_of<K>() -> &'static str {
    short_type_name::<K>().unwrap_or("object")
}
