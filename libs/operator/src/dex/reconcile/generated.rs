use dexop_k8s_util::error::{Error, Result};

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};

/// Annotation carrying the digest of the rendered Deployment spec.
pub const SPEC_HASH_ANNOTATION: &str = "kubic.opensuse.org/spec-hash";

#[inline]
pub fn sha256_hex(data: impl AsRef<[u8]>) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Content digest used to decide whether a stored object must be replaced.
pub trait ContentHash {
    /// Digest of the content rendered by the operator.
    fn content_hash(&self) -> Result<String>;

    /// Digest of an object read back from the cluster. Server defaulting may add fields, so
    /// objects can override this to read a digest recorded at render time.
    fn stored_hash(&self) -> Option<String> {
        self.content_hash().ok()
    }
}

impl ContentHash for ConfigMap {
    fn content_hash(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        for (key, value) in self.data.iter().flatten() {
            hasher.update(key);
            hasher.update([0]);
            hasher.update(value);
            hasher.update([0]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

impl ContentHash for Deployment {
    fn content_hash(&self) -> Result<String> {
        let spec = serde_json::to_vec(&self.spec).map_err(|e| {
            Error::SerializationError("failed to serialize deployment spec".to_string(), e)
        })?;
        Ok(sha256_hex(spec))
    }

    fn stored_hash(&self) -> Option<String> {
        self.annotations().get(SPEC_HASH_ANNOTATION).cloned()
    }
}

/// Object rendered locally, not yet published.
#[derive(Clone, Debug)]
pub struct Desired<K> {
    object: K,
    hash: String,
}

impl<K: ContentHash> Desired<K> {
    pub fn new(object: K) -> Result<Self> {
        let hash = object.content_hash()?;
        Ok(Self { object, hash })
    }

    #[inline]
    pub fn object(&self) -> &K {
        &self.object
    }

    #[inline]
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NeedsUpdate {
    Create,
    Update,
    UpToDate,
}

impl NeedsUpdate {
    #[inline]
    pub fn required(&self) -> bool {
        !matches!(self, NeedsUpdate::UpToDate)
    }
}

/// Compare a rendered object with the one stored in the cluster.
pub fn diff<K: ContentHash>(desired: &Desired<K>, observed: Option<&K>) -> NeedsUpdate {
    match observed {
        None => NeedsUpdate::Create,
        Some(observed) if observed.stored_hash().as_deref() == Some(desired.hash()) => {
            NeedsUpdate::UpToDate
        }
        Some(_) => NeedsUpdate::Update,
    }
}

/// Objects that can carry a controller reference to the configuration generating them.
pub trait OwnedObject {
    /// Metadata of the object the operator generates, `None` when it is supplied by the user.
    fn generated_meta(&mut self) -> Option<&mut ObjectMeta>;
}

impl<K: Resource> OwnedObject for Desired<K> {
    fn generated_meta(&mut self) -> Option<&mut ObjectMeta> {
        Some(self.object.meta_mut())
    }
}

/// Mark `owned` as controlled by `owner`, replacing any previous reference to it.
pub fn set_owner<O>(owner: &O, owned: &mut impl OwnedObject) -> Result<()>
where
    O: Resource<DynamicType = ()>,
{
    let Some(meta) = owned.generated_meta() else {
        return Ok(());
    };
    let owner_ref = owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::MissingData(format!(
            "{} has no uid to be referenced as owner",
            owner.meta().name.as_deref().unwrap_or_default()
        ))
    })?;
    let references = meta.owner_references.get_or_insert_with(Vec::new);
    references.retain(|r| r.uid != owner_ref.uid);
    references.push(owner_ref);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::dex::crd::DexConfiguration;

    use std::collections::BTreeMap;

    use k8s_openapi::api::apps::v1::DeploymentSpec;

    fn configmap(value: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("kubic-dex-cm".to_string()),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([(
                "config.yaml".to_string(),
                value.to_string(),
            )])),
            ..ConfigMap::default()
        }
    }

    #[test]
    fn test_configmap_diff() {
        let desired = Desired::new(configmap("issuer: a")).unwrap();
        assert_eq!(diff(&desired, None), NeedsUpdate::Create);
        assert_eq!(
            diff(&desired, Some(&configmap("issuer: a"))),
            NeedsUpdate::UpToDate
        );
        assert_eq!(
            diff(&desired, Some(&configmap("issuer: b"))),
            NeedsUpdate::Update
        );
        assert!(!NeedsUpdate::UpToDate.required());
        assert!(NeedsUpdate::Create.required());
    }

    #[test]
    fn test_deployment_diff_uses_annotation() {
        let deployment = Deployment {
            spec: Some(DeploymentSpec {
                replicas: Some(3),
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        };
        let desired = Desired::new(deployment.clone()).unwrap();

        let mut stored = deployment.clone();
        assert_eq!(diff(&desired, Some(&stored)), NeedsUpdate::Update);

        stored.metadata.annotations = Some(BTreeMap::from([(
            SPEC_HASH_ANNOTATION.to_string(),
            desired.hash().to_string(),
        )]));
        // server side defaults do not matter once the annotation matches
        stored.spec.as_mut().unwrap().revision_history_limit = Some(10);
        assert_eq!(diff(&desired, Some(&stored)), NeedsUpdate::UpToDate);
    }

    #[test]
    fn test_set_owner() {
        let mut dex = DexConfiguration::new("dex-configuration", Default::default());
        let mut desired = Desired::new(configmap("issuer: a")).unwrap();
        assert!(matches!(
            set_owner(&dex, &mut desired),
            Err(Error::MissingData(_))
        ));

        dex.meta_mut().uid = Some("1234".to_string());
        set_owner(&dex, &mut desired).unwrap();
        set_owner(&dex, &mut desired).unwrap();
        let references = desired.object().owner_references();
        assert_eq!(references.len(), 1);
        assert_eq!(references[0].kind, "DexConfiguration");
        assert_eq!(references[0].controller, Some(true));
    }
}
