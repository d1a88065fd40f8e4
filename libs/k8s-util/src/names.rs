use crate::error::{Error, Result};

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::SecretReference;

/// Namespace used when a reference does not carry one.
pub const DEFAULT_NAMESPACE: &str = "kube-system";

/// A `(name, namespace)` pair with a canonical `namespace/name` string form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build from an optional secret reference, defaulting the namespace.
    ///
    /// Returns `None` when the reference has no name.
    pub fn from_secret_reference(reference: &SecretReference) -> Option<Self> {
        let name = reference.name.as_deref().filter(|n| !n.is_empty())?;
        let namespace = reference
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE);
        Some(Self::new(namespace, name))
    }

    pub fn to_secret_reference(&self) -> SecretReference {
        SecretReference {
            name: Some(self.name.clone()),
            namespace: Some(self.namespace.clone()),
        }
    }
}

impl FromStr for NamespacedName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                if name.contains('/') {
                    return Err(Error::ParseError(format!(
                        "invalid namespaced name '{s}': too many separators"
                    )));
                }
                Ok(Self::new(namespace, name))
            }
            Some(_) => Err(Error::ParseError(format!(
                "invalid namespaced name '{s}': empty component"
            ))),
            None if s.is_empty() => Err(Error::ParseError("empty namespaced name".to_string())),
            None => Ok(Self::new(DEFAULT_NAMESPACE, s)),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Sanitize free text into an identifier usable in object names and YAML keys.
pub fn safe_id(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| match c {
            ' ' | ':' | '/' | '.' => '-',
            c => c,
        })
        .collect()
}

/// Remove repeated elements, keeping the first occurrence of each.
pub fn remove_duplicates<T: PartialEq + Clone>(items: &[T]) -> Vec<T> {
    items.iter().fold(Vec::with_capacity(items.len()), |mut acc, item| {
        if !acc.contains(item) {
            acc.push(item.clone());
        }
        acc
    })
}
