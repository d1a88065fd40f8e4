use super::DEX_OPERATOR_NAME;

use crate::config::OperatorConfig;
#[cfg(test)]
use crate::config::DEFAULT_PASSWORD_LENGTH;

use dexop_k8s_util::error::{Error, Result};
use dexop_k8s_util::names::{NamespacedName, safe_id};
use dexop_k8s_util::resources::{apply, delete_opt, get_opt};

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{Secret, SecretReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ObjectMeta};
use kube::client::Client;
use openssl::rand::rand_bytes;
use tracing::{debug, warn};

const PASSWORD_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
// largest multiple of the alphabet length that fits in a byte, avoids modulo bias
const ACCEPTED_BYTE_LIMIT: u8 = 248;

/// Random string of `len` alphanumeric characters drawn from the OpenSSL CSPRNG.
pub fn random_alphanumeric(len: usize) -> Result<String> {
    let mut password = String::with_capacity(len);
    let mut buffer = [0u8; 64];
    while password.len() < len {
        rand_bytes(&mut buffer)
            .map_err(|e| Error::CryptoError("failed to generate random bytes".to_string(), e))?;
        password.extend(
            buffer
                .iter()
                .filter(|b| **b < ACCEPTED_BYTE_LIMIT)
                .map(|b| PASSWORD_ALPHABET[*b as usize % PASSWORD_ALPHABET.len()] as char)
                .take(len - password.len()),
        );
    }
    Ok(password)
}

/// Password shared between Dex and one of its static clients, stored in a Secret whose single
/// data key is the Secret name.
#[derive(Clone, PartialEq)]
pub struct SharedPassword {
    pub name: NamespacedName,
    contents: String,
}

impl fmt::Debug for SharedPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedPassword")
            .field("name", &self.name)
            .field("contents", &"<redacted>")
            .finish()
    }
}

impl SharedPassword {
    pub fn generate(name: NamespacedName, len: usize) -> Result<Self> {
        Ok(Self {
            name,
            contents: random_alphanumeric(len)?,
        })
    }

    /// Read the password stored in `secret`. `None` when the expected key is missing.
    pub fn from_secret(name: NamespacedName, secret: &Secret) -> Result<Option<Self>> {
        secret
            .data
            .as_ref()
            .and_then(|data| data.get(&name.name))
            .map(|ByteString(bytes)| {
                String::from_utf8(bytes.clone())
                    .map(|contents| Self {
                        name: name.clone(),
                        contents,
                    })
                    .map_err(|e| Error::Utf8Error(format!("password in secret {name}"), e))
            })
            .transpose()
    }

    #[inline]
    pub fn contents(&self) -> &str {
        &self.contents
    }

    pub fn to_secret(
        &self,
        labels: &BTreeMap<String, String>,
        owner: Option<&OwnerReference>,
    ) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(self.name.name.clone()),
                namespace: Some(self.name.namespace.clone()),
                labels: Some(labels.clone()),
                owner_references: owner.map(|o| vec![o.clone()]),
                ..ObjectMeta::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(BTreeMap::from([(
                self.name.name.clone(),
                ByteString(self.contents.clone().into_bytes()),
            )])),
            ..Secret::default()
        }
    }
}

/// Shared passwords of every static client, keyed by client name.
#[derive(Clone, Debug, Default)]
pub struct StaticClientsPasswords {
    prefix: String,
    namespace: String,
    passwords: BTreeMap<String, SharedPassword>,
}

impl StaticClientsPasswords {
    /// Load the passwords of `client_names`, generating the missing ones.
    pub async fn load(client: Client, config: &OperatorConfig, client_names: &[String]) -> Result<Self> {
        let mut passwords = Self {
            prefix: safe_id(&config.prefix),
            namespace: config.namespace.clone(),
            passwords: BTreeMap::new(),
        };
        let api: Api<Secret> = Api::namespaced(client, &config.namespace);
        for client_name in client_names {
            let name = NamespacedName::new(&config.namespace, passwords.secret_name(client_name));
            let stored = match get_opt(&api, &name.name).await? {
                Some(secret) => SharedPassword::from_secret(name.clone(), &secret)?,
                None => None,
            };
            let password = match stored {
                Some(password) => password,
                None => {
                    debug!(msg = "generating shared password", client = client_name.as_str(), secret = %name);
                    SharedPassword::generate(name, config.password_length)?
                }
            };
            passwords.passwords.insert(client_name.clone(), password);
        }
        Ok(passwords)
    }

    #[inline]
    pub fn secret_name(&self, client_name: &str) -> String {
        format!("{}-{}", self.prefix, safe_id(client_name))
    }

    #[inline]
    pub fn get(&self, client_name: &str) -> Option<&SharedPassword> {
        self.passwords.get(client_name)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.passwords.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.passwords.is_empty()
    }

    pub fn reference(&self, client_name: &str) -> Option<SecretReference> {
        self.get(client_name).map(|p| p.name.to_secret_reference())
    }

    pub async fn publish(
        &self,
        client: Client,
        labels: &BTreeMap<String, String>,
        owner: Option<&OwnerReference>,
    ) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(client, &self.namespace);
        for password in self.passwords.values() {
            apply(&api, &password.to_secret(labels, owner), DEX_OPERATOR_NAME).await?;
        }
        Ok(())
    }

    /// Delete every password secret, returning the failures.
    pub async fn delete(&self, client: Client) -> Vec<(String, Error)> {
        let api: Api<Secret> = Api::namespaced(client, &self.namespace);
        let mut failures = Vec::new();
        for password in self.passwords.values() {
            if let Err(e) = delete_opt(&api, &password.name.name, &DeleteParams::default()).await {
                warn!(msg = "failed to delete shared password", secret = %password.name, %e);
                failures.push((format!("Secret {}", password.name), e));
            }
        }
        failures
    }
}

#[cfg(test)]
impl StaticClientsPasswords {
    /// Freshly generated passwords for `client_names`
    pub fn with_generated(prefix: &str, namespace: &str, client_names: &[&str]) -> Self {
        let mut passwords = Self {
            prefix: safe_id(prefix),
            namespace: namespace.to_string(),
            passwords: BTreeMap::new(),
        };
        for client_name in client_names {
            let name = NamespacedName::new(namespace, passwords.secret_name(client_name));
            let password = SharedPassword::generate(name, DEFAULT_PASSWORD_LENGTH).unwrap();
            passwords.passwords.insert(client_name.to_string(), password);
        }
        passwords
    }

    /// Passwords with known contents, as `(client name, contents)` pairs
    pub fn with_contents(prefix: &str, namespace: &str, contents: &[(&str, &str)]) -> Self {
        let mut passwords = Self {
            prefix: safe_id(prefix),
            namespace: namespace.to_string(),
            passwords: BTreeMap::new(),
        };
        for (client_name, password) in contents {
            let name = NamespacedName::new(namespace, passwords.secret_name(client_name));
            passwords.passwords.insert(
                client_name.to_string(),
                SharedPassword {
                    name,
                    contents: password.to_string(),
                },
            );
        }
        passwords
    }
}
