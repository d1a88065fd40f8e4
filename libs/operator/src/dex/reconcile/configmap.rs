use super::DEX_OPERATOR_NAME;
use super::cluster::DEX_PORT;
use super::generated::{Desired, NeedsUpdate, diff, sha256_hex};
use super::passwords::StaticClientsPasswords;

use crate::config::OperatorConfig;
use crate::dex::crd::{DexConfiguration, DexStaticClient, LdapConnector};
use crate::template::{base64_decode, base64_encode, basename, render, safe_yaml_id};

use dexop_k8s_util::error::{Error, Result};
use dexop_k8s_util::names::NamespacedName;
use dexop_k8s_util::resources::{apply, delete_opt, get_opt};
use dexop_k8s_util::wait::wait_for_object;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use kube::api::{Api, DeleteParams, ObjectMeta};
use kube::client::Client;
use serde::Serialize;
use tracing::{debug, warn};

const PEM_PREFIX: &str = "-----BEGIN";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DexServerConfig<'a> {
    issuer: String,
    storage: Storage,
    web: Web,
    oauth2: OAuth2,
    connectors: Vec<Connector<'a>>,
    static_clients: Vec<StaticClient<'a>>,
    enable_password_db: bool,
}

#[derive(Serialize)]
struct Storage {
    #[serde(rename = "type")]
    type_: &'static str,
    config: StorageConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StorageConfig {
    in_cluster: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Web {
    https: String,
    tls_cert: String,
    tls_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OAuth2 {
    skip_approval_screen: bool,
}

#[derive(Serialize)]
struct Connector<'a> {
    #[serde(rename = "type")]
    type_: &'static str,
    id: String,
    name: &'a str,
    config: LdapConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LdapConfig<'a> {
    host: &'a str,
    #[serde(rename = "startTLS")]
    start_tls: bool,
    #[serde(rename = "rootCAData", skip_serializing_if = "Option::is_none")]
    root_ca_data: Option<String>,
    #[serde(rename = "bindDN", skip_serializing_if = "str::is_empty")]
    bind_dn: &'a str,
    #[serde(rename = "bindPW", skip_serializing_if = "str::is_empty")]
    bind_pw: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    username_prompt: &'a str,
    user_search: UserSearch<'a>,
    group_search: GroupSearch<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UserSearch<'a> {
    #[serde(rename = "baseDN")]
    base_dn: &'a str,
    filter: &'a str,
    username: &'a str,
    id_attr: &'a str,
    email_attr: &'a str,
    name_attr: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupSearch<'a> {
    #[serde(rename = "baseDN")]
    base_dn: &'a str,
    filter: &'a str,
    user_attr: &'a str,
    group_attr: &'a str,
    name_attr: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StaticClient<'a> {
    id: String,
    name: &'a str,
    secret: &'a str,
    #[serde(rename = "redirectURIs")]
    redirect_uris: &'a [String],
    public: bool,
}

/// Root CA as Dex expects it: base64 of the PEM data.
fn root_ca_data(connector: &LdapConnector) -> Result<Option<String>> {
    let data = connector.spec.root_ca_data.trim();
    if data.is_empty() {
        Ok(None)
    } else if data.starts_with(PEM_PREFIX) {
        Ok(Some(base64_encode(data)))
    } else {
        base64_decode(data).map_err(|e| {
            Error::ParseError(format!(
                "rootCAData of LDAP connector {} is neither PEM nor base64: {e}",
                connector.name_any()
            ))
        })?;
        Ok(Some(data.to_string()))
    }
}

fn connector_config(connector: &LdapConnector) -> Result<Connector<'_>> {
    let spec = &connector.spec;
    Ok(Connector {
        type_: "ldap",
        id: if spec.id.is_empty() {
            safe_yaml_id(&connector.name_any())
        } else {
            spec.id.clone()
        },
        name: if spec.name.is_empty() {
            connector.metadata.name.as_deref().unwrap_or_default()
        } else {
            &spec.name
        },
        config: LdapConfig {
            host: &spec.server,
            start_tls: spec.start_tls,
            root_ca_data: root_ca_data(connector)?,
            bind_dn: &spec.bind_dn,
            bind_pw: &spec.bind_pw,
            username_prompt: &spec.username_prompt,
            user_search: UserSearch {
                base_dn: &spec.user.base_dn,
                filter: &spec.user.filter,
                username: &spec.user.username,
                id_attr: &spec.user.id_attr,
                email_attr: &spec.user.email_attr,
                name_attr: &spec.user.name_attr,
            },
            group_search: GroupSearch {
                base_dn: &spec.group.base_dn,
                filter: &spec.group.filter,
                user_attr: &spec.group.user_attr,
                group_attr: &spec.group.group_attr,
                name_attr: &spec.group.name_attr,
            },
        },
    })
}

/// Render the Dex server configuration file.
pub fn render_dex_config(
    config: &OperatorConfig,
    issuer: &str,
    connectors: &[LdapConnector],
    static_clients: &[DexStaticClient],
    passwords: &StaticClientsPasswords,
) -> Result<String> {
    let mut connectors = connectors.iter().collect::<Vec<_>>();
    connectors.sort_by_key(|c| c.name_any());

    let static_clients = static_clients
        .iter()
        .map(|client| {
            let password = passwords.get(&client.name).ok_or_else(|| {
                Error::MissingData(format!("no shared password for static client {}", client.name))
            })?;
            Ok(StaticClient {
                id: safe_yaml_id(&client.name),
                name: &client.name,
                secret: password.contents(),
                redirect_uris: &client.redirect_urls,
                public: client.public,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    render(&DexServerConfig {
        issuer: issuer.to_string(),
        storage: Storage {
            type_: "kubernetes",
            config: StorageConfig { in_cluster: true },
        },
        web: Web {
            https: format!("0.0.0.0:{DEX_PORT}"),
            tls_cert: format!("{}/tls.crt", config.certs_dir),
            tls_key: format!("{}/tls.key", config.certs_dir),
        },
        oauth2: OAuth2 {
            skip_approval_screen: true,
        },
        connectors: connectors
            .into_iter()
            .map(connector_config)
            .collect::<Result<_>>()?,
        static_clients,
        enable_password_db: false,
    })
}

/// Dex configuration file published as a ConfigMap.
#[derive(Clone, Debug)]
pub struct DexConfigMap {
    reference: NamespacedName,
    observed: Option<ConfigMap>,
}

impl DexConfigMap {
    /// Load the ConfigMap recorded in status, or the default one.
    pub async fn load(client: Client, dex: &DexConfiguration, config: &OperatorConfig) -> Result<Self> {
        let recorded = dex
            .status
            .as_ref()
            .and_then(|s| s.config.as_deref())
            .and_then(|s| {
                s.parse::<NamespacedName>()
                    .map_err(|e| warn!(msg = "ignoring invalid config reference in status", %e))
                    .ok()
            });
        let reference = recorded
            .unwrap_or_else(|| NamespacedName::new(&config.namespace, config.configmap_name()));
        let api: Api<ConfigMap> = Api::namespaced(client, &reference.namespace);
        let observed = get_opt(&api, &reference.name).await?;
        Ok(Self {
            reference,
            observed,
        })
    }

    #[inline]
    pub fn reference(&self) -> &NamespacedName {
        &self.reference
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.observed.is_some()
    }

    #[inline]
    pub fn data_key(config: &OperatorConfig) -> String {
        basename(&config.config_filename)
    }

    pub fn create_local(
        &self,
        config: &OperatorConfig,
        labels: &BTreeMap<String, String>,
        dex_config: String,
    ) -> Result<Desired<ConfigMap>> {
        Desired::new(ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.reference.name.clone()),
                namespace: Some(self.reference.namespace.clone()),
                labels: Some(labels.clone()),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([(Self::data_key(config), dex_config)])),
            ..ConfigMap::default()
        })
    }

    pub fn needs_create_or_update(&self, desired: &Desired<ConfigMap>) -> NeedsUpdate {
        diff(desired, self.observed.as_ref())
    }

    /// Digest of the configuration file embedded in the Deployment pod template.
    pub fn config_hash(desired: &Desired<ConfigMap>, config: &OperatorConfig) -> Result<String> {
        let key = Self::data_key(config);
        desired
            .object()
            .data
            .as_ref()
            .and_then(|data| data.get(&key))
            .map(sha256_hex)
            .ok_or_else(|| Error::MissingData(format!("configmap has no {key} entry")))
    }

    pub async fn publish(
        &mut self,
        client: Client,
        config: &OperatorConfig,
        desired: &Desired<ConfigMap>,
    ) -> Result<()> {
        debug!(msg = "publishing configmap", configmap = %self.reference);
        let api: Api<ConfigMap> = Api::namespaced(client, &self.reference.namespace);
        apply(&api, desired.object(), DEX_OPERATOR_NAME).await?;
        self.observed = Some(
            wait_for_object(
                &api,
                &self.reference.name,
                config.wait_interval,
                config.wait_timeout,
            )
            .await?,
        );
        Ok(())
    }

    pub async fn delete(&mut self, client: Client) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(client, &self.reference.namespace);
        delete_opt(&api, &self.reference.name, &DeleteParams::default()).await?;
        self.observed = None;
        Ok(())
    }
}

#[cfg(test)]
impl DexConfigMap {
    pub fn with_observed(reference: NamespacedName, observed: Option<ConfigMap>) -> Self {
        Self {
            reference,
            observed,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::dex::crd::{LdapConnectorSpec, LdapUserSearch};
    use crate::dex::reconcile::passwords::StaticClientsPasswords;

    fn connector(name: &str, spec: LdapConnectorSpec) -> LdapConnector {
        LdapConnector::new(name, spec)
    }

    fn static_client(name: &str) -> DexStaticClient {
        DexStaticClient {
            name: name.to_string(),
            redirect_urls: vec!["https://a/cb".to_string()],
            public: false,
        }
    }

    fn passwords(names: &[&str]) -> StaticClientsPasswords {
        StaticClientsPasswords::with_generated("kubic-dex", "kube-system", names)
    }

    #[test]
    fn test_render_dex_config() {
        let config = OperatorConfig::default();
        let connectors = vec![
            connector(
                "openldap",
                LdapConnectorSpec {
                    server: "ldap.example.com:389".to_string(),
                    bind_dn: "cn=admin".to_string(),
                    user: LdapUserSearch {
                        base_dn: "ou=People".to_string(),
                        ..LdapUserSearch::default()
                    },
                    ..LdapConnectorSpec::default()
                },
            ),
            connector(
                "ad",
                LdapConnectorSpec {
                    name: "Active Directory".to_string(),
                    id: "ad-id".to_string(),
                    server: "ad.example.com:636".to_string(),
                    ..LdapConnectorSpec::default()
                },
            ),
        ];
        let clients = vec![static_client("app1"), static_client("kubernetes")];
        let passwords = passwords(&["app1", "kubernetes"]);

        let rendered = render_dex_config(
            &config,
            "https://dex.example.com:32000",
            &connectors,
            &clients,
            &passwords,
        )
        .unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();

        assert_eq!(value["issuer"], "https://dex.example.com:32000");
        assert_eq!(value["storage"]["type"], "kubernetes");
        assert_eq!(value["storage"]["config"]["inCluster"], true);
        assert_eq!(value["web"]["https"], "0.0.0.0:5556");
        assert_eq!(value["web"]["tlsCert"], "/etc/dex/tls/tls.crt");
        assert_eq!(value["oauth2"]["skipApprovalScreen"], true);

        let static_clients = value["staticClients"].as_sequence().unwrap();
        assert_eq!(static_clients.len(), 2);
        assert_eq!(static_clients[0]["id"], "app1");
        assert_eq!(
            static_clients[0]["secret"],
            passwords.get("app1").unwrap().contents()
        );
        assert_eq!(static_clients[0]["redirectURIs"][0], "https://a/cb");

        // sorted by object name
        let connectors = value["connectors"].as_sequence().unwrap();
        assert_eq!(connectors[0]["id"], "ad-id");
        assert_eq!(connectors[0]["name"], "Active Directory");
        assert_eq!(connectors[1]["id"], "openldap");
        assert_eq!(connectors[1]["name"], "openldap");
        assert_eq!(connectors[1]["type"], "ldap");
        assert_eq!(connectors[1]["config"]["host"], "ldap.example.com:389");
        assert_eq!(connectors[1]["config"]["bindDN"], "cn=admin");
        assert_eq!(connectors[1]["config"]["userSearch"]["baseDN"], "ou=People");
    }

    #[test]
    fn test_missing_password_fails() {
        let result = render_dex_config(
            &OperatorConfig::default(),
            "https://10.0.0.5:32000",
            &[],
            &[static_client("app1")],
            &passwords(&[]),
        );
        assert!(matches!(result, Err(Error::MissingData(_))));
    }

    #[test]
    fn test_root_ca_data() {
        let pem = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----";
        let with_pem = connector(
            "ldap",
            LdapConnectorSpec {
                root_ca_data: pem.to_string(),
                ..LdapConnectorSpec::default()
            },
        );
        assert_eq!(
            root_ca_data(&with_pem).unwrap(),
            Some(base64_encode(pem))
        );

        let encoded = base64_encode(pem);
        let with_base64 = connector(
            "ldap",
            LdapConnectorSpec {
                root_ca_data: encoded.clone(),
                ..LdapConnectorSpec::default()
            },
        );
        assert_eq!(root_ca_data(&with_base64).unwrap(), Some(encoded));

        let invalid = connector(
            "ldap",
            LdapConnectorSpec {
                root_ca_data: "not base64!".to_string(),
                ..LdapConnectorSpec::default()
            },
        );
        assert!(root_ca_data(&invalid).is_err());
        assert_eq!(
            root_ca_data(&connector("ldap", LdapConnectorSpec::default())).unwrap(),
            None
        );
    }

    #[test]
    fn test_create_local_and_hash() {
        let config = OperatorConfig::default();
        let configmap = DexConfigMap {
            reference: NamespacedName::new("kube-system", "kubic-dex-cm"),
            observed: None,
        };
        let desired = configmap
            .create_local(&config, &BTreeMap::new(), "issuer: a\n".to_string())
            .unwrap();
        assert_eq!(desired.object().name_any(), "kubic-dex-cm");
        assert!(desired.object().data.as_ref().unwrap().contains_key("config.yaml"));
        assert_eq!(configmap.needs_create_or_update(&desired), NeedsUpdate::Create);
        assert_eq!(
            DexConfigMap::config_hash(&desired, &config).unwrap(),
            sha256_hex("issuer: a\n")
        );

        let published = DexConfigMap {
            observed: Some(desired.object().clone()),
            ..configmap.clone()
        };
        assert_eq!(
            published.needs_create_or_update(&desired),
            NeedsUpdate::UpToDate
        );
        let changed = configmap
            .create_local(&config, &BTreeMap::new(), "issuer: b\n".to_string())
            .unwrap();
        assert_eq!(published.needs_create_or_update(&changed), NeedsUpdate::Update);
        assert_ne!(
            DexConfigMap::config_hash(&desired, &config).unwrap(),
            DexConfigMap::config_hash(&changed, &config).unwrap()
        );
    }
}
