use k8s_openapi::api::core::v1::SecretReference;
use kube::CustomResource;
#[cfg(feature = "schemars")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster-wide configuration of the Dex identity broker. Only the instance named
/// `dex-configuration` is reconciled.
/// More info:
/// https://github.com/kubernetes/community/blob/master/contributors/devel/sig-architecture/api-conventions.md#spec-and-status
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "kubic.opensuse.org",
    version = "v1beta1",
    kind = "DexConfiguration",
    plural = "dexconfigurations",
    singular = "dexconfiguration",
    shortname = "dexcfg",
    category = "kubic",
    status = "DexConfigurationStatus",
    doc = r#"The DexConfiguration custom resource definition (CRD) defines the Dex deployment of the
    cluster. It is a cluster scoped singleton: the only recognized instance is `dex-configuration`."#,
    printcolumn = r#"{"name":"Connectors","type":"integer","jsonPath":".status.numConnectors"}"#,
    printcolumn = r#"{"name":"Deployment","type":"string","jsonPath":".status.deployment"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct DexConfigurationSpec {
    /// External names (FQDNs or IPs) Dex is reachable at. The first one is used as the issuer
    /// address; all of them are added to the generated certificate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,

    /// Node port exposing Dex. Defaults to the operator node port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,

    /// Dex container image. Defaults to the operator image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Number of Dex replicas. Defaults to the operator replica count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// OAuth2 clients known to Dex besides the built-in `kubernetes` client. A random shared
    /// password is generated for each of them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_clients: Vec<DexStaticClient>,

    /// TLS secret to use instead of requesting a certificate from the cluster CA.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<SecretReference>,

    /// Group bound to `cluster-admin`. Defaults to `Administrators`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_group: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct DexStaticClient {
    pub name: String,

    #[serde(rename = "redirectURLs", default, skip_serializing_if = "Vec::is_empty")]
    pub redirect_urls: Vec<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub public: bool,
}

/// Most recent observed status of the Dex deployment. Read-only.
/// More info:
/// https://github.com/kubernetes/community/blob/master/contributors/devel/sig-architecture/api-conventions.md#spec-and-status
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct DexConfigurationStatus {
    /// Published ConfigMap as `namespace/name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,

    /// Published Deployment as `namespace/name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,

    /// Certificate generated by the operator. Empty when a certificate is supplied in the spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_certificate: Option<SecretReference>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_clients: Vec<DexStaticClientStatus>,

    #[serde(default)]
    pub num_connectors: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct DexStaticClientStatus {
    pub name: String,

    #[serde(rename = "redirectURLs", default, skip_serializing_if = "Vec::is_empty")]
    pub redirect_urls: Vec<String>,

    /// Secret holding the shared password of the client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<SecretReference>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub public: bool,
}

/// LDAP backend Dex authenticates users against.
/// More info:
/// https://dexidp.io/docs/connectors/ldap/
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "kubic.opensuse.org",
    version = "v1beta1",
    kind = "LDAPConnector",
    root = "LdapConnector",
    plural = "ldapconnectors",
    singular = "ldapconnector",
    shortname = "ldapc",
    category = "kubic",
    status = "LdapConnectorStatus",
    doc = r#"The LDAPConnector custom resource definition (CRD) defines an LDAP server used by Dex
    as identity backend."#,
    printcolumn = r#"{"name":"Server","type":"string","jsonPath":".spec.server"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct LdapConnectorSpec {
    /// Display name of the connector. Defaults to the object name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Connector ID. Defaults to a sanitized object name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// LDAP server as `host:port`.
    pub server: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bind_dn: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bind_pw: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username_prompt: String,

    #[serde(rename = "startTLS", default)]
    pub start_tls: bool,

    /// Root CA of the LDAP server, PEM encoded or base64 of the PEM.
    #[serde(rename = "rootCAData", default, skip_serializing_if = "String::is_empty")]
    pub root_ca_data: String,

    #[serde(default)]
    pub user: LdapUserSearch,

    #[serde(default)]
    pub group: LdapGroupSearch,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct LdapUserSearch {
    #[serde(default)]
    pub base_dn: String,
    #[serde(default)]
    pub filter: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub id_attr: String,
    #[serde(default)]
    pub email_attr: String,
    #[serde(default)]
    pub name_attr: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct LdapGroupSearch {
    #[serde(default)]
    pub base_dn: String,
    #[serde(default)]
    pub filter: String,
    #[serde(default)]
    pub user_attr: String,
    #[serde(default)]
    pub group_attr: String,
    #[serde(default)]
    pub name_attr: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
pub struct LdapConnectorStatus {}

#[cfg(test)]
mod test {
    use super::{DexConfiguration, DexConfigurationSpec, LdapConnectorSpec};

    use kube::{CustomResourceExt, Resource};
    use serde_json::json;

    #[test]
    fn test_crds_are_cluster_scoped() {
        assert_eq!(DexConfiguration::crd().spec.scope, "Cluster");
        assert_eq!(super::LdapConnector::crd().spec.scope, "Cluster");
        assert_eq!(DexConfiguration::plural(&()), "dexconfigurations");
    }

    #[test]
    fn test_dex_configuration_spec_field_names() {
        let spec: DexConfigurationSpec = serde_json::from_value(json!({
            "names": ["dex.example.com"],
            "nodePort": 32001,
            "staticClients": [
                {"name": "app1", "redirectURLs": ["https://a/cb"], "public": true}
            ],
            "certificate": {"name": "cert", "namespace": "kube-system"},
            "adminGroup": "admins"
        }))
        .unwrap();
        assert_eq!(spec.node_port, Some(32001));
        assert_eq!(spec.static_clients[0].redirect_urls, vec!["https://a/cb"]);
        assert!(spec.static_clients[0].public);
        assert_eq!(spec.admin_group.as_deref(), Some("admins"));
    }

    #[test]
    fn test_ldap_connector_spec_field_names() {
        let spec: LdapConnectorSpec = serde_json::from_value(json!({
            "server": "ldap.example.com:636",
            "bindDn": "cn=admin,dc=example,dc=com",
            "bindPw": "secret",
            "startTLS": true,
            "rootCAData": "LS0t",
            "user": {"baseDn": "ou=People,dc=example,dc=com", "idAttr": "uid"},
            "group": {"baseDn": "ou=Groups,dc=example,dc=com", "groupAttr": "member"}
        }))
        .unwrap();
        assert!(spec.start_tls);
        assert_eq!(spec.root_ca_data, "LS0t");
        assert_eq!(spec.user.id_attr, "uid");
        assert_eq!(spec.group.group_attr, "member");
        assert!(spec.name.is_empty());
    }
}
