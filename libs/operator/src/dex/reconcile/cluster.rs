//! Objects Dex needs around its Deployment: service account, RBAC rules, the node port
//! service and the egress network policy.

use super::{DEX_OPERATOR_NAME, TeardownReport};

use crate::config::OperatorConfig;
use crate::dex::crd::DexConfiguration;

use dexop_k8s_util::error::{Error, Result};
use dexop_k8s_util::resources::apply;
use dexop_k8s_util::wait::wait_for_object;

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::core::v1::{Service, ServiceAccount, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ObjectMeta};
use kube::client::Client;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

pub const SERVICE_NAME: &str = "kubic-dex";
pub const SERVICE_ACCOUNT_NAME: &str = "kubic-dex";
pub const NETWORK_POLICY_NAME: &str = "kubic-dex-networkpolicy";
pub const CLUSTER_ROLE_NAME: &str = "kubic:dex";
pub const READ_SERVICE_ROLE_NAME: &str = "kubic:dex:read-service";
pub const CLUSTER_ROLE_BINDING_NAME: &str = "kubic:dex";
pub const ADMINISTRATORS_BINDING_NAME: &str = "kubic:dex:ldap-administrators";
pub const ROLE_BINDING_NAME: &str = "kubic:dex";
pub const DEX_PORT: i32 = 5556;
pub const DEX_PORT_NAME: &str = "https";
pub const APP_LABEL: &str = "app";
pub const CLUSTER_SERVICE_LABEL: &str = "kubernetes.io/cluster-service";
const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
const CLUSTER_ADMIN_ROLE: &str = "cluster-admin";
// LDAP, API server and DNS
const EGRESS_PORTS: [(&str, i32); 4] = [("TCP", 389), ("TCP", 6444), ("TCP", 53), ("UDP", 53)];

/// Selector matching the Dex pods.
#[inline]
pub fn pod_selector(config: &OperatorConfig) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), config.deployment_name())])
}

fn rule(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(api_groups.iter().map(|s| s.to_string()).collect()),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        verbs: verbs.iter().map(|s| s.to_string()).collect(),
        ..PolicyRule::default()
    }
}

fn read_service_rule() -> PolicyRule {
    PolicyRule {
        resource_names: Some(vec![SERVICE_NAME.to_string()]),
        ..rule(&[""], &["services"], &["get"])
    }
}

fn role_ref(kind: &str, name: &str) -> RoleRef {
    RoleRef {
        api_group: RBAC_API_GROUP.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

fn group(name: &str) -> Subject {
    Subject {
        api_group: Some(RBAC_API_GROUP.to_string()),
        kind: "Group".to_string(),
        name: name.to_string(),
        namespace: None,
    }
}

pub trait ClusterObjectsExt {
    fn object_meta(&self, name: &str, namespace: Option<&str>) -> ObjectMeta;
    fn create_service_account(&self, config: &OperatorConfig) -> ServiceAccount;
    fn create_cluster_roles(&self) -> Vec<ClusterRole>;
    fn create_roles(&self, config: &OperatorConfig) -> Vec<Role>;
    fn create_cluster_role_bindings(&self, config: &OperatorConfig) -> Vec<ClusterRoleBinding>;
    fn create_role_bindings(&self, config: &OperatorConfig) -> Vec<RoleBinding>;
    fn create_service(&self, config: &OperatorConfig) -> Service;
    fn create_network_policy(&self, config: &OperatorConfig) -> Result<NetworkPolicy>;
}

impl ClusterObjectsExt for DexConfiguration {
    fn object_meta(&self, name: &str, namespace: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(str::to_string),
            labels: Some(self.generate_resource_labels()),
            owner_references: self.controller_owner_ref(&()).map(|oref| vec![oref]),
            ..ObjectMeta::default()
        }
    }

    fn create_service_account(&self, config: &OperatorConfig) -> ServiceAccount {
        let mut metadata = self.object_meta(SERVICE_ACCOUNT_NAME, Some(&config.namespace));
        metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(CLUSTER_SERVICE_LABEL.to_string(), "true".to_string());
        ServiceAccount {
            metadata,
            ..ServiceAccount::default()
        }
    }

    fn create_cluster_roles(&self) -> Vec<ClusterRole> {
        vec![
            ClusterRole {
                metadata: self.object_meta(CLUSTER_ROLE_NAME, None),
                rules: Some(vec![
                    rule(&["dex.coreos.com"], &["*"], &["*"]),
                    rule(
                        &["apiextensions.k8s.io"],
                        &["customresourcedefinitions"],
                        &["create"],
                    ),
                ]),
                ..ClusterRole::default()
            },
            ClusterRole {
                metadata: self.object_meta(READ_SERVICE_ROLE_NAME, None),
                rules: Some(vec![read_service_rule()]),
                ..ClusterRole::default()
            },
        ]
    }

    fn create_roles(&self, config: &OperatorConfig) -> Vec<Role> {
        vec![Role {
            metadata: self.object_meta(READ_SERVICE_ROLE_NAME, Some(&config.namespace)),
            rules: Some(vec![read_service_rule()]),
        }]
    }

    fn create_cluster_role_bindings(&self, config: &OperatorConfig) -> Vec<ClusterRoleBinding> {
        let admin_group = self
            .spec
            .admin_group
            .as_deref()
            .filter(|g| !g.is_empty())
            .unwrap_or(&config.admin_group);
        vec![
            ClusterRoleBinding {
                metadata: self.object_meta(CLUSTER_ROLE_BINDING_NAME, None),
                role_ref: role_ref("ClusterRole", CLUSTER_ROLE_NAME),
                subjects: Some(vec![Subject {
                    api_group: None,
                    kind: "ServiceAccount".to_string(),
                    name: SERVICE_ACCOUNT_NAME.to_string(),
                    namespace: Some(config.namespace.clone()),
                }]),
            },
            ClusterRoleBinding {
                metadata: self.object_meta(ADMINISTRATORS_BINDING_NAME, None),
                role_ref: role_ref("ClusterRole", CLUSTER_ADMIN_ROLE),
                subjects: Some(vec![group(admin_group)]),
            },
        ]
    }

    fn create_role_bindings(&self, config: &OperatorConfig) -> Vec<RoleBinding> {
        vec![RoleBinding {
            metadata: self.object_meta(ROLE_BINDING_NAME, Some(&config.namespace)),
            role_ref: role_ref("Role", READ_SERVICE_ROLE_NAME),
            subjects: Some(vec![
                group("system:authenticated"),
                group("system:unauthenticated"),
            ]),
        }]
    }

    fn create_service(&self, config: &OperatorConfig) -> Service {
        let mut metadata = self.object_meta(SERVICE_NAME, Some(&config.namespace));
        metadata.labels.get_or_insert_with(BTreeMap::new).extend([
            (CLUSTER_SERVICE_LABEL.to_string(), "true".to_string()),
            ("kubernetes.io/name".to_string(), "Dex".to_string()),
        ]);
        Service {
            metadata,
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                selector: Some(pod_selector(config)),
                ports: Some(vec![ServicePort {
                    name: Some(DEX_PORT_NAME.to_string()),
                    port: DEX_PORT,
                    target_port: Some(IntOrString::String(DEX_PORT_NAME.to_string())),
                    node_port: Some(self.spec.node_port.unwrap_or(config.node_port)),
                    protocol: Some("TCP".to_string()),
                    ..ServicePort::default()
                }]),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    fn create_network_policy(&self, config: &OperatorConfig) -> Result<NetworkPolicy> {
        let ports = EGRESS_PORTS
            .iter()
            .map(|(protocol, port)| json!({"protocol": protocol, "port": port}))
            .collect::<Vec<_>>();
        let mut network_policy: NetworkPolicy = serde_json::from_value(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "NetworkPolicy",
            "metadata": { "name": NETWORK_POLICY_NAME },
            "spec": {
                "podSelector": { "matchLabels": pod_selector(config) },
                "policyTypes": ["Egress"],
                "egress": [{ "ports": ports }]
            }
        }))
        .map_err(|e| Error::SerializationError("failed to build network policy".to_string(), e))?;
        network_policy.metadata = self.object_meta(NETWORK_POLICY_NAME, Some(&config.namespace));
        Ok(network_policy)
    }
}

async fn apply_all<K>(api: &Api<K>, objects: Vec<K>, config: &OperatorConfig) -> Result<()>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    for object in objects {
        apply(api, &object, DEX_OPERATOR_NAME).await?;
        wait_for_object(api, &object.name_any(), config.wait_interval, config.wait_timeout)
            .await?;
    }
    Ok(())
}

/// Publish the service account and the RBAC rules Dex runs with.
pub async fn publish_access(dex: &DexConfiguration, client: Client, config: &OperatorConfig) -> Result<()> {
    debug!(msg = "publishing service account and RBAC rules");
    let namespace = config.namespace.as_str();
    apply_all(
        &Api::namespaced(client.clone(), namespace),
        vec![dex.create_service_account(config)],
        config,
    )
    .await?;
    apply_all(&Api::all(client.clone()), dex.create_cluster_roles(), config).await?;
    apply_all(
        &Api::namespaced(client.clone(), namespace),
        dex.create_roles(config),
        config,
    )
    .await?;
    apply_all(
        &Api::all(client.clone()),
        dex.create_cluster_role_bindings(config),
        config,
    )
    .await?;
    apply_all(
        &Api::namespaced(client, namespace),
        dex.create_role_bindings(config),
        config,
    )
    .await
}

/// Publish the node port service and the network policy of the Dex pods.
pub async fn publish_network(dex: &DexConfiguration, client: Client, config: &OperatorConfig) -> Result<()> {
    debug!(msg = "publishing service and network policy");
    let namespace = config.namespace.as_str();
    apply_all(
        &Api::namespaced(client.clone(), namespace),
        vec![dex.create_service(config)],
        config,
    )
    .await?;
    apply_all(
        &Api::namespaced(client, namespace),
        vec![dex.create_network_policy(config)?],
        config,
    )
    .await
}

/// Delete RBAC rules, bindings first.
pub async fn delete_rbac(client: Client, config: &OperatorConfig, report: &mut TeardownReport) {
    let namespace = config.namespace.as_str();
    let dp = DeleteParams::default();
    let cluster_role_bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
    for name in [CLUSTER_ROLE_BINDING_NAME, ADMINISTRATORS_BINDING_NAME] {
        report.delete(&cluster_role_bindings, name, &dp).await;
    }
    let role_bindings: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
    report.delete(&role_bindings, ROLE_BINDING_NAME, &dp).await;
    let cluster_roles: Api<ClusterRole> = Api::all(client.clone());
    for name in [CLUSTER_ROLE_NAME, READ_SERVICE_ROLE_NAME] {
        report.delete(&cluster_roles, name, &dp).await;
    }
    let roles: Api<Role> = Api::namespaced(client, namespace);
    report.delete(&roles, READ_SERVICE_ROLE_NAME, &dp).await;
}

/// Delete the service account, the service and the network policy.
pub async fn delete_service_objects(
    client: Client,
    config: &OperatorConfig,
    report: &mut TeardownReport,
) {
    let namespace = config.namespace.as_str();
    let dp = DeleteParams::default();
    let service_accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    report.delete(&service_accounts, SERVICE_ACCOUNT_NAME, &dp).await;
    let services: Api<Service> = Api::namespaced(client.clone(), namespace);
    report.delete(&services, SERVICE_NAME, &dp).await;
    let network_policies: Api<NetworkPolicy> = Api::namespaced(client, namespace);
    report.delete(&network_policies, NETWORK_POLICY_NAME, &dp).await;
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::dex::crd::DexConfigurationSpec;

    fn dex() -> DexConfiguration {
        let mut dex = DexConfiguration::new(
            "dex-configuration",
            DexConfigurationSpec {
                node_port: Some(32001),
                admin_group: Some("admins".to_string()),
                ..DexConfigurationSpec::default()
            },
        );
        dex.meta_mut().uid = Some("1234".to_string());
        dex
    }

    #[test]
    fn test_service() {
        let service = dex().create_service(&OperatorConfig::default());
        assert_eq!(service.name_any(), SERVICE_NAME);
        assert_eq!(service.namespace().as_deref(), Some("kube-system"));
        assert_eq!(service.labels().get("kubernetes.io/name").unwrap(), "Dex");
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        assert_eq!(
            spec.selector.unwrap().get(APP_LABEL).unwrap(),
            "kubic-dex-deploy"
        );
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, DEX_PORT);
        assert_eq!(port.node_port, Some(32001));
        assert_eq!(service.metadata.owner_references.unwrap().len(), 1);
    }

    #[test]
    fn test_service_default_node_port() {
        let mut dex = dex();
        dex.spec.node_port = None;
        let service = dex.create_service(&OperatorConfig::default());
        assert_eq!(service.spec.unwrap().ports.unwrap()[0].node_port, Some(32000));
    }

    #[test]
    fn test_cluster_role_bindings() {
        let bindings = dex().create_cluster_role_bindings(&OperatorConfig::default());
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].role_ref.name, CLUSTER_ROLE_NAME);
        assert_eq!(
            bindings[0].subjects.as_ref().unwrap()[0].namespace.as_deref(),
            Some("kube-system")
        );
        assert_eq!(bindings[1].role_ref.name, "cluster-admin");
        assert_eq!(bindings[1].subjects.as_ref().unwrap()[0].name, "admins");

        let mut dex = dex();
        dex.spec.admin_group = None;
        let bindings = dex.create_cluster_role_bindings(&OperatorConfig::default());
        assert_eq!(
            bindings[1].subjects.as_ref().unwrap()[0].name,
            "Administrators"
        );
    }

    #[test]
    fn test_network_policy() {
        let policy = dex()
            .create_network_policy(&OperatorConfig::default())
            .unwrap();
        assert_eq!(policy.name_any(), NETWORK_POLICY_NAME);
        let spec = serde_json::to_value(policy.spec.unwrap()).unwrap();
        assert_eq!(spec["policyTypes"], json!(["Egress"]));
        assert_eq!(
            spec["podSelector"]["matchLabels"][APP_LABEL],
            "kubic-dex-deploy"
        );
        let ports = spec["egress"][0]["ports"].as_array().unwrap();
        assert_eq!(ports.len(), 4);
        assert_eq!(ports[0], json!({"protocol": "TCP", "port": 389}));
        assert_eq!(ports[3], json!({"protocol": "UDP", "port": 53}));
    }

    #[test]
    fn test_roles_are_namespaced() {
        let config = OperatorConfig::default();
        let roles = dex().create_roles(&config);
        assert_eq!(roles[0].namespace().as_deref(), Some("kube-system"));
        let rules = roles[0].rules.as_ref().unwrap();
        assert_eq!(rules[0].resource_names, Some(vec![SERVICE_NAME.to_string()]));
        assert!(dex().create_cluster_roles()[0].namespace().is_none());
    }
}
