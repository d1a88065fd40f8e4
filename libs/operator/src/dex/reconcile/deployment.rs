use super::certificate::DexCertificate;
use super::cluster::{
    self, APP_LABEL, CLUSTER_SERVICE_LABEL, DEX_PORT, DEX_PORT_NAME, SERVICE_ACCOUNT_NAME,
};
use super::configmap::DexConfigMap;
use super::generated::{ContentHash, Desired, NeedsUpdate, SPEC_HASH_ANNOTATION, diff};
use super::{DEX_OPERATOR_NAME, TeardownReport};

use crate::config::OperatorConfig;
use crate::dex::crd::DexConfiguration;
use crate::metrics::ControllerMetrics;
use crate::template::{basename, dirname};

use dexop_k8s_util::error::{Error, Result};
use dexop_k8s_util::names::NamespacedName;
use dexop_k8s_util::resources::{apply, get_opt};
use dexop_k8s_util::wait::{wait_for_deletion, wait_for_object};

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction, KeyToPath, PodSpec,
    PodTemplateSpec, Probe, SecretVolumeSource, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::api::{Api, DeleteParams, ObjectMeta};
use kube::client::Client;
use tracing::{debug, info, warn};

pub const CONFIGMAP_HASH_ANNOTATION: &str = "kubic.opensuse.org/configmap-hash";
pub const CERTIFICATE_HASH_ANNOTATION: &str = "kubic.opensuse.org/certificate-hash";
const CONTAINER_NAME: &str = "dex";
const DEX_COMMAND: &str = "/usr/bin/caasp-dex";
const CONFIG_VOLUME: &str = "config";
const TLS_VOLUME: &str = "tls";
const HEALTH_PATH: &str = "/healthz";

fn tolerations() -> Vec<Toleration> {
    vec![
        Toleration {
            key: Some("node-role.kubernetes.io/master".to_string()),
            operator: Some("Exists".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Toleration::default()
        },
        Toleration {
            key: Some("CriticalAddonsOnly".to_string()),
            operator: Some("Exists".to_string()),
            ..Toleration::default()
        },
    ]
}

fn https_probe(initial_delay_seconds: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(HEALTH_PATH.to_string()),
            port: IntOrString::String(DEX_PORT_NAME.to_string()),
            scheme: Some("HTTPS".to_string()),
            ..HTTPGetAction::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        period_seconds: Some(10),
        ..Probe::default()
    }
}

/// The Dex Deployment and the objects it runs with.
#[derive(Clone, Debug)]
pub struct DexDeployment {
    reference: NamespacedName,
    observed: Option<Deployment>,
}

impl DexDeployment {
    /// Load the Deployment recorded in status, or the default one.
    pub async fn load(client: Client, dex: &DexConfiguration, config: &OperatorConfig) -> Result<Self> {
        let recorded = dex
            .status
            .as_ref()
            .and_then(|s| s.deployment.as_deref())
            .and_then(|s| {
                s.parse::<NamespacedName>()
                    .map_err(|e| warn!(msg = "ignoring invalid deployment reference in status", %e))
                    .ok()
            });
        let reference = recorded
            .unwrap_or_else(|| NamespacedName::new(&config.namespace, config.deployment_name()));
        let api: Api<Deployment> = Api::namespaced(client, &reference.namespace);
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
    pub fn is_running(&self) -> bool {
        self.observed.is_some()
    }

    /// Certificate digest the running pods were started with.
    pub fn certificate_hash(&self) -> Option<&str> {
        self.observed
            .as_ref()
            .and_then(|d| d.spec.as_ref())
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref())
            .and_then(|a| a.get(CERTIFICATE_HASH_ANNOTATION))
            .map(String::as_str)
    }

    pub fn create_local(
        &self,
        dex: &DexConfiguration,
        config: &OperatorConfig,
        labels: &BTreeMap<String, String>,
        configmap: (&NamespacedName, &str),
        certificate: &DexCertificate,
    ) -> Result<Desired<Deployment>> {
        let (configmap_name, configmap_hash) = configmap;
        let certificate_name = certificate.reference();
        if certificate_name.namespace != self.reference.namespace {
            return Err(Error::InvariantViolation(format!(
                "certificate {certificate_name} must live in the namespace of deployment {}",
                self.reference
            )));
        }
        if configmap_name.namespace != self.reference.namespace {
            return Err(Error::InvariantViolation(format!(
                "configmap {configmap_name} must live in the namespace of deployment {}",
                self.reference
            )));
        }

        let image = dex
            .spec
            .image
            .clone()
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| config.image.clone());
        let replicas = dex.spec.replicas.unwrap_or(config.replicas);
        let config_key = DexConfigMap::data_key(config);

        let selector = BTreeMap::from([(APP_LABEL.to_string(), self.reference.name.clone())]);
        let pod_labels = labels
            .clone()
            .into_iter()
            .chain(selector.clone())
            .collect::<BTreeMap<_, _>>();
        let deployment_labels = pod_labels
            .clone()
            .into_iter()
            .chain([(CLUSTER_SERVICE_LABEL.to_string(), "true".to_string())])
            .collect::<BTreeMap<_, _>>();

        let mut deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(self.reference.name.clone()),
                namespace: Some(self.reference.namespace.clone()),
                labels: Some(deployment_labels),
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                selector: LabelSelector {
                    match_labels: Some(selector),
                    ..LabelSelector::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        annotations: Some(BTreeMap::from([
                            (
                                CONFIGMAP_HASH_ANNOTATION.to_string(),
                                configmap_hash.to_string(),
                            ),
                            (CERTIFICATE_HASH_ANNOTATION.to_string(), certificate.hash()?),
                        ])),
                        ..ObjectMeta::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(SERVICE_ACCOUNT_NAME.to_string()),
                        containers: vec![Container {
                            name: CONTAINER_NAME.to_string(),
                            image: Some(image),
                            image_pull_policy: Some("IfNotPresent".to_string()),
                            command: Some(vec![DEX_COMMAND.to_string()]),
                            args: Some(vec!["serve".to_string(), config.config_filename.clone()]),
                            ports: Some(vec![ContainerPort {
                                name: Some(DEX_PORT_NAME.to_string()),
                                container_port: DEX_PORT,
                                protocol: Some("TCP".to_string()),
                                ..ContainerPort::default()
                            }]),
                            readiness_probe: Some(https_probe(5)),
                            liveness_probe: Some(https_probe(30)),
                            volume_mounts: Some(vec![
                                VolumeMount {
                                    name: CONFIG_VOLUME.to_string(),
                                    mount_path: dirname(&config.config_filename),
                                    read_only: Some(true),
                                    ..VolumeMount::default()
                                },
                                VolumeMount {
                                    name: TLS_VOLUME.to_string(),
                                    mount_path: config.certs_dir.clone(),
                                    read_only: Some(true),
                                    ..VolumeMount::default()
                                },
                            ]),
                            ..Container::default()
                        }],
                        volumes: Some(vec![
                            Volume {
                                name: CONFIG_VOLUME.to_string(),
                                config_map: Some(ConfigMapVolumeSource {
                                    name: configmap_name.name.clone(),
                                    items: Some(vec![KeyToPath {
                                        key: config_key.clone(),
                                        path: basename(&config.config_filename),
                                        ..KeyToPath::default()
                                    }]),
                                    ..ConfigMapVolumeSource::default()
                                }),
                                ..Volume::default()
                            },
                            Volume {
                                name: TLS_VOLUME.to_string(),
                                secret: Some(SecretVolumeSource {
                                    secret_name: Some(certificate_name.name.clone()),
                                    ..SecretVolumeSource::default()
                                }),
                                ..Volume::default()
                            },
                        ]),
                        tolerations: Some(tolerations()),
                        ..PodSpec::default()
                    }),
                },
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        };

        let spec_hash = deployment.content_hash()?;
        deployment
            .annotations_mut()
            .insert(SPEC_HASH_ANNOTATION.to_string(), spec_hash);
        Desired::new(deployment)
    }

    pub fn needs_create_or_update(&self, desired: &Desired<Deployment>) -> NeedsUpdate {
        diff(desired, self.observed.as_ref())
    }

    /// Publish the service account and RBAC rules, the Deployment, then the service and the
    /// network policy.
    pub async fn publish(
        &mut self,
        client: Client,
        dex: &DexConfiguration,
        config: &OperatorConfig,
        metrics: &ControllerMetrics,
        desired: &Desired<Deployment>,
    ) -> Result<()> {
        cluster::publish_access(dex, client.clone(), config).await?;

        debug!(msg = "publishing deployment", deployment = %self.reference);
        let api: Api<Deployment> = Api::namespaced(client.clone(), &self.reference.namespace);
        apply(&api, desired.object(), DEX_OPERATOR_NAME).await?;
        let published = wait_for_object(
            &api,
            &self.reference.name,
            config.wait_interval,
            config.wait_timeout,
        )
        .await?;
        if let Some(replicas) = desired.object().spec.as_ref().and_then(|s| s.replicas) {
            metrics.dex_replicas_set(&self.reference.namespace, &self.reference.name, replicas);
        }
        self.observed = Some(published);

        cluster::publish_network(dex, client, config).await
    }

    /// Remove the Deployment and every object it runs with. Failures are recorded and the
    /// remaining steps still run.
    pub async fn delete(&mut self, client: Client, config: &OperatorConfig) -> TeardownReport {
        let mut report = TeardownReport::default();
        let api: Api<Deployment> = Api::namespaced(client.clone(), &self.reference.namespace);
        if report
            .delete(&api, &self.reference.name, &DeleteParams::foreground())
            .await
        {
            info!(msg = "waiting for deployment removal", deployment = %self.reference);
            let waited = wait_for_deletion(
                &api,
                &self.reference.name,
                config.wait_interval,
                config.wait_timeout,
            )
            .await;
            report.record(format!("Deployment {}", self.reference), waited);
        }
        self.observed = None;

        cluster::delete_rbac(client.clone(), config, &mut report).await;
        cluster::delete_service_objects(client, config, &mut report).await;
        report
    }
}

#[cfg(test)]
impl DexDeployment {
    pub fn with_observed(reference: NamespacedName, observed: Option<Deployment>) -> Self {
        Self {
            reference,
            observed,
        }
    }
}
