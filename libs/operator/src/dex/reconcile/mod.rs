pub mod certificate;
pub mod cluster;
pub mod configmap;
pub mod deployment;
pub mod generated;
pub mod passwords;
pub mod teardown;

pub use self::teardown::TeardownReport;

use self::certificate::{DexCertificate, SubjectAltNames};
use self::configmap::{DexConfigMap, render_dex_config};
use self::deployment::DexDeployment;
use self::generated::set_owner;
use self::passwords::StaticClientsPasswords;

use crate::config::OperatorConfig;
use crate::controller::context::Context;
use crate::controller::{DEFAULT_RECONCILE_INTERVAL, INSTANCE_LABEL, MANAGED_BY, MANAGED_BY_LABEL, NAME_LABEL};
use crate::dex::crd::{
    DexConfiguration, DexConfigurationStatus, DexStaticClient, DexStaticClientStatus, LdapConnector,
};
use crate::net::bind_ip;
use crate::telemetry;

use dexop_k8s_util::error::{Error, Result};
use dexop_k8s_util::names::NamespacedName;
use dexop_k8s_util::resources::is_not_found;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, LazyLock};

use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::client::Client;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::finalizer::{Event as Finalizer, finalizer};
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{Span, debug, field, info, instrument, warn};

pub const DEX_OPERATOR_NAME: &str = "dexconfigurations.kubic.opensuse.org";
pub static DEX_FINALIZER: &str = "dexconfiguration.finalizers.kubic.opensuse.org";
/// Name of the only DexConfiguration the operator acts on.
pub const DEX_CONFIGURATION_NAME: &str = "dex-configuration";

pub const DEFAULT_CLIENT_NAME: &str = "kubernetes";
pub const DEFAULT_CLIENT_REDIRECT_URL: &str = "urn:ietf:wg:oauth:2.0:oob";

const REASON_CHECKING: &str = "Checking";
const REASON_DEPLOYING: &str = "Deploying";
const REASON_REMOVING: &str = "Removing";
const REASON_ERROR: &str = "Error";
const ACTION_RECONCILING: &str = "Reconciling";
const ACTION_DEPLOYING: &str = "Deploying";
const ACTION_DELETING: &str = "Deleting";

static LABELS: LazyLock<BTreeMap<String, String>> = LazyLock::new(|| {
    BTreeMap::from([
        (NAME_LABEL.to_string(), "dex".to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
    ])
});

impl DexConfiguration {
    #[inline]
    pub fn generate_resource_labels(&self) -> BTreeMap<String, String> {
        LABELS
            .clone()
            .into_iter()
            .chain([(INSTANCE_LABEL.to_string(), self.name_any())])
            .collect()
    }

    /// Static clients of the configuration plus the built-in `kubernetes` client.
    pub fn static_clients(&self) -> Vec<DexStaticClient> {
        let mut clients = self.spec.static_clients.clone();
        if !clients.iter().any(|c| c.name == DEFAULT_CLIENT_NAME) {
            clients.push(DexStaticClient {
                name: DEFAULT_CLIENT_NAME.to_string(),
                redirect_urls: vec![DEFAULT_CLIENT_REDIRECT_URL.to_string()],
                public: false,
            });
        }
        clients
    }

    /// Issuer URL: the first external name, or the bind address, at the node port.
    pub fn issuer(&self, config: &OperatorConfig, bind_ip: IpAddr) -> String {
        let address = self
            .spec
            .names
            .iter()
            .find(|n| !n.is_empty())
            .cloned()
            .unwrap_or_else(|| bind_ip.to_string());
        let address = match address.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{address}]"),
            _ => address,
        };
        format!(
            "https://{address}:{}",
            self.spec.node_port.unwrap_or(config.node_port)
        )
    }
}

/// Objects generated for a DexConfiguration, as currently found in the cluster.
struct DexObjects {
    passwords: StaticClientsPasswords,
    configmap: DexConfigMap,
    deployment: DexDeployment,
}

impl DexObjects {
    async fn load(
        client: Client,
        dex: &DexConfiguration,
        config: &OperatorConfig,
        static_clients: &[DexStaticClient],
    ) -> Result<Self> {
        let client_names = static_clients
            .iter()
            .map(|c| c.name.clone())
            .collect::<Vec<_>>();
        Ok(Self {
            passwords: StaticClientsPasswords::load(client.clone(), config, &client_names).await?,
            configmap: DexConfigMap::load(client.clone(), dex, config).await?,
            deployment: DexDeployment::load(client, dex, config).await?,
        })
    }

    fn static_client_statuses(&self, static_clients: &[DexStaticClient]) -> Vec<DexStaticClientStatus> {
        static_clients
            .iter()
            .map(|c| DexStaticClientStatus {
                name: c.name.clone(),
                redirect_urls: c.redirect_urls.clone(),
                password: self.passwords.reference(&c.name),
                public: c.public,
            })
            .collect()
    }
}

#[instrument(skip(ctx, dex), fields(trace_id))]
pub async fn reconcile_dex(
    dex: Arc<DexConfiguration>,
    ctx: Arc<Context<DexConfiguration>>,
) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.reconcile_count_and_measure(&trace_id);

    let name = dex.name_any();
    if name != DEX_CONFIGURATION_NAME {
        warn!(msg = "ignoring dex configuration", %name);
        ctx.publish_event(
            &dex,
            EventType::Warning,
            REASON_ERROR,
            ACTION_RECONCILING,
            format!(
                "Dex configuration instance '{name}' ignored: the only recognized instance is name={DEX_CONFIGURATION_NAME}"
            ),
        )
        .await;
        return Ok(Action::await_change());
    }

    info!(msg = "reconciling Dex configuration");
    let dex_api: Api<DexConfiguration> = Api::all(ctx.client.clone());
    finalizer(&dex_api, DEX_FINALIZER, dex, |event| async {
        match event {
            Finalizer::Apply(dex) => reconcile(dex, ctx).await,
            Finalizer::Cleanup(dex) => cleanup(dex, ctx).await,
        }
    })
    .await
    .map_err(|e| {
        Error::FinalizerError(
            "failed on dex configuration finalizer".to_string(),
            Box::new(e),
        )
    })
}

async fn reconcile(dex: Arc<DexConfiguration>, ctx: Arc<Context<DexConfiguration>>) -> Result<Action> {
    let mut status = dex.status.clone().unwrap_or_default();
    let result = reconcile_instance(&dex, &ctx, &mut status).await;
    if let Err(e) = &result {
        ctx.publish_event(
            &dex,
            EventType::Warning,
            REASON_ERROR,
            ACTION_RECONCILING,
            e.to_string(),
        )
        .await;
    }
    let status_result = patch_status(&dex, &ctx, &status).await;
    result?;
    status_result?;
    Ok(Action::requeue(DEFAULT_RECONCILE_INTERVAL))
}

async fn cleanup(dex: Arc<DexConfiguration>, ctx: Arc<Context<DexConfiguration>>) -> Result<Action> {
    info!(msg = "removing Dex configuration");
    let mut status = dex.status.clone().unwrap_or_default();
    let static_clients = dex.static_clients();
    let mut objects =
        DexObjects::load(ctx.client.clone(), &dex, &ctx.config, &static_clients).await?;
    reconcile_removal(&dex, &ctx, &mut objects, &mut status).await;
    status.num_connectors = 0;
    // the object is going away: a failed status update must not keep the finalizer around
    let _ignore_errors = patch_status(&dex, &ctx, &status)
        .await
        .map_err(|e| debug!(msg = "failed to update status on removal", %e));
    Ok(Action::await_change())
}

/// Bring the Dex objects in line with the configuration and the LDAP connectors.
async fn reconcile_instance(
    dex: &DexConfiguration,
    ctx: &Context<DexConfiguration>,
    status: &mut DexConfigurationStatus,
) -> Result<()> {
    let client = ctx.client.clone();
    let config = ctx.config.as_ref();
    let instance = dex.name_any();
    let labels = dex.generate_resource_labels();

    let connectors = Api::<LdapConnector>::all(client.clone())
        .list(&ListParams::default())
        .await
        .map_err(|e| Error::KubeError("failed to list LDAP connectors".to_string(), Box::new(e)))?
        .items;
    let static_clients = dex.static_clients();
    let mut objects = DexObjects::load(client.clone(), dex, config, &static_clients).await?;

    if connectors.is_empty() {
        status.num_connectors = 0;
        if objects.deployment.is_running() || status.deployment.is_some() {
            info!(msg = "no LDAP connectors left, removing Dex");
            reconcile_removal(dex, ctx, &mut objects, status).await;
        } else {
            debug!(msg = "no LDAP connectors, nothing to deploy");
            // the objects around the Deployment may outlive an interrupted removal
            let report = objects.deployment.delete(client, config).await;
            if !report.is_complete() {
                ctx.metrics.teardown_failures_inc(report.failures.len());
            }
        }
        return Ok(());
    }
    status.num_connectors = i32::try_from(connectors.len()).unwrap_or(i32::MAX);

    let bind_ip = bind_ip(config)?;
    let dex_config = render_dex_config(
        config,
        &dex.issuer(config, bind_ip),
        &connectors,
        &static_clients,
        &objects.passwords,
    )?;
    let mut configmap = objects.configmap.create_local(config, &labels, dex_config)?;
    set_owner(dex, &mut configmap)?;
    let configmap_hash = DexConfigMap::config_hash(&configmap, config)?;
    let configmap_update = objects.configmap.needs_create_or_update(&configmap);

    let mut certificate = DexCertificate::load(client.clone(), dex, config, &labels).await?;
    set_owner(dex, &mut certificate)?;

    let certificate_unchanged = certificate.is_present()
        && certificate.hash().ok().as_deref() == objects.deployment.certificate_hash();
    if !configmap_update.required() && objects.deployment.is_running() && certificate_unchanged {
        debug!(msg = "Dex deployment is up to date");
        if certificate.is_operator_owned() {
            status.generated_certificate = Some(certificate.as_secret_reference());
        }
        status.config = Some(objects.configmap.reference().to_string());
        status.deployment = Some(objects.deployment.reference().to_string());
        status.static_clients = objects.static_client_statuses(&static_clients);
        return Ok(());
    }

    if configmap_update.required() {
        ctx.publish_event(
            dex,
            EventType::Normal,
            REASON_CHECKING,
            ACTION_RECONCILING,
            format!(
                "ConfigMap '{}' for '{instance}' has changed",
                objects.configmap.reference()
            ),
        )
        .await;
    }

    let sans = SubjectAltNames::for_dex(config, &dex.spec.names, bind_ip);
    certificate.get_or_request(client.clone(), config, &sans).await?;
    if certificate.is_operator_owned() {
        status.generated_certificate = Some(certificate.as_secret_reference());
    }

    let mut deployment = objects.deployment.create_local(
        dex,
        config,
        &labels,
        (objects.configmap.reference(), configmap_hash.as_str()),
        &certificate,
    )?;
    set_owner(dex, &mut deployment)?;
    let deployment_update = objects.deployment.needs_create_or_update(&deployment);
    if !configmap_update.required() && !deployment_update.required() {
        debug!(msg = "Dex deployment is up to date");
        status.config = Some(objects.configmap.reference().to_string());
        status.deployment = Some(objects.deployment.reference().to_string());
        status.static_clients = objects.static_client_statuses(&static_clients);
        return Ok(());
    }

    if deployment_update.required() {
        ctx.publish_event(
            dex,
            EventType::Normal,
            REASON_CHECKING,
            ACTION_RECONCILING,
            format!(
                "Deployment '{}' for '{instance}' needs to be updated",
                objects.deployment.reference()
            ),
        )
        .await;
    }
    ctx.publish_event(
        dex,
        EventType::Normal,
        REASON_DEPLOYING,
        ACTION_DEPLOYING,
        format!("Deploying '{}' for '{instance}'", objects.deployment.reference()),
    )
    .await;

    let owner = dex.controller_owner_ref(&());
    objects
        .passwords
        .publish(client.clone(), &labels, owner.as_ref())
        .await?;
    status.static_clients = objects.static_client_statuses(&static_clients);
    ctx.publish_event(
        dex,
        EventType::Normal,
        REASON_DEPLOYING,
        ACTION_DEPLOYING,
        format!("Created {} Secrets for shared passwords", objects.passwords.len()),
    )
    .await;

    objects
        .configmap
        .publish(client.clone(), config, &configmap)
        .await?;
    status.config = Some(objects.configmap.reference().to_string());
    ctx.publish_event(
        dex,
        EventType::Normal,
        REASON_DEPLOYING,
        ACTION_DEPLOYING,
        format!("ConfigMap '{}' published", objects.configmap.reference()),
    )
    .await;

    objects
        .deployment
        .publish(client, dex, config, &ctx.metrics, &deployment)
        .await?;
    status.deployment = Some(objects.deployment.reference().to_string());
    ctx.publish_event(
        dex,
        EventType::Normal,
        REASON_DEPLOYING,
        ACTION_DEPLOYING,
        format!("Deployment '{}' published", objects.deployment.reference()),
    )
    .await;
    info!(msg = "Dex deployed", deployment = %objects.deployment.reference());
    Ok(())
}

/// Remove every object generated for the configuration. Failures are published as events and
/// do not stop the removal.
async fn reconcile_removal(
    dex: &DexConfiguration,
    ctx: &Context<DexConfiguration>,
    objects: &mut DexObjects,
    status: &mut DexConfigurationStatus,
) -> TeardownReport {
    let client = ctx.client.clone();
    let instance = dex.name_any();
    ctx.publish_event(
        dex,
        EventType::Normal,
        REASON_REMOVING,
        ACTION_DELETING,
        format!("Removing all the dependencies for '{instance}'"),
    )
    .await;

    let mut report = TeardownReport::default();
    if objects.deployment.is_running() || status.deployment.is_some() {
        let deployment_report = objects.deployment.delete(client.clone(), &ctx.config).await;
        // kept until everything around the Deployment is gone, so the removal is retried
        if deployment_report.is_complete() {
            status.deployment = None;
        }
        report.extend(deployment_report.failures);
    }
    if objects.configmap.is_present() || status.config.is_some() {
        let removed = objects.configmap.delete(client.clone()).await;
        report.record(format!("ConfigMap {}", objects.configmap.reference()), removed);
        status.config = None;
    }
    report.extend(objects.passwords.delete(client.clone()).await);
    status.static_clients.clear();
    let supplied = dex
        .spec
        .certificate
        .as_ref()
        .and_then(NamespacedName::from_secret_reference);
    // a certificate supplied by the user is never removed, even if it was recorded as generated
    let generated = status.generated_certificate.take().filter(|reference| {
        supplied.is_none() || NamespacedName::from_secret_reference(reference) != supplied
    });
    if let Some(reference) = generated {
        let removed = DexCertificate::delete_generated(client, &reference)
            .await
            .map(|_| ());
        report.record(
            format!(
                "Secret {}/{}",
                reference.namespace.as_deref().unwrap_or_default(),
                reference.name.as_deref().unwrap_or_default()
            ),
            removed,
        );
    }

    if report.is_complete() {
        info!(msg = "Dex removed", %instance);
    } else {
        ctx.metrics.teardown_failures_inc(report.failures.len());
        for (object, e) in report.failures.iter() {
            ctx.publish_event(
                dex,
                EventType::Warning,
                REASON_ERROR,
                ACTION_DELETING,
                format!("Failed to remove {object}: {e}"),
            )
            .await;
        }
    }
    report
}

/// Persist `status` with server-side apply. Ignored when the configuration is already gone.
async fn patch_status(
    dex: &DexConfiguration,
    ctx: &Context<DexConfiguration>,
    status: &DexConfigurationStatus,
) -> Result<()> {
    let dex_api: Api<DexConfiguration> = Api::all(ctx.client.clone());
    let patch = Patch::Apply(json!({
        "apiVersion": DexConfiguration::api_version(&()),
        "kind": DexConfiguration::kind(&()),
        "status": status,
    }));
    match dex_api
        .patch_status(
            &dex.name_any(),
            &PatchParams::apply(DEX_OPERATOR_NAME).force(),
            &patch,
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => {
            debug!(msg = "dex configuration gone before its status was updated");
            Ok(())
        }
        Err(e) => {
            ctx.metrics.status_update_errors_inc();
            Err(Error::KubeError(
                "failed to update dex configuration status".to_string(),
                Box::new(e),
            ))
        }
    }
}
