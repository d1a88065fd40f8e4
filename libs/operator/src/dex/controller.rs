use super::crd::{DexConfiguration, LdapConnector};
use super::reconcile::{DEX_CONFIGURATION_NAME, reconcile_dex};

use crate::backoff_reconciler;
use crate::controller::{ControllerId, MANAGED_BY, MANAGED_BY_LABEL, State, check_api_queryable, error_policy};
use crate::metrics::{self, ControllerMetrics};

use dexop_k8s_util::types::short_type_name;

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::Api;
use kube::client::Client;
use kube::runtime::controller::{self, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use tokio::time::Duration;
use tracing::{debug, error, info};

pub const CONTROLLER_ID: ControllerId = "dex";

/// Every change of a watched object is a change of the singleton configuration.
fn to_configuration<K>(metrics: Arc<ControllerMetrics>) -> impl Fn(K) -> Option<ObjectRef<DexConfiguration>>
where
    K: Resource + ResourceExt,
{
    move |obj| {
        let resource_name = short_type_name::<K>().unwrap_or("Unknown");
        debug!(
            msg = format!("{resource_name} changed, trigger reconcile"),
            name = obj.name_any(),
        );
        metrics.triggered_inc(metrics::Action::Apply, resource_name);
        Some(ObjectRef::new(DEX_CONFIGURATION_NAME))
    }
}

/// Initialize Dex controller and shared state
pub async fn run(state: State, client: Client) {
    let dex = check_api_queryable::<DexConfiguration>(client.clone()).await;
    let connectors = check_api_queryable::<LdapConnector>(client.clone()).await;
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &state.config.namespace);

    let ctx = match state.to_context(client, CONTROLLER_ID) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            error!(msg = "failed to create controller context", %e);
            std::process::exit(1);
        }
    };

    info!(msg = format!("starting {CONTROLLER_ID} controller"));
    let dex_controller = Controller::new(dex, watcher::Config::default().any_semantic())
        // debounce to filter out reconcile calls that happen quick succession (only taking the latest)
        .with_config(controller::Config::default().debounce(Duration::from_millis(500)))
        .watches(
            connectors,
            watcher::Config::default().any_semantic(),
            to_configuration(ctx.metrics.clone()),
        )
        .watches(
            deployments,
            watcher::Config::default()
                .labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY}"))
                .any_semantic(),
            to_configuration(ctx.metrics.clone()),
        )
        .shutdown_on_signal()
        .run(backoff_reconciler!(reconcile_dex), error_policy, ctx.clone())
        .for_each(|res| {
            let ctx = ctx.clone();
            async move {
                if let Err(e) = res {
                    debug!(msg = "controller stream error", %e);
                    if matches!(e, controller::Error::QueueError(_)) {
                        ctx.metrics.watch_operations_failed_inc();
                    }
                }
            }
        });

    ctx.metrics.ready_set(1);
    dex_controller.await;
}
