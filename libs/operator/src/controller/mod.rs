pub mod context;

use self::context::Context;

use crate::config::OperatorConfig;
use crate::metrics;
use crate::prometheus_exporter;

use dexop_k8s_util::error::{Error, Result};
use dexop_k8s_util::types::short_type_name;

use std::fmt::Debug;
use std::sync::Arc;

use kube::Resource;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::controller::Action;
use kube::runtime::events::Recorder;
use kube::runtime::reflector::Lookup;
use serde::de::DeserializeOwned;
use tokio::time::Duration;
use tracing::error;

pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "dex-operator";

pub type ControllerId = &'static str;

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    /// Metrics
    metrics: Arc<metrics::Metrics>,
    /// Operator settings
    pub config: Arc<OperatorConfig>,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(metrics: metrics::Metrics, config: OperatorConfig) -> Self {
        Self {
            metrics: Arc::new(metrics),
            config: Arc::new(config),
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Result<String> {
        prometheus_exporter::format_prometheus_metrics().map_err(|e| {
            Error::FormattingError(format!("failed to export metrics: {e}"), std::fmt::Error)
        })
    }

    /// Create a Controller Context that can update State
    pub fn to_context<K>(&self, client: Client, controller_id: ControllerId) -> Result<Context<K>>
    where
        K: Resource + Lookup + Clone + 'static,
        <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
    {
        let metrics = self
            .metrics
            .controllers
            .get(controller_id)
            .cloned()
            .ok_or_else(|| {
                Error::MissingData(format!("controller {controller_id} has no metrics registered"))
            })?;
        Ok(Context::new(
            controller_id,
            client.clone(),
            metrics,
            Recorder::new(client, controller_id.into()),
            self.config.clone(),
        ))
    }
}

pub async fn check_api_queryable<K>(client: Client) -> Api<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let api = Api::<K>::all(client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!(
            "{} is not queryable; {e:?}. Check controller permissions and installed CRDs",
            short_type_name::<K>().unwrap_or("Unknown resource"),
        );
        std::process::exit(1);
    }
    api
}

pub fn error_policy<K>(_obj: Arc<K>, _error: &Error, _ctx: Arc<Context<K>>) -> Action
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    unreachable!("Handle in backoff_reconciler macro")
}

#[macro_export]
macro_rules! backoff_reconciler {
    ($inner_reconciler:ident) => {
        |obj, ctx| async move {
            use $crate::controller::context::BackoffContext;
            match $inner_reconciler(obj.clone(), ctx.clone()).await {
                Ok(action) => {
                    ctx.reset_backoff(kube::runtime::reflector::ObjectRef::from(obj.as_ref()))
                        .await;
                    Ok(action)
                }
                Err(error) => {
                    let name = kube::ResourceExt::name_any(obj.as_ref());
                    tracing::error!(msg = "failed reconciliation", %name, %error);
                    ctx.metrics().reconcile_failure_inc();
                    let backoff_duration = ctx
                        .get_backoff(kube::runtime::reflector::ObjectRef::from(obj.as_ref()))
                        .await;
                    tracing::trace!(
                        msg = format!("backoff duration: {backoff_duration:?}"),
                        %name,
                    );
                    Ok(kube::runtime::controller::Action::requeue(backoff_duration))
                }
            }
        }
    };
}
