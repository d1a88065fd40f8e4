use super::ControllerId;

use crate::config::OperatorConfig;
use crate::metrics::ControllerMetrics;

use std::collections::HashMap;
use std::sync::Arc;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use kube::client::Client;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::reflector::{Lookup, ObjectRef};
use kube::{Resource, ResourceExt};
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::{trace, warn};

/// Upper bound of the error backoff policy
const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(60);

// Context for our reconciler
#[derive(Clone)]
pub struct Context<K: Resource> {
    /// Controller ID
    pub controller_id: ControllerId,
    /// Kubernetes client
    pub client: Client,
    /// Prometheus metrics
    pub metrics: Arc<ControllerMetrics>,
    /// State of the error backoff policy per object
    error_backoff_cache: Arc<RwLock<HashMap<ObjectRef<K>, RwLock<ExponentialBackoff>>>>,
    /// Event recorder
    pub recorder: Recorder,
    /// Operator settings
    pub config: Arc<OperatorConfig>,
}

impl<K> Context<K>
where
    K: Resource + ResourceExt + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
{
    pub fn new(
        controller_id: ControllerId,
        client: Client,
        metrics: Arc<ControllerMetrics>,
        recorder: Recorder,
        config: Arc<OperatorConfig>,
    ) -> Self {
        Self {
            controller_id,
            client,
            metrics,
            recorder,
            config,
            error_backoff_cache: Arc::default(),
        }
    }
}

impl<K> Context<K>
where
    K: Resource<DynamicType = ()> + ResourceExt + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
{
    /// Publish an event attached to `obj`. Failing to publish is logged and otherwise ignored,
    /// events are informative only.
    pub async fn publish_event(
        &self,
        obj: &K,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        trace!(msg = "publishing event", reason, note);
        let _ignore_errors = self
            .recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.to_string(),
                    note: Some(note),
                    action: action.to_string(),
                    secondary: None,
                },
                &obj.object_ref(&()),
            )
            .await
            .map_err(|e| warn!(msg = "failed to publish event", reason, %e));
    }
}

#[allow(async_fn_in_trait)]
pub trait BackoffContext<K: Resource> {
    fn metrics(&self) -> &Arc<ControllerMetrics>;
    async fn get_backoff(&self, obj_ref: ObjectRef<K>) -> Duration;
    async fn reset_backoff(&self, obj_ref: ObjectRef<K>);
}

impl<K> BackoffContext<K> for Context<K>
where
    K: Resource<DynamicType = ()> + ResourceExt + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
{
    fn metrics(&self) -> &Arc<ControllerMetrics> {
        &self.metrics
    }

    /// Return next duration of the backoff policy for the given object
    async fn get_backoff(&self, obj_ref: ObjectRef<K>) -> Duration {
        {
            let read_guard = self.error_backoff_cache.read().await;
            if let Some(backoff) = read_guard.get(&obj_ref) {
                if let Some(duration) = backoff.write().await.next() {
                    return duration;
                }
            }
        }

        // Backoff policy: 1s, 2s, 4s, 8s, 16s, 32s, 60s, 60s...
        let mut backoff = ExponentialBuilder::default()
            .with_max_delay(MAX_BACKOFF_DELAY)
            .without_max_times()
            .build();
        let duration = backoff.next().unwrap_or(MAX_BACKOFF_DELAY);
        self.error_backoff_cache
            .write()
            .await
            .insert(obj_ref.clone(), RwLock::new(backoff));
        trace!(msg = "recreate backoff policy", name = obj_ref.name);
        duration
    }

    /// Reset the backoff policy for the given object
    async fn reset_backoff(&self, obj_ref: ObjectRef<K>) {
        let read_guard = self.error_backoff_cache.read().await;
        if read_guard.get(&obj_ref).is_some() {
            drop(read_guard);
            trace!(msg = "reset backoff policy", name = obj_ref.name);
            let mut write_guard = self.error_backoff_cache.write().await;
            write_guard.remove(&obj_ref);
        }
    }
}
