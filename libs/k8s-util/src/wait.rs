use crate::error::{Error, Result};
use crate::resources::get_opt;
use crate::types::short_type_name;

use std::fmt::Debug;

use backon::{ConstantBuilder, Retryable};
use kube::api::Api;
use serde::de::DeserializeOwned;
use tokio::time::Duration;
use tracing::trace;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Number of attempts that fit in `timeout` when polling every `interval`.
#[inline]
pub fn poll_attempts(interval: Duration, timeout: Duration) -> usize {
    let interval = interval.as_millis().max(1);
    (timeout.as_millis() / interval).max(1) as usize
}

/// Poll until the named object can be read from the store.
///
/// A not-found response keeps waiting, any other error is returned immediately.
pub async fn wait_for_object<K>(
    api: &Api<K>,
    name: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<K>
where
    K: Clone + DeserializeOwned + Debug,
{
    let kind = short_type_name::<K>().unwrap_or("object");
    let fetch = || async move {
        get_opt(api, name)
            .await?
            .ok_or_else(|| Error::MissingData(format!("{kind} {name} not found yet")))
    };
    fetch
        .retry(
            ConstantBuilder::default()
                .with_delay(interval)
                .with_max_times(poll_attempts(interval, timeout)),
        )
        .when(|e| matches!(e, Error::MissingData(_)))
        .notify(|_, delay| trace!(msg = "waiting for object", kind, name, ?delay))
        .await
        .map_err(|e| match e {
            Error::MissingData(_) => {
                Error::Timeout(format!("{kind} {name} not available after {timeout:?}"))
            }
            e => e,
        })
}

/// Poll until the named object is gone from the store.
pub async fn wait_for_deletion<K>(
    api: &Api<K>,
    name: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<()>
where
    K: Clone + DeserializeOwned + Debug,
{
    let kind = short_type_name::<K>().unwrap_or("object");
    let check = || async move {
        match get_opt(api, name).await? {
            Some(_) => Err(Error::MissingData(format!("{kind} {name} still present"))),
            None => Ok(()),
        }
    };
    check
        .retry(
            ConstantBuilder::default()
                .with_delay(interval)
                .with_max_times(poll_attempts(interval, timeout)),
        )
        .when(|e| matches!(e, Error::MissingData(_)))
        .notify(|_, delay| trace!(msg = "waiting for deletion", kind, name, ?delay))
        .await
        .map_err(|e| match e {
            Error::MissingData(_) => {
                Error::Timeout(format!("{kind} {name} still present after {timeout:?}"))
            }
            e => e,
        })
}

#[cfg(test)]
mod test {
    use super::{poll_attempts, wait_for_object};

    use crate::error::Error;

    use http::{Request, Response};
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::Api;
    use kube::{Client, client::Body};
    use serde_json::json;
    use tokio::time::Duration;

    #[test]
    fn test_poll_attempts() {
        assert_eq!(
            poll_attempts(Duration::from_secs(2), Duration::from_secs(300)),
            150
        );
        assert_eq!(poll_attempts(Duration::from_secs(5), Duration::from_secs(1)), 1);
    }

    fn not_found() -> Response<Body> {
        let body = json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": "configmaps \"cm\" not found",
            "reason": "NotFound",
            "code": 404
        });
        Response::builder()
            .status(404)
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_object_retries_not_found() {
        let (mock_service, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let api: Api<ConfigMap> = Api::namespaced(client, "kube-system");

        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let (request, send) = handle.next_request().await.expect("service not called");
                assert_eq!(request.uri().path(), "/api/v1/namespaces/kube-system/configmaps/cm");
                send.send_response(not_found());
            }
            let (_, send) = handle.next_request().await.expect("service not called");
            let cm = json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "cm", "namespace": "kube-system"}
            });
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&cm).unwrap()))
                    .unwrap(),
            );
        });

        let cm = wait_for_object(&api, "cm", Duration::from_secs(2), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cm.metadata.name.as_deref(), Some("cm"));
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_object_times_out() {
        let (mock_service, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let api: Api<ConfigMap> = Api::namespaced(client, "kube-system");

        tokio::spawn(async move {
            while let Some((_, send)) = handle.next_request().await {
                send.send_response(not_found());
            }
        });

        let result =
            wait_for_object(&api, "cm", Duration::from_secs(2), Duration::from_secs(6)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
