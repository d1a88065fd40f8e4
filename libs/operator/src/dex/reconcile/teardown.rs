use dexop_k8s_util::error::{Error, Result};
use dexop_k8s_util::resources::delete_opt;
use dexop_k8s_util::types::short_type_name;

use std::fmt::Debug;

use kube::api::{Api, DeleteParams};
use serde::de::DeserializeOwned;
use tracing::warn;

/// Failures accumulated while removing the objects of a Dex deployment. Teardown keeps going
/// after a failure so one stuck object does not leave the rest behind.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub failures: Vec<(String, Error)>,
}

impl TeardownReport {
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn record(&mut self, object: impl Into<String>, result: Result<()>) {
        if let Err(e) = result {
            let object = object.into();
            warn!(msg = "teardown step failed", object, %e);
            self.failures.push((object, e));
        }
    }

    pub fn extend(&mut self, failures: impl IntoIterator<Item = (String, Error)>) {
        self.failures.extend(failures);
    }

    /// Delete an object, recording the failure. Returns whether the object existed.
    pub async fn delete<K>(&mut self, api: &Api<K>, name: &str, dp: &DeleteParams) -> bool
    where
        K: Clone + DeserializeOwned + Debug,
    {
        match delete_opt(api, name, dp).await {
            Ok(existed) => existed,
            Err(e) => {
                let kind = short_type_name::<K>().unwrap_or("object");
                self.record(format!("{kind} {name}"), Err(e));
                false
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::TeardownReport;

    use dexop_k8s_util::error::Error;

    #[test]
    fn test_record() {
        let mut report = TeardownReport::default();
        report.record("ConfigMap kube-system/kubic-dex-cm", Ok(()));
        assert!(report.is_complete());

        report.record(
            "Secret kube-system/kubic-dex-auto-cert",
            Err(Error::MissingData("gone".to_string())),
        );
        report.extend([(
            "Service kubic-dex".to_string(),
            Error::Timeout("slow".to_string()),
        )]);
        assert!(!report.is_complete());
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].0, "Secret kube-system/kubic-dex-auto-cert");
    }
}
