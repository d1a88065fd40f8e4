use dexop_k8s_util::names::DEFAULT_NAMESPACE;
use dexop_k8s_util::wait::{DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT};

use std::net::IpAddr;

use tokio::time::Duration;

pub const DEFAULT_PREFIX: &str = "kubic-dex";
pub const DEFAULT_REPLICAS: i32 = 3;
pub const DEFAULT_NODE_PORT: i32 = 32000;
pub const DEFAULT_IMAGE: &str =
    "registry.opensuse.org/devel/caasp/kubic-container/container/kubic/caasp-dex:2.7.1";
pub const DEFAULT_ADMIN_GROUP: &str = "Administrators";
pub const DEFAULT_CONFIG_FILENAME: &str = "/etc/dex/cfg/config.yaml";
pub const DEFAULT_CERTS_DIR: &str = "/etc/dex/tls";
pub const DEFAULT_PASSWORD_LENGTH: usize = 16;
pub const DEFAULT_CSR_SIGNER_NAME: &str = "kubic.opensuse.org/serving";
pub const DEFAULT_CSR_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_CSR_POLL_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Operator wide settings, built once at startup and shared by every reconciliation.
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Prefix of every object name generated for Dex
    pub prefix: String,
    /// Namespace where Dex and its dependencies live
    pub namespace: String,
    /// Replicas used when the configuration does not set them
    pub replicas: i32,
    /// Node port used when the configuration does not set it
    pub node_port: i32,
    /// Image used when the configuration does not set it
    pub image: String,
    /// Group bound to `cluster-admin` when the configuration does not set it
    pub admin_group: String,
    /// Path of the Dex configuration file inside the container
    pub config_filename: String,
    /// Directory where the TLS secret is mounted inside the container
    pub certs_dir: String,
    /// Length of generated shared passwords
    pub password_length: usize,
    /// Signer requested in certificate signing requests
    pub csr_signer_name: String,
    pub csr_poll_interval: Duration,
    pub csr_poll_timeout: Duration,
    /// Polling used while waiting for published objects to be readable
    pub wait_interval: Duration,
    pub wait_timeout: Duration,
    /// Address Dex is reachable at when no external name is configured. Discovered from the
    /// host name when unset.
    pub bind_address: Option<IpAddr>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            replicas: DEFAULT_REPLICAS,
            node_port: DEFAULT_NODE_PORT,
            image: DEFAULT_IMAGE.to_string(),
            admin_group: DEFAULT_ADMIN_GROUP.to_string(),
            config_filename: DEFAULT_CONFIG_FILENAME.to_string(),
            certs_dir: DEFAULT_CERTS_DIR.to_string(),
            password_length: DEFAULT_PASSWORD_LENGTH,
            csr_signer_name: DEFAULT_CSR_SIGNER_NAME.to_string(),
            csr_poll_interval: DEFAULT_CSR_POLL_INTERVAL,
            csr_poll_timeout: DEFAULT_CSR_POLL_TIMEOUT,
            wait_interval: DEFAULT_POLL_INTERVAL,
            wait_timeout: DEFAULT_POLL_TIMEOUT,
            bind_address: None,
        }
    }
}

impl OperatorConfig {
    #[inline]
    pub fn configmap_name(&self) -> String {
        format!("{}-cm", self.prefix)
    }

    #[inline]
    pub fn deployment_name(&self) -> String {
        format!("{}-deploy", self.prefix)
    }

    #[inline]
    pub fn certificate_name(&self) -> String {
        format!("{}-auto-cert", self.prefix)
    }
}

#[cfg(test)]
mod test {
    use super::OperatorConfig;

    #[test]
    fn test_default_names() {
        let config = OperatorConfig::default();
        assert_eq!(config.configmap_name(), "kubic-dex-cm");
        assert_eq!(config.deployment_name(), "kubic-dex-deploy");
        assert_eq!(config.certificate_name(), "kubic-dex-auto-cert");
        assert_eq!(config.namespace, "kube-system");
        assert_eq!(config.replicas, 3);
    }

    #[test]
    fn test_custom_prefix() {
        let config = OperatorConfig {
            prefix: "dex".to_string(),
            ..OperatorConfig::default()
        };
        assert_eq!(config.deployment_name(), "dex-deploy");
        assert_eq!(config.password_length, 16);
    }
}
