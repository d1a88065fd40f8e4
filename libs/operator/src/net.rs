use crate::config::OperatorConfig;

use dexop_k8s_util::error::{Error, Result};

use std::net::{IpAddr, ToSocketAddrs};

pub const CLUSTER_DOMAIN: &str = "cluster.local";

/// In-cluster DNS name of a service.
#[inline]
pub fn service_dns_name(name: &str, namespace: &str) -> String {
    format!("{name}.{namespace}.svc.{CLUSTER_DOMAIN}")
}

/// Address Dex binds to: the configured one, or the first non-loopback address the host name
/// resolves to.
pub fn bind_ip(config: &OperatorConfig) -> Result<IpAddr> {
    match config.bind_address {
        Some(ip) => Ok(ip),
        None => host_ip(),
    }
}

fn host_ip() -> Result<IpAddr> {
    let hostname = hostname::get()
        .map_err(|e| Error::AddressError("failed to get host name".to_string(), e))?
        .to_string_lossy()
        .into_owned();
    let addresses = (hostname.as_str(), 0)
        .to_socket_addrs()
        .map_err(|e| Error::AddressError(format!("failed to resolve host name {hostname}"), e))?
        .map(|addr| addr.ip())
        .collect::<Vec<_>>();
    addresses
        .iter()
        .find(|ip| !ip.is_loopback())
        .or_else(|| addresses.first())
        .copied()
        .ok_or_else(|| Error::MissingData(format!("host name {hostname} has no address")))
}

#[cfg(test)]
mod test {
    use super::{bind_ip, service_dns_name};

    use crate::config::OperatorConfig;

    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_service_dns_name() {
        assert_eq!(
            service_dns_name("kubic-dex", "kube-system"),
            "kubic-dex.kube-system.svc.cluster.local"
        );
    }

    #[test]
    fn test_configured_bind_ip() {
        let config = OperatorConfig {
            bind_address: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))),
            ..OperatorConfig::default()
        };
        assert_eq!(bind_ip(&config).unwrap().to_string(), "10.0.0.5");
    }
}
