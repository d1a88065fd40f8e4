/// Replace object names and namespaces in a Kubernetes API path with placeholders, so
/// metrics are labelled per endpoint instead of per object.
pub fn template_path(path: &str, base: Option<&str>) -> String {
    let path = base
        .and_then(|b| path.strip_prefix(b.trim_end_matches('/')))
        .unwrap_or(path);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let prefix_len = match segments.first() {
        Some(&"api") => 2,
        Some(&"apis") => 3,
        _ => return path.to_string(),
    };
    if segments.len() <= prefix_len {
        return format!("/{}", segments.join("/"));
    }

    let mut templated: Vec<&str> = segments[..prefix_len].to_vec();
    let mut rest = &segments[prefix_len..];
    if rest.first() == Some(&"namespaces") && rest.len() > 2 {
        templated.extend(["namespaces", "{namespace}"]);
        rest = &rest[2..];
    }
    for (i, segment) in rest.iter().enumerate() {
        match i {
            1 => templated.push("{name}"),
            _ => templated.push(segment),
        }
    }
    format!("/{}", templated.join("/"))
}

#[cfg(test)]
mod test {
    use super::template_path;

    #[test]
    fn test_template_core_path() {
        assert_eq!(
            template_path("/api/v1/namespaces/kube-system/secrets/kubic-dex-app", None),
            "/api/v1/namespaces/{namespace}/secrets/{name}"
        );
        assert_eq!(
            template_path("/api/v1/namespaces/kube-system/configmaps", None),
            "/api/v1/namespaces/{namespace}/configmaps"
        );
    }

    #[test]
    fn test_template_group_path() {
        assert_eq!(
            template_path(
                "/apis/kubic.opensuse.org/v1beta1/dexconfigurations/dex-configuration/status",
                None
            ),
            "/apis/kubic.opensuse.org/v1beta1/dexconfigurations/{name}/status"
        );
        assert_eq!(
            template_path("/apis/kubic.opensuse.org/v1beta1/ldapconnectors", None),
            "/apis/kubic.opensuse.org/v1beta1/ldapconnectors"
        );
    }

    #[test]
    fn test_template_namespace_object() {
        assert_eq!(
            template_path("/api/v1/namespaces/kube-system", None),
            "/api/v1/namespaces/{name}"
        );
    }

    #[test]
    fn test_template_with_base() {
        assert_eq!(
            template_path("/k8s/api/v1/namespaces/ns/pods/p", Some("/k8s/")),
            "/api/v1/namespaces/{namespace}/pods/{name}"
        );
        assert_eq!(template_path("/version", None), "/version");
    }
}
