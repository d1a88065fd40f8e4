use super::DEX_OPERATOR_NAME;
use super::cluster::SERVICE_NAME;
use super::generated::{OwnedObject, sha256_hex};

use crate::config::OperatorConfig;
use crate::dex::crd::DexConfiguration;
use crate::net::service_dns_name;

use dexop_k8s_util::error::{Error, Result};
use dexop_k8s_util::names::{NamespacedName, remove_duplicates};
use dexop_k8s_util::resources::{apply, delete_opt, get_opt, is_already_exists};
use dexop_k8s_util::wait::{poll_attempts, wait_for_deletion, wait_for_object};

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use backon::{ConstantBuilder, Retryable};
use k8s_openapi::ByteString;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestSpec,
};
use k8s_openapi::api::core::v1::{Secret, SecretReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::jiff::Timestamp;
use kube::api::{Api, DeleteParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::client::Client;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509NameBuilder, X509ReqBuilder};
use serde_json::json;
use tracing::{debug, info, trace, warn};

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";
const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
const RSA_KEY_BITS: u32 = 2048;
const CSR_GROUPS: [&str; 1] = ["system:authenticated"];
const CSR_USAGES: [&str; 4] = [
    "digital signature",
    "key encipherment",
    "server auth",
    "client auth",
];
const CSR_APPROVED: &str = "Approved";
const CSR_APPROVAL_REASON: &str = "AutoApproved";
const CSR_APPROVAL_MESSAGE: &str =
    "This CSR was approved by the Kubic service certificates generator.";

/// Where the certificate reference was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertificateSource {
    /// Supplied by the user in `spec.certificate`
    Spec,
    /// Generated in a previous reconciliation, recorded in `status.generatedCertificate`
    Status,
    /// Default name for generated certificates
    Default,
}

/// Names the Dex serving certificate is valid for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubjectAltNames {
    pub ips: Vec<IpAddr>,
    pub dns: Vec<String>,
}

impl SubjectAltNames {
    pub fn for_dex(config: &OperatorConfig, names: &[String], bind_ip: IpAddr) -> Self {
        let mut ips = vec![bind_ip, IpAddr::V4(Ipv4Addr::LOCALHOST)];
        let mut dns = vec![
            SERVICE_NAME.to_string(),
            service_dns_name(SERVICE_NAME, &config.namespace),
            config.deployment_name(),
        ];
        for name in names {
            match name.parse::<IpAddr>() {
                Ok(ip) => ips.push(ip),
                Err(_) => dns.push(name.clone()),
            }
        }
        Self {
            ips: remove_duplicates(&ips),
            dns: remove_duplicates(&dns),
        }
    }

    #[inline]
    pub fn common_name(&self) -> &str {
        self.dns.first().map(String::as_str).unwrap_or(SERVICE_NAME)
    }
}

/// PEM encoded certificate signing request and the private key it was signed with.
pub struct SigningRequest {
    pub csr_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

fn crypto_error(msg: &str) -> impl Fn(openssl::error::ErrorStack) -> Error + '_ {
    move |e| Error::CryptoError(msg.to_string(), e)
}

pub fn build_signing_request(sans: &SubjectAltNames) -> Result<SigningRequest> {
    let rsa = Rsa::generate(RSA_KEY_BITS).map_err(crypto_error("failed to generate RSA key"))?;
    let key = PKey::from_rsa(rsa).map_err(crypto_error("failed to wrap RSA key"))?;

    let mut subject = X509NameBuilder::new().map_err(crypto_error("failed to build subject"))?;
    subject
        .append_entry_by_nid(Nid::COMMONNAME, sans.common_name())
        .map_err(crypto_error("failed to set common name"))?;
    let subject = subject.build();

    let mut builder = X509ReqBuilder::new().map_err(crypto_error("failed to build CSR"))?;
    builder
        .set_subject_name(&subject)
        .map_err(crypto_error("failed to set CSR subject"))?;
    builder
        .set_pubkey(&key)
        .map_err(crypto_error("failed to set CSR public key"))?;

    let mut san = SubjectAlternativeName::new();
    for dns in &sans.dns {
        san.dns(dns);
    }
    for ip in &sans.ips {
        san.ip(&ip.to_string());
    }
    let san = san
        .build(&builder.x509v3_context(None))
        .map_err(crypto_error("failed to build subject alternative names"))?;
    let mut extensions = Stack::new().map_err(crypto_error("failed to build CSR extensions"))?;
    extensions
        .push(san)
        .map_err(crypto_error("failed to build CSR extensions"))?;
    builder
        .add_extensions(&extensions)
        .map_err(crypto_error("failed to add CSR extensions"))?;
    builder
        .sign(&key, MessageDigest::sha256())
        .map_err(crypto_error("failed to sign CSR"))?;

    Ok(SigningRequest {
        csr_pem: builder
            .build()
            .to_pem()
            .map_err(crypto_error("failed to encode CSR"))?,
        key_pem: key
            .private_key_to_pem_pkcs8()
            .map_err(crypto_error("failed to encode private key"))?,
    })
}

/// Signed certificate of a request, `None` while it is pending. A denied or failed request is
/// an error.
pub fn signed_certificate(csr: &CertificateSigningRequest) -> Result<Option<Vec<u8>>> {
    let name = csr.metadata.name.as_deref().unwrap_or_default();
    let Some(status) = csr.status.as_ref() else {
        return Ok(None);
    };
    if let Some(condition) = status
        .conditions
        .iter()
        .flatten()
        .find(|c| (c.type_ == "Denied" || c.type_ == "Failed") && c.status == "True")
    {
        return Err(Error::CertificateDenied(format!(
            "{name}: {} {}",
            condition.type_,
            condition.message.as_deref().unwrap_or_default()
        )));
    }
    Ok(status
        .certificate
        .as_ref()
        .map(|ByteString(bytes)| bytes.clone())
        .filter(|bytes| !bytes.is_empty()))
}

/// Conditions of `csr` plus an approval, as a merge patch of the `approval` subresource.
fn approval_patch(csr: &CertificateSigningRequest) -> serde_json::Value {
    let mut conditions = csr
        .status
        .as_ref()
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default();
    if !conditions.iter().any(|c| c.type_ == CSR_APPROVED) {
        let now = Time(Timestamp::now());
        conditions.push(CertificateSigningRequestCondition {
            type_: CSR_APPROVED.to_string(),
            status: "True".to_string(),
            reason: Some(CSR_APPROVAL_REASON.to_string()),
            message: Some(CSR_APPROVAL_MESSAGE.to_string()),
            last_update_time: Some(now.clone()),
            last_transition_time: Some(now),
        });
    }
    json!({ "status": { "conditions": conditions } })
}

/// Create the signing request. A request left over by an interrupted attempt was built for
/// another private key, so it is replaced instead of reused.
async fn submit_signing_request(
    api: &Api<CertificateSigningRequest>,
    csr: &CertificateSigningRequest,
    config: &OperatorConfig,
) -> Result<CertificateSigningRequest> {
    let name = csr.metadata.name.as_deref().unwrap_or_default();
    let create_error = |e: kube::Error| {
        Error::KubeError(
            format!("failed to create certificate signing request {name}"),
            Box::new(e),
        )
    };
    match api.create(&PostParams::default(), csr).await {
        Ok(created) => Ok(created),
        Err(e) if is_already_exists(&e) => {
            warn!(msg = "replacing stale certificate signing request", csr = name);
            delete_opt(api, name, &DeleteParams::default()).await?;
            wait_for_deletion(api, name, config.wait_interval, config.wait_timeout).await?;
            api.create(&PostParams::default(), csr)
                .await
                .map_err(create_error)
        }
        Err(e) => Err(create_error(e)),
    }
}

/// TLS certificate served by Dex: either supplied by the user or requested to the cluster
/// signer.
#[derive(Clone, Debug)]
pub struct DexCertificate {
    reference: NamespacedName,
    source: CertificateSource,
    secret: Option<Secret>,
    generated: bool,
    request_meta: ObjectMeta,
}

impl OwnedObject for DexCertificate {
    fn generated_meta(&mut self) -> Option<&mut ObjectMeta> {
        match (self.source, &self.secret) {
            (CertificateSource::Spec, Some(_)) => None,
            _ => Some(&mut self.request_meta),
        }
    }
}

impl DexCertificate {
    /// Find the certificate: the one in the spec, then the one in the status, then the default
    /// generated name.
    pub async fn load(
        client: Client,
        dex: &DexConfiguration,
        config: &OperatorConfig,
        labels: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let from_spec = dex
            .spec
            .certificate
            .as_ref()
            .and_then(NamespacedName::from_secret_reference)
            .map(|r| (r, CertificateSource::Spec));
        let from_status = dex
            .status
            .as_ref()
            .and_then(|s| s.generated_certificate.as_ref())
            .and_then(NamespacedName::from_secret_reference)
            .map(|r| (r, CertificateSource::Status));
        let (reference, source) = from_spec.or(from_status).unwrap_or_else(|| {
            (
                NamespacedName::new(&config.namespace, config.certificate_name()),
                CertificateSource::Default,
            )
        });

        let api: Api<Secret> = Api::namespaced(client, &reference.namespace);
        let secret = get_opt(&api, &reference.name).await?;
        match (&secret, source) {
            (None, CertificateSource::Spec) => {
                warn!(msg = "certificate not found, a new one will be requested", secret = %reference)
            }
            (Some(_), _) => trace!(msg = "certificate found", secret = %reference, ?source),
            (None, _) => debug!(msg = "no certificate available", secret = %reference),
        }

        Ok(Self {
            reference,
            source,
            secret,
            generated: false,
            request_meta: ObjectMeta {
                name: Some(config.certificate_name()),
                namespace: Some(config.namespace.clone()),
                labels: Some(labels.clone()),
                ..ObjectMeta::default()
            },
        })
    }

    #[inline]
    pub fn reference(&self) -> &NamespacedName {
        &self.reference
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.secret.is_some()
    }

    /// Whether the certificate is owned by the operator, so it should be tracked in status.
    #[inline]
    pub fn is_operator_owned(&self) -> bool {
        self.generated || self.source != CertificateSource::Spec
    }

    pub fn as_secret_reference(&self) -> SecretReference {
        self.reference.to_secret_reference()
    }

    /// Digest of the certificate data, used to restart Dex when the certificate changes.
    pub fn hash(&self) -> Result<String> {
        self.secret
            .as_ref()
            .and_then(|s| s.data.as_ref())
            .and_then(|data| data.get(TLS_CERT_KEY))
            .map(|ByteString(bytes)| sha256_hex(bytes))
            .ok_or_else(|| {
                Error::MissingData(format!(
                    "certificate secret {} has no {TLS_CERT_KEY}",
                    self.reference
                ))
            })
    }

    /// Return the certificate secret, requesting a new certificate when none is available.
    pub async fn get_or_request(
        &mut self,
        client: Client,
        config: &OperatorConfig,
        sans: &SubjectAltNames,
    ) -> Result<&Secret> {
        if self.secret.is_none() {
            let secret = self.request(client, config, sans).await?;
            self.reference = NamespacedName::new(
                secret.metadata.namespace.clone().unwrap_or_default(),
                secret.metadata.name.clone().unwrap_or_default(),
            );
            self.generated = true;
            self.secret = Some(secret);
        }
        self.secret.as_ref().ok_or_else(|| {
            Error::MissingData(format!("certificate secret {} not available", self.reference))
        })
    }

    async fn request(
        &self,
        client: Client,
        config: &OperatorConfig,
        sans: &SubjectAltNames,
    ) -> Result<Secret> {
        let secret_name = self
            .request_meta
            .name
            .clone()
            .unwrap_or_else(|| config.certificate_name());
        let csr_name = format!("{secret_name}-csr");
        info!(msg = "requesting certificate", csr = csr_name, cn = sans.common_name());

        let request = build_signing_request(sans)?;
        let csr_api: Api<CertificateSigningRequest> = Api::all(client.clone());
        let csr = CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(csr_name.clone()),
                labels: self.request_meta.labels.clone(),
                ..ObjectMeta::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(request.csr_pem),
                signer_name: config.csr_signer_name.clone(),
                groups: Some(CSR_GROUPS.iter().map(|g| g.to_string()).collect()),
                usages: Some(CSR_USAGES.iter().map(|u| u.to_string()).collect()),
                ..CertificateSigningRequestSpec::default()
            },
            status: None,
        };
        let submitted = submit_signing_request(&csr_api, &csr, config).await?;

        // the request is single use: it goes away whether it was signed or not
        let signed = self.approve_and_wait(&csr_api, &submitted, config).await;
        if let Err(e) = delete_opt(&csr_api, &csr_name, &DeleteParams::default()).await {
            warn!(msg = "failed to delete certificate signing request", csr = csr_name, %e);
        }
        let certificate = signed?;

        let secret = Secret {
            metadata: self.request_meta.clone(),
            type_: Some(TLS_SECRET_TYPE.to_string()),
            data: Some(BTreeMap::from([
                (TLS_CERT_KEY.to_string(), ByteString(certificate)),
                (TLS_KEY_KEY.to_string(), ByteString(request.key_pem)),
            ])),
            ..Secret::default()
        };
        let namespace = secret.metadata.namespace.clone().unwrap_or_default();
        let secret_api: Api<Secret> = Api::namespaced(client, &namespace);
        apply(&secret_api, &secret, DEX_OPERATOR_NAME).await?;
        info!(msg = "certificate stored", secret = %format!("{namespace}/{secret_name}"));
        wait_for_object(
            &secret_api,
            &secret_name,
            config.wait_interval,
            config.wait_timeout,
        )
        .await
    }

    async fn approve_and_wait(
        &self,
        csr_api: &Api<CertificateSigningRequest>,
        csr: &CertificateSigningRequest,
        config: &OperatorConfig,
    ) -> Result<Vec<u8>> {
        let csr_name = csr.metadata.name.as_deref().unwrap_or_default();
        debug!(msg = "approving certificate signing request", csr = csr_name);
        csr_api
            .patch_subresource(
                "approval",
                csr_name,
                &PatchParams::default(),
                &Patch::Merge(approval_patch(csr)),
            )
            .await
            .map_err(|e| {
                Error::KubeError(
                    format!("failed to approve certificate signing request {csr_name}"),
                    Box::new(e),
                )
            })?;
        self.wait_for_signature(csr_api, csr_name, config).await
    }

    async fn wait_for_signature(
        &self,
        csr_api: &Api<CertificateSigningRequest>,
        csr_name: &str,
        config: &OperatorConfig,
    ) -> Result<Vec<u8>> {
        let fetch = || async move {
            let csr = csr_api.get(csr_name).await.map_err(|e| {
                Error::KubeError(
                    format!("failed to get certificate signing request {csr_name}"),
                    Box::new(e),
                )
            })?;
            signed_certificate(&csr)?.ok_or_else(|| {
                Error::MissingData(format!("certificate signing request {csr_name} pending"))
            })
        };
        fetch
            .retry(
                ConstantBuilder::default()
                    .with_delay(config.csr_poll_interval)
                    .with_max_times(poll_attempts(
                        config.csr_poll_interval,
                        config.csr_poll_timeout,
                    )),
            )
            .when(|e| matches!(e, Error::MissingData(_) | Error::KubeError(..)))
            .notify(|e, delay| trace!(msg = "waiting for certificate", csr = csr_name, %e, ?delay))
            .await
            .map_err(|e| match e {
                Error::MissingData(_) => Error::Timeout(format!(
                    "certificate signing request {csr_name} not signed after {:?}",
                    config.csr_poll_timeout
                )),
                e => e,
            })
    }

    /// Delete the certificate secret when it was generated by the operator.
    pub async fn delete_generated(client: Client, reference: &SecretReference) -> Result<bool> {
        let Some(name) = NamespacedName::from_secret_reference(reference) else {
            return Ok(false);
        };
        let api: Api<Secret> = Api::namespaced(client, &name.namespace);
        delete_opt(&api, &name.name, &DeleteParams::default()).await
    }
}

#[cfg(test)]
impl DexCertificate {
    pub fn with_secret(reference: NamespacedName, source: CertificateSource, secret: Secret) -> Self {
        Self {
            reference,
            source,
            secret: Some(secret),
            generated: false,
            request_meta: ObjectMeta::default(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::dex::reconcile::test::{
        CSR_PATH, Call, Reply, mock_client, secret_path, signed_csr, status_reply, test_config,
        timeout_after_10s,
    };

    use http::{Method, Response, StatusCode};
    use k8s_openapi::api::certificates::v1::CertificateSigningRequestStatus;
    use kube::client::Body;
    use openssl::x509::X509Req;

    fn test_sans() -> SubjectAltNames {
        SubjectAltNames::for_dex(
            &OperatorConfig::default(),
            &[
                "dex.example.com".to_string(),
                "10.0.0.9".to_string(),
                "kubic-dex".to_string(),
            ],
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
        )
    }

    fn csr_with(status: CertificateSigningRequestStatus) -> CertificateSigningRequest {
        CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some("kubic-dex-auto-cert-csr".to_string()),
                ..ObjectMeta::default()
            },
            status: Some(status),
            ..CertificateSigningRequest::default()
        }
    }

    fn condition(type_: &str) -> CertificateSigningRequestCondition {
        CertificateSigningRequestCondition {
            type_: type_.to_string(),
            status: "True".to_string(),
            ..CertificateSigningRequestCondition::default()
        }
    }

    #[test]
    fn test_subject_alt_names() {
        let sans = test_sans();
        assert_eq!(
            sans.dns,
            vec![
                "kubic-dex",
                "kubic-dex.kube-system.svc.cluster.local",
                "kubic-dex-deploy",
                "dex.example.com",
            ]
        );
        assert_eq!(
            sans.ips,
            vec![
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)),
            ]
        );
        assert_eq!(sans.common_name(), "kubic-dex");
    }

    #[test]
    fn test_build_signing_request() {
        let request = build_signing_request(&test_sans()).unwrap();
        let csr = X509Req::from_pem(&request.csr_pem).unwrap();
        let cn = csr
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string();
        assert_eq!(cn, "kubic-dex");
        let key = PKey::private_key_from_pem(&request.key_pem).unwrap();
        assert_eq!(key.bits(), RSA_KEY_BITS);
        assert!(csr.verify(&key).unwrap());
    }

    #[test]
    fn test_signed_certificate() {
        assert_eq!(
            signed_certificate(&CertificateSigningRequest::default()).unwrap(),
            None
        );

        let approved = csr_with(CertificateSigningRequestStatus {
            conditions: Some(vec![condition("Approved")]),
            certificate: None,
        });
        assert_eq!(signed_certificate(&approved).unwrap(), None);

        let issued = csr_with(CertificateSigningRequestStatus {
            conditions: Some(vec![condition("Approved")]),
            certificate: Some(ByteString(b"-----BEGIN CERTIFICATE-----".to_vec())),
        });
        assert_eq!(
            signed_certificate(&issued).unwrap(),
            Some(b"-----BEGIN CERTIFICATE-----".to_vec())
        );

        let denied = csr_with(CertificateSigningRequestStatus {
            conditions: Some(vec![condition("Denied")]),
            certificate: None,
        });
        assert!(matches!(
            signed_certificate(&denied),
            Err(Error::CertificateDenied(_))
        ));
    }

    #[test]
    fn test_approval_patch() {
        let patch = approval_patch(&CertificateSigningRequest::default());
        let conditions = patch["status"]["conditions"].as_array().unwrap();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0]["type"], "Approved");
        assert_eq!(conditions[0]["reason"], "AutoApproved");
        assert_eq!(conditions[0]["message"], CSR_APPROVAL_MESSAGE);

        let approved = csr_with(CertificateSigningRequestStatus {
            conditions: Some(vec![condition("Approved")]),
            certificate: None,
        });
        let patch = approval_patch(&approved);
        assert_eq!(patch["status"]["conditions"].as_array().unwrap().len(), 1);
    }

    fn csr_path() -> String {
        format!("{CSR_PATH}/kubic-dex-auto-cert-csr")
    }

    async fn load_default(client: Client) -> DexCertificate {
        let dex = DexConfiguration::test();
        DexCertificate::load(client, &dex, &test_config(), &dex.generate_resource_labels())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn request_replaces_stale_signing_request() {
        let (client, fakeserver) = mock_client();
        let mut calls = vec![
            Call::get_missing(secret_path("kubic-dex-auto-cert")),
            Call::new(Method::POST, CSR_PATH, Reply::Status(StatusCode::CONFLICT)),
            Call::new(Method::DELETE, csr_path(), Reply::Json(signed_csr())),
            Call::get_missing(csr_path()),
            Call::new(Method::POST, CSR_PATH, Reply::Echo),
            Call::new(
                Method::PATCH,
                format!("{}/approval", csr_path()),
                Reply::Json(signed_csr()),
            ),
            Call::new(Method::GET, csr_path(), Reply::Json(signed_csr())),
            Call::new(Method::DELETE, csr_path(), Reply::Json(signed_csr())),
        ];
        calls.extend(Call::apply_and_read(secret_path("kubic-dex-auto-cert")));
        let mocksrv = fakeserver.run_calls(calls);

        let mut certificate = load_default(client.clone()).await;
        let secret = certificate
            .get_or_request(client, &test_config(), &test_sans())
            .await
            .unwrap()
            .clone();
        let recorded = timeout_after_10s(mocksrv).await;

        // the request that gets signed is built over the key stored with the certificate
        assert_eq!(recorded.posts.len(), 2);
        let submitted: CertificateSigningRequest =
            serde_json::from_value(recorded.posts[1].1.clone()).unwrap();
        let request = X509Req::from_pem(&submitted.spec.request.0).unwrap();
        let key = PKey::private_key_from_pem(&secret.data.unwrap()[TLS_KEY_KEY].0).unwrap();
        assert!(request.verify(&key).unwrap());
        assert!(certificate.is_operator_owned());
    }

    #[tokio::test]
    async fn request_denied_removes_signing_request() {
        let (client, fakeserver) = mock_client();
        let denied = serde_json::to_value(csr_with(CertificateSigningRequestStatus {
            conditions: Some(vec![condition("Denied")]),
            certificate: None,
        }))
        .unwrap();
        let mocksrv = fakeserver.run_calls(vec![
            Call::get_missing(secret_path("kubic-dex-auto-cert")),
            Call::new(Method::POST, CSR_PATH, Reply::Echo),
            Call::new(
                Method::PATCH,
                format!("{}/approval", csr_path()),
                Reply::Json(signed_csr()),
            ),
            Call::new(Method::GET, csr_path(), Reply::Json(denied.clone())),
            Call::new(Method::DELETE, csr_path(), Reply::Json(denied)),
        ]);

        let mut certificate = load_default(client.clone()).await;
        let result = certificate
            .get_or_request(client, &test_config(), &test_sans())
            .await;
        assert!(matches!(result, Err(Error::CertificateDenied(_))));
        let recorded = timeout_after_10s(mocksrv).await;

        assert_eq!(recorded.deletes, vec![csr_path()]);
        assert!(recorded.patches.iter().all(|(path, _)| path.ends_with("/approval")));
        assert!(!certificate.is_present());
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_and_removes_signing_request() {
        let (client, fakeserver) = mock_client();
        let pending =
            serde_json::to_vec(&csr_with(CertificateSigningRequestStatus::default())).unwrap();
        let mut handle = fakeserver.into_handle();
        let server = tokio::spawn(async move {
            let mut deleted = Vec::new();
            while let Some((request, send)) = handle.next_request().await {
                let method = request.method().clone();
                let path = request.uri().path().to_string();
                let body = request.into_body().collect_bytes().await.unwrap().to_vec();
                let response = match method {
                    Method::GET if path.ends_with("/secrets/kubic-dex-auto-cert") => {
                        status_reply(StatusCode::NOT_FOUND)
                    }
                    Method::POST => Response::builder().body(Body::from(body)).unwrap(),
                    Method::DELETE => {
                        deleted.push(path);
                        Response::builder().body(Body::from(pending.clone())).unwrap()
                    }
                    _ => Response::builder().body(Body::from(pending.clone())).unwrap(),
                };
                send.send_response(response);
                if !deleted.is_empty() {
                    break;
                }
            }
            deleted
        });

        let mut certificate = load_default(client.clone()).await;
        let result = certificate
            .get_or_request(client, &test_config(), &test_sans())
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(server.await.unwrap(), vec![csr_path()]);
    }

    #[test]
    fn test_hash_requires_certificate() {
        let mut certificate = DexCertificate {
            reference: NamespacedName::new("kube-system", "kubic-dex-auto-cert"),
            source: CertificateSource::Default,
            secret: None,
            generated: false,
            request_meta: ObjectMeta::default(),
        };
        assert!(matches!(certificate.hash(), Err(Error::MissingData(_))));

        certificate.secret = Some(Secret {
            data: Some(BTreeMap::from([(
                TLS_CERT_KEY.to_string(),
                ByteString(b"cert".to_vec()),
            )])),
            ..Secret::default()
        });
        assert_eq!(certificate.hash().unwrap(), sha256_hex(b"cert"));
        assert!(certificate.generated_meta().is_some());

        certificate.source = CertificateSource::Spec;
        assert!(certificate.generated_meta().is_none());
    }
}
