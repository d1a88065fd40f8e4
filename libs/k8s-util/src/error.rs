use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}: {1:?}")]
    KubeError(String, #[source] Box<kube::Error>),

    #[error("{0}: {1}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(
        String,
        #[source] Box<kube::runtime::finalizer::Error<Error>>,
    ),

    #[error("{0}: {1}")]
    FormattingError(String, #[source] std::fmt::Error),

    #[error("{0}")]
    MissingData(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("{0}: {1}")]
    SerializationError(String, #[source] serde_json::Error),

    #[error("{0}: {1}")]
    RenderError(String, #[source] serde_yaml::Error),

    #[error("{0}: {1}")]
    CryptoError(String, #[source] openssl::error::ErrorStack),

    #[error("{0}: {1}")]
    Utf8Error(String, #[source] std::string::FromUtf8Error),

    #[error("{0}: {1}")]
    AddressError(String, #[source] std::io::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("certificate request denied: {0}")]
    CertificateDenied(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("telemetry error: {0}")]
    TelemetryError(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
