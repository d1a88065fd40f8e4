use dexop_k8s_util::client::new_client_with_metrics;
use dexop_operator::config::{
    DEFAULT_ADMIN_GROUP, DEFAULT_CSR_POLL_TIMEOUT, DEFAULT_CSR_SIGNER_NAME, DEFAULT_IMAGE,
    DEFAULT_NODE_PORT, DEFAULT_PREFIX, DEFAULT_REPLICAS, OperatorConfig,
};
use dexop_operator::controller::State as OperatorState;
use dexop_operator::dex;
use dexop_operator::metrics::Metrics;
use dexop_operator::telemetry;
use dexop_operator::version::{OutputFormat, VersionInfo};

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{Router, get};
use clap::{Args, Parser, Subcommand, crate_authors, crate_description, crate_version};
use kube::Config;
use kube::config::{KubeConfigOptions, Kubeconfig};
use opentelemetry::metrics::MeterProvider;
use tokio::net::TcpListener;

async fn metrics(State(state): State<OperatorState>) -> impl IntoResponse {
    match state.metrics() {
        Ok(metrics) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            metrics,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to get metrics: {:?}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health() -> impl IntoResponse {
    Json("healthy")
}

#[derive(Parser, Debug)]
#[command(
    name="dex-operator",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the Dex operator
    Manager(ManagerArgs),
    /// Print version information
    Version {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },
}

#[derive(Args, Debug)]
struct ManagerArgs {
    /// Path of the kubeconfig file. In-cluster or default configuration when not set
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Prefix of every object generated for Dex
    #[arg(long, default_value = DEFAULT_PREFIX, env = "DEX_PREFIX")]
    prefix: String,

    /// Default number of Dex replicas
    #[arg(long, default_value_t = DEFAULT_REPLICAS, env = "DEX_REPLICAS")]
    replicas: i32,

    /// Namespace where Dex is deployed
    #[arg(long, default_value = dexop_k8s_util::names::DEFAULT_NAMESPACE, env = "DEX_NAMESPACE")]
    namespace: String,

    /// Default node port exposing Dex
    #[arg(long, default_value_t = DEFAULT_NODE_PORT)]
    node_port: i32,

    /// Default Dex image
    #[arg(long, default_value = DEFAULT_IMAGE)]
    image: String,

    /// Default group bound to `cluster-admin`
    #[arg(long, default_value = DEFAULT_ADMIN_GROUP)]
    admin_group: String,

    /// Signer requested for the Dex certificate
    #[arg(long, default_value = DEFAULT_CSR_SIGNER_NAME)]
    csr_signer_name: String,

    /// Seconds to wait for the Dex certificate to be signed
    #[arg(long, default_value_t = DEFAULT_CSR_POLL_TIMEOUT.as_secs())]
    csr_timeout: u64,

    /// Address Dex is reachable at when no external name is configured
    #[arg(long, env = "POD_IP")]
    bind_address: Option<IpAddr>,

    /// Listen on given port
    #[arg(short, long, default_value_t = 8080, env)]
    port: u16,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,dexop=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint.
    ///
    /// This optional argument specifies the URL to which traces will be sent using
    /// OpenTelemetry. If not provided, tracing will be disabled.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing.
    ///
    /// Specifies the ratio of traces to sample. A value of `1.0` will sample all traces,
    /// while a lower value will sample fewer traces. The default is `0.1`, meaning 10%
    /// of traces are sampled.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,
}

impl ManagerArgs {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            prefix: self.prefix.clone(),
            namespace: self.namespace.clone(),
            replicas: self.replicas,
            node_port: self.node_port,
            image: self.image.clone(),
            admin_group: self.admin_group.clone(),
            csr_signer_name: self.csr_signer_name.clone(),
            csr_poll_timeout: Duration::from_secs(self.csr_timeout),
            bind_address: self.bind_address,
            ..OperatorConfig::default()
        }
    }

    async fn kube_config(&self) -> anyhow::Result<Config> {
        Ok(match &self.kubeconfig {
            Some(path) => {
                Config::from_custom_kubeconfig(
                    Kubeconfig::read_from(path)?,
                    &KubeConfigOptions::default(),
                )
                .await?
            }
            None => Config::infer().await?,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Version { output } => {
            println!("{}", VersionInfo::default().render(&output)?);
            Ok(())
        }
        Command::Manager(args) => manager(args).await,
    }
}

async fn manager(args: ManagerArgs) -> anyhow::Result<()> {
    telemetry::init(
        &args.log_filter,
        args.log_format.clone(),
        args.tracing_url.as_deref(),
        args.sample_ratio,
    )
    .await?;

    let meter_provider = telemetry::init_meter_provider();
    let meter = meter_provider.meter("dex-operator");
    opentelemetry::global::set_meter_provider(meter_provider);

    let client = new_client_with_metrics(args.kube_config().await?, &meter).await?;
    let state = OperatorState::new(
        Metrics::new(&meter, &[dex::controller::CONTROLLER_ID]),
        args.operator_config(),
    );
    tracing::info!(msg = "starting dex-operator", version = crate_version!());

    let dex_c = dex::controller::run(state.clone(), client);

    let app = Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(state.clone());

    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    tokio::join!(dex_c, server).1?;
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
}
