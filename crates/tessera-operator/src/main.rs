//! tessera operator - serves node join requests for managed clusters

use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use tessera_cluster::KubeClusterStore;
use tessera_common::crd::{Cluster, NodeJoinRequest};
use tessera_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use tessera_common::versions::VersionTable;
use tessera_common::FIELD_MANAGER;
use tessera_join::{
    error_policy, reconcile, AuthorityConfig, Context, JoinAuthority, KubeJoinRequestClient,
};

/// tessera - control-plane provisioning core for managed Kubernetes clusters
#[derive(Parser, Debug)]
#[command(name = "tessera", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Log line format
    #[arg(long, env = "TESSERA_LOG_FORMAT", value_enum, default_value_t = LogFormatArg::Json)]
    log_format: LogFormatArg,

    #[command(flatten)]
    controller: ControllerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the join controller (default mode)
    Controller,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormatArg {
    Json,
    Text,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Text => LogFormat::Text,
        }
    }
}

#[derive(Args, Debug)]
struct ControllerArgs {
    /// Component version table; the embedded table is used when unset
    #[arg(long, env = "TESSERA_VERSIONS_FILE")]
    versions_file: Option<PathBuf>,

    /// API server endpoint written into kubeconfigs when a request names none
    #[arg(
        long,
        env = "TESSERA_API_SERVER_ENDPOINT",
        default_value = "https://127.0.0.1:6443"
    )]
    api_server_endpoint: String,

    /// Kubernetes version reported to joining nodes; the table default when unset
    #[arg(long, env = "TESSERA_KUBERNETES_VERSION")]
    kubernetes_version: Option<String>,

    /// Whether nodes join over the VPN
    #[arg(long, env = "TESSERA_VPN_ENABLED", default_value_t = true, action = ArgAction::Set)]
    vpn_enabled: bool,
}

impl ControllerArgs {
    /// Resolve the authority settings against the version table
    fn authority_config(&self, versions: &VersionTable) -> anyhow::Result<AuthorityConfig> {
        let components = match &self.kubernetes_version {
            Some(version) => versions.get(version)?,
            None => versions.default_versions()?,
        };
        Ok(AuthorityConfig {
            api_server_endpoint: self.api_server_endpoint.clone(),
            kubernetes_version: components.kubernetes_version.clone(),
            vpn_enabled: self.vpn_enabled,
            ..Default::default()
        })
    }

    fn version_table(&self) -> anyhow::Result<VersionTable> {
        Ok(match &self.versions_file {
            Some(path) => VersionTable::from_file(path)?,
            None => VersionTable::builtin()?,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install the aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let cluster = serde_yaml::to_string(&Cluster::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize Cluster CRD: {e}"))?;
        let join = serde_yaml::to_string(&NodeJoinRequest::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize NodeJoinRequest CRD: {e}"))?;
        print!("---\n{cluster}---\n{join}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "tessera-operator".to_string(),
        format: cli.log_format.into(),
        ..Default::default()
    })?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(&cli.controller).await,
    }
}

/// Install the tessera CRDs with server-side apply so they always match
/// this binary
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [Cluster::crd(), NodeJoinRequest::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install CRD {name}: {e}"))?;
    }
    Ok(())
}

async fn run_controller(args: &ControllerArgs) -> anyhow::Result<()> {
    let versions = args.version_table()?;
    let config = args.authority_config(&versions)?;
    tracing::info!(
        kubernetes_version = %config.kubernetes_version,
        api_server_endpoint = %config.api_server_endpoint,
        vpn_enabled = config.vpn_enabled,
        "starting join controller"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kube client: {e}"))?;
    ensure_crds_installed(&client).await?;

    let ctx = Arc::new(Context::new(
        Arc::new(KubeJoinRequestClient::new(client.clone())),
        Arc::new(KubeClusterStore::new(client.clone())),
        JoinAuthority::new(config),
    ));

    let requests: Api<NodeJoinRequest> = Api::all(client);
    Controller::new(requests, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => tracing::debug!(?action, "join reconciliation completed"),
                Err(e) => tracing::error!(error = ?e, "join reconciliation error"),
            }
        })
        .await;

    tracing::info!("join controller stopped");
    Ok(())
}
