//! The `perch-agent` command line tool.

use std::io::IsTerminal;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use clap_verbosity_flag::Verbosity;
use clap_verbosity_flag::WarnLevel;
use kube::Client;
use kube::Config;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use perch_agent::Agent;
use perch_agent::Environment;
use tracing_log::AsTrace as _;
use tracing_subscriber::EnvFilter;

/// The fixed path of the cluster kubeconfig inside the allocation.
const KUBECONFIG_PATH: &str = "/k8s-data/admin.conf";

/// The agent that executes a Kubernetes pod inside an HPC job allocation.
#[derive(Parser)]
pub struct Args {
    /// The name of the pod to execute.
    #[clap(long)]
    pod: String,

    /// The namespace of the pod to execute.
    #[clap(long)]
    namespace: String,

    /// The verbosity level.
    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,
}

/// Creates a Kubernetes client from the fixed kubeconfig path.
async fn client() -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(KUBECONFIG_PATH)
        .with_context(|| format!("failed to read kubeconfig `{KUBECONFIG_PATH}`"))?;

    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("failed to build the Kubernetes client configuration")?;

    Client::try_from(config).context("failed to create the Kubernetes client")
}

/// The main method.
#[tokio::main]
pub async fn main() -> Result<()> {
    let args = Args::parse();

    match std::env::var("RUST_LOG") {
        Ok(_) => tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_ansi(std::io::stdout().is_terminal())
            .init(),
        Err(_) => tracing_subscriber::fmt()
            .with_max_level(args.verbose.log_level_filter().as_trace())
            .with_ansi(std::io::stdout().is_terminal())
            .init(),
    }

    if args.pod.is_empty() || args.namespace.is_empty() {
        bail!("both a pod name and a namespace must be provided");
    }

    let environment = Environment::from_env()?;
    let client = client().await?;

    Agent::builder()
        .pod(args.pod)
        .namespace(args.namespace)
        .client(client)
        .environment(environment)
        .build()
        .run()
        .await
        .context("failed to execute pod")
}
