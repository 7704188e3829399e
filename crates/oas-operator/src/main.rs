//! OpenShift API server operator

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use oas_common::crd::{ClusterOperator, Image, Ingress, OpenShiftAPIServer, Project};
use oas_common::kube_utils::load_config;
use oas_common::leader_election::{LeaderElector, LEADER_LEASE_NAME};
use oas_common::telemetry::{init_telemetry, TelemetryConfig};
use oas_operator::environment::OperatorEnvironment;
use oas_operator::resource_graph::{GraphFormat, ResourceGraph};
use oas_operator::{run_operator, OperatorOptions, Stopped};

/// Operator managing the OpenShift API server
#[derive(Parser, Debug)]
#[command(name = "oas-operator", version, about, long_about = None)]
struct Cli {
    /// Print the schemas of the operator's resources and exit
    #[arg(long)]
    crds: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator (default)
    Operator(OperatorArgs),
    /// Print where synced and related resources come from
    ResourceGraph(ResourceGraphArgs),
}

#[derive(Parser, Debug)]
struct ResourceGraphArgs {
    /// Output format
    #[arg(long, value_enum, default_value_t = GraphFormat::Dot)]
    format: GraphFormat,
}

#[derive(Parser, Debug, Default)]
struct OperatorArgs {
    /// Path to a kubeconfig; inferred when omitted
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Serve diagnostics on this address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Only run while holding the leader lease
    #[arg(long)]
    leader_elect: bool,

    /// Workers per controller
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Human-readable logs instead of JSON
    #[arg(long)]
    text_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crds {
        let schemas = [
            serde_yaml::to_string(&OpenShiftAPIServer::crd())?,
            serde_yaml::to_string(&ClusterOperator::crd())?,
            serde_yaml::to_string(&Image::crd())?,
            serde_yaml::to_string(&Project::crd())?,
            serde_yaml::to_string(&Ingress::crd())?,
        ];
        println!("{}", schemas.join("---\n"));
        return Ok(());
    }

    let args = match cli.command {
        Some(Commands::Operator(args)) => args,
        Some(Commands::ResourceGraph(args)) => {
            print!("{}", ResourceGraph::operator().render(args.format));
            return Ok(());
        }
        None => OperatorArgs {
            workers: 1,
            ..Default::default()
        },
    };
    run(args).await
}

async fn run(args: OperatorArgs) -> anyhow::Result<()> {
    let log_filter = init_telemetry(TelemetryConfig {
        json: !args.text_logs,
    })?;

    let environment = OperatorEnvironment::from_env();
    info!(
        version = %environment.operator_image_version,
        namespace = %environment.namespace,
        "Starting openshift-apiserver-operator"
    );

    let kube_config = load_config(args.kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load cluster connection: {}", e))?;

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let guard = if args.leader_elect {
        let client = Client::try_from(kube_config.clone())
            .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
        let elector = Arc::new(LeaderElector::new(
            client,
            LEADER_LEASE_NAME,
            &environment.namespace,
            &environment.identity(),
        ));
        match elector.acquire(shutdown.clone()).await {
            Some(guard) => Some(guard),
            None => return Err(Stopped.into()),
        }
    } else {
        None
    };

    let result = run_operator(
        OperatorOptions {
            kube_config,
            environment,
            log_level: Arc::new(log_filter),
            listen: args.listen,
            workers: args.workers,
        },
        shutdown,
    )
    .await;

    if let Some(guard) = guard {
        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release leader lease");
        }
    }

    match result {
        // A clean stop still exits non-zero so the supervisor restarts us
        Ok(stopped) => {
            info!("Shut down cleanly");
            Err(stopped.into())
        }
        Err(e) => {
            error!(error = %e, "Startup failed");
            Err(e.into())
        }
    }
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = term.recv() => info!("Received SIGTERM"),
                    _ = shutdown.cancelled() => return,
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = shutdown.cancelled() => return,
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_graph_defaults_to_dot() {
        let cli = Cli::try_parse_from(["oas-operator", "resource-graph"]).unwrap();
        match cli.command {
            Some(Commands::ResourceGraph(args)) => assert_eq!(args.format, GraphFormat::Dot),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn resource_graph_accepts_text_format() {
        let cli =
            Cli::try_parse_from(["oas-operator", "resource-graph", "--format", "text"]).unwrap();
        match cli.command {
            Some(Commands::ResourceGraph(args)) => assert_eq!(args.format, GraphFormat::Text),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn operator_is_the_default_command() {
        let cli = Cli::try_parse_from(["oas-operator"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.crds);
    }
}
