use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kube::CustomResourceExt;
use tracing::info;

mod controller;

#[derive(Parser, Debug)]
#[command(name = "appdeployd", version, about = "AppDeploy operator")]
struct Cli {
    /// Kubernetes namespace to watch (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller loop
    Run,
    /// Print the AppDeployment CRD manifest as YAML
    Crd,
}

fn init_tracing() {
    let env = std::env::var("APPDEPLOY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("APPDEPLOY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid APPDEPLOY_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            info!(ns = ?cli.namespace, "starting appdeploy controller");
            controller::run(cli.namespace.as_deref()).await
        }
        Commands::Crd => {
            let crd = appdeploy_core::AppDeployment::crd();
            println!("{}", serde_yaml::to_string(&crd)?);
            Ok(())
        }
    }
}
