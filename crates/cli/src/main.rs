use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kreact_kubehub::{ApiClient, KubeClient};
use kreact_reactor::Settings;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod demo;

#[derive(Parser, Debug)]
#[command(name = "kreactctl", version, about = "kreact demo operator")]
struct Cli {
    /// Serve one namespace only (default: all namespaces)
    #[arg(long = "ns", global = true, env = "KREACT_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the demo operator for kopfexamples.kopf.dev until interrupted
    Run {
        /// Upper bound of objects handled concurrently
        #[arg(long = "workers", env = "KREACT_WORKER_LIMIT")]
        workers: Option<usize>,
    },
    /// Print the settings resolved from the environment
    Settings,
}

fn init_tracing() {
    let env = std::env::var("KREACT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KREACT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KREACT_METRICS_ADDR; expected host:port");
        }
    }
}

/// First Ctrl-C: stop gracefully. Second: stop now.
fn handle_signals(graceful: CancellationToken, forced: CancellationToken) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_err() {
            return;
        }
        info!("stopping gracefully; press Ctrl-C again to stop now");
        graceful.cancel();
        if signal::ctrl_c().await.is_ok() {
            warn!("stopping without waiting for handlers and daemons");
            forced.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    if cli.namespace.is_some() {
        settings.watching.namespace = cli.namespace;
    }

    match cli.command {
        Commands::Settings => {
            println!("{settings:#?}");
            Ok(())
        }
        Commands::Run { workers } => {
            if workers.is_some() {
                settings.queueing.worker_limit = workers;
            }
            let registry = Arc::new(demo::registry()?);
            let client: Arc<dyn ApiClient> = Arc::new(KubeClient::try_default().await?);
            let graceful = CancellationToken::new();
            let forced = CancellationToken::new();
            handle_signals(graceful.clone(), forced.clone());
            info!(namespace = ?settings.watching.namespace, "operator starting");
            kreact_reactor::run(registry, client, Arc::new(settings), graceful, forced).await
        }
    }
}
