use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

use render_orchestrator::{
    BackendSelector, ComputeProvider, HttpPodExecutor, Orchestrator, OrchestratorConfig,
    PodExecutor, RunPodClient, api,
};

#[derive(Parser)]
#[command(name = "render-orchestrator")]
#[command(about = "Render job queue, GPU pod fleet and backend selection")]
struct Cli {
    /// Path to the orchestrator config file (JSON)
    #[arg(short, long, global = true, env = "ORCHESTRATOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator REST server
    Serve {
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Bind address for the admin API (internal / trusted only)
        #[arg(long, default_value = "127.0.0.1:8081")]
        admin_bind: String,
    },
    /// Print the effective configuration with secrets redacted
    CheckConfig,
    /// Probe every backend once and print its health
    Backends,
    /// List pods known to the compute provider
    Pods,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("render_orchestrator=info".parse()?)
                .add_directive("hyper=warn".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();
    let config = OrchestratorConfig::load_with(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port, admin_bind } => {
            config.validate()?;
            info!("Starting render orchestrator on port {}", port);

            let provider: Arc<dyn ComputeProvider> = Arc::new(RunPodClient::from_env()?);
            let executor: Arc<dyn PodExecutor<Value, Value>> =
                Arc::new(HttpPodExecutor::new(config.backends.cloud.timeout())?);
            let orchestrator: api::AppState =
                Arc::new(Orchestrator::new(config, provider, executor)?);

            let public_app = api::create_public_router(orchestrator.clone());
            let admin_app = api::create_admin_router(orchestrator.clone());

            let public_listener =
                tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
            let admin_listener = tokio::net::TcpListener::bind(&admin_bind).await?;

            info!("Public server listening on http://0.0.0.0:{}", port);
            info!("Admin server listening on http://{}", admin_bind);

            let served = tokio::select! {
                res = async {
                    tokio::try_join!(
                        axum::serve(public_listener, public_app),
                        axum::serve(admin_listener, admin_app),
                    )
                } => res.map(|_| ()),
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    Ok(())
                }
            };

            orchestrator.shutdown().await;
            served?;
        }
        Commands::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
            match config.validate() {
                Ok(()) => println!("Configuration is valid"),
                Err(e) => {
                    println!("Configuration is invalid: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Backends => {
            let provider = match RunPodClient::from_env() {
                Ok(client) => Some(Arc::new(client) as Arc<dyn ComputeProvider>),
                Err(e) => {
                    warn!("Cloud provider unavailable: {:#}", e);
                    None
                }
            };
            let selector = BackendSelector::from_config(config.backends, None, provider)?;

            println!(
                "{:<10} {:<10} {:<8} {:<12} {:<8}",
                "BACKEND", "AVAILABLE", "HEALTHY", "LATENCY", "COST"
            );
            for status in selector.all_statuses().await {
                let latency = status
                    .response_time_ms
                    .map(|ms| format!("{}ms", ms))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<10} {:<10} {:<8} {:<12} ${:<7.2}",
                    status.backend.to_string(),
                    status.available,
                    status.healthy,
                    latency,
                    selector.cost_estimate(status.backend),
                );
            }
            println!();
            println!("Selected: {}", selector.select_backend(None).await);
        }
        Commands::Pods => {
            let client = RunPodClient::from_env()?;
            let pods = client.list().await?;
            println!("Found {} pods:", pods.len());
            println!(
                "{:<20} {:<10} {:<10} {:<20}",
                "ID", "STATUS", "UPTIME", "GPU"
            );
            for pod in pods {
                println!(
                    "{:<20} {:<10} {:<10} {:<20}",
                    pod.id.to_string(),
                    pod.status.to_string(),
                    format!("{}s", pod.uptime_seconds),
                    pod.gpu_label,
                );
            }
        }
    }

    Ok(())
}
