// src/bin/agent.rs

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tonic::transport::Server;
use tracing::{debug, info};

use dbagent::config::load_config;
use dbagent::constants::DEFAULT_LISTEN_ADDR;
use dbagent::pb::dbagent::transporter_server::TransporterServer;
use dbagent::process::open_to_append;
use dbagent::server::TransporterSvc;
use dbagent::config::AgentConfig;
use dbagent::uploader::{credential_env, ObjectStoreFactory};
use dbagent::Controller;

#[derive(Parser)]
#[command(name = "dbagent", version, about = "Database benchmark agent (gRPC)")]
struct Cli {
    /// Increase verbosity (default info, -v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Listen address, e.g. 0.0.0.0:3500
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    listen: String,

    /// Directory holding logs, data directories and the ZooKeeper install.
    /// Overrides working_directory from --config.
    #[arg(long)]
    working_directory: Option<PathBuf>,

    /// Optional YAML config (binary paths, timings, upload settings)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Storage project, exported as GOOGLE_CLOUD_PROJECT when given.
    /// The service-account key also carries its own project_id.
    #[arg(long)]
    project: Option<String>,
}

/// Wait for shutdown signals (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

fn main() -> Result<()> {
    dotenv().ok();
    let args = Cli::parse();

    let mut cfg = load_config(args.config.as_deref())?;
    if let Some(wd) = args.working_directory.clone() {
        cfg.working_directory = wd;
    }
    if !cfg.working_directory.is_dir() {
        anyhow::bail!("working directory {:?} does not exist", cfg.working_directory);
    }

    // Exported once, while the process is still single-threaded.
    // Commands only rewrite the key file behind this fixed path.
    for (name, value) in credential_env(&cfg.layout().storage_key, args.project.as_deref()) {
        std::env::set_var(name, value);
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(run(args, cfg))
}

async fn run(args: Cli, cfg: AgentConfig) -> Result<()> {
    let layout = cfg.layout();

    // agent.log is both the log sink and an uploaded artifact
    let (agent_level, s3dlio_level) = match args.verbose {
        0 => ("info", "warn"),
        1 => ("debug", "info"),
        _ => ("trace", "debug"),
    };
    let log_file = open_to_append(&layout.agent_log)
        .with_context(|| format!("Failed to open {}", layout.agent_log.display()))?;

    use tracing_subscriber::fmt::writer::MakeWriterExt;
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "dbagent={},dbagent_ctl={},s3dlio={}",
            agent_level, agent_level, s3dlio_level
        ))
    });
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(Arc::new(log_file).and(std::io::stderr))
        .init();

    debug!("Logging initialized at level: {}", agent_level);
    info!("working directory: {:?}", layout.working_dir);
    info!("agent log path: {:?}", layout.agent_log);

    let addr: SocketAddr = args.listen.parse().context("invalid listen addr")?;
    let factory = Arc::new(ObjectStoreFactory::new(
        cfg.upload.storage_scheme.clone(),
        layout.storage_key.clone(),
    ));
    let controller = Arc::new(Mutex::new(Controller::new(cfg, factory)));

    info!("Agent starting on {}", addr);
    println!("dbagent listening on {}", addr);
    Server::builder()
        .add_service(TransporterServer::new(TransporterSvc::new(controller.clone())))
        .serve_with_shutdown(addr, async {
            let sig = wait_for_shutdown_signal().await;
            info!("Received {} - initiating graceful shutdown", sig);
        })
        .await
        .context("tonic server failed")?;

    controller.lock().await.shutdown().await;
    info!("Agent shutdown complete");
    Ok(())
}
