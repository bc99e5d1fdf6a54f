// src/bin/controller.rs

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use std::fs;
use std::path::PathBuf;
use tonic::transport::{Channel, Endpoint};

use dbagent::command::{Command, DatabaseKind, Destination, Operation, ZooKeeperTuning};
use dbagent::constants::{CTL_CONNECT_TIMEOUT, CTL_REQUEST_TIMEOUT, ZK_MAX_CLIENT_CNXNS};
use dbagent::pb::dbagent::transporter_client::TransporterClient;
use dbagent::pb::dbagent::Request as TransferRequest;

#[derive(Parser)]
#[command(name = "dbagent-ctl", version, about = "Database benchmark agent controller (gRPC)")]
struct Cli {
    /// Comma-separated agent addresses (host:port), in cluster order
    #[arg(long)]
    agents: String,

    /// Comma-separated peer IPs the engines bind to.
    /// Defaults to the host part of each --agents entry.
    #[arg(long)]
    peers: Option<String>,

    /// Database engine: etcdv2, etcdv3, zetcd, cetcd, zookeeper, consul
    #[arg(long, default_value = "etcdv3", value_parser = DatabaseKind::parse)]
    database: DatabaseKind,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine on every agent
    Start {
        #[arg(long, default_value_t = ZK_MAX_CLIENT_CNXNS)]
        zookeeper_max_client_cnxns: i64,
        #[arg(long, default_value_t = 100_000)]
        zookeeper_snap_count: i64,
        #[command(flatten)]
        storage: StorageArgs,
    },
    /// Stop the engine and upload artifacts
    Stop,
    /// Upload artifacts while the engine keeps running
    UploadLog {
        #[command(flatten)]
        storage: StorageArgs,
    },
}

#[derive(Args, Clone, Default)]
struct StorageArgs {
    /// Service-account key file sent to the agents
    #[arg(long)]
    key_file: Option<PathBuf>,
    #[arg(long, default_value = "")]
    project: String,
    #[arg(long, default_value = "")]
    bucket: String,
    #[arg(long, default_value = "")]
    sub_directory: String,
    #[arg(long, default_value = "")]
    test_name: String,
}

impl StorageArgs {
    fn destination(&self, server_index: usize) -> Result<Destination> {
        let key = match &self.key_file {
            Some(p) => fs::read_to_string(p).with_context(|| format!("reading --key-file {}", p.display()))?,
            None => String::new(),
        };
        Ok(Destination {
            project: self.project.clone(),
            bucket: self.bucket.clone(),
            key,
            sub_directory: self.sub_directory.clone(),
            test_name: self.test_name.clone(),
            server_index,
        })
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// "10.0.0.1:3500" -> "10.0.0.1"
fn host_of(agent: &str) -> String {
    agent
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(agent)
        .to_string()
}

async fn mk_client(target: &str) -> Result<TransporterClient<Channel>> {
    let ep = format!("http://{}", target);
    let channel = Endpoint::try_from(ep)?
        .connect_timeout(CTL_CONNECT_TIMEOUT)
        .timeout(CTL_REQUEST_TIMEOUT)
        .tcp_nodelay(true)
        .connect()
        .await?;
    Ok(TransporterClient::new(channel))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let agents = split_list(&cli.agents);
    if agents.is_empty() {
        anyhow::bail!("--agents must name at least one agent");
    }
    let peers = match &cli.peers {
        Some(p) => split_list(p),
        None => agents.iter().map(|a| host_of(a)).collect(),
    };

    for (index, agent) in agents.iter().enumerate() {
        let (operation, zookeeper, destination) = match &cli.command {
            Commands::Start {
                zookeeper_max_client_cnxns,
                zookeeper_snap_count,
                storage,
            } => (
                Operation::Start,
                ZooKeeperTuning {
                    my_id: index as u32 + 1,
                    max_client_cnxns: *zookeeper_max_client_cnxns,
                    snap_count: *zookeeper_snap_count,
                },
                storage.destination(index)?,
            ),
            Commands::Stop => (Operation::Stop, ZooKeeperTuning::default(), Destination::default()),
            Commands::UploadLog { storage } => {
                (Operation::UploadLog, ZooKeeperTuning::default(), storage.destination(index)?)
            }
        };
        let cmd = Command {
            operation,
            database: cli.database,
            server_index: index,
            peers: peers.clone(),
            zookeeper,
            destination,
        };

        let mut c = mk_client(agent)
            .await
            .with_context(|| format!("connect to {}", agent))?;
        let r = c
            .transfer(TransferRequest::from(&cmd))
            .await
            .with_context(|| format!("[{}] {:?} failed", agent, operation))?
            .into_inner();
        eprintln!("[{}] transfer ok (success={})", agent, r.success);
    }

    Ok(())
}
