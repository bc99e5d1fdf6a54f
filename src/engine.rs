// src/engine.rs
//
// Per-engine launch plans
//
// A Start command is turned into an `EngineSpec` carrying exactly what one
// engine kind needs. Argument lists are pure functions of that value; the only
// filesystem work happens in `prepare()`, right before launch.

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::command::{Command, DatabaseKind, ProxyKind};
use crate::config::{AgentConfig, Layout};
use crate::constants::*;
use crate::process::LaunchSpec;

/// etcd member settings derived from the peer list
#[derive(Debug, Clone, PartialEq)]
pub struct EtcdSpec {
    pub binary: PathBuf,
    pub name: String,
    pub data_dir: PathBuf,
    pub client_url: String,
    pub peer_url: String,
    /// Static membership, `etcd-1=http://ip:2380,...`
    pub initial_cluster: String,
    pub token: String,
}

impl EtcdSpec {
    pub fn new(binary: PathBuf, data_dir: PathBuf, peers: &[String], index: usize) -> Self {
        let names: Vec<String> = (0..peers.len()).map(|i| format!("etcd-{}", i + 1)).collect();
        let peer_urls: Vec<String> = peers
            .iter()
            .map(|ip| format!("http://{}:{}", ip, ETCD_PEER_PORT))
            .collect();
        let initial_cluster = names
            .iter()
            .zip(&peer_urls)
            .map(|(n, u)| format!("{}={}", n, u))
            .collect::<Vec<_>>()
            .join(",");
        Self {
            binary,
            name: names[index].clone(),
            data_dir,
            client_url: format!("http://{}:{}", peers[index], ETCD_CLIENT_PORT),
            peer_url: peer_urls[index].clone(),
            initial_cluster,
            token: ETCD_CLUSTER_TOKEN.to_string(),
        }
    }

    /// Always bootstraps a new cluster; joining an existing one is unsupported
    pub fn args(&self) -> Vec<String> {
        vec![
            "--name".into(),
            self.name.clone(),
            "--data-dir".into(),
            self.data_dir.display().to_string(),
            "--listen-client-urls".into(),
            self.client_url.clone(),
            "--advertise-client-urls".into(),
            self.client_url.clone(),
            "--listen-peer-urls".into(),
            self.peer_url.clone(),
            "--initial-advertise-peer-urls".into(),
            self.peer_url.clone(),
            "--initial-cluster-token".into(),
            self.token.clone(),
            "--initial-cluster".into(),
            self.initial_cluster.clone(),
            "--initial-cluster-state".into(),
            "new".into(),
        ]
    }
}

/// Translation proxy pointed at the local etcd client endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct ProxySpec {
    pub kind: ProxyKind,
    pub binary: PathBuf,
    pub endpoint: String,
    pub log_path: PathBuf,
}

impl ProxySpec {
    pub fn args(&self) -> Vec<String> {
        match self.kind {
            ProxyKind::Zetcd => vec![
                "-zkaddr".into(),
                ZETCD_LISTEN_ADDR.into(),
                "-endpoint".into(),
                self.endpoint.clone(),
            ],
            ProxyKind::Cetcd => vec![
                "-consuladdr".into(),
                CETCD_LISTEN_ADDR.into(),
                "-etcd".into(),
                self.endpoint.clone(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZkPeer {
    pub my_id: usize,
    pub ip: String,
}

/// Values substituted into zookeeper.config
#[derive(Debug, Clone, PartialEq)]
pub struct ZkConfig {
    pub tick_time: u32,
    pub data_dir: PathBuf,
    pub client_port: u16,
    pub init_limit: u32,
    pub sync_limit: u32,
    pub max_client_cnxns: i64,
    pub snap_count: i64,
    pub peers: Vec<ZkPeer>,
}

impl ZkConfig {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "tickTime={}", self.tick_time);
        let _ = writeln!(out, "dataDir={}", self.data_dir.display());
        let _ = writeln!(out, "clientPort={}", self.client_port);
        let _ = writeln!(out, "initLimit={}", self.init_limit);
        let _ = writeln!(out, "syncLimit={}", self.sync_limit);
        let _ = writeln!(out, "maxClientCnxns={}", self.max_client_cnxns);
        let _ = writeln!(out, "snapCount={}", self.snap_count);
        for p in &self.peers {
            let _ = writeln!(
                out,
                "server.{}={}:{}:{}",
                p.my_id, p.ip, ZK_QUORUM_PORT, ZK_ELECTION_PORT
            );
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZooKeeperSpec {
    pub java: PathBuf,
    pub classpath: String,
    pub main_class: String,
    /// The JVM runs with this as its current directory
    pub working_dir: PathBuf,
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub my_id: u32,
    pub config: ZkConfig,
}

impl ZooKeeperSpec {
    pub fn args(&self) -> Vec<String> {
        vec![
            "-cp".into(),
            self.classpath.clone(),
            self.main_class.clone(),
            self.config_path.display().to_string(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsulRole {
    /// Index 0 bootstraps and waits for the expected number of servers
    Leader { bootstrap_expect: usize },
    Follower { join: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsulSpec {
    pub binary: PathBuf,
    pub data_dir: PathBuf,
    pub bind: String,
    pub role: ConsulRole,
}

impl ConsulSpec {
    pub fn args(&self) -> Vec<String> {
        let mut flags = vec![
            "agent".to_string(),
            "-server".into(),
            "-data-dir".into(),
            self.data_dir.display().to_string(),
            "-bind".into(),
            self.bind.clone(),
            "-client".into(),
            self.bind.clone(),
        ];
        match &self.role {
            ConsulRole::Leader { bootstrap_expect } => {
                flags.push("-bootstrap-expect".into());
                flags.push(bootstrap_expect.to_string());
            }
            ConsulRole::Follower { join } => {
                flags.push("-join".into());
                flags.push(join.clone());
            }
        }
        flags
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineSpec {
    Etcd {
        etcd: EtcdSpec,
        proxy: Option<ProxySpec>,
    },
    ZooKeeper(ZooKeeperSpec),
    Consul(ConsulSpec),
}

impl EngineSpec {
    /// Build the launch plan for a validated Start command
    pub fn from_command(cmd: &Command, cfg: &AgentConfig, layout: &Layout) -> Result<Self> {
        cmd.validate()?;
        let peers = &cmd.peers;
        let index = cmd.server_index;
        let bins = &cfg.binaries;

        let spec = match cmd.database {
            DatabaseKind::EtcdV2
            | DatabaseKind::EtcdV3
            | DatabaseKind::Zetcd
            | DatabaseKind::Cetcd => {
                let etcd = EtcdSpec::new(bins.etcd.clone(), layout.etcd_data_dir.clone(), peers, index);
                let proxy = cmd.database.proxy().map(|kind| ProxySpec {
                    kind,
                    binary: match kind {
                        ProxyKind::Zetcd => bins.zetcd.clone(),
                        ProxyKind::Cetcd => bins.cetcd.clone(),
                    },
                    endpoint: etcd.client_url.clone(),
                    log_path: layout.proxy_log(kind),
                });
                EngineSpec::Etcd { etcd, proxy }
            }
            DatabaseKind::ZooKeeper => {
                let zk = &cfg.zookeeper;
                let config = ZkConfig {
                    tick_time: zk.tick_time,
                    data_dir: layout.zk_data_dir.clone(),
                    client_port: zk.client_port,
                    init_limit: zk.init_limit,
                    sync_limit: zk.sync_limit,
                    max_client_cnxns: cmd.zookeeper.max_client_cnxns,
                    snap_count: cmd.zookeeper.snap_count,
                    peers: peers
                        .iter()
                        .enumerate()
                        .map(|(i, ip)| ZkPeer { my_id: i + 1, ip: ip.clone() })
                        .collect(),
                };
                EngineSpec::ZooKeeper(ZooKeeperSpec {
                    java: bins.java.clone(),
                    classpath: zk.classpath.clone(),
                    main_class: zk.main_class.clone(),
                    working_dir: layout.zk_working_dir.clone(),
                    data_dir: layout.zk_data_dir.clone(),
                    config_path: layout.zk_config.clone(),
                    my_id: cmd.zookeeper.my_id,
                    config,
                })
            }
            DatabaseKind::Consul => {
                let role = if index == 0 {
                    ConsulRole::Leader { bootstrap_expect: peers.len() }
                } else {
                    ConsulRole::Follower { join: peers[0].clone() }
                };
                EngineSpec::Consul(ConsulSpec {
                    binary: bins.consul.clone(),
                    data_dir: layout.consul_data_dir.clone(),
                    bind: peers[index].clone(),
                    role,
                })
            }
        };
        Ok(spec)
    }

    /// Executables that must exist before anything touches the disk
    pub fn required_binaries(&self) -> Vec<&Path> {
        match self {
            EngineSpec::Etcd { etcd, proxy } => {
                let mut v = vec![etcd.binary.as_path()];
                if let Some(p) = proxy {
                    v.push(p.binary.as_path());
                }
                v
            }
            EngineSpec::ZooKeeper(zk) => vec![zk.java.as_path()],
            EngineSpec::Consul(c) => vec![c.binary.as_path()],
        }
    }

    /// Check executables (and the ZooKeeper install dir) without side effects
    pub fn check_installed(&self) -> Result<()> {
        for bin in self.required_binaries() {
            if !bin.exists() {
                anyhow::bail!("binary {:?} does not exist", bin);
            }
        }
        if let EngineSpec::ZooKeeper(zk) = self {
            if !zk.working_dir.is_dir() {
                anyhow::bail!("zookeeper working directory {:?} does not exist", zk.working_dir);
            }
        }
        Ok(())
    }

    /// Fresh-start disk state: wipe the data directory, write engine files
    pub fn prepare(&self) -> Result<()> {
        match self {
            EngineSpec::Etcd { etcd, .. } => remove_dir_if_exists(&etcd.data_dir),
            EngineSpec::Consul(c) => remove_dir_if_exists(&c.data_dir),
            EngineSpec::ZooKeeper(zk) => {
                remove_dir_if_exists(&zk.data_dir)?;
                info!("creating zookeeper data directory {:?}", zk.data_dir);
                fs::create_dir_all(&zk.data_dir)
                    .with_context(|| format!("Failed to create {}", zk.data_dir.display()))?;

                let id_path = zk.data_dir.join(ZK_MYID_FILE);
                info!("writing zk myid file {} in {:?}", zk.my_id, id_path);
                fs::write(&id_path, zk.my_id.to_string())
                    .with_context(|| format!("Failed to write {}", id_path.display()))?;

                let rendered = zk.config.render();
                info!("writing zk config file {:?} (config {:?})", zk.config_path, rendered);
                fs::write(&zk.config_path, rendered)
                    .with_context(|| format!("Failed to write {}", zk.config_path.display()))?;
                Ok(())
            }
        }
    }

    /// Launch plan for the engine itself
    pub fn primary_launch(&self, database_log: &Path) -> LaunchSpec {
        match self {
            EngineSpec::Etcd { etcd, .. } => {
                LaunchSpec::new(&etcd.binary, etcd.args(), database_log)
            }
            EngineSpec::ZooKeeper(zk) => {
                LaunchSpec::new(&zk.java, zk.args(), database_log).current_dir(&zk.working_dir)
            }
            EngineSpec::Consul(c) => LaunchSpec::new(&c.binary, c.args(), database_log),
        }
    }

    /// Launch plan for the companion proxy, if this engine has one
    pub fn proxy_launch(&self) -> Option<LaunchSpec> {
        match self {
            EngineSpec::Etcd { proxy: Some(p), .. } => {
                Some(LaunchSpec::new(&p.binary, p.args(), &p.log_path))
            }
            _ => None,
        }
    }

    pub fn proxy_log(&self) -> Option<&Path> {
        match self {
            EngineSpec::Etcd { proxy: Some(p), .. } => Some(&p.log_path),
            _ => None,
        }
    }
}

fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    if dir.exists() {
        info!("removing previous data directory {:?}", dir);
        fs::remove_dir_all(dir).with_context(|| format!("Failed to remove {}", dir.display()))?;
    }
    Ok(())
}
