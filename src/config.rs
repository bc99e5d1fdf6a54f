// src/config.rs
//
// Agent configuration: optional YAML file + CLI overrides
// Every field has a default so an agent runs with no config file at all.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command::ProxyKind;
use crate::constants::*;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AgentConfig {
    /// Directory all relative paths are resolved against. Must exist.
    #[serde(default = "default_working_directory")]
    pub working_directory: PathBuf,

    /// Engine executables
    #[serde(default)]
    pub binaries: BinaryPaths,

    /// File and directory names inside the working directory.
    /// Absolute paths are used as-is.
    #[serde(default)]
    pub files: FileNames,

    #[serde(default)]
    pub zookeeper: ZooKeeperSettings,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub upload: UploadConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            working_directory: default_working_directory(),
            binaries: BinaryPaths::default(),
            files: FileNames::default(),
            zookeeper: ZooKeeperSettings::default(),
            timing: TimingConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}

fn default_working_directory() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Go-built engines are installed under $GOPATH/bin (or ~/go/bin)
fn go_bin(name: &str) -> PathBuf {
    let gopath = std::env::var_os("GOPATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| default_working_directory().join("go"));
    gopath.join("bin").join(name)
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct BinaryPaths {
    pub etcd: PathBuf,
    pub zetcd: PathBuf,
    pub cetcd: PathBuf,
    pub consul: PathBuf,
    pub java: PathBuf,
}

impl Default for BinaryPaths {
    fn default() -> Self {
        Self {
            etcd: go_bin("etcd"),
            zetcd: go_bin("zetcd"),
            cetcd: go_bin("cetcd"),
            consul: go_bin("consul"),
            java: PathBuf::from(DEFAULT_JAVA_BINARY),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct FileNames {
    pub agent_log: PathBuf,
    pub database_log: PathBuf,
    pub monitor_log: PathBuf,
    pub storage_key: PathBuf,
    pub etcd_data_dir: PathBuf,
    pub consul_data_dir: PathBuf,
    pub zookeeper_working_dir: PathBuf,
    pub zookeeper_data_dir: PathBuf,
    /// Relative to the ZooKeeper working directory
    pub zookeeper_config: PathBuf,
}

impl Default for FileNames {
    fn default() -> Self {
        Self {
            agent_log: AGENT_LOG_FILE.into(),
            database_log: DATABASE_LOG_FILE.into(),
            monitor_log: MONITOR_LOG_FILE.into(),
            storage_key: STORAGE_KEY_FILE.into(),
            etcd_data_dir: ETCD_DATA_DIR.into(),
            consul_data_dir: CONSUL_DATA_DIR.into(),
            zookeeper_working_dir: ZK_WORKING_DIR.into(),
            zookeeper_data_dir: ZK_DATA_DIR.into(),
            zookeeper_config: ZK_CONFIG_FILE.into(),
        }
    }
}

/// Static parts of the rendered zookeeper.config
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ZooKeeperSettings {
    pub classpath: String,
    pub main_class: String,
    pub tick_time: u32,
    pub client_port: u16,
    pub init_limit: u32,
    pub sync_limit: u32,
}

impl Default for ZooKeeperSettings {
    fn default() -> Self {
        Self {
            classpath: ZK_CLASSPATH.to_string(),
            main_class: ZK_MAIN_CLASS.to_string(),
            tick_time: ZK_TICK_TIME,
            client_port: ZK_CLIENT_PORT,
            init_limit: ZK_INIT_LIMIT,
            sync_limit: ZK_SYNC_LIMIT,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TimingConfig {
    /// Delay before Stop/UploadLog signal anything (e.g. "3s")
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,

    /// Monitoring sample period (e.g. "1s")
    #[serde(default = "default_sample_interval", with = "humantime_serde")]
    pub sample_interval: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
            sample_interval: default_sample_interval(),
        }
    }
}

fn default_grace_period() -> Duration {
    DEFAULT_STOP_GRACE_PERIOD
}

fn default_sample_interval() -> Duration {
    DEFAULT_SAMPLE_INTERVAL
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff", with = "humantime_serde")]
    pub backoff: Duration,

    /// Object store scheme used to build destination URIs ("gs", "s3", "az", "file")
    #[serde(default = "default_storage_scheme")]
    pub storage_scheme: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
            storage_scheme: default_storage_scheme(),
        }
    }
}

fn default_max_attempts() -> u32 {
    DEFAULT_UPLOAD_MAX_ATTEMPTS
}

fn default_backoff() -> Duration {
    DEFAULT_UPLOAD_BACKOFF
}

fn default_storage_scheme() -> String {
    DEFAULT_STORAGE_SCHEME.to_string()
}

/// Load the agent config from a YAML file, or defaults when no file is given
pub fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    let Some(path) = path else {
        return Ok(AgentConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let cfg: AgentConfig = serde_yaml::from_str(&text)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    if cfg.upload.max_attempts == 0 {
        anyhow::bail!("upload.max_attempts must be at least 1");
    }
    Ok(cfg)
}

impl AgentConfig {
    /// Resolve every configured file name against the working directory
    pub fn layout(&self) -> Layout {
        let wd = &self.working_directory;
        let zk_working_dir = resolve(wd, &self.files.zookeeper_working_dir);
        Layout {
            working_dir: wd.clone(),
            agent_log: resolve(wd, &self.files.agent_log),
            database_log: resolve(wd, &self.files.database_log),
            monitor_log: resolve(wd, &self.files.monitor_log),
            storage_key: resolve(wd, &self.files.storage_key),
            etcd_data_dir: resolve(wd, &self.files.etcd_data_dir),
            consul_data_dir: resolve(wd, &self.files.consul_data_dir),
            zk_data_dir: resolve(wd, &self.files.zookeeper_data_dir),
            zk_config: resolve(&zk_working_dir, &self.files.zookeeper_config),
            zk_working_dir,
        }
    }
}

fn resolve(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

/// Absolute on-disk locations the agent reads and writes
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub working_dir: PathBuf,
    pub agent_log: PathBuf,
    pub database_log: PathBuf,
    pub monitor_log: PathBuf,
    pub storage_key: PathBuf,
    pub etcd_data_dir: PathBuf,
    pub consul_data_dir: PathBuf,
    pub zk_working_dir: PathBuf,
    pub zk_data_dir: PathBuf,
    pub zk_config: PathBuf,
}

impl Layout {
    /// Proxy output goes next to the engine log: `database.log-zetcd`
    pub fn proxy_log(&self, proxy: ProxyKind) -> PathBuf {
        let mut name = self.database_log.as_os_str().to_owned();
        name.push("-");
        name.push(proxy.database_name());
        PathBuf::from(name)
    }
}
