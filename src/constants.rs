// src/constants.rs
//
// Central location for all constants used throughout dbagent
// Paths, ports, and timings that the agent and the tester must agree on live here

use std::time::Duration;

// =============================================================================
// Agent Server
// =============================================================================

/// Default gRPC listen address for the agent
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3500";

/// Separator used on the wire to join peer addresses into one string
pub const PEER_SEPARATOR: &str = "___";

// =============================================================================
// Working Directory Layout
// =============================================================================

/// Controller (agent) log; also shipped as an artifact
pub const AGENT_LOG_FILE: &str = "agent.log";

/// Combined stdout/stderr of the engine process
pub const DATABASE_LOG_FILE: &str = "database.log";

/// Per-second resource usage table of the engine process
pub const MONITOR_LOG_FILE: &str = "monitor.csv";

/// Service-account key written from the Start command
pub const STORAGE_KEY_FILE: &str = "gcloud-key.json";

pub const ETCD_DATA_DIR: &str = "data.etcd";
pub const CONSUL_DATA_DIR: &str = "data.consul";

/// ZooKeeper runs from its own directory (jar + lib/ + conf/ live there)
pub const ZK_WORKING_DIR: &str = "zookeeper";
pub const ZK_DATA_DIR: &str = "zookeeper/data.zk";
pub const ZK_CONFIG_FILE: &str = "zookeeper.config";
pub const ZK_MYID_FILE: &str = "myid";

// =============================================================================
// Engine Defaults
// =============================================================================

pub const ETCD_CLIENT_PORT: u16 = 2379;
pub const ETCD_PEER_PORT: u16 = 2380;
pub const ETCD_CLUSTER_TOKEN: &str = "etcd_token";

/// zetcd listens for ZooKeeper clients here and forwards to etcd
pub const ZETCD_LISTEN_ADDR: &str = "0.0.0.0:2181";

/// cetcd listens for Consul clients here and forwards to etcd
pub const CETCD_LISTEN_ADDR: &str = "0.0.0.0:8500";

pub const ZK_TICK_TIME: u32 = 2000;
pub const ZK_CLIENT_PORT: u16 = 2181;
pub const ZK_INIT_LIMIT: u32 = 5;
pub const ZK_SYNC_LIMIT: u32 = 5;
pub const ZK_MAX_CLIENT_CNXNS: i64 = 60;
pub const ZK_QUORUM_PORT: u16 = 2888;
pub const ZK_ELECTION_PORT: u16 = 3888;

pub const ZK_MAIN_CLASS: &str = "org.apache.zookeeper.server.quorum.QuorumPeerMain";

/// Classpath relative to the ZooKeeper working directory (3.4.9 release layout)
pub const ZK_CLASSPATH: &str = "zookeeper-3.4.9.jar:lib/slf4j-api-1.6.1.jar:lib/slf4j-log4j12-1.6.1.jar:lib/log4j-1.2.16.jar:conf";

pub const DEFAULT_JAVA_BINARY: &str = "/usr/bin/java";

// =============================================================================
// Lifecycle Timing
// =============================================================================

/// Wait before Stop/UploadLog act, so the monitor gets a few final samples
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Resource sampling period of the monitoring loop
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound for joining background tasks during agent shutdown
pub const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Upload Retry
// =============================================================================

/// Attempts per artifact before the upload is abandoned
pub const DEFAULT_UPLOAD_MAX_ATTEMPTS: u32 = 30;

/// Fixed delay between upload attempts
pub const DEFAULT_UPLOAD_BACKOFF: Duration = Duration::from_secs(2);

/// URI scheme handed to the object store (gs, s3, az, file)
pub const DEFAULT_STORAGE_SCHEME: &str = "gs";

// =============================================================================
// Controller Client
// =============================================================================

/// Connection timeout used by dbagent-ctl
pub const CTL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Stop and UploadLog hold the RPC for the grace period, so allow well beyond it
pub const CTL_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
