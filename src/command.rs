// src/command.rs
//
// Domain model for inbound Transfer requests
// The wire message is flat; here it is split into what the agent acts on
// (operation, engine, topology, tuning) and where artifacts are shipped.

use anyhow::{bail, Result};

use crate::constants::PEER_SEPARATOR;
use crate::pb::dbagent as pb;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Stop,
    UploadLog,
}

/// Engines the agent knows how to launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseKind {
    EtcdV2,
    EtcdV3,
    /// etcd fronted by the zetcd ZooKeeper proxy
    Zetcd,
    /// etcd fronted by the cetcd Consul proxy
    Cetcd,
    ZooKeeper,
    Consul,
}

/// Protocol translation proxies that run next to an etcd member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    Zetcd,
    Cetcd,
}

impl ProxyKind {
    /// Name used in log file suffixes, identical to the wire enum name
    pub fn database_name(self) -> &'static str {
        match self {
            ProxyKind::Zetcd => "zetcd",
            ProxyKind::Cetcd => "cetcd",
        }
    }
}

impl DatabaseKind {
    pub fn name(self) -> &'static str {
        match self {
            DatabaseKind::EtcdV2 => "etcdv2",
            DatabaseKind::EtcdV3 => "etcdv3",
            DatabaseKind::Zetcd => "zetcd",
            DatabaseKind::Cetcd => "cetcd",
            DatabaseKind::ZooKeeper => "ZooKeeper",
            DatabaseKind::Consul => "Consul",
        }
    }

    pub fn proxy(self) -> Option<ProxyKind> {
        match self {
            DatabaseKind::Zetcd => Some(ProxyKind::Zetcd),
            DatabaseKind::Cetcd => Some(ProxyKind::Cetcd),
            _ => None,
        }
    }

    /// Case-insensitive parse, accepts the wire enum names
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "etcdv2" => DatabaseKind::EtcdV2,
            "etcdv3" | "etcd" => DatabaseKind::EtcdV3,
            "zetcd" => DatabaseKind::Zetcd,
            "cetcd" => DatabaseKind::Cetcd,
            "zookeeper" | "zk" => DatabaseKind::ZooKeeper,
            "consul" => DatabaseKind::Consul,
            other => bail!("unknown database {:?}", other),
        })
    }
}

impl std::fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// ZooKeeper knobs carried by the command; other engines ignore them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZooKeeperTuning {
    pub my_id: u32,
    pub max_client_cnxns: i64,
    pub snap_count: i64,
}

/// Where and under which names artifacts are uploaded
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Destination {
    pub project: String,
    pub bucket: String,
    /// Service-account key (JSON); empty means "keep whatever is on disk"
    pub key: String,
    pub sub_directory: String,
    pub test_name: String,
    pub server_index: usize,
}

impl Destination {
    /// Take the storage fields of a later command, keeping test identity.
    /// An empty key does not erase a key received earlier.
    pub fn merge_from(&mut self, other: &Destination) {
        self.project = other.project.clone();
        self.bucket = other.bucket.clone();
        self.sub_directory = other.sub_directory.clone();
        if !other.key.is_empty() {
            self.key = other.key.clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub operation: Operation,
    pub database: DatabaseKind,
    pub server_index: usize,
    pub peers: Vec<String>,
    pub zookeeper: ZooKeeperTuning,
    pub destination: Destination,
}

impl Command {
    /// Start needs to find itself in the peer list
    pub fn validate(&self) -> Result<()> {
        if self.operation == Operation::Start {
            if self.peers.is_empty() {
                bail!("no peer addresses given");
            }
            if self.server_index >= self.peers.len() {
                bail!(
                    "server index {} is out of range for {} peers",
                    self.server_index,
                    self.peers.len()
                );
            }
        }
        Ok(())
    }
}

/// Split the wire peer string, dropping empty segments
pub fn parse_peers(s: &str) -> Vec<String> {
    s.split(PEER_SEPARATOR)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn join_peers<S: AsRef<str>>(peers: &[S]) -> String {
    peers
        .iter()
        .map(|p| p.as_ref())
        .collect::<Vec<_>>()
        .join(PEER_SEPARATOR)
}

impl TryFrom<pb::Request> for Command {
    type Error = anyhow::Error;

    fn try_from(r: pb::Request) -> Result<Self> {
        let operation = match pb::request::Operation::try_from(r.operation) {
            Ok(pb::request::Operation::Start) => Operation::Start,
            Ok(pb::request::Operation::Stop) => Operation::Stop,
            Ok(pb::request::Operation::UploadLog) => Operation::UploadLog,
            Err(_) => bail!("Not implemented operation {}", r.operation),
        };
        let database = match pb::request::Database::try_from(r.database) {
            Ok(pb::request::Database::Etcdv2) => DatabaseKind::EtcdV2,
            Ok(pb::request::Database::Etcdv3) => DatabaseKind::EtcdV3,
            Ok(pb::request::Database::Zetcd) => DatabaseKind::Zetcd,
            Ok(pb::request::Database::Cetcd) => DatabaseKind::Cetcd,
            Ok(pb::request::Database::ZooKeeper) => DatabaseKind::ZooKeeper,
            Ok(pb::request::Database::Consul) => DatabaseKind::Consul,
            Err(_) => bail!("unknown database {}", r.database),
        };
        let server_index = r.server_index as usize;
        let cmd = Command {
            operation,
            database,
            server_index,
            peers: parse_peers(&r.peer_ip_string),
            zookeeper: ZooKeeperTuning {
                my_id: r.zookeeper_my_id,
                max_client_cnxns: r.zookeeper_max_client_cnxns,
                snap_count: r.zookeeper_snap_count,
            },
            destination: Destination {
                project: r.google_cloud_project_name,
                bucket: r.google_cloud_storage_bucket_name,
                key: r.google_cloud_storage_key,
                sub_directory: r.google_cloud_storage_sub_directory,
                test_name: r.test_name,
                server_index,
            },
        };
        cmd.validate()?;
        Ok(cmd)
    }
}

impl From<&Command> for pb::Request {
    fn from(c: &Command) -> Self {
        let operation = match c.operation {
            Operation::Start => pb::request::Operation::Start,
            Operation::Stop => pb::request::Operation::Stop,
            Operation::UploadLog => pb::request::Operation::UploadLog,
        };
        let database = match c.database {
            DatabaseKind::EtcdV2 => pb::request::Database::Etcdv2,
            DatabaseKind::EtcdV3 => pb::request::Database::Etcdv3,
            DatabaseKind::Zetcd => pb::request::Database::Zetcd,
            DatabaseKind::Cetcd => pb::request::Database::Cetcd,
            DatabaseKind::ZooKeeper => pb::request::Database::ZooKeeper,
            DatabaseKind::Consul => pb::request::Database::Consul,
        };
        pb::Request {
            operation: operation as i32,
            database: database as i32,
            peer_ip_string: join_peers(&c.peers),
            server_index: c.server_index as u32,
            zookeeper_my_id: c.zookeeper.my_id,
            zookeeper_max_client_cnxns: c.zookeeper.max_client_cnxns,
            zookeeper_snap_count: c.zookeeper.snap_count,
            google_cloud_project_name: c.destination.project.clone(),
            google_cloud_storage_key: c.destination.key.clone(),
            google_cloud_storage_bucket_name: c.destination.bucket.clone(),
            google_cloud_storage_sub_directory: c.destination.sub_directory.clone(),
            test_name: c.destination.test_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_request() -> pb::Request {
        pb::Request {
            operation: pb::request::Operation::Start as i32,
            database: pb::request::Database::Etcdv3 as i32,
            peer_ip_string: "10.0.0.1___10.0.0.2___10.0.0.3".to_string(),
            server_index: 1,
            test_name: "bench".to_string(),
            google_cloud_storage_bucket_name: "results".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_peers_keeps_order() {
        assert_eq!(
            parse_peers("10.0.0.1___10.0.0.2___10.0.0.3"),
            vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]
        );
        assert_eq!(parse_peers(""), Vec::<String>::new());
        assert_eq!(parse_peers("a______b___"), vec!["a", "b"]);
    }

    #[test]
    fn test_join_then_parse_peers() {
        let peers = vec!["h1".to_string(), "h2".to_string()];
        assert_eq!(join_peers(&peers), "h1___h2");
        assert_eq!(parse_peers(&join_peers(&peers)), peers);
    }

    #[test]
    fn test_request_to_command() {
        let cmd = Command::try_from(start_request()).unwrap();
        assert_eq!(cmd.operation, Operation::Start);
        assert_eq!(cmd.database, DatabaseKind::EtcdV3);
        assert_eq!(cmd.server_index, 1);
        assert_eq!(cmd.peers[cmd.server_index], "10.0.0.2");
        assert_eq!(cmd.destination.server_index, 1);
        assert_eq!(cmd.destination.test_name, "bench");
    }

    #[test]
    fn test_start_rejects_out_of_range_index() {
        let mut req = start_request();
        req.server_index = 3;
        let err = Command::try_from(req).unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");
    }

    #[test]
    fn test_stop_does_not_need_peers() {
        let req = pb::Request {
            operation: pb::request::Operation::Stop as i32,
            ..Default::default()
        };
        let cmd = Command::try_from(req).unwrap();
        assert_eq!(cmd.operation, Operation::Stop);
    }

    #[test]
    fn test_unknown_enum_values_rejected() {
        let mut req = start_request();
        req.operation = 42;
        assert!(Command::try_from(req).is_err());

        let mut req = start_request();
        req.database = 17;
        assert!(Command::try_from(req).is_err());
    }

    #[test]
    fn test_destination_merge_keeps_identity() {
        let mut dest = Destination {
            project: "p1".into(),
            bucket: "b1".into(),
            key: "{\"k\":1}".into(),
            sub_directory: "run-1".into(),
            test_name: "bench".into(),
            server_index: 2,
        };
        let later = Destination {
            project: "p2".into(),
            bucket: "b2".into(),
            key: String::new(),
            sub_directory: "run-2".into(),
            test_name: "other".into(),
            server_index: 0,
        };
        dest.merge_from(&later);
        assert_eq!(dest.project, "p2");
        assert_eq!(dest.bucket, "b2");
        assert_eq!(dest.sub_directory, "run-2");
        assert_eq!(dest.key, "{\"k\":1}");
        assert_eq!(dest.test_name, "bench");
        assert_eq!(dest.server_index, 2);
    }

    #[test]
    fn test_database_kind_parse_and_proxy() {
        assert_eq!(DatabaseKind::parse("ZooKeeper").unwrap(), DatabaseKind::ZooKeeper);
        assert_eq!(DatabaseKind::parse("zetcd").unwrap().proxy(), Some(ProxyKind::Zetcd));
        assert_eq!(DatabaseKind::parse("cetcd").unwrap().proxy(), Some(ProxyKind::Cetcd));
        assert_eq!(DatabaseKind::EtcdV3.proxy(), None);
        assert!(DatabaseKind::parse("mysql").is_err());
    }

    #[test]
    fn test_command_wire_roundtrip_preserves_fields() {
        let cmd = Command::try_from(start_request()).unwrap();
        let back = Command::try_from(pb::Request::from(&cmd)).unwrap();
        assert_eq!(back, cmd);
    }
}
