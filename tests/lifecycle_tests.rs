// tests/lifecycle_tests.rs
//
// Start / Stop / UploadLog against the real process runner, using a shell
// script in place of the engine binaries and a recording uploader.

use anyhow::Result;
use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dbagent::command::{Command, DatabaseKind, Destination, Operation, ZooKeeperTuning};
use dbagent::config::AgentConfig;
use dbagent::upload::{ArtifactKind, ArtifactResult};
use dbagent::uploader::{Uploader, UploaderFactory};
use dbagent::{Controller, ControllerError, State};

#[derive(Default)]
struct Recorder {
    /// (bucket, object key)
    uploads: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Uploader for Recorder {
    async fn upload_file(&self, bucket: &str, _src: &Path, dst: &str) -> Result<()> {
        self.uploads.lock().unwrap().push((bucket.to_string(), dst.to_string()));
        Ok(())
    }
}

struct RecordingFactory(Arc<Recorder>);

impl UploaderFactory for RecordingFactory {
    fn create(&self, _d: &Destination) -> Result<Arc<dyn Uploader>> {
        Ok(self.0.clone())
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    recorder: Arc<Recorder>,
    controller: Controller,
}

fn fixture_with(grace: Duration, engine_body: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let engine = write_script(&root, "fake-engine", engine_body);

    let mut cfg = AgentConfig {
        working_directory: root.clone(),
        ..Default::default()
    };
    cfg.binaries.etcd = engine.clone();
    cfg.binaries.zetcd = engine.clone();
    cfg.binaries.cetcd = engine.clone();
    cfg.binaries.consul = engine;
    cfg.timing.grace_period = grace;
    cfg.timing.sample_interval = Duration::from_millis(50);
    cfg.upload.backoff = Duration::from_millis(1);

    let recorder = Arc::new(Recorder::default());
    let controller = Controller::new(cfg, Arc::new(RecordingFactory(recorder.clone())));
    Fixture { _dir: dir, root, recorder, controller }
}

fn fixture() -> Fixture {
    fixture_with(Duration::from_millis(100), "exec sleep 30")
}

fn command(operation: Operation, database: DatabaseKind, index: usize) -> Command {
    Command {
        operation,
        database,
        server_index: index,
        peers: vec!["127.0.0.1".into(), "127.0.0.2".into(), "127.0.0.3".into()],
        zookeeper: ZooKeeperTuning::default(),
        destination: Destination {
            project: "bench-project".into(),
            bucket: "bench-results".into(),
            key: String::new(),
            sub_directory: "run-1".into(),
            test_name: "t".into(),
            server_index: index,
        },
    }
}

fn pid_alive(pid: u32) -> bool {
    let stat = match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(s) => s,
        Err(_) => return false,
    };
    // zombies count as gone
    !stat.contains(") Z ")
}

async fn wait_gone(pid: u32) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if !pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_start_then_stop_uploads_each_artifact_once() {
    let mut f = fixture();
    let out = f.controller.handle(command(Operation::Start, DatabaseKind::EtcdV3, 0)).await.unwrap();
    assert_eq!(out.state, State::Running);
    assert!(out.upload.is_none());

    let pids = f.controller.tracked_pids();
    assert_eq!(pids.len(), 1);
    assert!(pid_alive(pids[0]));
    assert!(f.controller.monitor_running());
    assert!(f.root.join("database.log").exists());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let out = f.controller.handle(command(Operation::Stop, DatabaseKind::EtcdV3, 0)).await.unwrap();
    assert_eq!(out.state, State::Stopped);
    assert!(f.controller.tracked_pids().is_empty());

    let report = out.upload.expect("stop triggers an upload pass").await.unwrap();
    let kinds: Vec<ArtifactKind> = report.outcomes.iter().map(|o| o.kind).collect();
    assert_eq!(kinds, vec![ArtifactKind::DatabaseLog, ArtifactKind::MonitorTable, ArtifactKind::AgentLog]);
    assert!(report.all_uploaded());

    let uploads = f.recorder.uploads.lock().unwrap().clone();
    assert_eq!(
        uploads,
        vec![
            ("bench-results".to_string(), "run-1/t-1-database.log".to_string()),
            ("bench-results".to_string(), "run-1/t-1-monitor.csv".to_string()),
            ("bench-results".to_string(), "run-1/t-1-agent.log".to_string()),
        ]
    );

    assert!(wait_gone(pids[0]).await, "engine should exit after SIGTERM");
    assert!(!f.controller.monitor_running());
    let table = std::fs::read_to_string(f.root.join("monitor.csv")).unwrap();
    assert!(table.lines().count() >= 2, "{table}");
    f.controller.shutdown().await;
}

#[tokio::test]
async fn test_stop_waits_for_grace_period_before_signalling() {
    // default grace period
    let mut f = fixture_with(dbagent::constants::DEFAULT_STOP_GRACE_PERIOD, "exec sleep 30");
    f.controller.handle(command(Operation::Start, DatabaseKind::EtcdV2, 1)).await.unwrap();
    let pid = f.controller.tracked_pids()[0];
    tokio::time::sleep(Duration::from_secs(1)).await;

    let started = Instant::now();
    let out = f.controller.handle(command(Operation::Stop, DatabaseKind::EtcdV2, 1)).await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(3));
    out.upload.unwrap().await.unwrap();

    assert_eq!(f.recorder.uploads.lock().unwrap().len(), 3);
    assert!(wait_gone(pid).await);
}

#[tokio::test]
async fn test_proxy_engine_tracks_two_processes() {
    let mut f = fixture();
    f.controller.handle(command(Operation::Start, DatabaseKind::Zetcd, 0)).await.unwrap();

    let pids = f.controller.tracked_pids();
    assert_eq!(pids.len(), 2);
    assert_ne!(pids[0], pids[1]);
    assert!(f.root.join("database.log-zetcd").exists());

    let out = f.controller.handle(command(Operation::Stop, DatabaseKind::Zetcd, 0)).await.unwrap();
    let report = out.upload.unwrap().await.unwrap();
    let proxy = report.outcome(ArtifactKind::ProxyLog).expect("proxy log is part of the pass");
    assert_eq!(proxy.destination, "run-1/t-1-database.log-zetcd");
    assert!(matches!(proxy.result, ArtifactResult::Uploaded { .. }));
    for pid in pids {
        assert!(wait_gone(pid).await);
    }
}

#[tokio::test]
async fn test_upload_log_keeps_process_and_merges_destination() {
    let mut f = fixture();
    let mut start = command(Operation::Start, DatabaseKind::EtcdV3, 2);
    start.destination.key = "{\"type\":\"service_account\"}".into();
    f.controller.handle(start).await.unwrap();
    let pids = f.controller.tracked_pids();
    assert!(f.root.join("gcloud-key.json").exists());

    let mut upload = command(Operation::UploadLog, DatabaseKind::EtcdV3, 2);
    upload.destination.bucket = "other-bucket".into();
    upload.destination.sub_directory = "run-2".into();
    let out = f.controller.handle(upload).await.unwrap();
    assert_eq!(out.state, State::Running);
    out.upload.unwrap().await.unwrap();

    assert_eq!(f.controller.tracked_pids(), pids);
    assert!(pid_alive(pids[0]));
    assert!(f.controller.monitor_running());

    let dest = &f.controller.last_request().unwrap().destination;
    assert_eq!(dest.bucket, "other-bucket");
    assert_eq!(dest.test_name, "t");
    assert!(!dest.key.is_empty(), "an empty key must not erase the stored one");

    let uploads = f.recorder.uploads.lock().unwrap().clone();
    assert_eq!(uploads[0], ("other-bucket".to_string(), "run-2/t-3-database.log".to_string()));

    f.controller.handle(command(Operation::Stop, DatabaseKind::EtcdV3, 2)).await.unwrap();
    assert!(wait_gone(pids[0]).await);
}

#[tokio::test]
async fn test_repeated_upload_log_then_restart_gets_fresh_process() {
    let mut f = fixture();
    f.controller.handle(command(Operation::Start, DatabaseKind::EtcdV3, 0)).await.unwrap();
    let first = f.controller.tracked_pids();
    assert_eq!(first.len(), 1);

    for bucket in ["bench-results", "bench-results", "other-bucket"] {
        let mut upload = command(Operation::UploadLog, DatabaseKind::EtcdV3, 0);
        upload.destination.bucket = bucket.into();
        let out = f.controller.handle(upload).await.unwrap();
        assert_eq!(out.state, State::Running);
        assert!(out.upload.unwrap().await.unwrap().all_uploaded());

        assert_eq!(f.controller.tracked_pids(), first);
        assert!(pid_alive(first[0]));
        assert!(f.controller.monitor_running());
    }
    let buckets: Vec<String> = f.recorder.uploads.lock().unwrap().iter().map(|(b, _)| b.clone()).collect();
    assert_eq!(buckets.len(), 9);
    assert!(buckets[..6].iter().all(|b| b == "bench-results"));
    assert!(buckets[6..].iter().all(|b| b == "other-bucket"));

    let out = f.controller.handle(command(Operation::Stop, DatabaseKind::EtcdV3, 0)).await.unwrap();
    out.upload.unwrap().await.unwrap();
    assert!(wait_gone(first[0]).await);

    f.controller.handle(command(Operation::Start, DatabaseKind::EtcdV3, 0)).await.unwrap();
    let second = f.controller.tracked_pids();
    assert_eq!(second.len(), 1);
    assert_ne!(second, first);
    assert!(pid_alive(second[0]));
    assert!(f.controller.monitor_running());

    f.controller.handle(command(Operation::Stop, DatabaseKind::EtcdV3, 0)).await.unwrap();
    assert!(wait_gone(second[0]).await);
}

#[tokio::test]
async fn test_second_start_while_running_is_rejected() {
    let mut f = fixture();
    f.controller.handle(command(Operation::Start, DatabaseKind::EtcdV3, 0)).await.unwrap();
    let pids = f.controller.tracked_pids();

    let err = f.controller.handle(command(Operation::Start, DatabaseKind::EtcdV3, 0)).await.unwrap_err();
    assert!(matches!(err, ControllerError::InvalidState { state: State::Running, .. }));
    assert_eq!(f.controller.tracked_pids(), pids);

    f.controller.handle(command(Operation::Stop, DatabaseKind::EtcdV3, 0)).await.unwrap();
}

#[tokio::test]
async fn test_out_of_range_index_has_no_side_effects() {
    let mut f = fixture();
    std::fs::create_dir_all(f.root.join("data.etcd")).unwrap();

    let err = f.controller.handle(command(Operation::Start, DatabaseKind::EtcdV3, 3)).await.unwrap_err();
    assert!(matches!(err, ControllerError::Configuration(_)));
    assert_eq!(f.controller.state(), State::Idle);
    assert!(f.root.join("data.etcd").exists());
    assert!(!f.root.join("database.log").exists());
}

#[tokio::test]
async fn test_start_wipes_previous_data_directory() {
    let mut f = fixture();
    let stale = f.root.join("data.etcd/member/stale");
    std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
    std::fs::write(&stale, "old").unwrap();

    f.controller.handle(command(Operation::Start, DatabaseKind::EtcdV3, 0)).await.unwrap();
    assert!(!stale.exists());
    f.controller.handle(command(Operation::Stop, DatabaseKind::EtcdV3, 0)).await.unwrap();
}

#[tokio::test]
async fn test_stop_after_engine_exit_reports_signal_error_and_clears_handles() {
    let mut f = fixture_with(Duration::from_millis(10), "exit 0");
    f.controller.handle(command(Operation::Start, DatabaseKind::EtcdV3, 0)).await.unwrap();
    let pid = f.controller.tracked_pids()[0];
    assert!(wait_gone(pid).await);
    // let the reaper collect the exit status
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = f.controller.handle(command(Operation::Stop, DatabaseKind::EtcdV3, 0)).await.unwrap_err();
    assert!(matches!(err, ControllerError::Signal { .. }), "{err}");
    assert_eq!(f.controller.state(), State::Stopped);
    assert!(f.controller.tracked_pids().is_empty());

    // the upload pass still runs and the loop winds down
    let deadline = Instant::now() + Duration::from_secs(5);
    while f.controller.monitor_running() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!f.controller.monitor_running());

    // Stopped -> Start is allowed
    f.controller.handle(command(Operation::Start, DatabaseKind::EtcdV3, 0)).await.unwrap();
    assert_eq!(f.controller.state(), State::Running);
    let _ = f.controller.handle(command(Operation::Stop, DatabaseKind::EtcdV3, 0)).await;
}

#[tokio::test]
async fn test_shutdown_skips_upload() {
    let mut f = fixture();
    f.controller.handle(command(Operation::Start, DatabaseKind::EtcdV3, 0)).await.unwrap();
    let pid = f.controller.tracked_pids()[0];

    f.controller.shutdown().await;
    assert!(!f.controller.monitor_running());
    assert!(f.recorder.uploads.lock().unwrap().is_empty());

    // shutdown leaves the engine alone
    assert!(pid_alive(pid));
    dbagent::process::terminate(pid).unwrap();
    assert!(wait_gone(pid).await);
}

#[tokio::test]
async fn test_shutdown_after_engine_exit_completes() {
    let mut f = fixture_with(Duration::from_millis(10), "exit 0");
    f.controller.handle(command(Operation::Start, DatabaseKind::EtcdV3, 0)).await.unwrap();
    let pid = f.controller.tracked_pids()[0];
    assert!(wait_gone(pid).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    f.controller.shutdown().await;
    assert!(started.elapsed() < dbagent::constants::SHUTDOWN_JOIN_TIMEOUT);
    assert!(!f.controller.monitor_running());
    assert!(f.recorder.uploads.lock().unwrap().is_empty());
}
