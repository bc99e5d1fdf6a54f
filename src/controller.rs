// src/controller.rs
//
// Lifecycle controller: Idle -> Running -> Stopped
//
// Owns every piece of mutable agent state. The gRPC service holds it behind a
// single async mutex, so commands are applied one at a time; background tasks
// (reapers, the monitoring loop) only ever see snapshots.

use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command::{Command, DatabaseKind, Destination, Operation};
use crate::config::{AgentConfig, Layout};
use crate::constants::SHUTDOWN_JOIN_TIMEOUT;
use crate::engine::EngineSpec;
use crate::error::ControllerError;
use crate::monitor::{spawn_monitor, MonitorExit, MonitorHandle, UploadKind};
use crate::process::{self, LaunchError, LaunchSpec, ManagedProcess};
use crate::upload::{ArtifactSet, RetryPolicy, UploadPipeline, UploadReport};
use crate::uploader::{write_key_file, UploaderFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Running,
    Stopped,
}

/// Result of one command
#[derive(Debug)]
pub struct Outcome {
    pub state: State,
    /// Report of the upload pass this command triggered, if any.
    /// Dropping it does not cancel the pass.
    pub upload: Option<oneshot::Receiver<UploadReport>>,
}

pub struct Controller {
    config: AgentConfig,
    layout: Layout,
    pipeline: UploadPipeline,
    shutdown_tx: broadcast::Sender<()>,

    state: State,
    request: Option<Command>,
    engine: Option<EngineSpec>,
    primary: Option<ManagedProcess>,
    proxy: Option<ManagedProcess>,
    monitor: Option<MonitorHandle>,

    // background tasks that outlived their handles; joined at shutdown
    reapers: Vec<JoinHandle<Option<ExitStatus>>>,
    monitors: Vec<JoinHandle<MonitorExit>>,
}

type CtlResult<T> = std::result::Result<T, ControllerError>;

fn launch_error(spec: &LaunchSpec, e: LaunchError) -> ControllerError {
    match e {
        LaunchError::Spawn(source) => ControllerError::Spawn {
            program: spec.program.clone(),
            source,
        },
        LaunchError::Log(e) => ControllerError::Internal(e),
    }
}

impl Controller {
    pub fn new(config: AgentConfig, factory: Arc<dyn UploaderFactory>) -> Self {
        let layout = config.layout();
        let pipeline = UploadPipeline::new(factory, RetryPolicy::from(&config.upload));
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            config,
            layout,
            pipeline,
            shutdown_tx,
            state: State::Idle,
            request: None,
            engine: None,
            primary: None,
            proxy: None,
            monitor: None,
            reapers: Vec::new(),
            monitors: Vec::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Pids of the tracked primary and proxy, in that order
    pub fn tracked_pids(&self) -> Vec<u32> {
        self.primary
            .iter()
            .chain(self.proxy.iter())
            .map(ManagedProcess::pid)
            .collect()
    }

    pub fn monitor_running(&self) -> bool {
        self.monitor.as_ref().is_some_and(|m| !m.is_finished())
    }

    /// The last command, with destination fields as merged by UploadLog
    pub fn last_request(&self) -> Option<&Command> {
        self.request.as_ref()
    }

    pub async fn handle(&mut self, cmd: Command) -> CtlResult<Outcome> {
        match self.target_database(&cmd) {
            Some(db) => info!("received {:?} for {} (state {:?})", cmd.operation, db, self.state),
            None => info!("received {:?} (state {:?})", cmd.operation, self.state),
        }
        match cmd.operation {
            Operation::Start => self.start(cmd).await,
            Operation::Stop => self.stop().await,
            Operation::UploadLog => self.upload_log(cmd).await,
        }
    }

    /// Only Start names the engine; Stop and UploadLog act on the tracked one
    fn target_database(&self, cmd: &Command) -> Option<DatabaseKind> {
        match cmd.operation {
            Operation::Start => Some(cmd.database),
            Operation::Stop | Operation::UploadLog => self.request.as_ref().map(|r| r.database),
        }
    }

    async fn start(&mut self, cmd: Command) -> CtlResult<Outcome> {
        if self.state == State::Running {
            return Err(ControllerError::InvalidState {
                operation: "Start",
                state: self.state,
                reason: "a process is already running",
            });
        }
        if !self.layout.working_dir.is_dir() {
            return Err(ControllerError::Configuration(anyhow::anyhow!(
                "working directory {:?} does not exist",
                self.layout.working_dir
            )));
        }
        let engine = EngineSpec::from_command(&cmd, &self.config, &self.layout)
            .map_err(ControllerError::Configuration)?;
        engine.check_installed().map_err(ControllerError::Configuration)?;

        info!("working directory: {:?}", self.layout.working_dir);
        info!("database log path: {:?}", self.layout.database_log);
        if let Some(p) = engine.proxy_log() {
            info!("proxy database log path: {:?}", p);
        }
        info!("monitor result path: {:?}", self.layout.monitor_log);
        info!("agent log path: {:?}", self.layout.agent_log);

        engine.prepare()?;
        if !cmd.destination.key.is_empty() {
            info!("writing storage key to {:?}", self.layout.storage_key);
            write_key_file(&self.layout.storage_key, &cmd.destination.key)?;
        }

        let primary_spec = engine.primary_launch(&self.layout.database_log);
        let primary = process::spawn(&primary_spec).map_err(|e| launch_error(&primary_spec, e))?;
        let pid = primary.pid();

        self.prune_finished();
        let monitor = spawn_monitor(
            pid,
            self.config.timing.sample_interval,
            &self.layout.monitor_log,
            self.pipeline.clone(),
            self.shutdown_tx.subscribe(),
        );

        let proxy_spec = engine.proxy_launch();
        self.primary = Some(primary);
        self.monitor = Some(monitor);
        self.engine = Some(engine);
        self.request = Some(cmd);
        self.state = State::Running;

        // the engine stays tracked even if the proxy fails, so Stop can clean up
        if let Some(spec) = proxy_spec {
            let proxy = process::spawn(&spec).map_err(|e| launch_error(&spec, e))?;
            self.proxy = Some(proxy);
        }

        info!("start success (PIDs {:?})", self.tracked_pids());
        Ok(Outcome { state: self.state, upload: None })
    }

    async fn stop(&mut self) -> CtlResult<Outcome> {
        if self.primary.is_none() {
            return Err(ControllerError::InvalidState {
                operation: "Stop",
                state: self.state,
                reason: "no process is running",
            });
        }

        let grace = self.config.timing.grace_period;
        info!("stopping in {:?}", grace);
        tokio::time::sleep(grace).await;

        let mut signal_error = None;
        let mut stopped = Vec::new();
        for mut p in self.primary.take().into_iter().chain(self.proxy.take()) {
            info!("sending SIGTERM to {:?} [PID: {}]", p.command_line(), p.pid());
            if let Err(source) = p.terminate() {
                error!("failed to signal PID {} ({})", p.pid(), source);
                signal_error.get_or_insert(ControllerError::Signal { pid: p.pid(), source });
            }
            p.close_log();
            stopped.push(p);
        }
        self.reapers.extend(stopped.into_iter().map(ManagedProcess::into_reaper));

        let upload = match self.monitor.take() {
            Some(monitor) => {
                let rx = self.request_upload(&monitor, UploadKind::Stop).await;
                self.monitors.push(monitor.into_join());
                rx
            }
            None => None,
        };
        self.state = State::Stopped;

        match signal_error {
            Some(e) => Err(e),
            None => {
                info!("stop success");
                Ok(Outcome { state: self.state, upload })
            }
        }
    }

    async fn upload_log(&mut self, cmd: Command) -> CtlResult<Outcome> {
        if self.state != State::Running || self.monitor.is_none() {
            return Err(ControllerError::InvalidState {
                operation: "UploadLog",
                state: self.state,
                reason: "no process is running",
            });
        }
        if let Some(req) = self.request.as_mut() {
            req.destination.merge_from(&cmd.destination);
        }
        if !cmd.destination.key.is_empty() {
            write_key_file(&self.layout.storage_key, &cmd.destination.key)?;
        }

        let grace = self.config.timing.grace_period;
        info!("uploading logs in {:?}", grace);
        tokio::time::sleep(grace).await;

        for p in self.primary.iter().chain(self.proxy.iter()) {
            if let Err(e) = p.flush_log() {
                warn!("{:#}", e);
            }
        }

        let Some(monitor) = self.monitor.as_ref() else {
            return Err(anyhow::anyhow!("monitoring loop is gone").into());
        };
        let (artifacts, destination) = self.snapshot();
        let rx = monitor
            .request(UploadKind::UploadLog, artifacts, destination)
            .await?;
        info!("upload log success");
        Ok(Outcome { state: self.state, upload: Some(rx) })
    }

    async fn request_upload(
        &self,
        monitor: &MonitorHandle,
        kind: UploadKind,
    ) -> Option<oneshot::Receiver<UploadReport>> {
        let (artifacts, destination) = self.snapshot();
        match monitor.request(kind, artifacts, destination).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                error!("cannot trigger {:?} upload ({:#})", kind, e);
                None
            }
        }
    }

    /// What the next upload pass works on
    fn snapshot(&self) -> (ArtifactSet, Destination) {
        let artifacts = ArtifactSet {
            database_log: self.layout.database_log.clone(),
            proxy_log: self
                .engine
                .as_ref()
                .and_then(EngineSpec::proxy_log)
                .map(Path::to_path_buf),
            monitor_table: self.layout.monitor_log.clone(),
            agent_log: self.layout.agent_log.clone(),
        };
        let destination = self
            .request
            .as_ref()
            .map(|r| r.destination.clone())
            .unwrap_or_default();
        (artifacts, destination)
    }

    fn prune_finished(&mut self) {
        self.reapers.retain(|h| !h.is_finished());
        self.monitors.retain(|h| !h.is_finished());
    }

    /// Stop the monitoring loop without uploading and join background tasks.
    ///
    /// Engines still tracked are left running; the agent never owned their
    /// data and the next Start wipes it anyway.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(m) = self.monitor.take() {
            self.monitors.push(m.into_join());
        }
        for p in self.primary.iter().chain(self.proxy.iter()) {
            if p.has_exited() {
                debug!("{:?} [PID: {}] already exited", p.command_line(), p.pid());
            } else {
                warn!("leaving {:?} [PID: {}] running", p.command_line(), p.pid());
            }
        }

        let monitors = std::mem::take(&mut self.monitors);
        let reapers = std::mem::take(&mut self.reapers);
        let joined = tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, async {
            for res in futures::future::join_all(monitors).await {
                match res {
                    Ok(exit) => info!("monitoring loop exited ({:?})", exit),
                    Err(e) => error!("monitoring loop panicked: {}", e),
                }
            }
            for res in futures::future::join_all(reapers).await {
                if let Err(e) = res {
                    error!("reaper task panicked: {}", e);
                }
            }
        })
        .await;
        if joined.is_err() {
            warn!("background tasks still running after {:?}", SHUTDOWN_JOIN_TIMEOUT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ZooKeeperTuning;
    use crate::uploader::Uploader;

    struct NoUpload;

    impl UploaderFactory for NoUpload {
        fn create(&self, _d: &Destination) -> anyhow::Result<Arc<dyn Uploader>> {
            anyhow::bail!("uploads disabled")
        }
    }

    fn controller(dir: &Path) -> Controller {
        let mut cfg = AgentConfig {
            working_directory: dir.to_path_buf(),
            ..Default::default()
        };
        cfg.binaries.etcd = dir.join("etcd");
        Controller::new(cfg, Arc::new(NoUpload))
    }

    fn cmd(operation: Operation, index: usize, peers: &[&str]) -> Command {
        Command {
            operation,
            database: DatabaseKind::EtcdV3,
            server_index: index,
            peers: peers.iter().map(|p| p.to_string()).collect(),
            zookeeper: ZooKeeperTuning::default(),
            destination: Destination::default(),
        }
    }

    #[tokio::test]
    async fn test_stop_and_upload_log_require_running_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller(dir.path());

        let err = c.handle(cmd(Operation::Stop, 0, &[])).await.unwrap_err();
        assert!(matches!(err, ControllerError::InvalidState { state: State::Idle, .. }));
        let err = c.handle(cmd(Operation::UploadLog, 0, &[])).await.unwrap_err();
        assert!(matches!(err, ControllerError::InvalidState { .. }));
        assert_eq!(c.state(), State::Idle);
    }

    #[tokio::test]
    async fn test_start_with_missing_binary_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller(dir.path());

        let err = c.handle(cmd(Operation::Start, 0, &["127.0.0.1"])).await.unwrap_err();
        assert!(matches!(err, ControllerError::Configuration(_)));
        assert_eq!(c.state(), State::Idle);
        assert!(c.tracked_pids().is_empty());
        assert!(!dir.path().join("database.log").exists());
    }

    #[tokio::test]
    async fn test_start_rejects_missing_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller(&dir.path().join("absent"));
        let err = c.handle(cmd(Operation::Start, 0, &["127.0.0.1"])).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"), "{err}");
    }

    #[tokio::test]
    async fn test_failed_prepare_does_not_write_key() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("etcd"), "#!/bin/sh\n").unwrap();
        // a plain file where the data directory goes cannot be wiped
        std::fs::write(dir.path().join("data.etcd"), "not a directory").unwrap();
        let mut c = controller(dir.path());

        let mut start = cmd(Operation::Start, 0, &["127.0.0.1"]);
        start.destination.key = "{\"type\": \"service_account\"}".into();
        let err = c.handle(start).await.unwrap_err();
        assert!(format!("{:#}", err).contains("data.etcd"), "{err:#}");
        assert!(!dir.path().join("gcloud-key.json").exists());
        assert_eq!(c.state(), State::Idle);
        assert!(c.last_request().is_none());
    }

    #[test]
    fn test_stop_and_upload_log_name_the_tracked_engine() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller(dir.path());
        // wire defaults to etcdv2 when Stop/UploadLog leave the field unset
        let mut stop = cmd(Operation::Stop, 0, &[]);
        stop.database = DatabaseKind::EtcdV2;
        assert_eq!(c.target_database(&stop), None);

        let mut running = cmd(Operation::Start, 0, &["127.0.0.1"]);
        running.database = DatabaseKind::ZooKeeper;
        assert_eq!(c.target_database(&running), Some(DatabaseKind::ZooKeeper));
        c.request = Some(running);

        assert_eq!(c.target_database(&stop), Some(DatabaseKind::ZooKeeper));
        stop.operation = Operation::UploadLog;
        assert_eq!(c.target_database(&stop), Some(DatabaseKind::ZooKeeper));
    }

    #[tokio::test]
    async fn test_shutdown_when_idle_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = controller(dir.path());
        c.shutdown().await;
        assert_eq!(c.state(), State::Idle);
    }
}
