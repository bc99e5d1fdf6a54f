// src/monitor.rs
//
// Monitoring loop bound to one engine pid
//
// Samples once per interval into a CSV table and runs upload passes when the
// controller asks for them. A Stop pass ends the loop; an UploadLog pass
// does not. A shutdown broadcast ends it immediately, without uploading.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::command::Destination;
use crate::proc_monitor::{ProcessSample, ProcessSampler};
use crate::process::open_to_append;
use crate::upload::{ArtifactSet, UploadPipeline, UploadReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    /// Final pass; the loop exits after it
    Stop,
    /// Intermediate pass; sampling continues
    UploadLog,
}

/// One upload trigger, with snapshots of everything the pass needs
#[derive(Debug)]
pub struct UploadRequest {
    pub kind: UploadKind,
    pub artifacts: ArtifactSet,
    pub destination: Destination,
    pub reply: oneshot::Sender<UploadReport>,
}

/// Why the loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// Final upload pass done
    Stopped,
    /// Shutdown broadcast received; nothing uploaded
    Interrupted,
    /// Controller dropped its sender
    Detached,
}

/// Controller-side handle to a running loop
#[derive(Debug)]
pub struct MonitorHandle {
    tx: mpsc::Sender<UploadRequest>,
    join: JoinHandle<MonitorExit>,
}

impl MonitorHandle {
    /// Queue an upload pass; the report arrives on the returned receiver
    pub async fn request(
        &self,
        kind: UploadKind,
        artifacts: ArtifactSet,
        destination: Destination,
    ) -> Result<oneshot::Receiver<UploadReport>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(UploadRequest { kind, artifacts, destination, reply })
            .await
            .map_err(|_| anyhow::anyhow!("monitoring loop is no longer running"))?;
        Ok(rx)
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn into_join(self) -> JoinHandle<MonitorExit> {
        self.join
    }
}

/// Appends samples to the monitoring CSV
pub struct TableWriter {
    path: PathBuf,
}

impl TableWriter {
    pub fn new(path: &Path) -> Self {
        Self { path: path.to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row; the header is written only into an empty file
    pub fn append(&self, sample: &ProcessSample) -> Result<()> {
        let file = open_to_append(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        let empty = file.metadata().map(|m| m.len() == 0).unwrap_or(true);
        let mut w = csv::WriterBuilder::new().has_headers(empty).from_writer(file);
        w.serialize(sample).context("Failed to write sample row")?;
        w.flush().context("Failed to flush monitor table")?;
        Ok(())
    }
}

/// Spawn the loop for `pid`. The first sample is taken immediately.
pub fn spawn_monitor(
    pid: u32,
    interval: Duration,
    table_path: &Path,
    pipeline: UploadPipeline,
    shutdown: broadcast::Receiver<()>,
) -> MonitorHandle {
    let (tx, rx) = mpsc::channel(4);
    let table = TableWriter::new(table_path);
    let join = tokio::spawn(run(ProcessSampler::new(pid), interval, table, pipeline, rx, shutdown));
    MonitorHandle { tx, join }
}

async fn run(
    mut sampler: ProcessSampler,
    every: Duration,
    table: TableWriter,
    pipeline: UploadPipeline,
    mut rx: mpsc::Receiver<UploadRequest>,
    mut shutdown: broadcast::Receiver<()>,
) -> MonitorExit {
    info!("monitoring PID {} every {:?} into {:?}", sampler.pid(), every, table.path());
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match sampler.sample() {
                    Ok(sample) => {
                        if let Err(e) = table.append(&sample) {
                            error!("monitoring error ({:#})", e);
                        }
                    }
                    // engine exit is expected after Stop; keep waiting for the upload signal
                    Err(e) => debug!("sampling PID {} failed ({:#})", sampler.pid(), e),
                }
            }

            req = rx.recv() => {
                let Some(req) = req else {
                    warn!("monitoring loop for PID {} detached", sampler.pid());
                    return MonitorExit::Detached;
                };
                info!("{:?} signal received; uploading artifacts", req.kind);
                let report = pipeline.run(&req.artifacts, &req.destination).await;
                if req.reply.send(report).is_err() {
                    debug!("upload report dropped by requester");
                }
                if req.kind == UploadKind::Stop {
                    info!("monitoring loop for PID {} finished", sampler.pid());
                    return MonitorExit::Stopped;
                }
            }

            _ = shutdown.recv() => {
                info!("received interrupt; exiting monitor for PID {}", sampler.pid());
                return MonitorExit::Interrupted;
            }
        }
    }
}
