// src/process.rs
//
// Process runner: launch an engine binary with its output appended to a log
// file, reap it in the background, and stop it with SIGTERM.

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// What to run and where its output goes
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub log_path: PathBuf,
    pub current_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(program: &Path, args: Vec<String>, log_path: &Path) -> Self {
        Self {
            program: program.to_path_buf(),
            args,
            log_path: log_path.to_path_buf(),
            current_dir: None,
        }
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Human-readable command line for logs
    pub fn command_line(&self) -> String {
        let mut s = self.program.display().to_string();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

/// Open (creating if needed) a file for appending
pub fn open_to_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Failure modes of `spawn`, kept apart so callers can classify them
#[derive(Debug)]
pub enum LaunchError {
    /// The log file could not be opened
    Log(anyhow::Error),
    /// The OS refused to create the process
    Spawn(std::io::Error),
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::Log(e) => write!(f, "{:#}", e),
            LaunchError::Spawn(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for LaunchError {}

/// A running child tracked by the agent
#[derive(Debug)]
pub struct ManagedProcess {
    pid: u32,
    command_line: String,
    log_path: PathBuf,
    log: Option<File>,
    reaper: JoinHandle<Option<ExitStatus>>,
}

/// Start the process and return once the OS has created it.
///
/// stdout and stderr share one append-mode log file. A reaper task awaits the
/// exit and logs the status; it never blocks the caller.
pub fn spawn(spec: &LaunchSpec) -> std::result::Result<ManagedProcess, LaunchError> {
    let log = open_to_append(&spec.log_path)
        .with_context(|| format!("Failed to open log file {}", spec.log_path.display()))
        .map_err(LaunchError::Log)?;
    let stdout = log
        .try_clone()
        .context("Failed to duplicate log handle")
        .map_err(LaunchError::Log)?;
    let stderr = log
        .try_clone()
        .context("Failed to duplicate log handle")
        .map_err(LaunchError::Log)?;

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    if let Some(dir) = &spec.current_dir {
        cmd.current_dir(dir);
    }

    let command_line = spec.command_line();
    info!("starting binary {:?}", command_line);
    let mut child = cmd.spawn().map_err(LaunchError::Spawn)?;
    let pid = child
        .id()
        .ok_or_else(|| LaunchError::Spawn(std::io::Error::other("child exited before its pid was read")))?;
    info!("started binary {:?} [PID: {}]", command_line, pid);

    let reaped_line = command_line.clone();
    let reaper = tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => {
                info!("exiting {:?} [PID: {}]", reaped_line, pid);
                Some(status)
            }
            Ok(status) => {
                warn!("binary {:?} [PID: {}] exited with {}", reaped_line, pid, status);
                Some(status)
            }
            Err(e) => {
                error!("wait on {:?} [PID: {}] returned error {}", reaped_line, pid, e);
                None
            }
        }
    });

    Ok(ManagedProcess {
        pid,
        command_line,
        log_path: spec.log_path.clone(),
        log: Some(log),
        reaper,
    })
}

/// Send SIGTERM. Returns as soon as the kernel accepts the signal.
pub fn terminate(pid: u32) -> nix::Result<()> {
    let raw = i32::try_from(pid).map_err(|_| nix::errno::Errno::ESRCH)?;
    kill(Pid::from_raw(raw), Signal::SIGTERM)
}

impl ManagedProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn has_exited(&self) -> bool {
        self.reaper.is_finished()
    }

    pub fn terminate(&self) -> nix::Result<()> {
        terminate(self.pid)
    }

    /// fsync the log without closing it
    pub fn flush_log(&self) -> Result<()> {
        if let Some(f) = &self.log {
            f.sync_all()
                .with_context(|| format!("Failed to sync {}", self.log_path.display()))?;
        }
        Ok(())
    }

    /// fsync and drop the agent's handle on the log file
    pub fn close_log(&mut self) {
        if let Some(f) = self.log.take() {
            if let Err(e) = f.sync_all() {
                warn!("sync of {:?} failed before close: {}", self.log_path, e);
            }
        }
    }

    /// Give up the handle, keeping only the reaper for a later join
    pub fn into_reaper(mut self) -> JoinHandle<Option<ExitStatus>> {
        self.close_log();
        self.reaper
    }
}
