// src/upload.rs
//
// Upload pipeline: push every run artifact to the configured bucket
//
// Artifacts go up one after another in a fixed order. Each has its own retry
// loop (fixed backoff, bounded attempts); a failure is logged and the next
// artifact is still attempted. Nothing here fails the caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::command::Destination;
use crate::config::UploadConfig;
use crate::uploader::{join_key, Uploader, UploaderFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    DatabaseLog,
    ProxyLog,
    MonitorTable,
    AgentLog,
}

impl ArtifactKind {
    pub fn describe(self) -> &'static str {
        match self {
            ArtifactKind::DatabaseLog => "database log",
            ArtifactKind::ProxyLog => "proxy database log",
            ArtifactKind::MonitorTable => "monitor results",
            ArtifactKind::AgentLog => "agent logs",
        }
    }
}

/// Snapshot of artifact locations taken when a pass is requested
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactSet {
    pub database_log: PathBuf,
    /// Set only for engines that run a proxy next to them
    pub proxy_log: Option<PathBuf>,
    pub monitor_table: PathBuf,
    pub agent_log: PathBuf,
}

impl ArtifactSet {
    /// Upload order: engine log, proxy log, monitor table, agent log
    pub fn ordered(&self) -> Vec<(ArtifactKind, &Path)> {
        let mut v = vec![(ArtifactKind::DatabaseLog, self.database_log.as_path())];
        if let Some(p) = &self.proxy_log {
            v.push((ArtifactKind::ProxyLog, p.as_path()));
        }
        v.push((ArtifactKind::MonitorTable, self.monitor_table.as_path()));
        v.push((ArtifactKind::AgentLog, self.agent_log.as_path()));
        v
    }
}

/// `{test_name}-{server_index+1}-{base}` unless `base` already starts with the test name
pub fn remote_name(test_name: &str, server_index: usize, base: &str) -> String {
    if base.starts_with(test_name) {
        base.to_string()
    } else {
        format!("{}-{}-{}", test_name, server_index + 1, base)
    }
}

/// Object key for a local artifact under the destination's sub-directory
pub fn destination_key(dest: &Destination, src: &Path) -> String {
    let base = src
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    join_key(&dest.sub_directory, &remote_name(&dest.test_name, dest.server_index, &base))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl From<&UploadConfig> for RetryPolicy {
    fn from(c: &UploadConfig) -> Self {
        Self {
            max_attempts: c.max_attempts.max(1),
            backoff: c.backoff,
        }
    }
}

/// Upload with a fixed backoff between attempts.
///
/// Returns the number of attempts used on success, or the attempt count and
/// last error once `max_attempts` is exhausted.
pub async fn upload_with_retry(
    uploader: &dyn Uploader,
    bucket: &str,
    src: &Path,
    dst: &str,
    policy: RetryPolicy,
) -> std::result::Result<u32, (u32, anyhow::Error)> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match uploader.upload_file(bucket, src, dst).await {
            Ok(()) => return Ok(attempt),
            Err(e) if attempt >= policy.max_attempts => return Err((attempt, e)),
            Err(e) => {
                error!("upload of {:?} failed (attempt {}/{})... sleep and retry... ({:#})", src, attempt, policy.max_attempts, e);
                tokio::time::sleep(policy.backoff).await;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactResult {
    Uploaded { attempts: u32 },
    Failed { attempts: u32, error: String },
    /// Expected file was not on disk
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactOutcome {
    pub kind: ArtifactKind,
    pub source: PathBuf,
    pub destination: String,
    pub result: ArtifactResult,
}

/// What one pass did, reported back to whoever requested it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadReport {
    /// Set when no uploader could be built; nothing was attempted
    pub setup_error: Option<String>,
    pub outcomes: Vec<ArtifactOutcome>,
}

impl UploadReport {
    pub fn all_uploaded(&self) -> bool {
        self.setup_error.is_none()
            && self
                .outcomes
                .iter()
                .all(|o| matches!(o.result, ArtifactResult::Uploaded { .. }))
    }

    pub fn outcome(&self, kind: ArtifactKind) -> Option<&ArtifactOutcome> {
        self.outcomes.iter().find(|o| o.kind == kind)
    }
}

#[derive(Clone)]
pub struct UploadPipeline {
    factory: Arc<dyn UploaderFactory>,
    policy: RetryPolicy,
}

impl UploadPipeline {
    pub fn new(factory: Arc<dyn UploaderFactory>, policy: RetryPolicy) -> Self {
        Self { factory, policy }
    }

    /// One pass over all artifacts. Never fails; see the report.
    pub async fn run(&self, artifacts: &ArtifactSet, dest: &Destination) -> UploadReport {
        info!("uploading to storage {:?} (bucket {:?})", dest.project, dest.bucket);
        let uploader = match self.factory.create(dest) {
            Ok(u) => u,
            Err(e) => {
                error!("cannot create uploader ({:#})", e);
                return UploadReport {
                    setup_error: Some(format!("{:#}", e)),
                    outcomes: vec![],
                };
            }
        };

        let mut report = UploadReport::default();
        for (kind, src) in artifacts.ordered() {
            let dst = destination_key(dest, src);
            if kind == ArtifactKind::ProxyLog && !src.exists() {
                error!("{:?} is expected, but doesn't exist!", src);
                report.outcomes.push(ArtifactOutcome {
                    kind,
                    source: src.to_path_buf(),
                    destination: dst,
                    result: ArtifactResult::Missing,
                });
                continue;
            }

            info!("uploading {} [{:?} -> {:?}]", kind.describe(), src, dst);
            let result = match upload_with_retry(uploader.as_ref(), &dest.bucket, src, &dst, self.policy).await {
                Ok(attempts) => ArtifactResult::Uploaded { attempts },
                Err((attempts, e)) => {
                    warn!("giving up on {} {:?} after {} attempts ({:#})", kind.describe(), src, attempts, e);
                    ArtifactResult::Failed {
                        attempts,
                        error: format!("{:#}", e),
                    }
                }
            };
            report.outcomes.push(ArtifactOutcome {
                kind,
                source: src.to_path_buf(),
                destination: dst,
                result,
            });
        }
        report
    }
}
