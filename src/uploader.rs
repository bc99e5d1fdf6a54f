// src/uploader.rs
//
// Object storage uploads
//
// `Uploader` is the seam the upload pipeline talks to. The production
// implementation writes through s3dlio's ObjectStore, so any backend it
// supports (gs://, s3://, az://, file://) can receive artifacts.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use s3dlio::object_store::store_for_uri;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::command::Destination;

#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload one local file to `dst` (an object key) inside `bucket`
    async fn upload_file(&self, bucket: &str, src: &Path, dst: &str) -> Result<()>;

    /// Upload every file under `src`, keeping relative paths below `dst`.
    ///
    /// Files go up concurrently. The first failure is returned and the
    /// uploads still in flight are dropped (cancelled).
    async fn upload_dir(&self, bucket: &str, src: &Path, dst: &str) -> Result<()> {
        let files = collect_files(src)?;
        let count = files.len();
        let mut pending: FuturesUnordered<_> = files
            .iter()
            .map(|path| {
                let rel = path.strip_prefix(src).unwrap_or(path);
                let target = join_key(dst, &rel.to_string_lossy());
                async move {
                    debug!("uploading {:?} ---> {:?}", path, target);
                    self.upload_file(bucket, path, &target)
                        .await
                        .with_context(|| format!("upload of {} failed", path.display()))
                }
            })
            .collect();

        while let Some(res) = pending.next().await {
            res?;
        }
        info!("finished uploading {:?} ({} files)", src, count);
        Ok(())
    }
}

/// Regular files below `dir`, in a stable order
pub fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Join object key segments with '/', ignoring empty segments
pub fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let name = name.trim_start_matches('/');
    match (prefix.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{}/{}", prefix, name),
    }
}

/// Builds an uploader for one upload pass.
///
/// Credentials can change between passes (UploadLog carries new destination
/// fields), so the pipeline asks for a fresh uploader every time.
pub trait UploaderFactory: Send + Sync {
    fn create(&self, destination: &Destination) -> Result<Arc<dyn Uploader>>;
}

/// s3dlio-backed uploader: `{scheme}://{bucket}/{key}`
#[derive(Debug, Clone)]
pub struct ObjectStoreUploader {
    scheme: String,
}

impl ObjectStoreUploader {
    pub fn new(scheme: impl Into<String>) -> Self {
        Self { scheme: scheme.into() }
    }

    pub fn object_uri(&self, bucket: &str, key: &str) -> String {
        format!("{}://{}", self.scheme, join_key(bucket, key))
    }
}

#[async_trait]
impl Uploader for ObjectStoreUploader {
    async fn upload_file(&self, bucket: &str, src: &Path, dst: &str) -> Result<()> {
        let uri = self.object_uri(bucket, dst);
        info!("uploading {:?} ---> {:?}", src, uri);
        let data = tokio::fs::read(src)
            .await
            .with_context(|| format!("Failed to read {}", src.display()))?;
        let store = store_for_uri(&uri).map_err(|e| anyhow::anyhow!(e))?;
        store
            .put(&uri, &data)
            .await
            .with_context(|| format!("Failed to PUT {}", uri))?;
        info!("finished uploading {:?}", src);
        Ok(())
    }
}

/// Production factory. Key bytes from a command are persisted to the fixed
/// key path; the process environment is not touched here.
#[derive(Debug, Clone)]
pub struct ObjectStoreFactory {
    scheme: String,
    key_path: PathBuf,
}

impl ObjectStoreFactory {
    pub fn new(scheme: impl Into<String>, key_path: PathBuf) -> Self {
        Self {
            scheme: scheme.into(),
            key_path,
        }
    }
}

impl UploaderFactory for ObjectStoreFactory {
    fn create(&self, destination: &Destination) -> Result<Arc<dyn Uploader>> {
        if destination.bucket.is_empty() {
            anyhow::bail!("no bucket configured for upload");
        }
        if !destination.key.is_empty() {
            write_key_file(&self.key_path, &destination.key)?;
        }
        Ok(Arc::new(ObjectStoreUploader::new(self.scheme.clone())))
    }
}

/// Variables the Google storage client reads its credentials from.
///
/// The agent exports these once at startup, before any thread exists. The
/// key file itself may be (re)written later; its path never changes.
pub fn credential_env(key_path: &Path, project: Option<&str>) -> Vec<(&'static str, OsString)> {
    let mut vars = vec![("GOOGLE_APPLICATION_CREDENTIALS", key_path.as_os_str().to_owned())];
    if let Some(p) = project.filter(|p| !p.is_empty()) {
        vars.push(("GOOGLE_CLOUD_PROJECT", OsString::from(p)));
    }
    vars
}

/// Write the service-account key with owner-only permissions.
/// A new file is created as 0600, so the key is never readable by others.
pub fn write_key_file(path: &Path, key: &str) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    // mode() only applies on creation; tighten a pre-existing file too
    f.set_permissions(std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to restrict permissions of {}", path.display()))?;
    f.write_all(key.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
