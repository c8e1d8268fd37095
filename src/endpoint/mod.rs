//! Endpoint capability contract shared by the local filesystem and remote SFTP servers.
//!
//! The transfer core only ever talks to a remote endpoint through
//! [`EndpointSession`]; sessions are produced by a [`Connector`] and owned by
//! the connection registry.

use std::future::Future;
use std::path::Path;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::EndpointConfig;
use crate::error::{AppError, Result};

pub mod local;
#[cfg(test)]
pub(crate) mod mock;
pub mod sftp;

/// Reserved endpoint id identifying the local filesystem.
pub const LOCAL_ENDPOINT_ID: &str = "__LOCAL__";

pub fn is_local(endpoint_id: &str) -> bool {
    endpoint_id == LOCAL_ENDPOINT_ID
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ItemKind {
    File,
    Directory,
}

/// Snapshot of one file or directory as seen by a listing.
///
/// Items are never mutated; a fresh listing produces fresh items.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointItem {
    pub name: String,
    /// Absolute path: POSIX on remote endpoints, platform-native locally.
    pub path: String,
    pub kind: ItemKind,
    /// Size in bytes, meaningful for files only.
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
    /// Octal permission bits, e.g. `644`. Empty when unknown.
    pub permissions: String,
    pub is_symlink: bool,
    /// Endpoint this item was listed from.
    pub endpoint_id: String,
}

impl EndpointItem {
    pub fn is_dir(&self) -> bool {
        self.kind == ItemKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == ItemKind::File
    }
}

/// Order used by every listing: directories first, then by name.
pub(crate) fn sort_items(items: &mut [EndpointItem]) {
    items.sort_by(|a, b| match (a.is_dir(), b.is_dir()) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.name.cmp(&b.name),
    });
}

pub(crate) fn format_permissions(mode: Option<u32>) -> String {
    mode.map(|m| format!("{:o}", m & 0o7777)).unwrap_or_default()
}

/// Progress callback: `(transferred_bytes, total_bytes)`.
///
/// May be invoked any number of times; the last call is not guaranteed to
/// report `transferred == total`.
pub type ProgressFn<'a> = dyn Fn(u64, u64) + Send + Sync + 'a;

/// Optional progress reporting and cancellation for a single get/put.
#[derive(Clone, Copy, Default)]
pub struct TransferHooks<'a> {
    progress: Option<&'a ProgressFn<'a>>,
    cancel: Option<&'a CancellationToken>,
}

impl<'a> TransferHooks<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress(mut self, progress: &'a ProgressFn<'a>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancel(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn report(&self, transferred: u64, total: u64) {
        if let Some(progress) = self.progress {
            progress(transferred, total);
        }
    }

    /// `Err(Cancelled)` once cancellation has been requested.
    pub fn checkpoint(&self) -> Result<()> {
        match self.cancel {
            Some(token) if token.is_cancelled() => Err(AppError::Cancelled),
            _ => Ok(()),
        }
    }
}

/// Operations offered by a connected remote endpoint.
///
/// Every fallible operation reports endpoint failures as `Err`, carrying the
/// endpoint's own message.
pub trait EndpointSession: Send + Sync + 'static {
    /// Id of the endpoint this session belongs to.
    fn endpoint_id(&self) -> &str;

    /// Close the session. Errors are logged, never returned.
    fn disconnect(&self) -> impl Future<Output = ()> + Send;

    /// One directory level, not recursive.
    fn list(&self, path: &str) -> impl Future<Output = Result<Vec<EndpointItem>>> + Send;

    /// `Ok(None)` when nothing exists at `path`.
    fn stat(&self, path: &str) -> impl Future<Output = Result<Option<EndpointItem>>> + Send;

    fn exists(&self, path: &str) -> impl Future<Output = bool> + Send;

    /// Download `remote_path` into `local_path`, creating local parents as needed.
    fn get(
        &self,
        remote_path: &str,
        local_path: &Path,
        hooks: TransferHooks<'_>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Upload `local_path` to `remote_path`, replacing any existing file.
    fn put(
        &self,
        local_path: &Path,
        remote_path: &str,
        hooks: TransferHooks<'_>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove a file, or a directory together with everything below it.
    fn delete(&self, path: &str) -> impl Future<Output = Result<()>> + Send;

    /// Create a directory and any missing parents. Existing directories are fine.
    fn mkdir(&self, path: &str) -> impl Future<Output = Result<()>> + Send;

    /// Remove a directory tree. Fails when `path` is not a directory.
    fn rmdir(&self, path: &str) -> impl Future<Output = Result<()>> + Send;

    fn rename(&self, old_path: &str, new_path: &str) -> impl Future<Output = Result<()>> + Send;

    /// `mode` is an octal string such as `"755"`.
    fn chmod(&self, path: &str, mode: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Opens sessions for configured endpoints.
pub trait Connector: Send + Sync + 'static {
    type Session: EndpointSession;

    fn open(&self, config: &EndpointConfig) -> impl Future<Output = Result<Self::Session>> + Send;
}

/// Parse an octal permission string like `"0755"` or `"644"`.
pub fn parse_mode(mode: &str) -> Result<u32> {
    let digits = mode.trim();
    let parsed = u32::from_str_radix(digits, 8)
        .map_err(|_| AppError::ValidationError(format!("Invalid file mode: {mode}")))?;
    if parsed > 0o7777 || digits.is_empty() {
        return Err(AppError::ValidationError(format!("Invalid file mode: {mode}")));
    }
    Ok(parsed)
}
