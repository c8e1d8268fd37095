//! SFTP endpoint implementation using `russh` and `russh_sftp`.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::DateTime;
use russh::client;
use russh::keys::{self, PrivateKeyWithHashAlg, ssh_key};
use russh::Disconnect;
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpClientError;
use russh_sftp::client::fs::Metadata;
use russh_sftp::protocol::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    Connector, EndpointItem, EndpointSession, ItemKind, TransferHooks, format_permissions,
    parse_mode, sort_items,
};
use crate::config::{AppSettings, AuthMethod, EndpointConfig};
use crate::error::{AppError, Result};
use crate::utils::{posix_file_name, posix_join};

const CHUNK_SIZE: usize = 64 * 1024;

struct SshHandler {}

impl client::Handler for SshHandler {
    type Error = AppError;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Opens [`SftpEndpoint`] sessions over SSH.
#[derive(Clone, Debug)]
pub struct SftpConnector {
    connection_timeout: Duration,
}

impl SftpConnector {
    pub fn new(settings: &AppSettings) -> Self {
        Self {
            connection_timeout: Duration::from_secs(settings.connection_timeout.max(1)),
        }
    }

    async fn authenticate(
        session: &mut client::Handle<SshHandler>,
        config: &EndpointConfig,
    ) -> Result<()> {
        let auth_result = match &config.auth {
            AuthMethod::Password { password } => {
                session
                    .authenticate_password(&config.username, password)
                    .await?
            }
            AuthMethod::PublicKey { passphrase, .. } => {
                let key_path = config.private_key_path().ok_or_else(|| {
                    AppError::AuthenticationError("Private key path missing".to_string())
                })?;
                let private_key = keys::load_secret_key(&key_path, passphrase.as_deref())
                    .map_err(|e| {
                        AppError::AuthenticationError(format!(
                            "Failed to load private key {}: {e}",
                            key_path.display()
                        ))
                    })?;
                let algo = session.best_supported_rsa_hash().await?.flatten();
                let key = PrivateKeyWithHashAlg::new(Arc::new(private_key), algo);
                session.authenticate_publickey(&config.username, key).await?
            }
        };

        if !auth_result.success() {
            return Err(AppError::AuthenticationError(format!(
                "Authentication failed for {}@{}",
                config.username,
                config.host_port()
            )));
        }
        Ok(())
    }
}

impl Connector for SftpConnector {
    type Session = SftpEndpoint;

    async fn open(&self, config: &EndpointConfig) -> Result<SftpEndpoint> {
        info!("Opening SFTP session to {}", config.host_port());
        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: Some(self.connection_timeout * 3),
            ..Default::default()
        });

        let connect = client::connect(ssh_config, config.host_port(), SshHandler {});
        let mut session = tokio::time::timeout(self.connection_timeout, connect)
            .await
            .map_err(|_| {
                AppError::SshConnectionError(format!(
                    "Timed out connecting to {}",
                    config.host_port()
                ))
            })??;

        Self::authenticate(&mut session, config).await?;

        let channel = session.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| AppError::SftpError(format!("SFTP session creation failed: {e}")))?;

        info!("SFTP session to {} established", config.host_port());
        Ok(SftpEndpoint {
            endpoint_id: config.name.clone(),
            sftp,
            handle: Mutex::new(Some(session)),
            closed: AtomicBool::new(false),
        })
    }
}

/// A live SFTP session bound to one configured endpoint.
pub struct SftpEndpoint {
    endpoint_id: String,
    sftp: SftpSession,
    handle: Mutex<Option<client::Handle<SshHandler>>>,
    closed: AtomicBool,
}

impl SftpEndpoint {
    /// True once the SSH transport under this session has gone away.
    async fn transport_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
            || self
                .handle
                .lock()
                .await
                .as_ref()
                .is_none_or(|handle| handle.is_closed())
    }

    async fn ensure_open(&self) -> Result<()> {
        if self.transport_closed().await {
            return Err(AppError::ConnectionLost(self.endpoint_id.clone()));
        }
        Ok(())
    }

    /// Map a russh-sftp failure, reporting a dead transport as [`AppError::ConnectionLost`].
    async fn sftp_failure(&self, e: SftpClientError, context: String) -> AppError {
        if is_transport_error(&e) || self.transport_closed().await {
            warn!("SFTP transport to {} lost: {}", self.endpoint_id, e);
            return AppError::ConnectionLost(format!("{}: {e}", self.endpoint_id));
        }
        AppError::SftpError(format!("{context}: {e}"))
    }

    /// Same as [`Self::sftp_failure`] for errors surfacing from a byte stream.
    async fn stream_failure(&self, e: AppError) -> AppError {
        if !e.is_cancelled() && self.transport_closed().await {
            return AppError::ConnectionLost(format!("{}: {e}", self.endpoint_id));
        }
        e
    }

    fn item(
        &self,
        name: String,
        path: String,
        metadata: &Metadata,
        is_dir: bool,
        is_symlink: bool,
    ) -> EndpointItem {
        EndpointItem {
            name,
            path,
            kind: if is_dir {
                ItemKind::Directory
            } else {
                ItemKind::File
            },
            size: if is_dir { 0 } else { metadata.size.unwrap_or(0) },
            modified_at: metadata
                .mtime
                .and_then(|t| DateTime::from_timestamp(i64::from(t), 0)),
            permissions: format_permissions(metadata.permissions),
            is_symlink,
            endpoint_id: self.endpoint_id.clone(),
        }
    }

    async fn metadata(&self, path: &str) -> Option<Metadata> {
        self.sftp.metadata(path).await.ok()
    }

    /// lstat: a symlink is reported as itself, never as its target.
    async fn link_metadata(&self, path: &str) -> Result<Metadata> {
        match self.sftp.symlink_metadata(path).await {
            Ok(metadata) => Ok(metadata),
            Err(e) => Err(self.sftp_failure(e, format!("Cannot stat '{path}'")).await),
        }
    }

    /// Remove a directory tree: files as they are found, directories deepest first.
    async fn remove_tree(&self, root: &str) -> Result<()> {
        let mut pending = vec![root.to_string()];
        let mut directories = Vec::new();

        while let Some(dir) = pending.pop() {
            for entry in self.sftp.read_dir(dir.as_str()).await? {
                let name = entry.file_name();
                if name == "." || name == ".." {
                    continue;
                }
                let path = posix_join(&dir, &name);
                if entry.file_type().is_dir() {
                    pending.push(path);
                } else {
                    self.sftp.remove_file(path.as_str()).await?;
                }
            }
            directories.push(dir);
        }

        for dir in directories.into_iter().rev() {
            self.sftp.remove_dir(dir.as_str()).await?;
        }
        Ok(())
    }
}

/// Errors russh-sftp raises once its channel to the server is gone.
fn is_transport_error(e: &SftpClientError) -> bool {
    match e {
        SftpClientError::Status(status) => matches!(
            status.status_code,
            StatusCode::NoConnection | StatusCode::ConnectionLost
        ),
        SftpClientError::IO(_) => true,
        SftpClientError::UnexpectedBehavior(message) => {
            ["session closed", "sender dropped", "SendError", "RecvError"]
                .iter()
                .any(|marker| message.contains(marker))
        }
        _ => false,
    }
}

/// Whether lstat `metadata` names a directory to walk, rather than a link or special file.
fn is_real_dir(metadata: &Metadata) -> bool {
    metadata.file_type().is_dir()
}

/// Stream `reader` into `writer`, reporting progress and honouring cancellation per chunk.
async fn copy_with_hooks<R, W>(
    reader: &mut R,
    writer: &mut W,
    total: u64,
    hooks: TransferHooks<'_>,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut transferred = 0u64;
    loop {
        hooks.checkpoint()?;
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n]).await?;
        transferred += n as u64;
        hooks.report(transferred, total);
    }
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(transferred)
}

impl EndpointSession for SftpEndpoint {
    fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.sftp.close().await {
            debug!("SFTP close for {} failed: {}", self.endpoint_id, e);
        }
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.disconnect(Disconnect::ByApplication, "", "").await {
                warn!("SSH disconnect for {} failed: {}", self.endpoint_id, e);
            }
        }
        info!("Disconnected from {}", self.endpoint_id);
    }

    async fn list(&self, path: &str) -> Result<Vec<EndpointItem>> {
        self.ensure_open().await?;
        debug!("SFTP list: {}", path);

        let read_dir = match self.sftp.read_dir(path).await {
            Ok(read_dir) => read_dir,
            Err(e) => {
                error!("SFTP read_dir failed for '{}': {}", path, e);
                return Err(self.sftp_failure(e, format!("Failed to list '{path}'")).await);
            }
        };

        let mut items = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let full_path = posix_join(path, &name);
            let is_symlink = entry.file_type().is_symlink();

            // For symlinks, follow them to check if they point to directories
            let (metadata, is_dir) = if is_symlink {
                match self.metadata(&full_path).await {
                    Some(target) => {
                        let is_dir = target.is_dir();
                        (target, is_dir)
                    }
                    None => (entry.metadata(), false),
                }
            } else {
                (entry.metadata(), entry.file_type().is_dir())
            };

            items.push(self.item(name, full_path, &metadata, is_dir, is_symlink));
        }

        sort_items(&mut items);
        debug!("SFTP list completed for '{}': {} entries", path, items.len());
        Ok(items)
    }

    async fn stat(&self, path: &str) -> Result<Option<EndpointItem>> {
        self.ensure_open().await?;
        let Some(metadata) = self.metadata(path).await else {
            return Ok(None);
        };
        let is_dir = metadata.is_dir();
        Ok(Some(self.item(
            posix_file_name(path).to_string(),
            path.to_string(),
            &metadata,
            is_dir,
            false,
        )))
    }

    async fn exists(&self, path: &str) -> bool {
        self.ensure_open().await.is_ok() && self.metadata(path).await.is_some()
    }

    async fn get(
        &self,
        remote_path: &str,
        local_path: &Path,
        hooks: TransferHooks<'_>,
    ) -> Result<()> {
        self.ensure_open().await?;
        hooks.checkpoint()?;
        debug!("SFTP get: {} -> {}", remote_path, local_path.display());

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let total = self
            .metadata(remote_path)
            .await
            .and_then(|m| m.size)
            .unwrap_or(0);
        let mut remote = match self.sftp.open(remote_path).await {
            Ok(file) => file,
            Err(e) => {
                let context = format!("Failed to open '{remote_path}' for reading");
                return Err(self.sftp_failure(e, context).await);
            }
        };
        let mut local = tokio::fs::File::create(local_path).await?;

        match copy_with_hooks(&mut remote, &mut local, total, hooks).await {
            Ok(bytes) => {
                debug!("SFTP get completed: {} ({} bytes)", remote_path, bytes);
                Ok(())
            }
            Err(e) => {
                drop(local);
                if let Err(cleanup) = tokio::fs::remove_file(local_path).await {
                    debug!(
                        "Failed to remove partial download {}: {}",
                        local_path.display(),
                        cleanup
                    );
                }
                Err(self.stream_failure(e).await)
            }
        }
    }

    async fn put(
        &self,
        local_path: &Path,
        remote_path: &str,
        hooks: TransferHooks<'_>,
    ) -> Result<()> {
        self.ensure_open().await?;
        hooks.checkpoint()?;
        debug!("SFTP put: {} -> {}", local_path.display(), remote_path);

        let mut local = tokio::fs::File::open(local_path).await.map_err(|e| {
            AppError::SftpError(format!(
                "Local file '{}' cannot be read: {e}",
                local_path.display()
            ))
        })?;
        let total = local.metadata().await.map(|m| m.len()).unwrap_or(0);
        let mut remote = match self.sftp.create(remote_path).await {
            Ok(file) => file,
            Err(e) => {
                let context = format!("Failed to open '{remote_path}' for writing");
                return Err(self.sftp_failure(e, context).await);
            }
        };

        match copy_with_hooks(&mut local, &mut remote, total, hooks).await {
            Ok(bytes) => {
                debug!("SFTP put completed: {} ({} bytes)", remote_path, bytes);
                Ok(())
            }
            Err(e) => {
                drop(remote);
                let e = self.stream_failure(e).await;
                if !e.is_connection_lost() {
                    if let Err(cleanup) = self.sftp.remove_file(remote_path).await {
                        debug!("Failed to remove partial upload {}: {}", remote_path, cleanup);
                    }
                }
                Err(e)
            }
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.ensure_open().await?;
        debug!("SFTP delete: {}", path);
        let metadata = self.link_metadata(path).await?;

        if is_real_dir(&metadata) {
            self.remove_tree(path).await
        } else {
            self.sftp.remove_file(path).await.map_err(|e| {
                error!("SFTP delete failed for '{}': {}", path, e);
                AppError::SftpError(format!("Failed to delete '{path}': {e}"))
            })
        }
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.ensure_open().await?;
        debug!("SFTP mkdir: {}", path);

        let mut current = if path.starts_with('/') {
            "/".to_string()
        } else {
            String::new()
        };
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = posix_join(&current, component);
            match self.metadata(&current).await {
                Some(metadata) if metadata.is_dir() => continue,
                Some(_) => {
                    return Err(AppError::SftpError(format!(
                        "'{current}' exists and is not a directory"
                    )));
                }
                None => {
                    if let Err(e) = self.sftp.create_dir(current.as_str()).await {
                        // Lost a race with another creator; only a directory is acceptable.
                        match self.metadata(&current).await {
                            Some(metadata) if metadata.is_dir() => {}
                            _ => {
                                return Err(AppError::SftpError(format!(
                                    "Failed to create directory '{current}': {e}"
                                )));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        self.ensure_open().await?;
        let metadata = self.link_metadata(path).await?;
        if is_real_dir(&metadata) {
            self.remove_tree(path).await
        } else {
            Err(AppError::SftpError(format!("'{path}' is not a directory")))
        }
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.ensure_open().await?;
        debug!("SFTP rename: {} -> {}", old_path, new_path);
        if let Err(e) = self.sftp.rename(old_path, new_path).await {
            let context = format!("Failed to rename '{old_path}' to '{new_path}'");
            return Err(self.sftp_failure(e, context).await);
        }
        Ok(())
    }

    async fn chmod(&self, path: &str, mode: &str) -> Result<()> {
        self.ensure_open().await?;
        let mode = parse_mode(mode)?;
        let mut attrs = match self.sftp.metadata(path).await {
            Ok(attrs) => attrs,
            Err(e) => return Err(self.sftp_failure(e, format!("Cannot stat '{path}'")).await),
        };

        // Only the permission bits are sent back
        attrs.size = None;
        attrs.uid = None;
        attrs.gid = None;
        attrs.atime = None;
        attrs.mtime = None;
        attrs.permissions = Some((attrs.permissions.unwrap_or(0) & !0o7777) | mode);

        if let Err(e) = self.sftp.set_metadata(path, attrs).await {
            let context = format!("Failed to change mode of '{path}'");
            return Err(self.sftp_failure(e, context).await);
        }
        Ok(())
    }
}
