//! Transfer execution: paste topologies, single-file transfers, multi-item
//! delete and directory listing.
//!
//! Sessions are looked up in the registry for every item rather than held for
//! the length of a batch, so an endpoint that disconnects halfway shows up as
//! [`AppError::NotConnected`] on the next item.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::endpoint::{
    Connector, EndpointItem, EndpointSession, ProgressFn, TransferHooks, is_local, local,
};
use crate::error::{AppError, Result};
use crate::registry::ConnectionRegistry;
use crate::utils::posix_join;

pub mod manage;
pub mod tree;

pub use manage::{change_mode, create_file, create_folder, rename_entry};
pub use tree::TreeStats;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferOperation {
    Copy,
    Cut,
}

/// A captured copy or cut selection.
///
/// All items belong to `source_endpoint_id` and there is at least one.
#[derive(Clone, Debug)]
pub struct TransferIntent {
    pub id: Uuid,
    pub operation: TransferOperation,
    pub items: Vec<EndpointItem>,
    pub source_endpoint_id: String,
    pub captured_at: DateTime<Utc>,
}

impl TransferIntent {
    pub fn new(
        operation: TransferOperation,
        items: Vec<EndpointItem>,
        source_endpoint_id: &str,
    ) -> Result<Self> {
        if items.is_empty() {
            return Err(AppError::ValidationError(
                "Nothing selected to transfer".to_string(),
            ));
        }
        if let Some(foreign) = items.iter().find(|i| i.endpoint_id != source_endpoint_id) {
            return Err(AppError::ValidationError(format!(
                "'{}' belongs to '{}', not '{}'",
                foreign.path, foreign.endpoint_id, source_endpoint_id
            )));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            operation,
            items,
            source_endpoint_id: source_endpoint_id.to_string(),
            captured_at: Utc::now(),
        })
    }

    pub fn is_cut(&self) -> bool {
        self.operation == TransferOperation::Cut
    }
}

/// How data has to move between a source and a destination endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topology {
    Upload,
    Download,
    SameEndpoint,
    Relay,
}

impl Topology {
    pub fn classify(source_endpoint_id: &str, dest_endpoint_id: &str) -> Result<Self> {
        match (is_local(source_endpoint_id), is_local(dest_endpoint_id)) {
            (true, false) => Ok(Topology::Upload),
            (false, true) => Ok(Topology::Download),
            (true, true) => Err(AppError::Unsupported(
                "transfers within the local filesystem are not handled here".to_string(),
            )),
            (false, false) if source_endpoint_id == dest_endpoint_id => Ok(Topology::SameEndpoint),
            (false, false) => Ok(Topology::Relay),
        }
    }
}

/// Outcome of a successful paste.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PasteSummary {
    pub topology: Topology,
    pub items: usize,
    pub files: usize,
    pub directories: usize,
}

impl PasteSummary {
    fn new(topology: Topology) -> Self {
        Self {
            topology,
            items: 0,
            files: 0,
            directories: 0,
        }
    }

    fn add_file(&mut self) {
        self.files += 1;
    }

    fn add_tree(&mut self, stats: TreeStats) {
        self.files += stats.files;
        self.directories += stats.directories;
    }
}

async fn resolve<C: Connector>(
    registry: &ConnectionRegistry<C>,
    endpoint_id: &str,
) -> Result<Arc<C::Session>> {
    registry
        .session(endpoint_id)
        .await
        .ok_or_else(|| AppError::NotConnected(endpoint_id.to_string()))
}

/// Mark `endpoint_id` as faulted when `result` failed because its session died.
async fn fault_on_loss<C: Connector, T>(
    registry: &ConnectionRegistry<C>,
    endpoint_id: &str,
    result: Result<T>,
) -> Result<T> {
    if let Err(e) = &result {
        if e.is_connection_lost() {
            registry.report_fault(endpoint_id, e.to_string()).await;
        }
    }
    result
}

/// Run `intent` against `dest_endpoint_id:dest_path`.
///
/// Items are processed one at a time. The first failure aborts the rest of the
/// batch; anything already transferred stays where it landed.
pub async fn execute<C: Connector>(
    registry: &ConnectionRegistry<C>,
    intent: &TransferIntent,
    dest_endpoint_id: &str,
    dest_path: &str,
    staging_root: Option<&Path>,
) -> Result<PasteSummary> {
    let topology = Topology::classify(&intent.source_endpoint_id, dest_endpoint_id)?;
    info!(
        "Paste {:?} of {} item(s) from '{}' to '{}:{}' as {:?}",
        intent.operation,
        intent.items.len(),
        intent.source_endpoint_id,
        dest_endpoint_id,
        dest_path,
        topology
    );

    match topology {
        Topology::Upload => upload_items(registry, intent, dest_endpoint_id, dest_path).await,
        Topology::Download => download_items(registry, intent, dest_path).await,
        Topology::SameEndpoint => same_endpoint(registry, intent, dest_path, staging_root).await,
        Topology::Relay => {
            let staging = local::staging_dir(staging_root, "relay")?;
            let result = relay(registry, intent, dest_endpoint_id, dest_path, staging.path()).await;
            local::discard_staging(staging);
            result
        }
    }
}

async fn upload_items<C: Connector>(
    registry: &ConnectionRegistry<C>,
    intent: &TransferIntent,
    dest_endpoint_id: &str,
    dest_path: &str,
) -> Result<PasteSummary> {
    let mut summary = PasteSummary::new(Topology::Upload);
    for item in &intent.items {
        let session = resolve(registry, dest_endpoint_id).await?;
        let local_path = PathBuf::from(&item.path);
        let remote_path = posix_join(dest_path, &item.name);

        if item.is_dir() {
            let stats =
                tree::push_tree(&*session, &local_path, &remote_path, intent.is_cut()).await?;
            summary.add_tree(stats);
        } else {
            session
                .put(&local_path, &remote_path, TransferHooks::new())
                .await
                .map_err(AppError::during("upload", &item.path))?;
            if intent.is_cut() {
                local::remove_file(&local_path)
                    .await
                    .map_err(AppError::during("delete", &item.path))?;
            }
            summary.add_file();
        }
        summary.items += 1;
        debug!("Uploaded {} -> {}", item.path, remote_path);
    }
    Ok(summary)
}

async fn download_items<C: Connector>(
    registry: &ConnectionRegistry<C>,
    intent: &TransferIntent,
    dest_path: &str,
) -> Result<PasteSummary> {
    let mut summary = PasteSummary::new(Topology::Download);
    for item in &intent.items {
        let session = resolve(registry, &intent.source_endpoint_id).await?;
        let local_path = Path::new(dest_path).join(&item.name);

        if item.is_dir() {
            let stats = tree::pull_tree(&*session, &item.path, &local_path, intent.is_cut()).await?;
            summary.add_tree(stats);
        } else {
            session
                .get(&item.path, &local_path, TransferHooks::new())
                .await
                .map_err(AppError::during("download", &item.path))?;
            if intent.is_cut() {
                session
                    .delete(&item.path)
                    .await
                    .map_err(AppError::during("delete", &item.path))?;
            }
            summary.add_file();
        }
        summary.items += 1;
        debug!("Downloaded {} -> {}", item.path, local_path.display());
    }
    Ok(summary)
}

async fn same_endpoint<C: Connector>(
    registry: &ConnectionRegistry<C>,
    intent: &TransferIntent,
    dest_path: &str,
    staging_root: Option<&Path>,
) -> Result<PasteSummary> {
    let mut summary = PasteSummary::new(Topology::SameEndpoint);
    let endpoint_id = intent.source_endpoint_id.as_str();

    if intent.is_cut() {
        for item in &intent.items {
            let session = resolve(registry, endpoint_id).await?;
            let new_path = posix_join(dest_path, &item.name);
            session
                .rename(&item.path, &new_path)
                .await
                .map_err(AppError::during("move", &item.path))?;
            if item.is_dir() {
                summary.directories += 1;
            } else {
                summary.add_file();
            }
            summary.items += 1;
            debug!("Moved {} -> {}", item.path, new_path);
        }
        return Ok(summary);
    }

    if let Some(dir) = intent.items.iter().find(|i| i.is_dir()) {
        return Err(AppError::Unsupported(format!(
            "copying directory '{}' within one endpoint is not supported, use cut",
            dir.path
        )));
    }

    let staging = local::staging_dir(staging_root, "copy")?;
    let result = copy_files_within(registry, intent, dest_path, staging.path(), &mut summary).await;
    local::discard_staging(staging);
    result.map(|_| summary)
}

async fn copy_files_within<C: Connector>(
    registry: &ConnectionRegistry<C>,
    intent: &TransferIntent,
    dest_path: &str,
    staging: &Path,
    summary: &mut PasteSummary,
) -> Result<()> {
    for item in &intent.items {
        let session = resolve(registry, &intent.source_endpoint_id).await?;
        let temp_path = staging.join(&item.name);
        let new_path = posix_join(dest_path, &item.name);

        session
            .get(&item.path, &temp_path, TransferHooks::new())
            .await
            .map_err(AppError::during("download", &item.path))?;
        session
            .put(&temp_path, &new_path, TransferHooks::new())
            .await
            .map_err(AppError::during("upload", &new_path))?;
        local::remove_file(&temp_path).await?;

        summary.add_file();
        summary.items += 1;
        debug!("Copied {} -> {}", item.path, new_path);
    }
    Ok(())
}

/// Cross-endpoint transfer through `staging`: download everything, upload
/// everything, then remove the sources of a cut.
async fn relay<C: Connector>(
    registry: &ConnectionRegistry<C>,
    intent: &TransferIntent,
    dest_endpoint_id: &str,
    dest_path: &str,
    staging: &Path,
) -> Result<PasteSummary> {
    let mut summary = PasteSummary::new(Topology::Relay);
    let source_id = intent.source_endpoint_id.as_str();

    // Nothing is downloaded unless the destination can take it.
    resolve(registry, dest_endpoint_id).await?;

    for item in &intent.items {
        let source = resolve(registry, source_id).await?;
        let staged = staging.join(&item.name);
        if item.is_dir() {
            tree::pull_tree(&*source, &item.path, &staged, false).await?;
        } else {
            source
                .get(&item.path, &staged, TransferHooks::new())
                .await
                .map_err(AppError::during("download", &item.path))?;
        }
        debug!("Staged {}:{} at {}", source_id, item.path, staged.display());
    }

    for item in &intent.items {
        let dest = resolve(registry, dest_endpoint_id).await?;
        let staged = staging.join(&item.name);
        let remote_path = posix_join(dest_path, &item.name);
        if item.is_dir() {
            let stats = tree::push_tree(&*dest, &staged, &remote_path, false).await?;
            summary.add_tree(stats);
        } else {
            dest.put(&staged, &remote_path, TransferHooks::new())
                .await
                .map_err(AppError::during("upload", &remote_path))?;
            summary.add_file();
        }
        summary.items += 1;
        debug!("Relayed {} -> {}:{}", item.path, dest_endpoint_id, remote_path);
    }

    if intent.is_cut() {
        for item in &intent.items {
            let source = resolve(registry, source_id).await?;
            source
                .delete(&item.path)
                .await
                .map_err(AppError::during("delete", &item.path))?;
        }
    }
    Ok(summary)
}

fn single_file_hooks<'a>(
    progress: Option<&'a ProgressFn<'a>>,
    cancel: &'a CancellationToken,
) -> TransferHooks<'a> {
    let hooks = TransferHooks::new().with_cancel(cancel);
    match progress {
        Some(progress) => hooks.with_progress(progress),
        None => hooks,
    }
}

fn transfer_error(operation: &'static str, path: &str) -> impl FnOnce(AppError) -> AppError {
    let wrap = AppError::during(operation, path);
    move |e: AppError| if e.is_cancelled() { AppError::Cancelled } else { wrap(e) }
}

/// Download one remote file, honouring `cancel` before and during the copy.
pub async fn download_file<C: Connector>(
    registry: &ConnectionRegistry<C>,
    endpoint_id: &str,
    remote_path: &str,
    local_path: &Path,
    progress: Option<&ProgressFn<'_>>,
    cancel: &CancellationToken,
) -> Result<()> {
    let hooks = single_file_hooks(progress, cancel);
    hooks.checkpoint()?;
    let session = resolve(registry, endpoint_id).await?;
    let result = session.get(remote_path, local_path, hooks).await;
    fault_on_loss(registry, endpoint_id, result)
        .await
        .map_err(transfer_error("download", remote_path))?;
    info!("Downloaded {}:{} -> {}", endpoint_id, remote_path, local_path.display());
    Ok(())
}

/// Upload one local file, honouring `cancel` before and during the copy.
pub async fn upload_file<C: Connector>(
    registry: &ConnectionRegistry<C>,
    endpoint_id: &str,
    local_path: &Path,
    remote_path: &str,
    progress: Option<&ProgressFn<'_>>,
    cancel: &CancellationToken,
) -> Result<()> {
    let hooks = single_file_hooks(progress, cancel);
    hooks.checkpoint()?;
    let session = resolve(registry, endpoint_id).await?;
    let result = session.put(local_path, remote_path, hooks).await;
    fault_on_loss(registry, endpoint_id, result)
        .await
        .map_err(transfer_error("upload", remote_path))?;
    info!("Uploaded {} -> {}:{}", local_path.display(), endpoint_id, remote_path);
    Ok(())
}

/// Per-item result of [`delete_items`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    /// `(path, error message)`
    pub failed: Vec<(String, String)>,
    /// Set when cancellation stopped the batch before every item was tried.
    pub cancelled: bool,
}

impl DeleteReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }

    pub fn is_partial(&self) -> bool {
        !self.deleted.is_empty() && !self.is_complete()
    }
}

/// Delete every item independently, collecting failures instead of stopping.
///
/// `cancel` is checked between items.
pub async fn delete_items<C: Connector>(
    registry: &ConnectionRegistry<C>,
    endpoint_id: &str,
    items: &[EndpointItem],
    cancel: &CancellationToken,
) -> DeleteReport {
    let mut report = DeleteReport::default();
    for item in items {
        if cancel.is_cancelled() {
            info!("Delete on '{}' cancelled", endpoint_id);
            report.cancelled = true;
            break;
        }

        let result = if is_local(endpoint_id) {
            local::remove(Path::new(&item.path)).await
        } else {
            match resolve(registry, endpoint_id).await {
                Ok(session) => session.delete(&item.path).await,
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => report.deleted.push(item.path.clone()),
            Err(e) => {
                warn!("Failed to delete {}:{}: {}", endpoint_id, item.path, e);
                report.failed.push((item.path.clone(), e.to_string()));
            }
        }
    }
    info!(
        "Deleted {}/{} item(s) on '{}'",
        report.deleted.len(),
        items.len(),
        endpoint_id
    );
    report
}

/// List `path` on the local filesystem or a connected endpoint.
///
/// A successful remote listing becomes the endpoint's current path; a lost
/// connection marks the endpoint as faulted.
pub async fn list_dir<C: Connector>(
    registry: &ConnectionRegistry<C>,
    endpoint_id: &str,
    path: &str,
) -> Result<Vec<EndpointItem>> {
    if is_local(endpoint_id) {
        return local::list(Path::new(path)).await;
    }

    let session = resolve(registry, endpoint_id).await?;
    let result = session.list(path).await;
    let items = fault_on_loss(registry, endpoint_id, result)
        .await
        .map_err(AppError::during("list", path))?;
    registry.set_current_path(endpoint_id, path).await;
    Ok(items)
}
