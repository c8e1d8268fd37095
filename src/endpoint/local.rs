//! Direct access to the local filesystem.
//!
//! The local side never goes through a session: uploads, downloads and relay
//! staging read and write here directly.

use std::io::{Error, ErrorKind};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tracing::{debug, warn};

use super::{EndpointItem, ItemKind, LOCAL_ENDPOINT_ID, format_permissions, sort_items};
use crate::error::Result;

/// A directory child as seen by the recursion helper.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalEntry {
    pub name: String,
    pub path: PathBuf,
    pub is_dir: bool,
}

fn item_from_metadata(
    name: String,
    path: &Path,
    metadata: &std::fs::Metadata,
    is_symlink: bool,
) -> EndpointItem {
    let is_dir = metadata.is_dir();

    #[cfg(unix)]
    let mode = {
        use std::os::unix::fs::PermissionsExt;
        Some(metadata.permissions().mode())
    };
    #[cfg(not(unix))]
    let mode: Option<u32> = None;

    EndpointItem {
        name,
        path: path.to_string_lossy().into_owned(),
        kind: if is_dir {
            ItemKind::Directory
        } else {
            ItemKind::File
        },
        size: if is_dir { 0 } else { metadata.len() },
        modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
        permissions: format_permissions(mode),
        is_symlink,
        endpoint_id: LOCAL_ENDPOINT_ID.to_string(),
    }
}

/// List one level of a local directory, directories first.
pub async fn list(path: &Path) -> Result<Vec<EndpointItem>> {
    debug!("Local list: {}", path.display());
    let mut items = Vec::new();
    let mut read_dir = tokio::fs::read_dir(path).await.map_err(|e| {
        Error::new(
            e.kind(),
            format!("Failed to read local directory '{}': {e}", path.display()),
        )
    })?;

    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let entry_path = entry.path();
        let is_symlink = entry.file_type().await.map(|t| t.is_symlink()).unwrap_or(false);

        // Follow symlinks to determine actual type; dangling links are skipped
        let Ok(metadata) = tokio::fs::metadata(&entry_path).await else {
            debug!("Skipping unreadable entry: {}", entry_path.display());
            continue;
        };
        if metadata.is_dir() || metadata.is_file() {
            items.push(item_from_metadata(name, &entry_path, &metadata, is_symlink));
        }
    }

    sort_items(&mut items);
    Ok(items)
}

/// Describe a single local path, `None` if it does not exist.
pub async fn stat(path: &Path) -> Result<Option<EndpointItem>> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let is_symlink = tokio::fs::symlink_metadata(path)
        .await
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());
    Ok(Some(item_from_metadata(name, path, &metadata, is_symlink)))
}

/// Immediate children of `dir` that are regular files or directories, sorted by name.
pub async fn read_children(dir: &Path) -> Result<Vec<LocalEntry>> {
    let mut children = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir).await.map_err(|e| {
        Error::new(
            e.kind(),
            format!("Failed to read local directory '{}': {e}", dir.display()),
        )
    })?;

    while let Some(entry) = read_dir.next_entry().await.map_err(|e| {
        Error::new(
            e.kind(),
            format!("Failed to read entry in '{}': {e}", dir.display()),
        )
    })? {
        let path = entry.path();
        let is_link = entry.file_type().await?.is_symlink();
        let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
            Error::new(
                e.kind(),
                format!("Failed to get metadata for '{}': {e}", path.display()),
            )
        })?;

        // Links to directories are never entered; a link cycle would not end.
        if is_link && metadata.is_dir() {
            debug!("Skipping directory link {}", path.display());
            continue;
        }
        if metadata.is_dir() || metadata.is_file() {
            children.push(LocalEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path,
                is_dir: metadata.is_dir(),
            });
        }
        // Skip other file types (sockets, etc.)
    }

    children.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(children)
}

pub async fn create_dir_all(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path).await?;
    Ok(())
}

pub async fn remove_file(path: &Path) -> Result<()> {
    debug!("Local delete file: {}", path.display());
    tokio::fs::remove_file(path).await?;
    Ok(())
}

pub async fn remove_dir_all(path: &Path) -> Result<()> {
    debug!("Local delete tree: {}", path.display());
    tokio::fs::remove_dir_all(path).await?;
    Ok(())
}

/// Remove a file or a whole directory tree.
pub async fn remove(path: &Path) -> Result<()> {
    let metadata = tokio::fs::symlink_metadata(path).await?;
    if metadata.is_dir() {
        remove_dir_all(path).await
    } else {
        remove_file(path).await
    }
}

/// Create a uniquely named scratch directory, removed when the guard drops.
///
/// `root` defaults to the system temp dir.
pub fn staging_dir(root: Option<&Path>, purpose: &str) -> Result<TempDir> {
    let prefix = format!("sftp-explorer-{purpose}-");
    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix);
    let dir = match root {
        Some(root) => {
            std::fs::create_dir_all(root)?;
            builder.tempdir_in(root)?
        }
        None => builder.tempdir()?,
    };
    debug!("Created staging directory {}", dir.path().display());
    Ok(dir)
}

/// Remove a staging directory now, logging instead of failing.
pub fn discard_staging(dir: TempDir) {
    let path = dir.path().to_path_buf();
    if let Err(e) = dir.close() {
        warn!("Failed to remove staging directory {}: {}", path.display(), e);
    } else {
        debug!("Removed staging directory {}", path.display());
    }
}
