//! Single-entry management on a connected endpoint: new files and folders,
//! renames and permission changes.

use std::path::Path;

use tracing::info;

use super::{fault_on_loss, resolve};
use crate::endpoint::{Connector, EndpointSession, TransferHooks, is_local, local, parse_mode};
use crate::error::{AppError, Result};
use crate::registry::ConnectionRegistry;
use crate::utils::{posix_file_name, posix_join, posix_parent};

/// A new entry name must be a single path component.
pub fn validate_entry_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(AppError::ValidationError("Name cannot be empty".to_string()));
    }
    if name.contains(['/', '\\']) {
        return Err(AppError::ValidationError(format!(
            "Name cannot contain a path separator: {name}"
        )));
    }
    if name == "." || name == ".." {
        return Err(AppError::ValidationError(format!("Invalid name: {name}")));
    }
    Ok(())
}

fn remote_only(endpoint_id: &str, operation: &str) -> Result<()> {
    if is_local(endpoint_id) {
        return Err(AppError::Unsupported(format!(
            "{operation} is only available on remote endpoints"
        )));
    }
    Ok(())
}

/// Create the folder `name` inside `parent`, returning its path.
pub async fn create_folder<C: Connector>(
    registry: &ConnectionRegistry<C>,
    endpoint_id: &str,
    parent: &str,
    name: &str,
) -> Result<String> {
    remote_only(endpoint_id, "create folder")?;
    validate_entry_name(name)?;
    let path = posix_join(parent, name);

    let session = resolve(registry, endpoint_id).await?;
    let result = session.mkdir(&path).await;
    fault_on_loss(registry, endpoint_id, result)
        .await
        .map_err(AppError::during("create directory", &path))?;
    info!("Created folder {}:{}", endpoint_id, path);
    Ok(path)
}

/// Create the empty file `name` inside `parent`, returning its path.
///
/// An existing entry of that name is left alone and reported as an error.
/// The empty source is written under a staging directory that is always
/// removed afterwards.
pub async fn create_file<C: Connector>(
    registry: &ConnectionRegistry<C>,
    endpoint_id: &str,
    parent: &str,
    name: &str,
    staging_root: Option<&Path>,
) -> Result<String> {
    remote_only(endpoint_id, "create file")?;
    validate_entry_name(name)?;
    let path = posix_join(parent, name);

    let session = resolve(registry, endpoint_id).await?;
    if session.exists(&path).await {
        return Err(AppError::ValidationError(format!("'{path}' already exists")));
    }

    let staging = local::staging_dir(staging_root, "touch")?;
    let empty = staging.path().join(name);
    let result = match tokio::fs::write(&empty, b"").await {
        Ok(()) => session.put(&empty, &path, TransferHooks::new()).await,
        Err(e) => Err(e.into()),
    };
    local::discard_staging(staging);

    fault_on_loss(registry, endpoint_id, result)
        .await
        .map_err(AppError::during("create file", &path))?;
    info!("Created file {}:{}", endpoint_id, path);
    Ok(path)
}

/// Rename `path` in place to `new_name`, returning the new path.
pub async fn rename_entry<C: Connector>(
    registry: &ConnectionRegistry<C>,
    endpoint_id: &str,
    path: &str,
    new_name: &str,
) -> Result<String> {
    remote_only(endpoint_id, "rename")?;
    validate_entry_name(new_name)?;
    if posix_file_name(path) == new_name {
        return Err(AppError::ValidationError(format!(
            "'{path}' is already called {new_name}"
        )));
    }
    let parent = posix_parent(path).unwrap_or_else(|| "/".to_string());
    let new_path = posix_join(&parent, new_name);

    let session = resolve(registry, endpoint_id).await?;
    let result = session.rename(path, &new_path).await;
    fault_on_loss(registry, endpoint_id, result)
        .await
        .map_err(AppError::during("rename", path))?;
    info!("Renamed {}:{} -> {}", endpoint_id, path, new_path);
    Ok(new_path)
}

/// Set the permission bits of `path` from an octal string such as `"755"`.
pub async fn change_mode<C: Connector>(
    registry: &ConnectionRegistry<C>,
    endpoint_id: &str,
    path: &str,
    mode: &str,
) -> Result<()> {
    remote_only(endpoint_id, "chmod")?;
    parse_mode(mode)?;

    let session = resolve(registry, endpoint_id).await?;
    let result = session.chmod(path, mode).await;
    fault_on_loss(registry, endpoint_id, result)
        .await
        .map_err(AppError::during("chmod", path))?;
    info!("Changed mode of {}:{} to {}", endpoint_id, path, mode);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::LOCAL_ENDPOINT_ID;
    use crate::endpoint::mock::{Call, connected_registry};
    use crate::registry::ConnectionStatus;

    #[test]
    fn test_entry_names() {
        assert!(validate_entry_name("notes.txt").is_ok());
        assert!(validate_entry_name(" ").is_err());
        assert!(validate_entry_name("a/b").is_err());
        assert!(validate_entry_name("a\\b").is_err());
        assert!(validate_entry_name("..").is_err());
    }

    #[tokio::test]
    async fn test_create_folder_and_file() {
        let registry = connected_registry(&["a"]).await;
        let server = registry.connector().server("a");
        server.add_dir("/srv");
        let staging = tempfile::tempdir().unwrap();

        let folder = create_folder(&registry, "a", "/srv", "logs").await.unwrap();
        assert_eq!(folder, "/srv/logs");
        assert!(server.is_dir("/srv/logs"));

        let file = create_file(&registry, "a", "/srv/logs", "today.log", Some(staging.path()))
            .await
            .unwrap();
        assert_eq!(file, "/srv/logs/today.log");
        assert_eq!(server.file("/srv/logs/today.log").unwrap(), b"");
        assert!(std::fs::read_dir(staging.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_create_file_never_truncates() {
        let registry = connected_registry(&["a"]).await;
        let server = registry.connector().server("a");
        server.add_file("/srv/data.csv", b"1,2,3");
        server.clear_calls();

        let err = create_file(&registry, "a", "/srv", "data.csv", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(server.file("/srv/data.csv").unwrap(), b"1,2,3");
        assert!(server.calls().is_empty());
    }

    #[tokio::test]
    async fn test_rename_stays_in_parent() {
        let registry = connected_registry(&["a"]).await;
        let server = registry.connector().server("a");
        server.add_file("/srv/old.txt", b"x");
        server.clear_calls();

        let renamed = rename_entry(&registry, "a", "/srv/old.txt", "new.txt")
            .await
            .unwrap();
        assert_eq!(renamed, "/srv/new.txt");
        assert_eq!(
            server.calls(),
            vec![Call::Rename("/srv/old.txt".to_string(), "/srv/new.txt".to_string())]
        );
        assert!(server.exists("/srv/new.txt"));

        assert!(rename_entry(&registry, "a", "/srv/new.txt", "new.txt").await.is_err());
        assert!(rename_entry(&registry, "a", "/srv/new.txt", "../up.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_change_mode() {
        let registry = connected_registry(&["a"]).await;
        let server = registry.connector().server("a");
        server.add_file("/run.sh", b"#!/bin/sh");
        server.clear_calls();

        change_mode(&registry, "a", "/run.sh", "0755").await.unwrap();
        assert_eq!(server.calls(), vec![Call::Chmod("/run.sh".to_string(), 0o755)]);

        assert!(matches!(
            change_mode(&registry, "a", "/run.sh", "rwx").await,
            Err(AppError::ValidationError(_))
        ));
        assert_eq!(server.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_management_needs_a_live_remote() {
        let registry = connected_registry(&["a"]).await;
        assert!(matches!(
            create_folder(&registry, LOCAL_ENDPOINT_ID, "/tmp", "x").await,
            Err(AppError::Unsupported(_))
        ));

        registry.disconnect("a").await;
        assert!(matches!(
            rename_entry(&registry, "a", "/f", "g").await,
            Err(AppError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_lost_transport_faults_endpoint() {
        let registry = connected_registry(&["a"]).await;
        registry.connector().server("a").drop_transport();

        let err = create_folder(&registry, "a", "/", "x").await.unwrap_err();
        assert!(err.is_connection_lost());
        assert_eq!(registry.status("a").await, Some(ConnectionStatus::Error));
    }
}
