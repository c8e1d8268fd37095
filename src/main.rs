use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sftp_explorer::endpoint::local;
use sftp_explorer::utils::{posix_file_name, posix_join, posix_parent};
use sftp_explorer::{
    AppError, Clipboard, ConfigManager, ConnectionRegistry, EndpointItem, EndpointSession,
    LOCAL_ENDPOINT_ID, Result, SftpConnector, change_mode, create_file, create_folder,
    delete_items, download_file, init_tracing, list_dir, rename_entry, upload_file,
};

type Registry = ConnectionRegistry<SftpConnector>;

#[derive(Parser)]
#[command(name = "sftp-explorer", version)]
#[command(about = "Browse, copy and move files across SFTP endpoints and the local disk")]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List configured endpoints
    Endpoints,
    /// List a directory
    Ls {
        /// Endpoint name, or `local`
        endpoint: String,
        path: Option<String>,
    },
    /// Copy files or directories: `cp SRC... DEST`
    Cp {
        #[arg(required = true, num_args = 2.., value_name = "LOCATION")]
        locations: Vec<String>,
    },
    /// Move files or directories: `mv SRC... DEST`
    Mv {
        #[arg(required = true, num_args = 2.., value_name = "LOCATION")]
        locations: Vec<String>,
    },
    /// Delete files or directories on one endpoint
    Rm {
        endpoint: String,
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Create a folder: `mkdir endpoint:/path/name`
    Mkdir { location: String },
    /// Create an empty file: `touch endpoint:/path/name`
    Touch { location: String },
    /// Rename an entry in place: `rename endpoint:/path/old new`
    Rename { location: String, new_name: String },
    /// Change permission bits: `chmod 755 endpoint:/path`
    Chmod { mode: String, location: String },
    /// Download one file: `get endpoint:/path LOCAL`
    Get { location: String, local: PathBuf },
    /// Upload one file: `put LOCAL endpoint:/path`
    Put { local: PathBuf, location: String },
}

/// `endpoint:/path`, or a bare local path.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Location {
    endpoint_id: String,
    path: String,
}

impl Location {
    fn parse(raw: &str) -> Result<Self> {
        match raw.split_once(':') {
            // a single letter before the colon is a Windows drive, not an endpoint
            Some((endpoint, path)) if endpoint.len() > 1 && !endpoint.contains(['/', '\\']) => {
                Ok(Self {
                    endpoint_id: endpoint.to_string(),
                    path: if path.is_empty() { "/".to_string() } else { path.to_string() },
                })
            }
            _ => Self::local(raw),
        }
    }

    fn local(path: &str) -> Result<Self> {
        let absolute = std::path::absolute(path)?;
        Ok(Self {
            endpoint_id: LOCAL_ENDPOINT_ID.to_string(),
            path: absolute.to_string_lossy().into_owned(),
        })
    }

    fn is_local(&self) -> bool {
        self.endpoint_id == LOCAL_ENDPOINT_ID
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local() {
            write!(f, "{}", self.path)
        } else {
            write!(f, "{}:{}", self.endpoint_id, self.path)
        }
    }
}

/// Parse `raw`, which must name a remote endpoint, and resolve its path.
async fn remote_location(
    registry: &Registry,
    raw: &str,
    cancel: &CancellationToken,
) -> Result<Location> {
    let mut location = Location::parse(raw)?;
    if location.is_local() {
        return Err(AppError::ValidationError(format!(
            "Expected `endpoint:/path`, got {raw}"
        )));
    }
    ensure_connected(registry, &location.endpoint_id, cancel).await?;
    location.path = remote_path(registry, &location.endpoint_id, &location.path).await;
    Ok(location)
}

/// Split a remote path into its parent folder and final name.
fn split_remote(path: &str) -> (String, &str) {
    let parent = posix_parent(path).unwrap_or_else(|| "/".to_string());
    (parent, posix_file_name(path))
}

fn print_progress(transferred: u64, total: u64) {
    eprint!("\r{transferred} / {total} bytes");
}

fn endpoint_id(name: &str) -> &str {
    if name == "local" { LOCAL_ENDPOINT_ID } else { name }
}

/// Connect `id` unless it is the local filesystem; Ctrl-C aborts the attempt.
async fn ensure_connected(
    registry: &Registry,
    id: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    if id == LOCAL_ENDPOINT_ID {
        return Ok(());
    }
    if registry.get_connection(id).await.is_none() {
        return Err(AppError::EndpointNotFound(id.to_string()));
    }

    let connected = tokio::select! {
        connected = registry.connect(id, cancel) => connected,
        _ = cancel.cancelled() => {
            registry.cancel(id).await;
            false
        }
    };
    if connected {
        return Ok(());
    }
    if cancel.is_cancelled() {
        return Err(AppError::Cancelled);
    }
    let reason = registry
        .get_connection(id)
        .await
        .and_then(|info| info.last_error)
        .unwrap_or_else(|| "unknown error".to_string());
    Err(AppError::SshConnectionError(format!("{id}: {reason}")))
}

/// Make a remote path absolute against the endpoint's current directory.
async fn remote_path(registry: &Registry, id: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        posix_join(&registry.current_path(id).await, path)
    }
}

async fn stat_item(registry: &Registry, location: &Location) -> Result<EndpointItem> {
    let item = if location.is_local() {
        local::stat(Path::new(&location.path)).await?
    } else {
        registry
            .session(&location.endpoint_id)
            .await
            .ok_or_else(|| AppError::NotConnected(location.endpoint_id.clone()))?
            .stat(&location.path)
            .await?
    };
    item.ok_or_else(|| {
        AppError::ValidationError(format!("No such file or directory: {location}"))
    })
}

fn print_items(items: &[EndpointItem]) {
    for item in items {
        let kind = if item.is_dir() { 'd' } else { '-' };
        let modified = item
            .modified_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let link = if item.is_symlink { " ->" } else { "" };
        println!(
            "{kind} {:>5} {:>12} {:16} {}{link}",
            item.permissions, item.size, modified, item.name
        );
    }
}

async fn transfer(
    registry: Arc<Registry>,
    staging_root: Option<PathBuf>,
    raw: &[String],
    cut: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let (dest_raw, sources_raw) = raw
        .split_last()
        .ok_or_else(|| AppError::ValidationError("Missing destination".to_string()))?;

    let mut dest = Location::parse(dest_raw)?;
    ensure_connected(&registry, &dest.endpoint_id, cancel).await?;
    if !dest.is_local() {
        dest.path = remote_path(&registry, &dest.endpoint_id, &dest.path).await;
    }

    let mut items = Vec::with_capacity(sources_raw.len());
    let mut source_id: Option<String> = None;
    for raw in sources_raw {
        let mut source = Location::parse(raw)?;
        match &source_id {
            Some(id) if *id != source.endpoint_id => {
                return Err(AppError::ValidationError(
                    "All sources must be on the same endpoint".to_string(),
                ));
            }
            Some(_) => {}
            None => {
                ensure_connected(&registry, &source.endpoint_id, cancel).await?;
                source_id = Some(source.endpoint_id.clone());
            }
        }
        if !source.is_local() {
            source.path = remote_path(&registry, &source.endpoint_id, &source.path).await;
        }
        items.push(stat_item(&registry, &source).await?);
    }
    let source_id = source_id.unwrap_or_else(|| LOCAL_ENDPOINT_ID.to_string());

    let mut clipboard = Clipboard::new(registry).with_staging_root(staging_root);
    if cut {
        clipboard.cut(items, &source_id)?;
    } else {
        clipboard.copy(items, &source_id)?;
    }
    let summary = clipboard.try_paste(&dest.endpoint_id, &dest.path).await?;
    println!(
        "{} {} item(s) ({} files, {} directories) to {}",
        if cut { "Moved" } else { "Copied" },
        summary.items,
        summary.files,
        summary.directories,
        dest
    );
    Ok(())
}

async fn run_command(
    command: Command,
    config: &ConfigManager,
    registry: Arc<Registry>,
    cancel: &CancellationToken,
) -> Result<()> {
    match command {
        Command::Endpoints => {
            for endpoint in config.endpoints() {
                let status = registry
                    .status(&endpoint.name)
                    .await
                    .map(|s| format!("{s:?}"))
                    .unwrap_or_default();
                println!(
                    "{:20} {}@{} {} [{}]",
                    endpoint.name,
                    endpoint.username,
                    endpoint.host_port(),
                    endpoint.root_path,
                    status
                );
            }
            Ok(())
        }
        Command::Ls { endpoint, path } => {
            let id = endpoint_id(&endpoint);
            ensure_connected(&registry, id, cancel).await?;
            let path = match (id == LOCAL_ENDPOINT_ID, path) {
                (true, path) => Location::local(path.as_deref().unwrap_or("."))?.path,
                (false, Some(path)) => remote_path(&registry, id, &path).await,
                (false, None) => registry.current_path(id).await,
            };
            let items = list_dir(registry.as_ref(), id, &path).await?;
            print_items(&items);
            Ok(())
        }
        Command::Cp { locations } => {
            let staging = config.settings().staging_dir.clone();
            transfer(registry, staging, &locations, false, cancel).await
        }
        Command::Mv { locations } => {
            let staging = config.settings().staging_dir.clone();
            transfer(registry, staging, &locations, true, cancel).await
        }
        Command::Rm { endpoint, paths } => {
            let id = endpoint_id(&endpoint);
            ensure_connected(&registry, id, cancel).await?;
            let mut items = Vec::with_capacity(paths.len());
            for path in &paths {
                let location = if id == LOCAL_ENDPOINT_ID {
                    Location::local(path)?
                } else {
                    Location {
                        endpoint_id: id.to_string(),
                        path: remote_path(&registry, id, path).await,
                    }
                };
                items.push(stat_item(&registry, &location).await?);
            }

            let report = delete_items(registry.as_ref(), id, &items, cancel).await;
            for path in &report.deleted {
                println!("deleted {path}");
            }
            for (path, reason) in &report.failed {
                eprintln!("failed  {path}: {reason}");
            }
            if report.is_complete() {
                Ok(())
            } else if report.cancelled {
                Err(AppError::Cancelled)
            } else {
                Err(AppError::SftpError(format!(
                    "{} of {} item(s) could not be deleted",
                    report.failed.len(),
                    items.len()
                )))
            }
        }
        Command::Mkdir { location } => {
            let location = remote_location(&registry, &location, cancel).await?;
            let (parent, name) = split_remote(&location.path);
            let path = create_folder(registry.as_ref(), &location.endpoint_id, &parent, name)
                .await?;
            println!("created {}:{path}/", location.endpoint_id);
            Ok(())
        }
        Command::Touch { location } => {
            let location = remote_location(&registry, &location, cancel).await?;
            let (parent, name) = split_remote(&location.path);
            let staging = config.settings().staging_dir.as_deref();
            let path = create_file(
                registry.as_ref(),
                &location.endpoint_id,
                &parent,
                name,
                staging,
            )
            .await?;
            println!("created {}:{path}", location.endpoint_id);
            Ok(())
        }
        Command::Rename { location, new_name } => {
            let location = remote_location(&registry, &location, cancel).await?;
            let path = rename_entry(
                registry.as_ref(),
                &location.endpoint_id,
                &location.path,
                &new_name,
            )
            .await?;
            println!("renamed {location} -> {path}");
            Ok(())
        }
        Command::Chmod { mode, location } => {
            let location = remote_location(&registry, &location, cancel).await?;
            change_mode(registry.as_ref(), &location.endpoint_id, &location.path, &mode).await?;
            println!("mode of {location} set to {mode}");
            Ok(())
        }
        Command::Get { location, local } => {
            let location = remote_location(&registry, &location, cancel).await?;
            let item = stat_item(&registry, &location).await?;
            if item.is_dir() {
                return Err(AppError::ValidationError(format!(
                    "{location} is a directory, use cp"
                )));
            }
            let target = if local.is_dir() {
                local.join(&item.name)
            } else {
                local
            };
            download_file(
                registry.as_ref(),
                &location.endpoint_id,
                &location.path,
                &target,
                Some(&print_progress),
                cancel,
            )
            .await?;
            eprintln!();
            println!("downloaded {location} -> {}", target.display());
            Ok(())
        }
        Command::Put { local, location } => {
            let mut location = remote_location(&registry, &location, cancel).await?;
            let source = Location::local(&local.to_string_lossy())?;
            let item = stat_item(&registry, &source).await?;
            if item.is_dir() {
                return Err(AppError::ValidationError(format!(
                    "{source} is a directory, use cp"
                )));
            }
            let existing = registry
                .session(&location.endpoint_id)
                .await
                .ok_or_else(|| AppError::NotConnected(location.endpoint_id.clone()))?
                .stat(&location.path)
                .await?;
            if existing.is_some_and(|entry| entry.is_dir()) {
                location.path = posix_join(&location.path, &item.name);
            }
            upload_file(
                registry.as_ref(),
                &location.endpoint_id,
                Path::new(&source.path),
                &location.path,
                Some(&print_progress),
                cancel,
            )
            .await?;
            eprintln!();
            println!("uploaded {source} -> {location}");
            Ok(())
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => ConfigManager::with_path(path)?,
        None => ConfigManager::new()?,
    };
    let _guard = init_tracing(&config.settings().log_dir, &cli.log_level)?;
    info!("Loaded {} endpoint(s) from {}", config.endpoints().len(), config.path().display());

    let registry = Arc::new(ConnectionRegistry::from_config(
        SftpConnector::new(config.settings()),
        config.endpoints(),
    ));

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted");
                cancel.cancel();
            }
        })
    };

    let result = run_command(cli.command, &config, registry.clone(), &cancel).await;
    if let Err(e) = &result {
        error!("{}", e);
    }

    registry.disconnect_all().await;
    ctrl_c.abort();
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remote_location() {
        let location = Location::parse("prod:/var/www").unwrap();
        assert_eq!(location.endpoint_id, "prod");
        assert_eq!(location.path, "/var/www");
        assert_eq!(location.to_string(), "prod:/var/www");

        assert_eq!(Location::parse("prod:").unwrap().path, "/");
    }

    #[test]
    fn test_parse_local_location() {
        let location = Location::parse("/tmp/file.txt").unwrap();
        assert!(location.is_local());
        assert_eq!(location.path, "/tmp/file.txt");

        let relative = Location::parse("notes.txt").unwrap();
        assert!(relative.is_local());
        assert!(Path::new(&relative.path).is_absolute());

        // colons inside a path do not name an endpoint
        assert!(Location::parse("./a:b").unwrap().is_local());
    }

    #[test]
    fn test_split_remote() {
        assert_eq!(split_remote("/srv/logs"), ("/srv".to_string(), "logs"));
        assert_eq!(split_remote("/top"), ("/".to_string(), "top"));
        assert_eq!(split_remote("/"), ("/".to_string(), ""));
    }

    #[test]
    fn test_management_subcommands_parse() {
        let cli = Cli::try_parse_from(["sftp-explorer", "chmod", "755", "prod:/run.sh"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Chmod { ref mode, ref location } if mode == "755" && location == "prod:/run.sh"
        ));

        let cli = Cli::try_parse_from(["sftp-explorer", "put", "a.txt", "prod:/srv"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Put { ref location, .. } if location == "prod:/srv"
        ));

        assert!(Cli::try_parse_from(["sftp-explorer", "rename", "prod:/a"]).is_err());
    }
}
