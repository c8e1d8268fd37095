use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{AppError, Result};

/// Install the global subscriber, logging to `sftp-explorer.log` inside `log_dir`.
///
/// The returned guard flushes buffered lines on drop and must be kept alive
/// for as long as logging is wanted.
pub fn init_tracing(log_dir: &Path, log_level: &str) -> Result<WorkerGuard> {
    let file_appender = tracing_appender::rolling::never(log_dir, "sftp-explorer.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Priority: RUST_LOG env var > command line arg > default (info)
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let fmt_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("Failed to initialize tracing: {}", e)))?;

    Ok(guard)
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Join a remote directory and an entry name with POSIX separators.
pub fn posix_join(dir: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Parent of a remote POSIX path, `None` for the root.
pub fn posix_parent(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }

    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "/" {
        return None;
    }

    trimmed.rsplit_once('/').map(|(parent, _)| {
        if parent.is_empty() {
            "/".to_string()
        } else {
            parent.to_string()
        }
    })
}

/// Last component of a remote POSIX path.
pub fn posix_file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((_, name)) => name,
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posix_join() {
        assert_eq!(posix_join("/b/", "f.txt"), "/b/f.txt");
        assert_eq!(posix_join("/b", "f.txt"), "/b/f.txt");
        assert_eq!(posix_join("/", "f.txt"), "/f.txt");
        assert_eq!(posix_join("", "f.txt"), "f.txt");
    }

    #[test]
    fn test_posix_parent() {
        assert_eq!(posix_parent("/"), None);
        assert_eq!(posix_parent("/a"), Some("/".to_string()));
        assert_eq!(posix_parent("/a/b/"), Some("/a".to_string()));
        assert_eq!(posix_parent("/a/b/c.txt"), Some("/a/b".to_string()));
    }

    #[test]
    fn test_posix_file_name() {
        assert_eq!(posix_file_name("/src/file1.txt"), "file1.txt");
        assert_eq!(posix_file_name("/src/dir/"), "dir");
        assert_eq!(posix_file_name("plain"), "plain");
    }

    #[test]
    fn test_expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/etc/key"), PathBuf::from("/etc/key"));
        let expanded = expand_tilde("~/.ssh/id_ed25519");
        assert!(expanded.ends_with(".ssh/id_ed25519"));
    }
}
