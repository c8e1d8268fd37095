//! Depth-first directory tree walks between the local filesystem and a session.
//!
//! Both walks keep an explicit work stack instead of recursing, create each
//! destination directory before any of its children, and visit children in
//! name order. Links to directories below the root are not followed. Source
//! removal, when asked for, happens once at the end for the whole tree.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::endpoint::{EndpointSession, TransferHooks, local};
use crate::error::{AppError, Result};
use crate::utils::posix_join;

/// What a tree walk created on the destination side.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub directories: usize,
    pub files: usize,
}

enum PushWork {
    Dir { local: PathBuf, remote: String },
    File { local: PathBuf, remote: String },
}

enum PullWork {
    Dir { remote: String, local: PathBuf },
    File { remote: String, local: PathBuf },
}

/// Upload `local_dir` to `remote_dir`, then optionally remove `local_dir`.
pub async fn push_tree<S: EndpointSession>(
    session: &S,
    local_dir: &Path,
    remote_dir: &str,
    delete_source_after: bool,
) -> Result<TreeStats> {
    debug!("push_tree {} -> {}", local_dir.display(), remote_dir);
    let mut stats = TreeStats::default();
    let mut stack = vec![PushWork::Dir {
        local: local_dir.to_path_buf(),
        remote: remote_dir.to_string(),
    }];

    while let Some(work) = stack.pop() {
        match work {
            PushWork::Dir { local, remote } => {
                session
                    .mkdir(&remote)
                    .await
                    .map_err(AppError::during("create directory", &remote))?;
                stats.directories += 1;

                let children = local::read_children(&local)
                    .await
                    .map_err(AppError::during("read directory", local.display().to_string()))?;
                for child in children.into_iter().rev() {
                    let remote = posix_join(&remote, &child.name);
                    stack.push(if child.is_dir {
                        PushWork::Dir {
                            local: child.path,
                            remote,
                        }
                    } else {
                        PushWork::File {
                            local: child.path,
                            remote,
                        }
                    });
                }
            }
            PushWork::File { local, remote } => {
                session
                    .put(&local, &remote, TransferHooks::new())
                    .await
                    .map_err(AppError::during("upload", local.display().to_string()))?;
                stats.files += 1;
            }
        }
    }

    if delete_source_after {
        local::remove_dir_all(local_dir)
            .await
            .map_err(AppError::during("delete", local_dir.display().to_string()))?;
    }

    info!(
        "Uploaded tree {} -> {} ({} dirs, {} files)",
        local_dir.display(),
        remote_dir,
        stats.directories,
        stats.files
    );
    Ok(stats)
}

/// Download `remote_dir` into `local_dir`, then optionally delete `remote_dir`.
pub async fn pull_tree<S: EndpointSession>(
    session: &S,
    remote_dir: &str,
    local_dir: &Path,
    delete_source_after: bool,
) -> Result<TreeStats> {
    debug!("pull_tree {} -> {}", remote_dir, local_dir.display());
    let mut stats = TreeStats::default();
    let mut stack = vec![PullWork::Dir {
        remote: remote_dir.to_string(),
        local: local_dir.to_path_buf(),
    }];

    while let Some(work) = stack.pop() {
        match work {
            PullWork::Dir { remote, local } => {
                local::create_dir_all(&local)
                    .await
                    .map_err(AppError::during("create directory", local.display().to_string()))?;
                stats.directories += 1;

                let mut children = session
                    .list(&remote)
                    .await
                    .map_err(AppError::during("list", &remote))?;
                children.sort_by(|a, b| a.name.cmp(&b.name));
                for child in children.into_iter().rev() {
                    // a link back up the tree would never bottom out
                    if child.is_dir() && child.is_symlink {
                        debug!("Skipping directory link {}", child.path);
                        continue;
                    }
                    let local = local.join(&child.name);
                    let remote = posix_join(&remote, &child.name);
                    stack.push(if child.is_dir() {
                        PullWork::Dir { remote, local }
                    } else {
                        PullWork::File { remote, local }
                    });
                }
            }
            PullWork::File { remote, local } => {
                session
                    .get(&remote, &local, TransferHooks::new())
                    .await
                    .map_err(AppError::during("download", &remote))?;
                stats.files += 1;
            }
        }
    }

    if delete_source_after {
        session
            .delete(remote_dir)
            .await
            .map_err(AppError::during("delete", remote_dir))?;
    }

    info!(
        "Downloaded tree {} -> {} ({} dirs, {} files)",
        remote_dir,
        local_dir.display(),
        stats.directories,
        stats.files
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::mock::{Call, MockServer};
    use std::fs;

    fn local_tree() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("proj");
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::write(root.join("README"), "readme").unwrap();
        fs::write(root.join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(root.join("src/nested/deep.txt"), "deep").unwrap();
        tmp
    }

    #[tokio::test]
    async fn test_push_tree_creates_parents_before_children() {
        let tmp = local_tree();
        let server = MockServer::new();
        server.add_dir("/dst");
        let session = server.session("a");

        let stats = push_tree(&session, &tmp.path().join("proj"), "/dst/proj", false)
            .await
            .unwrap();
        assert_eq!(stats, TreeStats { directories: 3, files: 3 });

        let remote: Vec<String> = server
            .calls()
            .into_iter()
            .map(|call| match call {
                Call::Mkdir(path) => format!("mkdir {path}"),
                Call::Put { remote, .. } => format!("put {remote}"),
                other => panic!("unexpected call {other:?}"),
            })
            .collect();
        assert_eq!(
            remote,
            vec![
                "mkdir /dst/proj",
                "put /dst/proj/README",
                "mkdir /dst/proj/src",
                "put /dst/proj/src/main.rs",
                "mkdir /dst/proj/src/nested",
                "put /dst/proj/src/nested/deep.txt",
            ]
        );
        assert_eq!(server.file("/dst/proj/src/nested/deep.txt").unwrap(), b"deep");
        assert!(tmp.path().join("proj").exists());
    }

    #[tokio::test]
    async fn test_push_tree_failure_keeps_source() {
        let tmp = local_tree();
        let server = MockServer::new();
        server.fail_put_on("/dst/proj/src/main.rs");
        let session = server.session("a");

        let err = push_tree(&session, &tmp.path().join("proj"), "/dst/proj", true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("main.rs"));
        assert!(tmp.path().join("proj/src/nested/deep.txt").exists());
        // README was pushed before the failure and stays
        assert!(server.exists("/dst/proj/README"));
        assert!(!server.exists("/dst/proj/src/nested"));
    }

    #[tokio::test]
    async fn test_pull_tree_deletes_source_once_at_the_end() {
        let server = MockServer::new();
        server.add_file("/srv/data/a.txt", b"a");
        server.add_file("/srv/data/sub/b.txt", b"b");
        server.add_dir("/srv/data/empty");
        let session = server.session("a");
        let tmp = tempfile::tempdir().unwrap();

        let stats = pull_tree(&session, "/srv/data", &tmp.path().join("data"), true)
            .await
            .unwrap();
        assert_eq!(stats, TreeStats { directories: 3, files: 2 });
        assert_eq!(fs::read(tmp.path().join("data/sub/b.txt")).unwrap(), b"b");
        assert!(tmp.path().join("data/empty").is_dir());

        let calls = server.calls();
        let deletes: Vec<&Call> = calls.iter().filter(|c| matches!(c, Call::Delete(_))).collect();
        assert_eq!(deletes, vec![&Call::Delete("/srv/data".to_string())]);
        assert_eq!(calls.last(), Some(&Call::Delete("/srv/data".to_string())));
        assert!(!server.exists("/srv/data"));
    }

    #[tokio::test]
    async fn test_pull_tree_does_not_follow_directory_links() {
        let server = MockServer::new();
        server.add_file("/srv/data/a.txt", b"a");
        server.add_file("/srv/shared/secret.txt", b"s");
        server.add_dir_link("/srv/data/loop", "/srv/data");
        server.add_dir_link("/srv/data/shared", "/srv/shared");
        let session = server.session("a");
        let tmp = tempfile::tempdir().unwrap();

        let stats = pull_tree(&session, "/srv/data", &tmp.path().join("data"), true)
            .await
            .unwrap();
        assert_eq!(stats, TreeStats { directories: 1, files: 1 });
        assert!(tmp.path().join("data/a.txt").exists());
        assert!(!tmp.path().join("data/loop").exists());
        assert!(!tmp.path().join("data/shared").exists());

        let calls = server.calls();
        assert!(!calls.contains(&Call::List("/srv/data/loop".to_string())));
        assert!(!calls.contains(&Call::List("/srv/data/shared".to_string())));
        // removing the tree takes the links with it, never what they point at
        assert!(!server.exists("/srv/data/shared"));
        assert_eq!(server.file("/srv/shared/secret.txt").unwrap(), b"s");
    }

    #[tokio::test]
    async fn test_pull_tree_failure_keeps_remote_source() {
        let server = MockServer::new();
        server.add_file("/srv/data/a.txt", b"a");
        server.add_file("/srv/data/z.txt", b"z");
        server.fail_get_on("/srv/data/z.txt");
        let session = server.session("a");
        let tmp = tempfile::tempdir().unwrap();

        assert!(
            pull_tree(&session, "/srv/data", &tmp.path().join("data"), true)
                .await
                .is_err()
        );
        assert!(server.exists("/srv/data/a.txt"));
        assert!(!server.calls().iter().any(|c| matches!(c, Call::Delete(_))));
    }
}
