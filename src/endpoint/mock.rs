//! In-memory endpoint used by the unit tests.
//!
//! A [`MockServer`] holds a tree of files and directories and records every
//! call made through a [`MockSession`]. Failures can be injected per path.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::{
    Connector, EndpointItem, EndpointSession, ItemKind, TransferHooks, parse_mode, sort_items,
};
use crate::config::EndpointConfig;
use crate::error::{AppError, Result};
use crate::registry::ConnectionRegistry;
use crate::utils::{posix_file_name, posix_join, posix_parent};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    List(String),
    Stat(String),
    Get {
        remote: String,
        local: PathBuf,
        local_parent_existed: bool,
    },
    Put {
        local: PathBuf,
        remote: String,
    },
    Delete(String),
    Mkdir(String),
    Rmdir(String),
    Rename(String, String),
    Chmod(String, u32),
    Disconnect,
}

impl Call {
    pub fn is_data_or_mkdir(&self) -> bool {
        matches!(self, Call::Get { .. } | Call::Put { .. } | Call::Mkdir(_))
    }
}

#[derive(Clone, Debug)]
enum Node {
    File(Vec<u8>),
    Dir,
    /// Symbolic link to a directory; listed as a directory, removed as a link.
    DirLink(String),
}

#[derive(Default)]
struct ServerState {
    nodes: BTreeMap<String, Node>,
    calls: Vec<Call>,
    fail_get: HashSet<String>,
    fail_put: HashSet<String>,
    fail_delete: HashSet<String>,
    /// Transport gone without anyone calling `disconnect`.
    transport_down: bool,
}

impl ServerState {
    fn is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.get(path), Some(Node::Dir))
    }

    fn mkdir_all(&mut self, path: &str) {
        let mut current = "/".to_string();
        self.nodes.insert(current.clone(), Node::Dir);
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = posix_join(&current, component);
            self.nodes.entry(current.clone()).or_insert(Node::Dir);
        }
    }

    fn descendants(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.nodes
            .keys()
            .filter(|k| k.as_str() == path || k.starts_with(&prefix))
            .cloned()
            .collect()
    }

    fn item(&self, endpoint_id: &str, path: &str) -> Option<EndpointItem> {
        let node = self.nodes.get(path)?;
        let (kind, size) = match node {
            Node::File(data) => (ItemKind::File, data.len() as u64),
            Node::Dir | Node::DirLink(_) => (ItemKind::Directory, 0),
        };
        Some(EndpointItem {
            name: posix_file_name(path).to_string(),
            path: path.to_string(),
            kind,
            size,
            modified_at: None,
            permissions: "644".to_string(),
            is_symlink: matches!(node, Node::DirLink(_)),
            endpoint_id: endpoint_id.to_string(),
        })
    }
}

/// Shared handle to one fake remote filesystem.
#[derive(Clone)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServer {
    pub fn new() -> Self {
        let mut state = ServerState::default();
        state.nodes.insert("/".to_string(), Node::Dir);
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn add_dir(&self, path: &str) {
        self.state.lock().unwrap().mkdir_all(path);
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        if let Some(parent) = posix_parent(path) {
            state.mkdir_all(&parent);
        }
        state.nodes.insert(path.to_string(), Node::File(data.to_vec()));
    }

    /// Add a symlink at `path` pointing at the directory `target`.
    pub fn add_dir_link(&self, path: &str, target: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(parent) = posix_parent(path) {
            state.mkdir_all(&parent);
        }
        state
            .nodes
            .insert(path.to_string(), Node::DirLink(target.to_string()));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().unwrap().nodes.get(path) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.state.lock().unwrap().is_dir(path)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().unwrap().nodes.contains_key(path)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn fail_get_on(&self, path: &str) {
        self.state.lock().unwrap().fail_get.insert(path.to_string());
    }

    pub fn fail_put_on(&self, path: &str) {
        self.state.lock().unwrap().fail_put.insert(path.to_string());
    }

    pub fn fail_delete_on(&self, path: &str) {
        self.state.lock().unwrap().fail_delete.insert(path.to_string());
    }

    /// Kill the transport of every open session, as a network failure would.
    /// No `Disconnect` call is recorded.
    pub fn drop_transport(&self) {
        self.state.lock().unwrap().transport_down = true;
    }

    pub fn session(&self, endpoint_id: &str) -> MockSession {
        self.state.lock().unwrap().transport_down = false;
        MockSession {
            endpoint_id: endpoint_id.to_string(),
            server: self.clone(),
            closed: AtomicBool::new(false),
        }
    }
}

pub struct MockSession {
    endpoint_id: String,
    server: MockServer,
    closed: AtomicBool,
}

impl MockSession {
    /// Record a call, failing once this session or its transport is gone.
    fn record(&self, call: Call) -> Result<()> {
        let mut state = self.server.state.lock().unwrap();
        if self.closed.load(Ordering::SeqCst) || state.transport_down {
            return Err(AppError::ConnectionLost(self.endpoint_id.clone()));
        }
        state.calls.push(call);
        Ok(())
    }
}

impl EndpointSession for MockSession {
    fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    async fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.server.state.lock().unwrap().calls.push(Call::Disconnect);
    }

    async fn list(&self, path: &str) -> Result<Vec<EndpointItem>> {
        self.record(Call::List(path.to_string()))?;
        let state = self.server.state.lock().unwrap();
        if let Some(Node::DirLink(target)) = state.nodes.get(path) {
            return Err(AppError::SftpError(format!(
                "{path} is a link to {target}, not followed"
            )));
        }
        if !state.is_dir(path) {
            return Err(AppError::SftpError(format!("No such directory: {path}")));
        }
        let mut items: Vec<EndpointItem> = state
            .nodes
            .keys()
            .filter(|k| k.as_str() != "/" && posix_parent(k).as_deref() == Some(path))
            .filter_map(|k| state.item(&self.endpoint_id, k))
            .collect();
        sort_items(&mut items);
        Ok(items)
    }

    async fn stat(&self, path: &str) -> Result<Option<EndpointItem>> {
        self.record(Call::Stat(path.to_string()))?;
        Ok(self.server.state.lock().unwrap().item(&self.endpoint_id, path))
    }

    async fn exists(&self, path: &str) -> bool {
        self.server.exists(path)
    }

    async fn get(
        &self,
        remote_path: &str,
        local_path: &Path,
        hooks: TransferHooks<'_>,
    ) -> Result<()> {
        hooks.checkpoint()?;
        let local_parent_existed = local_path.parent().map(|p| p.exists()).unwrap_or(false);
        self.record(
            Call::Get {
                remote: remote_path.to_string(),
                local: local_path.to_path_buf(),
                local_parent_existed,
            },
        )?;

        let data = {
            let state = self.server.state.lock().unwrap();
            if state.fail_get.contains(remote_path) {
                return Err(AppError::SftpError(format!("read denied: {remote_path}")));
            }
            match state.nodes.get(remote_path) {
                Some(Node::File(data)) => data.clone(),
                _ => return Err(AppError::SftpError(format!("No such file: {remote_path}"))),
            }
        };

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, &data).await?;
        hooks.report(data.len() as u64, data.len() as u64);
        Ok(())
    }

    async fn put(
        &self,
        local_path: &Path,
        remote_path: &str,
        hooks: TransferHooks<'_>,
    ) -> Result<()> {
        hooks.checkpoint()?;
        self.record(
            Call::Put {
                local: local_path.to_path_buf(),
                remote: remote_path.to_string(),
            },
        )?;

        let data = tokio::fs::read(local_path).await?;

        let mut state = self.server.state.lock().unwrap();
        if state.fail_put.contains(remote_path) {
            return Err(AppError::SftpError(format!("write denied: {remote_path}")));
        }
        let parent = posix_parent(remote_path).unwrap_or_else(|| "/".to_string());
        if !state.is_dir(&parent) {
            return Err(AppError::SftpError(format!("No such directory: {parent}")));
        }
        let len = data.len() as u64;
        state.nodes.insert(remote_path.to_string(), Node::File(data));
        hooks.report(len, len);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.record(Call::Delete(path.to_string()))?;
        let mut state = self.server.state.lock().unwrap();
        if state.fail_delete.contains(path) {
            return Err(AppError::SftpError(format!("delete denied: {path}")));
        }
        let doomed = state.descendants(path);
        if doomed.is_empty() {
            return Err(AppError::SftpError(format!("No such file: {path}")));
        }
        for key in doomed {
            state.nodes.remove(&key);
        }
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.record(Call::Mkdir(path.to_string()))?;
        let mut state = self.server.state.lock().unwrap();
        if matches!(state.nodes.get(path), Some(Node::File(_))) {
            return Err(AppError::SftpError(format!("Not a directory: {path}")));
        }
        state.mkdir_all(path);
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<()> {
        self.record(Call::Rmdir(path.to_string()))?;
        let mut state = self.server.state.lock().unwrap();
        if !state.is_dir(path) {
            return Err(AppError::SftpError(format!("Not a directory: {path}")));
        }
        for key in state.descendants(path) {
            state.nodes.remove(&key);
        }
        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.record(
            Call::Rename(old_path.to_string(), new_path.to_string()),
        )?;
        let mut state = self.server.state.lock().unwrap();
        let moved = state.descendants(old_path);
        if moved.is_empty() {
            return Err(AppError::SftpError(format!("No such file: {old_path}")));
        }
        for key in moved {
            if let Some(node) = state.nodes.remove(&key) {
                let new_key = format!("{new_path}{}", &key[old_path.len()..]);
                state.nodes.insert(new_key, node);
            }
        }
        Ok(())
    }

    async fn chmod(&self, path: &str, mode: &str) -> Result<()> {
        let mode = parse_mode(mode)?;
        self.record(Call::Chmod(path.to_string(), mode))
    }
}

/// Connector handing out sessions onto [`MockServer`]s keyed by endpoint name.
#[derive(Default)]
pub struct MockConnector {
    servers: Mutex<HashMap<String, MockServer>>,
    refuse: Mutex<HashSet<String>>,
    gate: Option<Arc<Notify>>,
    opens: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `open` waits for a permit on `gate` before completing.
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn server(&self, name: &str) -> MockServer {
        self.servers
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn refuse(&self, name: &str) {
        self.refuse.lock().unwrap().insert(name.to_string());
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    type Session = MockSession;

    async fn open(&self, config: &EndpointConfig) -> Result<MockSession> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.refuse.lock().unwrap().contains(&config.name) {
            return Err(AppError::SshConnectionError(format!(
                "Connection refused by {}",
                config.host_port()
            )));
        }
        Ok(self.server(&config.name).session(&config.name))
    }
}

pub fn endpoint_config(name: &str) -> EndpointConfig {
    EndpointConfig::new(
        name.to_string(),
        format!("{name}.example"),
        22,
        "tester".to_string(),
        "secret".to_string(),
    )
}

/// Registry over fresh mock servers with every named endpoint connected.
pub async fn connected_registry(names: &[&str]) -> ConnectionRegistry<MockConnector> {
    let configs: Vec<EndpointConfig> = names.iter().map(|name| endpoint_config(name)).collect();
    let registry = ConnectionRegistry::from_config(MockConnector::new(), &configs);
    let token = tokio_util::sync::CancellationToken::new();
    for name in names {
        assert!(registry.connect(name, &token).await);
    }
    registry
}
