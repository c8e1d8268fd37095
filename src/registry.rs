//! Connection registry: owns every configured endpoint, its live session and
//! its lifecycle status.
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                     |             |  \
//!                     v             v   v
//!               Disconnected  Disconnected  Error
//! ```
//!
//! A record holds a session if and only if its status is `Connected`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::join_all;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EndpointConfig;
use crate::endpoint::{Connector, EndpointSession, LOCAL_ENDPOINT_ID};
use crate::error::{AppError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Read-only view of a record, without its session.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub config: EndpointConfig,
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    pub current_path: String,
}

impl ConnectionInfo {
    pub fn id(&self) -> &str {
        &self.config.name
    }
}

struct ConnectionRecord<S> {
    config: EndpointConfig,
    status: ConnectionStatus,
    session: Option<Arc<S>>,
    last_error: Option<String>,
    current_path: String,
    /// In-flight connect attempt: its id and cancellation handle.
    attempt: Option<(u64, CancellationToken)>,
}

impl<S> ConnectionRecord<S> {
    fn new(config: EndpointConfig) -> Self {
        let current_path = config.root_path.clone();
        Self {
            config,
            status: ConnectionStatus::Disconnected,
            session: None,
            last_error: None,
            current_path,
            attempt: None,
        }
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            config: self.config.clone(),
            status: self.status,
            last_error: self.last_error.clone(),
            current_path: self.current_path.clone(),
        }
    }

    fn is_attempt(&self, attempt_id: u64) -> bool {
        matches!(self.attempt, Some((id, _)) if id == attempt_id)
    }

    /// Drop any session or pending attempt, returning the session for closing.
    fn release(&mut self) -> Option<Arc<S>> {
        if let Some((_, token)) = self.attempt.take() {
            token.cancel();
        }
        self.status = ConnectionStatus::Disconnected;
        self.session.take()
    }
}

pub struct ConnectionRegistry<C: Connector> {
    connector: C,
    records: RwLock<HashMap<String, ConnectionRecord<C::Session>>>,
    next_attempt: AtomicU64,
}

impl<C: Connector> ConnectionRegistry<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            records: RwLock::new(HashMap::new()),
            next_attempt: AtomicU64::new(1),
        }
    }

    /// Registry with one Disconnected record per configured endpoint.
    pub fn from_config(connector: C, endpoints: &[EndpointConfig]) -> Self {
        let mut records = HashMap::new();
        for endpoint in endpoints {
            if records.contains_key(&endpoint.name) {
                warn!("Ignoring duplicate endpoint '{}'", endpoint.name);
                continue;
            }
            records.insert(endpoint.name.clone(), ConnectionRecord::new(endpoint.clone()));
        }
        Self {
            connector,
            records: RwLock::new(records),
            next_attempt: AtomicU64::new(1),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Connect `id`, returning whether it ended up Connected.
    ///
    /// Cancellation via `cancel` (or [`ConnectionRegistry::cancel`]) is
    /// checked before the attempt and again once it resolves; a session that
    /// opened after cancellation is closed straight away. Failures are
    /// recorded in `last_error` and never returned.
    pub async fn connect(&self, id: &str, cancel: &CancellationToken) -> bool {
        let attempt_id = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let (config, attempt) = {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(id) else {
                warn!("Connect requested for unknown endpoint '{}'", id);
                return false;
            };
            if record.status == ConnectionStatus::Connected {
                debug!("Endpoint '{}' already connected", id);
                return true;
            }
            let attempt = cancel.child_token();
            record.status = ConnectionStatus::Connecting;
            record.last_error = None;
            record.attempt = Some((attempt_id, attempt.clone()));
            (record.config.clone(), attempt)
        };

        info!("Connecting to '{}' ({})", id, config.host_port());

        if attempt.is_cancelled() {
            info!("Connect to '{}' cancelled before start", id);
            self.abandon_attempt(id, attempt_id).await;
            return false;
        }

        let result = self.connector.open(&config).await;

        let mut records = self.records.write().await;
        if !records.contains_key(id) {
            drop(records);
            debug!("Endpoint '{}' removed while connecting", id);
            if let Ok(session) = result {
                session.disconnect().await;
            }
            return false;
        }
        let Some(record) = records.get_mut(id) else {
            return false;
        };

        if attempt.is_cancelled() || !record.is_attempt(attempt_id) {
            if record.is_attempt(attempt_id) {
                record.attempt = None;
                if record.status == ConnectionStatus::Connecting {
                    record.status = ConnectionStatus::Disconnected;
                }
            }
            drop(records);
            info!("Connect to '{}' cancelled", id);
            if let Ok(session) = result {
                debug!("Closing session opened after cancellation for '{}'", id);
                session.disconnect().await;
            }
            return false;
        }

        record.attempt = None;
        match result {
            Ok(session) => {
                record.session = Some(Arc::new(session));
                record.status = ConnectionStatus::Connected;
                record.last_error = None;
                info!("Connected to '{}'", id);
                true
            }
            Err(e) => {
                error!("Failed to connect to '{}': {}", id, e);
                record.status = ConnectionStatus::Disconnected;
                record.last_error = Some(e.to_string());
                false
            }
        }
    }

    async fn abandon_attempt(&self, id: &str, attempt_id: u64) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(id) {
            if record.is_attempt(attempt_id) {
                record.attempt = None;
                record.status = ConnectionStatus::Disconnected;
            }
        }
    }

    /// Abort an in-flight connect. Only has an effect while Connecting.
    pub async fn cancel(&self, id: &str) {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(id) else {
            return;
        };
        if record.status != ConnectionStatus::Connecting {
            debug!("Cancel ignored for '{}' in state {:?}", id, record.status);
            return;
        }
        if let Some((_, token)) = record.attempt.take() {
            token.cancel();
        }
        record.status = ConnectionStatus::Disconnected;
        record.last_error = None;
        info!("Cancelled connect to '{}'", id);
    }

    /// Close the session of `id`. No-op unless Connected.
    pub async fn disconnect(&self, id: &str) {
        let session = {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(id) else {
                return;
            };
            if record.status != ConnectionStatus::Connected {
                return;
            }
            record.status = ConnectionStatus::Disconnected;
            record.last_error = None;
            record.session.take()
        };

        if let Some(session) = session {
            session.disconnect().await;
            info!("Disconnected from '{}'", id);
        }
    }

    /// Disconnect every endpoint concurrently and wait for all of them.
    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self.records.read().await.keys().cloned().collect();
        join_all(ids.iter().map(|id| self.disconnect(id))).await;
    }

    /// Mark a Connected endpoint as broken: its session is closed and dropped
    /// and `message` becomes `last_error`.
    pub async fn report_fault(&self, id: &str, message: impl Into<String>) {
        let message = message.into();
        let session = {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(id) else {
                return;
            };
            if record.status != ConnectionStatus::Connected {
                return;
            }
            warn!("Endpoint '{}' faulted: {}", id, message);
            record.status = ConnectionStatus::Error;
            record.last_error = Some(message);
            record.session.take()
        };

        if let Some(session) = session {
            session.disconnect().await;
        }
    }

    pub async fn add_connection(&self, config: EndpointConfig) -> Result<()> {
        config.validate()?;
        let mut records = self.records.write().await;
        if records.contains_key(&config.name) {
            return Err(AppError::ConfigError(format!(
                "Endpoint '{}' already exists",
                config.name
            )));
        }
        info!("Added endpoint '{}'", config.name);
        records.insert(config.name.clone(), ConnectionRecord::new(config));
        Ok(())
    }

    /// Replace the configuration of `id`, possibly under a new name.
    ///
    /// A live session or pending connect is torn down and the record starts
    /// over as Disconnected.
    pub async fn update_connection(&self, id: &str, config: EndpointConfig) -> Result<()> {
        config.validate()?;
        let session = {
            let mut records = self.records.write().await;
            if !records.contains_key(id) {
                return Err(AppError::EndpointNotFound(id.to_string()));
            }
            if config.name != id && records.contains_key(&config.name) {
                return Err(AppError::ConfigError(format!(
                    "Endpoint '{}' already exists",
                    config.name
                )));
            }
            let session = records.remove(id).and_then(|mut old| old.release());
            info!("Updated endpoint '{}' -> '{}'", id, config.name);
            records.insert(config.name.clone(), ConnectionRecord::new(config));
            session
        };

        if let Some(session) = session {
            session.disconnect().await;
        }
        Ok(())
    }

    pub async fn remove_connection(&self, id: &str) -> Result<()> {
        let session = {
            let mut records = self.records.write().await;
            let mut record = records
                .remove(id)
                .ok_or_else(|| AppError::EndpointNotFound(id.to_string()))?;
            info!("Removed endpoint '{}'", id);
            record.release()
        };

        if let Some(session) = session {
            session.disconnect().await;
        }
        Ok(())
    }

    /// Live session for `id`, if Connected.
    ///
    /// Callers must not hold on to the returned handle beyond one operation.
    pub async fn session(&self, id: &str) -> Option<Arc<C::Session>> {
        self.records
            .read()
            .await
            .get(id)
            .and_then(|record| record.session.clone())
    }

    pub async fn get_connection(&self, id: &str) -> Option<ConnectionInfo> {
        self.records.read().await.get(id).map(ConnectionRecord::info)
    }

    /// Every record, ordered by name.
    pub async fn get_all_connections(&self) -> Vec<ConnectionInfo> {
        let records = self.records.read().await;
        let mut all: Vec<ConnectionInfo> = records.values().map(ConnectionRecord::info).collect();
        all.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        all
    }

    pub async fn status(&self, id: &str) -> Option<ConnectionStatus> {
        self.records.read().await.get(id).map(|record| record.status)
    }

    pub async fn is_connected(&self, id: &str) -> bool {
        self.status(id).await == Some(ConnectionStatus::Connected)
    }

    pub async fn connected_ids(&self) -> Vec<String> {
        let records = self.records.read().await;
        let mut ids: Vec<String> = records
            .iter()
            .filter(|(_, record)| record.status == ConnectionStatus::Connected)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Last navigated directory of `id`, `/` when unknown.
    pub async fn current_path(&self, id: &str) -> String {
        if id == LOCAL_ENDPOINT_ID {
            return "/".to_string();
        }
        self.records
            .read()
            .await
            .get(id)
            .map(|record| record.current_path.clone())
            .unwrap_or_else(|| "/".to_string())
    }

    pub async fn set_current_path(&self, id: &str, path: impl Into<String>) {
        if let Some(record) = self.records.write().await.get_mut(id) {
            record.current_path = path.into();
        }
    }
}
