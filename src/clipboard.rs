//! Single-slot copy / cut / paste over endpoints.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::endpoint::{Connector, EndpointItem, is_local};
use crate::error::{AppError, Result};
use crate::registry::ConnectionRegistry;
use crate::transfer::{self, PasteSummary, TransferIntent, TransferOperation};

/// Holds at most one pending [`TransferIntent`] and pastes it on request.
pub struct Clipboard<C: Connector> {
    registry: Arc<ConnectionRegistry<C>>,
    intent: Option<TransferIntent>,
    staging_root: Option<PathBuf>,
}

impl<C: Connector> Clipboard<C> {
    pub fn new(registry: Arc<ConnectionRegistry<C>>) -> Self {
        Self {
            registry,
            intent: None,
            staging_root: None,
        }
    }

    /// Stage relay and same-endpoint copies under `root` instead of the system temp dir.
    pub fn with_staging_root(mut self, root: Option<PathBuf>) -> Self {
        self.staging_root = root;
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry<C> {
        &self.registry
    }

    /// Replace the clipboard with a copy of `items`.
    pub fn copy(&mut self, items: Vec<EndpointItem>, source_endpoint_id: &str) -> Result<()> {
        self.capture(TransferOperation::Copy, items, source_endpoint_id)
    }

    /// Replace the clipboard with a cut of `items`.
    pub fn cut(&mut self, items: Vec<EndpointItem>, source_endpoint_id: &str) -> Result<()> {
        self.capture(TransferOperation::Cut, items, source_endpoint_id)
    }

    fn capture(
        &mut self,
        operation: TransferOperation,
        items: Vec<EndpointItem>,
        source_endpoint_id: &str,
    ) -> Result<()> {
        let intent = TransferIntent::new(operation, items, source_endpoint_id)?;
        debug!(
            "Clipboard {:?}: {} item(s) from '{}'",
            operation,
            intent.items.len(),
            source_endpoint_id
        );
        if let Some(previous) = self.intent.replace(intent) {
            debug!("Replaced clipboard intent {}", previous.id);
        }
        Ok(())
    }

    pub fn has_clipboard_data(&self) -> bool {
        self.intent.is_some()
    }

    pub fn clipboard_data(&self) -> Option<&TransferIntent> {
        self.intent.as_ref()
    }

    pub fn clear(&mut self) {
        self.intent = None;
    }

    /// True when the pending items come from the local filesystem.
    pub fn has_local_files(&self) -> bool {
        self.intent
            .as_ref()
            .is_some_and(|intent| is_local(&intent.source_endpoint_id))
    }

    /// Paste into `dest_path` on `dest_endpoint_id`, logging the outcome.
    ///
    /// Returns true only if every item was transferred.
    pub async fn paste(&mut self, dest_endpoint_id: &str, dest_path: &str) -> bool {
        match self.try_paste(dest_endpoint_id, dest_path).await {
            Ok(summary) => {
                info!(
                    "Pasted {} item(s) ({} files, {} directories) into '{}:{}'",
                    summary.items, summary.files, summary.directories, dest_endpoint_id, dest_path
                );
                true
            }
            Err(AppError::ClipboardEmpty) => {
                warn!("Nothing to paste");
                false
            }
            Err(e) => {
                error!("Paste into '{}:{}' failed: {}", dest_endpoint_id, dest_path, e);
                false
            }
        }
    }

    /// Paste and return the outcome. A cut is cleared only once it fully succeeds.
    pub async fn try_paste(
        &mut self,
        dest_endpoint_id: &str,
        dest_path: &str,
    ) -> Result<PasteSummary> {
        let intent = self.intent.as_ref().ok_or(AppError::ClipboardEmpty)?;
        let summary = transfer::execute(
            self.registry.as_ref(),
            intent,
            dest_endpoint_id,
            dest_path,
            self.staging_root.as_deref(),
        )
        .await?;

        if intent.is_cut() {
            debug!("Cut completed, clearing clipboard");
            self.intent = None;
        }
        Ok(summary)
    }
}
