pub mod clipboard;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod registry;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use clipboard::Clipboard;
pub use config::{AppSettings, AuthMethod, ConfigManager, EndpointConfig};
pub use endpoint::sftp::{SftpConnector, SftpEndpoint};
pub use endpoint::{
    Connector, EndpointItem, EndpointSession, ItemKind, LOCAL_ENDPOINT_ID, ProgressFn,
    TransferHooks,
};
pub use error::{AppError, Result};
pub use registry::{ConnectionInfo, ConnectionRegistry, ConnectionStatus};
pub use transfer::{
    DeleteReport, PasteSummary, Topology, TransferIntent, TransferOperation, change_mode,
    create_file, create_folder, delete_items, download_file, list_dir, rename_entry, upload_file,
};
pub use utils::{expand_tilde, init_tracing};
