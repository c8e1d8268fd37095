use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("SSH connection failed: {0}")]
    SshConnectionError(String),

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Russh error: {0}")]
    RusshError(#[from] russh::Error),

    #[error("Russh Sftp error: {0}")]
    RusshSftpError(#[from] russh_sftp::client::error::Error),

    #[error("SFTP error: {0}")]
    SftpError(String),

    /// A primitive operation failed while executing a transfer.
    #[error("{operation} failed for '{path}': {source}")]
    Transfer {
        operation: &'static str,
        path: String,
        #[source]
        source: Box<AppError>,
    },

    #[error("connection not established: {0}")]
    NotConnected(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Clipboard is empty")]
    ClipboardEmpty,

    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),
}

impl AppError {
    /// Attach the attempted operation and the offending path to an error.
    ///
    /// Errors that already carry transfer context, or that describe a missing
    /// session or an unsupported request, pass through unchanged.
    pub fn during(
        operation: &'static str,
        path: impl Into<String>,
    ) -> impl FnOnce(AppError) -> AppError {
        let path = path.into();
        move |source| match source {
            AppError::Transfer { .. } | AppError::NotConnected(_) | AppError::Unsupported(_) => {
                source
            }
            other => AppError::Transfer {
                operation,
                path,
                source: Box::new(other),
            },
        }
    }

    /// True when the underlying session is gone and the endpoint needs a reconnect.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            AppError::ConnectionLost(_) => true,
            AppError::Transfer { source, .. } => source.is_connection_lost(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            AppError::Cancelled => true,
            AppError::Transfer { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// Application result type alias
pub type Result<T> = std::result::Result<T, AppError>;
