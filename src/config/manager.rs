use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::endpoint::LOCAL_ENDPOINT_ID;
use crate::error::{AppError, Result};
use crate::utils::expand_tilde;

/// Application settings
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct AppSettings {
    /// Port used by endpoints that do not set one.
    pub default_port: u16,
    /// Seconds allowed for establishing an SSH session.
    pub connection_timeout: u64,
    /// Root for relay and same-endpoint copy staging. System temp dir when unset.
    pub staging_dir: Option<PathBuf>,
    pub log_dir: PathBuf,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            default_port: 22,
            connection_timeout: 20,
            staging_dir: None,
            log_dir: PathBuf::from("."),
        }
    }
}

/// How an endpoint authenticates.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    Password {
        password: String,
    },
    PublicKey {
        private_key_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
}

/// Represents one configured SFTP endpoint
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Unique endpoint id, also used as the display name.
    pub name: String,
    pub host: String,
    /// `0` until filled from [`AppSettings::default_port`] on load.
    #[serde(default)]
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    /// Directory shown first after connecting.
    #[serde(default = "default_root_path")]
    pub root_path: String,
}

fn default_root_path() -> String {
    "/".to_string()
}

impl EndpointConfig {
    /// Creates a password-authenticated endpoint rooted at `/`
    pub fn new(name: String, host: String, port: u16, username: String, password: String) -> Self {
        Self {
            name,
            host,
            port,
            username,
            auth: AuthMethod::Password { password },
            root_path: default_root_path(),
        }
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Private key location with `~` expanded, if key authentication is configured.
    pub fn private_key_path(&self) -> Option<PathBuf> {
        match &self.auth {
            AuthMethod::PublicKey {
                private_key_path, ..
            } => Some(expand_tilde(private_key_path)),
            AuthMethod::Password { .. } => None,
        }
    }

    /// Validates the endpoint parameters
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::ValidationError(
                "Endpoint name cannot be empty".to_string(),
            ));
        }

        if self.name == LOCAL_ENDPOINT_ID {
            return Err(AppError::ValidationError(format!(
                "Endpoint name '{LOCAL_ENDPOINT_ID}' is reserved for the local filesystem"
            )));
        }

        if self.host.trim().is_empty() {
            return Err(AppError::ValidationError(
                "Host cannot be empty".to_string(),
            ));
        }

        if self.port == 0 {
            return Err(AppError::ValidationError(
                "Port must be greater than 0".to_string(),
            ));
        }

        if self.username.trim().is_empty() {
            return Err(AppError::ValidationError(
                "Username cannot be empty".to_string(),
            ));
        }

        match &self.auth {
            AuthMethod::Password { password } if password.is_empty() => {
                return Err(AppError::ValidationError(
                    "Password cannot be empty".to_string(),
                ));
            }
            AuthMethod::PublicKey {
                private_key_path, ..
            } if private_key_path.trim().is_empty() => {
                return Err(AppError::ValidationError(
                    "Private key path cannot be empty".to_string(),
                ));
            }
            _ => {}
        }

        if !self.root_path.starts_with('/') {
            return Err(AppError::ValidationError(format!(
                "Root path must be absolute: {}",
                self.root_path
            )));
        }

        Ok(())
    }
}

/// Main configuration structure
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub settings: AppSettings,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// Configuration manager for handling application settings and endpoint storage
pub struct ConfigManager {
    config_path: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Create a new configuration manager
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        let config = Self::load_config_from_path(&config_path)?;

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Create a configuration manager with a custom config path
    pub fn with_path<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        let config = Self::load_config_from_path(&config_path)?;

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Get the default configuration file path
    fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| AppError::ConfigError("Cannot determine config directory".to_string()))?
            .join("sftp-explorer");

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).map_err(|e| {
                AppError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        Ok(config_dir.join("config.toml"))
    }

    /// Load configuration from the specified path
    fn load_config_from_path(config_path: &Path) -> Result<Config> {
        if !config_path.exists() {
            return Ok(Config::default());
        }

        let config_content = fs::read_to_string(config_path)
            .map_err(|e| AppError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&config_content)
            .map_err(|e| AppError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        let default_port = config.settings.default_port;
        for endpoint in &mut config.endpoints {
            if endpoint.port == 0 {
                endpoint.port = default_port;
            }
            endpoint.validate()?;
        }

        Ok(config)
    }

    /// Persist current config to disk
    pub fn save(&self) -> Result<()> {
        let toml = toml::to_string_pretty(&self.config)
            .map_err(|e| AppError::ConfigError(format!("Failed to serialize config: {}", e)))?;
        fs::write(&self.config_path, toml)
            .map_err(|e| AppError::ConfigError(format!("Failed to write config: {}", e)))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> &AppSettings {
        &self.config.settings
    }

    /// Return immutable slice of endpoints
    pub fn endpoints(&self) -> &[EndpointConfig] {
        &self.config.endpoints
    }

    /// Add a new endpoint and persist it
    pub fn add_endpoint(&mut self, mut endpoint: EndpointConfig) -> Result<()> {
        if endpoint.port == 0 {
            endpoint.port = self.config.settings.default_port;
        }
        endpoint.validate()?;

        if self.config.endpoints.iter().any(|e| e.name == endpoint.name) {
            return Err(AppError::ConfigError(format!(
                "Endpoint '{}' already exists",
                endpoint.name
            )));
        }

        self.config.endpoints.push(endpoint);
        self.save()
    }

    /// Replace the endpoint called `name` and persist
    pub fn update_endpoint(&mut self, name: &str, endpoint: EndpointConfig) -> Result<()> {
        endpoint.validate()?;

        if endpoint.name != name && self.config.endpoints.iter().any(|e| e.name == endpoint.name)
        {
            return Err(AppError::ConfigError(format!(
                "Endpoint '{}' already exists",
                endpoint.name
            )));
        }

        match self.config.endpoints.iter_mut().find(|e| e.name == name) {
            Some(existing) => {
                *existing = endpoint;
                self.save()
            }
            None => Err(AppError::EndpointNotFound(name.to_string())),
        }
    }

    /// Remove an endpoint by name and persist
    pub fn remove_endpoint(&mut self, name: &str) -> Result<()> {
        let initial_len = self.config.endpoints.len();
        self.config.endpoints.retain(|e| e.name != name);

        if self.config.endpoints.len() == initial_len {
            Err(AppError::EndpointNotFound(name.to_string()))
        } else {
            self.save()
        }
    }
}
