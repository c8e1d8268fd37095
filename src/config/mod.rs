pub mod manager;

pub use manager::{AppSettings, AuthMethod, Config, ConfigManager, EndpointConfig};
