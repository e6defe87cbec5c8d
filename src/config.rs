//! Application configuration
//!
//! Loaded from the embedded config.toml, with the server URL overridable
//! through the environment for local development.

use crate::error::AppError;
use serde::Deserialize;

/// Environment variable that overrides the configured server URL
const SERVER_URL_ENV: &str = "PARLEY_SERVER_URL";

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// WebSocket base URL of the agent server (ws:// or wss://)
    pub url: String,
}

/// Load configuration from embedded config.toml
pub fn load_config() -> Result<Config, AppError> {
    const CONFIG_TOML: &str = include_str!("../config.toml");
    let mut config: Config =
        toml::from_str(CONFIG_TOML).map_err(|e| AppError::Config(e.to_string()))?;

    if let Ok(url) = std::env::var(SERVER_URL_ENV) {
        if !url.trim().is_empty() {
            config.server.url = url;
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_config_parses() {
        const CONFIG_TOML: &str = include_str!("../config.toml");
        let config: Config = toml::from_str(CONFIG_TOML).unwrap();
        assert!(config.server.url.starts_with("ws"));
    }
}
