//! Configuration file management.
//!
//! The client configuration lives in YAML at `~/.haxorport/config.yaml`
//! unless an explicit path is given. Missing files resolve to defaults.

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use haxorport_client::{ClientConfig, LogLevel};

/// Loads and saves the client configuration file.
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => default_path()?,
        };
        Ok(Self { path })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn load(&self) -> Result<ClientConfig> {
        if !self.path.exists() {
            return Ok(ClientConfig::default());
        }

        let yaml = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read config file {}", self.path.display()))?;

        serde_yaml::from_str(&yaml)
            .with_context(|| format!("failed to parse config file {}", self.path.display()))
    }

    pub fn save(&self, config: &ClientConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        let yaml = serde_yaml::to_string(config).context("failed to serialize config")?;

        fs::write(&self.path, yaml)
            .with_context(|| format!("failed to write config file {}", self.path.display()))
    }
}

fn default_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("failed to determine home directory"))?;
    Ok(home.join(".haxorport").join("config.yaml"))
}

/// Set one configuration key from its string form.
pub fn set_value(config: &mut ClientConfig, key: &str, value: &str) -> Result<()> {
    match key {
        "server_address" => config.server_address = value.to_string(),
        "control_port" => config.control_port = parse_port(key, value)?,
        "data_port" => config.data_port = parse_port(key, value)?,
        "auth_enabled" => config.auth_enabled = parse_bool(key, value)?,
        "auth_token" => config.auth_token = value.to_string(),
        "auth_validation_url" => config.auth_validation_url = value.to_string(),
        "tls_enabled" => config.tls_enabled = parse_bool(key, value)?,
        "tls_insecure" => config.tls_insecure = parse_bool(key, value)?,
        "tls_cert" => config.tls_cert = value.to_string(),
        "tls_key" => config.tls_key = value.to_string(),
        "base_domain" => config.base_domain = value.to_string(),
        "log_level" => config.log_level = value.parse::<LogLevel>().map_err(|e| anyhow!(e))?,
        "log_file" => config.log_file = value.to_string(),
        other => return Err(anyhow!("unknown configuration key `{other}`")),
    }
    Ok(())
}

/// Read one configuration key as a string.
pub fn get_value(config: &ClientConfig, key: &str) -> Result<String> {
    let value = match key {
        "server_address" => config.server_address.clone(),
        "control_port" => config.control_port.to_string(),
        "data_port" => config.data_port.to_string(),
        "auth_enabled" => config.auth_enabled.to_string(),
        "auth_token" => config.auth_token.clone(),
        "auth_validation_url" => config.auth_validation_url.clone(),
        "tls_enabled" => config.tls_enabled.to_string(),
        "tls_insecure" => config.tls_insecure.to_string(),
        "tls_cert" => config.tls_cert.clone(),
        "tls_key" => config.tls_key.clone(),
        "base_domain" => config.base_domain.clone(),
        "log_level" => config.log_level.to_string(),
        "log_file" => config.log_file.clone(),
        other => return Err(anyhow!("unknown configuration key `{other}`")),
    };
    Ok(value)
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .with_context(|| format!("`{key}` must be a port number, got `{value}`"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(anyhow!("`{key}` must be true or false, got `{other}`")),
    }
}
