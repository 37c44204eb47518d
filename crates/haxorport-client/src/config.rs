//! Client configuration.
//!
//! `ClientConfig` doubles as the schema of the YAML configuration file the
//! CLI maintains; the core only ever reads it.

use std::fmt;
use std::str::FromStr;

use haxorport_proto::{RegisterPayload, TunnelAuth, TunnelType};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Logging verbosity accepted by the `log_level` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!(
                "invalid log level `{other}` (expected debug, info, warn, or error)"
            )),
        }
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_address: String,
    pub control_port: u16,
    pub data_port: u16,
    pub auth_enabled: bool,
    pub auth_token: String,
    pub auth_validation_url: String,
    pub tls_enabled: bool,
    /// Disable server certificate verification. Off by default; the control
    /// link verifies against the system web roots unless this is set.
    pub tls_insecure: bool,
    pub tls_cert: String,
    pub tls_key: String,
    pub base_domain: String,
    pub log_level: LogLevel,
    pub log_file: String,
    /// Tunnels registered at startup.
    pub tunnels: Vec<TunnelSpec>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "control.haxorport.online".to_string(),
            control_port: 443,
            data_port: 0,
            auth_enabled: false,
            auth_token: String::new(),
            auth_validation_url: "https://haxorport.online/AuthToken/validate".to_string(),
            tls_enabled: false,
            tls_insecure: false,
            tls_cert: String::new(),
            tls_key: String::new(),
            base_domain: "haxorport.online".to_string(),
            log_level: LogLevel::Warn,
            log_file: String::new(),
            tunnels: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// WebSocket URL of the broker's control endpoint.
    pub fn control_url(&self) -> String {
        let scheme = if self.tls_enabled { "wss" } else { "ws" };
        format!(
            "{}://{}:{}/control",
            scheme, self.server_address, self.control_port
        )
    }
}

/// One requested tunnel: the forwarding relation the broker is asked to set
/// up, before it has an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelSpec {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub tunnel_type: TunnelType,
    #[serde(default = "default_local_addr")]
    pub local_addr: String,
    pub local_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<TunnelAuth>,
}

fn default_local_addr() -> String {
    "127.0.0.1".to_string()
}

impl TunnelSpec {
    pub fn http(local_port: u16, subdomain: Option<String>) -> Self {
        Self {
            name: String::new(),
            tunnel_type: TunnelType::Http,
            local_addr: default_local_addr(),
            local_port,
            subdomain,
            remote_port: None,
            auth: None,
        }
    }

    pub fn tcp(local_port: u16, remote_port: Option<u16>) -> Self {
        Self {
            name: String::new(),
            tunnel_type: TunnelType::Tcp,
            local_addr: default_local_addr(),
            local_port,
            subdomain: None,
            remote_port,
            auth: None,
        }
    }

    /// Check the spec before it is sent anywhere.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.local_port == 0 {
            return Err(ClientError::RegisterFailed(
                "local_port must be a positive port number".to_string(),
            ));
        }
        match self.tunnel_type {
            TunnelType::Http => {
                if self.remote_port.is_some() {
                    return Err(ClientError::RegisterFailed(
                        "remote_port is only valid for tcp tunnels".to_string(),
                    ));
                }
            }
            TunnelType::Tcp => {
                if self.subdomain.is_some() {
                    return Err(ClientError::RegisterFailed(
                        "subdomain is only valid for http tunnels".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// The `register` frame payload for this spec.
    pub fn register_payload(&self) -> RegisterPayload {
        RegisterPayload {
            tunnel_type: self.tunnel_type,
            subdomain: self.subdomain.clone(),
            local_addr: Some(self.local_addr.clone()),
            local_port: self.local_port,
            remote_port: self.remote_port,
            auth: self.auth.clone(),
        }
    }
}
