//! Tunnel records.

use chrono::{DateTime, Utc};
use haxorport_proto::TunnelType;

use crate::config::TunnelSpec;

/// A registered tunnel. Owned by the registry; workers refer to it by id.
#[derive(Debug, Clone)]
pub struct Tunnel {
    /// Identifier issued by the broker.
    pub id: String,
    pub spec: TunnelSpec,
    /// Public URL, for http tunnels.
    pub url: Option<String>,
    /// Assigned remote port, for tcp tunnels.
    pub remote_port: Option<u16>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Tunnel {
    pub fn new(id: String, spec: TunnelSpec) -> Self {
        Self {
            id,
            spec,
            url: None,
            remote_port: None,
            active: false,
            created_at: Utc::now(),
        }
    }

    pub fn tunnel_type(&self) -> TunnelType {
        self.spec.tunnel_type
    }

    pub fn set_http_info(&mut self, url: String) {
        self.url = Some(url);
        self.active = true;
    }

    pub fn set_tcp_info(&mut self, remote_port: u16) {
        self.remote_port = Some(remote_port);
        self.active = true;
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_tracks_assigned_endpoint() {
        let mut tunnel = Tunnel::new(
            "t1".to_string(),
            TunnelSpec::http(8080, Some("app".to_string())),
        );
        assert!(!tunnel.active);

        tunnel.set_http_info("https://app.haxorport.online".to_string());
        assert!(tunnel.active);
        assert_eq!(tunnel.url.as_deref(), Some("https://app.haxorport.online"));

        tunnel.deactivate();
        assert!(!tunnel.active);
    }
}
