//! Haxorport reverse-tunnel client core.
//!
//! Exposes a local HTTP or TCP service through a remote broker over a
//! single persistent WebSocket control channel. The channel multiplexes
//! tunnel registration, broker-forwarded HTTP requests, and byte streams
//! for TCP tunnels; this crate keeps that link alive and proxies each
//! demultiplexed unit to the right loopback service.

pub mod auth;
pub mod backoff;
pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod http_forwarder;
pub mod registry;
pub mod rewrite;
mod tcp_forwarder;
mod tls;
pub mod tunnel;

pub use auth::{AuthData, ResourceLimit, Subscription, TokenValidator};
pub use client::Client;
pub use config::{ClientConfig, LogLevel, TunnelSpec};
pub use control::{ControlSession, MessageHandler, SessionState};
pub use error::ClientError;
pub use registry::TunnelRegistry;
pub use tunnel::Tunnel;
