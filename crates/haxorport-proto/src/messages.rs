//! Envelope and payload types for the control channel.
//!
//! Byte-carrying fields (`data`, `body`) travel base64-encoded, matching the
//! broker's JSON representation of raw bytes.

use std::collections::HashMap;
use std::fmt;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::codec::CodecError;

/// Protocol version stamped on every outgoing envelope.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Frame tag carried in the envelope `type` field.
///
/// Tags the broker may add in the future are preserved as
/// [`MessageType::Unknown`] so the dispatcher can warn and skip them instead
/// of tearing down the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Auth,
    Register,
    Unregister,
    Data,
    Ping,
    Pong,
    Error,
    HttpRequest,
    HttpResponse,
    #[serde(untagged)]
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Auth => "auth",
            MessageType::Register => "register",
            MessageType::Unregister => "unregister",
            MessageType::Data => "data",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Error => "error",
            MessageType::HttpRequest => "http_request",
            MessageType::HttpResponse => "http_response",
            MessageType::Unknown(tag) => tag,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single control-channel frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default = "default_version")]
    pub version: String,
    /// Milliseconds since the epoch. Informational only.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl Envelope {
    /// Build an envelope around a serializable payload.
    pub fn new<P: Serialize>(message_type: MessageType, payload: &P) -> Result<Self, CodecError> {
        let payload = serde_json::value::to_raw_value(payload)?;
        Ok(Self {
            message_type,
            version: PROTOCOL_VERSION.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            payload: Some(payload),
        })
    }

    /// Build an envelope with no payload (`ping`/`pong`).
    pub fn empty(message_type: MessageType) -> Self {
        Self {
            message_type,
            version: PROTOCOL_VERSION.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            payload: None,
        }
    }

    /// Deserialize the payload into a concrete type.
    ///
    /// A missing payload parses as JSON `null`, so `Option` targets resolve
    /// to `None` while struct targets report the absence as an error.
    pub fn parse_payload<P: DeserializeOwned>(&self) -> Result<P, CodecError> {
        let raw = self.payload.as_ref().map(|raw| raw.get()).unwrap_or("null");
        Ok(serde_json::from_str(raw)?)
    }
}

/// `auth` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
}

/// Tunnel kind requested at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelType {
    Http,
    Tcp,
}

impl TunnelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelType::Http => "http",
            TunnelType::Tcp => "tcp",
        }
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Edge authentication attached to a tunnel registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelAuth {
    Basic { username: String, password: String },
    Header { header_name: String, header_value: String },
}

/// `register` request payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub tunnel_type: TunnelType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_addr: Option<String>,
    pub local_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<TunnelAuth>,
}

/// `register` reply payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponsePayload {
    pub success: bool,
    #[serde(default)]
    pub tunnel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `unregister` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterPayload {
    pub tunnel_id: String,
}

/// `data` payload steering bytes for one bridged TCP connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPayload {
    pub tunnel_id: String,
    pub connection_id: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// `error` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Multi-valued header map, mirroring the broker's representation.
pub type HeaderMap = HashMap<String, Vec<String>>;

/// `http_request` payload wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestPayload {
    pub request: HttpRequestData,
}

/// A public HTTP request the broker accepted on behalf of this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestData {
    pub id: String,
    pub tunnel_id: String,
    pub method: String,
    /// Path plus query, as received at the public edge.
    pub url: String,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(default, with = "base64_bytes_opt", skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
    pub local_port: u16,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
}

/// `http_response` payload wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponsePayload {
    pub response: HttpResponseData,
}

/// The loopback service's reply, sent back to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponseData {
    pub id: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(default, with = "base64_bytes_opt", skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}

mod base64_bytes_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match data {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD.decode(encoded).map(Some).map_err(D::Error::custom),
            None => Ok(None),
        }
    }
}
