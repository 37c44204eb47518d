//! Token validation against the broker's auth endpoint.
//!
//! A single form-POST exchange, performed once per connect. The returned
//! `data` subtree carries the user identity and the subscription quota the
//! registry consults before asking the broker for new tunnels.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::ClientError;

/// User-Agent sent on validation requests.
pub const USER_AGENT: &str = "HaxorportClient/1.0";

/// Request timeout for the validation call.
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// How much of a non-JSON body to quote in the diagnostic.
const BODY_PREVIEW_LEN: usize = 100;

/// Full validation response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthResponse {
    pub code: i64,
    pub status: String,
    pub message: String,
    pub data: AuthData,
    pub meta: AuthMeta,
}

/// The `data` subtree: user identity plus subscription record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthData {
    pub user_id: String,
    pub fullname: String,
    pub username: String,
    pub email: String,
    pub subscription: Subscription,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthMeta {
    pub header_status_code: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Subscription {
    pub name: String,
    pub limits: SubscriptionLimits,
    pub features: SubscriptionFeatures,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionLimits {
    pub tunnels: ResourceLimit,
    pub ports: ResourceLimit,
    pub bandwidth: ResourceLimit,
    pub requests: ResourceLimit,
}

/// Usage counters for one quota-governed resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimit {
    pub limit: i64,
    pub used: i64,
    pub reached: bool,
}

impl ResourceLimit {
    /// True when no more of the resource may be claimed.
    pub fn exhausted(&self) -> bool {
        self.reached || (self.limit > 0 && self.used >= self.limit)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionFeatures {
    #[serde(rename = "customDomains")]
    pub custom_domains: bool,
    pub analytics: bool,
    #[serde(rename = "prioritySupport")]
    pub priority_support: bool,
}

/// Validates auth tokens against a configured endpoint.
pub struct TokenValidator {
    endpoint: String,
}

impl TokenValidator {
    /// Create a validator for the given endpoint URL. The endpoint must be
    /// http or https.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ClientError> {
        let endpoint = endpoint.into();
        let url = Url::parse(&endpoint)
            .map_err(|e| ClientError::TokenInvalid(format!("invalid validation URL: {e}")))?;
        match url.scheme() {
            "http" | "https" => Ok(Self { endpoint }),
            other => Err(ClientError::TokenInvalid(format!(
                "validation URL must be http or https, got `{other}`"
            ))),
        }
    }

    /// Validate a token and return the authorization record.
    ///
    /// Every failure mode — empty token, network failure, non-200 status,
    /// non-JSON body, non-success status in the body — is `TokenInvalid`.
    pub async fn validate(&self, token: &str) -> Result<AuthData, ClientError> {
        if token.is_empty() {
            return Err(ClientError::TokenInvalid(
                "token must not be empty".to_string(),
            ));
        }

        debug!("validating token against {}", self.endpoint);

        let client = reqwest::Client::builder()
            .timeout(VALIDATE_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| {
                ClientError::TokenInvalid(format!("failed to build validation client: {e}"))
            })?;

        let response = client
            .post(&self.endpoint)
            .form(&[("token", token)])
            .send()
            .await
            .map_err(|e| ClientError::TokenInvalid(format!("validation request failed: {e}")))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ClientError::TokenInvalid(format!(
                "validation endpoint returned status {status}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::TokenInvalid(format!("failed to read response: {e}")))?;

        let parsed: AuthResponse = match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(_) => {
                let preview = String::from_utf8_lossy(&body[..body.len().min(BODY_PREVIEW_LEN)]);
                return Err(ClientError::TokenInvalid(format!(
                    "validation response is not valid JSON: {preview}"
                )));
            }
        };

        if parsed.status != "success" || parsed.code != 200 {
            let reason = if parsed.message.is_empty() {
                format!("status {} code {}", parsed.status, parsed.code)
            } else {
                parsed.message
            };
            return Err(ClientError::TokenInvalid(reason));
        }

        Ok(parsed.data)
    }
}
