//! HTTP request worker.
//!
//! For each `http_request` frame the broker forwards, perform the request
//! against the local service over plain HTTP, rewrite HTML bodies, and send
//! the reply back as an `http_response` frame. Loopback connections are
//! pooled per local port.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::header::HeaderValue;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use haxorport_proto::{
    Envelope, HeaderMap, HttpRequestData, HttpRequestPayload, HttpResponseData,
    HttpResponsePayload, MessageType,
};

use crate::control::{ControlSession, MessageHandler};
use crate::error::ClientError;
use crate::registry::TunnelRegistry;
use crate::rewrite;

/// Pooled loopback connections kept per local port.
const MAX_POOL_PER_PORT: usize = 8;

type Sender = http1::SendRequest<Full<Bytes>>;

/// Proxies broker-forwarded HTTP requests to local services.
pub struct HttpForwarder {
    session: Arc<ControlSession>,
    registry: Weak<TunnelRegistry>,
    base_domain: String,
    pool: Mutex<HashMap<u16, Vec<Sender>>>,
}

impl HttpForwarder {
    pub fn new(
        session: Arc<ControlSession>,
        registry: &Arc<TunnelRegistry>,
        base_domain: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            registry: Arc::downgrade(registry),
            base_domain,
            pool: Mutex::new(HashMap::new()),
        })
    }

    /// The `http_request` handler for the session's dispatch table. Each
    /// request runs in its own short-lived task.
    pub fn handler(self: &Arc<Self>) -> MessageHandler {
        let forwarder = Arc::clone(self);
        Arc::new(move |envelope: Envelope| {
            let forwarder = Arc::clone(&forwarder);
            Box::pin(async move {
                let payload: HttpRequestPayload = envelope.parse_payload()?;
                tokio::spawn(forwarder.handle_request(payload.request));
                Ok(())
            })
        })
    }

    async fn handle_request(self: Arc<Self>, request: HttpRequestData) {
        debug!(
            "http request {}: {} {} (tunnel {})",
            request.id, request.method, request.url, request.tunnel_id
        );

        let id = request.id.clone();
        let response = match self.forward(&request).await {
            Ok(response) => response,
            Err(err) => {
                warn!("http request {id} failed: {err}");
                HttpResponseData {
                    id,
                    status_code: 500,
                    headers: HeaderMap::new(),
                    body: None,
                    error: Some(err.to_string()),
                }
            }
        };

        // A worker that outlives a reconnect finds the writer rejecting its
        // response; it logs and exits.
        if let Err(err) = self.send_response(response).await {
            warn!("http request {}: failed to send response: {err}", request.id);
        }
    }

    async fn forward(&self, request: &HttpRequestData) -> Result<HttpResponseData, ClientError> {
        let path = if request.url.is_empty() {
            "/"
        } else {
            request.url.as_str()
        };
        debug!(
            "forwarding to http://127.0.0.1:{}{}",
            request.local_port, path
        );

        let mut builder = hyper::Request::builder()
            .method(request.method.as_str())
            .uri(path);
        for (name, values) in &request.headers {
            for value in values {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }

        let body = Bytes::from(request.body.clone().unwrap_or_default());
        let mut outbound = builder.body(Full::new(body)).map_err(|e| {
            ClientError::LocalIo(format!("failed to build loopback request: {e}"))
        })?;

        let host = first_header_value(&request.headers, "Host").unwrap_or_default();
        let scheme = request.scheme.clone().unwrap_or_else(|| "http".to_string());
        let forwarded = outbound.headers_mut();
        forwarded.insert("x-forwarded-host", header_value(&host));
        forwarded.insert("x-forwarded-proto", header_value(&scheme));
        forwarded.insert("x-forwarded-for", header_value(&request.remote_addr));

        let mut sender = self.connection(request.local_port).await?;
        let response = sender
            .send_request(outbound)
            .await
            .map_err(|e| ClientError::LocalIo(format!("loopback request failed: {e}")))?;
        self.recycle(request.local_port, sender).await;

        let status_code = response.status().as_u16();
        let mut headers = HeaderMap::new();
        for (name, value) in response.headers() {
            headers
                .entry(name.to_string())
                .or_default()
                .push(value.to_str().unwrap_or("").to_string());
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ClientError::LocalIo(format!("failed to read loopback response: {e}")))?
            .to_bytes();

        let content_type = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
            .unwrap_or("");

        let body = if content_type.starts_with("text/html") {
            let subdomain = self
                .registry
                .upgrade()
                .and_then(|registry| registry.get_by_id(&request.tunnel_id).ok())
                .and_then(|tunnel| tunnel.spec.subdomain);
            let hostname = rewrite::external_hostname(
                &request.headers,
                subdomain.as_deref(),
                &request.tunnel_id,
                &self.base_domain,
            );
            let prefix = rewrite::external_prefix(request.scheme.as_deref(), &hostname);
            debug!("rewriting HTML body against {prefix}");
            rewrite::rewrite_html(&String::from_utf8_lossy(&body), request.local_port, &prefix)
                .into_bytes()
        } else {
            body.to_vec()
        };

        Ok(HttpResponseData {
            id: request.id.clone(),
            status_code,
            headers,
            body: Some(body),
            error: None,
        })
    }

    async fn send_response(&self, response: HttpResponseData) -> Result<(), ClientError> {
        let envelope = Envelope::new(
            MessageType::HttpResponse,
            &HttpResponsePayload { response },
        )?;
        self.session.send(envelope).await
    }

    /// Take a pooled loopback connection or open a new one.
    async fn connection(&self, port: u16) -> Result<Sender, ClientError> {
        {
            let mut pool = self.pool.lock().await;
            if let Some(senders) = pool.get_mut(&port) {
                while let Some(sender) = senders.pop() {
                    if sender.is_ready() {
                        debug!("reusing pooled connection to port {port}");
                        return Ok(sender);
                    }
                }
            }
        }

        let stream = TcpStream::connect(("127.0.0.1", port)).await.map_err(|e| {
            ClientError::LocalIo(format!("failed to connect to 127.0.0.1:{port}: {e}"))
        })?;
        let io = TokioIo::new(stream);

        let (sender, conn) = http1::handshake(io)
            .await
            .map_err(|e| ClientError::LocalIo(format!("loopback handshake failed: {e}")))?;

        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!("loopback connection closed: {err}");
            }
        });

        Ok(sender)
    }

    async fn recycle(&self, port: u16, sender: Sender) {
        if !sender.is_ready() {
            return;
        }
        let mut pool = self.pool.lock().await;
        let senders = pool.entry(port).or_default();
        if senders.len() < MAX_POOL_PER_PORT {
            senders.push(sender);
        }
    }
}

fn first_header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, values)| values.first())
        .cloned()
}

fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| HeaderValue::from_static(""))
}
