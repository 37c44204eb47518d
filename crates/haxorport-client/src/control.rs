//! Control-channel session.
//!
//! Owns the WebSocket link to the broker: connects and authenticates,
//! serializes every outgoing frame through a single writer task, dispatches
//! inbound frames to registered handlers, heartbeats, and reconnects with
//! exponential backoff while preserving registered tunnels.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{interval, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use haxorport_proto::{
    codec, AuthPayload, DataPayload, Envelope, ErrorPayload, MessageType, RegisterPayload,
    RegisterResponsePayload, UnregisterPayload,
};

use crate::auth::{AuthData, TokenValidator};
use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::tls::build_client_tls;

/// Per-frame write deadline.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Register/unregister reply deadline.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);
/// Heartbeat cadence while authenticated.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Reconnect backoff bounds.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);
/// Outbound frame queue depth.
const SEND_QUEUE_DEPTH: usize = 64;
/// Supervisor poll cadence while the link is up.
const SUPERVISOR_POLL: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Authenticated,
    Closing,
}

/// Handler invoked by the reader for one inbound frame tag.
pub type MessageHandler =
    Arc<dyn Fn(Envelope) -> BoxFuture<'static, Result<(), ClientError>> + Send + Sync>;

type RegisterWaiter = oneshot::Sender<Result<RegisterResponsePayload, ClientError>>;

/// The long-lived duplex session with the broker.
pub struct ControlSession {
    config: Arc<ClientConfig>,
    state: RwLock<SessionState>,
    /// Sender into the writer task; present while a link is up.
    outbound: Mutex<Option<mpsc::Sender<Envelope>>>,
    handlers: RwLock<HashMap<MessageType, MessageHandler>>,
    /// One-shot waiter for the next register (or error) frame. The protocol
    /// has no correlation id, so at most one request may be outstanding.
    pending_register: Mutex<Option<RegisterWaiter>>,
    register_lock: tokio::sync::Mutex<()>,
    connect_lock: tokio::sync::Mutex<()>,
    /// Quota record from token validation; refreshed on each (re)connect.
    quota: RwLock<Option<AuthData>>,
    /// True between sending `auth` and the first inbound frame: an `error`
    /// arriving in this window is an authentication rejection.
    auth_window: AtomicBool,
    supervisor_running: AtomicBool,
    closed: AtomicBool,
    disconnected: Notify,
    fatal: Mutex<Option<ClientError>>,
    /// Sticky: once a fatal error occurred, the supervisor stops retrying
    /// even after the error itself has been consumed.
    fatal_seen: AtomicBool,
    fatal_notify: Notify,
    on_authenticated: RwLock<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl ControlSession {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            config,
            state: RwLock::new(SessionState::Disconnected),
            outbound: Mutex::new(None),
            handlers: RwLock::new(HashMap::new()),
            pending_register: Mutex::new(None),
            register_lock: tokio::sync::Mutex::new(()),
            connect_lock: tokio::sync::Mutex::new(()),
            quota: RwLock::new(None),
            auth_window: AtomicBool::new(false),
            supervisor_running: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            disconnected: Notify::new(),
            fatal: Mutex::new(None),
            fatal_seen: AtomicBool::new(false),
            fatal_notify: Notify::new(),
            on_authenticated: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().expect("state lock poisoned")
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write().expect("state lock poisoned") = state;
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Authenticated
    }

    /// Quota record from the last successful validation.
    pub fn quota(&self) -> Option<AuthData> {
        self.quota.read().expect("quota lock poisoned").clone()
    }

    /// Register a handler for one inbound frame tag. `register` replies,
    /// `pong`, and `error` are handled by the session itself.
    pub fn register_handler(&self, message_type: MessageType, handler: MessageHandler) {
        self.handlers
            .write()
            .expect("handler lock poisoned")
            .insert(message_type, handler);
    }

    /// Install a hook invoked on every transition into `Authenticated`.
    /// Registered tunnels are not re-announced automatically after a
    /// reconnect; this is where a caller can choose to do so.
    pub fn on_authenticated(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self
            .on_authenticated
            .write()
            .expect("hook lock poisoned") = Some(Arc::new(hook));
    }

    /// Connect to the broker and authenticate.
    ///
    /// Validates the token first when auth is enabled; a validation failure
    /// or an in-band rejection is fatal and must not be retried.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        let _guard = self.connect_lock.lock().await;

        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::TransportFailed("session closed".to_string()));
        }
        if self.is_connected() {
            return Ok(());
        }

        self.set_state(SessionState::Connecting);

        if self.config.auth_enabled && !self.config.auth_token.is_empty() {
            let validator = TokenValidator::new(self.config.auth_validation_url.as_str())
                .inspect_err(|_| self.set_state(SessionState::Disconnected))?;
            let data = match validator.validate(&self.config.auth_token).await {
                Ok(data) => data,
                Err(err) => {
                    self.set_state(SessionState::Disconnected);
                    return Err(err);
                }
            };
            info!(
                "token validated for {} <{}>; subscription {}: tunnels {}/{}",
                data.fullname,
                data.email,
                data.subscription.name,
                data.subscription.limits.tunnels.used,
                data.subscription.limits.tunnels.limit
            );
            *self.quota.write().expect("quota lock poisoned") = Some(data);
        }

        let url = self.config.control_url();
        info!("connecting to broker at {url}");

        let connector = if self.config.tls_enabled {
            match build_client_tls(&self.config) {
                Ok(tls) => Some(Connector::Rustls(tls)),
                Err(err) => {
                    self.set_state(SessionState::Disconnected);
                    return Err(err);
                }
            }
        } else {
            None
        };

        let (ws, _response) =
            match connect_async_tls_with_config(url.as_str(), None, false, connector).await {
                Ok(ok) => ok,
                Err(err) => {
                    self.set_state(SessionState::Disconnected);
                    return Err(ClientError::TransportFailed(format!(
                        "failed to connect to {url}: {err}"
                    )));
                }
            };

        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        *self.outbound.lock().expect("outbound lock poisoned") = Some(tx.clone());
        self.auth_window
            .store(self.config.auth_enabled, Ordering::SeqCst);

        self.spawn_writer(sink, rx);
        self.spawn_reader(stream);
        self.spawn_heartbeat(tx);

        self.set_state(SessionState::Authenticating);

        if self.config.auth_enabled {
            let envelope = Envelope::new(
                MessageType::Auth,
                &AuthPayload {
                    token: self.config.auth_token.clone(),
                },
            )?;
            self.send(envelope).await?;
        }

        // The broker sends no affirmative auth reply; the session is
        // authenticated once the frame is on the wire. A rejection arrives
        // as an `error` frame and is escalated by the reader.
        self.set_state(SessionState::Authenticated);
        info!("connected to broker at {url}");

        let hook = self
            .on_authenticated
            .read()
            .expect("hook lock poisoned")
            .clone();
        if let Some(hook) = hook {
            hook();
        }

        Ok(())
    }

    /// Queue one frame for the serialized writer, enforcing the per-state
    /// send policy.
    pub async fn send(&self, envelope: Envelope) -> Result<(), ClientError> {
        let state = self.state();
        let allowed = match envelope.message_type {
            MessageType::Auth => state == SessionState::Authenticating,
            _ => state == SessionState::Authenticated,
        };
        if !allowed {
            return Err(ClientError::TransportFailed(format!(
                "cannot send {} frame while {:?}",
                envelope.message_type, state
            )));
        }

        let tx = self
            .outbound
            .lock()
            .expect("outbound lock poisoned")
            .clone()
            .ok_or_else(|| ClientError::TransportFailed("not connected".to_string()))?;

        tx.send(envelope)
            .await
            .map_err(|_| ClientError::TransportFailed("writer task gone".to_string()))
    }

    /// Send a `data` frame for one bridged TCP connection.
    pub async fn send_data(
        &self,
        tunnel_id: &str,
        connection_id: &str,
        data: Vec<u8>,
    ) -> Result<(), ClientError> {
        let envelope = Envelope::new(
            MessageType::Data,
            &DataPayload {
                tunnel_id: tunnel_id.to_string(),
                connection_id: connection_id.to_string(),
                data,
            },
        )?;
        self.send(envelope).await
    }

    /// Send a `register` request and wait for the broker's reply.
    ///
    /// Replies carry no correlation id, so requests are serialized and a
    /// one-shot waiter picks up the next `register` (or `error`) frame.
    pub async fn register(
        &self,
        payload: RegisterPayload,
    ) -> Result<RegisterResponsePayload, ClientError> {
        let _guard = self.register_lock.lock().await;

        let (tx, rx) = oneshot::channel();
        *self
            .pending_register
            .lock()
            .expect("pending lock poisoned") = Some(tx);

        let envelope = Envelope::new(MessageType::Register, &payload)?;
        if let Err(err) = self.send(envelope).await {
            self.take_register_waiter();
            return Err(err);
        }

        match timeout(REPLY_TIMEOUT, rx).await {
            Ok(Ok(Ok(reply))) if reply.success => Ok(reply),
            Ok(Ok(Ok(reply))) => Err(ClientError::RegisterFailed(
                reply
                    .error
                    .unwrap_or_else(|| "registration refused by broker".to_string()),
            )),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(ClientError::TransportFailed(
                "register waiter dropped".to_string(),
            )),
            Err(_) => {
                self.take_register_waiter();
                Err(ClientError::RegisterFailed(
                    "timed out waiting for broker reply".to_string(),
                ))
            }
        }
    }

    /// Send an `unregister` frame. The broker does not reply.
    pub async fn unregister(&self, tunnel_id: &str) -> Result<(), ClientError> {
        let _guard = self.register_lock.lock().await;
        let envelope = Envelope::new(
            MessageType::Unregister,
            &UnregisterPayload {
                tunnel_id: tunnel_id.to_string(),
            },
        )?;
        self.send(envelope).await
    }

    /// Start the reconnect supervisor. Idempotent: later calls are no-ops.
    pub fn run_with_reconnect(self: &Arc<Self>) {
        if self.supervisor_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = Backoff::new(BACKOFF_INITIAL, BACKOFF_MAX);
            loop {
                if session.closed.load(Ordering::SeqCst)
                    || session.fatal_seen.load(Ordering::SeqCst)
                {
                    break;
                }
                if session.is_connected() {
                    tokio::select! {
                        _ = tokio::time::sleep(SUPERVISOR_POLL) => {}
                        _ = session.disconnected.notified() => {}
                    }
                    continue;
                }

                match session.connect().await {
                    Ok(()) => {
                        backoff.reset();
                    }
                    Err(err) if err.is_fatal() => {
                        error!("giving up on reconnect: {err}");
                        session.set_fatal(err);
                        break;
                    }
                    Err(err) => {
                        warn!("reconnect attempt failed: {err}");
                        backoff.wait().await;
                    }
                }
            }
            session.supervisor_running.store(false, Ordering::SeqCst);
            debug!("reconnect supervisor exited");
        });
    }

    /// Close the session. The writer drains, the transport closes, and the
    /// supervisor stops; no further reconnects happen.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.set_state(SessionState::Closing);
        // Dropping the sender ends the writer task, which closes the sink;
        // the reader then observes EOF and finishes the teardown.
        *self.outbound.lock().expect("outbound lock poisoned") = None;
        self.disconnected.notify_one();
    }

    /// Wait for a fatal session error (token invalid, auth rejected).
    pub async fn fatal_error(&self) -> ClientError {
        loop {
            if let Some(err) = self.fatal.lock().expect("fatal lock poisoned").take() {
                return err;
            }
            self.fatal_notify.notified().await;
        }
    }

    fn set_fatal(&self, err: ClientError) {
        *self.fatal.lock().expect("fatal lock poisoned") = Some(err);
        self.fatal_seen.store(true, Ordering::SeqCst);
        self.fatal_notify.notify_one();
        self.disconnected.notify_one();
    }

    fn take_register_waiter(&self) -> Option<RegisterWaiter> {
        self.pending_register
            .lock()
            .expect("pending lock poisoned")
            .take()
    }

    fn mark_disconnected(&self) {
        {
            let mut state = self.state.write().expect("state lock poisoned");
            if *state == SessionState::Disconnected {
                return;
            }
            *state = SessionState::Disconnected;
        }
        *self.outbound.lock().expect("outbound lock poisoned") = None;
        if let Some(waiter) = self.take_register_waiter() {
            let _ = waiter.send(Err(ClientError::TransportFailed(
                "connection lost".to_string(),
            )));
        }
        self.disconnected.notify_one();
        info!("disconnected from broker");
    }

    fn spawn_writer(self: &Arc<Self>, mut sink: WsSink, mut rx: mpsc::Receiver<Envelope>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let text = match codec::to_text(&envelope) {
                    Ok(text) => text,
                    Err(err) => {
                        error!("failed to encode {} frame: {err}", envelope.message_type);
                        continue;
                    }
                };
                trace!("sending {} frame ({} bytes)", envelope.message_type, text.len());
                match timeout(WRITE_TIMEOUT, sink.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        error!("transport write failed: {err}");
                        break;
                    }
                    Err(_) => {
                        error!("transport write timed out");
                        break;
                    }
                }
            }
            let _ = sink.close().await;
            session.mark_disconnected();
            debug!("writer task exited");
        });
    }

    fn spawn_reader(self: &Arc<Self>, mut stream: WsStream) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if session.dispatch(text.as_bytes()).await.is_break() {
                            break;
                        }
                    }
                    Ok(Message::Binary(data)) => {
                        if session.dispatch(&data).await.is_break() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("broker closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!("transport read failed: {err}");
                        break;
                    }
                }
            }
            session.mark_disconnected();
            debug!("reader task exited");
        });
    }

    /// Decode one inbound frame and route it. Malformed frames are dropped;
    /// the session continues.
    async fn dispatch(self: &Arc<Self>, bytes: &[u8]) -> ControlFlow<()> {
        let envelope = match codec::decode(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("dropping malformed frame: {err}");
                return ControlFlow::Continue(());
            }
        };

        match envelope.message_type.clone() {
            MessageType::Pong => {
                trace!("pong from broker");
                self.auth_window.store(false, Ordering::SeqCst);
            }
            MessageType::Error => {
                let payload: ErrorPayload = envelope.parse_payload().unwrap_or(ErrorPayload {
                    code: "UNKNOWN".to_string(),
                    message: "malformed error payload".to_string(),
                });
                error!("broker error {}: {}", payload.code, payload.message);

                if self.auth_window.swap(false, Ordering::SeqCst) {
                    // First frame after auth was an error: rejection.
                    self.set_fatal(ClientError::AuthRejected {
                        code: payload.code,
                        message: payload.message,
                    });
                    return ControlFlow::Break(());
                }

                if let Some(waiter) = self.take_register_waiter() {
                    let _ = waiter.send(Err(ClientError::RegisterFailed(format!(
                        "{}: {}",
                        payload.code, payload.message
                    ))));
                }
            }
            MessageType::Register => {
                self.auth_window.store(false, Ordering::SeqCst);
                match envelope.parse_payload::<RegisterResponsePayload>() {
                    Ok(reply) => match self.take_register_waiter() {
                        Some(waiter) => {
                            let _ = waiter.send(Ok(reply));
                        }
                        None => warn!("register reply with no outstanding request"),
                    },
                    Err(err) => warn!("malformed register reply: {err}"),
                }
            }
            message_type => {
                self.auth_window.store(false, Ordering::SeqCst);
                let handler = self
                    .handlers
                    .read()
                    .expect("handler lock poisoned")
                    .get(&message_type)
                    .cloned();
                match handler {
                    Some(handler) => {
                        if let Err(err) = handler(envelope).await {
                            warn!("handler for {message_type} failed: {err}");
                        }
                    }
                    None => warn!("no handler for {message_type} frame"),
                }
            }
        }

        ControlFlow::Continue(())
    }

    fn spawn_heartbeat(self: &Arc<Self>, tx: mpsc::Sender<Envelope>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(PING_INTERVAL);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                if !session.is_connected() {
                    // Tick while not authenticated emits nothing.
                    continue;
                }
                trace!("sending heartbeat ping");
                if tx.send(Envelope::empty(MessageType::Ping)).await.is_err() {
                    break;
                }
            }
            debug!("heartbeat task exited");
        });
    }
}
