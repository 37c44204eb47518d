//! Shared fixtures: an in-process broker stub speaking the control
//! protocol over WebSocket, a canned token-validation endpoint, and a tiny
//! loopback HTTP server.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use haxorport_client::ClientConfig;
use haxorport_proto::{codec, Envelope, ErrorPayload, MessageType, RegisterResponsePayload};

/// How the stub broker responds to a new connection and to frames.
#[derive(Clone, Default)]
pub struct BrokerBehavior {
    /// Auto-reply sent for every `register` request.
    pub register_reply: Option<RegisterResponsePayload>,
    /// Error frame pushed immediately after the WebSocket handshake.
    pub error_on_connect: Option<ErrorPayload>,
}

pub enum BrokerCommand {
    Send(Envelope),
    Drop,
}

/// An in-process broker accepting control connections one at a time.
pub struct StubBroker {
    pub port: u16,
    /// Every frame the client sent, in order.
    pub frames: mpsc::UnboundedReceiver<Envelope>,
    pub connections: Arc<AtomicUsize>,
    commands: mpsc::UnboundedSender<BrokerCommand>,
}

impl StubBroker {
    pub async fn start(behavior: BrokerBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));

        let accepted = Arc::clone(&connections);
        tokio::spawn(async move {
            let mut cmd_rx = cmd_rx;
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                serve_connection(ws, behavior.clone(), frame_tx.clone(), &mut cmd_rx).await;
            }
        });

        Self {
            port,
            frames: frame_rx,
            connections,
            commands: cmd_tx,
        }
    }

    /// Push a frame to the currently connected client.
    pub fn send(&self, envelope: Envelope) {
        self.commands.send(BrokerCommand::Send(envelope)).unwrap();
    }

    /// Forcibly close the current connection.
    pub fn drop_connection(&self) {
        self.commands.send(BrokerCommand::Drop).unwrap();
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Wait for the next frame of the given type, skipping others.
    pub async fn expect_frame(&mut self, message_type: MessageType) -> Envelope {
        timeout(Duration::from_secs(5), async {
            loop {
                let envelope = self.frames.recv().await.expect("broker channel closed");
                if envelope.message_type == message_type {
                    return envelope;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {message_type} frame"))
    }

    /// Assert that no frame of the given type arrives within the window.
    pub async fn assert_no_frame(&mut self, message_type: MessageType, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match timeout(Duration::from_millis(25), self.frames.recv()).await {
                Ok(Some(envelope)) => {
                    assert_ne!(
                        envelope.message_type, message_type,
                        "unexpected {message_type} frame"
                    );
                }
                Ok(None) => return,
                Err(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return;
            }
        }
    }
}

async fn serve_connection(
    mut ws: WebSocketStream<TcpStream>,
    behavior: BrokerBehavior,
    frame_tx: mpsc::UnboundedSender<Envelope>,
    cmd_rx: &mut mpsc::UnboundedReceiver<BrokerCommand>,
) {
    if let Some(error) = &behavior.error_on_connect {
        let envelope = Envelope::new(MessageType::Error, error).unwrap();
        ws.send(Message::Text(codec::to_text(&envelope).unwrap()))
            .await
            .ok();
    }

    loop {
        tokio::select! {
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let envelope = codec::decode(text.as_bytes()).expect("client sent invalid frame");
                    match envelope.message_type {
                        MessageType::Register => {
                            if let Some(reply) = &behavior.register_reply {
                                let reply = Envelope::new(MessageType::Register, reply).unwrap();
                                ws.send(Message::Text(codec::to_text(&reply).unwrap())).await.ok();
                            }
                        }
                        MessageType::Ping => {
                            let pong = Envelope::empty(MessageType::Pong);
                            ws.send(Message::Text(codec::to_text(&pong).unwrap())).await.ok();
                        }
                        _ => {}
                    }
                    frame_tx.send(envelope).ok();
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
            command = cmd_rx.recv() => match command {
                Some(BrokerCommand::Send(envelope)) => {
                    ws.send(Message::Text(codec::to_text(&envelope).unwrap())).await.ok();
                }
                Some(BrokerCommand::Drop) => {
                    // Drop without a close handshake.
                    break;
                }
                None => break,
            },
        }
    }
}

/// Client config pointed at the stub broker, auth disabled.
pub fn test_config(broker_port: u16) -> ClientConfig {
    ClientConfig {
        server_address: "127.0.0.1".to_string(),
        control_port: broker_port,
        ..ClientConfig::default()
    }
}

/// Canned validation response with the given tunnel quota.
pub fn auth_response_json(used: i64, limit: i64, reached: bool) -> String {
    format!(
        r#"{{
            "code": 200,
            "status": "success",
            "message": "ok",
            "data": {{
                "user_id": "u1",
                "fullname": "Test User",
                "username": "test",
                "email": "test@example.com",
                "subscription": {{
                    "name": "pro",
                    "limits": {{
                        "tunnels": {{"limit": {limit}, "used": {used}, "reached": {reached}}},
                        "ports": {{"limit": 5, "used": 0, "reached": false}},
                        "bandwidth": {{"limit": 0, "used": 0, "reached": false}},
                        "requests": {{"limit": 0, "used": 0, "reached": false}}
                    }},
                    "features": {{"customDomains": false, "analytics": false, "prioritySupport": false}}
                }}
            }},
            "meta": {{"header_status_code": 200}}
        }}"#
    )
}

/// One-response-per-connection HTTP endpoint serving a canned body.
pub async fn spawn_validation_endpoint(body: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let body = body.clone();
            tokio::spawn(async move {
                read_http_request(&mut stream).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                stream.write_all(response.as_bytes()).await.ok();
                stream.shutdown().await.ok();
            });
        }
    });

    format!("http://{addr}/AuthToken/validate")
}

/// Tiny loopback HTTP server returning one canned response per connection
/// and recording each request head+body it saw. Any `{port}` placeholder in
/// the body is replaced with the bound port.
pub struct LocalHttp {
    pub port: u16,
    pub requests: mpsc::UnboundedReceiver<String>,
}

pub async fn spawn_local_http(content_type: &str, body: &str) -> LocalHttp {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (request_tx, request_rx) = mpsc::unbounded_channel();

    let content_type = content_type.to_string();
    let body = body.replace("{port}", &port.to_string());
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let content_type = content_type.clone();
            let body = body.clone();
            let request_tx = request_tx.clone();
            tokio::spawn(async move {
                let request = read_http_request(&mut stream).await;
                request_tx.send(request).ok();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    content_type,
                    body.len(),
                    body
                );
                stream.write_all(response.as_bytes()).await.ok();
                stream.shutdown().await.ok();
            });
        }
    });

    LocalHttp {
        port,
        requests: request_rx,
    }
}

/// Read one HTTP request (head plus content-length body) as a string.
async fn read_http_request(stream: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];

    loop {
        let Ok(n) = stream.read(&mut buf).await else {
            break;
        };
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);

        if let Some(head_end) = find_subsequence(&data, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&data[..head_end]).to_string();
            let content_length = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())?
                })
                .unwrap_or(0);
            if data.len() >= head_end + 4 + content_length {
                break;
            }
        }
    }

    String::from_utf8_lossy(&data).to_string()
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Grab a port the OS considers free. Racy by nature, fine for tests.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Connect to an address that may not be listening yet.
pub async fn connect_with_retry(addr: &str) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("could not connect to {addr}");
}

/// Poll a condition until it holds or the deadline passes.
pub async fn wait_for(mut condition: impl FnMut() -> bool, deadline: Duration) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}
