//! Shared fixtures: a scriptable room WebSocket server, a canned HTTP
//! responder, and an in-memory `RoomApi`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use agora_sync::api::{ApiError, HistoryPage, HistoryQuery, JoinReceipt, RoomApi};
use agora_sync::config::{Credentials, SyncConfig};
use agora_sync::model::{ChatMessage, Member, RoomEvent};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

/// Find a free port for testing.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Config pointing at `ws_base` with fast backoff.
pub fn test_config(ws_base: &str) -> SyncConfig {
    SyncConfig {
        ws_base: ws_base.to_string(),
        credentials: Credentials::new("tok", "42"),
        backoff_floor: Duration::from_millis(50),
        backoff_ceiling: Duration::from_millis(200),
        ..SyncConfig::default()
    }
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn chat_frame(msg_id: &str, text: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "chat",
        "payload": {"room_id": "R1", "user_id": 7, "message": text, "msg_id": msg_id, "ts_unix": 1_700_000_100}
    })
}

/// Next event matching `pred`, skipping others.
pub async fn next_matching<F>(events: &mut mpsc::UnboundedReceiver<RoomEvent>, pred: F) -> RoomEvent
where
    F: Fn(&RoomEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// ─── WebSocket room server ──────────────────────────────────────────────────

enum ServerCommand {
    Text(String),
    Close,
    Abort,
}

/// One accepted client connection, driven by the test.
pub struct MockConnection {
    /// Request path and query the client dialed.
    pub uri: String,
    commands: mpsc::UnboundedSender<ServerCommand>,
    received: mpsc::UnboundedReceiver<String>,
}

impl MockConnection {
    pub fn send_json(&self, value: serde_json::Value) {
        self.send_raw(&value.to_string());
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.commands.send(ServerCommand::Text(text.to_string()));
    }

    /// Clean close handshake.
    pub fn close(&self) {
        let _ = self.commands.send(ServerCommand::Close);
    }

    /// Drop the socket without a close frame.
    pub fn abort(&self) {
        let _ = self.commands.send(ServerCommand::Abort);
    }

    /// Next text frame from the client; `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<String> {
        timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("timed out waiting for client frame")
    }
}

pub struct MockRoomServer {
    pub port: u16,
    accepted: Arc<AtomicUsize>,
    connections: mpsc::UnboundedReceiver<MockConnection>,
}

impl MockRoomServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (conn_tx, connections) = mpsc::unbounded_channel();

        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let conn_tx = conn_tx.clone();
                tokio::spawn(async move {
                    let mut uri = String::new();
                    let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        uri = req.uri().to_string();
                        Ok(resp)
                    };
                    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, capture).await else {
                        return;
                    };
                    let (mut sink, mut stream) = ws.split();
                    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
                    let (recv_tx, received) = mpsc::unbounded_channel();
                    if conn_tx
                        .send(MockConnection { uri, commands: cmd_tx, received })
                        .is_err()
                    {
                        return;
                    }

                    loop {
                        tokio::select! {
                            inbound = stream.next() => match inbound {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = recv_tx.send(text.as_str().to_owned());
                                }
                                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                                Some(Ok(_)) => {}
                            },
                            cmd = cmd_rx.recv() => match cmd {
                                Some(ServerCommand::Text(text)) => {
                                    if sink.send(Message::text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                Some(ServerCommand::Close) => {
                                    let _ = sink.send(Message::Close(None)).await;
                                    break;
                                }
                                Some(ServerCommand::Abort) | None => break,
                            },
                        }
                    }
                });
            }
        });

        Self {
            port,
            accepted,
            connections,
        }
    }

    pub fn ws_base(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> MockConnection {
        timeout(Duration::from_secs(5), self.connections.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("server stopped")
    }

    /// TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

// ─── HTTP responder ─────────────────────────────────────────────────────────

/// Serves canned responses in order and records each raw request head.
pub struct MockHttp {
    pub base: String,
    requests: mpsc::UnboundedReceiver<String>,
}

impl MockHttp {
    pub async fn start(responses: Vec<(u16, &'static str)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (req_tx, requests) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = req_tx.send(String::from_utf8_lossy(&head).into_owned());

                let reason = match status {
                    200 => "OK",
                    204 => "No Content",
                    401 => "Unauthorized",
                    409 => "Conflict",
                    _ => "Error",
                };
                let response = if status == 204 {
                    format!("HTTP/1.1 204 {reason}\r\nConnection: close\r\n\r\n")
                } else {
                    format!(
                        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    )
                };
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        Self {
            base: format!("http://127.0.0.1:{port}"),
            requests,
        }
    }

    /// Lowercased head of the next request received.
    pub async fn request(&mut self) -> String {
        timeout(Duration::from_secs(5), self.requests.recv())
            .await
            .expect("timed out waiting for request")
            .expect("responder stopped")
            .to_lowercase()
    }
}

// ─── In-memory RoomApi ──────────────────────────────────────────────────────

/// Scriptable `RoomApi` that counts calls.
#[derive(Default)]
pub struct FakeRoomApi {
    pub deny_join: bool,
    pub participants: Mutex<Vec<Member>>,
    pub pages: Mutex<HashMap<Option<String>, HistoryPage>>,
    pub joins: AtomicUsize,
    pub leaves: AtomicUsize,
    pub participant_calls: AtomicUsize,
}

impl FakeRoomApi {
    pub fn set_page(&self, after: Option<&str>, items: Vec<ChatMessage>, next: Option<&str>) {
        self.pages.lock().unwrap().insert(
            after.map(String::from),
            HistoryPage {
                items,
                next_cursor: next.map(String::from),
            },
        );
    }

    pub fn set_participants(&self, members: Vec<Member>) {
        *self.participants.lock().unwrap() = members;
    }
}

#[async_trait]
impl RoomApi for FakeRoomApi {
    async fn join(&self, room_id: &str) -> Result<JoinReceipt, ApiError> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        if self.deny_join {
            return Err(ApiError::Status {
                status: 403,
                message: "not a member".into(),
            });
        }
        Ok(JoinReceipt {
            room_id: room_id.to_string(),
            peer_id: "peer-1".into(),
        })
    }

    async fn leave(&self, _room_id: &str) -> Result<(), ApiError> {
        self.leaves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn participants(&self, _room_id: &str) -> Result<Vec<Member>, ApiError> {
        self.participant_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.participants.lock().unwrap().clone())
    }

    async fn history(&self, _room_id: &str, query: &HistoryQuery) -> Result<HistoryPage, ApiError> {
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&query.after)
            .cloned()
            .unwrap_or_default())
    }
}
