//! WebSocket room client: the connection supervisor's event loop.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with backoff)
//! - Inbound frame decoding and duplicate suppression
//! - Fire-and-forget chat sends
//!
//! ```text
//!  RoomClient (handle) ── Command ──►┌──────────────────────┐
//!                                    │ driver task          │── publish ──► EventBus
//!  connection task (epoch N) ───────►│ ConnectionMachine    │
//!     socket I/O, TransportEvent     │ EventDeduplicator    │
//!                                    │ reconnect timer      │
//!                                    └──────────────────────┘
//! ```
//!
//! Everything that touches session state runs on the single driver task, so
//! no two handlers for a session ever run concurrently. Transport outcomes
//! carry the epoch of the dial that produced them; outcomes from a
//! superseded transport are discarded.

use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use futures_util::{Sink, SinkExt, StreamExt};
use reqwest::Url;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tokio_tungstenite::tungstenite::Message;

use crate::backoff::Backoff;
use crate::bus::{EventBus, Subscription};
use crate::config::{Credentials, SyncConfig};
use crate::dedup::EventDeduplicator;
use crate::error::SyncError;
use crate::model::RoomEvent;
use crate::protocol::{InboundFrame, OutboundFrame};
use crate::supervisor::{ConnectionMachine, ConnectionState, Dial};

#[derive(Debug)]
enum Command {
    Connect(String),
    Disconnect,
    SendChat(String),
    Shutdown,
}

/// Outcome reported by a connection task.
#[derive(Debug)]
enum TransportEvent {
    Opened { epoch: u64 },
    Frame { epoch: u64, text: String },
    Failed { epoch: u64, detail: String },
    Closed { epoch: u64 },
}

/// Where and how to dial.
#[derive(Debug, Clone)]
struct Endpoint {
    base: Url,
    credentials: Credentials,
}

impl Endpoint {
    fn parse(ws_base: &str, credentials: Credentials) -> Result<Self, SyncError> {
        let base = Url::parse(ws_base)
            .map_err(|e| SyncError::Transport(format!("invalid transport url {ws_base:?}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(SyncError::Transport(format!(
                "transport url {ws_base:?} cannot carry a path"
            )));
        }
        Ok(Self { base, credentials })
    }

    /// `{base}/ws/rooms/{room_id}?access_token=..&user_id=..`
    fn room_url(&self, room_id: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["ws", "rooms", room_id]);
        }
        url.query_pairs_mut()
            .append_pair("access_token", &self.credentials.access_token)
            .append_pair("user_id", &self.credentials.user_id);
        url
    }
}

/// Build the transport URL for `room_id`.
pub fn room_url(ws_base: &str, room_id: &str, credentials: &Credentials) -> Result<Url, SyncError> {
    Ok(Endpoint::parse(ws_base, credentials.clone())?.room_url(room_id))
}

/// Handle to one room's connection supervisor.
///
/// Dropping the handle tears the supervisor down: the transport is closed
/// and any pending reconnect timer is cancelled.
pub struct RoomClient {
    /// Requests to the driver task.
    commands: mpsc::UnboundedSender<Command>,
    /// Latest state published by the driver.
    state_rx: watch::Receiver<ConnectionState>,
    bus: EventBus,
    /// Driver task, awaited by `shutdown`.
    task: Option<JoinHandle<()>>,
}

impl RoomClient {
    /// Spawn the supervisor. Must be called from within a tokio runtime.
    pub fn new(config: &SyncConfig) -> Result<Self, SyncError> {
        Self::with_bus(config, EventBus::new())
    }

    /// Spawn the supervisor publishing onto an existing bus.
    pub fn with_bus(config: &SyncConfig, bus: EventBus) -> Result<Self, SyncError> {
        config.validate()?;
        let endpoint = Endpoint::parse(&config.ws_base, config.credentials.clone())?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let driver = Driver {
            endpoint,
            machine: ConnectionMachine::new(Backoff::new(
                config.backoff_floor,
                config.backoff_ceiling,
            )),
            dedup: EventDeduplicator::new(),
            bus: bus.clone(),
            state_tx,
            transport_tx,
            conn: None,
        };
        let task = tokio::spawn(driver.run(command_rx, transport_rx));

        Ok(Self {
            commands,
            state_rx,
            bus,
            task: Some(task),
        })
    }

    /// Open a connection to `room_id`, superseding any current one.
    pub fn connect(&self, room_id: impl Into<String>) {
        self.command(Command::Connect(room_id.into()));
    }

    /// Close the connection and cancel any scheduled reconnect. Idempotent.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Send a chat message. Silently dropped unless the connection is open.
    pub fn send_chat(&self, text: impl Into<String>) {
        self.command(Command::SendChat(text.into()));
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the connection reaches `target`.
    pub async fn wait_for(&self, target: ConnectionState) -> bool {
        self.state_rx
            .clone()
            .wait_for(|state| *state == target)
            .await
            .is_ok()
    }

    /// Bus this client publishes onto.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Register a handler for room events.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&RoomEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(handler)
    }

    /// Stop the supervisor and wait for it to release the transport.
    pub async fn shutdown(mut self) {
        self.command(Command::Shutdown);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::debug!("Room client supervisor already stopped");
        }
    }
}

impl Drop for RoomClient {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

// ───────────────────────────────────────────────────────────────────
// Driver (session event loop)
// ───────────────────────────────────────────────────────────────────

/// A spawned transport for one epoch.
struct ActiveConnection {
    epoch: u64,
    /// Text frames for the socket writer; dropping it closes the socket.
    outgoing: Option<mpsc::UnboundedSender<String>>,
    /// Socket task, aborted on drop unless detached by `close`.
    task: Option<JoinHandle<()>>,
    /// Handshake completed.
    opened: bool,
}

impl ActiveConnection {
    fn send(&self, text: String) -> bool {
        self.outgoing.as_ref().is_some_and(|tx| tx.send(text).is_ok())
    }

    /// Release the transport. An open socket gets a close frame; a dial
    /// still in its handshake is aborted.
    fn close(mut self) {
        self.outgoing.take();
        if self.opened {
            // The task sends the close frame and exits on its own.
            self.task.take();
        }
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Driver {
    endpoint: Endpoint,
    machine: ConnectionMachine,
    /// Window for the current transport only.
    dedup: EventDeduplicator,
    bus: EventBus,
    state_tx: watch::Sender<ConnectionState>,
    /// Cloned into every connection task.
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    /// Transport for the current epoch.
    conn: Option<ActiveConnection>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let reconnect = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(reconnect);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Connect(room_id)) => self.connect(room_id),
                    Some(Command::Disconnect) => self.disconnect(),
                    Some(Command::SendChat(text)) => self.send_chat(text),
                    Some(Command::Shutdown) | None => {
                        self.disconnect();
                        break;
                    }
                },
                Some(event) = transport.recv() => {
                    if let Some(delay) = self.on_transport(event) {
                        arm(reconnect.as_mut(), delay);
                    }
                }
                () = &mut reconnect, if self.machine.reconnect_pending() => {
                    self.reconnect_due();
                }
            }
        }
        log::debug!("Room client supervisor stopped");
    }

    fn connect(&mut self, room_id: String) {
        self.close_transport();
        let dial = self.machine.connect(room_id);
        self.dial(dial);
    }

    fn disconnect(&mut self) {
        let was_active = self.machine.disconnect();
        self.close_transport();
        self.dedup.reset();
        self.publish_state();
        if was_active {
            log::info!("Disconnected from room {}", self.machine.room_id().unwrap_or("?"));
            self.bus.publish(&RoomEvent::Closed);
        }
    }

    fn reconnect_due(&mut self) {
        if let Some(dial) = self.machine.reconnect_due() {
            self.dial(dial);
        }
    }

    fn dial(&mut self, dial: Dial) {
        // Every new transport starts a fresh dedup window.
        self.dedup.reset();
        self.publish_state();

        let url = self.endpoint.room_url(&dial.room_id);
        log::info!("Connecting to room {} (epoch {})", dial.room_id, dial.epoch);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(
            url,
            dial.epoch,
            out_rx,
            self.transport_tx.clone(),
        ));
        self.conn = Some(ActiveConnection {
            epoch: dial.epoch,
            outgoing: Some(out_tx),
            task: Some(task),
            opened: false,
        });
    }

    fn close_transport(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
    }

    fn on_transport(&mut self, event: TransportEvent) -> Option<Duration> {
        match event {
            TransportEvent::Opened { epoch } => {
                if !self.machine.opened(epoch) {
                    log::debug!("Discarding open from superseded transport (epoch {epoch})");
                    return None;
                }
                if let Some(conn) = self.conn.as_mut().filter(|c| c.epoch == epoch) {
                    conn.opened = true;
                }
                self.publish_state();
                log::info!("Connected to room {}", self.machine.room_id().unwrap_or("?"));
                self.bus.publish(&RoomEvent::Opened);
                None
            }
            TransportEvent::Frame { epoch, text } => {
                if self.machine.is_current(epoch) {
                    self.handle_frame(&text);
                } else {
                    log::debug!("Discarding frame from superseded transport (epoch {epoch})");
                }
                None
            }
            TransportEvent::Failed { epoch, detail } => {
                if !self.machine.is_current(epoch) {
                    return None;
                }
                log::warn!("Transport error: {detail}");
                self.bus.publish(&RoomEvent::TransportError { detail });
                self.connection_lost(epoch)
            }
            TransportEvent::Closed { epoch } => {
                if !self.machine.is_current(epoch) {
                    return None;
                }
                log::info!("Transport closed by peer");
                self.connection_lost(epoch)
            }
        }
    }

    fn connection_lost(&mut self, epoch: u64) -> Option<Duration> {
        self.conn.take();
        let delay = self.machine.connection_lost(epoch);
        self.publish_state();
        self.bus.publish(&RoomEvent::Closed);
        if let Some(delay) = delay {
            log::info!(
                "Reconnecting to room {} in {delay:?}",
                self.machine.room_id().unwrap_or("?")
            );
        }
        delay
    }

    fn handle_frame(&mut self, text: &str) {
        let frame = match InboundFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping malformed frame: {e}");
                return;
            }
        };
        if let InboundFrame::Ignored { kind } = &frame {
            log::debug!("Ignoring frame of unknown type {kind:?}");
            return;
        }
        let Some(event) = frame.into_event(Utc::now()) else {
            return;
        };
        if self.dedup.admit(&event) {
            self.bus.publish(&event);
        } else {
            log::debug!("Suppressed duplicate event {:?}", event.identity());
        }
    }

    fn send_chat(&mut self, text: String) {
        let state = self.machine.state();
        if state != ConnectionState::Open {
            log::debug!("Dropping chat send while {state:?}");
            return;
        }
        let frame = OutboundFrame::chat(text).encode();
        let sent = self.conn.as_ref().is_some_and(|conn| conn.send(frame));
        if !sent {
            log::debug!("Dropping chat send: transport writer gone");
        }
    }

    fn publish_state(&self) {
        let next = self.machine.state();
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }
}

fn arm(timer: Pin<&mut Sleep>, delay: Duration) {
    timer.reset(Instant::now() + delay);
}

/// How long a released transport may spend sending its close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Send a close frame, giving up after `limit`. Returns whether it was sent.
async fn close_gracefully<S>(sink: &mut S, limit: Duration) -> bool
where
    S: Sink<Message> + Unpin,
{
    matches!(
        tokio::time::timeout(limit, sink.send(Message::Close(None))).await,
        Ok(Ok(()))
    )
}

/// Socket I/O for one transport epoch.
async fn run_connection(
    url: Url,
    epoch: u64,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            let _ = events.send(TransportEvent::Failed {
                epoch,
                detail: format!("connect failed: {e}"),
            });
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();
    if events.send(TransportEvent::Opened { epoch }).is_err() {
        return;
    }

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Frame {
                        epoch,
                        text: text.as_str().to_owned(),
                    });
                }
                Some(Ok(Message::Close(_))) | None => {
                    let _ = events.send(TransportEvent::Closed { epoch });
                    break;
                }
                // Binary frames and control frames carry nothing for us.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(TransportEvent::Failed {
                        epoch,
                        detail: e.to_string(),
                    });
                    break;
                }
            },
            out = outgoing.recv() => match out {
                Some(text) => {
                    if let Err(e) = sink.send(Message::text(text)).await {
                        let _ = events.send(TransportEvent::Failed {
                            epoch,
                            detail: format!("send failed: {e}"),
                        });
                        break;
                    }
                }
                None => {
                    if !close_gracefully(&mut sink, CLOSE_TIMEOUT).await {
                        log::debug!("Peer did not take the close frame (epoch {epoch})");
                    }
                    break;
                }
            },
        }
    }
}
