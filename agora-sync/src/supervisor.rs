//! Reconnect state machine for one room connection.
//!
//! ```text
//!            connect()              handshake ok
//!   Idle ─────────────► Connecting ─────────────► Open
//!                          ▲   │ dial failed         │ closed / error
//!          timer fired     │   ▼                     ▼
//!                       Reconnecting ◄───────────────┘
//!
//!   any state ── disconnect() ──► Closed   (terminal until connect())
//! ```
//!
//! [`ConnectionMachine`] is pure: it performs no I/O and owns no timers. The
//! client driver feeds it transport outcomes and carries out what it
//! returns. Each dial gets a fresh epoch; outcomes tagged with an older
//! epoch come from a superseded transport and are ignored.

use std::time::Duration;

use crate::backoff::Backoff;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Never connected.
    #[default]
    Idle,
    /// Handshake in progress.
    Connecting,
    Open,
    /// Waiting for the backoff timer.
    Reconnecting,
    /// Explicitly disconnected.
    Closed,
}

/// Instruction to open a transport for `room_id`, tagged with `epoch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dial {
    pub room_id: String,
    pub epoch: u64,
}

/// Supervisor state for one room connection.
#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    backoff: Backoff,
    /// Room of the last explicit connect.
    room_id: Option<String>,
    /// Tag of the live transport.
    epoch: u64,
    /// At most one reconnect timer is outstanding.
    reconnect_pending: bool,
    /// Set by disconnect, cleared by connect.
    stopped: bool,
}

impl ConnectionMachine {
    /// Create an idle machine using `backoff` for reconnect delays.
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: ConnectionState::Idle,
            backoff,
            room_id: None,
            epoch: 0,
            reconnect_pending: false,
            stopped: false,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Room being connected to, if any.
    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    /// Epoch of the most recent dial or disconnect.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether `epoch` belongs to the live transport.
    pub fn is_current(&self, epoch: u64) -> bool {
        !self.stopped && epoch == self.epoch
    }

    /// Check whether a reconnect timer should be running.
    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    /// Explicit connect. Supersedes any previous transport and any pending
    /// reconnect, and starts a fresh backoff sequence.
    pub fn connect(&mut self, room_id: impl Into<String>) -> Dial {
        self.room_id = Some(room_id.into());
        self.stopped = false;
        self.reconnect_pending = false;
        self.backoff.reset();
        self.dial()
    }

    /// Handshake for `epoch` completed. Returns false for stale epochs.
    pub fn opened(&mut self, epoch: u64) -> bool {
        if !self.is_current(epoch) || self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Open;
        self.backoff.reset();
        true
    }

    /// Transport for `epoch` closed, errored, or failed to dial.
    ///
    /// Returns the reconnect delay to schedule, or `None` if the epoch is
    /// stale, the machine was disconnected, or a reconnect is already pending.
    pub fn connection_lost(&mut self, epoch: u64) -> Option<Duration> {
        if !self.is_current(epoch) {
            return None;
        }
        if !matches!(self.state, ConnectionState::Connecting | ConnectionState::Open) {
            return None;
        }
        self.state = ConnectionState::Reconnecting;
        self.schedule_reconnect()
    }

    fn schedule_reconnect(&mut self) -> Option<Duration> {
        if self.reconnect_pending || self.stopped {
            return None;
        }
        self.reconnect_pending = true;
        Some(self.backoff.next_delay())
    }

    /// The scheduled reconnect timer fired. A no-op after `disconnect()`.
    pub fn reconnect_due(&mut self) -> Option<Dial> {
        if !self.reconnect_pending {
            return None;
        }
        self.reconnect_pending = false;
        if self.stopped || self.state != ConnectionState::Reconnecting {
            return None;
        }
        Some(self.dial())
    }

    /// Explicit disconnect. Idempotent; cancels any pending reconnect and
    /// invalidates the current epoch. Returns whether anything was active.
    pub fn disconnect(&mut self) -> bool {
        let was_active = !matches!(self.state, ConnectionState::Idle | ConnectionState::Closed);
        self.stopped = true;
        self.reconnect_pending = false;
        self.epoch += 1;
        self.state = ConnectionState::Closed;
        was_active
    }

    fn dial(&mut self) -> Dial {
        self.epoch += 1;
        self.state = ConnectionState::Connecting;
        Dial {
            room_id: self.room_id.clone().unwrap_or_default(),
            epoch: self.epoch,
        }
    }
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new(Backoff::default())
    }
}
