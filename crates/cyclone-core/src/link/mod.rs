//! Client side of the engine protocol.
//!
//! An [`EngineLink`] finds the engine through the [`StateStore`], keeps one
//! socket to it, and reconnects across engine restarts:
//!
//! ```text
//! Disconnected --record appears / connect()--> Connecting --socket up--> Connected
//!      ^                                            |                       |
//!      |                           connect fails    v      socket lost      |
//!      +---- no record after grace ------------ Reconnecting <--------------+
//! ```
//!
//! Inventory replies are matched by type: every caller waiting for `samples`
//! is answered by the next `samples` message, whoever asked for it.

mod driver;
pub mod filter;

pub use filter::{ActiveFilter, ActiveKey};

use crate::error::{Error, Result};
use crate::protocol::{ClientMessage, QueryKind, ServerMessage};
use crate::state_store::StateStore;
use crate::watcher::{watch_state, WatchHandle, WatcherConfig};
use driver::{Command, Driver};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub host: String,
    /// Wait after a lost socket or failed attempt before retrying
    pub reconnect_grace: Duration,
    pub connect_timeout: Duration,
    /// Consecutive failed attempts before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            reconnect_grace: Duration::from_millis(500),
            connect_timeout: Duration::from_millis(1000),
            max_reconnect_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    State(LinkState),
    /// A message from the engine. Stale `active` messages are never sent.
    Message(ServerMessage),
}

/// Handle to a reconnecting engine connection.
///
/// Cloning is cheap; every clone drives the same connection.
#[derive(Clone)]
pub struct EngineLink {
    store: StateStore,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<LinkState>,
    events: broadcast::Sender<LinkEvent>,
}

impl EngineLink {
    /// Start the link's driver task on the current Tokio runtime. The link
    /// stays disconnected until [`connect`](Self::connect) or a state change.
    pub fn spawn(store: StateStore, config: LinkConfig) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(LinkState::Disconnected);
        let (events, _) = broadcast::channel(256);

        let driver = Driver::new(store.clone(), config, commands_rx, state_tx, events.clone());
        tokio::spawn(driver.run());

        Self {
            store,
            commands,
            state,
            events,
        }
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::Disposed)
    }

    /// Connect to the engine named by the state record.
    ///
    /// Fails with [`Error::NotRunning`] without touching the network when no
    /// valid record exists.
    pub fn connect(&self) -> Result<()> {
        if self.store.read().is_none() {
            return Err(Error::NotRunning);
        }
        self.command(Command::Connect)
    }

    /// Re-read the state record; wired to the state watcher.
    pub fn notify_state_changed(&self) {
        let _ = self.command(Command::StateChanged);
    }

    /// Keep this link following the state record until the handle stops.
    pub fn follow(&self, config: WatcherConfig) -> Result<WatchHandle> {
        let link = self.clone();
        watch_state(self.store.clone(), config, move |_| link.notify_state_changed())
    }

    /// Send a message. Dropped by the link if the socket is not up.
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        if self.state() != LinkState::Connected {
            return Err(Error::NotRunning);
        }
        self.command(Command::Send(message))
    }

    /// Ask for an inventory and wait for the next reply of that type.
    ///
    /// Waits across reconnects; fails when the link is or becomes
    /// disconnected.
    pub async fn query(&self, kind: QueryKind) -> Result<ServerMessage> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Query(kind, tx))?;
        rx.await.map_err(|_| Error::Disposed)?
    }

    /// The last inventory of this type received, if any.
    pub async fn cached(&self, kind: QueryKind) -> Option<ServerMessage> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Cached(kind, tx)).ok()?;
        rx.await.ok()?
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Wait until the link reaches `target`. False on timeout.
    pub async fn wait_for(&self, target: LinkState, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        tokio::time::timeout(timeout, state.wait_for(|s| *s == target))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Close the socket, cancel any pending reconnect and fail pending
    /// queries. Idempotent.
    pub fn dispose(&self) {
        let _ = self.command(Command::Dispose);
    }
}

impl std::fmt::Debug for EngineLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineLink")
            .field("state", &self.state())
            .field("store", &self.store.path())
            .finish()
    }
}
