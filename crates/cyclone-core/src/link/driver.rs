//! The task behind an [`EngineLink`](super::EngineLink).
//!
//! One driver owns the socket, the reconnect timer, the query waiters and the
//! inventory cache. Handles talk to it through [`Command`]s; socket readers
//! and connect attempts report back through [`Inbound`], tagged with the
//! epoch they belong to so that anything from a replaced socket is ignored.

use super::filter::{ActiveFilter, ActiveKey};
use super::{LinkConfig, LinkEvent, LinkState};
use crate::debounce::{far_future, Debounce};
use crate::error::{Error, Result};
use crate::protocol::{encode_line, ClientMessage, LineFramer, QueryKind, ServerMessage};
use crate::state_store::{EngineState, StateStore};
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub(crate) type Waiter = oneshot::Sender<Result<ServerMessage>>;

pub(crate) enum Command {
    Connect,
    StateChanged,
    Send(ClientMessage),
    Query(QueryKind, Waiter),
    Cached(QueryKind, oneshot::Sender<Option<ServerMessage>>),
    Dispose,
}

pub(crate) enum Inbound {
    Connected {
        epoch: u64,
        result: std::io::Result<TcpStream>,
    },
    Message(u64, ServerMessage),
    Closed(u64),
}

struct Connection {
    epoch: u64,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

pub(crate) struct Driver {
    store: StateStore,
    config: LinkConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    state: watch::Sender<LinkState>,
    events: broadcast::Sender<LinkEvent>,

    conn: Option<Connection>,
    /// Epoch of the connect attempt in flight.
    pending: Option<u64>,
    epoch: u64,
    endpoint: Option<EngineState>,
    retry: Debounce,
    failed_attempts: u32,

    waiters: HashMap<QueryKind, Vec<Waiter>>,
    cache: HashMap<QueryKind, ServerMessage>,
    filter: ActiveFilter,
}

impl Driver {
    pub(crate) fn new(
        store: StateStore,
        config: LinkConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        state: watch::Sender<LinkState>,
        events: broadcast::Sender<LinkEvent>,
    ) -> Self {
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let retry = Debounce::new(config.reconnect_grace);
        Self {
            store,
            config,
            commands,
            inbound,
            inbound_tx,
            state,
            events,
            conn: None,
            pending: None,
            epoch: 0,
            endpoint: None,
            retry,
            failed_attempts: 0,
            waiters: HashMap::new(),
            cache: HashMap::new(),
            filter: ActiveFilter::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let deadline = self.retry.deadline().unwrap_or_else(far_future);
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Dispose) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(inbound) = self.inbound.recv() => self.handle_inbound(inbound).await,
                _ = tokio::time::sleep_until(deadline), if self.retry.is_pending() => {
                    if self.retry.fire(Instant::now()) {
                        self.retry_now();
                    }
                }
            }
        }
        self.dispose();
    }

    fn current(&self) -> LinkState {
        *self.state.borrow()
    }

    fn set_state(&mut self, next: LinkState) {
        if self.current() == next {
            return;
        }
        log::info!("[LINK] {:?} -> {:?}", self.current(), next);
        self.state.send_replace(next);
        let _ = self.events.send(LinkEvent::State(next));
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                if self.current() == LinkState::Disconnected {
                    match self.store.read() {
                        Some(record) => {
                            self.failed_attempts = 0;
                            self.begin_connect(record);
                        }
                        None => log::debug!("[LINK] Connect requested but no engine is running"),
                    }
                }
            }
            Command::StateChanged => self.state_changed(),
            Command::Send(message) => {
                if self.conn.is_some() {
                    self.write(&[message]).await;
                } else {
                    log::debug!("[LINK] Not connected, dropping {:?}", message);
                }
            }
            Command::Query(kind, waiter) => {
                if self.current() == LinkState::Disconnected {
                    let _ = waiter.send(Err(Error::NotRunning));
                    return;
                }
                self.waiters.entry(kind).or_default().push(waiter);
                if self.conn.is_some() {
                    self.write(&[kind.request()]).await;
                }
            }
            Command::Cached(kind, reply) => {
                let _ = reply.send(self.cache.get(&kind).cloned());
            }
            Command::Dispose => {}
        }
    }

    fn state_changed(&mut self) {
        let record = self.store.read();
        match self.current() {
            LinkState::Reconnecting => {
                log::debug!("[LINK] Engine record changed, reconnect already scheduled");
            }
            LinkState::Disconnected => {
                if let Some(record) = record {
                    self.failed_attempts = 0;
                    self.begin_connect(record);
                }
            }
            LinkState::Connecting | LinkState::Connected => {
                let moved = match (&record, &self.endpoint) {
                    (Some(new), Some(old)) => !new.same_endpoint(old),
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if let (true, Some(record)) = (moved, record) {
                    log::info!("[LINK] Engine moved to port {}", record.port);
                    self.failed_attempts = 0;
                    self.begin_connect(record);
                }
            }
        }
    }

    fn retry_now(&mut self) {
        match self.store.read() {
            Some(record) => self.begin_connect(record),
            None => {
                log::info!("[LINK] No engine running");
                self.give_up(Error::NotRunning);
            }
        }
    }

    /// Tear down any socket and start connecting to `record`.
    fn begin_connect(&mut self, record: EngineState) {
        self.teardown();
        self.retry.cancel();
        self.epoch += 1;
        let epoch = self.epoch;
        self.pending = Some(epoch);

        let addr = format!("{}:{}", self.config.host, record.port);
        log::debug!("[LINK] Connecting to {} (pid {})", addr, record.pid);
        self.endpoint = Some(record);
        self.set_state(LinkState::Connecting);

        let timeout = self.config.connect_timeout;
        let inbound = self.inbound_tx.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("timed out connecting to {}", addr),
                )),
            };
            let _ = inbound.send(Inbound::Connected { epoch, result });
        });
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Connected { epoch, result } => {
                if self.pending != Some(epoch) {
                    return;
                }
                self.pending = None;
                match result {
                    Ok(stream) => self.established(epoch, stream).await,
                    Err(e) => {
                        self.failed_attempts += 1;
                        log::warn!(
                            "[LINK] Connect failed ({}/{}): {}",
                            self.failed_attempts,
                            self.config.max_reconnect_attempts,
                            e
                        );
                        if self.failed_attempts >= self.config.max_reconnect_attempts {
                            self.give_up(Error::NotRunning);
                        } else {
                            self.schedule_retry();
                        }
                    }
                }
            }
            Inbound::Message(epoch, message) => {
                if self.conn.as_ref().map(|c| c.epoch) == Some(epoch) {
                    self.deliver(epoch, message);
                }
            }
            Inbound::Closed(epoch) => {
                if self.conn.as_ref().map(|c| c.epoch) == Some(epoch) {
                    log::warn!("[LINK] Connection lost");
                    self.teardown();
                    self.schedule_retry();
                }
            }
        }
    }

    async fn established(&mut self, epoch: u64, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let reader = tokio::spawn(read_socket(epoch, reader, self.inbound_tx.clone()));
        self.conn = Some(Connection {
            epoch,
            writer,
            reader,
        });
        self.failed_attempts = 0;
        self.set_state(LinkState::Connected);

        let startup: Vec<ClientMessage> =
            QueryKind::STARTUP.iter().map(|kind| kind.request()).collect();
        self.write(&startup).await;
    }

    fn schedule_retry(&mut self) {
        self.retry.trigger(Instant::now());
        self.set_state(LinkState::Reconnecting);
    }

    fn give_up(&mut self, reason: Error) {
        let disposed = matches!(reason, Error::Disposed);
        self.teardown();
        self.retry.cancel();
        self.pending = None;
        self.endpoint = None;
        self.failed_attempts = 0;
        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let error = if disposed {
                    Error::Disposed
                } else {
                    Error::NotRunning
                };
                let _ = waiter.send(Err(error));
            }
        }
        self.set_state(LinkState::Disconnected);
    }

    fn teardown(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.reader.abort();
            drop(conn.writer);
            log::debug!("[LINK] Closed connection {}", conn.epoch);
        }
    }

    /// Pipeline `messages` in one write.
    async fn write(&mut self, messages: &[ClientMessage]) {
        let mut payload = String::new();
        for message in messages {
            match encode_line(message) {
                Ok(line) => payload.push_str(&line),
                Err(e) => log::error!("[LINK] Failed to encode {:?}: {}", message, e),
            }
        }
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if let Err(e) = conn.writer.write_all(payload.as_bytes()).await {
            log::warn!("[LINK] Write failed: {}", e);
            self.teardown();
            self.schedule_retry();
        }
    }

    fn deliver(&mut self, epoch: u64, message: ServerMessage) {
        if let ServerMessage::Active {
            cycle, generation, ..
        } = &message
        {
            if !self.filter.accept(ActiveKey::new(epoch, *generation, *cycle)) {
                log::debug!("[LINK] Discarding stale active for cycle {}", cycle);
                return;
            }
        }

        if let Some(kind) = message.query_kind() {
            self.cache.insert(kind, message.clone());
            if let Some(waiters) = self.waiters.remove(&kind) {
                for waiter in waiters {
                    let _ = waiter.send(Ok(message.clone()));
                }
            }
        }

        let _ = self.events.send(LinkEvent::Message(message));
    }

    fn dispose(&mut self) {
        log::debug!("[LINK] Disposed");
        self.give_up(Error::Disposed);
    }
}

async fn read_socket(epoch: u64, mut reader: OwnedReadHalf, inbound: mpsc::UnboundedSender<Inbound>) {
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for message in framer.push_messages::<ServerMessage>(&buf[..n]) {
                    if inbound.send(Inbound::Message(epoch, message)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                log::debug!("[LINK] Read failed: {}", e);
                break;
            }
        }
    }
    let _ = inbound.send(Inbound::Closed(epoch));
}
