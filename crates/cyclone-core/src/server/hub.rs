//! Connection set and broadcast fan-out.
//!
//! The hub task is the only owner of the set of live connections. Accepts,
//! closures, unicasts and broadcasts all reach it as commands, so the set is
//! never touched concurrently.

use crate::protocol::{encode_line, ActiveElement, ServerMessage};
use crate::transport::SharedTransport;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

pub type ConnId = u64;

/// Lines queued for one connection before it counts as not reading.
pub(crate) const OUTBOX_CAPACITY: usize = 256;

/// The hub's end of one connection.
#[derive(Debug)]
pub(crate) struct Peer {
    pub outbox: mpsc::Sender<String>,
    /// Never sent on. Dropping it tells the connection's tasks to close.
    pub close: watch::Sender<()>,
}

#[derive(Debug)]
pub(crate) enum HubCommand {
    Register { id: ConnId, peer: Peer },
    Broadcast(String),
    Unicast(ConnId, String),
    Closed(ConnId),
}

pub(crate) async fn run_hub(
    mut commands: mpsc::UnboundedReceiver<HubCommand>,
    live: Arc<AtomicUsize>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections: HashMap<ConnId, Peer> = HashMap::new();

    loop {
        let command = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            HubCommand::Register { id, peer } => {
                connections.insert(id, peer);
                log::debug!("[SERVER] Client {} joined ({} live)", id, connections.len());
            }
            HubCommand::Broadcast(line) => {
                connections.retain(|id, peer| deliver(*id, peer, line.clone()));
            }
            HubCommand::Unicast(id, line) => {
                let failed = match connections.get(&id) {
                    Some(peer) => !deliver(id, peer, line),
                    None => false,
                };
                if failed {
                    connections.remove(&id);
                }
            }
            HubCommand::Closed(id) => {
                if connections.remove(&id).is_some() {
                    log::debug!("[SERVER] Client {} left ({} live)", id, connections.len());
                }
            }
        }
        live.store(connections.len(), Ordering::Release);
    }

    live.store(0, Ordering::Release);
}

/// Queue `line` for `peer`; false means the connection must be dropped.
fn deliver(id: ConnId, peer: &Peer, line: String) -> bool {
    match peer.outbox.try_send(line) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            log::warn!("[SERVER] Client {} is not reading, dropping", id);
            false
        }
        Err(TrySendError::Closed(_)) => {
            log::debug!("[SERVER] Client {} gone, dropping", id);
            false
        }
    }
}

#[derive(Debug, Default)]
struct ActiveOrder {
    generation: u64,
    last_cycle: Option<i64>,
}

/// Pushes broadcasts to every live connection.
///
/// Cloneable; the evaluator holds one to publish active elements.
#[derive(Clone)]
pub struct Broadcaster {
    hub: mpsc::UnboundedSender<HubCommand>,
    transport: SharedTransport,
    order: Arc<Mutex<ActiveOrder>>,
    live: Arc<AtomicUsize>,
}

impl Broadcaster {
    pub(crate) fn new(
        hub: mpsc::UnboundedSender<HubCommand>,
        transport: SharedTransport,
        live: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            hub,
            transport,
            order: Arc::new(Mutex::new(ActiveOrder::default())),
            live,
        }
    }

    /// Number of connections currently registered.
    pub fn connections(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn send(&self, message: &ServerMessage) {
        match encode_line(message) {
            Ok(line) => {
                let _ = self.hub.send(HubCommand::Broadcast(line));
            }
            Err(e) => log::error!("[SERVER] Failed to encode {}: {}", message.type_name(), e),
        }
    }

    pub(crate) fn unicast(&self, id: ConnId, message: &ServerMessage) {
        match encode_line(message) {
            Ok(line) => {
                let _ = self.hub.send(HubCommand::Unicast(id, line));
            }
            Err(e) => log::error!("[SERVER] Failed to encode {}: {}", message.type_name(), e),
        }
    }

    /// Broadcast active elements for `cycle`.
    ///
    /// Returns false, sending nothing, when `cycle` is behind the last
    /// broadcast of the current generation.
    pub fn active(&self, elements: Vec<ActiveElement>, cycle: i64) -> bool {
        let generation = {
            let mut order = match self.order.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if order.last_cycle.is_some_and(|last| cycle < last) {
                log::debug!(
                    "[SERVER] Refusing active for cycle {} behind {:?}",
                    cycle,
                    order.last_cycle
                );
                return false;
            }
            order.last_cycle = Some(cycle);
            order.generation
        };
        self.send(&ServerMessage::Active {
            elements,
            cycle,
            generation: Some(generation),
        });
        true
    }

    /// Broadcast the current transport state.
    pub fn status(&self) {
        let snapshot = self.transport.snapshot();
        self.send(&ServerMessage::Status {
            playing: snapshot.playing,
            cycle: snapshot.cycle.floor() as i64,
            cps: snapshot.cps,
        });
    }

    /// Start a new evaluation generation; its cycles may restart at 0.
    pub fn begin_generation(&self) -> u64 {
        let mut order = match self.order.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        order.generation += 1;
        order.last_cycle = None;
        order.generation
    }

    pub fn generation(&self) -> u64 {
        match self.order.lock() {
            Ok(order) => order.generation,
            Err(poisoned) => poisoned.into_inner().generation,
        }
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("connections", &self.connections())
            .field("generation", &self.generation())
            .finish()
    }
}
