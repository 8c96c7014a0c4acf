//! Cyclone Core - engine discovery, connection and event relay for the
//! Cyclone live-coding engine.
//!
//! This crate provides the plumbing between editor tooling and a separately
//! running engine process:
//!
//! - **State store** - atomic per-user record naming the running engine
//! - **Watcher** - debounced notification when that record changes
//! - **Link** - reconnecting client connection with typed queries
//! - **Server** - engine-side listener, dispatch and broadcast fan-out
//! - **Relay** - deadline-accurate forwarding of events to an OSC synth
//! - **Supervisor** - launching, probing and stopping the engine process
//!
//! # Architecture
//!
//! The engine process owns an [`EngineServer`] and an [`EventRelay`], both
//! driven by one [`SharedTransport`]. The [`EngineSupervisor`] publishes the
//! engine's endpoint to the [`StateStore`] once the engine is listening;
//! editor tooling follows the store with [`watch_state`] and keeps an
//! [`EngineLink`] connected across restarts.

pub mod config;
pub mod debounce;
pub mod error;
pub mod evaluator;
pub mod link;
pub mod osc;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod state_store;
pub mod supervisor;
pub mod sys;
pub mod transport;
pub mod watcher;

pub use config::Config;
pub use error::{Error, Result};
pub use evaluator::{EvalError, Evaluator};
pub use link::{EngineLink, LinkConfig, LinkEvent, LinkState};
pub use osc::OscTarget;
pub use protocol::{ActiveElement, ClientMessage, Control, QueryKind, ServerMessage, SourceSpan};
pub use relay::{EventRelay, RelayConfig, RelayOutcome, TimedEvent};
pub use server::{Broadcaster, EngineServer, ServerHandle};
pub use state_store::{EngineState, StateStore};
pub use supervisor::{EngineSupervisor, SupervisorConfig};
pub use transport::{CycleClock, SharedTransport, TransportSnapshot};
pub use watcher::{watch_state, WatchHandle, WatchMode, WatcherConfig};
