//! Cyclone CLI - The `cyclone` command.
//!
//! Finds, starts, stops and talks to the Cyclone engine.
//!
//! # Architecture
//!
//! Every command works through `cyclone-core`:
//!
//! - **StateStore**: the per-user record naming the running engine
//! - **EngineSupervisor**: `start`, `stop` and the liveness probe in `status`
//! - **EngineLink**: `watch`, `eval`, `control` and `query`

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cyclone_core::{
    ClientMessage, Config, Control, EngineLink, EngineSupervisor, LinkEvent, LinkState,
    QueryKind, ServerMessage, StateStore,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Cyclone - live coding engine control
#[derive(Parser, Debug)]
#[command(name = "cyclone")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Discover, start and drive the Cyclone engine", long_about = None)]
struct Args {
    /// Configuration file (defaults to the per-user config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Engine state file (defaults to the per-user cache directory)
    #[arg(long, global = true, value_name = "FILE")]
    state_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the engine record and whether the engine is reachable
    Status,

    /// Launch the engine and keep it running until Ctrl-C
    Start {
        /// Seconds to wait for the engine to report it is listening
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Stop the engine named by the state record
    Stop,

    /// Follow the engine across restarts and print everything it sends
    Watch,

    /// Evaluate a file on the engine
    Eval {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Milliseconds to wait for an error report
        #[arg(long, default_value_t = 500)]
        wait: u64,
    },

    /// Send a transport control (play, pause, stop, hush)
    Control {
        #[arg(value_name = "ACTION")]
        action: Control,
    },

    /// Print an inventory (samples, sounds, banks)
    Query {
        #[arg(value_name = "KIND")]
        kind: QueryKind,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logger();

    let config = load_config(args.config.as_deref())?;
    let store = match &args.state_file {
        Some(path) => StateStore::at(path),
        None => StateStore::new().context("Failed to locate the engine state file")?,
    };

    match args.command {
        Commands::Status => status(&config, store),
        Commands::Start { timeout } => start(&config, store, Duration::from_secs(timeout)),
        Commands::Stop => stop(&config, store),
        Commands::Watch => block_on(watch(&config, store)),
        Commands::Eval { file, wait } => {
            block_on(eval(&config, store, &file, Duration::from_millis(wait)))
        }
        Commands::Control { action } => block_on(control(&config, store, action)),
        Commands::Query { kind } => block_on(query(&config, store, kind)),
    }
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(Config::load_or_default()),
    }
}

fn block_on<F: std::future::Future<Output = Result<()>>>(future: F) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(future)
}

fn status(config: &Config, store: StateStore) -> Result<()> {
    println!("State file: {}", store.path().display());
    match store.read_record() {
        Some(record) => {
            println!("  pid:       {}", record.pid);
            println!("  port:      {}", record.port);
            println!("  version:   {}", record.version);
            println!("  timestamp: {}", record.timestamp);
            println!("  valid:     {}", record.is_valid());
        }
        None => println!("  no engine recorded"),
    }

    let supervisor = EngineSupervisor::new(config.supervisor_config()?, store);
    println!(
        "Endpoint {}:{} reachable: {}",
        config.engine.host,
        config.engine.port,
        supervisor.probe()
    );
    Ok(())
}

fn start(config: &Config, store: StateStore, timeout: Duration) -> Result<()> {
    let supervisor = EngineSupervisor::new(config.supervisor_config()?, store);
    supervisor
        .start(|port| log::info!("Engine listening on port {}", port))
        .context("Failed to start engine")?;

    let port = match supervisor.wait_ready(timeout) {
        Ok(port) => port,
        Err(e) => {
            supervisor.stop()?;
            return Err(e).context("Engine did not become ready");
        }
    };
    println!("Engine running on port {} (Ctrl-C to stop)", port);

    block_on(async {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")
    })?;

    log::info!("Interrupted, stopping engine");
    supervisor.stop()?;
    Ok(())
}

fn stop(config: &Config, store: StateStore) -> Result<()> {
    let supervisor = EngineSupervisor::new(config.supervisor_config()?, store);
    match supervisor.stop_recorded()? {
        Some(pid) => println!("Stopped engine {}", pid),
        None => println!("No engine running"),
    }
    Ok(())
}

/// A link that is connected, or an error saying why not.
async fn connected_link(config: &Config, store: StateStore) -> Result<EngineLink> {
    let link_config = config.link_config();
    let wait = link_config.connect_timeout * 2;
    let link = EngineLink::spawn(store, link_config);
    link.connect().context("No engine running")?;
    if !link.wait_for(LinkState::Connected, wait).await {
        link.dispose();
        bail!("Could not connect to the engine");
    }
    Ok(link)
}

async fn watch(config: &Config, store: StateStore) -> Result<()> {
    let link = EngineLink::spawn(store, config.link_config());
    let mut events = link.subscribe();
    let follower = link
        .follow(config.watcher_config())
        .context("Failed to watch the engine state file")?;
    if link.connect().is_err() {
        log::info!("No engine running yet, waiting for one");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(LinkEvent::State(state)) => println!("state: {:?}", state),
                Ok(LinkEvent::Message(message)) => print_message(&message),
                Err(RecvError::Lagged(n)) => log::warn!("Skipped {} events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    follower.stop();
    link.dispose();
    Ok(())
}

async fn eval(config: &Config, store: StateStore, file: &Path, wait: Duration) -> Result<()> {
    let code =
        fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let link = connected_link(config, store).await?;
    let mut events = link.subscribe();
    link.send(ClientMessage::eval(code))?;

    let outcome = tokio::time::timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(LinkEvent::Message(ServerMessage::Error { message, line, col })) => {
                    return Some((message, line, col));
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await;
    link.dispose();

    match outcome {
        Ok(Some((message, line, col))) => {
            let position = match (line, col) {
                (Some(line), Some(col)) => format!(" at {}:{}", line, col),
                (Some(line), None) => format!(" at line {}", line),
                _ => String::new(),
            };
            bail!("{}{}: {}", file.display(), position, message)
        }
        _ => {
            println!("Evaluated {}", file.display());
            Ok(())
        }
    }
}

async fn control(config: &Config, store: StateStore, action: Control) -> Result<()> {
    let link = connected_link(config, store).await?;
    let mut events = link.subscribe();
    link.send(ClientMessage::control(action))?;

    let status = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match events.recv().await {
                Ok(LinkEvent::Message(message @ ServerMessage::Status { .. })) => {
                    return Some(message)
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await;
    link.dispose();

    match status {
        Ok(Some(message)) => print_message(&message),
        _ => println!("Sent {}", action.as_str()),
    }
    Ok(())
}

async fn query(config: &Config, store: StateStore, kind: QueryKind) -> Result<()> {
    let link = connected_link(config, store).await?;
    let reply = tokio::time::timeout(Duration::from_secs(5), link.query(kind))
        .await
        .context("Timed out waiting for the engine")??;
    link.dispose();

    let names = match reply {
        ServerMessage::Samples { samples } => samples,
        ServerMessage::Sounds { sounds } => sounds,
        ServerMessage::Banks { banks } => banks,
        other => bail!("Unexpected reply: {}", other.type_name()),
    };
    for name in names {
        println!("{}", name);
    }
    Ok(())
}

fn print_message(message: &ServerMessage) {
    match message {
        ServerMessage::Status { playing, cycle, cps } => {
            println!(
                "status: {} at cycle {} ({} cps)",
                if *playing { "playing" } else { "stopped" },
                cycle,
                cps
            );
        }
        ServerMessage::Active { elements, cycle, .. } => {
            println!("active: {} elements at cycle {}", elements.len(), cycle);
        }
        ServerMessage::Error { message, line, col } => {
            println!("error: {} (line {:?}, col {:?})", message, line, col);
        }
        other => {
            let count = match other {
                ServerMessage::Samples { samples } => samples.len(),
                ServerMessage::Sounds { sounds } => sounds.len(),
                ServerMessage::Banks { banks } => banks.len(),
                _ => 0,
            };
            println!("{}: {} entries", other.type_name(), count);
        }
    }
}
