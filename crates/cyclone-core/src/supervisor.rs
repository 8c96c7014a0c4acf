//! Engine process management.
//!
//! The supervisor launches the engine detached from the caller, watches its
//! output for the readiness line, publishes the engine's endpoint to the
//! [`StateStore`] once it is listening, and stops it on request.
//!
//! # Example
//!
//! ```ignore
//! let supervisor = EngineSupervisor::new(config.supervisor_config()?, StateStore::new()?);
//! supervisor.start(|port| log::info!("engine up on {}", port))?;
//! supervisor.wait_ready(Duration::from_secs(10))?;
//! ```

use crate::error::{Error, Result};
use crate::state_store::{EngineState, StateStore};
use crate::sys;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::io::{BufRead, BufReader, Read};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub host: String,
    /// Port recorded when the readiness line names none
    pub port: u16,
    /// Version written to the state record
    pub version: String,
    /// Substring of the stdout line that signals readiness
    pub ready_marker: String,
    pub probe_timeout: Duration,
}

type ReadyCallback = Box<dyn FnOnce(u16) + Send + 'static>;

/// Readiness bookkeeping for one launched process.
struct Run {
    pid: u32,
    started: AtomicBool,
    callback: Mutex<Option<ReadyCallback>>,
    ready: Sender<u16>,
}

pub struct EngineSupervisor {
    config: SupervisorConfig,
    store: StateStore,
    /// Pid of the process this supervisor launched, while it lives.
    handle: Arc<Mutex<Option<u32>>>,
    ready: Mutex<Option<Receiver<u16>>>,
    /// Probe target, resolved once so probes never wait on name lookup.
    probe_addr: Option<SocketAddr>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl EngineSupervisor {
    pub fn new(config: SupervisorConfig, store: StateStore) -> Self {
        let probe_addr = resolve(&config.host, config.port);
        if probe_addr.is_none() {
            log::warn!(
                "[SUPERVISOR] Cannot resolve {}:{}, probes will fail",
                config.host,
                config.port
            );
        }
        Self {
            config,
            store,
            handle: Arc::new(Mutex::new(None)),
            ready: Mutex::new(None),
            probe_addr,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Pid of the engine launched by this supervisor, if it is still running.
    pub fn pid(&self) -> Option<u32> {
        *lock(&self.handle)
    }

    /// Launch the engine. `on_ready` runs once, on an output thread, with
    /// the port the engine reported.
    pub fn start<F>(&self, on_ready: F) -> Result<u32>
    where
        F: FnOnce(u16) + Send + 'static,
    {
        if let Some(pid) = self.pid() {
            return Err(Error::AlreadyRunning(pid));
        }

        log::info!(
            "[SUPERVISOR] Starting {} {}",
            self.config.program.display(),
            self.config.args.join(" ")
        );

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .env("CYCLONE_PORT", self.config.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group: terminal signals to the caller do not reach it.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            program: self.config.program.clone(),
            source,
        })?;
        let pid = child.id();
        *lock(&self.handle) = Some(pid);

        let (ready_tx, ready_rx) = bounded(1);
        *lock(&self.ready) = Some(ready_rx);
        let run = Arc::new(Run {
            pid,
            started: AtomicBool::new(false),
            callback: Mutex::new(Some(Box::new(on_ready))),
            ready: ready_tx,
        });

        if let Some(stdout) = child.stdout.take() {
            let run = run.clone();
            let store = self.store.clone();
            let config = self.config.clone();
            let handle = self.handle.clone();
            std::thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(std::result::Result::ok) {
                    log::debug!("[engine] {}", line);
                    if line.contains(&config.ready_marker) {
                        announce_ready(&run, &line, &config, &store, &handle);
                    }
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            std::thread::spawn(move || forward_output(stderr));
        }

        let handle = self.handle.clone();
        std::thread::spawn(move || {
            match child.wait() {
                Ok(status) if status.success() => {
                    log::info!("[SUPERVISOR] Engine {} exited", pid);
                }
                Ok(status) => {
                    log::warn!("[SUPERVISOR] Engine {} exited with {}", pid, status);
                }
                Err(e) => log::warn!("[SUPERVISOR] Lost track of engine {}: {}", pid, e),
            }
            let mut current = lock(&handle);
            if *current == Some(pid) {
                *current = None;
            }
        });

        log::info!("[SUPERVISOR] Engine started with pid {}", pid);
        Ok(pid)
    }

    /// Block until the current engine reports readiness, returning its port.
    pub fn wait_ready(&self, timeout: Duration) -> Result<u16> {
        let receiver = lock(&self.ready).clone().ok_or(Error::NotRunning)?;
        match receiver.recv_timeout(timeout) {
            Ok(port) => Ok(port),
            Err(RecvTimeoutError::Timeout) => Err(Error::ConnectTimeout(self.endpoint())),
            Err(RecvTimeoutError::Disconnected) => Err(Error::NotRunning),
        }
    }

    /// Ask the engine to terminate, forget it, and clear the state record.
    /// Does not wait for the exit. Calling it again is a no-op.
    pub fn stop(&self) -> Result<()> {
        *lock(&self.ready) = None;
        let mut current = lock(&self.handle);
        let Some(pid) = current.take() else {
            return Ok(());
        };

        log::info!("[SUPERVISOR] Stopping engine {}", pid);
        if let Err(e) = sys::terminate(pid) {
            log::warn!("[SUPERVISOR] Failed to signal engine {}: {}", pid, e);
        }
        self.store.clear()
    }

    /// Stop the engine named by the state record, whoever launched it.
    /// Returns the pid signalled, if any.
    pub fn stop_recorded(&self) -> Result<Option<u32>> {
        if self.pid().is_some() {
            let pid = self.pid();
            self.stop()?;
            return Ok(pid);
        }
        let Some(record) = self.store.read() else {
            self.store.clear()?;
            return Ok(None);
        };
        log::info!("[SUPERVISOR] Stopping recorded engine {}", record.pid);
        sys::terminate(record.pid)?;
        self.store.clear()?;
        Ok(Some(record.pid))
    }

    /// True if this supervisor's engine is alive, or if anything accepts
    /// connections at the configured endpoint.
    pub fn is_running(&self) -> bool {
        if self.pid().is_some() {
            return true;
        }
        self.probe()
    }

    /// TCP connect to the configured endpoint, bounded by the probe timeout.
    pub fn probe(&self) -> bool {
        let Some(addr) = self.probe_addr else {
            return false;
        };
        TcpStream::connect_timeout(&addr, self.config.probe_timeout).is_ok()
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }
}

fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, port));
    }
    (host, port).to_socket_addrs().ok()?.next()
}

impl std::fmt::Debug for EngineSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSupervisor")
            .field("program", &self.config.program)
            .field("pid", &self.pid())
            .finish()
    }
}

fn announce_ready(
    run: &Run,
    line: &str,
    config: &SupervisorConfig,
    store: &StateStore,
    handle: &Mutex<Option<u32>>,
) {
    if run.started.swap(true, Ordering::AcqRel) {
        return;
    }
    let port = parse_ready_port(line, &config.ready_marker).unwrap_or(config.port);

    {
        // Held across the write so a concurrent stop clears after us, not before.
        let current = lock(handle);
        if *current != Some(run.pid) {
            log::debug!("[SUPERVISOR] Engine {} ready after stop, not recording", run.pid);
            return;
        }
        log::info!("[SUPERVISOR] Engine {} listening on port {}", run.pid, port);
        if let Err(e) = store.write(&EngineState::new(run.pid, port, config.version.clone())) {
            log::warn!("[SUPERVISOR] Failed to record engine state: {}", e);
        }
    }
    let _ = run.ready.try_send(port);
    if let Some(callback) = lock(&run.callback).take() {
        callback(port);
    }
}

fn forward_output<R: Read>(stream: R) {
    for line in BufReader::new(stream).lines().map_while(std::result::Result::ok) {
        log::debug!("[engine] {}", line);
    }
}

/// Port named after the marker, as in `listening on 127.0.0.1:9000` or
/// `listening on port 9000`.
pub fn parse_ready_port(line: &str, marker: &str) -> Option<u16> {
    let idx = line.find(marker)?;
    let rest = line[idx + marker.len()..].trim().trim_end_matches('/');
    let last = rest.rsplit([':', ' ']).next()?;
    last.parse::<u16>().ok().filter(|port| *port > 0)
}
