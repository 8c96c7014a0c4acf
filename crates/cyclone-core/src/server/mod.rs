//! Engine-side TCP server.
//!
//! Accepts any number of editor clients and speaks the line protocol from
//! [`crate::protocol`]:
//!
//! - `eval` is queued for the evaluator; failures come back as a unicast `error`
//! - `play` / `pause` / `stop` / `hush` drive the shared transport, then
//!   broadcast `status`
//! - `getSamples` / `getSounds` / `getBanks` are answered to the requester only
//!
//! Per connection there is a reader task and a writer task. A dead socket
//! takes down only its own tasks.

mod hub;

pub use hub::{Broadcaster, ConnId};

use crate::error::Result;
use crate::evaluator::Evaluator;
use crate::protocol::{ClientMessage, LineFramer, ServerMessage};
use crate::transport::SharedTransport;
use hub::{run_hub, HubCommand, Peer, OUTBOX_CAPACITY};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

/// State shared by every connection task.
struct Dispatch {
    evaluator: Arc<dyn Evaluator>,
    transport: SharedTransport,
    broadcaster: Broadcaster,
    jobs: mpsc::UnboundedSender<EvalJob>,
}

struct EvalJob {
    conn: ConnId,
    code: String,
    bufnr: Option<i64>,
    /// Transport hush generation when the job was queued.
    hush_generation: u64,
}

pub struct EngineServer {
    listener: TcpListener,
    dispatch: Arc<Dispatch>,
    hub_rx: mpsc::UnboundedReceiver<HubCommand>,
    hub_tx: mpsc::UnboundedSender<HubCommand>,
    jobs_rx: mpsc::UnboundedReceiver<EvalJob>,
    live: Arc<AtomicUsize>,
}

impl EngineServer {
    /// Bind the listener. Use port 0 for an ephemeral port.
    pub async fn bind(
        addr: &str,
        evaluator: Arc<dyn Evaluator>,
        transport: SharedTransport,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (hub_tx, hub_rx) = mpsc::unbounded_channel();
        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        let live = Arc::new(AtomicUsize::new(0));
        let broadcaster = Broadcaster::new(hub_tx.clone(), transport.clone(), live.clone());

        Ok(Self {
            listener,
            dispatch: Arc::new(Dispatch {
                evaluator,
                transport,
                broadcaster,
                jobs,
            }),
            hub_rx,
            hub_tx,
            jobs_rx,
            live,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn broadcaster(&self) -> Broadcaster {
        self.dispatch.broadcaster.clone()
    }

    /// Start serving on the current Tokio runtime.
    pub fn spawn(self) -> Result<ServerHandle> {
        let local_addr = self.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let broadcaster = self.dispatch.broadcaster.clone();

        tokio::spawn(run_hub(self.hub_rx, self.live, shutdown_rx.clone()));
        tokio::spawn(run_evaluations(
            self.jobs_rx,
            self.dispatch.clone(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(accept_loop(
            self.listener,
            self.dispatch,
            self.hub_tx,
            shutdown_rx,
        ));

        log::info!("[SERVER] listening on {}", local_addr);
        Ok(ServerHandle {
            local_addr,
            broadcaster,
            shutdown: shutdown_tx,
            stopped: AtomicBool::new(false),
        })
    }
}

/// Running server. Dropping it shuts the server down.
pub struct ServerHandle {
    local_addr: SocketAddr,
    broadcaster: Broadcaster,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn broadcaster(&self) -> Broadcaster {
        self.broadcaster.clone()
    }

    pub fn connections(&self) -> usize {
        self.broadcaster.connections()
    }

    /// Stop accepting and close every connection. Idempotent.
    pub fn shutdown(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            let _ = self.shutdown.send(true);
            log::info!("[SERVER] Shutting down {}", self.local_addr);
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    dispatch: Arc<Dispatch>,
    hub: mpsc::UnboundedSender<HubCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    let next_id = AtomicU64::new(1);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let id = next_id.fetch_add(1, Ordering::Relaxed);
                        log::debug!("[SERVER] Accepted client {} from {}", id, peer);
                        start_connection(id, stream, &dispatch, &hub, shutdown.clone());
                    }
                    Err(e) => log::warn!("[SERVER] Accept failed: {}", e),
                }
            }
        }
    }
}

fn start_connection(
    id: ConnId,
    stream: TcpStream,
    dispatch: &Arc<Dispatch>,
    hub: &mpsc::UnboundedSender<HubCommand>,
    shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
    let (close, closed) = watch::channel(());

    if hub.send(HubCommand::Register { id, peer: Peer { outbox, close } }).is_err() {
        return;
    }
    tokio::spawn(write_connection(id, writer, outbox_rx, closed.clone(), hub.clone()));
    tokio::spawn(read_connection(
        id,
        reader,
        dispatch.clone(),
        hub.clone(),
        closed,
        shutdown,
    ));
}

/// Writes queued lines until the hub lets go of the connection or a write
/// fails. A write stuck on a client that stopped reading is abandoned.
async fn write_connection(
    id: ConnId,
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::Receiver<String>,
    mut closed: watch::Receiver<()>,
    hub: mpsc::UnboundedSender<HubCommand>,
) {
    loop {
        let line = tokio::select! {
            _ = closed.changed() => break,
            line = outbox.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        tokio::select! {
            _ = closed.changed() => break,
            written = writer.write_all(line.as_bytes()) => {
                if let Err(e) = written {
                    log::debug!("[SERVER] Write to client {} failed: {}", id, e);
                    let _ = hub.send(HubCommand::Closed(id));
                    return;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_connection(
    id: ConnId,
    mut reader: OwnedReadHalf,
    dispatch: Arc<Dispatch>,
    hub: mpsc::UnboundedSender<HubCommand>,
    mut closed: watch::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = closed.changed() => break,
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        for message in framer.push_messages::<ClientMessage>(&buf[..n]) {
                            dispatch.handle(id, message);
                        }
                    }
                    Err(e) => {
                        log::debug!("[SERVER] Read from client {} failed: {}", id, e);
                        break;
                    }
                }
            }
        }
    }

    let _ = hub.send(HubCommand::Closed(id));
}

impl Dispatch {
    fn handle(&self, conn: ConnId, message: ClientMessage) {
        match message {
            ClientMessage::Eval { code, bufnr } => {
                let job = EvalJob {
                    conn,
                    code,
                    bufnr,
                    hush_generation: self.transport.hush_generation(),
                };
                if self.jobs.send(job).is_err() {
                    log::warn!("[SERVER] Evaluation worker stopped, dropping eval");
                }
            }
            ClientMessage::Play => self.control(|clock, now| clock.play(now)),
            ClientMessage::Pause => self.control(|clock, now| clock.pause(now)),
            ClientMessage::Stop => {
                // Cycles restart at 0, so active ordering starts over too.
                self.transport.with(|clock| clock.stop(Instant::now()));
                self.broadcaster.begin_generation();
                self.broadcaster.status();
            }
            ClientMessage::Hush => {
                self.transport.with(|clock| clock.hush(Instant::now()));
                self.broadcaster.begin_generation();
                self.evaluator.hush();
                log::info!("[SERVER] Hush");
                self.broadcaster.status();
            }
            ClientMessage::GetSamples => {
                let samples = self.evaluator.samples();
                self.broadcaster
                    .unicast(conn, &ServerMessage::Samples { samples });
            }
            ClientMessage::GetSounds => {
                let sounds = self.evaluator.sounds();
                self.broadcaster.unicast(conn, &ServerMessage::Sounds { sounds });
            }
            ClientMessage::GetBanks => {
                let banks = self.evaluator.banks();
                self.broadcaster.unicast(conn, &ServerMessage::Banks { banks });
            }
        }
    }

    fn control(&self, apply: impl FnOnce(&mut crate::transport::CycleClock, Instant)) {
        self.transport.with(|clock| apply(clock, Instant::now()));
        self.broadcaster.status();
    }
}

/// Runs queued evaluations one at a time off the async threads.
async fn run_evaluations(
    mut jobs: mpsc::UnboundedReceiver<EvalJob>,
    dispatch: Arc<Dispatch>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        if job.hush_generation != dispatch.transport.hush_generation() {
            log::debug!("[SERVER] Skipping eval from client {} queued before hush", job.conn);
            continue;
        }

        let evaluator = dispatch.evaluator.clone();
        let EvalJob {
            conn,
            code,
            bufnr,
            hush_generation,
        } = job;
        let outcome =
            tokio::task::spawn_blocking(move || evaluator.evaluate(&code, bufnr)).await;

        match outcome {
            Ok(Ok(())) => {
                if dispatch.transport.hush_generation() != hush_generation {
                    log::debug!("[SERVER] Eval from client {} preempted by hush", conn);
                    dispatch.evaluator.hush();
                } else {
                    dispatch.broadcaster.begin_generation();
                }
            }
            Ok(Err(err)) => {
                let (line, col) = err.position();
                log::debug!("[SERVER] Eval from client {} failed: {}", conn, err);
                dispatch.broadcaster.unicast(
                    conn,
                    &ServerMessage::Error {
                        message: err.message,
                        line,
                        col,
                    },
                );
            }
            Err(e) => {
                log::error!("[SERVER] Evaluator crashed: {}", e);
                dispatch.broadcaster.unicast(
                    conn,
                    &ServerMessage::Error {
                        message: "evaluator crashed".to_string(),
                        line: None,
                        col: None,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::EvalError;
    use crate::protocol::encode_line;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[derive(Default)]
    struct FakeEvaluator {
        evaluated: Mutex<Vec<String>>,
        hushes: AtomicUsize,
        delay: Duration,
    }

    impl Evaluator for FakeEvaluator {
        fn evaluate(&self, code: &str, _bufnr: Option<i64>) -> std::result::Result<(), EvalError> {
            std::thread::sleep(self.delay);
            self.evaluated.lock().unwrap().push(code.to_string());
            if code.contains("oops") {
                return Err(EvalError::new("unexpected token (2:5)"));
            }
            Ok(())
        }

        fn hush(&self) {
            self.hushes.fetch_add(1, Ordering::SeqCst);
        }

        fn samples(&self) -> Vec<String> {
            vec!["bd".to_string(), "sd".to_string()]
        }

        fn sounds(&self) -> Vec<String> {
            vec!["sawtooth".to_string()]
        }

        fn banks(&self) -> Vec<String> {
            vec!["RolandTR909".to_string()]
        }
    }

    struct Client {
        lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (reader, writer) = stream.into_split();
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
            }
        }

        async fn send_raw(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
        }

        async fn send(&mut self, message: &ClientMessage) {
            let line = encode_line(message).unwrap();
            self.send_raw(&line).await;
        }

        async fn next(&mut self) -> ServerMessage {
            let line = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
                .await
                .expect("timed out waiting for a message")
                .unwrap()
                .expect("connection closed");
            serde_json::from_str(&line).unwrap()
        }

        async fn nothing_within(&mut self, wait: Duration) -> bool {
            tokio::time::timeout(wait, self.lines.next_line())
                .await
                .is_err()
        }
    }

    async fn start(evaluator: Arc<FakeEvaluator>) -> (ServerHandle, SharedTransport) {
        let transport = SharedTransport::new();
        let server = EngineServer::bind("127.0.0.1:0", evaluator, transport.clone())
            .await
            .unwrap();
        (server.spawn().unwrap(), transport)
    }

    async fn wait_for_connections(handle: &ServerHandle, n: usize) {
        for _ in 0..100 {
            if handle.connections() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} connections, have {}", n, handle.connections());
    }

    #[tokio::test]
    async fn test_query_and_hush_in_one_read() {
        let (handle, transport) = start(Arc::new(FakeEvaluator::default())).await;
        let mut a = Client::connect(handle.local_addr()).await;
        let mut b = Client::connect(handle.local_addr()).await;
        wait_for_connections(&handle, 2).await;
        transport.with(|c| c.play(Instant::now()));

        a.send_raw("{\"type\":\"getSamples\"}\n{\"type\":\"hush\"}\n").await;

        assert_eq!(
            a.next().await,
            ServerMessage::Samples {
                samples: vec!["bd".to_string(), "sd".to_string()]
            }
        );
        match a.next().await {
            ServerMessage::Status { playing, cycle, .. } => {
                assert!(!playing);
                assert_eq!(cycle, 0);
            }
            other => panic!("expected status, got {:?}", other),
        }

        // The other client sees the transport change but not the inventory.
        assert!(matches!(b.next().await, ServerMessage::Status { playing: false, .. }));
        assert!(b.nothing_within(Duration::from_millis(100)).await);
        assert!(!transport.is_playing());
    }

    #[tokio::test]
    async fn test_controls_broadcast_status() {
        let (handle, transport) = start(Arc::new(FakeEvaluator::default())).await;
        let mut a = Client::connect(handle.local_addr()).await;
        let mut b = Client::connect(handle.local_addr()).await;
        wait_for_connections(&handle, 2).await;

        a.send(&ClientMessage::Play).await;
        for client in [&mut a, &mut b] {
            assert!(matches!(client.next().await, ServerMessage::Status { playing: true, .. }));
        }
        assert!(transport.is_playing());

        b.send(&ClientMessage::Pause).await;
        for client in [&mut a, &mut b] {
            assert!(matches!(client.next().await, ServerMessage::Status { playing: false, .. }));
        }
    }

    #[tokio::test]
    async fn test_active_resumes_at_cycle_zero_after_stop_and_hush() {
        let (handle, _transport) = start(Arc::new(FakeEvaluator::default())).await;
        let mut a = Client::connect(handle.local_addr()).await;
        wait_for_connections(&handle, 1).await;
        let broadcaster = handle.broadcaster();

        a.send(&ClientMessage::Play).await;
        assert!(matches!(a.next().await, ServerMessage::Status { playing: true, .. }));
        assert!(broadcaster.active(vec![], 42));
        assert!(matches!(a.next().await, ServerMessage::Active { cycle: 42, .. }));

        for rewind in [ClientMessage::Stop, ClientMessage::Hush] {
            a.send(&rewind).await;
            assert!(matches!(a.next().await, ServerMessage::Status { playing: false, cycle: 0, .. }));
            a.send(&ClientMessage::Play).await;
            assert!(matches!(a.next().await, ServerMessage::Status { playing: true, .. }));

            let before = broadcaster.generation();
            assert!(broadcaster.active(vec![], 0), "refused after {:?}", rewind);
            match a.next().await {
                ServerMessage::Active { cycle, generation, .. } => {
                    assert_eq!(cycle, 0);
                    assert_eq!(generation, Some(before));
                }
                other => panic!("expected active, got {:?}", other),
            }
        }
        assert_eq!(broadcaster.generation(), 2);
    }

    #[tokio::test]
    async fn test_eval_error_is_unicast_with_position() {
        let evaluator = Arc::new(FakeEvaluator::default());
        let (handle, _transport) = start(evaluator.clone()).await;
        let mut a = Client::connect(handle.local_addr()).await;
        let mut b = Client::connect(handle.local_addr()).await;
        wait_for_connections(&handle, 2).await;

        a.send(&ClientMessage::eval("s(\"bd\").oops(")).await;
        assert_eq!(
            a.next().await,
            ServerMessage::Error {
                message: "unexpected token (2:5)".to_string(),
                line: Some(2),
                col: Some(5),
            }
        );
        assert!(b.nothing_within(Duration::from_millis(100)).await);

        // The connection stays usable.
        a.send(&ClientMessage::GetBanks).await;
        assert!(matches!(a.next().await, ServerMessage::Banks { .. }));
    }

    #[tokio::test]
    async fn test_eval_split_across_chunks() {
        let evaluator = Arc::new(FakeEvaluator::default());
        let (handle, _transport) = start(evaluator.clone()).await;
        let mut a = Client::connect(handle.local_addr()).await;

        let line = encode_line(&ClientMessage::eval("s(\"bd sd\")")).unwrap();
        let (first, rest) = line.split_at(7);
        let (second, third) = rest.split_at(9);
        for chunk in [first, second, third] {
            a.send_raw(chunk).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        a.send(&ClientMessage::GetSounds).await;
        assert!(matches!(a.next().await, ServerMessage::Sounds { .. }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            evaluator.evaluated.lock().unwrap().as_slice(),
            &["s(\"bd sd\")".to_string()]
        );
    }

    #[tokio::test]
    async fn test_malformed_line_keeps_connection() {
        let (handle, _transport) = start(Arc::new(FakeEvaluator::default())).await;
        let mut a = Client::connect(handle.local_addr()).await;

        a.send_raw("not json\n{\"type\":\"nope\"}\n{\"type\":\"getBanks\"}\n").await;
        assert_eq!(
            a.next().await,
            ServerMessage::Banks {
                banks: vec!["RolandTR909".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn test_hush_preempts_queued_and_running_evals() {
        let evaluator = Arc::new(FakeEvaluator {
            delay: Duration::from_millis(150),
            ..Default::default()
        });
        let (handle, _transport) = start(evaluator.clone()).await;
        let mut a = Client::connect(handle.local_addr()).await;

        a.send(&ClientMessage::eval("first")).await;
        a.send(&ClientMessage::eval("second")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.send(&ClientMessage::Hush).await;
        assert!(matches!(a.next().await, ServerMessage::Status { .. }));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(
            evaluator.evaluated.lock().unwrap().as_slice(),
            &["first".to_string()]
        );
        // One hush from the control, one after the preempted eval finished.
        assert_eq!(evaluator.hushes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disconnect_removes_only_that_client() {
        let (handle, _transport) = start(Arc::new(FakeEvaluator::default())).await;
        let a = Client::connect(handle.local_addr()).await;
        let mut b = Client::connect(handle.local_addr()).await;
        wait_for_connections(&handle, 2).await;

        drop(a);
        wait_for_connections(&handle, 1).await;

        handle.broadcaster().status();
        assert!(matches!(b.next().await, ServerMessage::Status { .. }));
    }

    #[tokio::test]
    async fn test_client_that_stops_reading_is_dropped() {
        let (handle, _transport) = start(Arc::new(FakeEvaluator::default())).await;
        let mut stalled = TcpStream::connect(handle.local_addr()).await.unwrap();
        wait_for_connections(&handle, 1).await;

        let broadcaster = handle.broadcaster();
        let bulky = ServerMessage::Samples {
            samples: vec!["x".repeat(64 * 1024)],
        };
        for round in 0..4096 {
            if handle.connections() == 0 {
                break;
            }
            broadcaster.send(&bulky);
            if round % 16 == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        wait_for_connections(&handle, 0).await;

        // The server closed the socket; draining it reaches EOF.
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(5), stalled.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            if n == 0 {
                break;
            }
        }

        let mut fresh = Client::connect(handle.local_addr()).await;
        wait_for_connections(&handle, 1).await;
        broadcaster.status();
        assert!(matches!(fresh.next().await, ServerMessage::Status { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_closes_clients() {
        let (handle, _transport) = start(Arc::new(FakeEvaluator::default())).await;
        let mut a = Client::connect(handle.local_addr()).await;
        wait_for_connections(&handle, 1).await;

        handle.shutdown();
        handle.shutdown();

        let closed = tokio::time::timeout(Duration::from_secs(2), a.lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert!(closed.is_none());
    }
}
