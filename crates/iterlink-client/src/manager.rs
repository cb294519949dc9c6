//! Connection manager actor.
//!
//! One spawned task owns the transport, the state machine, the router and the
//! reconnect backoff. The [`ConnectionManager`] handle talks to it over an
//! unbounded command channel, so every handler runs to completion before the
//! next message, frame or timer is looked at.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use iterlink_core::retry::BackoffConfig;
use iterlink_core::InstanceId;
use iterlink_settings::SyncSettings;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backoff::{BackoffStep, ReconnectBackoff};
use crate::cache::EventCache;
use crate::errors::TransportError;
use crate::protocol::{Inbound, Outbound};
use crate::router::{Effect, Router};
use crate::state::{ConnectionState, Transition};
use crate::transport::{Connector, TransportChannels, TransportFrame};

const APP_CHANNEL_CAPACITY: usize = 256;

/// Timing knobs for the manager.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Reconnect schedule.
    pub backoff: BackoffConfig,
    /// Ping period while connected.
    pub heartbeat_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl From<&SyncSettings> for ManagerConfig {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            backoff: settings.reconnect.clone(),
            heartbeat_interval: Duration::from_millis(settings.server.heartbeat_interval_ms),
        }
    }
}

enum Command {
    Connect,
    Disconnect,
    Reconnect,
    Send(Outbound),
    SetActive(InstanceId),
    Reset,
    Stop(oneshot::Sender<()>),
}

/// Handle to the connection actor.
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    attempts: Arc<AtomicU32>,
    app: broadcast::Sender<Value>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Spawn the actor. It starts `Disconnected`; call [`connect`](Self::connect).
    pub fn start(
        connector: Arc<dyn Connector>,
        router: Router,
        cache: Arc<dyn EventCache>,
        config: ManagerConfig,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (app, _) = broadcast::channel(APP_CHANNEL_CAPACITY);
        let attempts = Arc::new(AtomicU32::new(0));

        let period = config.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let actor = Actor {
            connector,
            router,
            cache,
            backoff: ReconnectBackoff::new(config.backoff),
            heartbeat,
            state: ConnectionState::Disconnected,
            state_tx,
            attempts: attempts.clone(),
            app: app.clone(),
            opening: None,
            link: None,
            retry_at: None,
        };
        let task = tokio::spawn(actor.run(rx));

        Self {
            commands,
            state,
            attempts,
            app,
            task: Mutex::new(Some(task)),
        }
    }

    fn command(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            debug!("connection actor stopped, command ignored");
        }
    }

    /// Open a transport unless one is open or opening.
    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Close the transport and stay down until `connect`/`reconnect`.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Reset backoff, cancel any pending retry and connect now.
    pub fn reconnect(&self) {
        self.command(Command::Reconnect);
    }

    /// Write a message if connected; dropped otherwise.
    pub fn send(&self, msg: Outbound) {
        self.command(Command::Send(msg));
    }

    /// Change the foreground instance.
    pub fn set_active_instance(&self, instance: InstanceId) {
        self.command(Command::SetActive(instance));
    }

    /// Drop in-memory sync state and backoff.
    pub fn reset(&self) {
        self.command(Command::Reset);
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Consecutive failed attempts.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Chat and mutation messages forwarded untouched.
    pub fn app_messages(&self) -> broadcast::Receiver<Value> {
        self.app.subscribe()
    }

    /// Disconnect and join the actor.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Stop(tx));
        let _ = rx.await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "connection actor panicked");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Actor
// ─────────────────────────────────────────────────────────────────────────────

enum Wake {
    Command(Option<Command>),
    Opened(Result<TransportChannels, TransportError>),
    Frame(Option<TransportFrame>),
    RetryDue,
    Heartbeat,
}

struct Actor {
    connector: Arc<dyn Connector>,
    router: Router,
    cache: Arc<dyn EventCache>,
    backoff: ReconnectBackoff,
    heartbeat: Interval,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    attempts: Arc<AtomicU32>,
    app: broadcast::Sender<Value>,
    opening: Option<JoinHandle<Result<TransportChannels, TransportError>>>,
    link: Option<TransportChannels>,
    retry_at: Option<Instant>,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let connected = self.state == ConnectionState::Connected;
            let wake = tokio::select! {
                cmd = commands.recv() => Wake::Command(cmd),
                res = wait_open(&mut self.opening), if self.opening.is_some() => Wake::Opened(res),
                frame = recv_frame(&mut self.link), if self.link.is_some() => Wake::Frame(frame),
                () = sleep_until(self.retry_at), if self.retry_at.is_some() => Wake::RetryDue,
                _ = self.heartbeat.tick(), if connected => Wake::Heartbeat,
            };

            match wake {
                Wake::Command(None) => break,
                Wake::Command(Some(Command::Stop(done))) => {
                    self.teardown();
                    let _ = done.send(());
                    break;
                }
                Wake::Command(Some(cmd)) => self.on_command(cmd),
                Wake::Opened(res) => {
                    self.opening = None;
                    self.on_opened(res);
                }
                Wake::Frame(Some(TransportFrame::Text(text))) => self.on_text(&text),
                Wake::Frame(Some(TransportFrame::Closed { reason })) => self.on_lost(reason),
                Wake::Frame(None) => self.on_lost(None),
                Wake::RetryDue => {
                    self.retry_at = None;
                    debug!(attempt = self.backoff.attempts(), "retry due");
                    self.begin_connect();
                }
                Wake::Heartbeat => self.write(&Outbound::Ping),
            }
        }
        debug!("connection actor stopped");
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => match self.state {
                ConnectionState::Disconnected if self.retry_at.is_some() => {
                    debug!("reconnect already scheduled");
                }
                ConnectionState::Disconnected => self.begin_connect(),
                state => debug!(?state, "connect ignored"),
            },
            Command::Disconnect => {
                info!("disconnect requested");
                self.teardown();
            }
            Command::Reconnect => {
                info!("reconnect requested");
                self.teardown();
                self.reset_backoff();
                self.begin_connect();
            }
            Command::Send(msg) => self.write(&msg),
            Command::SetActive(instance) => self.router.set_active_instance(instance),
            Command::Reset => {
                self.router.reset();
                self.reset_backoff();
            }
            Command::Stop(_) => {}
        }
    }

    // ── State transitions ───────────────────────────────────────────

    fn transition(&mut self, event: Transition) -> bool {
        match self.state.apply(event) {
            Ok(next) => {
                self.state = next;
                let _ = self.state_tx.send_replace(next);
                self.cache.set_connection_status(next.as_status());
                true
            }
            Err(e) => {
                warn!(error = %e, "connection state transition rejected");
                false
            }
        }
    }

    fn begin_connect(&mut self) {
        if !self.transition(Transition::Connect) {
            return;
        }
        let connector = self.connector.clone();
        self.opening = Some(tokio::spawn(async move { connector.open().await }));
    }

    fn on_opened(&mut self, res: Result<TransportChannels, TransportError>) {
        match res {
            Ok(link) => {
                if !self.transition(Transition::Opened) {
                    return;
                }
                info!(after_attempts = self.backoff.attempts(), "connected");
                self.link = Some(link);
                self.reset_backoff();
                self.heartbeat.reset();
                for msg in self.router.on_open() {
                    self.write(&msg);
                }
            }
            Err(e) => {
                warn!(error = %e, attempt = self.backoff.attempts() + 1, "connect failed");
                let _ = self.transition(Transition::Closed);
                self.schedule_retry();
            }
        }
    }

    /// Transport dropped without being asked to.
    fn on_lost(&mut self, reason: Option<String>) {
        info!(reason = ?reason, "connection closed");
        self.link = None;
        self.router.on_close();
        let _ = self.transition(Transition::Closed);
        self.schedule_retry();
    }

    /// Requested shutdown: no retry is scheduled.
    fn teardown(&mut self) {
        self.retry_at = None;
        if let Some(opening) = self.opening.take() {
            opening.abort();
        }
        if self.link.take().is_some() {
            self.router.on_close();
        }
        if self.state != ConnectionState::Disconnected {
            let _ = self.transition(Transition::Closed);
        }
    }

    fn reset_backoff(&mut self) {
        self.backoff.reset();
        self.attempts.store(0, Ordering::Relaxed);
    }

    fn schedule_retry(&mut self) {
        let step = self.backoff.on_failure(rand::random::<f64>());
        self.attempts.store(self.backoff.attempts(), Ordering::Relaxed);
        match step {
            BackoffStep::Retry { attempt, delay } => {
                metrics::counter!("iterlink_reconnects_total").increment(1);
                info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                self.retry_at = Some(Instant::now() + delay);
            }
            BackoffStep::Exhausted { attempts } => {
                error!(attempts, "connection permanently failed");
                self.cache.connection_failed(attempts);
            }
            BackoffStep::Silent => debug!("attempts exhausted, not retrying"),
        }
    }

    // ── I/O ─────────────────────────────────────────────────────────

    fn write(&mut self, msg: &Outbound) {
        let Some(link) = self.link.as_ref().filter(|_| self.state == ConnectionState::Connected) else {
            debug!(kind = msg.kind(), "not connected, dropping outbound message");
            return;
        };
        if let Err(e) = link.outbound.try_send(msg.to_text()) {
            warn!(kind = msg.kind(), error = %e, "outbound write failed");
        }
    }

    fn on_text(&mut self, text: &str) {
        let Some(msg) = Inbound::parse(text) else {
            debug!(len = text.len(), "malformed message, dropping");
            return;
        };
        for effect in self.router.route(msg) {
            match effect {
                Effect::Send(out) => self.write(&out),
                Effect::Forward(value) => {
                    // No subscribers is fine.
                    let _ = self.app.send(value);
                }
            }
        }
    }
}

async fn wait_open(
    opening: &mut Option<JoinHandle<Result<TransportChannels, TransportError>>>,
) -> Result<TransportChannels, TransportError> {
    match opening {
        Some(handle) => match handle.await {
            Ok(res) => res,
            Err(e) => Err(TransportError::Connect(e.to_string())),
        },
        None => std::future::pending().await,
    }
}

async fn recv_frame(link: &mut Option<TransportChannels>) -> Option<TransportFrame> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use iterlink_core::ConnectionStatus;
    use iterlink_store::{EventStore, WriteQueue, WriteQueueConfig};
    use serde_json::json;

    use super::*;
    use crate::cache::MemoryCache;

    /// Scripted outcome of one `open` call.
    enum Script {
        Fail,
        Open,
    }

    /// Server side of a scripted transport.
    struct Peer {
        sent: mpsc::Receiver<String>,
        frames: mpsc::Sender<TransportFrame>,
    }

    struct FakeConnector {
        script: Mutex<VecDeque<Script>>,
        opens: AtomicU32,
        peers: mpsc::UnboundedSender<Peer>,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn open(&self) -> Result<TransportChannels, TransportError> {
            let _ = self.opens.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().pop_front().unwrap_or(Script::Fail);
            match next {
                Script::Fail => Err(TransportError::Connect("refused".into())),
                Script::Open => {
                    let (out_tx, out_rx) = mpsc::channel(64);
                    let (in_tx, in_rx) = mpsc::channel(64);
                    let _ = self.peers.send(Peer {
                        sent: out_rx,
                        frames: in_tx,
                    });
                    Ok(TransportChannels {
                        outbound: out_tx,
                        inbound: in_rx,
                    })
                }
            }
        }
    }

    struct Harness {
        manager: ConnectionManager,
        connector: Arc<FakeConnector>,
        cache: Arc<MemoryCache>,
        peers: mpsc::UnboundedReceiver<Peer>,
    }

    fn harness(script: Vec<Script>, max_attempts: u32) -> Harness {
        let (peers_tx, peers) = mpsc::unbounded_channel();
        let connector = Arc::new(FakeConnector {
            script: Mutex::new(script.into()),
            opens: AtomicU32::new(0),
            peers: peers_tx,
        });
        let cache = Arc::new(MemoryCache::new(InstanceId::from_raw("A")));
        let store = Arc::new(EventStore::in_memory().unwrap());
        let queue = Arc::new(WriteQueue::start(store, WriteQueueConfig::default()));
        let router = Router::new(cache.clone(), queue);
        let config = ManagerConfig {
            backoff: BackoffConfig {
                initial_delay_ms: 100,
                max_delay_ms: 1_000,
                max_attempts,
                jitter_factor: 0.3,
            },
            heartbeat_interval: Duration::from_secs(30),
        };
        let manager = ConnectionManager::start(connector.clone(), router, cache.clone(), config);
        Harness {
            manager,
            connector,
            cache,
            peers,
        }
    }

    impl Harness {
        fn opens(&self) -> u32 {
            self.connector.opens.load(Ordering::SeqCst)
        }

        async fn wait_for(&self, want: ConnectionState) {
            let mut rx = self.manager.watch_state();
            let _ = rx.wait_for(|s| *s == want).await.unwrap();
        }
    }

    /// Let the actor and spawned opens run; timers only fire via `advance`.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failure_reported_exactly_once() {
        let h = harness(vec![], 3);
        h.manager.connect();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(h.opens(), 3);
        assert_eq!(h.cache.failed_attempts(), Some(3));
        assert_eq!(h.cache.connection_status(), ConnectionStatus::Failed);
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);

        // Nothing further is scheduled.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.opens(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_rearms_terminal_report() {
        let h = harness(vec![], 2);
        h.manager.connect();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.opens(), 2);

        h.manager.reconnect();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.opens(), 4);
        assert_eq!(h.cache.failed_attempts(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_backoff() {
        let mut h = harness(vec![Script::Fail, Script::Fail, Script::Open], 10);
        h.manager.connect();
        h.wait_for(ConnectionState::Connected).await;
        assert_eq!(h.opens(), 3);
        assert_eq!(h.manager.attempts(), 0);
        assert_eq!(h.cache.connection_status(), ConnectionStatus::Connected);

        // Unrequested close: one attempt, retried after roughly the initial delay.
        let peer = h.peers.recv().await.unwrap();
        peer.frames
            .send(TransportFrame::Closed { reason: None })
            .await
            .unwrap();
        h.wait_for(ConnectionState::Disconnected).await;
        settle().await;
        assert_eq!(h.manager.attempts(), 1);

        tokio::time::sleep(Duration::from_millis(131)).await;
        settle().await;
        assert_eq!(h.opens(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_retry() {
        let h = harness(vec![Script::Fail], 10);
        h.manager.connect();
        settle().await;
        assert_eq!(h.opens(), 1);
        assert_eq!(h.manager.attempts(), 1);

        h.manager.disconnect();
        h.wait_for(ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(h.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_skips_pending_delay_and_resets_attempts() {
        let h = harness(vec![Script::Fail, Script::Open], 10);
        h.manager.connect();
        settle().await;
        assert_eq!(h.opens(), 1);
        assert_eq!(h.manager.attempts(), 1);

        let started = tokio::time::Instant::now();
        h.manager.reconnect();
        h.wait_for(ConnectionState::Connected).await;
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(h.opens(), 2);
        assert_eq!(h.manager.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_noop_while_connected_and_disconnect_is_terminal() {
        let mut h = harness(vec![Script::Open, Script::Open], 10);
        h.manager.connect();
        h.wait_for(ConnectionState::Connected).await;
        h.manager.connect();
        settle().await;
        assert_eq!(h.opens(), 1);

        let _peer = h.peers.recv().await.unwrap();
        h.manager.disconnect();
        h.wait_for(ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.opens(), 1);

        h.manager.connect();
        h.wait_for(ConnectionState::Connected).await;
        assert_eq!(h.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn open_sends_catch_up_and_heartbeat() {
        let mut h = harness(vec![Script::Open, Script::Open], 10);
        h.manager.connect();
        h.wait_for(ConnectionState::Connected).await;
        let mut peer = h.peers.recv().await.unwrap();

        let event = json!({"type": "loop:event", "event": {"type": "output", "timestamp": 42}});
        peer.frames.send(TransportFrame::Text(event.to_string())).await.unwrap();
        settle().await;
        assert_eq!(h.cache.event_count(&InstanceId::from_raw("A")), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        let ping: Value = serde_json::from_str(&peer.sent.recv().await.unwrap()).unwrap();
        assert_eq!(ping["type"], "ping");

        peer.frames.send(TransportFrame::Closed { reason: None }).await.unwrap();
        h.wait_for(ConnectionState::Disconnected).await;
        h.wait_for(ConnectionState::Connected).await;

        let mut peer = h.peers.recv().await.unwrap();
        let catch_up: Value = serde_json::from_str(&peer.sent.recv().await.unwrap()).unwrap();
        assert_eq!(
            catch_up,
            json!({"type": "reconnect", "instanceId": "A", "lastEventTimestamp": 42})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn send_dropped_while_disconnected() {
        let mut h = harness(vec![Script::Open], 10);
        h.manager.send(Outbound::App(json!({"type": "hello"})));
        h.manager.connect();
        h.wait_for(ConnectionState::Connected).await;
        let mut peer = h.peers.recv().await.unwrap();

        h.manager.send(Outbound::App(json!({"type": "after"})));
        let sent: Value = serde_json::from_str(&peer.sent.recv().await.unwrap()).unwrap();
        assert_eq!(sent["type"], "after");
    }

    #[tokio::test(start_paused = true)]
    async fn chat_forwarded_to_subscribers() {
        let mut h = harness(vec![Script::Open], 10);
        let mut app = h.manager.app_messages();
        h.manager.connect();
        h.wait_for(ConnectionState::Connected).await;
        let peer = h.peers.recv().await.unwrap();

        let chat = json!({"type": "chat:delta", "text": "hi"});
        peer.frames.send(TransportFrame::Text(chat.to_string())).await.unwrap();
        peer.frames.send(TransportFrame::Text("not json".into())).await.unwrap();
        assert_eq!(app.recv().await.unwrap(), chat);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_joins_actor() {
        let h = harness(vec![Script::Open], 10);
        h.manager.connect();
        h.wait_for(ConnectionState::Connected).await;
        h.manager.stop().await;
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        // Commands after stop are ignored.
        h.manager.connect();
    }
}
