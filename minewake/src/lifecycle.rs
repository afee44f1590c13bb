use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{error, info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{sync::oneshot, task::JoinHandle};

use crate::{
    config::{ConfigStore, ServerConfig},
    docker::ContainerCtl,
    events::{Event, EventBus},
    probe,
};

/// Seconds a backend gets to save and exit before the runtime kills it.
pub const STOP_GRACE_SECONDS: u64 = 30;

/// How often the idle reaper and container resync run.
pub const IDLE_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Container start calls that fail transiently are retried this many times
/// within a single start attempt before the attempt is reported failed.
const START_ATTEMPTS: u32 = 3;
const START_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StartError {
    #[error("container start failed: {0}")]
    Container(String),

    #[error("backend did not become ready within {0} seconds")]
    Timeout(u64),
}

struct RuntimeInner {
    state: ServerState,
    active_sessions: u32,
    last_activity: Instant,
    /// Waiters that joined while a start was in flight; they all receive the
    /// outcome of that one attempt.
    start_waiters: Vec<oneshot::Sender<Result<(), StartError>>>,
    /// Waiters blocked on STOPPING -> STOPPED before re-running the start path.
    stop_waiters: Vec<oneshot::Sender<()>>,
    start_error: Option<StartError>,
}

/// Proxy-local mutable state of one backend. Shared by every listener and
/// session fronting that backend; all read-modify-write goes through the
/// lock, which is never held across an await.
pub struct ServerRuntime {
    inner: Mutex<RuntimeInner>,
}

impl ServerRuntime {
    fn new() -> ServerRuntime {
        ServerRuntime {
            inner: Mutex::new(RuntimeInner {
                state: ServerState::Stopped,
                active_sessions: 0,
                last_activity: Instant::now(),
                start_waiters: Vec::new(),
                stop_waiters: Vec::new(),
                start_error: None,
            }),
        }
    }

    pub fn state(&self) -> ServerState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    pub fn active_sessions(&self) -> u32 {
        self.inner.lock().active_sessions
    }

    pub fn last_start_error(&self) -> Option<StartError> {
        self.inner.lock().start_error.clone()
    }

    /// Marks traffic so the idle reaper leaves the backend alone.
    pub fn touch(&self) {
        self.inner.lock().last_activity = Instant::now();
    }

    pub fn inc_sessions(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.active_sessions += 1;
        inner.last_activity = Instant::now();
        inner.active_sessions
    }

    pub fn dec_sessions(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.active_sessions = inner.active_sessions.saturating_sub(1);
        inner.last_activity = Instant::now();
        inner.active_sessions
    }
}

enum Plan {
    Ready,
    Start,
    WaitStart(oneshot::Receiver<Result<(), StartError>>),
    WaitStop(oneshot::Receiver<()>),
}

/// Coordinates backend lifecycles: start deduplication, idle shutdown, and
/// the per-server runtime registry. Runtimes live for the process lifetime.
pub struct LifecycleManager {
    ctl: Arc<dyn ContainerCtl>,
    events: EventBus,
    runtimes: Mutex<HashMap<String, Arc<ServerRuntime>>>,
}

impl LifecycleManager {
    pub fn new(ctl: Arc<dyn ContainerCtl>, events: EventBus) -> Arc<LifecycleManager> {
        Arc::new(LifecycleManager {
            ctl,
            events,
            runtimes: Mutex::new(HashMap::new()),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn container_ctl(&self) -> &dyn ContainerCtl {
        self.ctl.as_ref()
    }

    pub fn runtime(&self, server_id: &str) -> Arc<ServerRuntime> {
        self.runtimes
            .lock()
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(ServerRuntime::new()))
            .clone()
    }

    /// Returns once the backend is RUNNING, starting it if necessary.
    ///
    /// Linearizable per runtime: at most one container start is in flight,
    /// and every caller that joined while it ran observes the same outcome.
    /// Callers arriving during STOPPING wait for STOPPED and then re-enter
    /// the start path.
    pub async fn ensure_running(&self, cfg: &ServerConfig) -> Result<(), StartError> {
        let runtime = self.runtime(&cfg.id);
        loop {
            let plan = {
                let mut inner = runtime.inner.lock();
                match inner.state {
                    ServerState::Running => Plan::Ready,
                    ServerState::Starting => {
                        let (tx, rx) = oneshot::channel();
                        inner.start_waiters.push(tx);
                        Plan::WaitStart(rx)
                    }
                    ServerState::Stopping => {
                        let (tx, rx) = oneshot::channel();
                        inner.stop_waiters.push(tx);
                        Plan::WaitStop(rx)
                    }
                    ServerState::Stopped => {
                        inner.state = ServerState::Starting;
                        Plan::Start
                    }
                }
            };

            match plan {
                Plan::Ready => return Ok(()),
                Plan::WaitStart(rx) => {
                    return rx.await.unwrap_or_else(|_| {
                        Err(StartError::Container("start attempt abandoned".to_string()))
                    });
                }
                Plan::WaitStop(rx) => {
                    let _ = rx.await;
                    continue;
                }
                Plan::Start => {
                    let result = self.run_start(cfg).await;
                    let waiters = {
                        let mut inner = runtime.inner.lock();
                        match &result {
                            Ok(()) => {
                                inner.state = ServerState::Running;
                                inner.start_error = None;
                                inner.last_activity = Instant::now();
                            }
                            Err(e) => {
                                inner.state = ServerState::Stopped;
                                inner.start_error = Some(e.clone());
                            }
                        }
                        std::mem::take(&mut inner.start_waiters)
                    };
                    for waiter in waiters {
                        let _ = waiter.send(result.clone());
                    }
                    match &result {
                        Ok(()) => {
                            info!("server '{}' is ready", cfg.id);
                            self.events.emit(Event::ServerReady {
                                server_id: cfg.id.clone(),
                            });
                        }
                        Err(e) => {
                            error!("server '{}' failed to start: {e}", cfg.id);
                            self.events.emit(Event::ServerStartFailed {
                                server_id: cfg.id.clone(),
                                reason: e.to_string(),
                            });
                        }
                    }
                    return result;
                }
            }
        }
    }

    async fn run_start(&self, cfg: &ServerConfig) -> Result<(), StartError> {
        info!("starting server '{}' (container '{}')", cfg.id, cfg.container_name);
        self.events.emit(Event::ServerStarting {
            server_id: cfg.id.clone(),
        });

        let mut attempt = 0;
        loop {
            match self.ctl.start(&cfg.container_name).await {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    if attempt >= START_ATTEMPTS {
                        return Err(StartError::Container(e.to_string()));
                    }
                    warn!(
                        "start of container '{}' failed (attempt {attempt}): {e}",
                        cfg.container_name
                    );
                    tokio::time::sleep(START_RETRY_DELAY).await;
                }
            }
        }

        probe::wait_ready(self.ctl.as_ref(), cfg).await
    }

    /// Single background task driving idle shutdown and container resync for
    /// every configured server.
    pub fn spawn_idle_ticker(
        self: &Arc<Self>,
        store: Arc<ConfigStore>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.tick(&store).await;
            }
        })
    }

    async fn tick(&self, store: &ConfigStore) {
        let snapshot = store.snapshot();
        for cfg in &snapshot.servers {
            let runtime = self.runtime(&cfg.id);

            let reap = {
                let mut inner = runtime.inner.lock();
                if inner.state == ServerState::Running
                    && inner.active_sessions == 0
                    && inner.last_activity.elapsed() >= Duration::from_secs(cfg.idle_timeout_s)
                {
                    inner.state = ServerState::Stopping;
                    true
                } else {
                    false
                }
            };

            if reap {
                self.shut_down(cfg, &runtime, "idle_timeout").await;
                continue;
            }

            // Containers can die or be stopped from the admin side while we
            // believe they are RUNNING; resync so the next login starts fresh.
            if runtime.state() == ServerState::Running {
                match self.ctl.state(&cfg.container_name).await {
                    Ok(status) if !status.is_running() => {
                        let resync = {
                            let mut inner = runtime.inner.lock();
                            if inner.state == ServerState::Running {
                                inner.state = ServerState::Stopped;
                                true
                            } else {
                                false
                            }
                        };
                        if resync {
                            warn!(
                                "container '{}' is no longer running, marking server '{}' stopped",
                                cfg.container_name, cfg.id
                            );
                            self.events.emit(Event::ServerStopped {
                                server_id: cfg.id.clone(),
                                reason: "container_exited".to_string(),
                            });
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("failed to inspect container '{}': {e}", cfg.container_name),
                }
            }
        }
    }

    async fn shut_down(&self, cfg: &ServerConfig, runtime: &ServerRuntime, reason: &str) {
        info!("stopping idle server '{}' ({reason})", cfg.id);
        self.events.emit(Event::ServerStopping {
            server_id: cfg.id.clone(),
        });

        if let Err(e) = self.ctl.stop(&cfg.container_name, STOP_GRACE_SECONDS).await {
            error!("failed to stop container '{}': {e}", cfg.container_name);
            self.events.emit(Event::ProxyError {
                server_id: Some(cfg.id.clone()),
                detail: format!("container stop failed: {e}"),
            });
        }

        let waiters = {
            let mut inner = runtime.inner.lock();
            inner.state = ServerState::Stopped;
            std::mem::take(&mut inner.stop_waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(());
        }
        self.events.emit(Event::ServerStopped {
            server_id: cfg.id.clone(),
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Edition, ProxyConfig};
    use crate::docker::{ContainerError, ContainerHealth, ContainerState, ContainerStatus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct MockCtl {
        starts: AtomicU32,
        stops: AtomicU32,
        running: AtomicBool,
        fail_start: bool,
        start_delay: Duration,
    }

    impl MockCtl {
        fn new() -> Arc<MockCtl> {
            Arc::new(MockCtl {
                starts: AtomicU32::new(0),
                stops: AtomicU32::new(0),
                running: AtomicBool::new(false),
                fail_start: false,
                start_delay: Duration::from_millis(20),
            })
        }

        fn failing() -> Arc<MockCtl> {
            Arc::new(MockCtl {
                starts: AtomicU32::new(0),
                stops: AtomicU32::new(0),
                running: AtomicBool::new(false),
                fail_start: true,
                start_delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl ContainerCtl for MockCtl {
        async fn start(&self, _container: &str) -> Result<(), ContainerError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.start_delay).await;
            if self.fail_start {
                return Err(ContainerError::CommandFailed {
                    command: "start",
                    container: "mock".to_string(),
                    detail: "daemon unreachable".to_string(),
                });
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self, _container: &str, _grace_seconds: u64) -> Result<(), ContainerError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn state(&self, _container: &str) -> Result<ContainerStatus, ContainerError> {
            if self.running.load(Ordering::SeqCst) {
                Ok(ContainerStatus {
                    state: ContainerState::Running,
                    health: Some(ContainerHealth::Healthy),
                })
            } else {
                Ok(ContainerStatus {
                    state: ContainerState::Exited,
                    health: None,
                })
            }
        }

        async fn exec(&self, _container: &str, _command: &[&str]) -> Result<String, ContainerError> {
            Ok(String::new())
        }
    }

    fn test_config(idle_timeout_s: u64) -> ServerConfig {
        ServerConfig {
            id: "vanilla".to_string(),
            name: "Vanilla".to_string(),
            edition: Edition::Java,
            container_name: "mc-vanilla".to_string(),
            external_port: 25565,
            internal_host: "127.0.0.1".to_string(),
            internal_port: 25566,
            bedrock_port: None,
            bedrock_internal_port: None,
            crossplay: false,
            motd: "A server".to_string(),
            fake_version: "1.20.4".to_string(),
            fake_protocol: 765,
            max_players: 20,
            favicon_b64: None,
            idle_timeout_s,
            max_startup_wait_s: 2,
        }
    }

    fn test_store(cfg: &ServerConfig) -> Arc<ConfigStore> {
        let path = std::env::temp_dir().join(format!(
            "minewake-lifecycle-{}-{}.yaml",
            cfg.id,
            std::process::id()
        ));
        Arc::new(
            ConfigStore::from_config(
                path,
                ProxyConfig {
                    servers: vec![cfg.clone()],
                    ..ProxyConfig::default()
                },
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn concurrent_logins_share_one_start() {
        let ctl = MockCtl::new();
        let manager = LifecycleManager::new(ctl.clone(), EventBus::new());
        let cfg = test_config(300);

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let manager = manager.clone();
            let cfg = cfg.clone();
            tasks.push(tokio::spawn(async move {
                manager.ensure_running(&cfg).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        assert_eq!(ctl.starts.load(Ordering::SeqCst), 1);
        assert!(manager.runtime("vanilla").is_running());
    }

    #[tokio::test]
    async fn start_failure_reaches_every_waiter() {
        let ctl = MockCtl::failing();
        let manager = LifecycleManager::new(ctl.clone(), EventBus::new());
        let cfg = test_config(300);

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let manager = manager.clone();
            let cfg = cfg.clone();
            tasks.push(tokio::spawn(async move {
                manager.ensure_running(&cfg).await
            }));
        }
        for task in tasks {
            assert!(matches!(
                task.await.unwrap(),
                Err(StartError::Container(_))
            ));
        }

        let runtime = manager.runtime("vanilla");
        assert_eq!(runtime.state(), ServerState::Stopped);
        assert!(runtime.last_start_error().is_some());
        // each of the bounded retries counts as one runtime call
        assert_eq!(ctl.starts.load(Ordering::SeqCst), START_ATTEMPTS);
    }

    #[tokio::test]
    async fn start_failure_emits_event_and_next_attempt_is_fresh() {
        let ctl = MockCtl::failing();
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let manager = LifecycleManager::new(ctl.clone(), events);
        let cfg = test_config(300);

        assert!(manager.ensure_running(&cfg).await.is_err());
        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if event.name() == "server.start_failed" {
                saw_failure = true;
            }
        }
        assert!(saw_failure);

        // the failed attempt left the runtime STOPPED, so a new caller
        // triggers a fresh start
        assert!(manager.ensure_running(&cfg).await.is_err());
        assert_eq!(ctl.starts.load(Ordering::SeqCst), START_ATTEMPTS * 2);
    }

    #[tokio::test]
    async fn session_accounting_is_exact() {
        let manager = LifecycleManager::new(MockCtl::new(), EventBus::new());
        let runtime = manager.runtime("vanilla");

        assert_eq!(runtime.inc_sessions(), 1);
        assert_eq!(runtime.inc_sessions(), 2);
        assert_eq!(runtime.dec_sessions(), 1);
        assert_eq!(runtime.dec_sessions(), 0);
        // underflow is clamped, a stray double-decrement cannot go negative
        assert_eq!(runtime.dec_sessions(), 0);
    }

    #[tokio::test]
    async fn idle_runtime_is_reaped() {
        let ctl = MockCtl::new();
        let manager = LifecycleManager::new(ctl.clone(), EventBus::new());
        let cfg = test_config(0);
        let store = test_store(&cfg);

        manager.ensure_running(&cfg).await.unwrap();
        let ticker = manager.spawn_idle_ticker(store, Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.runtime("vanilla").state(), ServerState::Stopped);
        assert_eq!(ctl.stops.load(Ordering::SeqCst), 1);
        ticker.abort();
    }

    #[tokio::test]
    async fn active_session_blocks_the_reaper() {
        let ctl = MockCtl::new();
        let manager = LifecycleManager::new(ctl.clone(), EventBus::new());
        let cfg = test_config(0);
        let store = test_store(&cfg);

        manager.ensure_running(&cfg).await.unwrap();
        let runtime = manager.runtime("vanilla");
        runtime.inc_sessions();

        let ticker = manager.spawn_idle_ticker(store, Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runtime.state(), ServerState::Running);
        assert_eq!(ctl.stops.load(Ordering::SeqCst), 0);

        // once the session ends the next ticks reap it
        runtime.dec_sessions();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(runtime.state(), ServerState::Stopped);
        ticker.abort();
    }

    #[tokio::test]
    async fn login_during_stopping_waits_and_restarts() {
        let ctl = MockCtl::new();
        let manager = LifecycleManager::new(ctl.clone(), EventBus::new());
        let cfg = test_config(0);
        let store = test_store(&cfg);

        manager.ensure_running(&cfg).await.unwrap();
        let ticker = manager.spawn_idle_ticker(store, Duration::from_millis(20));

        // wait until the reaper has actually stopped the backend
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.runtime("vanilla").state(), ServerState::Stopped);

        manager.ensure_running(&cfg).await.unwrap();
        assert_eq!(ctl.starts.load(Ordering::SeqCst), 2);
        ticker.abort();
    }
}
