use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use log::{debug, error, info};
use parking_lot::Mutex;
use tokio::{net::UdpSocket, sync::watch, task::JoinHandle, time::timeout};

use minecraft::raknet;

use crate::{
    config::ServerConfig,
    events::Event,
    lifecycle::{LifecycleManager, ServerRuntime},
};

/// A session with no traffic in either direction for this long is torn down.
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const SWEEP_INTERVAL: Duration = Duration::from_secs(15);
const PING_RELAY_TIMEOUT: Duration = Duration::from_secs(1);

/// RakNet never exceeds the ethernet MTU for a single datagram.
const RELAY_BUFFER_SIZE: usize = 1500;

/// One Bedrock client talking through us. The dedicated backend socket is
/// the demultiplexer: the backend sees its ephemeral port as "the client",
/// so replies land here and nowhere else, without any connection state in
/// the listener loop.
struct BedrockSession {
    backend: Arc<UdpSocket>,
    last_activity: Mutex<Instant>,
    /// Open Connection Request 2 counts the session exactly once, no matter
    /// how often the client retransmits it.
    counted: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl BedrockSession {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn is_expired(&self, idle: Duration) -> bool {
        self.last_activity.lock().elapsed() > idle
    }
}

struct ListenerCtx {
    cfg: ServerConfig,
    backend_addr: String,
    listen_port: u16,
    socket: Arc<UdpSocket>,
    sessions: Mutex<HashMap<SocketAddr, Arc<BedrockSession>>>,
    runtime: Arc<ServerRuntime>,
    lifecycle: Arc<LifecycleManager>,
    /// Stable for the listener's lifetime; Bedrock clients track servers by
    /// GUID across pings.
    server_guid: u64,
    session_timeout: Duration,
}

/// Receive loop for one public RakNet port: a Bedrock server's own port, or
/// the crossplay port of a Java server.
pub struct BedrockListener {
    ctx: Arc<ListenerCtx>,
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl BedrockListener {
    pub async fn bind(
        cfg: ServerConfig,
        lifecycle: Arc<LifecycleManager>,
        shutdown: watch::Receiver<bool>,
        session_timeout: Duration,
    ) -> io::Result<BedrockListener> {
        let port = cfg.bedrock_listen_port().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "server has no bedrock port")
        })?;
        let backend_addr = cfg.bedrock_backend_addr().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "server has no bedrock backend")
        })?;

        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
        let local_addr = socket.local_addr()?;
        info!("listening on {local_addr}/udp (bedrock for server '{}')", cfg.id);

        let runtime = lifecycle.runtime(&cfg.id);
        let ctx = Arc::new(ListenerCtx {
            backend_addr,
            listen_port: local_addr.port(),
            socket,
            sessions: Mutex::new(HashMap::new()),
            runtime,
            lifecycle,
            server_guid: rand::random(),
            session_timeout,
            cfg,
        });

        let handle = tokio::spawn(recv_loop(ctx.clone(), shutdown.clone()));
        let sweeper = tokio::spawn(sweep_loop(ctx.clone(), shutdown));
        Ok(BedrockListener { ctx, local_addr, handle, sweeper })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session_count(&self) -> usize {
        self.ctx.sessions.lock().len()
    }

    /// Stops receiving. Backend reader tasks die with their sessions.
    pub fn shutdown(self) {
        self.handle.abort();
        self.sweeper.abort();
    }
}

async fn recv_loop(ctx: Arc<ListenerCtx>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0_u8; RELAY_BUFFER_SIZE];
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = ctx.socket.recv_from(&mut buf) => {
                let (n, peer) = match received {
                    Ok(x) => x,
                    Err(e) => {
                        error!("failed to receive datagram: {e}");
                        continue;
                    }
                };
                if n == 0 {
                    continue;
                }
                handle_datagram(&ctx, &buf[..n], peer).await;
            }
        }
    }
    info!("bedrock listener for '{}' closed", ctx.cfg.id);
}

async fn handle_datagram(ctx: &Arc<ListenerCtx>, datagram: &[u8], peer: SocketAddr) {
    match datagram[0] {
        // Status query. Answered from here or relayed, never a wake-up.
        raknet::ID_UNCONNECTED_PING => {
            let Some(ping) = raknet::parse_unconnected_ping(datagram) else {
                return;
            };
            if ctx.runtime.is_running() {
                let ctx = ctx.clone();
                let datagram = datagram.to_vec();
                tokio::spawn(async move {
                    relay_ping(ctx, datagram, peer).await;
                });
            } else {
                let payload = raknet::motd_payload(
                    &format!("{} — sleeping", ctx.cfg.motd),
                    ctx.cfg.fake_protocol,
                    &ctx.cfg.fake_version,
                    0,
                    ctx.cfg.max_players,
                    ctx.server_guid,
                    &ctx.cfg.name,
                    ctx.listen_port,
                );
                let pong = raknet::build_unconnected_pong(ping.time, ctx.server_guid, &payload);
                let _ = ctx.socket.send_to(&pong, peer).await;
            }
        }

        // First handshake datagram: this is the wake path.
        raknet::ID_OPEN_CONNECTION_REQUEST_1 => {
            if !raknet::is_offline_message(datagram) {
                return;
            }
            let ctx = ctx.clone();
            let datagram = datagram.to_vec();
            tokio::spawn(async move {
                wake_and_forward(ctx, datagram, peer).await;
            });
        }

        // Second handshake datagram: the client is committing, count it.
        raknet::ID_OPEN_CONNECTION_REQUEST_2 => {
            let session = ctx.sessions.lock().get(&peer).cloned();
            if let Some(session) = session {
                if !session.counted.swap(true, Ordering::SeqCst) {
                    let count = ctx.runtime.inc_sessions();
                    debug!("sessions for '{}': {count}", ctx.cfg.id);
                }
                session.touch();
                let _ = session.backend.send(datagram).await;
            }
        }

        // Anything else is game traffic, relayed only for known clients.
        _ => {
            let session = ctx.sessions.lock().get(&peer).cloned();
            if let Some(session) = session {
                session.touch();
                ctx.runtime.touch();
                let _ = session.backend.send(datagram).await;
            }
        }
    }
}

/// Forwards a ping to the live backend through a throwaway socket and relays
/// the pong, so players see the backend's real MOTD and player count.
async fn relay_ping(ctx: Arc<ListenerCtx>, datagram: Vec<u8>, peer: SocketAddr) {
    let attempt = async {
        let probe = UdpSocket::bind("0.0.0.0:0").await.ok()?;
        probe.connect(&ctx.backend_addr).await.ok()?;
        probe.send(&datagram).await.ok()?;
        let mut buf = vec![0_u8; RELAY_BUFFER_SIZE];
        let n = probe.recv(&mut buf).await.ok()?;
        raknet::parse_unconnected_pong(&buf[..n]).map(|_| buf[..n].to_vec())
    };
    match timeout(PING_RELAY_TIMEOUT, attempt).await {
        Ok(Some(pong)) => {
            let _ = ctx.socket.send_to(&pong, peer).await;
        }
        _ => debug!("no pong from backend of '{}'", ctx.cfg.id),
    }
}

async fn wake_and_forward(ctx: Arc<ListenerCtx>, datagram: Vec<u8>, peer: SocketAddr) {
    // Start failures leave the client in silence; RakNet retransmits the
    // request and the next attempt starts fresh. The failure event has
    // already gone out on the bus.
    if ctx.lifecycle.ensure_running(&ctx.cfg).await.is_err() {
        return;
    }

    let session = match get_or_create_session(&ctx, peer).await {
        Ok(x) => x,
        Err(e) => {
            error!("failed to open backend socket for {peer}: {e}");
            return;
        }
    };
    session.touch();
    let _ = session.backend.send(&datagram).await;
}

async fn get_or_create_session(
    ctx: &Arc<ListenerCtx>,
    peer: SocketAddr,
) -> io::Result<Arc<BedrockSession>> {
    if let Some(session) = ctx.sessions.lock().get(&peer).cloned() {
        return Ok(session);
    }

    let backend = UdpSocket::bind("0.0.0.0:0").await?;
    backend.connect(&ctx.backend_addr).await?;
    let session = Arc::new(BedrockSession {
        backend: Arc::new(backend),
        last_activity: Mutex::new(Instant::now()),
        counted: AtomicBool::new(false),
        reader: Mutex::new(None),
    });

    {
        let mut sessions = ctx.sessions.lock();
        if let Some(existing) = sessions.get(&peer) {
            // lost the creation race, the extra socket just drops
            return Ok(existing.clone());
        }
        sessions.insert(peer, session.clone());
    }

    let reader = tokio::spawn(backend_reader(ctx.clone(), session.clone(), peer));
    *session.reader.lock() = Some(reader);
    debug!("new bedrock session {peer} -> {}", ctx.backend_addr);
    Ok(session)
}

/// Relays backend replies to the client through the listener socket, so the
/// client keeps seeing the public port it connected to.
async fn backend_reader(ctx: Arc<ListenerCtx>, session: Arc<BedrockSession>, peer: SocketAddr) {
    let mut buf = vec![0_u8; RELAY_BUFFER_SIZE];
    loop {
        match timeout(ctx.session_timeout, session.backend.recv(&mut buf)).await {
            // backend silent for the whole window; the sweeper expires us
            Err(_) => break,
            Ok(Err(_)) => break,
            Ok(Ok(n)) => {
                session.touch();
                ctx.runtime.touch();
                if ctx.socket.send_to(&buf[..n], peer).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn sweep_loop(ctx: Arc<ListenerCtx>, mut shutdown: watch::Receiver<bool>) {
    let interval = ctx.session_timeout.min(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(interval) => {
                sweep(&ctx);
            }
        }
    }
}

fn sweep(ctx: &ListenerCtx) {
    // snapshot victims under the lock, tear them down outside it
    let victims: Vec<(SocketAddr, Arc<BedrockSession>)> = {
        let mut sessions = ctx.sessions.lock();
        let expired: Vec<SocketAddr> = sessions
            .iter()
            .filter(|(_, session)| session.is_expired(ctx.session_timeout))
            .map(|(addr, _)| *addr)
            .collect();
        expired
            .into_iter()
            .filter_map(|addr| sessions.remove(&addr).map(|session| (addr, session)))
            .collect()
    };

    for (peer, session) in victims {
        if let Some(reader) = session.reader.lock().take() {
            reader.abort();
        }
        if session.counted.load(Ordering::SeqCst) {
            let count = ctx.runtime.dec_sessions();
            // RakNet never told us a username, the count still matters to
            // the usage log
            ctx.lifecycle.events().emit(Event::PlayerLeave {
                server_id: ctx.cfg.id.clone(),
                username: None,
                player_count: count,
            });
            debug!("sessions for '{}': {count}", ctx.cfg.id);
        }
        info!("bedrock session {peer} expired");
    }
}
