use std::{net::SocketAddr, sync::Arc, time::Duration};

use log::{debug, error, info, warn};
use serde_json::json;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinHandle,
    time::timeout,
};

use minecraft::{
    legacy,
    packets::{
        HandshakeC2SPacket, LoginDisconnectS2CPacket, LoginStartC2SPacket, MinecraftPacket,
        PingPacket, StatusRequestC2SPacket, StatusResponseS2CPacket, HANDSHAKE_PACKET_ID,
        LOGIN_DISCONNECT_PACKET_ID, NEXT_STATE_LOGIN, NEXT_STATE_STATUS, NEXT_STATE_TRANSFER,
        PING_PACKET_ID, STATUS_RESPONSE_PACKET_ID,
    },
    serialization::{truncate_to_zero, MinecraftStream, ReadingError},
    status::StatusResponse,
};

use crate::{
    config::ServerConfig,
    events::{Event, EventBus},
    lifecycle::{LifecycleManager, ServerRuntime},
    stream::forward_half,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);
const FORWARD_BUFFER_SIZE: usize = 8192;

/// A handshake is a handful of fields; anything bigger is not a handshake.
const MAX_HANDSHAKE_LENGTH: usize = 1024;
/// Protocol limit for the server address field.
const MAX_SERVER_ADDRESS: usize = 255;

const DISCONNECT_START_FAILED: &str = "Server failed to start, try again shortly";
const DISCONNECT_BAD_LOGIN: &str = "Invalid login packet";

/// Accept loop for one Java server's public port.
pub struct JavaListener {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl JavaListener {
    pub async fn bind(
        cfg: ServerConfig,
        lifecycle: Arc<LifecycleManager>,
        shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<JavaListener> {
        let listener = TcpListener::bind(("0.0.0.0", cfg.external_port)).await?;
        let local_addr = listener.local_addr()?;
        info!("listening on {local_addr} (java server '{}')", cfg.id);
        let handle = tokio::spawn(accept_loop(listener, cfg, lifecycle, shutdown));
        Ok(JavaListener { local_addr, handle })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting. Sessions already bridged keep running.
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    cfg: ServerConfig,
    lifecycle: Arc<LifecycleManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(x) => x,
                    Err(e) => {
                        error!("failed to accept client: {e}");
                        continue;
                    }
                };
                let cfg = cfg.clone();
                let lifecycle = lifecycle.clone();
                tokio::spawn(async move {
                    handle_client(socket, peer, cfg, lifecycle).await;
                });
            }
        }
    }
    info!("java listener for '{}' closed", cfg.id);
}

enum Inbound {
    /// Pre-1.7 server list ping, recognized by its bare 0xFE first byte.
    LegacyPing,
    Handshake(HandshakeC2SPacket),
}

async fn read_inbound<RW>(stream: &mut MinecraftStream<RW>) -> Result<Inbound, ReadingError>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    if stream.peek_byte().await? == legacy::LEGACY_PING_ID {
        return Ok(Inbound::LegacyPing);
    }
    let signature = stream.read_signature().await?;
    if signature.packet_id != HANDSHAKE_PACKET_ID || signature.length > MAX_HANDSHAKE_LENGTH {
        return Err(ReadingError::Invalid);
    }
    let handshake = stream.read_data::<HandshakeC2SPacket>(signature).await?;
    if handshake.server_address.len() > MAX_SERVER_ADDRESS {
        return Err(ReadingError::Invalid);
    }
    Ok(Inbound::Handshake(handshake))
}

async fn handle_client(
    mut client: TcpStream,
    peer: SocketAddr,
    cfg: ServerConfig,
    lifecycle: Arc<LifecycleManager>,
) {
    debug!("accepted connection from {peer}");
    if let Err(e) = client.set_nodelay(true) {
        error!("failed to set no_delay for client: {e}");
        return;
    }

    let runtime = lifecycle.runtime(&cfg.id);
    let mut stream = MinecraftStream::new(&mut client, 4096);

    let inbound = match timeout(HANDSHAKE_TIMEOUT, read_inbound(&mut stream)).await {
        Ok(Ok(x)) => x,
        Ok(Err(e)) => {
            debug!("handshake failed from {peer}: {e:?}");
            return;
        }
        Err(_) => {
            debug!("handshake timeout from {peer}");
            return;
        }
    };

    let handshake = match inbound {
        Inbound::LegacyPing => {
            drop(stream);
            debug!("legacy ping from {peer}");
            let reply = legacy::build_legacy_kick(
                &cfg.fake_version,
                &status_motd(&cfg, &runtime),
                0,
                cfg.max_players,
            );
            let _ = client.write_all(&reply).await;
            return;
        }
        Inbound::Handshake(handshake) => handshake,
    };

    debug!(
        "handshake from {peer}: address '{}', protocol {}, next_state {}",
        truncate_to_zero(&handshake.server_address),
        handshake.protocol_version,
        handshake.next_state
    );

    match handshake.next_state {
        NEXT_STATE_STATUS => {
            handle_status(&mut stream, &cfg, &runtime, &handshake).await;
        }
        NEXT_STATE_LOGIN | NEXT_STATE_TRANSFER => {
            // Login Start: the username matters for events, the raw bytes
            // for the replay.
            let login = match timeout(
                HANDSHAKE_TIMEOUT,
                stream.read_packet::<LoginStartC2SPacket>(),
            )
            .await
            {
                Ok(Ok(x)) => x,
                _ => {
                    // likely a scanner or bot, tell it to go away
                    warn!("malformed login packet from {peer}");
                    let _ = stream
                        .write_packet(LOGIN_DISCONNECT_PACKET_ID, &LoginDisconnectS2CPacket {
                            reason: chat_text(DISCONNECT_BAD_LOGIN),
                        })
                        .await;
                    return;
                }
            };
            let username = truncate_to_zero(&login.name).to_string();
            let replay = stream.raw().to_vec();
            drop(stream);
            handle_login(client, peer, cfg, lifecycle, runtime, username, replay).await;
        }
        other => {
            debug!("unknown next_state {other} in handshake from {peer}");
        }
    }
}

/// Synthetic status exchange. Never wakes the backend: the whole point is
/// that server-list refreshes are free.
async fn handle_status<RW>(
    stream: &mut MinecraftStream<RW>,
    cfg: &ServerConfig,
    runtime: &ServerRuntime,
    handshake: &HandshakeC2SPacket,
) where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(
        STATUS_EXCHANGE_TIMEOUT,
        stream.read_packet::<StatusRequestC2SPacket>(),
    )
    .await
    {
        Ok(Ok(_)) => {}
        _ => return,
    }

    // The protocol version is echoed back so list pings never show a
    // version mismatch regardless of the client's version.
    let response = StatusResponse::new(
        &cfg.fake_version,
        handshake.protocol_version,
        &status_motd(cfg, runtime),
        0,
        cfg.max_players,
    )
    .with_favicon(cfg.favicon_b64.as_deref());
    let payload = match serde_json::to_string(&response) {
        Ok(x) => x,
        Err(e) => {
            error!("failed to encode status response: {e}");
            return;
        }
    };
    if stream
        .write_packet(STATUS_RESPONSE_PACKET_ID, &StatusResponseS2CPacket { payload })
        .await
        .is_none()
    {
        return;
    }

    // Optional ping, echoed unchanged.
    if let Ok(Ok(ping)) = timeout(STATUS_EXCHANGE_TIMEOUT, stream.read_packet::<PingPacket>()).await
    {
        let _ = stream.write_packet(PING_PACKET_ID, &ping).await;
    }
}

/// Holds one counted session. Dropping it decrements the count and announces
/// the departure, which makes the decrement run exactly once on every exit
/// path out of the bridge, cancellation included.
struct SessionGuard {
    runtime: Arc<ServerRuntime>,
    events: EventBus,
    server_id: String,
    username: String,
    count: u32,
}

impl SessionGuard {
    fn open(
        runtime: Arc<ServerRuntime>,
        events: EventBus,
        server_id: String,
        username: String,
    ) -> SessionGuard {
        let count = runtime.inc_sessions();
        debug!("sessions for '{server_id}': {count}");
        SessionGuard {
            runtime,
            events,
            server_id,
            username,
            count,
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let count = self.runtime.dec_sessions();
        self.events.emit(Event::PlayerLeave {
            server_id: self.server_id.clone(),
            username: Some(self.username.clone()),
            player_count: count,
        });
        info!(
            "connection closed (player '{}', server '{}', sessions {count})",
            self.username, self.server_id
        );
    }
}

async fn handle_login(
    mut client: TcpStream,
    peer: SocketAddr,
    cfg: ServerConfig,
    lifecycle: Arc<LifecycleManager>,
    runtime: Arc<ServerRuntime>,
    username: String,
    replay: Vec<u8>,
) {
    info!("player '{username}' logging in to '{}' from {peer}", cfg.id);

    if let Err(e) = lifecycle.ensure_running(&cfg).await {
        warn!("disconnecting {peer}: {e}");
        send_disconnect(&mut client, DISCONNECT_START_FAILED).await;
        return;
    }

    let mut backend = match TcpStream::connect(cfg.internal_addr()).await {
        Ok(x) => x,
        Err(e) => {
            error!("failed to connect backend {}: {e}", cfg.internal_addr());
            send_disconnect(&mut client, DISCONNECT_START_FAILED).await;
            return;
        }
    };
    if let Err(e) = backend.set_nodelay(true) {
        error!("failed to set no_delay for backend: {e}");
        return;
    }

    // Replay the exact bytes read off the wire so far: handshake, login
    // start, and anything the client pipelined behind them. Re-serializing
    // parsed packets would strip client quirks the backend may care about.
    if backend.write_all(&replay).await.is_err() {
        return;
    }

    let session = SessionGuard::open(
        runtime.clone(),
        lifecycle.events().clone(),
        cfg.id.clone(),
        username.clone(),
    );
    // The join count comes from the increment itself, so the usage log sees
    // the same number the runtime does.
    lifecycle.events().emit(Event::PlayerLoginAttempt {
        server_id: cfg.id.clone(),
        username: username.clone(),
        ip: peer.ip(),
        player_count: session.count,
    });

    let (client_reader, client_writer) = client.into_split();
    let (backend_reader, backend_writer) = backend.into_split();

    // Each direction gets its own spawned task so the tokio scheduler
    // can freely interleave them with the accept loop and other connections.
    // When one direction reads EOF it calls shutdown() on its writer,
    // sending FIN to the remote — the opposite task then naturally reads
    // EOF from its side and terminates. No explicit signaling needed.
    let c2s = forward_half(client_reader, backend_writer, FORWARD_BUFFER_SIZE, runtime.clone());
    let s2c = forward_half(backend_reader, client_writer, FORWARD_BUFFER_SIZE, runtime.clone());
    let _ = tokio::join!(c2s, s2c);

    // teardown lives in the guard's Drop
    drop(session);
}

async fn send_disconnect(client: &mut TcpStream, message: &str) {
    let packet = MinecraftPacket::make_raw(LOGIN_DISCONNECT_PACKET_ID, &LoginDisconnectS2CPacket {
        reason: chat_text(message),
    });
    if let Some(packet) = packet {
        let _ = client.write_all(&packet).await;
    }
}

fn status_motd(cfg: &ServerConfig, runtime: &ServerRuntime) -> String {
    if runtime.is_running() {
        cfg.motd.clone()
    } else {
        format!("{} — sleeping", cfg.motd)
    }
}

fn chat_text(message: &str) -> String {
    json!({ "text": message }).to_string()
}
