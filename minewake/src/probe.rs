use std::time::Duration;

use log::debug;
use tokio::{
    net::{TcpStream, UdpSocket},
    time::{sleep, timeout, Instant},
};

use minecraft::{
    packets::{
        HandshakeC2SPacket, StatusRequestC2SPacket, HANDSHAKE_PACKET_ID, NEXT_STATE_STATUS,
        STATUS_REQUEST_PACKET_ID, STATUS_RESPONSE_PACKET_ID,
    },
    raknet,
    serialization::MinecraftStream,
};

use crate::{
    config::{Edition, ServerConfig},
    docker::ContainerCtl,
    lifecycle::StartError,
};

/// Per-attempt budget; backoff between attempts is capped at the same value.
const PROBE_ATTEMPT_CAP: Duration = Duration::from_secs(2);
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Blocks until the backend accepts game traffic or `max_startup_wait_s`
/// elapses. Policy per attempt, short-circuiting on the first success:
/// container health says healthy, else a protocol-level probe (Java status
/// exchange or RakNet unconnected ping) against the internal address.
pub async fn wait_ready(ctl: &dyn ContainerCtl, cfg: &ServerConfig) -> Result<(), StartError> {
    let deadline = Instant::now() + Duration::from_secs(cfg.max_startup_wait_s);
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(StartError::Timeout(cfg.max_startup_wait_s));
        }

        if probe_once(ctl, cfg, PROBE_ATTEMPT_CAP.min(remaining)).await {
            return Ok(());
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(StartError::Timeout(cfg.max_startup_wait_s));
        }
        sleep(backoff.min(remaining)).await;
        backoff = (backoff * 2).min(PROBE_ATTEMPT_CAP);
    }
}

async fn probe_once(ctl: &dyn ContainerCtl, cfg: &ServerConfig, budget: Duration) -> bool {
    match ctl.state(&cfg.container_name).await {
        Ok(status) if status.is_healthy() => return true,
        // not even running yet, the socket cannot be up
        Ok(status) if !status.is_running() => return false,
        Ok(_) => {}
        Err(e) => {
            debug!("inspect of '{}' failed during probe: {e}", cfg.container_name);
            return false;
        }
    }

    let ready = match cfg.edition {
        Edition::Java => probe_java(cfg, budget).await,
        Edition::Bedrock => probe_bedrock(&cfg.internal_addr(), budget).await,
    };
    if !ready {
        debug!("backend '{}' not answering yet", cfg.id);
    }
    ready
}

/// Minimal status exchange: handshake with next_state=1, empty status
/// request, and any response packet counts as ready.
async fn probe_java(cfg: &ServerConfig, budget: Duration) -> bool {
    let attempt = async {
        let mut socket = TcpStream::connect(cfg.internal_addr()).await.ok()?;
        let mut stream = MinecraftStream::new(&mut socket, 512);
        stream
            .write_packet(HANDSHAKE_PACKET_ID, &HandshakeC2SPacket {
                protocol_version: cfg.fake_protocol,
                server_address: cfg.internal_host.clone(),
                server_port: cfg.internal_port,
                next_state: NEXT_STATE_STATUS,
            })
            .await?;
        stream
            .write_packet(STATUS_REQUEST_PACKET_ID, &StatusRequestC2SPacket {})
            .await?;
        let signature = stream.read_signature().await.ok()?;
        (signature.packet_id == STATUS_RESPONSE_PACKET_ID).then_some(())
    };
    matches!(timeout(budget, attempt).await, Ok(Some(())))
}

/// RakNet unconnected ping from an ephemeral socket; a pong with the offline
/// magic counts as ready.
async fn probe_bedrock(addr: &str, budget: Duration) -> bool {
    let attempt = async {
        let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
        socket.connect(addr).await.ok()?;
        let ping = raknet::build_unconnected_ping(0, rand::random());
        socket.send(&ping).await.ok()?;
        let mut buf = [0_u8; 1500];
        let n = socket.recv(&mut buf).await.ok()?;
        raknet::parse_unconnected_pong(&buf[..n]).map(|_| ())
    };
    matches!(timeout(budget, attempt).await, Ok(Some(())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::{
        ContainerError, ContainerHealth, ContainerState, ContainerStatus,
    };
    use async_trait::async_trait;
    use minecraft::packets::StatusResponseS2CPacket;
    use tokio::net::TcpListener;

    struct StaticCtl {
        status: ContainerStatus,
    }

    #[async_trait]
    impl ContainerCtl for StaticCtl {
        async fn start(&self, _container: &str) -> Result<(), ContainerError> {
            Ok(())
        }

        async fn stop(&self, _container: &str, _grace_seconds: u64) -> Result<(), ContainerError> {
            Ok(())
        }

        async fn state(&self, _container: &str) -> Result<ContainerStatus, ContainerError> {
            Ok(self.status)
        }

        async fn exec(&self, _container: &str, _command: &[&str]) -> Result<String, ContainerError> {
            Ok(String::new())
        }
    }

    fn healthy() -> StaticCtl {
        StaticCtl {
            status: ContainerStatus {
                state: ContainerState::Running,
                health: Some(ContainerHealth::Healthy),
            },
        }
    }

    fn running_without_healthcheck() -> StaticCtl {
        StaticCtl {
            status: ContainerStatus {
                state: ContainerState::Running,
                health: None,
            },
        }
    }

    fn config(edition: Edition, internal_port: u16, max_startup_wait_s: u64) -> ServerConfig {
        ServerConfig {
            id: "probe".to_string(),
            name: "Probe".to_string(),
            edition,
            container_name: "mc-probe".to_string(),
            external_port: 25565,
            internal_host: "127.0.0.1".to_string(),
            internal_port,
            bedrock_port: None,
            bedrock_internal_port: None,
            crossplay: false,
            motd: "A server".to_string(),
            fake_version: "1.20.4".to_string(),
            fake_protocol: 765,
            max_players: 20,
            favicon_b64: None,
            idle_timeout_s: 300,
            max_startup_wait_s,
        }
    }

    #[tokio::test]
    async fn healthy_container_short_circuits() {
        // port 1 has no listener; health alone must satisfy the probe
        let cfg = config(Edition::Java, 1, 5);
        assert!(wait_ready(&healthy(), &cfg).await.is_ok());
    }

    #[tokio::test]
    async fn java_probe_accepts_status_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut stream = MinecraftStream::new(&mut socket, 512);
            let handshake = stream.read_packet::<HandshakeC2SPacket>().await.unwrap();
            assert_eq!(handshake.next_state, NEXT_STATE_STATUS);
            let _ = stream.read_packet::<StatusRequestC2SPacket>().await.unwrap();
            stream
                .write_packet(STATUS_RESPONSE_PACKET_ID, &StatusResponseS2CPacket {
                    payload: "{}".to_string(),
                })
                .await
                .unwrap();
        });

        let cfg = config(Edition::Java, port, 5);
        assert!(wait_ready(&running_without_healthcheck(), &cfg).await.is_ok());
    }

    #[tokio::test]
    async fn bedrock_probe_accepts_pong() {
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = backend.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0_u8; 1500];
            let (n, peer) = backend.recv_from(&mut buf).await.unwrap();
            let ping = raknet::parse_unconnected_ping(&buf[..n]).unwrap();
            let pong = raknet::build_unconnected_pong(ping.time, 7, "MCPE;test;");
            backend.send_to(&pong, peer).await.unwrap();
        });

        let cfg = config(Edition::Bedrock, port, 5);
        assert!(wait_ready(&running_without_healthcheck(), &cfg).await.is_ok());
    }

    #[tokio::test]
    async fn silent_backend_times_out() {
        // running container, nothing listening on the internal port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let cfg = config(Edition::Java, port, 1);
        let started = Instant::now();
        assert_eq!(
            wait_ready(&running_without_healthcheck(), &cfg).await,
            Err(StartError::Timeout(1))
        );
        assert!(started.elapsed() >= Duration::from_secs(1));
    }
}
