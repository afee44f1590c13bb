use std::{fs, io::Write as _, net::IpAddr, path::PathBuf, sync::Arc};

use chrono::Utc;
use log::{debug, error, warn};
use serde_json::json;
use tokio::{sync::broadcast, task::JoinHandle};

/// Lifecycle and player events emitted by the proxy core. Names on the wire
/// are stable strings; subscribers (usage log, notifiers) key off them.
#[derive(Clone, Debug)]
pub enum Event {
    ServerStarting { server_id: String },
    ServerReady { server_id: String },
    ServerStartFailed { server_id: String, reason: String },
    ServerStopping { server_id: String },
    ServerStopped { server_id: String, reason: String },
    PlayerLoginAttempt { server_id: String, username: String, ip: IpAddr, player_count: u32 },
    PlayerUnauthorized { server_id: String, username: String, ip: IpAddr },
    /// Bedrock sessions have no username at the RakNet layer, hence the Option.
    PlayerLeave { server_id: String, username: Option<String>, player_count: u32 },
    ProxyError { server_id: Option<String>, detail: String },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::ServerStarting { .. } => "server.starting",
            Event::ServerReady { .. } => "server.ready",
            Event::ServerStartFailed { .. } => "server.start_failed",
            Event::ServerStopping { .. } => "server.stopping",
            Event::ServerStopped { .. } => "server.stopped",
            Event::PlayerLoginAttempt { .. } => "player.login_attempt",
            Event::PlayerUnauthorized { .. } => "player.unauthorized",
            Event::PlayerLeave { .. } => "player.leave",
            Event::ProxyError { .. } => "proxy.error",
        }
    }

    pub fn server_id(&self) -> Option<&str> {
        match self {
            Event::ServerStarting { server_id }
            | Event::ServerReady { server_id }
            | Event::ServerStartFailed { server_id, .. }
            | Event::ServerStopping { server_id }
            | Event::ServerStopped { server_id, .. }
            | Event::PlayerLoginAttempt { server_id, .. }
            | Event::PlayerUnauthorized { server_id, .. }
            | Event::PlayerLeave { server_id, .. } => Some(server_id),
            Event::ProxyError { server_id, .. } => server_id.as_deref(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut value = json!({
            "event": self.name(),
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Some(server_id) = self.server_id() {
            value["server_id"] = json!(server_id);
        }
        match self {
            Event::ServerStartFailed { reason, .. } | Event::ServerStopped { reason, .. } => {
                value["reason"] = json!(reason);
            }
            Event::PlayerLoginAttempt { username, ip, player_count, .. } => {
                value["player"] = json!(username);
                value["ip"] = json!(ip.to_string());
                value["players"] = json!(player_count);
            }
            Event::PlayerUnauthorized { username, ip, .. } => {
                value["player"] = json!(username);
                value["ip"] = json!(ip.to_string());
            }
            Event::PlayerLeave { username, player_count, .. } => {
                if let Some(username) = username {
                    value["player"] = json!(username);
                }
                value["players"] = json!(player_count);
            }
            Event::ProxyError { detail, .. } => {
                value["detail"] = json!(detail);
            }
            _ => {}
        }
        value
    }
}

/// How many events the fan-out ring holds. A subscriber that falls further
/// behind loses the oldest events and is told how many.
pub const EVENT_BUFFER: usize = 256;

/// Non-blocking fan-out of proxy events. `emit` never waits: delivery rides
/// on a broadcast ring, so a stuck subscriber can only lose its own events,
/// never stall a forwarder.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> EventBus {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        EventBus { tx }
    }

    pub fn emit(&self, event: Event) {
        debug!("event {}: {:?}", event.name(), event);
        // Err means nobody is subscribed, which is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}

/// Anything that wants proxy events: log writers, mail/push bridges, metrics.
/// Implementations must not block for long; they run on the dispatch task.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &Event);
}

/// Feeds one subscriber from the bus on its own task.
pub fn spawn_notifier(bus: &EventBus, notifier: Arc<dyn Notifier>) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => notifier.notify(&event),
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    warn!("event subscriber lagging, dropped {dropped} oldest events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Appends every event to a daily `usage-YYYY-MM-DD.log` JSON-lines file for
/// the operator view.
pub struct UsageLogger {
    dir: PathBuf,
}

impl UsageLogger {
    pub fn new(dir: impl Into<PathBuf>) -> UsageLogger {
        UsageLogger { dir: dir.into() }
    }

    fn today_path(&self) -> PathBuf {
        self.dir
            .join(format!("usage-{}.log", Utc::now().format("%Y-%m-%d")))
    }

    fn append(&self, event: &Event) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.today_path())?;
        writeln!(file, "{}", event.to_json())?;
        Ok(())
    }
}

impl Notifier for UsageLogger {
    fn notify(&self, event: &Event) {
        if let Err(e) = self.append(event) {
            error!("failed to write usage log: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn login_event(n: u32) -> Event {
        Event::PlayerLoginAttempt {
            server_id: "vanilla".to_string(),
            username: format!("player{n}"),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            player_count: 1,
        }
    }

    #[test]
    fn stable_event_names() {
        assert_eq!(
            Event::ServerStarting { server_id: "a".into() }.name(),
            "server.starting"
        );
        assert_eq!(
            Event::ServerStartFailed { server_id: "a".into(), reason: "x".into() }.name(),
            "server.start_failed"
        );
        assert_eq!(login_event(0).name(), "player.login_attempt");
    }

    #[test]
    fn json_carries_server_id_and_fields() {
        let value = login_event(7).to_json();
        assert_eq!(value["event"], "player.login_attempt");
        assert_eq!(value["server_id"], "vanilla");
        assert_eq!(value["player"], "player7");
        assert_eq!(value["ip"], "127.0.0.1");
        assert_eq!(value["players"], 1);
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn leave_without_username_still_carries_count() {
        let value = Event::PlayerLeave {
            server_id: "vanilla".to_string(),
            username: None,
            player_count: 0,
        }
        .to_json();
        assert_eq!(value["event"], "player.leave");
        assert_eq!(value["players"], 0);
        assert!(value["player"].is_null());
    }

    #[tokio::test]
    async fn emit_without_subscribers_does_not_block() {
        let bus = EventBus::new();
        for n in 0..(EVENT_BUFFER as u32 * 2) {
            bus.emit(login_event(n));
        }
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_with_counter() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for n in 0..(EVENT_BUFFER as u32 + 10) {
            bus.emit(login_event(n));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(dropped)) => assert_eq!(dropped, 10),
            other => panic!("expected lag, got {other:?}"),
        }
        // after the lag report the subscriber resumes at the oldest retained event
        match rx.recv().await {
            Ok(Event::PlayerLoginAttempt { username, .. }) => assert_eq!(username, "player10"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn usage_logger_appends_json_lines() {
        let dir = std::env::temp_dir().join(format!("minewake-usage-{}", std::process::id()));
        let logger = UsageLogger::new(&dir);
        logger.notify(&login_event(1));
        logger.notify(&Event::ServerStopped {
            server_id: "vanilla".to_string(),
            reason: "idle_timeout".to_string(),
        });

        let content = fs::read_to_string(logger.today_path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "player.login_attempt");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["reason"], "idle_timeout");

        let _ = fs::remove_dir_all(&dir);
    }
}
