use std::{
    collections::HashMap,
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
#[serde(rename_all = "UPPERCASE")]
pub enum Edition {
    Java,
    Bedrock,
}

/// One managed backend: where it listens publicly, which container backs it,
/// and what the synthetic status replies should advertise.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    pub edition: Edition,
    pub container_name: String,
    /// Public port: TCP for Java servers, UDP for Bedrock servers.
    pub external_port: u16,
    pub internal_host: String,
    pub internal_port: u16,
    /// Public UDP port for Bedrock clients of a Java server. Java + crossplay only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bedrock_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bedrock_internal_port: Option<u16>,
    #[serde(default)]
    pub crossplay: bool,
    pub motd: String,
    /// Version string shown in server lists while the proxy answers for a
    /// sleeping backend.
    pub fake_version: String,
    pub fake_protocol: i32,
    #[serde(default = "default_max_players")]
    pub max_players: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon_b64: Option<String>,
    pub idle_timeout_s: u64,
    pub max_startup_wait_s: u64,
}

fn default_max_players() -> u32 {
    20
}

impl ServerConfig {
    pub fn internal_addr(&self) -> String {
        format!("{}:{}", self.internal_host, self.internal_port)
    }

    /// The public UDP port this server answers RakNet on, if any.
    pub fn bedrock_listen_port(&self) -> Option<u16> {
        match self.edition {
            Edition::Bedrock => Some(self.external_port),
            Edition::Java if self.crossplay => self.bedrock_port,
            Edition::Java => None,
        }
    }

    /// Backend address Bedrock datagrams are relayed to, if any.
    pub fn bedrock_backend_addr(&self) -> Option<String> {
        match self.edition {
            Edition::Bedrock => Some(self.internal_addr()),
            Edition::Java if self.crossplay => self
                .bedrock_internal_port
                .map(|port| format!("{}:{}", self.internal_host, port)),
            Edition::Java => None,
        }
    }
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct ProxyConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    /// Delivery settings for notifier subscribers. The proxy core never looks
    /// inside this block, it only hands it to whoever registers on the bus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<serde_yaml::Value>,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("./logs")
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            servers: Vec::new(),
            notifications: None,
            logs_dir: default_logs_dir(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Proto {
    Tcp,
    Udp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => write!(f, "TCP"),
            Proto::Udp => write!(f, "UDP"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("failed to write config file '{path}': {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("duplicate {proto} port {port}: servers '{first}' and '{second}'")]
    DuplicatePort {
        proto: Proto,
        port: u16,
        first: String,
        second: String,
    },

    #[error("server '{id}': {reason}")]
    Invalid { id: String, reason: String },
}

struct Snapshot {
    config: Arc<ProxyConfig>,
    by_port: HashMap<(Proto, u16), usize>,
}

/// Holds the current validated configuration and hands out consistent
/// snapshots. A failed reload keeps the previous snapshot so the proxy
/// continues on the last known good config.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Arc<Snapshot>>,
}

impl ConfigStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<ConfigStore, ConfigError> {
        let path = path.into();
        let snapshot = read_snapshot(&path)?;
        Ok(ConfigStore {
            path,
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Builds a store around an in-memory config without touching the file,
    /// validating it the same way `load` would.
    pub fn from_config(path: impl Into<PathBuf>, config: ProxyConfig) -> Result<ConfigStore, ConfigError> {
        let by_port = build_port_index(&config)?;
        Ok(ConfigStore {
            path: path.into(),
            current: RwLock::new(Arc::new(Snapshot {
                config: Arc::new(config),
                by_port,
            })),
        })
    }

    pub fn snapshot(&self) -> Arc<ProxyConfig> {
        self.current.read().config.clone()
    }

    pub fn lookup_by_external_port(&self, port: u16, proto: Proto) -> Option<ServerConfig> {
        let snapshot = self.current.read();
        let index = *snapshot.by_port.get(&(proto, port))?;
        snapshot.config.servers.get(index).cloned()
    }

    /// Re-reads the config file. Returns whether the active snapshot changed.
    /// On any error the previous snapshot stays in place.
    pub fn reload(&self) -> Result<bool, ConfigError> {
        let snapshot = read_snapshot(&self.path)?;
        let mut current = self.current.write();
        if *current.config == *snapshot.config {
            return Ok(false);
        }
        *current = Arc::new(snapshot);
        Ok(true)
    }

    /// Validates and persists a new config with a write-then-rename so a
    /// crash mid-write never corrupts the file, then swaps the snapshot.
    pub fn persist(&self, config: &ProxyConfig) -> Result<(), ConfigError> {
        let by_port = build_port_index(config)?;
        let yaml = serde_yaml::to_string(config).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        fs::write(&tmp, yaml).map_err(|source| ConfigError::Write {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| ConfigError::Write {
            path: self.path.clone(),
            source,
        })?;

        *self.current.write() = Arc::new(Snapshot {
            config: Arc::new(config.clone()),
            by_port,
        });
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_snapshot(path: &Path) -> Result<Snapshot, ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: ProxyConfig = serde_yaml::from_slice(&bytes).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let by_port = build_port_index(&config)?;
    Ok(Snapshot {
        config: Arc::new(config),
        by_port,
    })
}

/// Validates the config and builds the port lookup index in one pass:
/// globally unique ids, globally unique public ports per protocol, and
/// crossplay fields only on Java servers that opted in.
fn build_port_index(config: &ProxyConfig) -> Result<HashMap<(Proto, u16), usize>, ConfigError> {
    let mut by_port: HashMap<(Proto, u16), usize> = HashMap::new();
    let mut ids: HashMap<&str, usize> = HashMap::new();

    for (index, server) in config.servers.iter().enumerate() {
        if server.id.is_empty() {
            return Err(ConfigError::Invalid {
                id: format!("#{index}"),
                reason: "empty id".to_string(),
            });
        }
        if ids.insert(&server.id, index).is_some() {
            return Err(ConfigError::Invalid {
                id: server.id.clone(),
                reason: "duplicate id".to_string(),
            });
        }

        let mut claims: Vec<(Proto, u16)> = Vec::new();
        match server.edition {
            Edition::Java => {
                claims.push((Proto::Tcp, server.external_port));
                if server.crossplay {
                    let port = server.bedrock_port.ok_or_else(|| ConfigError::Invalid {
                        id: server.id.clone(),
                        reason: "crossplay requires bedrock_port".to_string(),
                    })?;
                    if server.bedrock_internal_port.is_none() {
                        return Err(ConfigError::Invalid {
                            id: server.id.clone(),
                            reason: "crossplay requires bedrock_internal_port".to_string(),
                        });
                    }
                    claims.push((Proto::Udp, port));
                }
            }
            Edition::Bedrock => {
                if server.crossplay
                    || server.bedrock_port.is_some()
                    || server.bedrock_internal_port.is_some()
                {
                    return Err(ConfigError::Invalid {
                        id: server.id.clone(),
                        reason: "crossplay fields only apply to JAVA servers".to_string(),
                    });
                }
                claims.push((Proto::Udp, server.external_port));
            }
        }

        for (proto, port) in claims {
            if let Some(&other) = by_port.get(&(proto, port)) {
                return Err(ConfigError::DuplicatePort {
                    proto,
                    port,
                    first: config.servers[other].id.clone(),
                    second: server.id.clone(),
                });
            }
            by_port.insert((proto, port), index);
        }
    }

    Ok(by_port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn java_server(id: &str, port: u16) -> ServerConfig {
        ServerConfig {
            id: id.to_string(),
            name: id.to_string(),
            edition: Edition::Java,
            container_name: format!("mc-{id}"),
            external_port: port,
            internal_host: "127.0.0.1".to_string(),
            internal_port: port + 1,
            bedrock_port: None,
            bedrock_internal_port: None,
            crossplay: false,
            motd: "A server".to_string(),
            fake_version: "1.20.4".to_string(),
            fake_protocol: 765,
            max_players: 20,
            favicon_b64: None,
            idle_timeout_s: 300,
            max_startup_wait_s: 120,
        }
    }

    fn bedrock_server(id: &str, port: u16) -> ServerConfig {
        ServerConfig {
            edition: Edition::Bedrock,
            ..java_server(id, port)
        }
    }

    fn temp_config_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("minewake-test-{}-{}.yaml", tag, std::process::id()))
    }

    #[test]
    fn duplicate_tcp_ports_rejected() {
        let config = ProxyConfig {
            servers: vec![java_server("a", 25565), java_server("b", 25565)],
            ..ProxyConfig::default()
        };
        assert!(matches!(
            build_port_index(&config),
            Err(ConfigError::DuplicatePort { port: 25565, .. })
        ));
    }

    #[test]
    fn java_and_bedrock_may_share_a_port_number() {
        // same number, different protocols
        let config = ProxyConfig {
            servers: vec![java_server("a", 19132), bedrock_server("b", 19132)],
            ..ProxyConfig::default()
        };
        assert!(build_port_index(&config).is_ok());
    }

    #[test]
    fn crossplay_requires_internal_port() {
        let mut server = java_server("a", 25565);
        server.crossplay = true;
        server.bedrock_port = Some(19132);
        let config = ProxyConfig {
            servers: vec![server],
            ..ProxyConfig::default()
        };
        assert!(matches!(
            build_port_index(&config),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn bedrock_server_with_crossplay_fields_rejected() {
        let mut server = bedrock_server("a", 19132);
        server.bedrock_port = Some(19133);
        let config = ProxyConfig {
            servers: vec![server],
            ..ProxyConfig::default()
        };
        assert!(matches!(
            build_port_index(&config),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn lookup_matches_protocol() {
        let mut crossplay = java_server("cross", 25566);
        crossplay.crossplay = true;
        crossplay.bedrock_port = Some(19133);
        crossplay.bedrock_internal_port = Some(19134);
        let config = ProxyConfig {
            servers: vec![java_server("java", 25565), bedrock_server("bedrock", 19132), crossplay],
            ..ProxyConfig::default()
        };
        let store = ConfigStore::from_config(temp_config_path("lookup"), config).unwrap();

        assert_eq!(
            store.lookup_by_external_port(25565, Proto::Tcp).unwrap().id,
            "java"
        );
        assert!(store.lookup_by_external_port(25565, Proto::Udp).is_none());
        assert_eq!(
            store.lookup_by_external_port(19132, Proto::Udp).unwrap().id,
            "bedrock"
        );
        // a java server's crossplay port answers on UDP
        assert_eq!(
            store.lookup_by_external_port(19133, Proto::Udp).unwrap().id,
            "cross"
        );
        assert!(store.lookup_by_external_port(4242, Proto::Tcp).is_none());
    }

    #[test]
    fn persist_then_reload_roundtrip() {
        let path = temp_config_path("persist");
        let store = ConfigStore::from_config(&path, ProxyConfig::default()).unwrap();

        let config = ProxyConfig {
            servers: vec![java_server("a", 25565)],
            ..ProxyConfig::default()
        };
        store.persist(&config).unwrap();

        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(*reloaded.snapshot(), config);
        assert!(!store.reload().unwrap());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn reload_failure_keeps_last_known_good() {
        let path = temp_config_path("lkg");
        let store = ConfigStore::from_config(&path, ProxyConfig::default()).unwrap();
        let config = ProxyConfig {
            servers: vec![java_server("a", 25565)],
            ..ProxyConfig::default()
        };
        store.persist(&config).unwrap();

        fs::write(&path, "servers: [ nonsense").unwrap();
        assert!(store.reload().is_err());
        assert_eq!(store.snapshot().servers.len(), 1);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn edition_uses_uppercase_names() {
        let yaml = serde_yaml::to_string(&Edition::Bedrock).unwrap();
        assert_eq!(yaml.trim(), "BEDROCK");
        let parsed: Edition = serde_yaml::from_str("JAVA").unwrap();
        assert_eq!(parsed, Edition::Java);
    }
}
