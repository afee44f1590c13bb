use std::{
    collections::HashMap, env, io, io::ErrorKind, process::ExitCode, sync::Arc, time::Duration,
};

use log::{error, info, warn};
use simple_logger::SimpleLogger;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::watch,
    time::sleep,
};

use minewake::{
    bedrock::{BedrockListener, SESSION_IDLE_TIMEOUT},
    config::{ConfigError, ConfigStore, Edition, ProxyConfig, ServerConfig},
    docker::{ContainerCtl, DockerCli},
    events::{spawn_notifier, EventBus, UsageLogger},
    java::JavaListener,
    lifecycle::{LifecycleManager, IDLE_TICK_INTERVAL},
};

const CONFIG_FILE: &str = "./config/minewake.yaml";
const CONFIG_RELOAD_INTERVAL: Duration = Duration::from_secs(5);

fn default_config() -> ProxyConfig {
    let default_server = ServerConfig {
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
        motd: "A Minecraft Server".to_string(),
        fake_version: "1.20.4".to_string(),
        fake_protocol: 765,
        max_players: 20,
        favicon_b64: None,
        idle_timeout_s: 300,
        max_startup_wait_s: 120,
    };
    ProxyConfig {
        servers: vec![default_server],
        ..ProxyConfig::default()
    }
}

fn load_or_generate_config() -> Result<ConfigStore, ConfigError> {
    match ConfigStore::load(CONFIG_FILE) {
        Ok(store) => Ok(store),
        Err(ConfigError::Read { ref source, .. }) if source.kind() == ErrorKind::NotFound => {
            info!("config not found, generating a default one at '{CONFIG_FILE}'");
            let store = ConfigStore::from_config(CONFIG_FILE, default_config())?;
            store.persist(&default_config())?;
            Ok(store)
        }
        Err(e) => Err(e),
    }
}

fn check_config() -> Option<()> {
    info!("trying to parse config and exit");
    match ConfigStore::load(CONFIG_FILE) {
        Ok(_) => {
            info!("it's fine! let's try to run");
            Some(())
        }
        Err(e) => {
            error!("there are some errors: {e}");
            None
        }
    }
}

/// Brings the running listeners in line with the config snapshot: one TCP
/// listener per Java server, one UDP listener per RakNet port. A changed
/// entry counts as remove + add.
async fn sync_listeners(
    store: &Arc<ConfigStore>,
    lifecycle: &Arc<LifecycleManager>,
    shutdown: &watch::Receiver<bool>,
    java: &mut HashMap<u16, (ServerConfig, JavaListener)>,
    bedrock: &mut HashMap<u16, (ServerConfig, BedrockListener)>,
    fatal_binds: bool,
) -> Result<(), io::Error> {
    let snapshot = store.snapshot();

    let mut desired_java: HashMap<u16, ServerConfig> = HashMap::new();
    let mut desired_bedrock: HashMap<u16, ServerConfig> = HashMap::new();
    for server in &snapshot.servers {
        if server.edition == Edition::Java {
            desired_java.insert(server.external_port, server.clone());
        }
        if let Some(port) = server.bedrock_listen_port() {
            desired_bedrock.insert(port, server.clone());
        }
    }

    let stale: Vec<u16> = java
        .iter()
        .filter(|(port, (cfg, _))| desired_java.get(port) != Some(cfg))
        .map(|(port, _)| *port)
        .collect();
    for port in stale {
        if let Some((cfg, listener)) = java.remove(&port) {
            info!("closing java listener for '{}' on {port}", cfg.id);
            listener.shutdown();
        }
    }
    let stale: Vec<u16> = bedrock
        .iter()
        .filter(|(port, (cfg, _))| desired_bedrock.get(port) != Some(cfg))
        .map(|(port, _)| *port)
        .collect();
    for port in stale {
        if let Some((cfg, listener)) = bedrock.remove(&port) {
            info!("closing bedrock listener for '{}' on {port}", cfg.id);
            listener.shutdown();
        }
    }

    for (port, cfg) in desired_java {
        if java.contains_key(&port) {
            continue;
        }
        match JavaListener::bind(cfg.clone(), lifecycle.clone(), shutdown.clone()).await {
            Ok(listener) => {
                java.insert(port, (cfg, listener));
            }
            Err(e) => {
                error!("failed to bind tcp port {port}: {e}");
                if fatal_binds {
                    return Err(e);
                }
            }
        }
    }
    for (port, cfg) in desired_bedrock {
        if bedrock.contains_key(&port) {
            continue;
        }
        match BedrockListener::bind(
            cfg.clone(),
            lifecycle.clone(),
            shutdown.clone(),
            SESSION_IDLE_TIMEOUT,
        )
        .await
        {
            Ok(listener) => {
                bedrock.insert(port, (cfg, listener));
            }
            Err(e) => {
                error!("failed to bind udp port {port}: {e}");
                if fatal_binds {
                    return Err(e);
                }
            }
        }
    }

    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    SimpleLogger::new().init().unwrap();

    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("PANIC: {}", panic_info);
        log::error!("panic occurred: {}", panic_info);
    }));

    let mut args = env::args();
    if args.any(|x| &x == "-t") {
        return match check_config() {
            Some(_) => ExitCode::from(0),
            None => ExitCode::from(1),
        };
    }

    info!("minewake version: {} ({})", env!("MINEWAKE_VERSION"), env!("MINEWAKE_HASH"));

    let store = match load_or_generate_config() {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("failed to read config: {e}");
            return ExitCode::from(2);
        }
    };

    let events = EventBus::new();
    spawn_notifier(
        &events,
        Arc::new(UsageLogger::new(store.snapshot().logs_dir.clone())),
    );

    let ctl: Arc<dyn ContainerCtl> = Arc::new(DockerCli::new());
    let lifecycle = LifecycleManager::new(ctl, events);
    let _ticker = lifecycle.spawn_idle_ticker(store.clone(), IDLE_TICK_INTERVAL);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut java = HashMap::new();
    let mut bedrock = HashMap::new();
    if sync_listeners(&store, &lifecycle, &shutdown_rx, &mut java, &mut bedrock, true)
        .await
        .is_err()
    {
        return ExitCode::from(3);
    }
    if java.is_empty() && bedrock.is_empty() {
        warn!("no servers configured, the proxy will idle until some appear in the config");
    }

    // Periodic config reload; listeners follow additions, removals and edits.
    {
        let store = store.clone();
        let lifecycle = lifecycle.clone();
        let reconcile_rx = shutdown_rx.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = sleep(CONFIG_RELOAD_INTERVAL) => {
                        match store.reload() {
                            Ok(true) => info!("configuration changed, reconciling listeners"),
                            Ok(false) => {}
                            Err(e) => warn!("config reload failed, keeping last known good: {e}"),
                        }
                        let _ = sync_listeners(
                            &store,
                            &lifecycle,
                            &reconcile_rx,
                            &mut java,
                            &mut bedrock,
                            false,
                        )
                        .await;
                    }
                }
            }
        });
    }

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(x) => x,
        Err(e) => {
            error!("failed to install SIGTERM handler: {e}");
            return ExitCode::from(1);
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }

    // Stop accepting and give in-flight handlers a moment. Backends are
    // left running; stopping them is the idle reaper's job, not shutdown's.
    info!("shutdown requested, closing listeners");
    let _ = shutdown_tx.send(true);
    sleep(Duration::from_millis(500)).await;
    info!("shutdown");
    ExitCode::from(0)
}
