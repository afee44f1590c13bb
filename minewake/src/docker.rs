use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container runtime unreachable: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("docker {command} failed for '{container}': {detail}")]
    CommandFailed {
        command: &'static str,
        container: String,
        detail: String,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ContainerState {
    Absent,
    Created,
    Restarting,
    Running,
    Paused,
    Exited,
    Dead,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ContainerHealth {
    Starting,
    Healthy,
    Unhealthy,
}

#[derive(Clone, Copy, Debug)]
pub struct ContainerStatus {
    pub state: ContainerState,
    /// None when the image defines no health check.
    pub health: Option<ContainerHealth>,
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }

    pub fn is_healthy(&self) -> bool {
        self.health == Some(ContainerHealth::Healthy)
    }
}

/// Narrow seam to the local container runtime. Start acceptance is not game
/// readiness: `start` returns once the runtime has taken the request, the
/// readiness prober decides when traffic can flow.
#[async_trait]
pub trait ContainerCtl: Send + Sync {
    /// Idempotent: starting a running container succeeds without effect.
    async fn start(&self, container: &str) -> Result<(), ContainerError>;

    /// Graceful stop, escalating to kill after `grace_seconds`.
    async fn stop(&self, container: &str, grace_seconds: u64) -> Result<(), ContainerError>;

    async fn state(&self, container: &str) -> Result<ContainerStatus, ContainerError>;

    /// Runs a command inside the container, returning its stdout. Used by
    /// operator tooling, not on the proxy hot path.
    async fn exec(&self, container: &str, command: &[&str]) -> Result<String, ContainerError>;
}

/// `ContainerCtl` over the local `docker` CLI.
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> DockerCli {
        DockerCli {
            binary: "docker".to_string(),
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> DockerCli {
        DockerCli {
            binary: binary.into(),
        }
    }

    async fn run(
        &self,
        command: &'static str,
        container: &str,
        args: &[&str],
    ) -> Result<std::process::Output, ContainerError> {
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(ContainerError::CommandFailed {
                command,
                container: container.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        DockerCli::new()
    }
}

/// Inspect format producing `<state>|<health>`, with health empty for images
/// without a health check.
const INSPECT_FORMAT: &str =
    "{{.State.Status}}|{{if .State.Health}}{{.State.Health.Status}}{{end}}";

#[async_trait]
impl ContainerCtl for DockerCli {
    async fn start(&self, container: &str) -> Result<(), ContainerError> {
        self.run("start", container, &["start", container]).await?;
        Ok(())
    }

    async fn stop(&self, container: &str, grace_seconds: u64) -> Result<(), ContainerError> {
        let grace = grace_seconds.to_string();
        self.run("stop", container, &["stop", "-t", &grace, container])
            .await?;
        Ok(())
    }

    async fn state(&self, container: &str) -> Result<ContainerStatus, ContainerError> {
        let output = Command::new(&self.binary)
            .args(["inspect", "--format", INSPECT_FORMAT, container])
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such object") || stderr.contains("No such container") {
                return Ok(ContainerStatus {
                    state: ContainerState::Absent,
                    health: None,
                });
            }
            return Err(ContainerError::CommandFailed {
                command: "inspect",
                container: container.to_string(),
                detail: stderr.trim().to_string(),
            });
        }
        Ok(parse_inspect_output(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn exec(&self, container: &str, command: &[&str]) -> Result<String, ContainerError> {
        let mut args = vec!["exec", container];
        args.extend_from_slice(command);
        let output = self.run("exec", container, &args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn parse_inspect_output(output: &str) -> ContainerStatus {
    let mut parts = output.trim().splitn(2, '|');
    let state = match parts.next().unwrap_or("") {
        "created" => ContainerState::Created,
        "restarting" => ContainerState::Restarting,
        "running" => ContainerState::Running,
        "paused" => ContainerState::Paused,
        "exited" => ContainerState::Exited,
        "dead" => ContainerState::Dead,
        _ => ContainerState::Absent,
    };
    let health = match parts.next().unwrap_or("") {
        "starting" => Some(ContainerHealth::Starting),
        "healthy" => Some(ContainerHealth::Healthy),
        "unhealthy" => Some(ContainerHealth::Unhealthy),
        _ => None,
    };
    ContainerStatus { state, health }
}
