//! Container runtime management module.
//!
//! Provides an async interface to manage sandbox containers via the Docker or
//! Podman CLI. The runtime is the source of truth for which sessions exist;
//! nothing here caches container state between calls.

mod container;
mod error;

pub use container::{
    Container, ContainerConfig, ContainerDetails, ContainerState, InspectConfig, InspectNetwork,
    InspectState, PortBinding, VolumeMount,
};
pub use error::{ContainerError, ContainerResult};

use container::{parse_container_list, validate_container_name, validate_image_name};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// One raw line of container output, without its trailing newline.
pub type LogLine = std::io::Result<Vec<u8>>;

/// Live, append-only stream of container log lines.
pub type LogStream = BoxStream<'static, LogLine>;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    #[default]
    Docker,
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether this runtime requires SELinux volume labels (:Z suffix).
    pub fn needs_selinux_labels(&self) -> bool {
        match self {
            RuntimeType::Docker => false,
            RuntimeType::Podman => true,
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.default_binary())
    }
}

/// Container runtime abstraction for testability.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create and start a container, returning its ID.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;

    /// Inspect a container by name or ID.
    ///
    /// Fails with [`ContainerError::ContainerNotFound`] when it does not exist.
    async fn get_container(&self, id_or_name: &str) -> ContainerResult<ContainerDetails>;

    /// List containers created from `ancestor`, optionally including stopped ones.
    async fn list_containers(&self, ancestor: &str, all: bool) -> ContainerResult<Vec<Container>>;

    /// Start a created or exited container.
    async fn start_container(&self, id_or_name: &str) -> ContainerResult<()>;

    /// Remove a container; `force` kills it first if it is running.
    async fn remove_container(&self, id_or_name: &str, force: bool) -> ContainerResult<()>;

    /// Follow the container's combined stdout/stderr.
    ///
    /// With `since` (an RFC 3339 timestamp) output written before that time is
    /// skipped; without it the log is replayed from the first run.
    async fn stream_logs(
        &self,
        id_or_name: &str,
        since: Option<&str>,
    ) -> ContainerResult<LogStream>;
}

/// Container runtime client driving the docker/podman binary.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        self.create_container(config).await
    }

    async fn get_container(&self, id_or_name: &str) -> ContainerResult<ContainerDetails> {
        self.get_container(id_or_name).await
    }

    async fn list_containers(&self, ancestor: &str, all: bool) -> ContainerResult<Vec<Container>> {
        self.list_containers(ancestor, all).await
    }

    async fn start_container(&self, id_or_name: &str) -> ContainerResult<()> {
        self.start_container(id_or_name).await
    }

    async fn remove_container(&self, id_or_name: &str, force: bool) -> ContainerResult<()> {
        self.remove_container(id_or_name, force).await
    }

    async fn stream_logs(
        &self,
        id_or_name: &str,
        since: Option<&str>,
    ) -> ContainerResult<LogStream> {
        self.stream_logs(id_or_name, since).await
    }
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Prefers Docker, which is what the notebook images are published for,
    /// and falls back to Podman.
    pub fn new() -> Self {
        if Self::is_binary_available("docker") {
            Self::with_type(RuntimeType::Docker)
        } else if Self::is_binary_available("podman") {
            Self::with_type(RuntimeType::Podman)
        } else {
            // Fall back to docker, will fail at runtime
            Self::with_type(RuntimeType::Docker)
        }
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Check if a binary is available in PATH.
    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run the runtime binary to completion and return stdout.
    async fn run(&self, command: &str, target: &str, args: &[String]) -> ContainerResult<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::from_stderr(command, target, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        let args = ["version".to_string(), "--format".to_string(), "json".to_string()];
        self.run("version", &self.binary, &args).await
    }

    /// Build the argument list for `run`.
    fn run_args(&self, config: &ContainerConfig) -> Vec<String> {
        let mut owned_args: Vec<String> = vec!["run".to_string(), "-d".to_string()];

        if let Some(ref name) = config.name {
            owned_args.push("--name".to_string());
            owned_args.push(name.clone());
        }

        if let Some(ref cpuset) = config.cpuset_cpus {
            owned_args.push("--cpuset-cpus".to_string());
            owned_args.push(cpuset.clone());
        }

        if let Some(ref memory) = config.memory {
            owned_args.push("--memory".to_string());
            owned_args.push(memory.clone());
        }

        if config.publish_all {
            owned_args.push("--publish-all".to_string());
        }

        for volume in &config.volumes {
            owned_args.push("-v".to_string());
            owned_args.push(volume.to_arg(self.runtime_type.needs_selinux_labels()));
        }

        let mut labels: Vec<_> = config.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            owned_args.push("--label".to_string());
            owned_args.push(format!("{}={}", key, value));
        }

        owned_args.push(config.image.clone());
        owned_args
    }

    /// Create and start a new container.
    ///
    /// A name collision surfaces as [`ContainerError::NameConflict`].
    pub async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let target = config.name.clone().unwrap_or_else(|| config.image.clone());
        let stdout = self.run("run", &target, &self.run_args(config)).await?;

        Ok(stdout.trim().to_string())
    }

    /// Inspect a container by ID or name.
    pub async fn get_container(&self, id_or_name: &str) -> ContainerResult<ContainerDetails> {
        validate_container_name(id_or_name)?;

        let args = [
            "container".to_string(),
            "inspect".to_string(),
            id_or_name.to_string(),
        ];
        let stdout = self.run("inspect", id_or_name, &args).await?;

        let containers: Vec<ContainerDetails> =
            serde_json::from_str(&stdout).map_err(|e| ContainerError::ParseError(e.to_string()))?;

        containers
            .into_iter()
            .next()
            .ok_or_else(|| ContainerError::ContainerNotFound(id_or_name.to_string()))
    }

    /// List containers created from an image.
    pub async fn list_containers(
        &self,
        ancestor: &str,
        all: bool,
    ) -> ContainerResult<Vec<Container>> {
        validate_image_name(ancestor)?;

        let mut args = vec![
            "ps".to_string(),
            "--filter".to_string(),
            format!("ancestor={}", ancestor),
            "--format".to_string(),
            "json".to_string(),
        ];

        if all {
            args.push("-a".to_string());
        }

        let stdout = self.run("ps", ancestor, &args).await?;
        parse_container_list(&stdout)
    }

    /// Start a stopped container.
    pub async fn start_container(&self, id_or_name: &str) -> ContainerResult<()> {
        validate_container_name(id_or_name)?;

        let args = ["start".to_string(), id_or_name.to_string()];
        self.run("start", id_or_name, &args).await?;
        Ok(())
    }

    /// Remove a container.
    pub async fn remove_container(&self, id_or_name: &str, force: bool) -> ContainerResult<()> {
        validate_container_name(id_or_name)?;

        let mut args = vec!["rm".to_string()];

        if force {
            args.push("-f".to_string());
        }

        args.push(id_or_name.to_string());

        self.run("rm", id_or_name, &args).await?;
        Ok(())
    }

    /// Follow container logs.
    ///
    /// The runtime writes the container's stdout and stderr to its own stdout
    /// and stderr, so both pipes are read and interleaved line by line. The
    /// `logs` process is killed when the returned stream is dropped.
    pub async fn stream_logs(
        &self,
        id_or_name: &str,
        since: Option<&str>,
    ) -> ContainerResult<LogStream> {
        validate_container_name(id_or_name)?;

        let mut child = Command::new(&self.binary)
            .args(logs_args(id_or_name, since))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ContainerError::CommandFailed {
                command: "logs".to_string(),
                message: e.to_string(),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| ContainerError::CommandFailed {
            command: "logs".to_string(),
            message: "stdout not captured".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ContainerError::CommandFailed {
            command: "logs".to_string(),
            message: "stderr not captured".to_string(),
        })?;

        let lines = stream::select(byte_lines(stdout), byte_lines(stderr));

        Ok(LogFollower {
            lines: lines.boxed(),
            _child: child,
        }
        .boxed())
    }
}

/// Arguments for `logs --follow`, limited to output after `since` when given.
fn logs_args(id_or_name: &str, since: Option<&str>) -> Vec<String> {
    let mut args = vec!["logs".to_string(), "--follow".to_string()];
    if let Some(since) = since {
        args.push("--since".to_string());
        args.push(since.to_string());
    }
    args.push(id_or_name.to_string());
    args
}

/// Split an async reader into newline-delimited byte lines.
pub fn byte_lines<R>(reader: R) -> impl Stream<Item = LogLine> + Send + 'static
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let lines = BufReader::new(reader).split(b'\n');
    stream::unfold(lines, |mut lines| async move {
        match lines.next_segment().await {
            Ok(Some(mut line)) => {
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                Some((Ok(line), lines))
            }
            Ok(None) => None,
            Err(e) => Some((Err(e), lines)),
        }
    })
}

/// Keeps the `logs --follow` process alive for as long as its lines are read.
struct LogFollower {
    lines: LogStream,
    _child: Child,
}

impl Stream for LogFollower {
    type Item = LogLine;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().lines.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_type_selinux() {
        assert!(!RuntimeType::Docker.needs_selinux_labels());
        assert!(RuntimeType::Podman.needs_selinux_labels());
    }

    #[test]
    fn run_args_carry_limits_and_bind() {
        let runtime = ContainerRuntime::with_type(RuntimeType::Docker);
        let config = ContainerConfig::new("jupyter/datascience-notebook")
            .name("alice")
            .cpuset_cpus("0")
            .memory("2500M")
            .publish_all(true)
            .volume("/srv/sandboxes/alice", "/home/jovyan/work");

        let args = runtime.run_args(&config);
        assert_eq!(
            args,
            vec![
                "run",
                "-d",
                "--name",
                "alice",
                "--cpuset-cpus",
                "0",
                "--memory",
                "2500M",
                "--publish-all",
                "-v",
                "/srv/sandboxes/alice:/home/jovyan/work:rw",
                "jupyter/datascience-notebook",
            ]
        );
    }

    #[test]
    fn podman_bind_gets_selinux_label() {
        let runtime = ContainerRuntime::with_binary(RuntimeType::Podman, "/usr/bin/podman");
        let config = ContainerConfig::new("jupyter/datascience-notebook").volume("/srv/a", "/w");
        let args = runtime.run_args(&config);
        assert!(args.contains(&"/srv/a:/w:rw,Z".to_string()));
        assert_eq!(runtime.runtime_type(), RuntimeType::Podman);
    }

    #[test]
    fn logs_args_skip_earlier_runs() {
        assert_eq!(logs_args("alice", None), vec!["logs", "--follow", "alice"]);
        assert_eq!(
            logs_args("alice", Some("2024-05-01T10:00:00.123456789Z")),
            vec![
                "logs",
                "--follow",
                "--since",
                "2024-05-01T10:00:00.123456789Z",
                "alice"
            ]
        );
    }

    #[tokio::test]
    async fn byte_lines_splits_and_strips_newlines() {
        let input: &[u8] = b"first\r\nsecond\nlast-without-newline";
        let lines: Vec<Vec<u8>> = byte_lines(input)
            .map(|line| line.unwrap())
            .collect()
            .await;
        assert_eq!(
            lines,
            vec![
                b"first".to_vec(),
                b"second".to_vec(),
                b"last-without-newline".to_vec()
            ]
        );
    }

    #[tokio::test]
    async fn test_container_runtime_health_check() {
        let runtime = ContainerRuntime::new();
        // Only meaningful where docker or podman is installed
        if let Ok(version) = runtime.health_check().await {
            assert!(!version.is_empty());
        }
    }
}
