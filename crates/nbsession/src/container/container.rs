//! Container types and configuration.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

use super::error::{ContainerError, ContainerResult};

/// Deserialize container names that are either a list (podman) or a single
/// comma separated string (docker).
fn deserialize_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, SeqAccess, Visitor};
    use std::fmt;

    struct NamesVisitor;

    impl<'de> Visitor<'de> for NamesVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a list of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect())
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut names = Vec::new();
            while let Some(name) = seq.next_element::<String>()? {
                names.push(name);
            }
            Ok(names)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Vec::new())
        }
    }

    deserializer.deserialize_any(NamesVisitor)
}

/// Volume mount configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Path on the host.
    pub host_path: String,
    /// Path inside the container.
    pub container_path: String,
    /// Mount read-only instead of read-write.
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeMount {
    /// Render the `-v` argument for the runtime CLI.
    pub fn to_arg(&self, selinux_label: bool) -> String {
        let mut opts = vec![if self.read_only { "ro" } else { "rw" }];
        if selinux_label {
            opts.push("Z");
        }
        format!(
            "{}:{}:{}",
            self.host_path,
            self.container_path,
            opts.join(",")
        )
    }
}

/// Configuration for creating a new container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name.
    pub name: Option<String>,
    /// Docker/OCI image to use.
    pub image: String,
    /// CPUs the container may run on (e.g. "0" or "0-3").
    pub cpuset_cpus: Option<String>,
    /// Memory cap (e.g. "2500M").
    pub memory: Option<String>,
    /// Publish every exposed port on a random host port.
    pub publish_all: bool,
    /// Volume mounts.
    pub volumes: Vec<VolumeMount>,
    /// Labels for the container.
    pub labels: HashMap<String, String>,
}

impl ContainerConfig {
    /// Create a new container config with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all container configuration fields.
    ///
    /// Arguments are passed to the runtime binary verbatim, so everything is
    /// checked before a process is spawned.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        if let Some(ref cpuset) = self.cpuset_cpus {
            validate_cpuset(cpuset)?;
        }

        if let Some(ref memory) = self.memory {
            validate_memory(memory)?;
        }

        for volume in &self.volumes {
            validate_volume_path(&volume.host_path, "host")?;
            validate_container_path(&volume.container_path)?;
        }

        Ok(())
    }

    /// Set the container name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Pin the container to a CPU set.
    pub fn cpuset_cpus(mut self, cpuset: impl Into<String>) -> Self {
        self.cpuset_cpus = Some(cpuset.into());
        self
    }

    /// Cap the container's memory.
    pub fn memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = Some(memory.into());
        self
    }

    /// Publish all exposed ports on random host ports.
    pub fn publish_all(mut self, publish_all: bool) -> Self {
        self.publish_all = publish_all;
        self
    }

    /// Add a read-write volume mount.
    pub fn volume(
        mut self,
        host_path: impl Into<String>,
        container_path: impl Into<String>,
    ) -> Self {
        self.volumes.push(VolumeMount {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        });
        self
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Container state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Container is being created.
    Created,
    /// Container is running.
    Running,
    /// Container is paused.
    Paused,
    /// Container is restarting.
    Restarting,
    /// Container is being removed.
    Removing,
    /// Container has exited.
    Exited,
    /// Container is dead.
    Dead,
    /// Unknown state.
    #[default]
    #[serde(other)]
    Unknown,
}

impl ContainerState {
    /// Whether the runtime can `start` a container in this state.
    pub fn is_startable(&self) -> bool {
        matches!(self, ContainerState::Created | ContainerState::Exited)
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Paused => write!(f, "paused"),
            ContainerState::Restarting => write!(f, "restarting"),
            ContainerState::Removing => write!(f, "removing"),
            ContainerState::Exited => write!(f, "exited"),
            ContainerState::Dead => write!(f, "dead"),
            ContainerState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Container summary from `ps`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Container {
    /// Container ID.
    #[serde(alias = "ID")]
    pub id: String,

    /// Container names.
    #[serde(default, deserialize_with = "deserialize_names")]
    pub names: Vec<String>,

    /// Image used.
    #[serde(default)]
    pub image: String,

    /// Container state.
    #[serde(default)]
    pub state: ContainerState,

    /// Status string (e.g., "Up 5 minutes").
    #[serde(default)]
    pub status: String,
}

impl Container {
    /// Primary name of the container, without docker's leading slash.
    pub fn name(&self) -> &str {
        self.names
            .first()
            .map(|name| name.trim_start_matches('/'))
            .unwrap_or(self.id.as_str())
    }
}

/// Parse `ps --format json` output.
///
/// Podman prints a single JSON array while docker prints one object per line.
pub(crate) fn parse_container_list(stdout: &str) -> ContainerResult<Vec<Container>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|e| ContainerError::ParseError(e.to_string()));
    }

    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<Container>(line)
                .map_err(|e| ContainerError::ParseError(e.to_string()))
        })
        .collect()
}

/// Host side of a published port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortBinding {
    /// Host IP.
    #[serde(default, rename = "HostIp")]
    pub host_ip: String,
    /// Host port, as reported by the runtime.
    #[serde(default, rename = "HostPort")]
    pub host_port: String,
}

/// State block from `inspect`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectState {
    #[serde(default)]
    pub status: ContainerState,
    #[serde(default)]
    pub running: bool,
    /// RFC 3339 time of the latest start; the zero time before the first.
    #[serde(default)]
    pub started_at: String,
}

/// Config block from `inspect`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectConfig {
    #[serde(default)]
    pub image: String,
}

/// Network block from `inspect`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectNetwork {
    /// Port table keyed by internal port (e.g. "8888/tcp").
    #[serde(default)]
    pub ports: HashMap<String, Option<Vec<PortBinding>>>,
}

/// Detailed container information from `inspect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerDetails {
    #[serde(alias = "ID")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: InspectState,
    #[serde(default)]
    pub config: InspectConfig,
    #[serde(default)]
    pub network_settings: InspectNetwork,
}

impl ContainerDetails {
    /// Container name without docker's leading slash.
    pub fn name(&self) -> &str {
        self.name.trim_start_matches('/')
    }

    /// Whether the container's process is up.
    pub fn is_running(&self) -> bool {
        self.state.running || self.state.status == ContainerState::Running
    }

    /// When the current run began, if the container was ever started.
    pub fn started_at(&self) -> Option<&str> {
        let started_at = self.state.started_at.as_str();
        if started_at.is_empty() || started_at.starts_with("0001-01-01") {
            return None;
        }
        Some(started_at)
    }

    /// Host port mapped to `internal_port` (e.g. "8888/tcp"), if published.
    pub fn host_port(&self, internal_port: &str) -> Option<u16> {
        self.network_settings
            .ports
            .get(internal_port)?
            .as_ref()?
            .iter()
            .find_map(|binding| binding.host_port.parse().ok())
    }
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate a Docker/OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '/'
            || c == ':'
            || c == '@'
    };

    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters; only alphanumeric, '.', '-', '_', '/', ':', '@' are allowed",
            image
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container name or ID.
///
/// Names must start with an alphanumeric character or underscore and contain
/// only alphanumerics, hyphens and underscores.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    let Some(first_char) = name.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    };

    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }

    if !first_char.is_ascii_alphanumeric() && first_char != '_' {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{}' contains invalid characters; only alphanumeric, '-', '_' are allowed",
            name
        )));
    }

    Ok(())
}

/// Validate a cpuset list such as `0`, `0,2` or `0-3`.
fn validate_cpuset(cpuset: &str) -> ContainerResult<()> {
    let valid = !cpuset.is_empty()
        && cpuset
            .chars()
            .all(|c| c.is_ascii_digit() || c == ',' || c == '-');
    if !valid {
        return Err(ContainerError::InvalidInput(format!(
            "cpuset '{}' must contain only digits, ',' and '-'",
            cpuset
        )));
    }
    Ok(())
}

/// Validate a memory limit such as `2500M` or `2g`.
fn validate_memory(memory: &str) -> ContainerResult<()> {
    let digits = memory.trim_end_matches(|c: char| matches!(c, 'b' | 'k' | 'm' | 'g' | 'B' | 'K' | 'M' | 'G'));
    if digits.is_empty() || memory.len() - digits.len() > 1 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ContainerError::InvalidInput(format!(
            "memory limit '{}' must be a number with an optional b/k/m/g suffix",
            memory
        )));
    }
    Ok(())
}

/// Validate a host volume path.
fn validate_volume_path(path: &str, side: &str) -> ContainerResult<()> {
    if path.is_empty() {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path cannot be empty",
            side
        )));
    }

    if path.len() > 4096 {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path exceeds maximum length of 4096 characters",
            side
        )));
    }

    if path.contains('\0') {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path cannot contain null bytes",
            side
        )));
    }

    // ':' would split the -v argument
    let dangerous_chars = [
        ':', '$', '`', '!', '&', '|', ';', '<', '>', '(', ')', '{', '}', '[', ']', '*', '?', '\\',
        '"', '\'', '\n', '\r',
    ];
    for c in dangerous_chars.iter() {
        if path.contains(*c) {
            return Err(ContainerError::InvalidInput(format!(
                "{} volume path contains dangerous character '{}'",
                side, c
            )));
        }
    }

    Ok(())
}

/// Validate a container-internal path.
fn validate_container_path(path: &str) -> ContainerResult<()> {
    if path.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container path cannot be empty".to_string(),
        ));
    }

    if !path.starts_with('/') {
        return Err(ContainerError::InvalidInput(
            "container path must be absolute (start with '/')".to_string(),
        ));
    }

    if path.contains('\0') || path.contains(':') {
        return Err(ContainerError::InvalidInput(
            "container path cannot contain null bytes or ':'".to_string(),
        ));
    }

    Ok(())
}


#[cfg(test)]
mod parse_tests {
    use super::*;

    #[test]
    fn parses_docker_ndjson_listing() {
        let stdout = concat!(
            r#"{"ID":"aaa","Image":"jupyter/datascience-notebook","Names":"alice","State":"running","Status":"Up 2 minutes"}"#,
            "\n",
            r#"{"ID":"bbb","Image":"jupyter/datascience-notebook","Names":"bob","State":"exited","Status":"Exited (0)"}"#,
            "\n"
        );
        let containers = parse_container_list(stdout).unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name(), "alice");
        assert_eq!(containers[0].state, ContainerState::Running);
        assert_eq!(containers[1].name(), "bob");
        assert_eq!(containers[1].state, ContainerState::Exited);
    }

    #[test]
    fn parses_podman_array_listing() {
        let stdout = r#"[{"Id":"ccc","Image":"docker.io/jupyter/datascience-notebook:latest","Names":["carol"],"State":"created"}]"#;
        let containers = parse_container_list(stdout).unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name(), "carol");
        assert!(containers[0].state.is_startable());
    }

    #[test]
    fn empty_listing_is_empty() {
        assert!(parse_container_list("  \n").unwrap().is_empty());
        assert!(parse_container_list("[]").unwrap().is_empty());
    }

    #[test]
    fn inspect_exposes_host_port() {
        let stdout = r#"[{
            "Id": "abc",
            "Name": "/alice",
            "State": {
                "Status": "running",
                "Running": true,
                "StartedAt": "2024-05-01T10:00:00.123456789Z"
            },
            "Config": {"Image": "jupyter/datascience-notebook"},
            "NetworkSettings": {"Ports": {
                "8888/tcp": [{"HostIp": "0.0.0.0", "HostPort": "32768"}],
                "9999/tcp": null
            }}
        }]"#;
        let details: Vec<ContainerDetails> = serde_json::from_str(stdout).unwrap();
        let details = &details[0];
        assert_eq!(details.name(), "alice");
        assert!(details.is_running());
        assert_eq!(details.host_port("8888/tcp"), Some(32768));
        assert_eq!(details.host_port("9999/tcp"), None);
        assert_eq!(details.host_port("1234/tcp"), None);
        assert_eq!(details.started_at(), Some("2024-05-01T10:00:00.123456789Z"));
    }

    #[test]
    fn never_started_container_has_no_start_time() {
        let stdout = r#"{
            "Id": "abc",
            "Name": "/bob",
            "State": {"Status": "created", "Running": false, "StartedAt": "0001-01-01T00:00:00Z"}
        }"#;
        let details: ContainerDetails = serde_json::from_str(stdout).unwrap();
        assert_eq!(details.started_at(), None);
    }
}
