//! Session service - orchestrates the sandbox lifecycle.
//!
//! The container runtime is the registry: every call re-reads it, and the
//! runtime's name uniqueness is what keeps one container per user.

use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::container::{ContainerConfig, ContainerDetails, ContainerError, ContainerRuntimeApi};
use crate::notify::Notifier;
use crate::token::{ScanLimits, extract_token};
use crate::workspace::WorkspaceProvisioner;

use super::error::{SessionError, SessionResult};
use super::slug::slugify;

/// Default notebook image.
pub const DEFAULT_IMAGE: &str = "jupyter/datascience-notebook";

/// Port the notebook server listens on inside the container.
pub const NOTEBOOK_PORT: &str = "8888/tcp";

/// Where the workspace is bound inside the container.
pub const DEFAULT_MOUNT_PATH: &str = "/home/jovyan/work";

/// Reply when no sandbox container exists.
pub const NO_SESSIONS: &str = "No any interview.";

/// Label carrying the container name of managed sandboxes.
const SESSION_LABEL: &str = "nbsession.session";

/// Session service configuration.
#[derive(Debug, Clone)]
pub struct SessionServiceConfig {
    /// Sandbox image; also the filter for `list` and `stop`.
    pub image: String,
    /// CPUs the sandbox may use.
    pub cpuset_cpus: String,
    /// Memory cap.
    pub memory: String,
    /// Internal port whose host mapping forms the access URL.
    pub internal_port: String,
    /// Workspace mount point inside the container.
    pub mount_path: String,
    /// How long to wait for a container to report running.
    pub ready_timeout: Duration,
    /// Poll interval while waiting for running.
    pub ready_poll_interval: Duration,
    /// Bounds on the token scan.
    pub scan_limits: ScanLimits,
}

impl Default for SessionServiceConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            cpuset_cpus: "0".to_string(),
            memory: "2500M".to_string(),
            internal_port: NOTEBOOK_PORT.to_string(),
            mount_path: DEFAULT_MOUNT_PATH.to_string(),
            ready_timeout: Duration::from_secs(60),
            ready_poll_interval: Duration::from_millis(500),
            scan_limits: ScanLimits::default(),
        }
    }
}

/// Service for managing notebook sandboxes.
#[derive(Clone)]
pub struct SessionService {
    runtime: Arc<dyn ContainerRuntimeApi>,
    provisioner: Arc<WorkspaceProvisioner>,
    notifier: Notifier,
    config: SessionServiceConfig,
}

impl SessionService {
    /// Create a new session service.
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        provisioner: WorkspaceProvisioner,
        notifier: Notifier,
        config: SessionServiceConfig,
    ) -> Self {
        Self {
            runtime,
            provisioner: Arc::new(provisioner),
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &SessionServiceConfig {
        &self.config
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Container name for a user id.
    pub fn container_name(user_id: &str) -> SessionResult<String> {
        let name = slugify(user_id);
        if name.is_empty() {
            return Err(SessionError::InvalidUserId(user_id.to_string()));
        }
        Ok(name)
    }

    /// Names of all sandbox containers, one per line, in any state.
    pub async fn list(&self) -> SessionResult<String> {
        let containers = self
            .runtime
            .list_containers(&self.config.image, true)
            .await?;

        if containers.is_empty() {
            return Ok(NO_SESSIONS.to_string());
        }

        Ok(containers
            .iter()
            .map(|c| c.name())
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Force-remove one user's sandbox, or every sandbox when `user_id` is `None`.
    ///
    /// Produces one `"{name} stopped."` line per removed container.
    pub async fn stop(&self, user_id: Option<&str>) -> SessionResult<String> {
        match user_id {
            Some(user_id) => self.stop_one(user_id).await,
            None => self.stop_all().await,
        }
    }

    async fn stop_one(&self, user_id: &str) -> SessionResult<String> {
        let name = Self::container_name(user_id)?;

        // Same ancestor filter as `list`, so anything listed can be stopped
        let containers = self
            .runtime
            .list_containers(&self.config.image, true)
            .await?;
        if !containers.iter().any(|c| c.name() == name) {
            debug!("no sandbox container named {}", name);
            return Err(SessionError::NotFound(name));
        }

        match self.runtime.remove_container(&name, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Err(SessionError::NotFound(name)),
            Err(e) => return Err(e.into()),
        }

        info!("Stopped session {}", name);
        Ok(format!("{} stopped.\n", name))
    }

    async fn stop_all(&self) -> SessionResult<String> {
        let containers = self
            .runtime
            .list_containers(&self.config.image, true)
            .await?;

        if containers.is_empty() {
            return Ok(NO_SESSIONS.to_string());
        }

        let mut reply = String::new();
        for container in &containers {
            let name = container.name();
            match self.runtime.remove_container(name, true).await {
                Ok(()) => {
                    info!("Stopped session {}", name);
                    reply.push_str(&format!("{} stopped.\n", name));
                }
                Err(e) if e.is_not_found() => {
                    debug!("session {} disappeared before removal", name);
                }
                Err(e) => {
                    warn!("Failed to remove container {}: {}", name, e);
                    reply.push_str(&format!("{} failed to stop: {}\n", name, e));
                }
            }
        }
        Ok(reply)
    }

    /// Start (or reuse) a user's sandbox and deliver its access URL.
    ///
    /// Every failure is reported on the ops channel before it is returned, so
    /// callers running this in the background may drop the error.
    pub async fn start(&self, user_id: &str, hostname: &str) -> SessionResult<String> {
        match self.launch(user_id, hostname).await {
            Ok(url) => Ok(url),
            Err(e) => {
                error!("Failed to start session for {}: {}", user_id, e);
                self.notifier
                    .notify(&format!("Failed to start {}'s session: {}", user_id, e))
                    .await;
                Err(e)
            }
        }
    }

    async fn launch(&self, user_id: &str, hostname: &str) -> SessionResult<String> {
        let name = Self::container_name(user_id)?;

        let details = match self.runtime.get_container(&name).await {
            Ok(details) => {
                info!("Reusing existing container {} for {}", name, user_id);
                details
            }
            Err(e) if e.is_not_found() => self.create(user_id, &name).await?,
            Err(e) => return Err(e.into()),
        };

        let details = self.ensure_running(&name, details).await?;

        let port = details
            .host_port(&self.config.internal_port)
            .ok_or_else(|| SessionError::NoHostPort {
                name: name.clone(),
                port: self.config.internal_port.clone(),
            })?;

        // A restarted container's log still holds the tokens of earlier runs
        let since = details.started_at();
        let token = match self.runtime.stream_logs(&name, since).await {
            Ok(lines) => extract_token(lines, self.config.scan_limits).await,
            Err(e) => {
                warn!("Failed to read logs of {}: {}", name, e);
                None
            }
        };
        if token.is_none() {
            warn!("No access token found for {}, sending URL without one", name);
        }

        let url = access_url(hostname, port, token.as_deref());
        info!("Session {} ready at {}:{}", name, hostname, port);

        self.notifier
            .notify(&format!("{}\n{}", user_id, url))
            .await;
        self.notifier.send_access_email(user_id, &url).await;

        Ok(url)
    }

    /// Provision the workspace and run a fresh container.
    ///
    /// Losing a create race to a concurrent start for the same user is
    /// treated as reuse.
    async fn create(&self, user_id: &str, name: &str) -> SessionResult<ContainerDetails> {
        let provisioner = self.provisioner.clone();
        let owned_user = user_id.to_string();
        let provisioned = tokio::task::spawn_blocking(move || provisioner.provision(&owned_user))
            .await
            .map_err(|e| {
                SessionError::Runtime(ContainerError::CommandFailed {
                    command: "provision".to_string(),
                    message: e.to_string(),
                })
            })??;

        for issue in &provisioned.issues {
            warn!("Workspace issue for {}: {}", user_id, issue);
            self.notifier.notify(&issue.to_string()).await;
        }

        let config = ContainerConfig::new(&self.config.image)
            .name(name)
            .cpuset_cpus(&self.config.cpuset_cpus)
            .memory(&self.config.memory)
            .publish_all(true)
            .volume(
                provisioned.path.to_string_lossy(),
                &self.config.mount_path,
            )
            .label(SESSION_LABEL, name);

        match self.runtime.create_container(&config).await {
            Ok(container_id) => {
                info!("Started container {} for {}", container_id, user_id);
                Ok(self.runtime.get_container(&container_id).await?)
            }
            Err(ContainerError::NameConflict(_)) => {
                info!("Container {} already exists, reusing", name);
                Ok(self.runtime.get_container(name).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Start the container if it is stopped and wait until it reports running.
    async fn ensure_running(
        &self,
        name: &str,
        mut details: ContainerDetails,
    ) -> SessionResult<ContainerDetails> {
        if !details.is_running() && details.state.status.is_startable() {
            debug!("Starting stopped container {}", name);
            self.runtime.start_container(name).await?;
            details = self.runtime.get_container(name).await?;
        }

        let start = tokio::time::Instant::now();
        loop {
            if details.is_running() {
                return Ok(details);
            }

            if start.elapsed() >= self.config.ready_timeout {
                return Err(SessionError::NotReady {
                    name: name.to_string(),
                    timeout: self.config.ready_timeout,
                    state: details.state.status.to_string(),
                });
            }

            tokio::time::sleep(self.config.ready_poll_interval).await;
            details = self.runtime.get_container(name).await?;
        }
    }
}

/// Build the notebook URL; without a token the bare address is used.
pub fn access_url(hostname: &str, port: u16, token: Option<&str>) -> String {
    match token {
        Some(token) => format!("http://{}:{}/?token={}", hostname, port, token),
        None => format!("http://{}:{}/", hostname, port),
    }
}
