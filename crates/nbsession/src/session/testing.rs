//! In-memory container runtime for controller and queue tests.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::Semaphore;

use crate::container::{
    Container, ContainerConfig, ContainerDetails, ContainerError, ContainerResult,
    ContainerRuntimeApi, ContainerState, InspectConfig, InspectNetwork, InspectState, LogStream,
    PortBinding,
};

use super::service::NOTEBOOK_PORT;

#[derive(Debug, Clone)]
struct FakeContainer {
    id: String,
    name: String,
    image: String,
    /// Image `image` was built from, matched by the ancestor filter.
    base_image: Option<String>,
    state: ContainerState,
    port: u16,
    /// Number of times the container was started.
    runs: u32,
    /// Log lines tagged with the run that wrote them.
    log: Vec<(u32, String)>,
}

/// Start time the fake reports for a run; ordered the same way as the runs.
fn run_started_at(run: u32) -> String {
    if run == 0 {
        return "0001-01-01T00:00:00Z".to_string();
    }
    format!("2024-05-01T10:{:02}:00Z", run)
}

impl FakeContainer {
    fn details(&self) -> ContainerDetails {
        let mut ports = HashMap::new();
        ports.insert(
            NOTEBOOK_PORT.to_string(),
            Some(vec![PortBinding {
                host_ip: "0.0.0.0".to_string(),
                host_port: self.port.to_string(),
            }]),
        );
        ContainerDetails {
            id: self.id.clone(),
            name: format!("/{}", self.name),
            state: InspectState {
                status: self.state,
                running: self.state == ContainerState::Running,
                started_at: run_started_at(self.runs),
            },
            config: InspectConfig {
                image: self.image.clone(),
            },
            network_settings: InspectNetwork { ports },
        }
    }
}

#[derive(Default)]
struct Inner {
    containers: Vec<FakeContainer>,
    created: Vec<ContainerConfig>,
    started: Vec<String>,
    removed: Vec<(String, bool)>,
    next_port: u16,
    next_id: u64,
    log_since: Vec<Option<String>>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Runtime fake keyed by container name, assigning host ports from 32768.
pub struct FakeRuntime {
    image: String,
    inner: Mutex<Inner>,
    log_lines: Vec<String>,
    conflict_on_create: bool,
    fail_create: Option<String>,
    gate: Option<Arc<Semaphore>>,
}

impl FakeRuntime {
    pub fn new(image: &str) -> Self {
        Self {
            image: image.to_string(),
            inner: Mutex::new(Inner {
                next_port: 32768,
                ..Inner::default()
            }),
            log_lines: Vec::new(),
            conflict_on_create: false,
            fail_create: None,
            gate: None,
        }
    }

    /// Lines every container's log stream yields.
    pub fn log_lines<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.log_lines = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Simulate losing the create race: a container with the requested name
    /// appears and create reports a name conflict.
    pub fn conflict_on_create(mut self) -> Self {
        self.conflict_on_create = true;
        self
    }

    pub fn fail_create(mut self, message: &str) -> Self {
        self.fail_create = Some(message.to_string());
        self
    }

    /// Block every log stream until a permit is available.
    pub fn gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// The configured log lines as written by `run`.
    fn run_log(&self, run: u32) -> Vec<(u32, String)> {
        self.log_lines.iter().map(|line| (run, line.clone())).collect()
    }

    fn push(&self, inner: &mut Inner, container: FakeContainer) {
        inner.next_id += 1;
        inner.containers.push(FakeContainer {
            id: format!("{:012x}", inner.next_id),
            ..container
        });
    }

    fn container(
        &self,
        name: &str,
        image: &str,
        state: ContainerState,
        port: u16,
    ) -> FakeContainer {
        FakeContainer {
            id: String::new(),
            name: name.to_string(),
            image: image.to_string(),
            base_image: None,
            state,
            port,
            runs: 1,
            log: self.run_log(1),
        }
    }

    /// Add a sandbox container that has run once.
    pub fn insert(&self, name: &str, state: ContainerState, port: u16) {
        let container = self.container(name, &self.image, state, port);
        self.push(&mut self.inner.lock().unwrap(), container);
    }

    /// Add a sandbox container whose earlier run logged `lines`.
    pub fn insert_with_log<I, S>(&self, name: &str, state: ContainerState, port: u16, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut container = self.container(name, &self.image, state, port);
        container.log = lines.into_iter().map(|line| (1, line.into())).collect();
        self.push(&mut self.inner.lock().unwrap(), container);
    }

    /// Add a sandbox container running an image built on the sandbox image.
    pub fn insert_derived(&self, name: &str, image: &str) {
        let mut container = self.container(name, image, ContainerState::Running, 5000);
        container.base_image = Some(self.image.clone());
        self.push(&mut self.inner.lock().unwrap(), container);
    }

    /// Add a running container from some other image.
    pub fn insert_foreign(&self, name: &str, image: &str) {
        let mut container = self.container(name, image, ContainerState::Running, 5432);
        container.log.clear();
        self.push(&mut self.inner.lock().unwrap(), container);
    }

    pub fn created(&self) -> Vec<ContainerConfig> {
        self.inner.lock().unwrap().created.clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.inner.lock().unwrap().started.clone()
    }

    pub fn removed(&self) -> Vec<(String, bool)> {
        self.inner.lock().unwrap().removed.clone()
    }

    /// `since` of every log stream opened, in order.
    pub fn log_since(&self) -> Vec<Option<String>> {
        self.inner.lock().unwrap().log_since.clone()
    }

    /// Highest number of log streams open at once.
    pub fn max_in_flight(&self) -> usize {
        self.inner.lock().unwrap().max_in_flight
    }

    fn find<'a>(inner: &'a mut Inner, id_or_name: &str) -> Option<&'a mut FakeContainer> {
        inner
            .containers
            .iter_mut()
            .find(|c| c.name == id_or_name || c.id == id_or_name)
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;
        if let Some(message) = &self.fail_create {
            return Err(ContainerError::CommandFailed {
                command: "run".to_string(),
                message: message.clone(),
            });
        }

        let name = config.name.clone().unwrap_or_default();
        let mut inner = self.inner.lock().unwrap();
        let port = inner.next_port;

        if self.conflict_on_create {
            inner.next_port += 1;
            let container = self.container(&name, &config.image, ContainerState::Running, port);
            self.push(&mut inner, container);
            return Err(ContainerError::NameConflict(name));
        }
        if Self::find(&mut inner, &name).is_some() {
            return Err(ContainerError::NameConflict(name));
        }

        inner.next_port += 1;
        inner.created.push(config.clone());
        let container = self.container(&name, &config.image, ContainerState::Running, port);
        self.push(&mut inner, container);
        Ok(inner.containers.last().map(|c| c.id.clone()).unwrap_or_default())
    }

    async fn get_container(&self, id_or_name: &str) -> ContainerResult<ContainerDetails> {
        let mut inner = self.inner.lock().unwrap();
        Self::find(&mut inner, id_or_name)
            .map(|c| c.details())
            .ok_or_else(|| ContainerError::ContainerNotFound(id_or_name.to_string()))
    }

    async fn list_containers(&self, ancestor: &str, all: bool) -> ContainerResult<Vec<Container>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .containers
            .iter()
            .filter(|c| c.image == ancestor || c.base_image.as_deref() == Some(ancestor))
            .filter(|c| all || c.state == ContainerState::Running)
            .map(|c| Container {
                id: c.id.clone(),
                names: vec![c.name.clone()],
                image: c.image.clone(),
                state: c.state,
                status: String::new(),
            })
            .collect())
    }

    async fn start_container(&self, id_or_name: &str) -> ContainerResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let container = Self::find(&mut inner, id_or_name)
            .ok_or_else(|| ContainerError::ContainerNotFound(id_or_name.to_string()))?;
        container.state = ContainerState::Running;
        container.runs += 1;
        let run = container.runs;
        container.log.extend(self.run_log(run));
        inner.started.push(id_or_name.to_string());
        Ok(())
    }

    async fn remove_container(&self, id_or_name: &str, force: bool) -> ContainerResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.containers.len();
        inner
            .containers
            .retain(|c| c.name != id_or_name && c.id != id_or_name);
        if inner.containers.len() == before {
            return Err(ContainerError::ContainerNotFound(id_or_name.to_string()));
        }
        inner.removed.push((id_or_name.to_string(), force));
        Ok(())
    }

    async fn stream_logs(
        &self,
        id_or_name: &str,
        since: Option<&str>,
    ) -> ContainerResult<LogStream> {
        let log = {
            let mut inner = self.inner.lock().unwrap();
            let container = Self::find(&mut inner, id_or_name)
                .ok_or_else(|| ContainerError::ContainerNotFound(id_or_name.to_string()))?;
            let log: Vec<std::io::Result<Vec<u8>>> = container
                .log
                .iter()
                .filter(|(run, _)| since.is_none_or(|ts| run_started_at(*run).as_str() >= ts))
                .map(|(_, line)| Ok(line.clone().into_bytes()))
                .collect();
            inner.log_since.push(since.map(str::to_string));
            inner.in_flight += 1;
            inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
            log
        };
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.inner.lock().unwrap().in_flight -= 1;

        Ok(stream::iter(log).boxed())
    }
}
