//! Test utilities and common setup.

use async_trait::async_trait;
use axum::Router;
use futures::StreamExt;
use futures::stream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use nbsession::api::{self, AppState, SlackState};
use nbsession::container::{
    Container, ContainerConfig, ContainerDetails, ContainerError, ContainerResult,
    ContainerRuntimeApi, ContainerState, InspectConfig, InspectNetwork, InspectState, LogStream,
    PortBinding,
};
use nbsession::dispatch::Dispatcher;
use nbsession::notify::{Notifier, NotifyResult, OpsChannel};
use nbsession::session::{
    DEFAULT_IMAGE, NOTEBOOK_PORT, SessionService, SessionServiceConfig, StartQueue,
};
use nbsession::workspace::{WorkspaceConfig, WorkspacePolicy, WorkspaceProvisioner};

pub const SLASH_TOKEN: &str = "slash-token";
pub const TEAM_ID: &str = "T0001";

/// Token the fake notebook prints at startup.
pub const NOTEBOOK_TOKEN: &str = "0123456789abcdef0123456789abcdef0123456789abcdef";

/// Container runtime kept in memory; every container runs the notebook image.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<Vec<(String, u16)>>,
}

impl FakeRuntime {
    pub fn insert(&self, name: &str) {
        let mut containers = self.containers.lock().unwrap();
        let port = 32768 + containers.len() as u16;
        containers.push((name.to_string(), port));
    }

    pub fn names(&self) -> Vec<String> {
        let containers = self.containers.lock().unwrap();
        containers.iter().map(|(name, _)| name.clone()).collect()
    }

    fn details(name: &str, port: u16) -> ContainerDetails {
        let mut ports = HashMap::new();
        ports.insert(
            NOTEBOOK_PORT.to_string(),
            Some(vec![PortBinding {
                host_ip: "0.0.0.0".to_string(),
                host_port: port.to_string(),
            }]),
        );
        ContainerDetails {
            id: format!("id-{name}"),
            name: format!("/{name}"),
            state: InspectState {
                status: ContainerState::Running,
                running: true,
                started_at: "2024-05-01T10:00:00Z".to_string(),
            },
            config: InspectConfig {
                image: DEFAULT_IMAGE.to_string(),
            },
            network_settings: InspectNetwork { ports },
        }
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        let name = config.name.clone().unwrap_or_default();
        if self.names().contains(&name) {
            return Err(ContainerError::NameConflict(name));
        }
        self.insert(&name);
        Ok(format!("id-{name}"))
    }

    async fn get_container(&self, id_or_name: &str) -> ContainerResult<ContainerDetails> {
        let containers = self.containers.lock().unwrap();
        containers
            .iter()
            .find(|(name, _)| name == id_or_name || format!("id-{name}") == id_or_name)
            .map(|(name, port)| Self::details(name, *port))
            .ok_or_else(|| ContainerError::ContainerNotFound(id_or_name.to_string()))
    }

    async fn list_containers(&self, ancestor: &str, _all: bool) -> ContainerResult<Vec<Container>> {
        if ancestor != DEFAULT_IMAGE {
            return Ok(Vec::new());
        }
        Ok(self
            .names()
            .into_iter()
            .map(|name| Container {
                id: format!("id-{name}"),
                names: vec![name],
                image: DEFAULT_IMAGE.to_string(),
                state: ContainerState::Running,
                status: "Up 1 minute".to_string(),
            })
            .collect())
    }

    async fn start_container(&self, _id_or_name: &str) -> ContainerResult<()> {
        Ok(())
    }

    async fn remove_container(&self, id_or_name: &str, _force: bool) -> ContainerResult<()> {
        let mut containers = self.containers.lock().unwrap();
        let before = containers.len();
        containers.retain(|(name, _)| name != id_or_name);
        if containers.len() == before {
            return Err(ContainerError::ContainerNotFound(id_or_name.to_string()));
        }
        Ok(())
    }

    async fn stream_logs(
        &self,
        _id_or_name: &str,
        _since: Option<&str>,
    ) -> ContainerResult<LogStream> {
        let lines = vec![
            Ok(b"[I NotebookApp] Serving notebooks from local directory".to_vec()),
            Ok(format!("    http://(abc or 127.0.0.1):8888/?token={NOTEBOOK_TOKEN}").into_bytes()),
        ];
        Ok(stream::iter(lines).boxed())
    }
}

/// Ops channel recording every posted message.
#[derive(Default)]
pub struct RecordingChannel {
    messages: Mutex<Vec<String>>,
}

impl RecordingChannel {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    /// Wait until at least `count` messages were posted.
    pub async fn wait_for(&self, count: usize) -> Vec<String> {
        for _ in 0..200 {
            let messages = self.messages();
            if messages.len() >= count {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} ops messages, got {:?}", self.messages());
    }
}

#[async_trait]
impl OpsChannel for RecordingChannel {
    async fn post(&self, text: &str) -> NotifyResult<()> {
        self.messages.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Application under test plus handles on its fakes.
pub struct TestApp {
    pub router: Router,
    pub runtime: Arc<FakeRuntime>,
    pub channel: Arc<RecordingChannel>,
    pub root: TempDir,
}

/// Create a test application answering slash commands from [`TEAM_ID`].
pub fn test_app() -> TestApp {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("exam")).unwrap();
    std::fs::write(root.path().join("exam").join("task.ipynb"), "{}").unwrap();

    let mut workspace = WorkspaceConfig::with_root(root.path());
    workspace.ownership = None;
    let provisioner = WorkspaceProvisioner::new(workspace, WorkspacePolicy::default());

    let runtime = Arc::new(FakeRuntime::default());
    let channel = Arc::new(RecordingChannel::default());
    let notifier = Notifier::new(Some(channel.clone() as Arc<dyn OpsChannel>), None)
        .retry_delay(Duration::from_millis(1));

    let service = SessionService::new(
        runtime.clone(),
        provisioner,
        notifier,
        SessionServiceConfig::default(),
    );
    let queue = Arc::new(StartQueue::spawn(service.clone(), 2, 8));
    let slack = SlackState {
        token: Some(SLASH_TOKEN.to_string()),
        team_id: Some(TEAM_ID.to_string()),
    };
    let state = AppState::new(Dispatcher::new(service, queue), slack, None);

    TestApp {
        router: api::create_router(state),
        runtime,
        channel,
        root,
    }
}

/// Form body of a slash command from the configured team.
pub fn slash_form(text: &str) -> String {
    format!(
        "token={SLASH_TOKEN}&team_id={TEAM_ID}&command=%2Finterview&user_name=ops&text={}",
        text.replace(' ', "+")
    )
}
