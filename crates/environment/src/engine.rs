//! Container engine abstraction.
//!
//! The build environments drive exactly one container per build through this
//! trait. The production implementation is [`DockerEngine`], backed by the
//! `bollard` crate; [`MockEngine`] scripts responses for tests so the whole
//! lifecycle runs without a Docker daemon.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;

use docbuild_core::{Error, Result};

/// Everything needed to create one build container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name; also used as its hostname.
    pub name: String,
    pub image: String,
    /// Shell command the container runs as PID 1 (the dead-man switch).
    pub command: String,
    pub user: String,
    /// Host-path -> container-path read-write binds.
    pub binds: Vec<(String, String)>,
    pub memory_limit_bytes: i64,
}

/// Snapshot of a container's reported state.
#[derive(Debug, Clone, Default)]
pub struct ContainerState {
    pub running: bool,
    pub exit_code: Option<i64>,
    pub oom_killed: bool,
    /// Engine-reported error string, if any.
    pub error: Option<String>,
}

/// Raw result of one exec session: merged output bytes plus exit code.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub output: Vec<u8>,
    pub exit_code: i64,
}

/// Blocking-style container engine operations, one build container at a time.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create a container; returns the engine-assigned container id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, name: &str) -> Result<()>;

    /// Run an exec session in a running container and wait for it, returning
    /// merged stdout+stderr and the exit code.
    async fn exec(
        &self,
        name: &str,
        argv: Vec<String>,
        environment: &HashMap<String, String>,
        user: &str,
        workdir: &str,
    ) -> Result<ExecOutcome>;

    /// Inspect the container's state; `Ok(None)` when it does not exist.
    async fn state(&self, name: &str) -> Result<Option<ContainerState>>;

    async fn kill(&self, name: &str) -> Result<()>;

    async fn remove(&self, name: &str) -> Result<()>;

    /// Digest of an image, for build metadata.
    async fn image_digest(&self, image: &str) -> Result<String>;
}

// =============================================================================
// Docker implementation
// =============================================================================

/// Docker engine client backed by `bollard`.
pub struct DockerEngine {
    docker: bollard::Docker,
}

impl DockerEngine {
    /// Connect to the engine at `socket` (`unix://...` or `http(s)://...`).
    pub fn connect(socket: &str) -> Result<Self> {
        let docker = if let Some(path) = socket.strip_prefix("unix://") {
            bollard::Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
        } else if socket.starts_with("http://") || socket.starts_with("https://") {
            bollard::Docker::connect_with_http(socket, 120, bollard::API_DEFAULT_VERSION)
        } else {
            bollard::Docker::connect_with_local_defaults()
        }
        .map_err(|e| Error::EngineConnection(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Wrap an existing bollard client (for tests against a live daemon).
    pub fn from_client(docker: bollard::Docker) -> Self {
        Self { docker }
    }
}

fn map_engine_error(err: bollard::errors::Error) -> Error {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => Error::ContainerNotFound,
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => Error::Engine(format!("{status_code}: {message}")),
        other => Error::EngineConnection(other.to_string()),
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        use bollard::container::{Config, CreateContainerOptions};
        use bollard::models::HostConfig;

        let host_config = HostConfig {
            binds: Some(
                spec.binds
                    .iter()
                    .map(|(host, container)| format!("{host}:{container}:rw"))
                    .collect(),
            ),
            memory: Some(spec.memory_limit_bytes),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                spec.command.clone(),
            ]),
            hostname: Some(spec.name.clone()),
            user: Some(spec.user.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(map_engine_error)?;
        Ok(response.id)
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.docker
            .start_container::<String>(name, None)
            .await
            .map_err(map_engine_error)
    }

    async fn exec(
        &self,
        name: &str,
        argv: Vec<String>,
        environment: &HashMap<String, String>,
        user: &str,
        workdir: &str,
    ) -> Result<ExecOutcome> {
        use bollard::exec::{CreateExecOptions, StartExecResults};

        let env: Vec<String> = environment
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(argv),
                    env: Some(env),
                    user: Some(user.to_string()),
                    working_dir: Some(workdir.to_string()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(map_engine_error)?;

        let mut collected = Vec::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(map_engine_error)?
        {
            while let Some(message) = output.next().await {
                match message {
                    Ok(log) => collected.extend_from_slice(&log.into_bytes()),
                    Err(err) => return Err(map_engine_error(err)),
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(map_engine_error)?;
        Ok(ExecOutcome {
            output: collected,
            exit_code: inspect.exit_code.unwrap_or(-1),
        })
    }

    async fn state(&self, name: &str) -> Result<Option<ContainerState>> {
        match self.docker.inspect_container(name, None).await {
            Ok(info) => Ok(info.state.map(|state| ContainerState {
                running: state.running.unwrap_or(false),
                exit_code: state.exit_code,
                oom_killed: state.oom_killed.unwrap_or(false),
                error: state.error.filter(|e| !e.is_empty()),
            })),
            Err(err) => match map_engine_error(err) {
                Error::ContainerNotFound => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn kill(&self, name: &str) -> Result<()> {
        self.docker
            .kill_container::<String>(name, None)
            .await
            .map_err(map_engine_error)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.docker
            .remove_container(name, None)
            .await
            .map_err(map_engine_error)
    }

    async fn image_digest(&self, image: &str) -> Result<String> {
        let inspect = self
            .docker
            .inspect_image(image)
            .await
            .map_err(map_engine_error)?;
        inspect
            .id
            .ok_or_else(|| Error::Engine(format!("image {image} has no id")))
    }
}

// =============================================================================
// Mock implementation
// =============================================================================

/// Scripted engine for tests.
///
/// `state()` answers pop from a queue (defaulting to "no container"); exec
/// outcomes pop from another (defaulting to exit 0, empty output). Every call
/// is recorded so tests can assert on provisioning and teardown order.
#[derive(Default)]
pub struct MockEngine {
    state_responses: Mutex<VecDeque<Option<ContainerState>>>,
    exec_responses: Mutex<VecDeque<ExecOutcome>>,
    exec_fails: AtomicBool,
    teardown_missing: AtomicBool,
    create_fails: AtomicBool,
    pub created: Mutex<Vec<ContainerSpec>>,
    pub started: Mutex<Vec<String>>,
    pub kill_calls: AtomicUsize,
    pub remove_calls: AtomicUsize,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the answer for the next `state()` call.
    pub fn push_state(&self, state: Option<ContainerState>) {
        self.state_responses
            .try_lock()
            .expect("state queue contended in test setup")
            .push_back(state);
    }

    /// Queue the outcome for the next `exec()` call.
    pub fn push_exec(&self, outcome: ExecOutcome) {
        self.exec_responses
            .try_lock()
            .expect("exec queue contended in test setup")
            .push_back(outcome);
    }

    /// Make every `exec()` call fail with an engine error.
    pub fn fail_exec(&self) {
        self.exec_fails.store(true, Ordering::SeqCst);
    }

    /// Make `kill()`/`remove()` report the container as already gone.
    pub fn missing_on_teardown(&self) {
        self.teardown_missing.store(true, Ordering::SeqCst);
    }

    /// Make `create()` fail with an engine error.
    pub fn fail_create(&self) {
        self.create_fails.store(true, Ordering::SeqCst);
    }

    pub fn kill_count(&self) -> usize {
        self.kill_calls.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        if self.create_fails.load(Ordering::SeqCst) {
            return Err(Error::Engine("409: name already in use".into()));
        }
        self.created.lock().await.push(spec.clone());
        Ok(format!("mock-{}", spec.name))
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.started.lock().await.push(name.to_string());
        Ok(())
    }

    async fn exec(
        &self,
        _name: &str,
        _argv: Vec<String>,
        _environment: &HashMap<String, String>,
        _user: &str,
        _workdir: &str,
    ) -> Result<ExecOutcome> {
        if self.exec_fails.load(Ordering::SeqCst) {
            return Err(Error::Engine("500: exec failed".into()));
        }
        Ok(self
            .exec_responses
            .lock()
            .await
            .pop_front()
            .unwrap_or(ExecOutcome {
                output: Vec::new(),
                exit_code: 0,
            }))
    }

    async fn state(&self, _name: &str) -> Result<Option<ContainerState>> {
        Ok(self
            .state_responses
            .lock()
            .await
            .pop_front()
            .unwrap_or(None))
    }

    async fn kill(&self, _name: &str) -> Result<()> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        if self.teardown_missing.load(Ordering::SeqCst) {
            return Err(Error::ContainerNotFound);
        }
        Ok(())
    }

    async fn remove(&self, _name: &str) -> Result<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if self.teardown_missing.load(Ordering::SeqCst) {
            return Err(Error::ContainerNotFound);
        }
        Ok(())
    }

    async fn image_digest(&self, image: &str) -> Result<String> {
        Ok(format!("sha256:mock-{image}"))
    }
}
