//! Docker build environment: one container per build.
//!
//! The container is provisioned on scope entry and torn down on every exit
//! path, including failures during entry itself. The container's PID 1 is a
//! dead-man `sleep`: if no exec session finishes before the time limit, the
//! container self-terminates with a recognizable sentinel exit code.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use docbuild_core::settings::{HOSTNAME_MAX_LEN, TIMEOUT_EXIT_CODE};
use docbuild_core::types::{BuildState, Feature, Project};
use docbuild_core::{slugify, Error, Result, Settings};

use crate::build::BuildEnvironment;
use crate::command::BuildCommand;
use crate::engine::{ContainerEngine, ContainerSpec, ContainerState, DockerEngine};
use crate::environment::Environment;
use crate::exec::{CommandExecutor, ContainerExecutor};

/// Image used when the project opted into the testing build image.
const TESTING_IMAGE: &str = "docbuild/build:testing";

/// Build environment that provisions, supervises and tears down one Docker
/// container per build.
///
/// Container naming is the concurrency guard: at most one container with the
/// derived name may be running. The name collision check is best-effort, not
/// a distributed lock.
pub struct DockerBuildEnvironment {
    env: BuildEnvironment,
    /// Lazily connected engine client, cached for this environment's life.
    engine: Option<Arc<dyn ContainerEngine>>,
    container_name: String,
    container_image: String,
    memory_limit_bytes: i64,
    time_limit_secs: u64,
    /// Engine-assigned id of the live container, cleared on teardown.
    container_id: Option<String>,
}

impl DockerBuildEnvironment {
    pub fn new(env: BuildEnvironment) -> Self {
        let container_name = derive_container_name(
            env.build.as_ref().map(|b| b.id),
            &env.project,
        );

        // Image resolution, highest priority first: testing flag, per-build
        // config, per-project manual override, settings default.
        let container_image = if env.project.has_feature(Feature::TestingBuildImage) {
            TESTING_IMAGE.to_string()
        } else if let Some(image) = env.config.as_ref().and_then(|c| c.docker_image.clone()) {
            image
        } else if let Some(image) = env.project.container_image.clone() {
            image
        } else {
            env.settings.docker.image.clone()
        };

        let memory_limit_bytes = env
            .project
            .container_mem_limit
            .unwrap_or(env.settings.docker.memory_limit_bytes);
        let time_limit_secs = env
            .project
            .container_time_limit
            .unwrap_or(env.settings.docker.time_limit_secs);

        Self {
            env,
            engine: None,
            container_name,
            container_image,
            memory_limit_bytes,
            time_limit_secs,
            container_id: None,
        }
    }

    /// Inject a pre-built engine client instead of connecting lazily.
    pub fn with_engine(mut self, engine: Arc<dyn ContainerEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn container_image(&self) -> &str {
        &self.container_image
    }

    pub fn build_environment(&self) -> &BuildEnvironment {
        &self.env
    }

    pub fn successful(&self) -> bool {
        self.env.successful()
    }

    pub fn failed(&self) -> bool {
        self.env.failed()
    }

    pub fn failure(&self) -> Option<&Error> {
        self.env.failure()
    }

    /// Start of the environment scope: sanity-check the derived name,
    /// prepare the host paths, create and start the container.
    ///
    /// On any entry-time failure the exit-teardown runs before the error is
    /// returned, so a failed entry never leaks a container. After an `Err`
    /// the scope is already closed; don't call [`exit`](Self::exit) again.
    pub async fn enter(&mut self) -> Result<()> {
        // A container with our name still running means the version locking
        // above us failed, or another build owns this version right now.
        // A stopped leftover is just stale state from an interrupted build.
        match self.container_state().await {
            Ok(Some(state)) if state.running => {
                let error = Error::VersionLocked;
                if let Some(build) = self.env.build.as_mut() {
                    build.state = BuildState::Finished;
                }
                self.exit(Err(error.clone())).await;
                return Err(error);
            }
            Ok(Some(_)) => {
                tracing::warn!(
                    project = %self.env.project.slug,
                    container_id = %self.container_name,
                    "Removing stale container."
                );
                if let Ok(engine) = self.get_engine() {
                    if let Err(error) = engine.remove(&self.container_name).await {
                        // Sanity cleanup only; a failure here is not fatal.
                        tracing::debug!(error = %error, "Stale container removal failed.");
                    }
                }
            }
            Ok(None) => {}
            Err(error @ Error::Environment(_)) => {
                self.exit(Err(error.clone())).await;
                return Err(error);
            }
            Err(error) => {
                tracing::debug!(error = %error, "Container sanity check failed.");
            }
        }

        // The bind source must exist, or the engine creates it root-owned.
        if let Err(error) = tokio::fs::create_dir_all(&self.env.project.doc_path).await {
            let error = Error::Io(error.to_string());
            self.exit(Err(error.clone())).await;
            return Err(error);
        }

        if let Err(error) = self.create_container().await {
            self.exit(Err(error.clone())).await;
            return Err(error);
        }
        Ok(())
    }

    /// End of the environment scope: reconcile build state from the live
    /// container, tear the container down, then finalize the build record.
    /// Teardown tolerates an already-gone container and never masks the
    /// primary failure.
    pub async fn exit(&mut self, body: Result<()>) {
        if let Err(error) = body {
            self.env.handle_failure(error);
        }

        self.update_build_from_container_state().await;

        match self.get_engine() {
            Ok(engine) => {
                match engine.kill(&self.container_name).await {
                    Ok(()) => {}
                    Err(Error::ContainerNotFound) => {
                        tracing::info!(
                            container_id = %self.container_name,
                            "Container does not exist, nothing to kill."
                        );
                    }
                    Err(error) => {
                        tracing::error!(
                            error = %error,
                            container_id = %self.container_name,
                            "Unable to kill container."
                        );
                    }
                }

                tracing::info!(container_id = %self.container_name, "Removing container.");
                match engine.remove(&self.container_name).await {
                    Ok(()) => {}
                    Err(Error::ContainerNotFound) => {
                        tracing::info!(
                            container_id = %self.container_name,
                            "Container does not exist, nothing to remove."
                        );
                    }
                    Err(error) => {
                        tracing::error!(
                            error = %error,
                            project = %self.env.project.slug,
                            "Couldn't remove container."
                        );
                    }
                }
            }
            // Engine unreachable during teardown: adopted as the build's
            // failure only when nothing else was recorded first.
            Err(error) => self.env.handle_failure(error),
        }
        self.container_id = None;

        self.env.exit(Ok(())).await;
    }

    /// Digest of the resolved build image, for build metadata.
    pub async fn image_hash(&mut self) -> Result<String> {
        let image = self.container_image.clone();
        let engine = self.get_engine()?;
        engine.image_digest(&image).await
    }

    pub async fn container_state(&mut self) -> Result<Option<ContainerState>> {
        let name = self.container_name.clone();
        let engine = self.get_engine()?;
        engine.state(&name).await
    }

    /// Populate the build failure from the container's reported state, when
    /// the container died without any command itself failing. An existing
    /// failure always wins.
    async fn update_build_from_container_state(&mut self) {
        if self.env.failure.is_some() {
            return;
        }
        let state = match self.container_state().await {
            Ok(Some(state)) => state,
            _ => return,
        };
        if state.running {
            return;
        }
        let failure = if state.exit_code == Some(TIMEOUT_EXIT_CODE) {
            Some(Error::BuildTimeout)
        } else if state.oom_killed {
            Some(Error::environment(
                "Build exited due to excessive memory consumption",
            ))
        } else {
            state
                .error
                .map(|error| Error::environment(format!("Build exited due to unknown error: {error}")))
        };
        if let Some(failure) = failure {
            self.env.handle_failure(failure);
        }
    }

    async fn create_container(&mut self) -> Result<()> {
        let engine = self.get_engine()?;
        tracing::info!(
            container_image = %self.container_image,
            container_id = %self.container_name,
            "Creating build container."
        );
        let spec = ContainerSpec {
            name: self.container_name.clone(),
            image: self.container_image.clone(),
            // Dead-man switch: the container self-terminates with the
            // timeout sentinel when no exec session beat the clock.
            command: format!("sleep {}; exit {}", self.time_limit_secs, TIMEOUT_EXIT_CODE),
            user: self.env.settings.docker.user.clone(),
            binds: self.binds(),
            memory_limit_bytes: self.memory_limit_bytes,
        };

        match engine.create(&spec).await {
            Ok(id) => self.container_id = Some(id),
            Err(error) => return Err(self.map_provisioning_error(error)),
        }
        if let Err(error) = engine.start(&self.container_name).await {
            return Err(self.map_provisioning_error(error));
        }
        Ok(())
    }

    /// Engine failures during provisioning must not leak engine internals:
    /// connection problems become the generic build failure, API rejections
    /// the creation-failed error.
    fn map_provisioning_error(&self, error: Error) -> Error {
        match error {
            Error::EngineConnection(detail) => {
                tracing::error!(
                    error = %detail,
                    project = %self.env.project.slug,
                    version = %self.env.version.slug,
                    "Could not connect to container engine, make sure it is running."
                );
                self.generic_failure()
            }
            other => {
                tracing::error!(
                    error = %other,
                    project = %self.env.project.slug,
                    version = %self.env.version.slug,
                    "Container provisioning failed."
                );
                Error::CreationFailed
            }
        }
    }

    fn generic_failure(&self) -> Error {
        match self.env.build.as_ref() {
            Some(build) => Error::generic(build.id),
            None => Error::environment("Failed to connect to container engine"),
        }
    }

    /// Host binds for the container: the project's doc path read-write, or
    /// the compose volume when builds run inside docker-compose, plus any
    /// extra configured binds.
    fn binds(&self) -> Vec<(String, String)> {
        let doc_path = self.env.project.doc_path.to_string_lossy().to_string();
        let mut binds = match &self.env.settings.docker.compose_volume {
            Some(volume) => {
                let parent = self
                    .env
                    .project
                    .doc_path
                    .parent()
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_else(|| doc_path.clone());
                vec![(volume.clone(), parent)]
            }
            None => vec![(doc_path.clone(), doc_path)],
        };
        for (host, container) in &self.env.settings.docker.additional_binds {
            binds.push((host.clone(), container.clone()));
        }
        binds
    }

    fn get_engine(&mut self) -> Result<Arc<dyn ContainerEngine>> {
        if let Some(engine) = &self.engine {
            return Ok(engine.clone());
        }
        match DockerEngine::connect(&self.env.settings.docker.socket) {
            Ok(engine) => {
                let engine: Arc<dyn ContainerEngine> = Arc::new(engine);
                self.engine = Some(engine.clone());
                Ok(engine)
            }
            Err(error) => {
                tracing::error!(
                    error = %error,
                    project = %self.env.project.slug,
                    "Could not connect to container engine."
                );
                // The engine is a technical detail the user can't act on;
                // surface the generic failure instead.
                Err(self.generic_failure())
            }
        }
    }
}

#[async_trait]
impl Environment for DockerBuildEnvironment {
    fn settings(&self) -> &Settings {
        &self.env.settings
    }

    fn project(&self) -> &Project {
        &self.env.project
    }

    fn shared_environment(&self) -> &HashMap<String, String> {
        &self.env.environment
    }

    fn default_record(&self) -> bool {
        self.env.record
    }

    fn commands(&self) -> &[BuildCommand] {
        &self.env.commands
    }

    fn commands_mut(&mut self) -> &mut Vec<BuildCommand> {
        &mut self.env.commands
    }

    async fn executor(&mut self) -> Result<Arc<dyn CommandExecutor>> {
        let name = self.container_name.clone();
        let engine = self.get_engine()?;
        Ok(Arc::new(ContainerExecutor::new(engine, name)))
    }

    async fn record_command(&self, cmd: &mut BuildCommand) -> Result<()> {
        self.env.save_command(cmd).await
    }
}

/// Deterministic container name: derived from the build id and project
/// identity, or a random suffix when no build id exists (one-off syncs).
/// Doubles as the container hostname, hence the length cap.
fn derive_container_name(build_id: Option<i64>, project: &Project) -> String {
    let name = match build_id {
        Some(id) => format!("build-{}-project-{}-{}", id, project.id, project.slug),
        None => {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!(
                "sync-{}-project-{}-{}",
                &suffix[..8],
                project.id,
                project.slug
            )
        }
    };
    // Slugify before truncating: the slug is ASCII, so cutting at the
    // hostname limit always lands on a character boundary.
    let mut slug = slugify(&name);
    slug.truncate(HOSTNAME_MAX_LEN);
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}
