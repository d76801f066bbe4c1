//! Build environment: scoped command execution with build-state reporting.
//!
//! The scope always exits cleanly. Any failure raised inside it is
//! intercepted exactly once in [`BuildEnvironment::exit`], classified, and
//! converted into environment state; callers observe failure through
//! [`BuildEnvironment::failed`] or the persisted record, never through a
//! propagated error.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use docbuild_api::TrackingApi;
use docbuild_core::types::{BuildConfig, BuildRecord, BuildState, Feature, Project, Version};
use docbuild_core::{Error, Result, Settings};

use crate::command::BuildCommand;
use crate::environment::Environment;
use crate::exec::{CommandExecutor, LocalExecutor};

/// Lifecycle of a build environment scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    /// Scope active; commands may run.
    Open,
    /// Scope exiting; failures are being reconciled.
    Finalizing,
    /// Tracking API updated (or the update was skipped).
    Closed,
}

/// Build environment executing commands on the host.
///
/// Tracks build-level success/failure and timing, and synchronizes the final
/// state to the tracking API when the scope exits. The build record is only
/// pushed while the build is not yet terminal, when it failed, or — if
/// `update_on_success` — when it succeeded.
pub struct BuildEnvironment {
    pub(crate) settings: Settings,
    pub(crate) tracker: Arc<dyn TrackingApi>,
    pub(crate) project: Project,
    pub(crate) version: Version,
    pub(crate) build: Option<BuildRecord>,
    pub(crate) config: Option<BuildConfig>,
    pub(crate) environment: HashMap<String, String>,
    pub(crate) record: bool,
    pub(crate) update_on_success: bool,
    pub(crate) commands: Vec<BuildCommand>,
    /// First unhandled failure; later candidates are dropped.
    pub(crate) failure: Option<Error>,
    start_time: DateTime<Utc>,
    scope: ScopeState,
}

impl BuildEnvironment {
    pub fn new(
        settings: Settings,
        tracker: Arc<dyn TrackingApi>,
        project: Project,
        version: Version,
        build: Option<BuildRecord>,
    ) -> Self {
        Self {
            settings,
            tracker,
            project,
            version,
            build,
            config: None,
            environment: HashMap::new(),
            record: true,
            update_on_success: true,
            commands: Vec::new(),
            failure: None,
            start_time: Utc::now(),
            scope: ScopeState::Open,
        }
    }

    pub fn with_config(mut self, config: BuildConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    /// Disable all recording: commands are not persisted and the build
    /// record is never pushed.
    pub fn with_record(mut self, record: bool) -> Self {
        self.record = record;
        self
    }

    /// Don't push the record for successful builds (used for setup phases
    /// that shouldn't mark the build green yet).
    pub fn with_update_on_success(mut self, update_on_success: bool) -> Self {
        self.update_on_success = update_on_success;
        self
    }

    pub fn build(&self) -> Option<&BuildRecord> {
        self.build.as_ref()
    }

    pub fn failure(&self) -> Option<&Error> {
        self.failure.as_ref()
    }

    pub fn scope_state(&self) -> ScopeState {
        self.scope
    }

    /// Begin the scope. The local variant allocates nothing.
    pub async fn enter(&mut self) -> Result<()> {
        self.scope = ScopeState::Open;
        Ok(())
    }

    /// End the scope, folding the body's result into build state and pushing
    /// the terminal record. Never returns an error: the exit handler is the
    /// single interception point for failures raised inside the scope.
    pub async fn exit(&mut self, body: Result<()>) {
        self.scope = ScopeState::Finalizing;
        if let Err(error) = body {
            self.handle_failure(error);
        }
        self.update_build(BuildState::Finished).await;
        self.scope = ScopeState::Closed;
        tracing::info!(
            project = %self.project.slug,
            version = %self.version.slug,
            success = self.build.as_ref().map(|b| b.success).unwrap_or(false),
            length = self.build.as_ref().and_then(|b| b.length).unwrap_or(0),
            "Build finished."
        );
    }

    /// Classify and store a failure. Expected build faults are an application
    /// WARNING; everything else is an ERROR. Either way the first failure
    /// wins and the scope keeps exiting cleanly.
    pub fn handle_failure(&mut self, error: Error) {
        if error.is_warning() {
            tracing::warn!(
                error = %error,
                project = %self.project.slug,
                version = %self.version.slug,
                build = self.build.as_ref().map(|b| b.id).unwrap_or_default(),
                "Build failed."
            );
        } else {
            tracing::error!(
                error = %error,
                project = %self.project.slug,
                version = %self.version.slug,
                build = self.build.as_ref().map(|b| b.id).unwrap_or_default(),
                "Build failed with unexpected error."
            );
        }
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    /// Build completed without a top-level failure or failing commands.
    pub fn successful(&self) -> bool {
        self.done() && self.failure.is_none() && self.commands.iter().all(BuildCommand::successful)
    }

    /// Build completed, but with a top-level failure or failing commands.
    pub fn failed(&self) -> bool {
        self.done() && (self.failure.is_some() || self.commands.iter().any(BuildCommand::failed))
    }

    /// Build reached its terminal state.
    pub fn done(&self) -> bool {
        self.build.as_ref().map(BuildRecord::is_finished).unwrap_or(false)
    }

    /// Compute the record's terminal fields and push it to the tracking API
    /// when the update policy says so. Tracker errors are logged, never
    /// propagated.
    pub async fn update_build(&mut self, state: BuildState) {
        if !self.record {
            return;
        }
        let Some(build_id) = self.build.as_ref().map(|b| b.id) else {
            return;
        };

        // Replace unclassified failures with a generic message; internal
        // detail must not leak through the public error text.
        if let Some(failure) = &self.failure {
            if !failure.is_structured() {
                tracing::error!(
                    error = %failure,
                    build = build_id,
                    project = %self.project.slug,
                    "Build failed with unhandled error."
                );
                self.failure = Some(Error::generic(build_id));
            }
        }

        // Command failures keep the real command exit code; other structured
        // failures report their own status code.
        let exit_code = match &self.failure {
            Some(failure)
                if failure.is_structured() && !matches!(failure, Error::CommandFailed(_)) =>
            {
                Some(failure.status_code())
            }
            _ => self.commands.iter().filter_map(|cmd| cmd.exit_code).max(),
        };
        let length = (Utc::now() - self.start_time).num_seconds();
        let successful =
            self.failure.is_none() && self.commands.iter().all(BuildCommand::successful);
        let failure_text = self.failure.as_ref().map(ToString::to_string);
        let mut done = false;
        if let Some(build) = self.build.as_mut() {
            build.state = state;
            build.builder = builder_hostname();
            build.length = Some(length);
            done = build.is_finished();
            if done {
                build.success = successful;
                build.exit_code = exit_code;
            }
            if let Some(text) = failure_text {
                build.error = text;
            }
        }

        // We are selective about when the record is pushed: unconditionally
        // while not yet terminal, always on failure, on success only when the
        // policy allows it.
        let update = !done || !successful || self.update_on_success;
        if update {
            if let Some(build) = &self.build {
                if let Err(error) = self.tracker.put_build(build).await {
                    tracing::error!(error = %error, build = build_id, "Unable to update build.");
                }
            }
        }
    }

    pub(crate) async fn save_command(&self, cmd: &mut BuildCommand) -> Result<()> {
        let build_id = self.build.as_ref().map(|b| b.id).unwrap_or_default();
        let multipart = self.project.has_feature(Feature::ApiLargeData);
        cmd.save(self.tracker.as_ref(), build_id, multipart).await
    }
}

#[async_trait]
impl Environment for BuildEnvironment {
    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn project(&self) -> &Project {
        &self.project
    }

    fn shared_environment(&self) -> &HashMap<String, String> {
        &self.environment
    }

    fn default_record(&self) -> bool {
        self.record
    }

    fn commands(&self) -> &[BuildCommand] {
        &self.commands
    }

    fn commands_mut(&mut self) -> &mut Vec<BuildCommand> {
        &mut self.commands
    }

    async fn executor(&mut self) -> Result<Arc<dyn CommandExecutor>> {
        Ok(Arc::new(LocalExecutor))
    }

    async fn record_command(&self, cmd: &mut BuildCommand) -> Result<()> {
        self.save_command(cmd).await
    }
}

/// Hostname reported as the build's `builder` field.
fn builder_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
