//! Base execution environment.
//!
//! An environment owns a shared variable map and an ordered list of recorded
//! commands, and exposes one uniform operation: run a command under the
//! environment's recording and failure policy.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use docbuild_core::types::Project;
use docbuild_core::{Error, Result, Settings};

use crate::command::BuildCommand;
use crate::exec::{CommandExecutor, LocalExecutor};

/// Scoped context in which a sequence of commands executes and is recorded.
///
/// The provided [`run`](Environment::run) implementation applies the policy
/// shared by every environment kind; implementors supply the executor, the
/// shared variables, and the recording sink.
#[async_trait]
pub trait Environment: Send + Sync {
    fn settings(&self) -> &Settings;

    fn project(&self) -> &Project;

    /// Variable map injected into every command. May carry a `BIN_PATH` key,
    /// which is pulled out and applied as the command's `bin_path` instead.
    fn shared_environment(&self) -> &HashMap<String, String>;

    /// Whether commands are recorded when they don't say otherwise.
    fn default_record(&self) -> bool {
        false
    }

    /// Commands recorded so far, in execution order.
    fn commands(&self) -> &[BuildCommand];

    fn commands_mut(&mut self) -> &mut Vec<BuildCommand>;

    /// The execution strategy for this environment.
    async fn executor(&mut self) -> Result<Arc<dyn CommandExecutor>>;

    /// Persist one command. Only called when recording is enabled.
    async fn record_command(&self, _cmd: &mut BuildCommand) -> Result<()> {
        Ok(())
    }

    /// Run one command under this environment's policy.
    ///
    /// * `record` defaults to the environment's flag; unrecorded commands are
    ///   never fatal.
    /// * `record_as_success` forces recording and warn-only, and rewrites the
    ///   exit code at persistence time.
    /// * A recorded command is persisted before it is appended to the command
    ///   list, so the list and the tracking API never diverge.
    /// * A failed, non-warn-only command ends the sequence with
    ///   [`Error::CommandFailed`].
    async fn run(&mut self, mut cmd: BuildCommand) -> Result<BuildCommand> {
        let mut record = cmd.record.unwrap_or_else(|| self.default_record());
        let mut warn_only = cmd.warn_only;
        if !record {
            warn_only = true;
        }
        if cmd.record_as_success {
            record = true;
            warn_only = true;
        }

        let mut environment = self.shared_environment().clone();
        if environment.contains_key("PATH") {
            return Err(Error::environment("'PATH' can't be set. Use bin_path."));
        }
        if let Some(bin_path) = environment.remove("BIN_PATH") {
            if cmd.bin_path.is_none() {
                cmd.bin_path = Some(bin_path);
            }
        }
        cmd.environment = environment;
        if cmd.cwd.is_none() {
            cmd.cwd = Some(self.settings().docker.workdir.clone());
        }
        if cmd.user.is_none() {
            cmd.user = Some(self.settings().docker.user.clone());
        }
        cmd.output_limit = self.settings().upload_limit_bytes;

        let executor = self.executor().await?;
        cmd.execute(executor.as_ref()).await;

        if record {
            self.record_command(&mut cmd).await?;
            self.commands_mut().push(cmd.clone());
        }

        if cmd.failed() {
            if warn_only {
                tracing::warn!(
                    command = %cmd.get_command(),
                    exit_code = cmd.exit_code.unwrap_or(-1),
                    project = %self.project().slug,
                    "Command failed."
                );
            } else {
                return Err(Error::command_failed(&cmd.get_command(), cmd.output.as_deref()));
            }
        }
        Ok(cmd)
    }
}

/// Environment for running commands on the host, outside any build. Nothing
/// is recorded unless a command asks for it explicitly.
pub struct LocalEnvironment {
    settings: Settings,
    project: Project,
    environment: HashMap<String, String>,
    commands: Vec<BuildCommand>,
}

impl LocalEnvironment {
    pub fn new(settings: Settings, project: Project) -> Self {
        Self {
            settings,
            project,
            environment: HashMap::new(),
            commands: Vec::new(),
        }
    }

    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = environment;
        self
    }
}

#[async_trait]
impl Environment for LocalEnvironment {
    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn project(&self) -> &Project {
        &self.project
    }

    fn shared_environment(&self) -> &HashMap<String, String> {
        &self.environment
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
}
