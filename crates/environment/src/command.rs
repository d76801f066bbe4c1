//! Command wrapper for execution in build environments.
//!
//! `BuildCommand` carries one shell invocation, its execution context, and
//! its captured result. It maps one-to-one onto the tracking API's command
//! resource.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use docbuild_api::{CommandPayload, TrackingApi};
use docbuild_core::settings::OUTPUT_MARGIN;
use docbuild_core::Result;

use crate::exec::CommandExecutor;

const TRUNCATION_NOTICE: &str = ".. (truncated) ...";

/// One command to run in a build environment, plus its captured result.
///
/// Construct with [`BuildCommand::new`] and the builder methods, then hand it
/// to [`Environment::run`](crate::environment::Environment::run). The
/// environment injects the shared variable map and execution defaults; the
/// caller may not set `PATH` (use [`bin_path`](Self::bin_path) instead) nor
/// a per-command environment map.
#[derive(Debug, Clone)]
pub struct BuildCommand {
    pub(crate) command: Vec<String>,
    pub(crate) cwd: Option<String>,
    pub(crate) user: Option<String>,
    pub(crate) environment: HashMap<String, String>,
    pub(crate) bin_path: Option<String>,
    pub(crate) description: String,
    pub(crate) record: Option<bool>,
    pub(crate) warn_only: bool,
    pub(crate) record_as_success: bool,
    pub(crate) escape_command: bool,
    pub(crate) output_limit: usize,

    /// Sanitized, merged stdout+stderr. `None` until execution produced any.
    pub output: Option<String>,
    /// Set exactly once, when execution completes (−1 on spawn failure).
    pub exit_code: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl BuildCommand {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            cwd: None,
            user: None,
            environment: HashMap::new(),
            bin_path: None,
            description: String::new(),
            record: None,
            warn_only: false,
            record_as_success: false,
            escape_command: true,
            output_limit: usize::MAX,
            output: None,
            exit_code: None,
            start_time: None,
            end_time: None,
        }
    }

    /// Working directory; defaults to the environment's configured workdir.
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// User (or `user:group`) to run as; defaults to the configured user.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Path prepended to the computed `PATH`.
    pub fn bin_path(mut self, bin_path: impl Into<String>) -> Self {
        self.bin_path = Some(bin_path.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Override the environment's default recording policy. `record(false)`
    /// implies the failure is never fatal.
    pub fn record(mut self, record: bool) -> Self {
        self.record = Some(record);
        self
    }

    /// Don't fail the environment when this command fails.
    pub fn warn_only(mut self, warn_only: bool) -> Self {
        self.warn_only = warn_only;
        self
    }

    /// Record this command with exit code 0 no matter how it exited. Implies
    /// recording and warn-only.
    pub fn record_as_success(mut self) -> Self {
        self.record_as_success = true;
        self
    }

    /// Disable shell escaping of the argument tokens. Only for trusted,
    /// internal commands.
    pub fn escape_command(mut self, escape: bool) -> Self {
        self.escape_command = escape;
        self
    }

    /// Flatten the argument vector into the display string used for shell
    /// invocation, logging, and error messages.
    pub fn get_command(&self) -> String {
        self.command.join(" ")
    }

    pub fn successful(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn failed(&self) -> bool {
        matches!(self.exit_code, Some(code) if code != 0)
    }

    /// Run the command through `executor`, recording timestamps on every
    /// path: even a spawn failure gets an end time and a sentinel exit code.
    pub async fn execute(&mut self, executor: &dyn CommandExecutor) {
        self.start_time = Some(Utc::now());
        executor.execute(self).await;
        self.end_time = Some(Utc::now());
    }

    /// Store a raw outcome: sanitized output plus the exit code.
    pub(crate) fn record_outcome(&mut self, raw_output: &[u8], exit_code: i64) {
        self.output = Some(self.sanitize_output(raw_output));
        self.set_exit_code(exit_code);
    }

    /// The exit code is immutable once set; later reports are dropped.
    pub(crate) fn set_exit_code(&mut self, exit_code: i64) {
        if self.exit_code.is_none() {
            self.exit_code = Some(exit_code);
        }
    }

    pub(crate) fn append_output(&mut self, extra: &str) {
        match &mut self.output {
            Some(output) => output.push_str(extra),
            None => self.output = Some(extra.to_string()),
        }
    }

    /// Sanitize raw output for storage:
    ///
    /// 1. lossy UTF-8 decode;
    /// 2. NUL bytes stripped (downstream storage rejects them);
    /// 3. outputs over the upload budget are truncated to their tail, with a
    ///    notice naming the exact byte budget.
    pub(crate) fn sanitize_output(&self, raw: &[u8]) -> String {
        let mut sanitized = String::from_utf8_lossy(raw).replace('\0', "");

        let allowed = self.output_limit.saturating_sub(OUTPUT_MARGIN);
        if raw.len() > allowed {
            tracing::info!(
                command = %self.get_command(),
                output_length = raw.len(),
                "Command output is too big."
            );
            let mut start = sanitized.len().saturating_sub(allowed);
            while start < sanitized.len() && !sanitized.is_char_boundary(start) {
                start += 1;
            }
            sanitized = format!(
                "{TRUNCATION_NOTICE}\nOutput is too big. Truncated at {allowed} bytes.\n\n\n{}",
                &sanitized[start..],
            );
        }
        sanitized
    }

    /// Persist this command and its result via the tracking API.
    pub async fn save(
        &mut self,
        tracker: &dyn TrackingApi,
        build_id: i64,
        multipart: bool,
    ) -> Result<()> {
        // Commands that only exist for checking purposes must not fail the
        // build; their exit code is rewritten right before persistence.
        if self.record_as_success {
            tracing::warn!(
                command = %self.get_command(),
                "Recording command exit_code as success."
            );
            self.exit_code = Some(0);
        }

        let payload = CommandPayload {
            build: build_id,
            command: self.get_command(),
            description: self.description.clone(),
            output: self.output.clone().unwrap_or_default(),
            exit_code: self.exit_code.unwrap_or(-1),
            start_time: self.start_time.unwrap_or_else(Utc::now),
            end_time: self.end_time.unwrap_or_else(Utc::now),
        };
        tracker.post_command(&payload, multipart).await
    }
}
