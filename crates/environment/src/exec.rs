//! Command execution strategies.
//!
//! A [`CommandExecutor`] runs one [`BuildCommand`] in its own context: the
//! host (a child process) or an already-running container (an exec session
//! through the container engine). The owning environment picks the executor;
//! commands never know which one they ran under.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;

use docbuild_core::settings::{INTERNAL_VARIABLES, OOM_EXIT_CODE};

use crate::command::BuildCommand;
use crate::engine::ContainerEngine;

/// Characters backslash-escaped before a command token reaches the container
/// shell. Defends against shell injection from user-supplied strings such as
/// dependency version specifiers (`pip install requests<0.8`).
const ESCAPED_CHARS: &str = "\t !\"#$&'()*:;<>?@[\\]^`{|}~";

/// "Execute this command in my context."
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `cmd`, storing its sanitized output and exit code. Never returns
    /// an error: spawn and engine failures map to the −1 sentinel.
    async fn execute(&self, cmd: &mut BuildCommand);
}

/// Runs commands as host child processes with merged stdout/stderr.
pub struct LocalExecutor;

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn execute(&self, cmd: &mut BuildCommand) {
        tracing::info!(
            command = %cmd.get_command(),
            cwd = cmd.cwd.as_deref().unwrap_or(""),
            "Running build command."
        );

        if cmd.command.is_empty() {
            cmd.set_exit_code(-1);
            return;
        }

        let environment = computed_environment(cmd);
        let mut process = tokio::process::Command::new(&cmd.command[0]);
        process
            .args(&cmd.command[1..])
            .env_clear()
            .envs(&environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &cmd.cwd {
            process.current_dir(cwd);
        }

        match process.output().await {
            Ok(output) => {
                let mut merged = output.stdout;
                merged.extend_from_slice(&output.stderr);
                let exit_code = output.status.code().map(i64::from).unwrap_or(-1);
                cmd.record_outcome(&merged, exit_code);
            }
            Err(err) => {
                tracing::error!(error = %err, command = %cmd.get_command(), "Operating system error.");
                cmd.set_exit_code(-1);
            }
        }
    }
}

/// Runs commands through an exec session inside an already-running container.
pub struct ContainerExecutor {
    engine: Arc<dyn ContainerEngine>,
    container_id: String,
}

impl ContainerExecutor {
    pub fn new(engine: Arc<dyn ContainerEngine>, container_id: impl Into<String>) -> Self {
        Self {
            engine,
            container_id: container_id.into(),
        }
    }

    /// Flatten the argument vector into a single shell invocation, with
    /// optional `PATH` injection and per-token escaping.
    ///
    /// The engine's exec call takes an argv, not a working shell, so the
    /// command is wrapped in `/bin/sh -c` manually. The `bin_path` is always
    /// escaped; the command tokens only when escaping is enabled.
    pub(crate) fn wrapped_command(&self, cmd: &BuildCommand) -> String {
        let mut wrapped = String::new();
        if let Some(bin_path) = &cmd.bin_path {
            wrapped.push_str(&format!("PATH={}:$PATH ", escape_token(bin_path)));
        }
        let body = cmd
            .command
            .iter()
            .map(|part| {
                if cmd.escape_command {
                    escape_token(part)
                } else {
                    part.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        wrapped.push_str(&body);
        wrapped
    }
}

#[async_trait]
impl CommandExecutor for ContainerExecutor {
    async fn execute(&self, cmd: &mut BuildCommand) {
        tracing::info!(
            container_id = %self.container_id,
            command = %cmd.get_command(),
            cwd = cmd.cwd.as_deref().unwrap_or(""),
            "Running build command in container."
        );

        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            self.wrapped_command(cmd),
        ];
        let result = self
            .engine
            .exec(
                &self.container_id,
                argv,
                &cmd.environment,
                cmd.user.as_deref().unwrap_or(""),
                cmd.cwd.as_deref().unwrap_or("/"),
            )
            .await;

        match result {
            Ok(outcome) => {
                cmd.record_outcome(&outcome.output, outcome.exit_code);

                // The engine reports a dedicated exit code when the kernel
                // OOM-killed the command. Sometimes it doesn't, and the only
                // trace is a `Killed` in the output's last lines.
                let killed_in_output = cmd
                    .output
                    .as_deref()
                    .map(|out| {
                        out.lines()
                            .rev()
                            .take(15)
                            .any(|line| line.contains("Killed"))
                    })
                    .unwrap_or(false);
                if cmd.exit_code == Some(OOM_EXIT_CODE)
                    || (cmd.exit_code == Some(1) && killed_in_output)
                {
                    cmd.append_output("\n\nCommand killed due to excessive memory consumption\n");
                }
            }
            Err(err) => {
                tracing::error!(
                    error = %err,
                    container_id = %self.container_id,
                    "Command exited abnormally in container."
                );
                cmd.set_exit_code(-1);
                if cmd.output.as_deref().map_or(true, str::is_empty) {
                    cmd.output = Some("Command exited abnormally".to_string());
                }
            }
        }
    }
}

/// Environment a host command runs with: the caller-supplied overrides minus
/// the build system's internal variables, plus a computed `PATH` (host `PATH`
/// with `bin_path` prepended).
fn computed_environment(cmd: &BuildCommand) -> std::collections::HashMap<String, String> {
    let mut environment = cmd.environment.clone();
    for variable in INTERNAL_VARIABLES {
        environment.remove(*variable);
    }

    let host_path = std::env::var("PATH").unwrap_or_default();
    let mut paths: Vec<String> = host_path
        .split(':')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    if let Some(bin_path) = &cmd.bin_path {
        paths.insert(0, bin_path.clone());
    }
    environment.insert("PATH".to_string(), paths.join(":"));
    environment
}

/// Escape shell metacharacters in one token by prefixing them with `\`.
fn escape_token(token: &str) -> String {
    let mut escaped = String::with_capacity(token.len());
    for ch in token.chars() {
        if ESCAPED_CHARS.contains(ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ExecOutcome, MockEngine};

    #[test]
    fn escape_token_defuses_shell_metacharacters() {
        assert_eq!(escape_token("requests<0.8"), "requests\\<0.8");
        assert_eq!(escape_token("a b"), "a\\ b");
        assert_eq!(escape_token("$(reboot)"), "\\$\\(reboot\\)");
        assert_eq!(escape_token("plain-token_1.0"), "plain-token_1.0");
    }

    #[test]
    fn wrapped_command_injects_bin_path() {
        let executor = ContainerExecutor::new(Arc::new(MockEngine::default()), "build-1");
        let cmd = BuildCommand::new(["pip", "install", "requests<0.8"])
            .bin_path("/home/docs/bin");
        assert_eq!(
            executor.wrapped_command(&cmd),
            "PATH=/home/docs/bin:$PATH pip install requests\\<0.8"
        );
    }

    #[test]
    fn wrapped_command_without_escaping() {
        let executor = ContainerExecutor::new(Arc::new(MockEngine::default()), "build-1");
        let cmd = BuildCommand::new(["echo", "a>b"]).escape_command(false);
        assert_eq!(executor.wrapped_command(&cmd), "echo a>b");
    }

    #[tokio::test]
    async fn local_spawn_failure_maps_to_sentinel_exit_code() {
        let mut cmd = BuildCommand::new(["/nonexistent/binary/for/sure"]);
        cmd.execute(&LocalExecutor).await;
        assert_eq!(cmd.exit_code, Some(-1));
        assert!(cmd.start_time.is_some());
        assert!(cmd.end_time.is_some());
        assert!(cmd.start_time <= cmd.end_time);
    }

    #[tokio::test]
    async fn local_execution_merges_output() {
        let mut cmd = BuildCommand::new([
            "/bin/sh".to_string(),
            "-c".to_string(),
            "printf out; printf err 1>&2".to_string(),
        ]);
        cmd.execute(&LocalExecutor).await;
        assert_eq!(cmd.exit_code, Some(0));
        let output = cmd.output.unwrap();
        assert!(output.contains("out"));
        assert!(output.contains("err"));
    }

    #[tokio::test]
    async fn oom_sentinel_appends_memory_notice() {
        let engine = MockEngine::default();
        engine.push_exec(ExecOutcome {
            output: b"working...".to_vec(),
            exit_code: OOM_EXIT_CODE,
        });
        let executor = ContainerExecutor::new(Arc::new(engine), "build-1");
        let mut cmd = BuildCommand::new(["sphinx-build"]);
        cmd.execute(&executor).await;
        assert_eq!(cmd.exit_code, Some(OOM_EXIT_CODE));
        assert!(cmd
            .output
            .unwrap()
            .contains("killed due to excessive memory consumption"));
    }

    #[tokio::test]
    async fn killed_token_in_tail_appends_memory_notice_and_keeps_exit_code() {
        let engine = MockEngine::default();
        engine.push_exec(ExecOutcome {
            output: b"compiling\nKilled\n".to_vec(),
            exit_code: 1,
        });
        let executor = ContainerExecutor::new(Arc::new(engine), "build-1");
        let mut cmd = BuildCommand::new(["sphinx-build"]);
        cmd.execute(&executor).await;
        assert_eq!(cmd.exit_code, Some(1));
        assert!(cmd
            .output
            .unwrap()
            .contains("killed due to excessive memory consumption"));
    }

    #[tokio::test]
    async fn killed_token_beyond_tail_window_is_ignored() {
        let engine = MockEngine::default();
        let mut output = b"Killed\n".to_vec();
        output.extend(std::iter::repeat(b"line\n".as_slice()).take(20).flatten());
        engine.push_exec(ExecOutcome {
            output,
            exit_code: 1,
        });
        let executor = ContainerExecutor::new(Arc::new(engine), "build-1");
        let mut cmd = BuildCommand::new(["sphinx-build"]);
        cmd.execute(&executor).await;
        assert!(!cmd
            .output
            .unwrap()
            .contains("killed due to excessive memory consumption"));
    }

    #[tokio::test]
    async fn engine_failure_maps_to_abnormal_exit() {
        let engine = MockEngine::default();
        engine.fail_exec();
        let executor = ContainerExecutor::new(Arc::new(engine), "build-1");
        let mut cmd = BuildCommand::new(["true"]);
        cmd.execute(&executor).await;
        assert_eq!(cmd.exit_code, Some(-1));
        assert_eq!(cmd.output.as_deref(), Some("Command exited abnormally"));
    }
}
