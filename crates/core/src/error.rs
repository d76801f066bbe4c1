//! Error types for docbuild.
//!
//! Build failures fall into three buckets:
//!
//! * expected, user-facing conditions (`is_warning`) that are logged at WARN
//!   and surfaced verbatim;
//! * hard environment errors the orchestrator cannot proceed past, still
//!   surfaced verbatim;
//! * everything else, which is logged at ERROR and replaced by a generic
//!   message before it reaches the user.

use thiserror::Error;

/// Result type alias using docbuild's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for docbuild.
///
/// Every variant carries owned data only, so errors can be cloned into both
/// the stored build failure and the value returned to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Hard environment error the build cannot proceed past.
    #[error("{0}")]
    Environment(String),

    /// Container provisioning failed at the engine level.
    #[error("Build environment creation failed")]
    CreationFailed,

    /// A recorded command failed while the environment was not warn-only.
    #[error("{0}")]
    CommandFailed(String),

    /// Another build environment owns this version's container.
    #[error("A build environment is currently running for this version")]
    VersionLocked,

    #[error("Builds for this project are temporarily disabled")]
    BuildsSkipped,

    #[error("Problem parsing YAML configuration: {0}")]
    YamlParse(String),

    /// The container's dead-man command fired before the build finished.
    #[error("Build exited due to time out")]
    BuildTimeout,

    #[error("There was a problem with your repository: {0}")]
    Repository(String),

    #[error("Problem in your project's configuration: {0}")]
    ProjectConfiguration(String),

    /// Tracking API transport or response error.
    #[error("Tracking API error: {0}")]
    Api(String),

    /// Container engine rejected a request.
    #[error("Container engine error: {0}")]
    Engine(String),

    /// Could not reach the container engine at all.
    #[error("Could not connect to container engine: {0}")]
    EngineConnection(String),

    /// The named container does not exist on the engine.
    #[error("Container not found")]
    ContainerNotFound,

    #[error("{0}")]
    Io(String),
}

impl Error {
    /// Create a hard environment error.
    pub fn environment(msg: impl Into<String>) -> Self {
        Self::Environment(msg.into())
    }

    /// Create a command-failed error carrying the rendered command and its
    /// captured output.
    pub fn command_failed(command: &str, output: Option<&str>) -> Self {
        let mut msg = format!("Command {command} failed");
        if let Some(out) = output {
            if !out.is_empty() {
                msg.push_str(":\n");
                msg.push_str(out);
            }
        }
        Self::CommandFailed(msg)
    }

    /// The generic, user-safe failure message for a build. Used whenever the
    /// real cause must not leak internal detail.
    pub fn generic(build_id: i64) -> Self {
        Self::Environment(format!(
            "There was a problem building your documentation. \
             Report this issue mentioning build #{build_id}."
        ))
    }

    /// Expected, user-facing build faults. These are a build ERROR but an
    /// application WARNING: they are logged at WARN severity and never
    /// treated as internal defects.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::CommandFailed(_)
                | Self::VersionLocked
                | Self::BuildsSkipped
                | Self::YamlParse(_)
                | Self::BuildTimeout
                | Self::Repository(_)
                | Self::ProjectConfiguration(_)
        )
    }

    /// Whether this error kind may be shown to the user as-is. Anything else
    /// is replaced by [`Error::generic`] during build finalization.
    pub fn is_structured(&self) -> bool {
        self.is_warning() || matches!(self, Self::Environment(_) | Self::CreationFailed)
    }

    /// Exit code recorded on the build when this failure terminates it.
    pub fn status_code(&self) -> i64 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_set_is_closed() {
        assert!(Error::VersionLocked.is_warning());
        assert!(Error::BuildTimeout.is_warning());
        assert!(Error::Repository("denied".into()).is_warning());
        assert!(Error::command_failed("true", None).is_warning());
        assert!(!Error::environment("boom").is_warning());
        assert!(!Error::Api("500".into()).is_warning());
    }

    #[test]
    fn unstructured_errors_are_not_user_facing() {
        assert!(Error::environment("boom").is_structured());
        assert!(Error::CreationFailed.is_structured());
        assert!(!Error::Engine("conflict".into()).is_structured());
        assert!(!Error::EngineConnection("refused".into()).is_structured());
        assert!(!Error::Io("permission denied".into()).is_structured());
    }

    #[test]
    fn command_failed_message_includes_output() {
        let err = Error::command_failed("pip install sphinx", Some("no matching distribution"));
        assert_eq!(
            err.to_string(),
            "Command pip install sphinx failed:\nno matching distribution"
        );
        let bare = Error::command_failed("pip install sphinx", None);
        assert_eq!(bare.to_string(), "Command pip install sphinx failed");
    }
}
