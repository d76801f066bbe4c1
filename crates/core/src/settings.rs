//! Application settings.
//!
//! Layered configuration in the usual order: defaults, then an optional
//! `docbuild.toml` file, then `DOCBUILD_*` environment variables (nested keys
//! separated by `__`, e.g. `DOCBUILD_DOCKER__IMAGE`).

use std::collections::HashMap;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Exit code a container reports when its dead-man `sleep` elapsed.
pub const TIMEOUT_EXIT_CODE: i64 = 42;

/// Exit code the engine reports for an OOM-killed process.
pub const OOM_EXIT_CODE: i64 = 137;

/// Containers are named after the build, and the name doubles as the
/// container hostname, so it is capped at the hostname limit.
pub const HOSTNAME_MAX_LEN: usize = 64;

/// Bytes reserved for the rest of the request body when deciding whether a
/// command's output still fits under the tracking API upload limit.
pub const OUTPUT_MARGIN: usize = 512 * 1024;

/// Environment variables internal to the build system, stripped from every
/// command's environment before execution.
pub const INTERNAL_VARIABLES: &[&str] = &["DOCBUILD_SETTINGS", "DOCBUILD_API_TOKEN"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api: ApiSettings,
    pub docker: DockerSettings,
    /// Hard limit the tracking API accepts for a single request body.
    pub upload_limit_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerSettings {
    /// Engine socket or URI, e.g. `unix:///var/run/docker.sock`.
    pub socket: String,
    /// Default build image; overridable per project and per build.
    pub image: String,
    pub memory_limit_bytes: i64,
    pub time_limit_secs: u64,
    /// Working directory commands run in when none is given.
    pub workdir: String,
    /// User (or `user:group`) commands run as.
    pub user: String,
    /// When builds run inside docker-compose, the named volume that holds the
    /// documentation checkouts. Bound in place of a plain host path.
    pub compose_volume: Option<String>,
    /// Extra host-path -> container-path read-write binds.
    pub additional_binds: HashMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api: ApiSettings::default(),
            docker: DockerSettings::default(),
            upload_limit_bytes: 2_621_440,
        }
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000/api/v2".to_string(),
            token: None,
        }
    }
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            socket: "unix:///var/run/docker.sock".to_string(),
            image: "docbuild/build:latest".to_string(),
            memory_limit_bytes: 2 * 1024 * 1024 * 1024,
            time_limit_secs: 900,
            workdir: "/home/docs".to_string(),
            user: "docs".to_string(),
            compose_volume: None,
            additional_binds: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from `docbuild.toml` (optional) and `DOCBUILD_*`
    /// environment variables.
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name("docbuild").required(false))
            .add_source(Environment::with_prefix("DOCBUILD").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Largest sanitized command output the tracking API will accept,
    /// leaving [`OUTPUT_MARGIN`] for the rest of the request.
    pub fn allowed_output_bytes(&self) -> usize {
        self.upload_limit_bytes.saturating_sub(OUTPUT_MARGIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let settings = Settings::default();
        assert!(settings.allowed_output_bytes() < settings.upload_limit_bytes);
        assert!(settings.docker.socket.starts_with("unix://"));
        assert!(settings.docker.additional_binds.is_empty());
    }
}
