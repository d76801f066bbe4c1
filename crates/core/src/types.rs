//! Resource types consumed and produced by the build environments.
//!
//! `Project`, `Version` and `BuildConfig` come from the resource provider and
//! are read-only here. `BuildRecord` is the mutable build-state dictionary
//! that is pushed to the tracking API when the environment closes.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Per-project feature flags relevant to build orchestration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Build with the testing image instead of the configured one.
    TestingBuildImage,
    /// Command results may exceed the JSON body limit; post them as
    /// multipart form data instead.
    ApiLargeData,
}

/// A project whose documentation is being built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub slug: String,
    /// Host path holding the project's checkouts and build output. Bound
    /// read-write into the build container.
    pub doc_path: PathBuf,
    /// Image override manually set by an operator.
    pub container_image: Option<String>,
    pub container_mem_limit: Option<i64>,
    pub container_time_limit: Option<u64>,
    #[serde(default)]
    pub features: HashSet<Feature>,
}

impl Project {
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }
}

/// One version (branch, tag) of a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub id: i64,
    pub slug: String,
}

/// Per-build configuration parsed from the project's config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Image requested by the user for this build.
    pub docker_image: Option<String>,
}

/// Lifecycle states of a build, as understood by the tracking API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    Triggered,
    Cloning,
    Installing,
    Building,
    Finished,
}

/// The build record, keyed by build id on the tracking API.
///
/// Mutated only by the environment that owns the build, and `PUT` back in
/// full on finalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: i64,
    pub project: i64,
    pub version: i64,
    pub state: BuildState,
    pub success: bool,
    /// User-facing failure text; empty while the build is healthy.
    pub error: String,
    pub exit_code: Option<i64>,
    /// Wall-clock build duration in seconds, set on finalization.
    pub length: Option<i64>,
    /// Hostname of the machine that ran the build.
    pub builder: String,
}

impl BuildRecord {
    pub fn new(id: i64, project: i64, version: i64) -> Self {
        Self {
            id,
            project,
            version,
            state: BuildState::Triggered,
            success: false,
            error: String::new(),
            exit_code: None,
            length: None,
            builder: String::new(),
        }
    }

    /// Whether the build reached its terminal state.
    pub fn is_finished(&self) -> bool {
        self.state == BuildState::Finished
    }
}
