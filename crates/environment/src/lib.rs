#![deny(unused)]
//! Build environments for docbuild.
//!
//! This crate implements the build lifecycle: a scoped environment is
//! entered, a sequence of commands runs inside it (on the host or inside a
//! short-lived Docker container), every result is recorded, and on exit the
//! environment reconciles command results, container state and any caught
//! failure into one terminal build record pushed to the tracking API.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  DockerBuildEnvironment                      │
//! │    container provisioning / teardown         │
//! │    ┌────────────────────────────────────┐    │
//! │    │  BuildEnvironment                  │    │
//! │    │    failure capture / finalization  │    │
//! │    │    ┌──────────────────────────┐    │    │
//! │    │    │  Environment::run        │    │    │
//! │    │    │    record & fail policy  │    │    │
//! │    │    └──────────────────────────┘    │    │
//! │    └────────────────────────────────────┘    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The container engine ([`engine::ContainerEngine`]) and the tracking API
//! are behind traits with mock implementations, so the whole lifecycle is
//! testable without Docker or a server.

pub mod build;
pub mod command;
pub mod docker;
pub mod engine;
pub mod environment;
pub mod exec;

pub use build::BuildEnvironment;
pub use command::BuildCommand;
pub use docker::DockerBuildEnvironment;
pub use engine::{ContainerEngine, ContainerSpec, ContainerState, DockerEngine, ExecOutcome, MockEngine};
pub use environment::{Environment, LocalEnvironment};
pub use exec::{CommandExecutor, ContainerExecutor, LocalExecutor};
