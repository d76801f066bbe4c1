#![deny(unused)]
//! Core types, settings, and error definitions for docbuild.
//!
//! This crate provides the building blocks shared by the tracking API client
//! and the build environments: the failure taxonomy, the settings layer, and
//! the read-only project/version/build resource types.

pub mod error;
pub mod settings;
pub mod types;

pub use error::{Error, Result};
pub use settings::Settings;
pub use types::{BuildConfig, BuildRecord, BuildState, Feature, Project, Version};

/// Turn an arbitrary string into a DNS-safe slug.
///
/// Lowercases, maps runs of non-alphanumeric characters to a single `-`, and
/// trims leading/trailing dashes. Used for container names, which double as
/// container hostnames.
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut last_dash = true;
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::slugify;

    #[test]
    fn slugify_collapses_special_characters() {
        assert_eq!(slugify("build-77-project-12-My_Project"), "build-77-project-12-my-project");
        assert_eq!(slugify("--weird..name--"), "weird-name");
        assert_eq!(slugify(""), "");
    }
}
