#![deny(unused)]
//! Tracking API client for docbuild.
//!
//! The build environments report two resources: command results (`POST
//! {base}/command/`) and the build record itself (`PUT {base}/build/{id}/`).
//! Oversized command payloads switch from JSON to multipart form encoding,
//! which the tracking API accepts for projects with the large-data feature.

pub mod client;
pub mod mock;

pub use client::{ApiClient, CommandPayload, TrackingApi};
pub use mock::MockTracker;
