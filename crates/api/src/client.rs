//! HTTP client for the tracking API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use docbuild_core::types::BuildRecord;
use docbuild_core::{Error, Result};

/// One executed command, as persisted by the tracking API.
#[derive(Debug, Clone, Serialize)]
pub struct CommandPayload {
    pub build: i64,
    pub command: String,
    pub description: String,
    pub output: String,
    pub exit_code: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Seam over the tracking API, so environments can be driven against a mock
/// in tests.
#[async_trait]
pub trait TrackingApi: Send + Sync {
    /// Persist one command result. `multipart` switches the transport from
    /// JSON to multipart form encoding for oversized payloads.
    async fn post_command(&self, payload: &CommandPayload, multipart: bool) -> Result<()>;

    /// Replace the build record keyed by `record.id`.
    async fn put_build(&self, record: &BuildRecord) -> Result<()>;
}

/// reqwest-backed tracking API client.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.header("Authorization", format!("Token {token}")),
            None => builder,
        }
    }

    fn multipart_form(payload: &CommandPayload) -> reqwest::multipart::Form {
        // Every field is stringified; the API coerces them back server-side.
        reqwest::multipart::Form::new()
            .text("build", payload.build.to_string())
            .text("command", payload.command.clone())
            .text("description", payload.description.clone())
            .text("output", payload.output.clone())
            .text("exit_code", payload.exit_code.to_string())
            .text("start_time", payload.start_time.to_rfc3339())
            .text("end_time", payload.end_time.to_rfc3339())
    }
}

#[async_trait]
impl TrackingApi for ApiClient {
    async fn post_command(&self, payload: &CommandPayload, multipart: bool) -> Result<()> {
        let url = format!("{}/command/", self.base_url);
        let request = if multipart {
            self.request(self.http.post(&url))
                .multipart(Self::multipart_form(payload))
        } else {
            self.request(self.http.post(&url)).json(payload)
        };
        let response = request
            .send()
            .await
            .map_err(|e| Error::Api(e.to_string()))?;
        response
            .error_for_status()
            .map_err(|e| Error::Api(e.to_string()))?;
        tracing::debug!(
            build = payload.build,
            multipart,
            "Posted command result to tracking API."
        );
        Ok(())
    }

    async fn put_build(&self, record: &BuildRecord) -> Result<()> {
        let url = format!("{}/build/{}/", self.base_url, record.id);
        let response = self
            .request(self.http.put(&url))
            .json(record)
            .send()
            .await
            .map_err(|e| Error::Api(e.to_string()))?;
        response
            .error_for_status()
            .map_err(|e| Error::Api(e.to_string()))?;
        tracing::debug!(build = record.id, "Updated build record on tracking API.");
        Ok(())
    }
}
