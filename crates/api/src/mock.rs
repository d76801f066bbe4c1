//! In-memory tracking API for tests.

use async_trait::async_trait;
use tokio::sync::Mutex;

use docbuild_core::types::BuildRecord;
use docbuild_core::{Error, Result};

use crate::client::{CommandPayload, TrackingApi};

/// Records every payload instead of talking to a server. When `fail` is set,
/// every call returns an API error, for exercising the swallow-and-log paths.
#[derive(Default)]
pub struct MockTracker {
    pub commands: Mutex<Vec<CommandPayload>>,
    pub builds: Mutex<Vec<BuildRecord>>,
    pub fail: std::sync::atomic::AtomicBool,
}

impl MockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let tracker = Self::default();
        tracker.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        tracker
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::Api("mock tracker set to fail".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TrackingApi for MockTracker {
    async fn post_command(&self, payload: &CommandPayload, _multipart: bool) -> Result<()> {
        self.check()?;
        self.commands.lock().await.push(payload.clone());
        Ok(())
    }

    async fn put_build(&self, record: &BuildRecord) -> Result<()> {
        self.check()?;
        self.builds.lock().await.push(record.clone());
        Ok(())
    }
}
