//! External driver sessions (browsers) attached to a scenario

use std::path::PathBuf;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// A UI automation session a scenario drives against its deployment.
///
/// The harness only opens, closes and collects evidence from sessions; what
/// happens in between belongs to the scenario.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DriverSession: Send + Sync {
    /// Navigate to `url`
    async fn open(&self, url: &str) -> Result<()>;

    /// Close the session and release its resources
    async fn close(&self) -> Result<()>;

    /// PNG screenshot of the current page, if the session can take one
    async fn screenshot(&self) -> Result<Option<Vec<u8>>>;

    /// Recording of the session, available after `close`
    fn video_path(&self) -> Option<PathBuf>;
}

/// A screenshot taken from a named session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evidence {
    /// Name the session was registered under
    pub session: String,
    /// PNG bytes
    pub png: Vec<u8>,
}
