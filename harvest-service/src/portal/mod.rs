pub mod http;
#[cfg(test)]
pub mod testing;

use std::fmt;

use time::Date;

use crate::{session::SessionArtifact, transform::RawPayload};

pub use http::{HttpPortalClient, PortalSettings};

#[derive(thiserror::Error, Debug)]
pub enum PortalError {
    #[error("portal request failed: {0}")]
    Transport(String),
    #[error("unexpected portal page: {0}")]
    UnexpectedPage(String),
    #[error("portal payload unusable: {0}")]
    Payload(String),
    #[error("session state rejected: {0}")]
    SessionState(String),
}

impl From<reqwest::Error> for PortalError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Account credentials. Held in memory for one run, never persisted.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The narrow contract the harvester needs from the usage portal.
///
/// Implementations keep their own session state (cookies, tokens) and expose
/// it through `export_session` / `restore_session` so it can be cached between
/// runs by the [`SessionStore`](crate::session::SessionStore).
#[async_trait::async_trait]
pub trait PortalClient: Send + Sync {
    /// Cheap check of whether the current session state is still accepted.
    async fn is_session_valid(&self) -> Result<bool, PortalError>;

    async fn login(&self, credentials: &Credentials) -> Result<bool, PortalError>;

    async fn fetch_daily_usage(&self) -> Result<RawPayload, PortalError>;

    async fn fetch_hourly_usage(&self, target: Option<Date>) -> Result<RawPayload, PortalError>;

    async fn restore_session(&self, artifact: &SessionArtifact) -> Result<(), PortalError>;

    async fn export_session(&self) -> Result<SessionArtifact, PortalError>;

    /// Drop all session state so the next request starts unauthenticated.
    async fn reset_session(&self) -> Result<(), PortalError>;

    /// Release underlying resources. Must be safe to call more than once.
    async fn close(&self) -> Result<(), PortalError>;
}
