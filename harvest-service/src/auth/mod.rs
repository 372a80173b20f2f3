//! Login state machine.
//!
//! ```text
//! Unauthenticated -> SessionProbe -> Authenticated
//!                         |
//!                         v
//!                   ExplicitLogin -> Authenticated | Failed
//! ```

use std::{future::Future, time::Duration};

use time::OffsetDateTime;

use crate::{
    alert::{Alert, AlertSender},
    pipeline::PipelineError,
    portal::{Credentials, PortalClient, PortalError},
    session::{SessionArtifact, SessionStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    SessionProbe,
    ExplicitLogin,
    Authenticated,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Rejected,
    TimedOut,
    Error(String),
}

/// Bookkeeping for one explicit login try.
#[derive(Debug, Clone)]
pub struct AuthAttempt {
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub at: OffsetDateTime,
    /// Delay applied after this attempt, if it failed.
    pub backoff: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    ReusedSession,
    Login,
}

#[derive(Debug, Clone)]
pub struct AuthReport {
    pub method: AuthMethod,
    pub attempts: Vec<AuthAttempt>,
}

/// Linear backoff `min(base * attempt, cap)`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt).min(self.cap)
    }
}

/// Bound a portal call by `limit`, mapping expiry to `NetworkTimeout`.
pub async fn with_deadline<T, F>(
    operation: &'static str,
    limit: Duration,
    fut: F,
) -> Result<Result<T, PortalError>, PipelineError>
where
    F: Future<Output = Result<T, PortalError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| PipelineError::NetworkTimeout { operation })
}

pub struct AuthOrchestrator<'a> {
    portal: &'a dyn PortalClient,
    sessions: &'a SessionStore,
    alerts: AlertSender,
    backoff: BackoffPolicy,
    call_timeout: Duration,
    state: AuthState,
}

impl<'a> AuthOrchestrator<'a> {
    pub fn new(
        portal: &'a dyn PortalClient,
        sessions: &'a SessionStore,
        alerts: AlertSender,
        backoff: BackoffPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            portal,
            sessions,
            alerts,
            backoff,
            call_timeout,
            state: AuthState::Unauthenticated,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    fn transition(&mut self, next: AuthState) {
        tracing::debug!(from = ?self.state, to = ?next, "auth state transition");
        self.state = next;
    }

    /// Make the portal client authenticated, reusing the cached session when
    /// it still passes the validity probe.
    pub async fn ensure_authenticated(
        &mut self,
        credentials: &Credentials,
        max_retries: u32,
    ) -> Result<AuthReport, PipelineError> {
        let mut using_cached = false;

        if let Some(artifact) = self.sessions.load() {
            self.transition(AuthState::SessionProbe);
            using_cached = true;

            match self.probe(&artifact).await {
                Ok(()) => {
                    tracing::info!(saved_at = %artifact.saved_at, "reusing cached portal session");
                    metrics::counter!("harvest_session_reused_total").increment(1);
                    self.transition(AuthState::Authenticated);
                    return Ok(AuthReport {
                        method: AuthMethod::ReusedSession,
                        attempts: Vec::new(),
                    });
                }
                Err(e) => tracing::info!(error = %e, "cached session rejected, falling back to login"),
            }
        }

        self.transition(AuthState::ExplicitLogin);
        let max_attempts = max_retries.max(1);
        let mut attempts = Vec::with_capacity(max_attempts as usize);

        for attempt in 1..=max_attempts {
            metrics::counter!("harvest_login_attempts_total").increment(1);
            let outcome = match with_deadline("login", self.call_timeout, self.portal.login(credentials)).await {
                Ok(Ok(true)) => AttemptOutcome::Succeeded,
                Ok(Ok(false)) => AttemptOutcome::Rejected,
                Ok(Err(e)) => AttemptOutcome::Error(e.to_string()),
                Err(_) => AttemptOutcome::TimedOut,
            };

            if outcome == AttemptOutcome::Succeeded {
                tracing::info!(attempt, "portal login succeeded");
                self.persist_session().await;
                attempts.push(AuthAttempt {
                    attempt,
                    outcome,
                    at: OffsetDateTime::now_utc(),
                    backoff: None,
                });
                self.transition(AuthState::Authenticated);
                return Ok(AuthReport {
                    method: AuthMethod::Login,
                    attempts,
                });
            }

            tracing::warn!(attempt, max_attempts, outcome = ?outcome, "portal login attempt failed");

            if attempt == 1 && using_cached {
                self.drop_cached_session().await;
                using_cached = false;
            }

            let delay = self.backoff.delay(attempt);
            attempts.push(AuthAttempt {
                attempt,
                outcome,
                at: OffsetDateTime::now_utc(),
                backoff: Some(delay),
            });
            tokio::time::sleep(delay).await;
        }

        self.transition(AuthState::Failed);
        metrics::counter!("harvest_login_failures_total").increment(1);
        tracing::error!(attempts = max_attempts, "portal login failed after all retries");

        let last = attempts
            .last()
            .map(|a| format!("{:?}", a.outcome))
            .unwrap_or_default();
        self.alerts.emit(
            Alert::new(format!("portal login failed after {max_attempts} attempts"))
                .with("attempts", max_attempts)
                .with("last_outcome", last)
                .with("session_path", self.sessions.path().display()),
        );

        Err(PipelineError::AuthenticationFailure {
            attempts: max_attempts,
        })
    }

    async fn probe(&self, artifact: &SessionArtifact) -> Result<(), PipelineError> {
        match with_deadline("restore_session", self.call_timeout, self.portal.restore_session(artifact)).await? {
            Ok(()) => {}
            Err(e) => return Err(PipelineError::Portal(e.to_string())),
        }

        match with_deadline("is_session_valid", self.call_timeout, self.portal.is_session_valid()).await? {
            Ok(true) => Ok(()),
            Ok(false) => Err(PipelineError::SessionInvalid),
            Err(e) => Err(PipelineError::Portal(e.to_string())),
        }
    }

    async fn persist_session(&self) {
        let artifact = match with_deadline("export_session", self.call_timeout, self.portal.export_session()).await {
            Ok(Ok(a)) => a,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "could not export session after login");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not export session after login");
                return;
            }
        };

        if let Err(e) = self.sessions.save(&artifact) {
            tracing::error!(error = %e, path = %self.sessions.path().display(), "failed to persist session artifact");
        }
    }

    /// Forget the cached artifact on disk and in the client so later attempts
    /// start from a clean session.
    async fn drop_cached_session(&self) {
        tracing::info!("first login with cached session failed; discarding cached session");
        if let Err(e) = self.sessions.invalidate() {
            tracing::error!(error = %e, "failed to delete cached session artifact");
        }
        match with_deadline("reset_session", self.call_timeout, self.portal.reset_session()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "portal session reset failed"),
            Err(e) => tracing::warn!(error = %e, "portal session reset failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        alert::alert_channel,
        portal::testing::{MockPortal, PortalEvent},
    };
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn creds() -> Credentials {
        Credentials::new("user@example.com", "secret")
    }

    fn backoff() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(10))
    }

    #[test]
    fn backoff_grows_linearly_until_cap() {
        let policy = backoff();
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(6));
        assert_eq!(policy.delay(9), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn valid_cached_session_skips_login() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionStore::new(dir.path().join("session.json"));
        sessions
            .save(&SessionArtifact::new(json!({"cookies": {"sid": "cached"}})))
            .unwrap();
        let portal = MockPortal::default().with_valid_session();
        let (alerts, _rx) = alert_channel(4);

        let mut orch = AuthOrchestrator::new(&portal, &sessions, alerts, backoff(), TIMEOUT);
        let report = orch.ensure_authenticated(&creds(), 2).await.unwrap();

        assert_eq!(report.method, AuthMethod::ReusedSession);
        assert_eq!(orch.state(), AuthState::Authenticated);
        assert_eq!(portal.login_count(), 0);
        assert_eq!(portal.events(), vec![PortalEvent::Restore, PortalEvent::Probe]);
    }

    #[tokio::test]
    async fn fresh_login_persists_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionStore::new(dir.path().join("session.json"));
        let portal = MockPortal::default().with_logins(&[true]);
        let (alerts, _rx) = alert_channel(4);

        let mut orch = AuthOrchestrator::new(&portal, &sessions, alerts, backoff(), TIMEOUT);
        let report = orch.ensure_authenticated(&creds(), 2).await.unwrap();

        assert_eq!(report.method, AuthMethod::Login);
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(sessions.load().unwrap().state, json!({"cookies": {"sid": "fresh"}}));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_with_single_alert() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionStore::new(dir.path().join("session.json"));
        let portal = MockPortal::default();
        let (alerts, mut rx) = alert_channel(4);
        let policy = backoff();

        let started = tokio::time::Instant::now();
        let mut orch = AuthOrchestrator::new(&portal, &sessions, alerts, policy, TIMEOUT);
        let res = orch.ensure_authenticated(&creds(), 2).await;
        let elapsed = started.elapsed();

        assert!(matches!(res, Err(PipelineError::AuthenticationFailure { attempts: 2 })));
        assert_eq!(orch.state(), AuthState::Failed);
        assert_eq!(portal.login_count(), 2);
        assert_eq!(elapsed, policy.delay(1) + policy.delay(2));

        drop(orch);
        let alert = rx.recv().await.unwrap();
        assert!(alert.message.contains("2 attempts"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_session_is_invalidated_before_second_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let sessions = SessionStore::new(&path);
        sessions
            .save(&SessionArtifact::new(json!({"cookies": {"sid": "stale"}})))
            .unwrap();
        let portal = MockPortal::default().watching(path.clone()).with_logins(&[false, true]);
        let (alerts, mut rx) = alert_channel(4);

        let mut orch = AuthOrchestrator::new(&portal, &sessions, alerts, backoff(), TIMEOUT);
        let report = orch.ensure_authenticated(&creds(), 3).await.unwrap();

        assert_eq!(report.attempts.len(), 2);
        assert_eq!(
            portal.events(),
            vec![
                PortalEvent::Restore,
                PortalEvent::Probe,
                PortalEvent::Login {
                    had_state: true,
                    session_file_present: true
                },
                PortalEvent::Reset,
                PortalEvent::Login {
                    had_state: false,
                    session_file_present: false
                },
                PortalEvent::Export,
            ]
        );
        // The fresh session replaced the stale one.
        assert_eq!(sessions.load().unwrap().state, json!({"cookies": {"sid": "fresh"}}));

        drop(orch);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_still_attempts_once() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionStore::new(dir.path().join("session.json"));
        let portal = MockPortal::default();
        let (alerts, _rx) = alert_channel(4);

        let mut orch = AuthOrchestrator::new(&portal, &sessions, alerts, backoff(), TIMEOUT);
        let res = orch.ensure_authenticated(&creds(), 0).await;

        assert!(matches!(res, Err(PipelineError::AuthenticationFailure { attempts: 1 })));
        assert_eq!(portal.login_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn login_timeouts_count_as_failed_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionStore::new(dir.path().join("session.json"));
        let portal = MockPortal::default()
            .with_logins(&[true, true])
            .with_login_delay(Duration::from_secs(3600));
        let (alerts, mut rx) = alert_channel(4);
        let policy = backoff();
        let call_timeout = Duration::from_secs(2);

        let started = tokio::time::Instant::now();
        let mut orch = AuthOrchestrator::new(&portal, &sessions, alerts, policy, call_timeout);
        let res = orch.ensure_authenticated(&creds(), 2).await;
        let elapsed = started.elapsed();

        assert!(matches!(res, Err(PipelineError::AuthenticationFailure { attempts: 2 })));
        assert_eq!(orch.state(), AuthState::Failed);
        assert_eq!(portal.login_count(), 2);
        assert_eq!(elapsed, call_timeout * 2 + policy.delay(1) + policy.delay(2));
        assert!(sessions.load().is_none());

        drop(orch);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_timeout_falls_through_to_login() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionStore::new(dir.path().join("session.json"));
        sessions
            .save(&SessionArtifact::new(json!({"cookies": {"sid": "cached"}})))
            .unwrap();
        let portal = MockPortal::default()
            .with_valid_session()
            .with_probe_delay(Duration::from_secs(3600))
            .with_logins(&[true]);
        let (alerts, mut rx) = alert_channel(4);

        let mut orch = AuthOrchestrator::new(&portal, &sessions, alerts, backoff(), Duration::from_secs(2));
        let report = orch.ensure_authenticated(&creds(), 2).await.unwrap();

        assert_eq!(report.method, AuthMethod::Login);
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(orch.state(), AuthState::Authenticated);
        assert_eq!(&portal.events()[..2], &[PortalEvent::Restore, PortalEvent::Probe]);
        assert_eq!(portal.login_count(), 1);

        drop(orch);
        assert!(rx.recv().await.is_none());
    }
}
