//! Scripted in-memory portal used by orchestrator and pipeline tests.

use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use serde_json::{json, Value};
use time::Date;

use super::{Credentials, PortalClient, PortalError};
use crate::{session::SessionArtifact, transform::RawPayload};

#[derive(Debug, Clone, PartialEq)]
pub enum PortalEvent {
    Restore,
    Probe,
    Login {
        had_state: bool,
        session_file_present: bool,
    },
    Reset,
    Export,
    FetchDaily,
    FetchHourly(Option<Date>),
}

pub struct MockPortal {
    session_valid: bool,
    login_results: Mutex<VecDeque<bool>>,
    daily_payload: Option<String>,
    hourly_payload: Option<String>,
    fetch_delay: Option<Duration>,
    login_delay: Option<Duration>,
    probe_delay: Option<Duration>,
    /// Session file whose presence is recorded at every login call.
    watch_file: Option<PathBuf>,
    state: Mutex<Option<Value>>,
    events: Mutex<Vec<PortalEvent>>,
    closes: AtomicUsize,
}

impl Default for MockPortal {
    fn default() -> Self {
        Self {
            session_valid: false,
            login_results: Mutex::new(VecDeque::new()),
            daily_payload: None,
            hourly_payload: None,
            fetch_delay: None,
            login_delay: None,
            probe_delay: None,
            watch_file: None,
            state: Mutex::new(None),
            events: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        }
    }
}

impl MockPortal {
    /// Queue login outcomes; once drained every further login fails.
    pub fn with_logins(self, results: &[bool]) -> Self {
        *self.login_results.lock().unwrap() = results.iter().copied().collect();
        self
    }

    pub fn with_valid_session(mut self) -> Self {
        self.session_valid = true;
        self
    }

    pub fn with_daily(mut self, payload: &str) -> Self {
        self.daily_payload = Some(payload.to_string());
        self
    }

    pub fn with_hourly(mut self, payload: &str) -> Self {
        self.hourly_payload = Some(payload.to_string());
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub fn with_login_delay(mut self, delay: Duration) -> Self {
        self.login_delay = Some(delay);
        self
    }

    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = Some(delay);
        self
    }

    /// Record at every login whether `path` exists.
    pub fn watching(mut self, path: PathBuf) -> Self {
        self.watch_file = Some(path);
        self
    }

    pub fn events(&self) -> Vec<PortalEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn login_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, PortalEvent::Login { .. }))
            .count()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn record(&self, event: PortalEvent) {
        self.events.lock().unwrap().push(event);
    }

    async fn payload(&self, body: &Option<String>) -> Result<RawPayload, PortalError> {
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        let body = body
            .as_deref()
            .ok_or_else(|| PortalError::Payload("chart data input not found".to_string()))?;
        serde_json::from_str(body).map_err(|e| PortalError::Payload(e.to_string()))
    }
}

#[async_trait::async_trait]
impl PortalClient for MockPortal {
    async fn is_session_valid(&self) -> Result<bool, PortalError> {
        self.record(PortalEvent::Probe);
        if let Some(delay) = self.probe_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.session_valid)
    }

    async fn login(&self, _credentials: &Credentials) -> Result<bool, PortalError> {
        let had_state = self.state.lock().unwrap().is_some();
        let session_file_present = self.watch_file.as_ref().is_some_and(|p| p.exists());
        self.record(PortalEvent::Login {
            had_state,
            session_file_present,
        });
        if let Some(delay) = self.login_delay {
            tokio::time::sleep(delay).await;
        }

        let ok = self.login_results.lock().unwrap().pop_front().unwrap_or(false);
        if ok {
            *self.state.lock().unwrap() = Some(json!({"cookies": {"sid": "fresh"}}));
        }
        Ok(ok)
    }

    async fn fetch_daily_usage(&self) -> Result<RawPayload, PortalError> {
        self.record(PortalEvent::FetchDaily);
        self.payload(&self.daily_payload).await
    }

    async fn fetch_hourly_usage(&self, target: Option<Date>) -> Result<RawPayload, PortalError> {
        self.record(PortalEvent::FetchHourly(target));
        self.payload(&self.hourly_payload).await
    }

    async fn restore_session(&self, artifact: &SessionArtifact) -> Result<(), PortalError> {
        self.record(PortalEvent::Restore);
        *self.state.lock().unwrap() = Some(artifact.state.clone());
        Ok(())
    }

    async fn export_session(&self) -> Result<SessionArtifact, PortalError> {
        self.record(PortalEvent::Export);
        let state = self
            .state
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| PortalError::SessionState("no session to export".to_string()))?;
        Ok(SessionArtifact::new(state))
    }

    async fn reset_session(&self) -> Result<(), PortalError> {
        self.record(PortalEvent::Reset);
        *self.state.lock().unwrap() = None;
        Ok(())
    }

    async fn close(&self) -> Result<(), PortalError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
