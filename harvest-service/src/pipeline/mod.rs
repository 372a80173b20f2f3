use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use futures::{stream, Stream};
use serde::Deserialize;
use time::{Date, OffsetDateTime, UtcOffset};
use usage_client::{Granularity, UsageRecord};

use crate::{
    alert::AlertSender,
    auth::{with_deadline, AuthOrchestrator, AuthReport, BackoffPolicy},
    portal::{Credentials, PortalClient, PortalError},
    session::SessionStore,
    sinks::{ExportSink, SqliteUsageStore},
    transform::{accept_valid, normalize_daily, normalize_hourly, DailySeries, HourlySeries, RawPayload},
};

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("cached session rejected by the portal")]
    SessionInvalid,
    #[error("authentication failed after {attempts} attempts")]
    AuthenticationFailure { attempts: u32 },
    #[error("portal call '{operation}' timed out")]
    NetworkTimeout { operation: &'static str },
    #[error("usage data unavailable: {0}")]
    DataUnavailable(String),
    #[error("persistence failed: {0}")]
    PersistenceFailure(String),
    #[error("portal error: {0}")]
    Portal(String),
    #[error("record rejected: {0}")]
    Validation(String),
    #[error("export failed: {0}")]
    Export(String),
}

/// Consumer of a run's normalized records.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    /// Consume `input` and return the number of records written.
    async fn run<S>(&self, input: S) -> Result<usize, PipelineError>
    where
        S: Stream<Item = UsageRecord> + Send + Unpin + 'static;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Daily,
    Hourly,
    Both,
}

impl RunMode {
    pub fn includes(&self, granularity: Granularity) -> bool {
        matches!(
            (self, granularity),
            (Self::Both, _) | (Self::Daily, Granularity::Daily) | (Self::Hourly, Granularity::Hourly)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Hourly => "hourly",
            Self::Both => "both",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "hourly" => Ok(Self::Hourly),
            "both" => Ok(Self::Both),
            other => Err(format!("unknown run mode '{other}', expected daily|hourly|both")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HalfOutcome {
    Skipped,
    Collected(usize),
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub auth: AuthReport,
    pub daily: HalfOutcome,
    pub hourly: HalfOutcome,
    pub upserted: usize,
    pub exported: usize,
    pub export_errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub mode: RunMode,
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    pub call_timeout: Duration,
    pub hourly_target_date: Option<Date>,
    /// Offset of the portal's local calendar.
    pub utc_offset: UtcOffset,
}

/// Owns the portal handle for the duration of one run.
///
/// [`release`](Self::release) closes the client; if the run future is dropped
/// before that, `Drop` schedules the close on the current runtime.
pub struct RunContext {
    portal: Arc<dyn PortalClient>,
    released: bool,
}

impl RunContext {
    pub fn new(portal: Arc<dyn PortalClient>) -> Self {
        Self {
            portal,
            released: false,
        }
    }

    pub fn portal(&self) -> &dyn PortalClient {
        self.portal.as_ref()
    }

    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.portal.close().await {
            tracing::warn!(error = %e, "failed to close portal client");
        }
    }
}

impl Drop for RunContext {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let portal = self.portal.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!("run cancelled; releasing portal client in background");
                handle.spawn(async move {
                    if let Err(e) = portal.close().await {
                        tracing::warn!(error = %e, "failed to close portal client");
                    }
                });
            }
            Err(_) => tracing::error!("run dropped outside a runtime; portal client not closed"),
        }
    }
}

/// One harvest: authenticate, fetch, normalize, persist.
pub struct HarvestPipeline {
    pub store: SqliteUsageStore,
    pub sessions: SessionStore,
    pub exports: Vec<ExportSink>,
    pub alerts: AlertSender,
    pub settings: PipelineSettings,
}

impl HarvestPipeline {
    pub async fn run(
        &self,
        portal: Arc<dyn PortalClient>,
        credentials: &Credentials,
    ) -> Result<RunReport, PipelineError> {
        metrics::counter!("harvest_runs_total").increment(1);
        let ctx = RunContext::new(portal);
        let result = self.run_in(&ctx, credentials).await;
        ctx.release().await;

        match &result {
            Ok(report) => tracing::info!(
                mode = %self.settings.mode,
                daily = ?report.daily,
                hourly = ?report.hourly,
                upserted = report.upserted,
                "harvest run finished"
            ),
            Err(e) => {
                metrics::counter!("harvest_runs_failed_total").increment(1);
                tracing::error!(error = %e, mode = %self.settings.mode, "harvest run failed");
            }
        }
        result
    }

    async fn run_in(&self, ctx: &RunContext, credentials: &Credentials) -> Result<RunReport, PipelineError> {
        let portal = ctx.portal();
        let settings = &self.settings;

        let mut orchestrator = AuthOrchestrator::new(
            portal,
            &self.sessions,
            self.alerts.clone(),
            settings.backoff,
            settings.call_timeout,
        );
        let auth = orchestrator
            .ensure_authenticated(credentials, settings.max_retries)
            .await?;

        let now = OffsetDateTime::now_utc().to_offset(settings.utc_offset);
        let mut records: Vec<UsageRecord> = Vec::new();

        let daily = if settings.mode.includes(Granularity::Daily) {
            self.collect_daily(portal, now, &mut records).await?
        } else {
            HalfOutcome::Skipped
        };

        let hourly = if settings.mode.includes(Granularity::Hourly) {
            let target = settings.hourly_target_date.unwrap_or_else(|| now.date());
            self.collect_hourly(portal, target, now, &mut records).await?
        } else {
            HalfOutcome::Skipped
        };

        let requested = [&daily, &hourly]
            .into_iter()
            .filter(|o| **o != HalfOutcome::Skipped)
            .collect::<Vec<_>>();
        if requested.iter().all(|o| matches!(o, HalfOutcome::Unavailable(_))) {
            let reasons = requested
                .iter()
                .filter_map(|o| match o {
                    HalfOutcome::Unavailable(r) => Some(r.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(PipelineError::DataUnavailable(reasons));
        }

        let upserted = self.store.run(stream::iter(records.clone())).await?;

        let mut exported = 0;
        let mut export_errors = Vec::new();
        for sink in &self.exports {
            match sink.run(stream::iter(records.clone())).await {
                Ok(n) => exported += n,
                Err(e) => {
                    tracing::error!(error = %e, "usage export failed");
                    export_errors.push(e.to_string());
                }
            }
        }

        Ok(RunReport {
            auth,
            daily,
            hourly,
            upserted,
            exported,
            export_errors,
        })
    }

    async fn collect_daily(
        &self,
        portal: &dyn PortalClient,
        now: OffsetDateTime,
        out: &mut Vec<UsageRecord>,
    ) -> Result<HalfOutcome, PipelineError> {
        let fetched = with_deadline("fetch_daily_usage", self.settings.call_timeout, portal.fetch_daily_usage()).await?;
        let series = match payload_or_unavailable(fetched).and_then(DailySeries::try_from) {
            Ok(s) => s,
            Err(PipelineError::DataUnavailable(reason)) => return Ok(unavailable(Granularity::Daily, reason)),
            Err(e) => return Err(e),
        };

        let before = out.len();
        out.extend(accept_valid(normalize_daily(series, now)));
        let collected = out.len() - before;
        tracing::info!(records = collected, "daily usage collected");
        Ok(HalfOutcome::Collected(collected))
    }

    async fn collect_hourly(
        &self,
        portal: &dyn PortalClient,
        target: Date,
        now: OffsetDateTime,
        out: &mut Vec<UsageRecord>,
    ) -> Result<HalfOutcome, PipelineError> {
        let fetched = with_deadline(
            "fetch_hourly_usage",
            self.settings.call_timeout,
            portal.fetch_hourly_usage(self.settings.hourly_target_date),
        )
        .await?;
        let series = match payload_or_unavailable(fetched).and_then(HourlySeries::try_from) {
            Ok(s) => s,
            Err(PipelineError::DataUnavailable(reason)) => return Ok(unavailable(Granularity::Hourly, reason)),
            Err(e) => return Err(e),
        };

        let before = out.len();
        out.extend(accept_valid(normalize_hourly(series, target, now)));
        let collected = out.len() - before;
        tracing::info!(records = collected, %target, "hourly usage collected");
        Ok(HalfOutcome::Collected(collected))
    }
}

/// Unusable pages become `DataUnavailable`; transport failures stay fatal.
fn payload_or_unavailable(fetched: Result<RawPayload, PortalError>) -> Result<RawPayload, PipelineError> {
    fetched.map_err(|e| match e {
        PortalError::Payload(reason) | PortalError::UnexpectedPage(reason) => PipelineError::DataUnavailable(reason),
        other => PipelineError::Portal(other.to_string()),
    })
}

fn unavailable(granularity: Granularity, reason: String) -> HalfOutcome {
    metrics::counter!("harvest_data_unavailable_total", "granularity" => granularity.as_str()).increment(1);
    tracing::warn!(%granularity, reason = %reason, "usage data unavailable; skipping this half of the run");
    HalfOutcome::Unavailable(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        alert::alert_channel,
        portal::testing::{MockPortal, PortalEvent},
        sinks::ExportFormat,
    };
    use time::macros::{date, offset};
    use usage_client::db::usage_queries::{hourly_usage_for_date, row_counts};

    const DAILY: &str = r#"{"columns":[["使用電力量",1.5,null,2.5]],"shiyoKikan":["x","3/1","3/2","3/3"]}"#;
    const HOURLY: &str = r#"{"columns":[["使用電力量",0.3,null,0.5]]}"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        pipeline: HarvestPipeline,
        alerts: crate::alert::AlertReceiver,
    }

    async fn fixture(mode: RunMode, call_timeout: Duration, export: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteUsageStore::connect(&dir.path().join("usage.db")).await.unwrap();
        let (alerts, rx) = alert_channel(8);
        let exports = if export {
            vec![ExportSink::new(ExportFormat::Csv, dir.path().join("exports"), mode.as_str())]
        } else {
            Vec::new()
        };

        let pipeline = HarvestPipeline {
            store,
            sessions: SessionStore::new(dir.path().join("session.json")),
            exports,
            alerts,
            settings: PipelineSettings {
                mode,
                max_retries: 2,
                backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5)),
                call_timeout,
                hourly_target_date: Some(date!(2025 - 09 - 16)),
                utc_offset: offset!(+9),
            },
        };

        Fixture {
            _dir: dir,
            pipeline,
            alerts: rx,
        }
    }

    fn creds() -> Credentials {
        Credentials::new("user@example.com", "secret")
    }

    #[tokio::test]
    async fn both_halves_are_stored_and_exported() {
        let fx = fixture(RunMode::Both, Duration::from_secs(5), true).await;
        let portal = Arc::new(MockPortal::default().with_daily(DAILY).with_hourly(HOURLY).with_logins(&[true]));

        let report = fx.pipeline.run(portal.clone(), &creds()).await.unwrap();

        assert_eq!(report.daily, HalfOutcome::Collected(2));
        assert_eq!(report.hourly, HalfOutcome::Collected(2));
        assert_eq!(report.upserted, 4);
        assert_eq!(report.exported, 4);
        assert!(portal.events().contains(&PortalEvent::FetchHourly(Some(date!(2025 - 09 - 16)))));
        assert_eq!(portal.close_count(), 1);

        let hourly = hourly_usage_for_date(fx.pipeline.store.pool(), date!(2025 - 09 - 16))
            .await
            .unwrap();
        assert_eq!(hourly.iter().map(|r| r.hour).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[tokio::test]
    async fn unavailable_half_does_not_block_the_other() {
        let fx = fixture(RunMode::Both, Duration::from_secs(5), false).await;
        let portal = Arc::new(MockPortal::default().with_daily(DAILY).with_logins(&[true]));

        let report = fx.pipeline.run(portal.clone(), &creds()).await.unwrap();

        assert_eq!(report.daily, HalfOutcome::Collected(2));
        assert!(matches!(report.hourly, HalfOutcome::Unavailable(_)));
        let counts = row_counts(fx.pipeline.store.pool()).await.unwrap();
        assert_eq!((counts.daily, counts.hourly), (2, 0));
    }

    #[tokio::test]
    async fn all_requested_halves_unavailable_fails_the_run() {
        let fx = fixture(RunMode::Daily, Duration::from_secs(5), false).await;
        let portal = Arc::new(
            MockPortal::default()
                .with_daily(r#"{"columns":[["使用電力量",1.0]]}"#)
                .with_logins(&[true]),
        );

        let res = fx.pipeline.run(portal.clone(), &creds()).await;

        assert!(matches!(res, Err(PipelineError::DataUnavailable(_))));
        assert!(!portal.events().contains(&PortalEvent::FetchHourly(Some(date!(2025 - 09 - 16)))));
        assert_eq!(portal.close_count(), 1);
    }

    #[tokio::test]
    async fn failed_login_aborts_and_alerts() {
        let mut fx = fixture(RunMode::Both, Duration::from_secs(5), false).await;
        let portal = Arc::new(MockPortal::default());

        let res = fx.pipeline.run(portal.clone(), &creds()).await;

        assert!(matches!(res, Err(PipelineError::AuthenticationFailure { attempts: 2 })));
        assert_eq!(portal.close_count(), 1);
        assert!(!portal.events().contains(&PortalEvent::FetchDaily));
        assert!(fx.alerts.try_recv().is_ok());
        assert!(fx.alerts.try_recv().is_err());
    }

    #[tokio::test]
    async fn fetch_timeout_aborts_before_any_write() {
        let fx = fixture(RunMode::Both, Duration::from_millis(50), false).await;
        let portal = Arc::new(
            MockPortal::default()
                .with_daily(DAILY)
                .with_hourly(HOURLY)
                .with_fetch_delay(Duration::from_secs(30))
                .with_logins(&[true]),
        );

        let res = fx.pipeline.run(portal.clone(), &creds()).await;

        assert!(matches!(
            res,
            Err(PipelineError::NetworkTimeout {
                operation: "fetch_daily_usage"
            })
        ));
        let counts = row_counts(fx.pipeline.store.pool()).await.unwrap();
        assert_eq!((counts.daily, counts.hourly), (0, 0));
        assert_eq!(portal.close_count(), 1);
    }

    #[tokio::test]
    async fn cancelled_run_still_releases_portal() {
        let fx = fixture(RunMode::Daily, Duration::from_secs(60), false).await;
        let portal = Arc::new(
            MockPortal::default()
                .with_daily(DAILY)
                .with_fetch_delay(Duration::from_secs(30))
                .with_logins(&[true]),
        );

        let creds = creds();
        let res = tokio::time::timeout(Duration::from_millis(50), fx.pipeline.run(portal.clone(), &creds)).await;
        assert!(res.is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(portal.close_count(), 1);
    }

    #[test]
    fn run_mode_parses_case_insensitively() {
        assert_eq!("Both".parse::<RunMode>().unwrap(), RunMode::Both);
        assert!("weekly".parse::<RunMode>().is_err());
        assert!(RunMode::Hourly.includes(Granularity::Hourly));
        assert!(!RunMode::Hourly.includes(Granularity::Daily));
    }
}
