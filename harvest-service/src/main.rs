use anyhow::Result;
use harvest_service::{
    alert::{alert_channel, spawn_alert_worker, LogNotifier, WebhookNotifier},
    config::AppConfig,
    metrics_server, observability,
    pipeline::{HalfOutcome, HarvestPipeline},
    portal::{Credentials, HttpPortalClient, PortalClient},
    session::SessionStore,
    sinks::{ExportSink, SqliteUsageStore},
};
use std::{sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing()?;

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr).await?;
    }

    let credentials = cfg.credentials()?;

    // Alert consumer runs until the last sender (held by the pipeline) drops.
    let (alerts, alert_rx) = alert_channel(cfg.alerts.channel_capacity);
    let retry_backoff = Duration::from_millis(cfg.alerts.retry_backoff_ms);
    let alert_worker = match &cfg.alerts.webhook_url {
        Some(url) => {
            let notifier = WebhookNotifier::new(url.clone(), Duration::from_secs(cfg.auth.call_timeout_secs))?;
            spawn_alert_worker(alert_rx, notifier, cfg.alerts.max_attempts, retry_backoff)
        }
        None => spawn_alert_worker(alert_rx, LogNotifier, cfg.alerts.max_attempts, retry_backoff),
    };

    let store = SqliteUsageStore::connect(&cfg.store.path).await?;
    let exports = cfg
        .export
        .iter()
        .map(|e| ExportSink::new(e.format, e.dir.clone(), cfg.run.mode.as_str()))
        .collect();

    let pipeline = HarvestPipeline {
        store,
        sessions: SessionStore::new(cfg.session.path.clone()),
        exports,
        alerts,
        settings: cfg.pipeline_settings()?,
    };

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            on_signal.cancel();
        }
    });

    let outcome = match cfg.run.interval_secs {
        Some(secs) => run_scheduled(&pipeline, &cfg, &credentials, Duration::from_secs(secs), &shutdown).await,
        None => tokio::select! {
            _ = shutdown.cancelled() => Err(anyhow::anyhow!("run cancelled")),
            res = run_once(&pipeline, &cfg, &credentials) => res,
        },
    };

    drop(pipeline);
    if let Err(e) = alert_worker.await {
        tracing::error!(error = %e, "alert worker terminated abnormally");
    }
    outcome
}

async fn run_once(pipeline: &HarvestPipeline, cfg: &AppConfig, credentials: &Credentials) -> Result<()> {
    let portal: Arc<dyn PortalClient> = Arc::new(HttpPortalClient::new(cfg.portal_settings())?);
    let report = pipeline.run(portal, credentials).await?;

    for (half, outcome) in [("daily", &report.daily), ("hourly", &report.hourly)] {
        if let HalfOutcome::Unavailable(reason) = outcome {
            tracing::warn!(half, reason = %reason, "half of the run produced no data");
        }
    }
    tracing::info!(
        auth = ?report.auth.method,
        login_attempts = report.auth.attempts.len(),
        upserted = report.upserted,
        exported = report.exported,
        export_failures = report.export_errors.len(),
        "run complete"
    );
    Ok(())
}

async fn run_scheduled(
    pipeline: &HarvestPipeline,
    cfg: &AppConfig,
    credentials: &Credentials,
    every: Duration,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(interval_secs = every.as_secs(), "scheduled harvesting started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            res = run_once(pipeline, cfg, credentials) => {
                if let Err(e) = res {
                    tracing::error!(error = %e, "scheduled run failed, waiting for next tick");
                }
            }
        }
    }

    tracing::info!("scheduled harvesting stopped");
    Ok(())
}
