//! Fire-and-forget alerting.
//!
//! Producers hold an [`AlertSender`] and never wait on delivery. A single
//! worker task drains the channel into a [`Notifier`] and owns retries.

use std::{collections::BTreeMap, time::Duration};

use futures::StreamExt;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub message: String,
    pub context: BTreeMap<String, String>,
    #[serde(with = "time::serde::rfc3339")]
    pub raised_at: OffsetDateTime,
}

impl Alert {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: BTreeMap::new(),
            raised_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }
}

#[derive(Clone, Debug)]
pub struct AlertSender {
    tx: mpsc::Sender<Alert>,
}

pub type AlertReceiver = mpsc::Receiver<Alert>;

pub fn alert_channel(capacity: usize) -> (AlertSender, AlertReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (AlertSender { tx }, rx)
}

impl AlertSender {
    /// Queue an alert without waiting. A full or closed channel is logged.
    pub fn emit(&self, alert: Alert) {
        metrics::counter!("harvest_alerts_emitted_total").increment(1);
        if let Err(e) = self.tx.try_send(alert) {
            metrics::counter!("harvest_alerts_dropped_total").increment(1);
            let reason = match &e {
                mpsc::error::TrySendError::Full(_) => "channel full",
                mpsc::error::TrySendError::Closed(_) => "channel closed",
            };
            tracing::warn!(reason, message = %e.into_inner().message, "alert dropped");
        }
    }
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Writes alerts to the log at error level.
#[derive(Clone, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: &Alert) -> anyhow::Result<()> {
        tracing::error!(context = ?alert.context, "ALERT: {}", alert.message);
        Ok(())
    }
}

/// Posts alerts as JSON to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(alert)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Drain `rx` into `notifier` until every sender is dropped.
///
/// Each alert gets up to `max_attempts` deliveries with linear backoff; alerts
/// that still fail are logged and dropped.
pub fn spawn_alert_worker<N>(
    rx: AlertReceiver,
    notifier: N,
    max_attempts: u32,
    retry_backoff: Duration,
) -> JoinHandle<()>
where
    N: Notifier + 'static,
{
    tokio::spawn(async move {
        let mut alerts = ReceiverStream::new(rx);
        while let Some(alert) = alerts.next().await {
            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                match notifier.notify(&alert).await {
                    Ok(()) => {
                        metrics::counter!("harvest_alerts_delivered_total").increment(1);
                        break;
                    }
                    Err(e) if attempt < max_attempts => {
                        tracing::warn!(error = %e, attempt, "alert delivery failed, retrying with backoff");
                        tokio::time::sleep(retry_backoff * attempt).await;
                    }
                    Err(e) => {
                        metrics::counter!("harvest_alerts_failed_total").increment(1);
                        tracing::error!(error = %e, message = %alert.message, "alert delivery failed, giving up");
                        break;
                    }
                }
            }
        }
    })
}
