//! Outbound notification delivery.
//!
//! Deliveries are submitted to a [`NotificationPool`]: a bounded queue
//! drained by a fixed number of worker tasks. Each attempt is bounded by a
//! timeout and its outcome is reported on a result channel. Submission never
//! waits; a full queue is reported back to the caller as a dependency error.

use anyhow::Result;
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::error::{CoreError, Reason};
use crate::model::{NotifyChannel, Severity};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payload {
    pub title: String,
    pub body: String,
    pub severity: Severity,
    pub farm_id: String,
    pub alert_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub recipient: String,
    pub channel: NotifyChannel,
    pub payload: Payload,
}

#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub delivery: Delivery,
    /// `Err` carries the failure description.
    pub outcome: std::result::Result<(), String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, recipient: &str, payload: &Payload, channel: NotifyChannel)
        -> Result<()>;

    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Writes notifications to the tracing log. Default sink for development.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(
        &self,
        recipient: &str,
        payload: &Payload,
        channel: NotifyChannel,
    ) -> Result<()> {
        info!(
            recipient,
            channel = channel.as_str(),
            severity = payload.severity.as_str(),
            farm = %payload.farm_id,
            "notification: {}: {}",
            payload.title,
            payload.body
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Publishes notifications as JSON to `notify/<channel>/<recipient>` for a
/// downstream gateway (mail, SMS, push) to pick up.
pub struct MqttNotifier {
    client: AsyncClient,
}

impl MqttNotifier {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

pub(crate) fn notify_topic(channel: NotifyChannel, recipient: &str) -> String {
    format!("notify/{}/{recipient}", channel.as_str())
}

#[async_trait]
impl Notifier for MqttNotifier {
    async fn deliver(
        &self,
        recipient: &str,
        payload: &Payload,
        channel: NotifyChannel,
    ) -> Result<()> {
        let body = serde_json::to_vec(payload)?;
        self.client
            .publish(notify_topic(channel, recipient), QoS::AtLeastOnce, false, body)
            .await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "mqtt"
    }
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub workers: usize,
    pub queue_depth: usize,
    pub timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_depth: 64,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Clone)]
pub struct NotificationPool {
    tx: mpsc::Sender<Delivery>,
}

impl NotificationPool {
    /// Spawn the workers. The returned receiver yields one report per
    /// attempted delivery; reports are dropped if nobody keeps up with it.
    pub fn spawn(
        notifier: Arc<dyn Notifier>,
        settings: &PoolSettings,
    ) -> (Self, mpsc::Receiver<DeliveryReport>) {
        let depth = settings.queue_depth.max(1);
        let (tx, rx) = mpsc::channel::<Delivery>(depth);
        let (report_tx, report_rx) = mpsc::channel::<DeliveryReport>(depth);
        let rx = Arc::new(Mutex::new(rx));
        let timeout = Duration::from_millis(settings.timeout_ms);

        for worker in 0..settings.workers.max(1) {
            let rx = Arc::clone(&rx);
            let notifier = Arc::clone(&notifier);
            let report_tx = report_tx.clone();
            tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    let Some(delivery) = next else { break };
                    let outcome = attempt(notifier.as_ref(), &delivery, timeout).await;
                    match &outcome {
                        Ok(()) => info!(
                            worker,
                            sink = notifier.name(),
                            recipient = %delivery.recipient,
                            "notification delivered"
                        ),
                        Err(e) => warn!(
                            worker,
                            sink = notifier.name(),
                            recipient = %delivery.recipient,
                            "notification failed: {e}"
                        ),
                    }
                    let _ = report_tx.try_send(DeliveryReport { delivery, outcome });
                }
            });
        }

        (Self { tx }, report_rx)
    }

    pub fn submit(&self, delivery: Delivery) -> crate::error::Result<()> {
        self.tx.try_send(delivery).map_err(|e| {
            let why = match e {
                mpsc::error::TrySendError::Full(_) => "notification queue full",
                mpsc::error::TrySendError::Closed(_) => "notification workers stopped",
            };
            CoreError::dependency(Reason::NotificationUnavailable, why)
        })
    }
}

async fn attempt(
    notifier: &dyn Notifier,
    delivery: &Delivery,
    timeout: Duration,
) -> std::result::Result<(), String> {
    let call = notifier.deliver(&delivery.recipient, &delivery.payload, delivery.channel);
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
    }
}
