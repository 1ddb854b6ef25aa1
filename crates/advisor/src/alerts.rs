//! Alert aggregator: de-duplicates alerts per (subject, type), orders them
//! for delivery and hands new or escalated ones to the notification pool.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::model::{Alert, AlertSubject, Severity};
use crate::notify::{Delivery, NotificationPool, Payload};
use crate::state::SharedState;
use crate::store::{AlertUpsert, Store};

pub struct AlertAggregator {
    store: Arc<dyn Store>,
    notifications: Option<NotificationPool>,
    activity: Option<SharedState>,
}

impl AlertAggregator {
    pub fn new(store: Arc<dyn Store>, notifications: Option<NotificationPool>) -> Self {
        Self {
            store,
            notifications,
            activity: None,
        }
    }

    /// Also post new and escalated alerts to the activity feed.
    pub fn with_activity(mut self, activity: SharedState) -> Self {
        self.activity = Some(activity);
        self
    }

    /// Insert `alert`, or fold it into the pending alert with the same
    /// (subject, type) by taking over its severity, message and timestamp.
    pub async fn raise(&self, alert: Alert) -> Result<AlertUpsert> {
        let outcome = self.store.upsert_alert(alert).await?;
        let a = outcome.alert();
        match &outcome {
            AlertUpsert::Inserted(_) => info!(
                subject = %a.subject.id(),
                alert_type = a.alert_type.as_str(),
                severity = a.severity.as_str(),
                "alert raised: {}",
                a.message
            ),
            AlertUpsert::Refreshed { previous, .. } => debug!(
                subject = %a.subject.id(),
                alert_type = a.alert_type.as_str(),
                from = previous.as_str(),
                to = a.severity.as_str(),
                "alert refreshed"
            ),
        }
        if let Some(activity) = &self.activity {
            if is_news(&outcome) {
                activity.write().await.record_alert(format!(
                    "{} {} on {}: {}",
                    a.severity.as_str(),
                    a.alert_type.as_str(),
                    a.subject.id(),
                    a.message
                ));
            }
        }
        if should_notify(&outcome) {
            self.dispatch(outcome.alert()).await;
        }
        Ok(outcome)
    }

    /// Unacknowledged alerts for one subject, critical first, newest first
    /// within a severity.
    pub async fn list_pending(&self, subject: &AlertSubject) -> Result<Vec<Alert>> {
        let mut alerts = self.store.pending_alerts_for(subject).await?;
        sort_for_delivery(&mut alerts);
        Ok(alerts)
    }

    /// All alerts of a farm and its devices, in delivery order.
    pub async fn list_for_farm(&self, farm_id: &str, only_pending: bool) -> Result<Vec<Alert>> {
        let mut alerts = self.store.alerts_for_farm(farm_id, only_pending).await?;
        sort_for_delivery(&mut alerts);
        Ok(alerts)
    }

    /// Idempotent: acknowledging twice is not an error.
    pub async fn acknowledge(&self, alert_id: &str) -> Result<Alert> {
        self.store
            .acknowledge_alert(alert_id)
            .await?
            .ok_or_else(|| CoreError::not_found("alert", alert_id))
    }

    async fn dispatch(&self, alert: &Alert) {
        let Some(pool) = &self.notifications else {
            return;
        };
        let farm = match self.store.farm(&alert.farm_id).await {
            Ok(Some(f)) => f,
            Ok(None) => return,
            Err(e) => {
                warn!(farm = %alert.farm_id, "alert dispatch: farm lookup failed: {e:#}");
                return;
            }
        };
        let Some(target) = farm.notify else {
            return;
        };
        let delivery = Delivery {
            recipient: target.recipient,
            channel: target.channel,
            payload: Payload {
                title: format!("{} ({})", alert.alert_type.as_str(), alert.severity.as_str()),
                body: format!("{}: {}", alert.subject.id(), alert.message),
                severity: alert.severity,
                farm_id: alert.farm_id.clone(),
                alert_id: Some(alert.id.clone()),
            },
        };
        if let Err(e) = pool.submit(delivery) {
            warn!(farm = %alert.farm_id, alert = %alert.id, "alert not queued for delivery: {e}");
        }
    }
}

/// Severity descending, then recency descending.
pub fn sort_for_delivery(alerts: &mut [Alert]) {
    alerts.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| b.timestamp.cmp(&a.timestamp))
    });
}

/// A fresh alert, or a refresh that escalated the severity.
fn is_news(outcome: &AlertUpsert) -> bool {
    match outcome {
        AlertUpsert::Inserted(_) => true,
        AlertUpsert::Refreshed { alert, previous } => alert.severity > *previous,
    }
}

/// New warnings and criticals go out; a refresh only goes out when it
/// escalates the severity.
fn should_notify(outcome: &AlertUpsert) -> bool {
    is_news(outcome) && outcome.alert().severity >= Severity::Warning
}
