//! Persistence boundary. Business rules talk to [`Store`]; the in-memory and
//! SQLite backends both honor the same atomicity contract:
//!
//! - `record_reading` inserts the reading and folds it into the device
//!   statistics as one step,
//! - `upsert_alert` never leaves two unacknowledged alerts for the same
//!   (subject, type),
//! - `update_run` is a compare-and-set on the run's status and refuses to
//!   put a second run of the same farm into `running`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::model::{Alert, AlertSubject, Device, Farm, IrrigationRun, Reading, RunStatus, Severity};

/// Result of raising an alert against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertUpsert {
    Inserted(Alert),
    /// An unacknowledged alert with the same (subject, type) existed; its
    /// severity, message and timestamp were replaced.
    Refreshed { alert: Alert, previous: Severity },
}

impl AlertUpsert {
    pub fn alert(&self) -> &Alert {
        match self {
            AlertUpsert::Inserted(a) | AlertUpsert::Refreshed { alert: a, .. } => a,
        }
    }

    pub fn into_alert(self) -> Alert {
        match self {
            AlertUpsert::Inserted(a) | AlertUpsert::Refreshed { alert: a, .. } => a,
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_farm(&self, farm: &Farm) -> Result<()>;
    async fn farm(&self, farm_id: &str) -> Result<Option<Farm>>;
    async fn farms(&self) -> Result<Vec<Farm>>;

    async fn upsert_device(&self, device: &Device) -> Result<()>;
    async fn device(&self, device_id: &str) -> Result<Option<Device>>;
    async fn devices_for_farm(&self, farm_id: &str) -> Result<Vec<Device>>;

    /// Persist `reading` and apply it to its device's last-seen, last-reading
    /// and counter in one atomic step. Returns the updated device.
    async fn record_reading(&self, reading: &Reading, received_at: OffsetDateTime)
        -> Result<Device>;
    /// Newest reading per device of the farm.
    async fn latest_readings(&self, farm_id: &str) -> Result<Vec<Reading>>;
    /// Readings of the farm, newest first.
    async fn recent_readings(&self, farm_id: &str, limit: usize) -> Result<Vec<Reading>>;

    async fn upsert_alert(&self, alert: Alert) -> Result<AlertUpsert>;
    async fn alert(&self, alert_id: &str) -> Result<Option<Alert>>;
    async fn alerts_for_farm(&self, farm_id: &str, only_pending: bool) -> Result<Vec<Alert>>;
    async fn pending_alerts_for(&self, subject: &AlertSubject) -> Result<Vec<Alert>>;
    /// Marks the alert acknowledged. Already-acknowledged alerts are returned
    /// unchanged; `None` means no such alert.
    async fn acknowledge_alert(&self, alert_id: &str) -> Result<Option<Alert>>;

    async fn insert_run(&self, run: &IrrigationRun) -> Result<()>;
    async fn run(&self, run_id: &str) -> Result<Option<IrrigationRun>>;
    /// Runs of the farm, newest first, optionally filtered by status.
    async fn runs_for_farm(
        &self,
        farm_id: &str,
        status: Option<RunStatus>,
    ) -> Result<Vec<IrrigationRun>>;
    /// Replace the stored run only if its current status is `expected`.
    /// Returns `false` when the status moved underneath the caller or the
    /// write would create a second running run for the farm.
    async fn update_run(&self, run: &IrrigationRun, expected: RunStatus) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    farms: HashMap<String, Farm>,
    devices: HashMap<String, Device>,
    /// Arrival order.
    readings: Vec<Reading>,
    alerts: Vec<Alert>,
    runs: HashMap<String, IrrigationRun>,
}

/// Map-backed store for tests, demos and single-process deployments.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_farm(&self, farm: &Farm) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.farms.insert(farm.id.clone(), farm.clone());
        Ok(())
    }

    async fn farm(&self, farm_id: &str) -> Result<Option<Farm>> {
        Ok(self.inner.read().await.farms.get(farm_id).cloned())
    }

    async fn farms(&self) -> Result<Vec<Farm>> {
        let inner = self.inner.read().await;
        let mut farms: Vec<Farm> = inner.farms.values().cloned().collect();
        farms.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(farms)
    }

    async fn upsert_device(&self, device: &Device) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.devices.insert(device.id.clone(), device.clone());
        Ok(())
    }

    async fn device(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.inner.read().await.devices.get(device_id).cloned())
    }

    async fn devices_for_farm(&self, farm_id: &str) -> Result<Vec<Device>> {
        let inner = self.inner.read().await;
        let mut devices: Vec<Device> = inner
            .devices
            .values()
            .filter(|d| d.farm_id == farm_id)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }

    async fn record_reading(
        &self,
        reading: &Reading,
        received_at: OffsetDateTime,
    ) -> Result<Device> {
        let mut inner = self.inner.write().await;
        let device = inner
            .devices
            .get_mut(&reading.device_id)
            .ok_or_else(|| anyhow!("record_reading: unknown device {}", reading.device_id))?;
        device.apply_reading(reading, received_at);
        let updated = device.clone();
        inner.readings.push(reading.clone());
        Ok(updated)
    }

    async fn latest_readings(&self, farm_id: &str) -> Result<Vec<Reading>> {
        let inner = self.inner.read().await;
        let mut seen = HashSet::new();
        let mut latest: Vec<Reading> = inner
            .readings
            .iter()
            .rev()
            .filter(|r| r.farm_id == farm_id && seen.insert(r.device_id.clone()))
            .cloned()
            .collect();
        latest.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(latest)
    }

    async fn recent_readings(&self, farm_id: &str, limit: usize) -> Result<Vec<Reading>> {
        let inner = self.inner.read().await;
        let mut readings: Vec<Reading> = inner
            .readings
            .iter()
            .filter(|r| r.farm_id == farm_id)
            .cloned()
            .collect();
        readings.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        readings.truncate(limit);
        Ok(readings)
    }

    async fn upsert_alert(&self, alert: Alert) -> Result<AlertUpsert> {
        let mut inner = self.inner.write().await;
        let existing = inner.alerts.iter_mut().find(|a| {
            !a.acknowledged && a.subject == alert.subject && a.alert_type == alert.alert_type
        });
        Ok(match existing {
            Some(current) => {
                let previous = current.severity;
                current.severity = alert.severity;
                current.message = alert.message;
                current.timestamp = alert.timestamp;
                AlertUpsert::Refreshed {
                    alert: current.clone(),
                    previous,
                }
            }
            None => {
                inner.alerts.push(alert.clone());
                AlertUpsert::Inserted(alert)
            }
        })
    }

    async fn alert(&self, alert_id: &str) -> Result<Option<Alert>> {
        let inner = self.inner.read().await;
        Ok(inner.alerts.iter().find(|a| a.id == alert_id).cloned())
    }

    async fn alerts_for_farm(&self, farm_id: &str, only_pending: bool) -> Result<Vec<Alert>> {
        let inner = self.inner.read().await;
        Ok(inner
            .alerts
            .iter()
            .filter(|a| a.farm_id == farm_id && (!only_pending || !a.acknowledged))
            .cloned()
            .collect())
    }

    async fn pending_alerts_for(&self, subject: &AlertSubject) -> Result<Vec<Alert>> {
        let inner = self.inner.read().await;
        Ok(inner
            .alerts
            .iter()
            .filter(|a| !a.acknowledged && &a.subject == subject)
            .cloned()
            .collect())
    }

    async fn acknowledge_alert(&self, alert_id: &str) -> Result<Option<Alert>> {
        let mut inner = self.inner.write().await;
        Ok(inner.alerts.iter_mut().find(|a| a.id == alert_id).map(|a| {
            a.acknowledged = true;
            a.clone()
        }))
    }

    async fn insert_run(&self, run: &IrrigationRun) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.runs.contains_key(&run.id) {
            return Err(anyhow!("insert_run: duplicate run id {}", run.id));
        }
        inner.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn run(&self, run_id: &str) -> Result<Option<IrrigationRun>> {
        Ok(self.inner.read().await.runs.get(run_id).cloned())
    }

    async fn runs_for_farm(
        &self,
        farm_id: &str,
        status: Option<RunStatus>,
    ) -> Result<Vec<IrrigationRun>> {
        let inner = self.inner.read().await;
        let mut runs: Vec<IrrigationRun> = inner
            .runs
            .values()
            .filter(|r| r.farm_id == farm_id && status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(runs)
    }

    async fn update_run(&self, run: &IrrigationRun, expected: RunStatus) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.runs.get(&run.id) {
            Some(current) if current.status == expected => {}
            Some(_) => return Ok(false),
            None => return Err(anyhow!("update_run: unknown run {}", run.id)),
        }
        if run.status == RunStatus::Running
            && inner.runs.values().any(|r| {
                r.id != run.id && r.farm_id == run.farm_id && r.status == RunStatus::Running
            })
        {
            return Ok(false);
        }
        inner.runs.insert(run.id.clone(), run.clone());
        Ok(true)
    }
}
