//! Reading ingestor: validates one telemetry sample, normalizes it against
//! the device calibration, scores its quality and derives alerts.
//!
//! [`evaluate`] is pure. Persistence and the per-device atomic statistics
//! update happen in [`crate::service::IrrigationService::ingest_reading`];
//! [`IngestLanes`] fans telemetry out into one ordered queue per device.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use time::{Duration, OffsetDateTime};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::{CoreError, Reason, Result};
use crate::model::{new_id, Alert, AlertSubject, AlertType, Device, QualityBand, Reading, Severity};
use crate::registry::{self, DeviceThresholds, BATTERY_CRITICAL_PCT};
use crate::service::IrrigationService;

/// A sample reporting 0% battery is only plausible if it is stale.
const FRESH_WINDOW: Duration = Duration::minutes(10);

/// Allowed clock skew before a sample timestamp counts as "in the future".
const MAX_CLOCK_SKEW: Duration = Duration::minutes(5);

/// Physical operating range of the probes' temperature sensor.
const TEMPERATURE_RANGE_C: (f64, f64) = (-40.0, 85.0);

/// One unvalidated sample as it arrives from a device.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSample {
    /// Already calibrated moisture percentage.
    #[serde(default)]
    pub moisture: Option<f64>,
    /// Raw ADC count, converted with the device calibration.
    #[serde(default)]
    pub raw: Option<i64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub battery: Option<f64>,
    #[serde(default)]
    pub signal_strength: Option<i32>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
}

/// Validate and normalize `sample` for `device`. Returns the reading with
/// its derived alerts embedded; nothing is persisted.
pub fn evaluate(
    device: &Device,
    thresholds: &DeviceThresholds,
    sample: &RawSample,
    now: OffsetDateTime,
) -> Result<Reading> {
    let moisture = match (sample.moisture, sample.raw) {
        (Some(m), _) => m,
        (None, Some(raw)) => registry::to_percentage(
            raw,
            device.calibration.dry_value,
            device.calibration.wet_value,
        ),
        (None, None) => {
            return Err(CoreError::validation(
                Reason::MissingField,
                "sample carries neither moisture nor raw",
            ))
        }
    };
    let battery = sample
        .battery
        .ok_or_else(|| CoreError::validation(Reason::MissingField, "sample carries no battery"))?;

    check_percent("moisture", moisture)?;
    check_percent("battery", battery)?;

    let quality_score = quality_score(
        sample.signal_strength,
        battery,
        sample.temperature,
        sample.humidity,
    );

    let mut reading = Reading {
        id: new_id(),
        device_id: device.id.clone(),
        farm_id: device.farm_id.clone(),
        zone_id: device.zone_id.clone(),
        moisture,
        temperature: sample.temperature,
        humidity: sample.humidity,
        battery,
        signal_strength: sample.signal_strength,
        quality_score,
        quality: QualityBand::from_score(quality_score),
        alerts: Vec::new(),
        timestamp: sample.timestamp.unwrap_or(now),
    };
    reading.alerts = derive_alerts(device, thresholds, &reading, now);
    Ok(reading)
}

fn check_percent(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(CoreError::validation(
            Reason::OutOfRange,
            format!("{field} {value} outside [0, 100]"),
        ))
    }
}

/// Start at 100 and deduct for weak signal, low battery and missing
/// optional channels. A missing signal strength is not penalized.
pub fn quality_score(
    signal_strength: Option<i32>,
    battery: f64,
    temperature: Option<f64>,
    humidity: Option<f64>,
) -> u8 {
    let mut score: i32 = 100;

    match signal_strength {
        Some(dbm) if dbm < -80 => score -= 20,
        Some(dbm) if dbm < -70 => score -= 10,
        _ => {}
    }

    if battery < 20.0 {
        score -= 15;
    } else if battery < 40.0 {
        score -= 5;
    }

    if temperature.is_none() {
        score -= 5;
    }
    if humidity.is_none() {
        score -= 5;
    }

    score.clamp(0, 100) as u8
}

fn derive_alerts(
    device: &Device,
    t: &DeviceThresholds,
    reading: &Reading,
    now: OffsetDateTime,
) -> Vec<Alert> {
    let subject = AlertSubject::Device(device.id.clone());
    let at = reading.timestamp;
    let mut alerts = Vec::new();
    let mut push = |alert_type, severity, message: String| {
        alerts.push(Alert::new(
            subject.clone(),
            &device.farm_id,
            alert_type,
            severity,
            message,
            at,
        ));
    };

    if reading.moisture <= t.moisture_low {
        push(
            AlertType::LowMoisture,
            Severity::Critical,
            format!(
                "moisture {:.0}% at or below {:.0}%",
                reading.moisture, t.moisture_low
            ),
        );
    } else if reading.moisture >= t.moisture_high {
        push(
            AlertType::HighMoisture,
            Severity::Warning,
            format!(
                "moisture {:.0}% at or above {:.0}%",
                reading.moisture, t.moisture_high
            ),
        );
    }

    if reading.battery <= BATTERY_CRITICAL_PCT {
        push(
            AlertType::LowBattery,
            Severity::Critical,
            format!("battery {:.0}%", reading.battery),
        );
    } else if reading.battery <= t.low_battery {
        push(
            AlertType::LowBattery,
            Severity::Warning,
            format!("battery {:.0}%", reading.battery),
        );
    }

    if let Some(problem) = implausibility(reading, now) {
        push(AlertType::SensorError, Severity::Warning, problem);
    }

    if registry::calibration_due(device, now) {
        push(
            AlertType::CalibrationDue,
            Severity::Info,
            format!(
                "calibration older than {} days",
                registry::CALIBRATION_MAX_AGE_DAYS
            ),
        );
    }

    alerts
}

/// Values that pass range checks but cannot all be true at once.
fn implausibility(reading: &Reading, now: OffsetDateTime) -> Option<String> {
    let age = now - reading.timestamp;
    if reading.battery == 0.0 && age <= FRESH_WINDOW {
        return Some("fresh sample reports 0% battery".to_string());
    }
    if age < -MAX_CLOCK_SKEW {
        return Some(format!(
            "sample timestamp {}s in the future",
            (-age).whole_seconds()
        ));
    }
    if let Some(h) = reading.humidity {
        if !(0.0..=100.0).contains(&h) {
            return Some(format!("humidity {h} outside [0, 100]"));
        }
    }
    if let Some(c) = reading.temperature {
        let (lo, hi) = TEMPERATURE_RANGE_C;
        if !(lo..=hi).contains(&c) {
            return Some(format!("temperature {c}°C outside [{lo}, {hi}]"));
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Per-device ingestion lanes
// ---------------------------------------------------------------------------

/// A lane with nothing queued for this long is closed; the next sample for
/// the device opens a fresh one.
const LANE_IDLE: StdDuration = StdDuration::from_secs(600);

/// One bounded FIFO plus worker task per registered, active device. Samples
/// for a device are ingested in arrival order; different devices proceed in
/// parallel.
pub struct IngestLanes {
    service: Arc<IrrigationService>,
    depth: usize,
    idle: StdDuration,
    lanes: Mutex<HashMap<String, mpsc::Sender<RawSample>>>,
}

impl IngestLanes {
    pub fn new(service: Arc<IrrigationService>, depth: usize) -> Self {
        Self {
            service,
            depth: depth.max(1),
            idle: LANE_IDLE,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_idle_timeout(mut self, idle: StdDuration) -> Self {
        self.idle = idle;
        self
    }

    /// Queue a sample. Waits only if this device's lane is full. Samples for
    /// unknown or deactivated devices are rejected without opening a lane.
    pub async fn submit(&self, device_id: &str, sample: RawSample) {
        let tx = match self.lane(device_id).await {
            Ok(tx) => tx,
            Err(e) => return self.reject(device_id, e).await,
        };
        if let Err(mpsc::error::SendError(sample)) = tx.send(sample).await {
            // Worker exited; start a fresh lane and retry once.
            let tx = match self.lane(device_id).await {
                Ok(tx) => tx,
                Err(e) => return self.reject(device_id, e).await,
            };
            if tx.send(sample).await.is_err() {
                warn!(device = %device_id, "ingest lane unavailable, sample dropped");
            }
        }
    }

    /// Open lanes.
    pub async fn lane_count(&self) -> usize {
        self.lanes
            .lock()
            .await
            .values()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    async fn lane(&self, device_id: &str) -> Result<mpsc::Sender<RawSample>> {
        let mut lanes = self.lanes.lock().await;
        if let Some(tx) = lanes.get(device_id) {
            if !tx.is_closed() {
                return Ok(tx.clone());
            }
        }
        lanes.retain(|_, tx| !tx.is_closed());

        let device = self.service.device(device_id).await?;
        if !device.active {
            return Err(CoreError::validation(
                Reason::DeviceInactive,
                format!("device {device_id} is deactivated"),
            ));
        }

        let (tx, rx) = mpsc::channel(self.depth);
        tokio::spawn(drain(
            Arc::clone(&self.service),
            device_id.to_string(),
            rx,
            self.idle,
        ));
        lanes.insert(device_id.to_string(), tx.clone());
        Ok(tx)
    }

    async fn reject(&self, device_id: &str, err: CoreError) {
        debug!(device = %device_id, "sample rejected before queueing: {err}");
        self.service
            .activity()
            .write()
            .await
            .record_rejection(device_id, &err.to_string());
    }
}

async fn drain(
    service: Arc<IrrigationService>,
    device_id: String,
    mut rx: mpsc::Receiver<RawSample>,
    idle: StdDuration,
) {
    loop {
        match tokio::time::timeout(idle, rx.recv()).await {
            Ok(Some(sample)) => ingest_one(&service, &device_id, sample).await,
            Ok(None) => return,
            Err(_) => break,
        }
    }
    // Idle: refuse new samples, then finish whatever raced in.
    rx.close();
    while let Some(sample) = rx.recv().await {
        ingest_one(&service, &device_id, sample).await;
    }
    debug!(device = %device_id, "ingest lane closed after idling");
}

async fn ingest_one(service: &IrrigationService, device_id: &str, sample: RawSample) {
    match service.ingest_reading(device_id, sample).await {
        Ok(r) => debug!(
            device = %device_id,
            moisture = r.moisture,
            quality = ?r.quality,
            alerts = r.alerts.len(),
            "reading accepted"
        ),
        Err(e) => debug!(device = %device_id, "reading rejected: {e}"),
    }
}
