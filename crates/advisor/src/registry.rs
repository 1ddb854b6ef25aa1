//! Calibration and threshold registry: raw-to-percentage conversion and the
//! per-farm / per-device threshold records with their documented defaults.
//!
//! Everything here is pure lookup or arithmetic.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::model::{Device, Farm};

/// Battery level at or below which a low-battery alert is critical.
pub const BATTERY_CRITICAL_PCT: f64 = 10.0;

/// Calibrations older than this raise `calibration_due`.
pub const CALIBRATION_MAX_AGE_DAYS: i64 = 180;

/// Convert a raw sensor count to a 0–100 moisture percentage using the
/// device's dry/wet endpoints. Capacitive probes read lower when wet, so
/// `dry_value > wet_value` for a sane calibration.
pub fn to_percentage(raw: i64, dry_value: i64, wet_value: i64) -> f64 {
    if raw <= wet_value {
        return 100.0;
    }
    if raw >= dry_value {
        return 0.0;
    }
    let pct = (dry_value - raw) as f64 / (dry_value - wet_value) as f64 * 100.0;
    pct.round().clamp(0.0, 100.0)
}

// ---------------------------------------------------------------------------
// Threshold records
// ---------------------------------------------------------------------------

/// Farm-wide moisture bands and battery levels, all in percent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmThresholds {
    pub moisture_critical: f64,
    pub moisture_warning: f64,
    pub moisture_optimal: f64,
    pub moisture_high: f64,
    pub battery_low: f64,
    pub battery_warning: f64,
    pub offline_timeout_min: i64,
}

impl Default for FarmThresholds {
    fn default() -> Self {
        Self {
            moisture_critical: 30.0,
            moisture_warning: 60.0,
            moisture_optimal: 80.0,
            moisture_high: 95.0,
            battery_low: 20.0,
            battery_warning: 40.0,
            offline_timeout_min: 30,
        }
    }
}

/// Thresholds the ingestor checks a single device's samples against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceThresholds {
    pub low_battery: f64,
    pub offline_timeout_min: i64,
    pub moisture_low: f64,
    pub moisture_high: f64,
}

impl Default for DeviceThresholds {
    fn default() -> Self {
        Self::from_farm(&FarmThresholds::default())
    }
}

impl DeviceThresholds {
    pub fn from_farm(farm: &FarmThresholds) -> Self {
        Self {
            low_battery: farm.battery_low,
            offline_timeout_min: farm.offline_timeout_min,
            moisture_low: farm.moisture_critical,
            moisture_high: farm.moisture_high,
        }
    }

    pub fn offline_timeout(&self) -> Duration {
        Duration::minutes(self.offline_timeout_min)
    }
}

/// Device override, else the owning farm's thresholds, else defaults.
pub fn resolve_device_thresholds(device: &Device, farm: Option<&Farm>) -> DeviceThresholds {
    if let Some(t) = &device.thresholds {
        return t.clone();
    }
    match farm {
        Some(f) => DeviceThresholds::from_farm(&f.thresholds),
        None => DeviceThresholds::default(),
    }
}

// ---------------------------------------------------------------------------
// Classification helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MoistureStatus {
    Critical,
    Warning,
    Fair,
    Optimal,
}

pub fn moisture_status(moisture: f64, t: &FarmThresholds) -> MoistureStatus {
    if moisture < t.moisture_critical {
        MoistureStatus::Critical
    } else if moisture < t.moisture_warning {
        MoistureStatus::Warning
    } else if moisture < t.moisture_optimal {
        MoistureStatus::Fair
    } else {
        MoistureStatus::Optimal
    }
}

/// True when the device was never calibrated or the calibration is older
/// than [`CALIBRATION_MAX_AGE_DAYS`].
pub fn calibration_due(device: &Device, now: OffsetDateTime) -> bool {
    match device.calibration.last_calibrated_at {
        Some(at) => now - at > Duration::days(CALIBRATION_MAX_AGE_DAYS),
        None => true,
    }
}
