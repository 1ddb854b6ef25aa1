//! Domain records shared by the registry, ingestor, aggregator, engine and
//! lifecycle manager.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::registry::{DeviceThresholds, FarmThresholds};

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Raw count observed in fully dry soil.
    pub dry_value: i64,
    /// Raw count observed in saturated soil.
    pub wet_value: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_calibrated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Connectivity {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_seen_at: Option<OffsetDateTime>,
    pub signal_strength: Option<i32>,
}

/// Compact copy of the most recent accepted reading, kept on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingSnapshot {
    pub moisture: f64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub battery: f64,
    pub quality: QualityBand,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub farm_id: String,
    pub zone_id: String,
    /// Devices are never deleted, only deactivated.
    pub active: bool,
    pub calibration: Calibration,
    /// Per-device override; `None` falls back to the farm, then defaults.
    pub thresholds: Option<DeviceThresholds>,
    #[serde(default)]
    pub connectivity: Connectivity,
    pub last_reading: Option<ReadingSnapshot>,
    #[serde(default)]
    pub reading_count: u64,
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        farm_id: impl Into<String>,
        zone_id: impl Into<String>,
        calibration: Calibration,
    ) -> Self {
        Self {
            id: id.into(),
            farm_id: farm_id.into(),
            zone_id: zone_id.into(),
            active: true,
            calibration,
            thresholds: None,
            connectivity: Connectivity::default(),
            last_reading: None,
            reading_count: 0,
        }
    }

    /// Fold an accepted reading into the device statistics. Liveness is
    /// tracked by arrival time; the device clock only dates the reading.
    pub fn apply_reading(&mut self, reading: &Reading, received_at: OffsetDateTime) {
        self.connectivity.last_seen_at = Some(received_at);
        if reading.signal_strength.is_some() {
            self.connectivity.signal_strength = reading.signal_strength;
        }
        self.last_reading = Some(reading.snapshot());
        self.reading_count += 1;
    }
}

// ---------------------------------------------------------------------------
// Farms and zones
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    pub area_hectares: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSchedule {
    pub enabled: bool,
    /// Minimum recommendation confidence required to start a run unattended.
    pub min_confidence: f64,
}

impl Default for AutoSchedule {
    fn default() -> Self {
        Self {
            enabled: false,
            min_confidence: 0.7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyChannel {
    Push,
    Email,
    Sms,
}

impl NotifyChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            NotifyChannel::Push => "push",
            NotifyChannel::Email => "email",
            NotifyChannel::Sms => "sms",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyTarget {
    pub recipient: String,
    pub channel: NotifyChannel,
}

/// A farm owns its zones and devices and is the unit of irrigation mutual
/// exclusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Farm {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub area_hectares: f64,
    /// Crop target moisture, percent.
    pub crop_target_moisture: f64,
    pub zones: Vec<Zone>,
    pub thresholds: FarmThresholds,
    pub auto_schedule: AutoSchedule,
    pub flow_rate_lpm_per_zone: f64,
    pub water_cost_per_liter: f64,
    pub notify: Option<NotifyTarget>,
}

impl Farm {
    pub fn has_zone(&self, zone_id: &str) -> bool {
        self.zones.iter().any(|z| z.id == zone_id)
    }

    pub fn zone_ids(&self) -> Vec<String> {
        self.zones.iter().map(|z| z.id.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityBand {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityBand {
    pub fn from_score(score: u8) -> Self {
        match score {
            90..=u8::MAX => QualityBand::Excellent,
            75..=89 => QualityBand::Good,
            60..=74 => QualityBand::Fair,
            _ => QualityBand::Poor,
        }
    }

    /// Good and excellent readings count toward recommendation confidence.
    pub fn is_trusted(self) -> bool {
        matches!(self, QualityBand::Excellent | QualityBand::Good)
    }
}

/// One validated, normalized telemetry sample. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub id: String,
    pub device_id: String,
    pub farm_id: String,
    pub zone_id: String,
    pub moisture: f64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub battery: f64,
    pub signal_strength: Option<i32>,
    pub quality_score: u8,
    pub quality: QualityBand,
    /// Alerts raised by this sample, as derived at ingestion time.
    pub alerts: Vec<Alert>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Reading {
    pub fn snapshot(&self) -> ReadingSnapshot {
        ReadingSnapshot {
            moisture: self.moisture,
            temperature: self.temperature,
            humidity: self.humidity,
            battery: self.battery,
            quality: self.quality,
            timestamp: self.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    LowMoisture,
    HighMoisture,
    LowBattery,
    SensorError,
    CalibrationDue,
    DeviceOffline,
    SystemError,
    ForecastUnavailable,
}

impl AlertType {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertType::LowMoisture => "low_moisture",
            AlertType::HighMoisture => "high_moisture",
            AlertType::LowBattery => "low_battery",
            AlertType::SensorError => "sensor_error",
            AlertType::CalibrationDue => "calibration_due",
            AlertType::DeviceOffline => "device_offline",
            AlertType::SystemError => "system_error",
            AlertType::ForecastUnavailable => "forecast_unavailable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "low_moisture" => AlertType::LowMoisture,
            "high_moisture" => AlertType::HighMoisture,
            "low_battery" => AlertType::LowBattery,
            "sensor_error" => AlertType::SensorError,
            "calibration_due" => AlertType::CalibrationDue,
            "device_offline" => AlertType::DeviceOffline,
            "system_error" => AlertType::SystemError,
            "forecast_unavailable" => AlertType::ForecastUnavailable,
            _ => return None,
        })
    }
}

/// Ordered so that `Critical > Warning > Info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum AlertSubject {
    Device(String),
    Farm(String),
}

impl AlertSubject {
    pub fn kind(&self) -> &'static str {
        match self {
            AlertSubject::Device(_) => "device",
            AlertSubject::Farm(_) => "farm",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            AlertSubject::Device(id) | AlertSubject::Farm(id) => id,
        }
    }

    pub fn from_parts(kind: &str, id: String) -> Option<Self> {
        match kind {
            "device" => Some(AlertSubject::Device(id)),
            "farm" => Some(AlertSubject::Farm(id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub subject: AlertSubject,
    /// Owning farm, so farm-wide listings include device alerts.
    pub farm_id: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub acknowledged: bool,
}

impl Alert {
    pub fn new(
        subject: AlertSubject,
        farm_id: impl Into<String>,
        alert_type: AlertType,
        severity: Severity,
        message: impl Into<String>,
        timestamp: OffsetDateTime,
    ) -> Self {
        Self {
            id: new_id(),
            subject,
            farm_id: farm_id.into(),
            alert_type,
            severity,
            message: message.into(),
            timestamp,
            acknowledged: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Irrigation runs
// ---------------------------------------------------------------------------

/// Run status. `Completed`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        match self {
            RunStatus::Pending | RunStatus::Running => false,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => true,
        }
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Completed) | (Running, Failed) => true,
            (Pending, Cancelled) | (Running, Cancelled) => true,
            (Pending, _) | (Running, _) => false,
            (Completed, _) | (Failed, _) | (Cancelled, _) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Manual,
    Scheduled,
    LowMoisture,
    Forecast,
    Recommendation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleTimes {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub actual_start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub actual_end: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoistureDelta {
    pub zone_id: String,
    pub before: f64,
    pub after: f64,
}

impl MoistureDelta {
    pub fn change(&self) -> f64 {
        self.after - self.before
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrrigationRun {
    pub id: String,
    pub farm_id: String,
    pub zones: Vec<String>,
    pub duration_minutes: u32,
    /// Liters.
    pub planned_volume: f64,
    pub actual_volume: Option<f64>,
    pub schedule: ScheduleTimes,
    pub trigger_reason: TriggerReason,
    pub status: RunStatus,
    /// Percent of planned volume actually delivered.
    pub efficiency: Option<i64>,
    #[serde(default)]
    pub moisture_deltas: Vec<MoistureDelta>,
    /// Notes attached by failure or cancellation.
    #[serde(default)]
    pub alerts: Vec<String>,
    pub cost: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Fresh opaque identifier for readings, alerts and runs.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_band_boundaries() {
        assert_eq!(QualityBand::from_score(100), QualityBand::Excellent);
        assert_eq!(QualityBand::from_score(90), QualityBand::Excellent);
        assert_eq!(QualityBand::from_score(89), QualityBand::Good);
        assert_eq!(QualityBand::from_score(75), QualityBand::Good);
        assert_eq!(QualityBand::from_score(74), QualityBand::Fair);
        assert_eq!(QualityBand::from_score(60), QualityBand::Fair);
        assert_eq!(QualityBand::from_score(59), QualityBand::Poor);
        assert_eq!(QualityBand::from_score(0), QualityBand::Poor);
    }

    #[test]
    fn severity_orders_critical_first() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn terminal_states_have_no_exits() {
        use RunStatus::*;
        let all = [Pending, Running, Completed, Failed, Cancelled];
        for from in [Completed, Failed, Cancelled] {
            assert!(from.is_terminal());
            for to in all {
                assert!(!from.can_transition_to(to), "{from:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn allowed_transitions() {
        use RunStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Pending));
    }

    #[test]
    fn status_and_type_strings_round_trip() {
        for s in ["pending", "running", "completed", "failed", "cancelled"] {
            assert_eq!(RunStatus::parse(s).unwrap().as_str(), s);
        }
        assert_eq!(
            AlertType::parse("calibration_due"),
            Some(AlertType::CalibrationDue)
        );
        assert_eq!(AlertType::parse("nope"), None);
    }

    #[test]
    fn alert_subject_serializes_tagged() {
        let json = serde_json::to_string(&AlertSubject::Device("n1/s1".into())).unwrap();
        assert_eq!(json, r#"{"kind":"device","id":"n1/s1"}"#);
    }
}
