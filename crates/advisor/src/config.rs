//! TOML config file loading, validation, and store seeding for farms and
//! devices.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use time::OffsetDateTime;

use crate::forecast::ForecastSettings;
use crate::model::{AutoSchedule, Calibration, Device, Farm, NotifyTarget, Zone};
use crate::notify::PoolSettings;
use crate::recommend::RecommendationPolicy;
use crate::registry::{DeviceThresholds, FarmThresholds};
use crate::store::Store;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub farms: Vec<FarmEntry>,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub policy: RecommendationPolicy,
    #[serde(default)]
    pub forecast: ForecastSettings,
    #[serde(default)]
    pub notifications: NotificationSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub ingest: IngestSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FarmEntry {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub area_hectares: f64,
    pub crop_target_moisture: f64,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
    #[serde(default)]
    pub thresholds: FarmThresholds,
    #[serde(default)]
    pub auto_schedule: AutoSchedule,
    pub flow_rate_lpm_per_zone: f64,
    #[serde(default)]
    pub water_cost_per_liter: f64,
    #[serde(default)]
    pub notify: Option<NotifyTarget>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub area_hectares: f64,
}

/// A probe. Its id is `<node_id>/<sensor_id>` as it appears on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    pub farm_id: String,
    pub zone_id: String,
    pub dry_value: i64,
    pub wet_value: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub calibrated_at: Option<OffsetDateTime>,
    #[serde(default = "yes")]
    pub active: bool,
    #[serde(default)]
    pub thresholds: Option<DeviceThresholds>,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Log,
    Mqtt,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub sink: SinkKind,
    pub workers: usize,
    pub queue_depth: usize,
    pub timeout_ms: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        let pool = PoolSettings::default();
        Self {
            sink: SinkKind::Log,
            workers: pool.workers,
            queue_depth: pool.queue_depth,
            timeout_ms: pool.timeout_ms,
        }
    }
}

impl NotificationSettings {
    pub fn pool(&self) -> PoolSettings {
        PoolSettings {
            workers: self.workers,
            queue_depth: self.queue_depth,
            timeout_ms: self.timeout_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub enabled: bool,
    pub tick_sec: u64,
    /// How long past its scheduled end a running run may go unreported
    /// before the watchdog fails it.
    pub overdue_grace_min: i64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_sec: 30,
            overdue_grace_min: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    /// Queued samples per device before the transport waits.
    pub lane_depth: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self { lane_depth: 32 }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn percent(v: f64) -> bool {
    v.is_finite() && (0.0..=100.0).contains(&v)
}

fn unit(v: f64) -> bool {
    v.is_finite() && (0.0..=1.0).contains(&v)
}

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_farms(&mut errors);
        self.validate_devices(&mut errors);
        self.validate_policy(&mut errors);
        self.validate_runtime(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_farms(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, f) in self.farms.iter().enumerate() {
            let ctx = || {
                if f.id.is_empty() {
                    format!("farms[{i}]")
                } else {
                    format!("farm '{}'", f.id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if f.id.trim().is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(f.id.as_str()) {
                errors.push(format!("{}: duplicate farm id", ctx()));
            }
            if f.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── Location ────────────────────────────────────────
            if !(-90.0..=90.0).contains(&f.latitude) {
                errors.push(format!("{}: latitude {} out of range", ctx(), f.latitude));
            }
            if !(-180.0..=180.0).contains(&f.longitude) {
                errors.push(format!("{}: longitude {} out of range", ctx(), f.longitude));
            }

            // ── Zones ───────────────────────────────────────────
            if f.zones.is_empty() {
                errors.push(format!("{}: no zones defined", ctx()));
            }
            let mut zone_ids: HashSet<&str> = HashSet::new();
            for z in &f.zones {
                if z.id.trim().is_empty() {
                    errors.push(format!("{}: zone id is empty", ctx()));
                } else if !zone_ids.insert(z.id.as_str()) {
                    errors.push(format!("{}: duplicate zone id '{}'", ctx(), z.id));
                }
                if z.area_hectares < 0.0 {
                    errors.push(format!("{}: zone '{}' has negative area", ctx(), z.id));
                }
            }

            // ── Water ───────────────────────────────────────────
            if !(f.crop_target_moisture > 0.0 && percent(f.crop_target_moisture)) {
                errors.push(format!(
                    "{}: crop_target_moisture {} out of range (0, 100]",
                    ctx(),
                    f.crop_target_moisture
                ));
            }
            if !(f.flow_rate_lpm_per_zone.is_finite() && f.flow_rate_lpm_per_zone > 0.0) {
                errors.push(format!(
                    "{}: flow_rate_lpm_per_zone must be > 0",
                    ctx()
                ));
            }
            if !(f.water_cost_per_liter.is_finite() && f.water_cost_per_liter >= 0.0) {
                errors.push(format!("{}: water_cost_per_liter must be >= 0", ctx()));
            }

            // ── Thresholds ──────────────────────────────────────
            let t = &f.thresholds;
            for (name, v) in [
                ("moisture_critical", t.moisture_critical),
                ("moisture_warning", t.moisture_warning),
                ("moisture_optimal", t.moisture_optimal),
                ("moisture_high", t.moisture_high),
                ("battery_low", t.battery_low),
                ("battery_warning", t.battery_warning),
            ] {
                if !percent(v) {
                    errors.push(format!("{}: thresholds.{name} {v} out of range [0, 100]", ctx()));
                }
            }
            if !(t.moisture_critical < t.moisture_warning
                && t.moisture_warning < t.moisture_optimal
                && t.moisture_optimal < t.moisture_high)
            {
                errors.push(format!(
                    "{}: moisture thresholds must increase critical < warning < optimal < high",
                    ctx()
                ));
            }
            if t.battery_low > t.battery_warning {
                errors.push(format!(
                    "{}: battery_low {} exceeds battery_warning {}",
                    ctx(),
                    t.battery_low,
                    t.battery_warning
                ));
            }
            if t.offline_timeout_min <= 0 {
                errors.push(format!("{}: offline_timeout_min must be > 0", ctx()));
            }

            // ── Automation & notification ───────────────────────
            if !unit(f.auto_schedule.min_confidence) {
                errors.push(format!(
                    "{}: auto_schedule.min_confidence {} out of range [0, 1]",
                    ctx(),
                    f.auto_schedule.min_confidence
                ));
            }
            if let Some(n) = &f.notify {
                if n.recipient.trim().is_empty() {
                    errors.push(format!("{}: notify.recipient is empty", ctx()));
                }
            }
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let farm_zones: HashMap<&str, HashSet<&str>> = self
            .farms
            .iter()
            .map(|f| {
                (
                    f.id.as_str(),
                    f.zones.iter().map(|z| z.id.as_str()).collect(),
                )
            })
            .collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.id.is_empty() {
                    format!("devices[{i}]")
                } else {
                    format!("device '{}'", d.id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if d.id.trim().is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(d.id.as_str()) {
                errors.push(format!("{}: duplicate device id", ctx()));
            }

            // ── Placement ───────────────────────────────────────
            match farm_zones.get(d.farm_id.as_str()) {
                None => errors.push(format!(
                    "{}: farm_id '{}' does not match any defined farm",
                    ctx(),
                    d.farm_id
                )),
                Some(zones) if !zones.contains(d.zone_id.as_str()) => errors.push(format!(
                    "{}: zone_id '{}' is not a zone of farm '{}'",
                    ctx(),
                    d.zone_id,
                    d.farm_id
                )),
                Some(_) => {}
            }

            // ── Calibration ─────────────────────────────────────
            if d.dry_value < 0 || d.wet_value < 0 {
                errors.push(format!("{}: calibration values must be >= 0", ctx()));
            }
            if d.dry_value <= d.wet_value {
                errors.push(format!(
                    "{}: dry_value {} must exceed wet_value {}",
                    ctx(),
                    d.dry_value,
                    d.wet_value
                ));
            }

            // ── Overrides ───────────────────────────────────────
            if let Some(t) = &d.thresholds {
                if !percent(t.low_battery) {
                    errors.push(format!("{}: thresholds.low_battery out of range", ctx()));
                }
                if !(percent(t.moisture_low)
                    && percent(t.moisture_high)
                    && t.moisture_low < t.moisture_high)
                {
                    errors.push(format!(
                        "{}: thresholds need 0 <= moisture_low < moisture_high <= 100",
                        ctx()
                    ));
                }
                if t.offline_timeout_min <= 0 {
                    errors.push(format!("{}: thresholds.offline_timeout_min must be > 0", ctx()));
                }
            }
        }
    }

    fn validate_policy(&self, errors: &mut Vec<String>) {
        let p = &self.policy;
        if !(0.0 < p.irrigate_now_band
            && p.irrigate_now_band < p.irrigate_soon_band
            && p.irrigate_soon_band < p.schedule_band
            && p.schedule_band <= 1.0)
        {
            errors.push("policy: bands must satisfy 0 < now < soon < schedule <= 1".into());
        }
        for (name, v) in [
            ("irrigate_now_confidence", p.irrigate_now_confidence),
            ("irrigate_soon_confidence", p.irrigate_soon_confidence),
            ("schedule_confidence", p.schedule_confidence),
            ("postpone_confidence", p.postpone_confidence),
            ("humidity_penalty", p.humidity_penalty),
            ("poor_quality_penalty", p.poor_quality_penalty),
            ("missing_forecast_penalty", p.missing_forecast_penalty),
            ("zone_deficit_band", p.zone_deficit_band),
        ] {
            if !unit(v) {
                errors.push(format!("policy: {name} {v} out of range [0, 1]"));
            }
        }
        if p.min_duration_minutes == 0 || p.min_duration_minutes > p.max_duration_minutes {
            errors.push(format!(
                "policy: need 0 < min_duration_minutes ({}) <= max_duration_minutes ({})",
                p.min_duration_minutes, p.max_duration_minutes
            ));
        }
        if !(p.minutes_per_point.is_finite() && p.minutes_per_point > 0.0) {
            errors.push("policy: minutes_per_point must be > 0".into());
        }
    }

    fn validate_runtime(&self, errors: &mut Vec<String>) {
        if self.forecast.timeout_ms == 0 {
            errors.push("forecast: timeout_ms must be > 0".into());
        }
        let n = &self.notifications;
        if n.workers == 0 {
            errors.push("notifications: workers must be > 0".into());
        }
        if n.queue_depth == 0 {
            errors.push("notifications: queue_depth must be > 0".into());
        }
        if n.timeout_ms == 0 {
            errors.push("notifications: timeout_ms must be > 0".into());
        }
        if self.scheduler.tick_sec == 0 {
            errors.push("scheduler: tick_sec must be > 0".into());
        }
        if self.scheduler.overdue_grace_min < 0 {
            errors.push("scheduler: overdue_grace_min must be >= 0".into());
        }
        if self.ingest.lane_depth == 0 {
            errors.push("ingest: lane_depth must be > 0".into());
        }
    }
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

impl FarmEntry {
    pub fn to_farm(&self) -> Farm {
        Farm {
            id: self.id.clone(),
            name: self.name.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            area_hectares: self.area_hectares,
            crop_target_moisture: self.crop_target_moisture,
            zones: self
                .zones
                .iter()
                .map(|z| Zone {
                    id: z.id.clone(),
                    name: z.name.clone(),
                    area_hectares: z.area_hectares,
                })
                .collect(),
            thresholds: self.thresholds.clone(),
            auto_schedule: self.auto_schedule.clone(),
            flow_rate_lpm_per_zone: self.flow_rate_lpm_per_zone,
            water_cost_per_liter: self.water_cost_per_liter,
            notify: self.notify.clone(),
        }
    }
}

impl DeviceEntry {
    /// Device as configured, carrying over the runtime statistics of
    /// `existing` so re-applying config never resets them.
    pub fn to_device(&self, existing: Option<Device>) -> Device {
        let mut device = Device::new(
            self.id.clone(),
            self.farm_id.clone(),
            self.zone_id.clone(),
            Calibration {
                dry_value: self.dry_value,
                wet_value: self.wet_value,
                last_calibrated_at: self.calibrated_at,
            },
        );
        device.active = self.active;
        device.thresholds = self.thresholds.clone();
        if let Some(prev) = existing {
            device.connectivity = prev.connectivity;
            device.last_reading = prev.last_reading;
            device.reading_count = prev.reading_count;
        }
        device
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

/// Upsert all farms and devices from the config into the store.
pub async fn apply(config: &Config, store: &dyn Store) -> Result<()> {
    for f in &config.farms {
        store
            .upsert_farm(&f.to_farm())
            .await
            .with_context(|| format!("failed to upsert farm '{}'", f.id))?;
    }

    for d in &config.devices {
        let existing = store
            .device(&d.id)
            .await
            .with_context(|| format!("failed to load device '{}'", d.id))?;
        store
            .upsert_device(&d.to_device(existing))
            .await
            .with_context(|| format!("failed to upsert device '{}'", d.id))?;
    }

    tracing::info!(
        farms = config.farms.len(),
        devices = config.devices.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
