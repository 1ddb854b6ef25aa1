//! Recommendation engine.
//!
//! [`recommend`] is a pure function of the zone readings, the forecast and
//! the zone settings: identical inputs always produce identical output. The
//! confidence adjustments are heuristic weights collected in
//! [`RecommendationPolicy`] so deployments can tune them from config.
//!
//! ```text
//! mean < target×0.4 ─▶ irrigate_now        (0.9)
//! mean < target×0.6 ─▶ irrigate_soon       (0.7)
//! mean < target×0.8 ─▶ schedule_irrigation (0.5)
//! otherwise         ─▶ none                (0.0)
//! rain next 24h > 5mm overrides all of the above with postpone (0.8)
//! ```

use serde::{Deserialize, Serialize};

use crate::model::{Farm, QualityBand, Reading};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    IrrigateNow,
    IrrigateSoon,
    ScheduleIrrigation,
    Postpone,
    None,
}

impl Action {
    pub fn irrigates(self) -> bool {
        matches!(
            self,
            Action::IrrigateNow | Action::IrrigateSoon | Action::ScheduleIrrigation
        )
    }

    fn default_timing(self) -> Timing {
        match self {
            Action::IrrigateNow => Timing::Immediate,
            Action::IrrigateSoon => Timing::Within6h,
            Action::ScheduleIrrigation => Timing::NextCycle,
            Action::Postpone => Timing::AfterRain,
            Action::None => Timing::NotNeeded,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timing {
    Immediate,
    Within6h,
    NextCycle,
    EarlyMorning,
    AfterRain,
    NotNeeded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub temperature_c: f64,
    pub humidity_pct: f64,
    pub wind_kph: f64,
    pub rainfall_mm_next_24h: f64,
}

/// Per-zone inputs taken from the farm record.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneSettings {
    pub target_moisture: f64,
    pub liters_per_minute_per_zone: f64,
    pub zone_ids: Vec<String>,
}

impl ZoneSettings {
    pub fn from_farm(farm: &Farm) -> Self {
        Self {
            target_moisture: farm.crop_target_moisture,
            liters_per_minute_per_zone: farm.flow_rate_lpm_per_zone,
            zone_ids: farm.zone_ids(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub action: Action,
    pub confidence: f64,
    pub timing: Timing,
    pub duration_minutes: u32,
    pub water_liters: f64,
    pub zones: Vec<String>,
    /// Mean moisture the decision was based on; `None` without readings.
    pub mean_moisture: Option<f64>,
    pub readings_used: usize,
    pub reasons: Vec<String>,
}

/// Tunable heuristic weights. Defaults reproduce the documented behavior.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RecommendationPolicy {
    pub irrigate_now_band: f64,
    pub irrigate_soon_band: f64,
    pub schedule_band: f64,
    pub irrigate_now_confidence: f64,
    pub irrigate_soon_confidence: f64,
    pub schedule_confidence: f64,
    pub humidity_above_pct: f64,
    pub humidity_penalty: f64,
    pub rain_postpone_mm: f64,
    pub postpone_confidence: f64,
    pub hot_above_c: f64,
    pub poor_quality_penalty: f64,
    pub missing_forecast_penalty: f64,
    pub minutes_per_point: f64,
    pub min_duration_minutes: u32,
    pub max_duration_minutes: u32,
    pub zone_deficit_band: f64,
}

impl Default for RecommendationPolicy {
    fn default() -> Self {
        Self {
            irrigate_now_band: 0.4,
            irrigate_soon_band: 0.6,
            schedule_band: 0.8,
            irrigate_now_confidence: 0.9,
            irrigate_soon_confidence: 0.7,
            schedule_confidence: 0.5,
            humidity_above_pct: 85.0,
            humidity_penalty: 0.2,
            rain_postpone_mm: 5.0,
            postpone_confidence: 0.8,
            hot_above_c: 35.0,
            poor_quality_penalty: 0.1,
            missing_forecast_penalty: 0.1,
            minutes_per_point: 0.5,
            min_duration_minutes: 10,
            max_duration_minutes: 60,
            zone_deficit_band: 0.7,
        }
    }
}

/// Decide what the farm's irrigation should do next.
///
/// `forecast` is `None` when the provider was unavailable; the decision then
/// rests on sensor data alone with a confidence penalty.
pub fn recommend(
    readings: &[Reading],
    forecast: Option<&Forecast>,
    settings: &ZoneSettings,
    policy: &RecommendationPolicy,
) -> Recommendation {
    let mut reasons = Vec::new();

    if readings.is_empty() {
        reasons.push("no readings from active devices".to_string());
        return Recommendation {
            action: Action::None,
            confidence: 0.0,
            timing: Timing::NotNeeded,
            duration_minutes: 0,
            water_liters: 0.0,
            zones: Vec::new(),
            mean_moisture: None,
            readings_used: 0,
            reasons,
        };
    }

    // Poor readings only count when nothing better is available.
    let trusted: Vec<&Reading> = readings
        .iter()
        .filter(|r| r.quality != QualityBand::Poor)
        .collect();
    let poor_only = trusted.is_empty();
    let used: Vec<&Reading> = if poor_only {
        reasons.push("only poor-quality readings available".to_string());
        readings.iter().collect()
    } else {
        trusted
    };
    let mean = used.iter().map(|r| r.moisture).sum::<f64>() / used.len() as f64;
    let target = settings.target_moisture;

    let (mut action, mut confidence) = if mean < target * policy.irrigate_now_band {
        (Action::IrrigateNow, policy.irrigate_now_confidence)
    } else if mean < target * policy.irrigate_soon_band {
        (Action::IrrigateSoon, policy.irrigate_soon_confidence)
    } else if mean < target * policy.schedule_band {
        (Action::ScheduleIrrigation, policy.schedule_confidence)
    } else {
        (Action::None, 0.0)
    };
    reasons.push(format!("mean moisture {mean:.1}% vs target {target:.1}%"));

    let mut hot = false;
    match forecast {
        Some(f) => {
            if f.humidity_pct > policy.humidity_above_pct {
                confidence -= policy.humidity_penalty;
                reasons.push(format!("high humidity {:.0}%", f.humidity_pct));
            }
            if f.rainfall_mm_next_24h > policy.rain_postpone_mm {
                action = Action::Postpone;
                confidence = policy.postpone_confidence;
                reasons.push(format!(
                    "{:.1}mm rain expected in 24h",
                    f.rainfall_mm_next_24h
                ));
            }
            hot = f.temperature_c > policy.hot_above_c;
        }
        None => {
            confidence -= policy.missing_forecast_penalty;
            reasons.push("forecast unavailable, sensor data only".to_string());
        }
    }
    if poor_only {
        confidence -= policy.poor_quality_penalty;
    }

    let mut timing = action.default_timing();
    let mut duration_minutes = 0;
    let mut water_liters = 0.0;
    let mut zones = Vec::new();

    if action.irrigates() {
        if hot {
            timing = Timing::EarlyMorning;
            reasons.push("hot day, irrigate early morning".to_string());
        }
        let minutes = ((target - mean) * policy.minutes_per_point).round();
        duration_minutes = minutes.clamp(
            policy.min_duration_minutes as f64,
            policy.max_duration_minutes as f64,
        ) as u32;
        water_liters = duration_minutes as f64 * settings.liters_per_minute_per_zone;

        let deficit = target * policy.zone_deficit_band;
        zones = settings
            .zone_ids
            .iter()
            .filter(|z| used.iter().any(|r| &r.zone_id == *z && r.moisture < deficit))
            .cloned()
            .collect();
        if zones.is_empty() {
            zones = settings.zone_ids.clone();
        }
    }

    let good = readings.iter().filter(|r| r.quality.is_trusted()).count();
    let good_fraction = good as f64 / readings.len() as f64;
    confidence = (confidence * good_fraction).clamp(0.0, 1.0);

    Recommendation {
        action,
        confidence,
        timing,
        duration_minutes,
        water_liters,
        zones,
        mean_moisture: Some(mean),
        readings_used: used.len(),
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn reading(zone: &str, moisture: f64, quality: QualityBand) -> Reading {
        Reading {
            id: format!("{zone}-{moisture}"),
            device_id: format!("dev-{zone}-{moisture}"),
            farm_id: "f1".into(),
            zone_id: zone.into(),
            moisture,
            temperature: Some(22.0),
            humidity: Some(50.0),
            battery: 90.0,
            signal_strength: Some(-60),
            quality_score: 90,
            quality,
            alerts: vec![],
            timestamp: datetime!(2026-06-01 12:00 UTC),
        }
    }

    fn dry_weather() -> Forecast {
        Forecast {
            temperature_c: 24.0,
            humidity_pct: 50.0,
            wind_kph: 8.0,
            rainfall_mm_next_24h: 0.0,
        }
    }

    fn settings() -> ZoneSettings {
        ZoneSettings {
            target_moisture: 80.0,
            liters_per_minute_per_zone: 12.0,
            zone_ids: vec!["z1".into(), "z2".into()],
        }
    }

    fn run(readings: &[Reading], forecast: Option<&Forecast>) -> Recommendation {
        recommend(readings, forecast, &settings(), &RecommendationPolicy::default())
    }

    #[test]
    fn very_dry_soil_irrigates_now() {
        let rec = run(&[reading("z1", 20.0, QualityBand::Good)], Some(&dry_weather()));
        assert_eq!(rec.action, Action::IrrigateNow);
        assert!(rec.confidence >= 0.8, "confidence {}", rec.confidence);
        assert_eq!(rec.timing, Timing::Immediate);
        // round((80 - 20) * 0.5) = 30
        assert_eq!(rec.duration_minutes, 30);
        assert_eq!(rec.water_liters, 360.0);
        assert_eq!(rec.zones, vec!["z1".to_string()]);
    }

    #[test]
    fn rain_overrides_low_moisture() {
        let rainy = Forecast {
            rainfall_mm_next_24h: 10.0,
            ..dry_weather()
        };
        let rec = run(&[reading("z1", 25.0, QualityBand::Good)], Some(&rainy));
        assert_eq!(rec.action, Action::Postpone);
        assert!((rec.confidence - 0.8).abs() < 1e-9);
        assert_eq!(rec.timing, Timing::AfterRain);
        assert_eq!(rec.duration_minutes, 0);
        assert!(rec.zones.is_empty());
    }

    #[test]
    fn action_bands() {
        let w = dry_weather();
        let cases = [
            (31.0, Action::IrrigateNow, 0.9),
            (40.0, Action::IrrigateSoon, 0.7),
            (60.0, Action::ScheduleIrrigation, 0.5),
            (64.0, Action::None, 0.0),
        ];
        for (m, action, conf) in cases {
            let rec = run(&[reading("z1", m, QualityBand::Excellent)], Some(&w));
            assert_eq!(rec.action, action, "moisture {m}");
            assert!((rec.confidence - conf).abs() < 1e-9, "moisture {m}");
        }
    }

    #[test]
    fn humid_air_lowers_confidence() {
        let humid = Forecast {
            humidity_pct: 90.0,
            ..dry_weather()
        };
        let rec = run(&[reading("z1", 20.0, QualityBand::Good)], Some(&humid));
        assert_eq!(rec.action, Action::IrrigateNow);
        assert!((rec.confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn heat_moves_timing_to_early_morning() {
        let hot = Forecast {
            temperature_c: 38.0,
            ..dry_weather()
        };
        let rec = run(&[reading("z1", 20.0, QualityBand::Good)], Some(&hot));
        assert_eq!(rec.timing, Timing::EarlyMorning);
    }

    #[test]
    fn duration_is_clamped() {
        let w = dry_weather();
        // (80 - 0) * 0.5 = 40, inside bounds.
        assert_eq!(run(&[reading("z1", 0.0, QualityBand::Good)], Some(&w)).duration_minutes, 40);
        // (80 - 60) * 0.5 = 10 exactly at the floor.
        assert_eq!(run(&[reading("z1", 60.0, QualityBand::Good)], Some(&w)).duration_minutes, 10);

        let thirsty = ZoneSettings {
            target_moisture: 200.0,
            ..settings()
        };
        let rec = recommend(
            &[reading("z1", 0.0, QualityBand::Good)],
            Some(&w),
            &thirsty,
            &RecommendationPolicy::default(),
        );
        assert_eq!(rec.duration_minutes, 60);
    }

    #[test]
    fn poor_readings_dropped_when_better_exist() {
        let readings = [
            reading("z1", 10.0, QualityBand::Poor),
            reading("z2", 70.0, QualityBand::Good),
        ];
        let rec = run(&readings, Some(&dry_weather()));
        assert_eq!(rec.mean_moisture, Some(70.0));
        assert_eq!(rec.readings_used, 1);
        assert_eq!(rec.action, Action::None);
    }

    #[test]
    fn poor_only_readings_are_used_but_not_trusted() {
        let rec = run(&[reading("z1", 20.0, QualityBand::Poor)], Some(&dry_weather()));
        assert_eq!(rec.action, Action::IrrigateNow);
        assert_eq!(rec.readings_used, 1);
        assert_eq!(rec.confidence, 0.0);
    }

    #[test]
    fn poor_quality_never_beats_good_quality() {
        let w = dry_weather();
        for m in [5.0, 20.0, 35.0, 50.0, 62.0, 70.0, 90.0] {
            for band in [QualityBand::Fair, QualityBand::Good, QualityBand::Excellent] {
                let better = run(&[reading("z1", m, band)], Some(&w));
                let poor = run(&[reading("z1", m, QualityBand::Poor)], Some(&w));
                assert!(
                    poor.confidence <= better.confidence,
                    "moisture {m} {band:?}: poor {} > {}",
                    poor.confidence,
                    better.confidence
                );
            }
        }
    }

    #[test]
    fn confidence_scaled_by_good_fraction() {
        let readings = [
            reading("z1", 20.0, QualityBand::Good),
            reading("z2", 20.0, QualityBand::Fair),
        ];
        let rec = run(&readings, Some(&dry_weather()));
        assert!((rec.confidence - 0.45).abs() < 1e-9, "got {}", rec.confidence);
    }

    #[test]
    fn missing_forecast_costs_confidence() {
        let rec = run(&[reading("z1", 20.0, QualityBand::Good)], None);
        assert_eq!(rec.action, Action::IrrigateNow);
        assert!((rec.confidence - 0.8).abs() < 1e-9);
        assert!(rec.reasons.iter().any(|r| r.contains("forecast unavailable")));
    }

    #[test]
    fn zone_selection_defaults_to_all_zones() {
        // Mean 45 is irrigate_soon; only z2 sits below the deficit band (56).
        let readings = [
            reading("z1", 60.0, QualityBand::Good),
            reading("z2", 30.0, QualityBand::Good),
        ];
        let rec = run(&readings, Some(&dry_weather()));
        assert_eq!(rec.action, Action::IrrigateSoon);
        assert_eq!(rec.zones, vec!["z2".to_string()]);

        let readings = [
            reading("z1", 58.0, QualityBand::Good),
            reading("z2", 58.0, QualityBand::Good),
        ];
        let rec = run(&readings, Some(&dry_weather()));
        assert_eq!(rec.action, Action::ScheduleIrrigation);
        assert_eq!(rec.zones, vec!["z1".to_string(), "z2".to_string()]);
    }

    #[test]
    fn confidence_is_clamped() {
        let generous = RecommendationPolicy {
            irrigate_now_confidence: 1.7,
            ..RecommendationPolicy::default()
        };
        let rec = recommend(
            &[reading("z1", 10.0, QualityBand::Excellent)],
            Some(&dry_weather()),
            &settings(),
            &generous,
        );
        assert_eq!(rec.confidence, 1.0);

        let humid = Forecast {
            humidity_pct: 99.0,
            ..dry_weather()
        };
        let rec = run(&[reading("z1", 70.0, QualityBand::Good)], Some(&humid));
        assert_eq!(rec.confidence, 0.0);
    }

    #[test]
    fn no_readings_means_no_action() {
        let rec = run(&[], Some(&dry_weather()));
        assert_eq!(rec.action, Action::None);
        assert_eq!(rec.confidence, 0.0);
        assert_eq!(rec.mean_moisture, None);
    }

    #[test]
    fn deterministic() {
        let readings = [
            reading("z1", 22.0, QualityBand::Good),
            reading("z2", 48.0, QualityBand::Excellent),
        ];
        let w = dry_weather();
        assert_eq!(run(&readings, Some(&w)), run(&readings, Some(&w)));
    }
}
