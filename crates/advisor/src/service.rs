//! The operations exposed to the transport layers (HTTP, MQTT, scheduler).
//!
//! [`IrrigationService`] wires the registry, ingestor, aggregator,
//! recommendation engine and lifecycle manager over one [`Store`].

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::alerts::AlertAggregator;
use crate::error::{CoreError, Reason, Result};
use crate::forecast::ForecastProvider;
use crate::ingest::{self, RawSample};
use crate::lifecycle::{Completion, LifecycleManager, RunRequest};
use crate::locks::KeyedLocks;
use crate::model::{
    now, Alert, AlertSubject, AlertType, Device, Farm, IrrigationRun, Reading, RunStatus,
    Severity, TriggerReason,
};
use crate::notify::NotificationPool;
use crate::recommend::{self, Action, Forecast, Recommendation, RecommendationPolicy, ZoneSettings};
use crate::registry::{self, moisture_status};
use crate::state::SharedState;
use crate::store::Store;

pub const MAX_READINGS_PAGE: usize = 500;

pub struct IrrigationService {
    store: Arc<dyn Store>,
    alerts: Arc<AlertAggregator>,
    lifecycle: LifecycleManager,
    forecast: Option<Arc<dyn ForecastProvider>>,
    forecast_timeout: Duration,
    policy: RecommendationPolicy,
    device_locks: KeyedLocks,
    activity: SharedState,
}

impl IrrigationService {
    pub fn new(
        store: Arc<dyn Store>,
        notifications: Option<NotificationPool>,
        activity: SharedState,
    ) -> Self {
        let alerts = Arc::new(
            AlertAggregator::new(Arc::clone(&store), notifications)
                .with_activity(Arc::clone(&activity)),
        );
        Self {
            lifecycle: LifecycleManager::new(Arc::clone(&store), Arc::clone(&alerts)),
            store,
            alerts,
            forecast: None,
            forecast_timeout: Duration::from_secs(3),
            policy: RecommendationPolicy::default(),
            device_locks: KeyedLocks::new(),
            activity,
        }
    }

    pub fn with_forecast(
        mut self,
        provider: Option<Arc<dyn ForecastProvider>>,
        timeout: Duration,
    ) -> Self {
        self.forecast = provider;
        self.forecast_timeout = timeout;
        self
    }

    pub fn with_policy(mut self, policy: RecommendationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn activity(&self) -> &SharedState {
        &self.activity
    }

    // -- Registry ---------------------------------------------------------

    pub async fn farm(&self, farm_id: &str) -> Result<Farm> {
        self.store
            .farm(farm_id)
            .await?
            .ok_or_else(|| CoreError::not_found("farm", farm_id))
    }

    pub async fn device(&self, device_id: &str) -> Result<Device> {
        self.store
            .device(device_id)
            .await?
            .ok_or_else(|| CoreError::not_found("device", device_id))
    }

    // -- Ingestion --------------------------------------------------------

    /// Validate, persist and alert on one sample. Samples for the same
    /// device are applied one at a time.
    pub async fn ingest_reading(&self, device_id: &str, sample: RawSample) -> Result<Reading> {
        let outcome = {
            let _guard = self.device_locks.lock(device_id).await;
            self.ingest_locked(device_id, &sample).await
        };
        match &outcome {
            Ok(r) => {
                self.activity
                    .write()
                    .await
                    .record_reading(device_id, r.moisture, r.alerts.len());
            }
            Err(e) => {
                warn!(device = %device_id, "reading rejected: {e}");
                self.activity
                    .write()
                    .await
                    .record_rejection(device_id, &e.to_string());
            }
        }
        outcome
    }

    async fn ingest_locked(&self, device_id: &str, sample: &RawSample) -> Result<Reading> {
        let device = self.device(device_id).await?;
        if !device.active {
            return Err(CoreError::validation(
                Reason::DeviceInactive,
                format!("device {device_id} is deactivated"),
            ));
        }
        let farm = self.store.farm(&device.farm_id).await?;
        let thresholds = registry::resolve_device_thresholds(&device, farm.as_ref());
        let received_at = now();
        let mut reading = ingest::evaluate(&device, &thresholds, sample, received_at)?;

        // A refreshed alert keeps its pending id; hand that id back to the caller.
        let mut raised = Vec::with_capacity(reading.alerts.len());
        for alert in std::mem::take(&mut reading.alerts) {
            raised.push(self.alerts.raise(alert).await?.into_alert());
        }
        reading.alerts = raised;

        let updated = self.store.record_reading(&reading, received_at).await?;
        if let Some(farm) = &farm {
            debug!(
                device = %device_id,
                moisture = reading.moisture,
                status = ?moisture_status(reading.moisture, &farm.thresholds),
                count = updated.reading_count,
                "reading recorded"
            );
        }
        Ok(reading)
    }

    /// The farm's readings, newest first. `limit` is clamped to
    /// [1, MAX_READINGS_PAGE].
    pub async fn recent_readings(&self, farm_id: &str, limit: usize) -> Result<Vec<Reading>> {
        self.farm(farm_id).await?;
        let limit = limit.clamp(1, MAX_READINGS_PAGE);
        Ok(self.store.recent_readings(farm_id, limit).await?)
    }

    // -- Recommendation ---------------------------------------------------

    pub async fn get_recommendation(&self, farm_id: &str) -> Result<Recommendation> {
        let farm = self.farm(farm_id).await?;
        let active: Vec<String> = self
            .store
            .devices_for_farm(farm_id)
            .await?
            .into_iter()
            .filter(|d| d.active)
            .map(|d| d.id)
            .collect();
        let readings: Vec<Reading> = self
            .store
            .latest_readings(farm_id)
            .await?
            .into_iter()
            .filter(|r| active.contains(&r.device_id))
            .collect();
        let forecast = self.fetch_forecast(&farm).await;

        let rec = recommend::recommend(
            &readings,
            forecast.as_ref(),
            &ZoneSettings::from_farm(&farm),
            &self.policy,
        );
        info!(
            farm = %farm_id,
            action = ?rec.action,
            confidence = rec.confidence,
            readings = rec.readings_used,
            "recommendation computed"
        );
        Ok(rec)
    }

    /// `None` when no provider is configured or the call failed or timed
    /// out. Failures raise an informational alert on the farm.
    async fn fetch_forecast(&self, farm: &Farm) -> Option<Forecast> {
        let provider = self.forecast.as_ref()?;
        let call = provider.get_forecast(farm.latitude, farm.longitude);
        let why = match tokio::time::timeout(self.forecast_timeout, call).await {
            Ok(Ok(f)) => return Some(f),
            Ok(Err(e)) => format!("{e:#}"),
            Err(_) => format!("timed out after {}ms", self.forecast_timeout.as_millis()),
        };
        warn!(farm = %farm.id, "forecast unavailable: {why}");
        let alert = Alert::new(
            AlertSubject::Farm(farm.id.clone()),
            farm.id.clone(),
            AlertType::ForecastUnavailable,
            Severity::Info,
            format!("forecast unavailable, using sensor data only: {why}"),
            now(),
        );
        if let Err(e) = self.alerts.raise(alert).await {
            warn!(farm = %farm.id, "failed to raise forecast alert: {e}");
        }
        None
    }

    // -- Irrigation -------------------------------------------------------

    /// Create a run. Without a future `start_at` it is started in the same
    /// critical section; otherwise it stays pending for the scheduler.
    pub async fn start_irrigation(&self, farm_id: &str, req: RunRequest) -> Result<IrrigationRun> {
        let farm = self.farm(farm_id).await?;
        let scheduled = req.start_at.is_some_and(|t| t > now());
        let run = if scheduled {
            self.lifecycle.create(&farm, req).await?
        } else {
            self.lifecycle.create_and_start(&farm, req).await?
        };
        self.note_run(&run).await;
        Ok(run)
    }

    pub async fn complete_irrigation(
        &self,
        run_id: &str,
        completion: Completion,
    ) -> Result<IrrigationRun> {
        let run = self.lifecycle.complete(run_id, completion).await?;
        self.note_run(&run).await;
        Ok(run)
    }

    pub async fn fail_irrigation(&self, run_id: &str, reason: &str) -> Result<IrrigationRun> {
        let run = self.lifecycle.fail(run_id, reason).await?;
        self.note_run(&run).await;
        Ok(run)
    }

    pub async fn cancel_irrigation(
        &self,
        run_id: &str,
        reason: Option<&str>,
    ) -> Result<IrrigationRun> {
        let run = self.lifecycle.cancel(run_id, reason).await?;
        self.note_run(&run).await;
        Ok(run)
    }

    pub async fn runs(&self, farm_id: &str, status: Option<RunStatus>) -> Result<Vec<IrrigationRun>> {
        self.farm(farm_id).await?;
        Ok(self.store.runs_for_farm(farm_id, status).await?)
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Start a run for a farm with auto-scheduling enabled when the engine
    /// says `irrigate_now` with enough confidence and nothing is running.
    pub async fn evaluate_auto_schedule(&self, farm: &Farm) -> Result<Option<IrrigationRun>> {
        if !farm.auto_schedule.enabled {
            return Ok(None);
        }
        if self.lifecycle.active_run(&farm.id).await?.is_some() {
            return Ok(None);
        }
        let rec = self.get_recommendation(&farm.id).await?;
        if rec.action != Action::IrrigateNow || rec.confidence < farm.auto_schedule.min_confidence
        {
            debug!(
                farm = %farm.id,
                action = ?rec.action,
                confidence = rec.confidence,
                "auto-schedule: no run"
            );
            return Ok(None);
        }
        let req = RunRequest {
            zones: rec.zones,
            duration_minutes: rec.duration_minutes,
            trigger_reason: TriggerReason::LowMoisture,
            planned_volume: None,
            start_at: None,
        };
        match self.lifecycle.create_and_start(farm, req).await {
            Ok(run) => {
                info!(farm = %farm.id, run = %run.id, "auto-schedule started irrigation");
                self.note_run(&run).await;
                Ok(Some(run))
            }
            Err(CoreError::Conflict { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn note_run(&self, run: &IrrigationRun) {
        self.activity.write().await.record_irrigation(format!(
            "run {} on {} [{}] {}",
            run.id,
            run.farm_id,
            run.zones.join(","),
            run.status.as_str()
        ));
    }

    // -- Alerts -----------------------------------------------------------

    pub async fn list_alerts(&self, farm_id: &str, only_pending: bool) -> Result<Vec<Alert>> {
        self.farm(farm_id).await?;
        self.alerts.list_for_farm(farm_id, only_pending).await
    }

    pub async fn pending_alerts(&self, subject: &AlertSubject) -> Result<Vec<Alert>> {
        self.alerts.list_pending(subject).await
    }

    pub async fn acknowledge_alert(&self, alert_id: &str) -> Result<Alert> {
        let alert = self.alerts.acknowledge(alert_id).await?;
        self.activity
            .write()
            .await
            .record_alert(format!("{} acknowledged", alert.id));
        Ok(alert)
    }

    /// Raise `device_offline` for every active device of the farm that has
    /// been silent longer than its offline timeout. Returns how many.
    pub async fn sweep_offline(&self, farm: &Farm, at: time::OffsetDateTime) -> Result<usize> {
        let mut raised = 0;
        for device in self.store.devices_for_farm(&farm.id).await? {
            if !device.active {
                continue;
            }
            let Some(last_seen) = device.connectivity.last_seen_at else {
                continue;
            };
            let timeout = registry::resolve_device_thresholds(&device, Some(farm)).offline_timeout();
            let silent = at - last_seen;
            if silent <= timeout {
                continue;
            }
            let alert = Alert::new(
                AlertSubject::Device(device.id.clone()),
                farm.id.clone(),
                AlertType::DeviceOffline,
                Severity::Warning,
                format!("no data for {} minutes", silent.whole_minutes()),
                at,
            );
            self.alerts.raise(alert).await?;
            raised += 1;
        }
        Ok(raised)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::forecast::StaticForecast;
    use crate::model::{AutoSchedule, Calibration, QualityBand, Zone};
    use crate::registry::FarmThresholds;
    use crate::state;
    use crate::store::MemoryStore;
    use anyhow::anyhow;
    use async_trait::async_trait;

    pub(crate) const FARM: &str = "farm-1";
    pub(crate) const ZONE_A: &str = "zone-a";
    pub(crate) const ZONE_B: &str = "zone-b";

    pub(crate) fn test_farm() -> Farm {
        Farm {
            id: FARM.into(),
            name: "River Bend".into(),
            latitude: 38.54,
            longitude: -121.74,
            area_hectares: 6.0,
            crop_target_moisture: 80.0,
            zones: [ZONE_A, ZONE_B]
                .iter()
                .map(|z| Zone {
                    id: z.to_string(),
                    name: z.to_string(),
                    area_hectares: 3.0,
                })
                .collect(),
            thresholds: FarmThresholds::default(),
            auto_schedule: AutoSchedule::default(),
            flow_rate_lpm_per_zone: 12.0,
            water_cost_per_liter: 0.001,
            notify: None,
        }
    }

    pub(crate) fn dry_weather() -> Forecast {
        Forecast {
            temperature_c: 24.0,
            humidity_pct: 45.0,
            wind_kph: 6.0,
            rainfall_mm_next_24h: 0.0,
        }
    }

    async fn seed(store: &Arc<dyn Store>, farm: &Farm) {
        store.upsert_farm(farm).await.unwrap();
        for (id, zone) in [("n1/s1", ZONE_A), ("n1/s2", ZONE_B)] {
            let device = Device::new(
                id,
                FARM,
                zone,
                Calibration {
                    dry_value: 26000,
                    wet_value: 12000,
                    last_calibrated_at: Some(now() - time::Duration::days(10)),
                },
            );
            store.upsert_device(&device).await.unwrap();
        }
    }

    /// Memory-backed service with one farm, two zones and devices `n1/s1`
    /// (zone A) and `n1/s2` (zone B), served a dry static forecast.
    pub(crate) async fn seeded_service() -> IrrigationService {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        seed(&store, &test_farm()).await;
        IrrigationService::new(store, None, state::shared())
            .with_forecast(Some(Arc::new(StaticForecast(dry_weather()))), Duration::from_secs(1))
    }

    pub(crate) fn sample(moisture: f64) -> RawSample {
        RawSample {
            moisture: Some(moisture),
            battery: Some(90.0),
            temperature: Some(21.0),
            humidity: Some(50.0),
            signal_strength: Some(-60),
            ..RawSample::default()
        }
    }

    struct BrokenForecast;

    #[async_trait]
    impl ForecastProvider for BrokenForecast {
        async fn get_forecast(&self, _lat: f64, _lon: f64) -> anyhow::Result<Forecast> {
            Err(anyhow!("upstream 503"))
        }
    }

    struct HangingForecast;

    #[async_trait]
    impl ForecastProvider for HangingForecast {
        async fn get_forecast(&self, _lat: f64, _lon: f64) -> anyhow::Result<Forecast> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(dry_weather())
        }
    }

    fn manual(zones: &[&str], minutes: u32) -> RunRequest {
        RunRequest {
            zones: zones.iter().map(|z| z.to_string()).collect(),
            duration_minutes: minutes,
            trigger_reason: TriggerReason::Manual,
            planned_volume: None,
            start_at: None,
        }
    }

    // -- Ingestion --------------------------------------------------------

    #[tokio::test]
    async fn ingest_updates_device_and_raises_alerts() {
        let svc = seeded_service().await;
        let r = svc.ingest_reading("n1/s1", sample(12.0)).await.unwrap();
        assert_eq!(r.farm_id, FARM);
        assert_eq!(r.zone_id, ZONE_A);
        assert_eq!(r.quality, QualityBand::Excellent);

        let d = svc.device("n1/s1").await.unwrap();
        assert_eq!(d.reading_count, 1);
        assert_eq!(d.last_reading.unwrap().moisture, 12.0);
        assert!(d.connectivity.last_seen_at.is_some());

        let pending = svc
            .pending_alerts(&AlertSubject::Device("n1/s1".into()))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].alert_type, AlertType::LowMoisture);

        // A second dry reading refreshes rather than duplicates.
        svc.ingest_reading("n1/s1", sample(11.0)).await.unwrap();
        let pending = svc
            .pending_alerts(&AlertSubject::Device("n1/s1".into()))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn returned_alert_ids_follow_the_pending_alert() {
        let svc = seeded_service().await;
        let first = svc.ingest_reading("n1/s1", sample(10.0)).await.unwrap();
        let second = svc.ingest_reading("n1/s1", sample(9.0)).await.unwrap();
        assert_eq!(first.alerts.len(), 1);
        assert_eq!(second.alerts.len(), 1);
        assert_eq!(second.alerts[0].id, first.alerts[0].id);

        let acked = svc.acknowledge_alert(&second.alerts[0].id).await.unwrap();
        assert!(acked.acknowledged);
        assert!(svc.list_alerts(FARM, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn raised_alerts_are_posted_to_activity() {
        let svc = seeded_service().await;
        svc.ingest_reading("n1/s1", sample(10.0)).await.unwrap();
        let status = svc.activity().read().await.to_status();
        assert!(status
            .events
            .iter()
            .any(|e| e.kind == state::EventKind::Alert && e.detail.contains("low_moisture")));
    }

    #[tokio::test]
    async fn lagging_device_clock_does_not_mark_offline() {
        let svc = seeded_service().await;
        let mut s = sample(55.0);
        s.timestamp = Some(now() - time::Duration::hours(3));
        let r = svc.ingest_reading("n1/s1", s).await.unwrap();
        assert!(now() - r.timestamp >= time::Duration::hours(3));

        let d = svc.device("n1/s1").await.unwrap();
        let seen = d.connectivity.last_seen_at.unwrap();
        assert!(now() - seen < time::Duration::minutes(1));
        assert_eq!(svc.sweep_offline(&test_farm(), now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recent_readings_newest_first_and_clamped() {
        let svc = seeded_service().await;
        for m in [30.0, 40.0, 50.0] {
            svc.ingest_reading("n1/s1", sample(m)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let page = svc.recent_readings(FARM, 2).await.unwrap();
        let moisture: Vec<f64> = page.iter().map(|r| r.moisture).collect();
        assert_eq!(moisture, vec![50.0, 40.0]);

        assert_eq!(svc.recent_readings(FARM, 0).await.unwrap().len(), 1);
        assert!(matches!(
            svc.recent_readings("nowhere", 5).await.unwrap_err(),
            CoreError::NotFound { kind: "farm", .. }
        ));
    }

    #[tokio::test]
    async fn ingest_rejections() {
        let svc = seeded_service().await;
        let err = svc.ingest_reading("ghost", sample(50.0)).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { kind: "device", .. }));

        let err = svc.ingest_reading("n1/s1", sample(140.0)).await.unwrap_err();
        assert_eq!(err.reason(), Some(Reason::OutOfRange));
        assert_eq!(svc.device("n1/s1").await.unwrap().reading_count, 0);

        let mut d = svc.device("n1/s2").await.unwrap();
        d.active = false;
        svc.store().upsert_device(&d).await.unwrap();
        let err = svc.ingest_reading("n1/s2", sample(50.0)).await.unwrap_err();
        assert_eq!(err.reason(), Some(Reason::DeviceInactive));

        let status = svc.activity().read().await.to_status();
        assert_eq!(status.readings_rejected, 3);
    }

    #[tokio::test]
    async fn concurrent_same_device_ingest_counts_every_reading() {
        let svc = Arc::new(seeded_service().await);
        let mut tasks = Vec::new();
        for i in 0..25 {
            let svc = Arc::clone(&svc);
            tasks.push(tokio::spawn(async move {
                svc.ingest_reading("n1/s1", sample(40.0 + i as f64)).await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(svc.device("n1/s1").await.unwrap().reading_count, 25);
    }

    // -- Recommendation ---------------------------------------------------

    #[tokio::test]
    async fn dry_farm_gets_irrigate_now() {
        let svc = seeded_service().await;
        svc.ingest_reading("n1/s1", sample(20.0)).await.unwrap();
        svc.ingest_reading("n1/s2", sample(24.0)).await.unwrap();

        let rec = svc.get_recommendation(FARM).await.unwrap();
        assert_eq!(rec.action, Action::IrrigateNow);
        assert!(rec.confidence >= 0.8);
        assert_eq!(rec.readings_used, 2);
    }

    #[tokio::test]
    async fn inactive_devices_are_ignored() {
        let svc = seeded_service().await;
        svc.ingest_reading("n1/s1", sample(20.0)).await.unwrap();
        svc.ingest_reading("n1/s2", sample(70.0)).await.unwrap();
        let mut d = svc.device("n1/s1").await.unwrap();
        d.active = false;
        svc.store().upsert_device(&d).await.unwrap();

        let rec = svc.get_recommendation(FARM).await.unwrap();
        assert_eq!(rec.readings_used, 1);
        assert_eq!(rec.mean_moisture, Some(70.0));
    }

    #[tokio::test]
    async fn forecast_failure_degrades_with_info_alert() {
        for provider in [
            Arc::new(BrokenForecast) as Arc<dyn ForecastProvider>,
            Arc::new(HangingForecast) as Arc<dyn ForecastProvider>,
        ] {
            let svc = seeded_service()
                .await
                .with_forecast(Some(provider), Duration::from_millis(50));
            svc.ingest_reading("n1/s1", sample(20.0)).await.unwrap();

            let rec = svc.get_recommendation(FARM).await.unwrap();
            assert_eq!(rec.action, Action::IrrigateNow);
            assert!((rec.confidence - 0.8).abs() < 1e-9);

            let alerts = svc
                .pending_alerts(&AlertSubject::Farm(FARM.into()))
                .await
                .unwrap();
            assert_eq!(alerts.len(), 1);
            assert_eq!(alerts[0].alert_type, AlertType::ForecastUnavailable);
            assert_eq!(alerts[0].severity, Severity::Info);
        }
    }

    #[tokio::test]
    async fn unknown_farm_is_not_found() {
        let svc = seeded_service().await;
        let err = svc.get_recommendation("nowhere").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { kind: "farm", .. }));
    }

    // -- Irrigation -------------------------------------------------------

    #[tokio::test]
    async fn start_irrigation_runs_immediately() {
        let svc = seeded_service().await;
        let run = svc.start_irrigation(FARM, manual(&[ZONE_A], 20)).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.planned_volume, 240.0);

        let err = svc.start_irrigation(FARM, manual(&[ZONE_B], 20)).await.unwrap_err();
        assert_eq!(err.reason(), Some(Reason::IrrigationActive));
    }

    #[tokio::test]
    async fn future_start_stays_pending() {
        let svc = seeded_service().await;
        let mut req = manual(&[ZONE_A], 20);
        req.start_at = Some(now() + time::Duration::hours(3));
        let run = svc.start_irrigation(FARM, req).await.unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        let runs = svc.runs(FARM, Some(RunStatus::Pending)).await.unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn auto_schedule_starts_low_moisture_run() {
        let svc = seeded_service().await;
        let mut farm = test_farm();
        farm.auto_schedule.enabled = true;
        svc.store().upsert_farm(&farm).await.unwrap();
        svc.ingest_reading("n1/s1", sample(15.0)).await.unwrap();
        svc.ingest_reading("n1/s2", sample(70.0)).await.unwrap();

        // mean 42.5 is only irrigate_soon
        assert!(svc.evaluate_auto_schedule(&farm).await.unwrap().is_none());

        svc.ingest_reading("n1/s2", sample(18.0)).await.unwrap();
        let run = svc.evaluate_auto_schedule(&farm).await.unwrap().unwrap();
        assert_eq!(run.trigger_reason, TriggerReason::LowMoisture);
        assert_eq!(run.status, RunStatus::Running);

        // Already running: nothing new.
        assert!(svc.evaluate_auto_schedule(&farm).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn auto_schedule_disabled_does_nothing() {
        let svc = seeded_service().await;
        svc.ingest_reading("n1/s1", sample(5.0)).await.unwrap();
        assert!(svc.evaluate_auto_schedule(&test_farm()).await.unwrap().is_none());
    }

    // -- Alerts -----------------------------------------------------------

    #[tokio::test]
    async fn offline_sweep_flags_silent_devices() {
        let svc = seeded_service().await;
        svc.ingest_reading("n1/s1", sample(50.0)).await.unwrap();
        let farm = test_farm();

        assert_eq!(svc.sweep_offline(&farm, now()).await.unwrap(), 0);
        // n1/s2 never reported and is skipped.
        let later = now() + time::Duration::minutes(45);
        assert_eq!(svc.sweep_offline(&farm, later).await.unwrap(), 1);
        assert_eq!(svc.sweep_offline(&farm, later).await.unwrap(), 1);

        let alerts = svc.list_alerts(FARM, true).await.unwrap();
        let offline: Vec<_> = alerts
            .iter()
            .filter(|a| a.alert_type == AlertType::DeviceOffline)
            .collect();
        assert_eq!(offline.len(), 1);
    }

    #[tokio::test]
    async fn acknowledge_clears_pending() {
        let svc = seeded_service().await;
        svc.ingest_reading("n1/s1", sample(10.0)).await.unwrap();
        let alerts = svc.list_alerts(FARM, true).await.unwrap();
        assert_eq!(alerts.len(), 1);

        svc.acknowledge_alert(&alerts[0].id).await.unwrap();
        assert!(svc.list_alerts(FARM, true).await.unwrap().is_empty());
        assert_eq!(svc.list_alerts(FARM, false).await.unwrap().len(), 1);

        // A new dry reading opens a fresh alert.
        svc.ingest_reading("n1/s1", sample(10.0)).await.unwrap();
        assert_eq!(svc.list_alerts(FARM, true).await.unwrap().len(), 1);
    }
}
