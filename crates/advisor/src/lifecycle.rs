//! Irrigation run lifecycle.
//!
//! ```text
//! pending ──start──▶ running ──complete──▶ completed
//!    │                  ├──────fail──────▶ failed
//!    └──────cancel──────┴─────cancel─────▶ cancelled
//! ```
//!
//! Every transition runs under the farm's lock and is written with a
//! compare-and-set against the status it was read in, so two racing
//! terminal transitions can never both succeed.

use serde::Deserialize;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::alerts::AlertAggregator;
use crate::error::{CoreError, Reason, Result};
use crate::locks::KeyedLocks;
use crate::model::{
    new_id, now, Alert, AlertSubject, AlertType, Farm, IrrigationRun, MoistureDelta, RunStatus,
    ScheduleTimes, Severity, TriggerReason,
};
use crate::store::Store;

fn manual() -> TriggerReason {
    TriggerReason::Manual
}

/// A request to water some zones of one farm.
#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    pub zones: Vec<String>,
    pub duration_minutes: u32,
    #[serde(default = "manual")]
    pub trigger_reason: TriggerReason,
    /// Liters; derived from the farm flow rate when absent.
    #[serde(default)]
    pub planned_volume: Option<f64>,
    /// Future start time. Absent means "now".
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Completion {
    pub actual_volume: f64,
    #[serde(default)]
    pub moisture_deltas: Vec<MoistureDelta>,
}

pub struct LifecycleManager {
    store: Arc<dyn Store>,
    alerts: Arc<AlertAggregator>,
    farm_locks: KeyedLocks,
}

impl LifecycleManager {
    pub fn new(store: Arc<dyn Store>, alerts: Arc<AlertAggregator>) -> Self {
        Self {
            store,
            alerts,
            farm_locks: KeyedLocks::new(),
        }
    }

    /// Create a `pending` run.
    pub async fn create(&self, farm: &Farm, req: RunRequest) -> Result<IrrigationRun> {
        let _guard = self.farm_locks.lock(&farm.id).await;
        self.create_locked(farm, req, now()).await
    }

    /// Create a run and start it in the same critical section.
    pub async fn create_and_start(&self, farm: &Farm, req: RunRequest) -> Result<IrrigationRun> {
        let _guard = self.farm_locks.lock(&farm.id).await;
        let run = self.create_locked(farm, req, now()).await?;
        self.start_locked(run).await
    }

    /// `pending → running`.
    pub async fn start(&self, run_id: &str) -> Result<IrrigationRun> {
        let farm_id = self.load(run_id).await?.farm_id;
        let _guard = self.farm_locks.lock(&farm_id).await;
        let run = self.load(run_id).await?;
        self.start_locked(run).await
    }

    /// `running → completed`. Stamps the actual end, efficiency and cost.
    pub async fn complete(&self, run_id: &str, completion: Completion) -> Result<IrrigationRun> {
        if !completion.actual_volume.is_finite() || completion.actual_volume < 0.0 {
            return Err(CoreError::validation(
                Reason::OutOfRange,
                format!("actual volume {} must be >= 0", completion.actual_volume),
            ));
        }
        for d in &completion.moisture_deltas {
            check_moisture(&d.zone_id, d.before)?;
            check_moisture(&d.zone_id, d.after)?;
        }

        let farm_id = self.load(run_id).await?.farm_id;
        let _guard = self.farm_locks.lock(&farm_id).await;
        let water_cost = self
            .store
            .farm(&farm_id)
            .await?
            .map_or(0.0, |f| f.water_cost_per_liter);
        let run = self.load(run_id).await?;
        let at = now();

        let run = self
            .transition(run, RunStatus::Completed, move |run| {
                if let Some(d) = completion
                    .moisture_deltas
                    .iter()
                    .find(|d| !run.zones.contains(&d.zone_id))
                {
                    return Err(CoreError::invariant(
                        Reason::ZoneNotInFarm,
                        format!("zone {} is not part of run {}", d.zone_id, run.id),
                    ));
                }
                let actual = completion.actual_volume;
                run.actual_volume = Some(actual);
                run.schedule.actual_end = Some(end_stamp(run, at));
                run.efficiency = efficiency(actual, run.planned_volume);
                run.cost = Some(actual * water_cost);
                run.moisture_deltas = completion.moisture_deltas;
                Ok(())
            })
            .await?;
        info!(
            farm = %run.farm_id,
            run = %run.id,
            efficiency = ?run.efficiency,
            cost = ?run.cost,
            "irrigation completed"
        );
        Ok(run)
    }

    /// `running → failed`, raising a `system_error` alert on the farm.
    pub async fn fail(&self, run_id: &str, reason: &str) -> Result<IrrigationRun> {
        let farm_id = self.load(run_id).await?.farm_id;
        let _guard = self.farm_locks.lock(&farm_id).await;
        let run = self.load(run_id).await?;
        let at = now();
        let note = reason.to_string();

        let run = self
            .transition(run, RunStatus::Failed, move |run| {
                run.schedule.actual_end = Some(end_stamp(run, at));
                run.alerts.push(note);
                Ok(())
            })
            .await?;
        warn!(farm = %run.farm_id, run = %run.id, "irrigation failed: {reason}");

        let alert = Alert::new(
            AlertSubject::Farm(run.farm_id.clone()),
            run.farm_id.clone(),
            AlertType::SystemError,
            Severity::Critical,
            format!("irrigation run {} failed: {reason}", run.id),
            at,
        );
        if let Err(e) = self.alerts.raise(alert).await {
            warn!(farm = %run.farm_id, run = %run.id, "failed to raise system_error alert: {e}");
        }
        Ok(run)
    }

    /// `pending|running → cancelled`.
    pub async fn cancel(&self, run_id: &str, reason: Option<&str>) -> Result<IrrigationRun> {
        let farm_id = self.load(run_id).await?.farm_id;
        let _guard = self.farm_locks.lock(&farm_id).await;
        let run = self.load(run_id).await?;
        let at = now();
        let note = reason.map(str::to_string);

        let run = self
            .transition(run, RunStatus::Cancelled, move |run| {
                if run.schedule.actual_start.is_some() {
                    run.schedule.actual_end = Some(end_stamp(run, at));
                }
                run.alerts.extend(note);
                Ok(())
            })
            .await?;
        info!(farm = %run.farm_id, run = %run.id, "irrigation cancelled");
        Ok(run)
    }

    pub async fn active_run(&self, farm_id: &str) -> Result<Option<IrrigationRun>> {
        Ok(self
            .store
            .runs_for_farm(farm_id, Some(RunStatus::Running))
            .await?
            .into_iter()
            .next())
    }

    /// Start pending runs of the farm whose scheduled start has passed.
    /// A run that cannot start because another is active stays pending.
    pub async fn start_due(&self, farm_id: &str, at: OffsetDateTime) -> Result<Vec<IrrigationRun>> {
        let mut due = self
            .store
            .runs_for_farm(farm_id, Some(RunStatus::Pending))
            .await?;
        due.retain(|r| r.schedule.start <= at);
        due.sort_by(|a, b| a.schedule.start.cmp(&b.schedule.start));

        let mut started = Vec::new();
        for run in due {
            match self.start(&run.id).await {
                Ok(run) => started.push(run),
                Err(CoreError::Conflict { reason, .. }) => {
                    debug!(farm = %farm_id, run = %run.id, %reason, "scheduled run not started");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(started)
    }

    /// Fail running runs whose scheduled end plus `grace` is behind `at`.
    pub async fn fail_overdue(
        &self,
        farm_id: &str,
        at: OffsetDateTime,
        grace: Duration,
    ) -> Result<Vec<IrrigationRun>> {
        let running = self
            .store
            .runs_for_farm(farm_id, Some(RunStatus::Running))
            .await?;
        let mut failed = Vec::new();
        for run in running {
            let deadline = run.schedule.actual_start.unwrap_or(run.schedule.start)
                + Duration::minutes(run.duration_minutes as i64)
                + grace;
            if deadline >= at {
                continue;
            }
            match self.fail(&run.id, "overdue: no completion reported").await {
                Ok(run) => failed.push(run),
                Err(CoreError::Conflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(failed)
    }

    async fn create_locked(
        &self,
        farm: &Farm,
        req: RunRequest,
        at: OffsetDateTime,
    ) -> Result<IrrigationRun> {
        if req.duration_minutes == 0 {
            return Err(CoreError::validation(
                Reason::OutOfRange,
                "duration must be at least one minute",
            ));
        }
        let mut zones: Vec<String> = Vec::with_capacity(req.zones.len());
        for z in req.zones {
            if !zones.contains(&z) {
                zones.push(z);
            }
        }
        if zones.is_empty() {
            return Err(CoreError::invariant(
                Reason::EmptyZoneSet,
                "a run needs at least one zone",
            ));
        }
        if let Some(z) = zones.iter().find(|z| !farm.has_zone(z)) {
            return Err(CoreError::invariant(
                Reason::ZoneNotInFarm,
                format!("zone {z} is not part of farm {}", farm.id),
            ));
        }
        if let Some(active) = self.active_run(&farm.id).await? {
            return Err(CoreError::conflict(
                Reason::IrrigationActive,
                format!("run {} is already running on farm {}", active.id, farm.id),
            ));
        }
        let planned_volume = match req.planned_volume {
            Some(v) if !v.is_finite() || v < 0.0 => {
                return Err(CoreError::validation(
                    Reason::OutOfRange,
                    format!("planned volume {v} must be >= 0"),
                ))
            }
            Some(v) => v,
            None => req.duration_minutes as f64 * farm.flow_rate_lpm_per_zone * zones.len() as f64,
        };

        let start = req.start_at.unwrap_or(at);
        let run = IrrigationRun {
            id: new_id(),
            farm_id: farm.id.clone(),
            zones,
            duration_minutes: req.duration_minutes,
            planned_volume,
            actual_volume: None,
            schedule: ScheduleTimes {
                start,
                end: start + Duration::minutes(req.duration_minutes as i64),
                actual_start: None,
                actual_end: None,
            },
            trigger_reason: req.trigger_reason,
            status: RunStatus::Pending,
            efficiency: None,
            moisture_deltas: Vec::new(),
            alerts: Vec::new(),
            cost: None,
            created_at: at,
        };
        self.store.insert_run(&run).await?;
        info!(
            farm = %run.farm_id,
            run = %run.id,
            zones = ?run.zones,
            minutes = run.duration_minutes,
            planned_l = run.planned_volume,
            "irrigation run created"
        );
        Ok(run)
    }

    async fn start_locked(&self, run: IrrigationRun) -> Result<IrrigationRun> {
        if run.status == RunStatus::Pending {
            if let Some(active) = self.active_run(&run.farm_id).await? {
                return Err(CoreError::conflict(
                    Reason::IrrigationActive,
                    format!("run {} is already running on farm {}", active.id, run.farm_id),
                ));
            }
        }
        let at = now();
        let run = self
            .transition(run, RunStatus::Running, move |run| {
                run.schedule.actual_start = Some(at);
                Ok(())
            })
            .await?;
        info!(farm = %run.farm_id, run = %run.id, zones = ?run.zones, "irrigation started");
        Ok(run)
    }

    /// Check, mutate and compare-and-set one run. Caller holds the farm lock.
    async fn transition<F>(
        &self,
        mut run: IrrigationRun,
        next: RunStatus,
        apply: F,
    ) -> Result<IrrigationRun>
    where
        F: FnOnce(&mut IrrigationRun) -> Result<()> + Send,
    {
        let expected = run.status;
        if !expected.can_transition_to(next) {
            return Err(invalid_transition(&run.id, expected, next));
        }
        apply(&mut run)?;
        run.status = next;

        if self.store.update_run(&run, expected).await? {
            return Ok(run);
        }
        // Lost the race; report what the store now holds.
        let latest = self.load(&run.id).await?;
        if latest.status == expected && next == RunStatus::Running {
            Err(CoreError::conflict(
                Reason::IrrigationActive,
                format!("another run is already running on farm {}", run.farm_id),
            ))
        } else {
            Err(invalid_transition(&run.id, latest.status, next))
        }
    }

    async fn load(&self, run_id: &str) -> Result<IrrigationRun> {
        self.store
            .run(run_id)
            .await?
            .ok_or_else(|| CoreError::not_found("irrigation run", run_id))
    }
}

fn invalid_transition(run_id: &str, from: RunStatus, to: RunStatus) -> CoreError {
    CoreError::conflict(
        Reason::InvalidTransition,
        format!("run {run_id} is {} and cannot become {}", from.as_str(), to.as_str()),
    )
}

/// Never earlier than the actual start.
fn end_stamp(run: &IrrigationRun, at: OffsetDateTime) -> OffsetDateTime {
    match run.schedule.actual_start {
        Some(start) if start > at => start,
        _ => at,
    }
}

/// Percent of the planned volume delivered; undefined for a zero plan.
fn efficiency(actual: f64, planned: f64) -> Option<i64> {
    (planned > 0.0).then(|| (actual / planned * 100.0).round() as i64)
}

fn check_moisture(zone_id: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(CoreError::validation(
            Reason::OutOfRange,
            format!("zone {zone_id} moisture {value} outside [0, 100]"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AutoSchedule, Zone};
    use crate::registry::FarmThresholds;
    use crate::store::MemoryStore;

    fn farm(id: &str) -> Farm {
        Farm {
            id: id.into(),
            name: "Test farm".into(),
            latitude: 38.5,
            longitude: -121.7,
            area_hectares: 4.0,
            crop_target_moisture: 80.0,
            zones: ["z1", "z2"]
                .iter()
                .map(|z| Zone {
                    id: z.to_string(),
                    name: z.to_uppercase(),
                    area_hectares: 2.0,
                })
                .collect(),
            thresholds: FarmThresholds::default(),
            auto_schedule: AutoSchedule::default(),
            flow_rate_lpm_per_zone: 10.0,
            water_cost_per_liter: 0.002,
            notify: None,
        }
    }

    async fn manager() -> (Arc<LifecycleManager>, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        for id in ["f1", "f2"] {
            store.upsert_farm(&farm(id)).await.unwrap();
        }
        let alerts = Arc::new(AlertAggregator::new(Arc::clone(&store), None));
        (Arc::new(LifecycleManager::new(Arc::clone(&store), alerts)), store)
    }

    fn request(zones: &[&str], minutes: u32) -> RunRequest {
        RunRequest {
            zones: zones.iter().map(|z| z.to_string()).collect(),
            duration_minutes: minutes,
            trigger_reason: TriggerReason::Manual,
            planned_volume: None,
            start_at: None,
        }
    }

    fn completion(volume: f64) -> Completion {
        Completion {
            actual_volume: volume,
            moisture_deltas: vec![],
        }
    }

    #[tokio::test]
    async fn create_derives_planned_volume() {
        let (lm, _) = manager().await;
        let run = lm.create(&farm("f1"), request(&["z1", "z2"], 15)).await.unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.planned_volume, 300.0);
        assert_eq!(run.schedule.end - run.schedule.start, Duration::minutes(15));
    }

    #[tokio::test]
    async fn create_rejects_foreign_or_empty_zones() {
        let (lm, _) = manager().await;
        let err = lm.create(&farm("f1"), request(&["z9"], 10)).await.unwrap_err();
        assert!(matches!(err, CoreError::Invariant { reason: Reason::ZoneNotInFarm, .. }));
        let err = lm.create(&farm("f1"), request(&[], 10)).await.unwrap_err();
        assert_eq!(err.reason(), Some(Reason::EmptyZoneSet));
        let err = lm.create(&farm("f1"), request(&["z1"], 0)).await.unwrap_err();
        assert_eq!(err.reason(), Some(Reason::OutOfRange));
    }

    #[tokio::test]
    async fn create_while_running_is_conflict() {
        let (lm, _) = manager().await;
        lm.create_and_start(&farm("f1"), request(&["z1"], 10)).await.unwrap();
        let err = lm.create(&farm("f1"), request(&["z2"], 10)).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict { reason: Reason::IrrigationActive, .. }));
        // Other farms are unaffected.
        lm.create_and_start(&farm("f2"), request(&["z1"], 10)).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_starts_yield_exactly_one_running_run() {
        let (lm, store) = manager().await;
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let lm = Arc::clone(&lm);
            tasks.push(tokio::spawn(async move {
                lm.create_and_start(&farm("f1"), request(&["z1"], 10)).await
            }));
        }
        let mut ok = 0;
        for t in tasks {
            match t.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => assert_eq!(e.reason(), Some(Reason::IrrigationActive)),
            }
        }
        assert_eq!(ok, 1);
        let running = store.runs_for_farm("f1", Some(RunStatus::Running)).await.unwrap();
        assert_eq!(running.len(), 1);
    }

    #[tokio::test]
    async fn racing_pending_starts_admit_one() {
        let (lm, store) = manager().await;
        let a = lm.create(&farm("f1"), request(&["z1"], 10)).await.unwrap();
        let b = lm.create(&farm("f1"), request(&["z2"], 10)).await.unwrap();
        let (ra, rb) = tokio::join!(lm.start(&a.id), lm.start(&b.id));
        assert!(ra.is_ok() ^ rb.is_ok());
        let running = store.runs_for_farm("f1", Some(RunStatus::Running)).await.unwrap();
        assert_eq!(running.len(), 1);
    }

    #[tokio::test]
    async fn start_requires_pending() {
        let (lm, _) = manager().await;
        let run = lm.create_and_start(&farm("f1"), request(&["z1"], 10)).await.unwrap();
        let err = lm.start(&run.id).await.unwrap_err();
        assert_eq!(err.reason(), Some(Reason::InvalidTransition));
    }

    #[tokio::test]
    async fn complete_computes_efficiency_and_cost() {
        let (lm, _) = manager().await;
        let run = lm.create_and_start(&farm("f1"), request(&["z1"], 10)).await.unwrap();
        let done = lm
            .complete(
                &run.id,
                Completion {
                    actual_volume: 90.0,
                    moisture_deltas: vec![MoistureDelta {
                        zone_id: "z1".into(),
                        before: 30.0,
                        after: 55.0,
                    }],
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.efficiency, Some(90));
        assert!((done.cost.unwrap() - 0.18).abs() < 1e-9);
        assert_eq!(done.moisture_deltas[0].change(), 25.0);
        assert!(done.schedule.actual_end.unwrap() >= done.schedule.actual_start.unwrap());
    }

    #[tokio::test]
    async fn second_complete_is_rejected_and_changes_nothing() {
        let (lm, store) = manager().await;
        let run = lm.create_and_start(&farm("f1"), request(&["z1"], 10)).await.unwrap();
        let first = lm.complete(&run.id, completion(100.0)).await.unwrap();

        let err = lm.complete(&run.id, completion(50.0)).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict { reason: Reason::InvalidTransition, .. }));
        let stored = store.run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.schedule.actual_end, first.schedule.actual_end);
        assert_eq!(stored.actual_volume, Some(100.0));
    }

    #[tokio::test]
    async fn zero_plan_has_no_efficiency() {
        let (lm, _) = manager().await;
        let mut req = request(&["z1"], 10);
        req.planned_volume = Some(0.0);
        let run = lm.create_and_start(&farm("f1"), req).await.unwrap();
        let done = lm.complete(&run.id, completion(12.0)).await.unwrap();
        assert_eq!(done.efficiency, None);
    }

    #[tokio::test]
    async fn complete_rejects_deltas_for_other_zones() {
        let (lm, store) = manager().await;
        let run = lm.create_and_start(&farm("f1"), request(&["z1"], 10)).await.unwrap();
        let err = lm
            .complete(
                &run.id,
                Completion {
                    actual_volume: 10.0,
                    moisture_deltas: vec![MoistureDelta {
                        zone_id: "z2".into(),
                        before: 30.0,
                        after: 40.0,
                    }],
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some(Reason::ZoneNotInFarm));
        let stored = store.run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn cancel_then_complete_is_conflict() {
        let (lm, _) = manager().await;
        let run = lm.create_and_start(&farm("f1"), request(&["z1"], 10)).await.unwrap();
        let cancelled = lm.cancel(&run.id, Some("operator stop")).await.unwrap();
        assert_eq!(cancelled.status, RunStatus::Cancelled);
        assert_eq!(cancelled.alerts, vec!["operator stop".to_string()]);

        let err = lm.complete(&run.id, completion(10.0)).await.unwrap_err();
        assert_eq!(err.reason(), Some(Reason::InvalidTransition));
        let err = lm.cancel(&run.id, None).await.unwrap_err();
        assert_eq!(err.reason(), Some(Reason::InvalidTransition));
    }

    #[tokio::test]
    async fn racing_cancel_and_complete_have_one_winner() {
        let (lm, store) = manager().await;
        let run = lm.create_and_start(&farm("f1"), request(&["z1"], 10)).await.unwrap();
        let (c, d) = tokio::join!(lm.cancel(&run.id, None), lm.complete(&run.id, completion(5.0)));
        assert!(c.is_ok() ^ d.is_ok());
        let stored = store.run(&run.id).await.unwrap().unwrap();
        assert!(stored.status.is_terminal());
    }

    #[tokio::test]
    async fn cancel_pending_run() {
        let (lm, _) = manager().await;
        let run = lm.create(&farm("f1"), request(&["z1"], 10)).await.unwrap();
        let run = lm.cancel(&run.id, None).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.schedule.actual_end, None);
    }

    #[tokio::test]
    async fn fail_raises_system_error_on_farm() {
        let (lm, store) = manager().await;
        let run = lm.create_and_start(&farm("f1"), request(&["z1"], 10)).await.unwrap();
        let failed = lm.fail(&run.id, "valve stuck").await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);

        let alerts = store
            .pending_alerts_for(&AlertSubject::Farm("f1".into()))
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::SystemError);
        assert!(alerts[0].message.contains("valve stuck"));

        // The farm is free again.
        lm.create_and_start(&farm("f1"), request(&["z1"], 10)).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let (lm, _) = manager().await;
        let err = lm.start("nope").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn due_pending_runs_are_started_in_order() {
        let (lm, store) = manager().await;
        let t0 = now();
        let mut early = request(&["z1"], 10);
        early.start_at = Some(t0 - Duration::minutes(5));
        let mut later = request(&["z2"], 10);
        later.start_at = Some(t0 - Duration::minutes(1));
        let mut future = request(&["z1"], 10);
        future.start_at = Some(t0 + Duration::hours(2));
        let early = lm.create(&farm("f1"), early).await.unwrap();
        lm.create(&farm("f1"), later).await.unwrap();
        lm.create(&farm("f1"), future).await.unwrap();

        let started = lm.start_due("f1", t0).await.unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].id, early.id);
        let pending = store.runs_for_farm("f1", Some(RunStatus::Pending)).await.unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn overdue_runs_are_failed() {
        let (lm, _) = manager().await;
        let run = lm.create_and_start(&farm("f1"), request(&["z1"], 10)).await.unwrap();
        let grace = Duration::minutes(15);

        let none = lm.fail_overdue("f1", now(), grace).await.unwrap();
        assert!(none.is_empty());

        let later = now() + Duration::minutes(30);
        let failed = lm.fail_overdue("f1", later, grace).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, run.id);
        assert_eq!(failed[0].status, RunStatus::Failed);
    }
}
