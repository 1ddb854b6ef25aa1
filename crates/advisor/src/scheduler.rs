//! Periodic farm maintenance.
//!
//! Every tick walks all farms and, in order:
//!
//! ```text
//! sweep offline devices ─▶ fail overdue runs ─▶ start due runs ─▶ auto-schedule
//! ```
//!
//! Overdue runs are failed before due ones are started so that a stuck run
//! does not hold the farm's irrigation slot for another tick. A failure in
//! one step is logged and the remaining steps and farms still run.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{error, info};

use crate::config::SchedulerSettings;
use crate::model::{now, Farm};
use crate::service::IrrigationService;

/// What a single tick did, summed across farms.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub offline_alerts: usize,
    pub overdue_failed: usize,
    pub due_started: usize,
    pub auto_started: usize,
    pub errors: usize,
}

impl TickReport {
    fn is_quiet(&self) -> bool {
        *self == TickReport::default()
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the scheduler loop. Intended to be `tokio::spawn`-ed from main.
pub async fn run(service: Arc<IrrigationService>, settings: SchedulerSettings) {
    let period = Duration::from_secs(settings.tick_sec.max(1));

    // Let the first telemetry arrive before judging devices offline or
    // recommending on empty data.
    tokio::time::sleep(period).await;

    let mut ticker = tokio::time::interval(period);
    info!(
        tick_sec = settings.tick_sec,
        overdue_grace_min = settings.overdue_grace_min,
        "scheduler started"
    );
    service
        .activity()
        .write()
        .await
        .record_system(format!("scheduler started (every {}s)", settings.tick_sec));

    loop {
        ticker.tick().await;
        let report = tick(&service, &settings, now()).await;
        if !report.is_quiet() {
            info!(?report, "scheduler tick");
        }
    }
}

/// One pass over every farm at time `at`.
pub async fn tick(
    service: &IrrigationService,
    settings: &SchedulerSettings,
    at: OffsetDateTime,
) -> TickReport {
    let mut report = TickReport::default();

    let farms = match service.store().farms().await {
        Ok(f) => f,
        Err(e) => {
            error!("scheduler: failed to load farms: {e:#}");
            report.errors += 1;
            return report;
        }
    };

    for farm in &farms {
        tick_farm(service, settings, farm, at, &mut report).await;
    }
    report
}

async fn tick_farm(
    service: &IrrigationService,
    settings: &SchedulerSettings,
    farm: &Farm,
    at: OffsetDateTime,
    report: &mut TickReport,
) {
    // ── Offline devices ──────────────────────────────────────────
    match service.sweep_offline(farm, at).await {
        Ok(n) => report.offline_alerts += n,
        Err(e) => {
            error!(farm = %farm.id, "scheduler: offline sweep failed: {e}");
            report.errors += 1;
        }
    }

    let lifecycle = service.lifecycle();
    let grace = time::Duration::minutes(settings.overdue_grace_min);

    // ── Watchdog ─────────────────────────────────────────────────
    match lifecycle.fail_overdue(&farm.id, at, grace).await {
        Ok(failed) => {
            for run in &failed {
                info!(farm = %farm.id, run = %run.id, "scheduler: overdue run failed");
                service
                    .activity()
                    .write()
                    .await
                    .record_irrigation(format!("run {} failed: overdue", run.id));
            }
            report.overdue_failed += failed.len();
        }
        Err(e) => {
            error!(farm = %farm.id, "scheduler: overdue check failed: {e}");
            report.errors += 1;
        }
    }

    // ── Scheduled starts ─────────────────────────────────────────
    match lifecycle.start_due(&farm.id, at).await {
        Ok(started) => {
            for run in &started {
                info!(farm = %farm.id, run = %run.id, "scheduler: scheduled run started");
                service
                    .activity()
                    .write()
                    .await
                    .record_irrigation(format!("run {} started on schedule", run.id));
            }
            report.due_started += started.len();
        }
        Err(e) => {
            error!(farm = %farm.id, "scheduler: starting due runs failed: {e}");
            report.errors += 1;
        }
    }

    // ── Automation ───────────────────────────────────────────────
    match service.evaluate_auto_schedule(farm).await {
        Ok(Some(_)) => report.auto_started += 1,
        Ok(None) => {}
        Err(e) => {
            error!(farm = %farm.id, "scheduler: auto-schedule failed: {e}");
            report.errors += 1;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
