use anyhow::Result;
use rumqttc::AsyncClient;
use std::{env, sync::Arc};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use irrigation_advisor::config::{self, SinkKind};
use irrigation_advisor::db::SqliteStore;
use irrigation_advisor::ingest::IngestLanes;
use irrigation_advisor::notify::{LogNotifier, MqttNotifier, NotificationPool, Notifier};
use irrigation_advisor::service::IrrigationService;
use irrigation_advisor::store::{MemoryStore, Store};
use irrigation_advisor::{mqtt, scheduler, state, web};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:advisor.db?mode=rwc".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Store ───────────────────────────────────────────────────────
    let store: Arc<dyn Store> = if db_url == "memory" {
        warn!("DB_URL=memory: nothing survives a restart");
        Arc::new(MemoryStore::new())
    } else {
        let db = SqliteStore::connect(&db_url).await?;
        db.migrate().await?;
        Arc::new(db)
    };

    // ── Config file (seed farms + devices) ───────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, store.as_ref()).await?;

    let farms = store.farms().await?;
    if farms.is_empty() {
        warn!("no farms configured");
    }
    info!(farms = farms.len(), db = %db_url, "store ready");

    // ── Shared activity state ───────────────────────────────────────
    let activity = state::shared();
    activity
        .write()
        .await
        .record_system("advisor started".to_string());

    // ── MQTT client (telemetry in, notifications out) ───────────────
    let (client, eventloop) = AsyncClient::new(mqtt::options("irrigation-advisor", &broker, port), 20);

    // ── Notifications ───────────────────────────────────────────────
    let notifier: Arc<dyn Notifier> = match cfg.notifications.sink {
        SinkKind::Log => Arc::new(LogNotifier),
        SinkKind::Mqtt => Arc::new(MqttNotifier::new(client.clone())),
    };
    info!(sink = notifier.name(), workers = cfg.notifications.workers, "notifications ready");
    let (pool, mut reports) = NotificationPool::spawn(notifier, &cfg.notifications.pool());
    tokio::spawn(async move {
        while let Some(report) = reports.recv().await {
            match &report.outcome {
                Ok(()) => debug!(recipient = %report.delivery.recipient, "notification delivered"),
                Err(e) => warn!(recipient = %report.delivery.recipient, "notification failed: {e}"),
            }
        }
    });

    // ── Service ─────────────────────────────────────────────────────
    let service = Arc::new(
        IrrigationService::new(store, Some(pool), Arc::clone(&activity))
            .with_forecast(cfg.forecast.build(), cfg.forecast.timeout())
            .with_policy(cfg.policy.clone()),
    );

    // ── Web server ──────────────────────────────────────────────────
    let web_service = Arc::clone(&service);
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_service, web_port).await {
            error!("web server stopped: {e:#}");
        }
    });

    // ── Scheduler ───────────────────────────────────────────────────
    if cfg.scheduler.enabled {
        tokio::spawn(scheduler::run(Arc::clone(&service), cfg.scheduler.clone()));
    } else {
        info!("scheduler disabled");
    }

    // ── Telemetry ───────────────────────────────────────────────────
    let lanes = Arc::new(IngestLanes::new(service, cfg.ingest.lane_depth));
    mqtt::run(client, eventloop, lanes, activity).await
}
