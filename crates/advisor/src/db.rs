use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::model::{
    Alert, AlertSubject, AlertType, Connectivity, Device, Farm, IrrigationRun, Reading, RunStatus,
    Severity,
};
use crate::store::{AlertUpsert, Store};

/// SQLite-backed [`Store`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// db_url examples:
    /// - "sqlite:/var/lib/irrigation/advisor.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to ":memory:" opens its own database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    async fn run_exists(&self, run_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM irrigation_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .context("run lookup failed")?;
        Ok(row.is_some())
    }
}

// ----------------------------
// Row mapping
// ----------------------------

fn ts_ms(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

fn fmt_ts(t: OffsetDateTime) -> Result<String> {
    t.format(&Rfc3339).context("failed to format timestamp")
}

fn parse_ts(s: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339).with_context(|| format!("bad timestamp in db: {s}"))
}

fn json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("failed to encode record")
}

fn from_json<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body).context("failed to decode record")
}

fn body<T: serde::de::DeserializeOwned>(row: &SqliteRow) -> Result<T> {
    let body: String = row.try_get("body")?;
    from_json(&body)
}

fn device_from_row(row: &SqliteRow) -> Result<Device> {
    let calibration: String = row.try_get("calibration")?;
    let thresholds: Option<String> = row.try_get("thresholds")?;
    let last_seen_at: Option<String> = row.try_get("last_seen_at")?;
    let signal_strength: Option<i64> = row.try_get("signal_strength")?;
    let last_reading: Option<String> = row.try_get("last_reading")?;
    let reading_count: i64 = row.try_get("reading_count")?;
    let active: i64 = row.try_get("active")?;

    Ok(Device {
        id: row.try_get("id")?,
        farm_id: row.try_get("farm_id")?,
        zone_id: row.try_get("zone_id")?,
        active: active != 0,
        calibration: from_json(&calibration)?,
        thresholds: thresholds.as_deref().map(from_json).transpose()?,
        connectivity: Connectivity {
            last_seen_at: last_seen_at.as_deref().map(parse_ts).transpose()?,
            signal_strength: signal_strength.map(|v| v as i32),
        },
        last_reading: last_reading.as_deref().map(from_json).transpose()?,
        reading_count: reading_count.max(0) as u64,
    })
}

fn alert_from_row(row: &SqliteRow) -> Result<Alert> {
    let kind: String = row.try_get("subject_kind")?;
    let subject_id: String = row.try_get("subject_id")?;
    let alert_type: String = row.try_get("alert_type")?;
    let severity: String = row.try_get("severity")?;
    let ts: String = row.try_get("ts")?;
    let acknowledged: i64 = row.try_get("acknowledged")?;

    Ok(Alert {
        id: row.try_get("id")?,
        subject: AlertSubject::from_parts(&kind, subject_id)
            .ok_or_else(|| anyhow!("bad alert subject kind in db: {kind}"))?,
        farm_id: row.try_get("farm_id")?,
        alert_type: AlertType::parse(&alert_type)
            .ok_or_else(|| anyhow!("bad alert type in db: {alert_type}"))?,
        severity: Severity::parse(&severity)
            .ok_or_else(|| anyhow!("bad severity in db: {severity}"))?,
        message: row.try_get("message")?,
        timestamp: parse_ts(&ts)?,
        acknowledged: acknowledged != 0,
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|d| d.is_unique_violation())
}

#[async_trait]
impl Store for SqliteStore {
    // ----------------------------
    // Farms & devices
    // ----------------------------

    async fn upsert_farm(&self, farm: &Farm) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO farms (id, body) VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET body = excluded.body
            "#,
        )
        .bind(&farm.id)
        .bind(json(farm)?)
        .execute(&self.pool)
        .await
        .context("upsert_farm failed")?;
        Ok(())
    }

    async fn farm(&self, farm_id: &str) -> Result<Option<Farm>> {
        let row = sqlx::query("SELECT body FROM farms WHERE id = ?")
            .bind(farm_id)
            .fetch_optional(&self.pool)
            .await
            .context("farm lookup failed")?;
        row.as_ref().map(body).transpose()
    }

    async fn farms(&self) -> Result<Vec<Farm>> {
        let rows = sqlx::query("SELECT body FROM farms ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("load farms failed")?;
        rows.iter().map(body).collect()
    }

    async fn upsert_device(&self, d: &Device) -> Result<()> {
        let last_seen = d.connectivity.last_seen_at.map(fmt_ts).transpose()?;
        let thresholds = d.thresholds.as_ref().map(json).transpose()?;
        let last_reading = d.last_reading.as_ref().map(json).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO devices (
              id, farm_id, zone_id, active, calibration, thresholds,
              last_seen_at, signal_strength, last_reading, reading_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              farm_id=excluded.farm_id,
              zone_id=excluded.zone_id,
              active=excluded.active,
              calibration=excluded.calibration,
              thresholds=excluded.thresholds,
              last_seen_at=excluded.last_seen_at,
              signal_strength=excluded.signal_strength,
              last_reading=excluded.last_reading,
              reading_count=excluded.reading_count
            "#,
        )
        .bind(&d.id)
        .bind(&d.farm_id)
        .bind(&d.zone_id)
        .bind(d.active as i64)
        .bind(json(&d.calibration)?)
        .bind(thresholds)
        .bind(last_seen)
        .bind(d.connectivity.signal_strength.map(i64::from))
        .bind(last_reading)
        .bind(d.reading_count as i64)
        .execute(&self.pool)
        .await
        .context("upsert_device failed")?;
        Ok(())
    }

    async fn device(&self, device_id: &str) -> Result<Option<Device>> {
        let row = sqlx::query("SELECT * FROM devices WHERE id = ?")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .context("device lookup failed")?;
        row.as_ref().map(device_from_row).transpose()
    }

    async fn devices_for_farm(&self, farm_id: &str) -> Result<Vec<Device>> {
        let rows = sqlx::query("SELECT * FROM devices WHERE farm_id = ? ORDER BY id")
            .bind(farm_id)
            .fetch_all(&self.pool)
            .await
            .context("devices_for_farm failed")?;
        rows.iter().map(device_from_row).collect()
    }

    // ----------------------------
    // Readings
    // ----------------------------

    async fn record_reading(
        &self,
        reading: &Reading,
        received_at: OffsetDateTime,
    ) -> Result<Device> {
        let mut tx = self.pool.begin().await.context("begin failed")?;

        // Write first so the transaction holds the write lock throughout.
        let row = sqlx::query(
            r#"
            UPDATE devices SET
              reading_count = reading_count + 1,
              last_seen_at = ?,
              signal_strength = COALESCE(?, signal_strength),
              last_reading = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(fmt_ts(received_at)?)
        .bind(reading.signal_strength.map(i64::from))
        .bind(json(&reading.snapshot())?)
        .bind(&reading.device_id)
        .fetch_optional(&mut *tx)
        .await
        .context("device stats update failed")?;
        let Some(row) = row else {
            return Err(anyhow!("record_reading: unknown device {}", reading.device_id));
        };
        let device = device_from_row(&row)?;

        sqlx::query(
            r#"
            INSERT INTO readings (id, device_id, farm_id, ts_ms, body)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&reading.id)
        .bind(&reading.device_id)
        .bind(&reading.farm_id)
        .bind(ts_ms(reading.timestamp))
        .bind(json(reading)?)
        .execute(&mut *tx)
        .await
        .context("insert reading failed")?;

        tx.commit().await.context("commit failed")?;
        Ok(device)
    }

    async fn latest_readings(&self, farm_id: &str) -> Result<Vec<Reading>> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM readings
            WHERE rowid IN (
              SELECT MAX(rowid) FROM readings WHERE farm_id = ? GROUP BY device_id
            )
            ORDER BY device_id
            "#,
        )
        .bind(farm_id)
        .fetch_all(&self.pool)
        .await
        .context("latest_readings failed")?;
        rows.iter().map(body).collect()
    }

    async fn recent_readings(&self, farm_id: &str, limit: usize) -> Result<Vec<Reading>> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM readings
            WHERE farm_id = ?
            ORDER BY ts_ms DESC
            LIMIT ?
            "#,
        )
        .bind(farm_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("recent_readings failed")?;
        rows.iter().map(body).collect()
    }

    // ----------------------------
    // Alerts
    // ----------------------------

    async fn upsert_alert(&self, alert: Alert) -> Result<AlertUpsert> {
        // SET expressions read the pre-update row, so prev_severity
        // captures the severity being replaced.
        let row = sqlx::query(
            r#"
            INSERT INTO alerts (
              id, subject_kind, subject_id, farm_id, alert_type,
              severity, prev_severity, message, ts, ts_ms, acknowledged
            ) VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?, ?, 0)
            ON CONFLICT (subject_kind, subject_id, alert_type) WHERE acknowledged = 0
            DO UPDATE SET
              prev_severity = severity,
              severity = excluded.severity,
              message = excluded.message,
              ts = excluded.ts,
              ts_ms = excluded.ts_ms
            RETURNING *
            "#,
        )
        .bind(&alert.id)
        .bind(alert.subject.kind())
        .bind(alert.subject.id())
        .bind(&alert.farm_id)
        .bind(alert.alert_type.as_str())
        .bind(alert.severity.as_str())
        .bind(&alert.message)
        .bind(fmt_ts(alert.timestamp)?)
        .bind(ts_ms(alert.timestamp))
        .fetch_one(&self.pool)
        .await
        .context("upsert_alert failed")?;

        let stored = alert_from_row(&row)?;
        if stored.id == alert.id {
            return Ok(AlertUpsert::Inserted(stored));
        }
        let prev: Option<String> = row.try_get("prev_severity")?;
        let previous = prev
            .as_deref()
            .and_then(Severity::parse)
            .ok_or_else(|| anyhow!("refreshed alert {} lost its previous severity", stored.id))?;
        Ok(AlertUpsert::Refreshed {
            alert: stored,
            previous,
        })
    }

    async fn alert(&self, alert_id: &str) -> Result<Option<Alert>> {
        let row = sqlx::query("SELECT * FROM alerts WHERE id = ?")
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await
            .context("alert lookup failed")?;
        row.as_ref().map(alert_from_row).transpose()
    }

    async fn alerts_for_farm(&self, farm_id: &str, only_pending: bool) -> Result<Vec<Alert>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM alerts
            WHERE farm_id = ? AND (? = 0 OR acknowledged = 0)
            ORDER BY ts_ms DESC
            "#,
        )
        .bind(farm_id)
        .bind(only_pending as i64)
        .fetch_all(&self.pool)
        .await
        .context("alerts_for_farm failed")?;
        rows.iter().map(alert_from_row).collect()
    }

    async fn pending_alerts_for(&self, subject: &AlertSubject) -> Result<Vec<Alert>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM alerts
            WHERE subject_kind = ? AND subject_id = ? AND acknowledged = 0
            ORDER BY ts_ms DESC
            "#,
        )
        .bind(subject.kind())
        .bind(subject.id())
        .fetch_all(&self.pool)
        .await
        .context("pending_alerts_for failed")?;
        rows.iter().map(alert_from_row).collect()
    }

    async fn acknowledge_alert(&self, alert_id: &str) -> Result<Option<Alert>> {
        let row = sqlx::query("UPDATE alerts SET acknowledged = 1 WHERE id = ? RETURNING *")
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await
            .context("acknowledge_alert failed")?;
        row.as_ref().map(alert_from_row).transpose()
    }

    // ----------------------------
    // Irrigation runs
    // ----------------------------

    async fn insert_run(&self, run: &IrrigationRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO irrigation_runs (id, farm_id, status, created_ms, body)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.farm_id)
        .bind(run.status.as_str())
        .bind(ts_ms(run.created_at))
        .bind(json(run)?)
        .execute(&self.pool)
        .await
        .context("insert_run failed")?;
        Ok(())
    }

    async fn run(&self, run_id: &str) -> Result<Option<IrrigationRun>> {
        let row = sqlx::query("SELECT body FROM irrigation_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .context("run lookup failed")?;
        row.as_ref().map(body).transpose()
    }

    async fn runs_for_farm(
        &self,
        farm_id: &str,
        status: Option<RunStatus>,
    ) -> Result<Vec<IrrigationRun>> {
        let status = status.map(RunStatus::as_str);
        let rows = sqlx::query(
            r#"
            SELECT body FROM irrigation_runs
            WHERE farm_id = ? AND (? IS NULL OR status = ?)
            ORDER BY created_ms DESC, id DESC
            "#,
        )
        .bind(farm_id)
        .bind(status)
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .context("runs_for_farm failed")?;
        rows.iter().map(body).collect()
    }

    async fn update_run(&self, run: &IrrigationRun, expected: RunStatus) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE irrigation_runs SET status = ?, body = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(run.status.as_str())
        .bind(json(run)?)
        .bind(&run.id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await;

        match res {
            Ok(done) if done.rows_affected() == 1 => Ok(true),
            Ok(_) => {
                if self.run_exists(&run.id).await? {
                    Ok(false)
                } else {
                    Err(anyhow!("update_run: unknown run {}", run.id))
                }
            }
            // The partial index rejected a second running run for the farm.
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(anyhow::Error::new(e).context("update_run failed")),
        }
    }
}
