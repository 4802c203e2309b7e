use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::notify::{NotificationData, NotificationKind};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Domain rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Greenhouse {
    pub greenhouse_id: String,
    pub name: String,
    pub owner_user_id: String,
    pub target_moisture: f64,
}

/// Reading fields as they arrive from a sensor node, before persistence.
#[derive(Debug, Clone)]
pub struct NewReading {
    pub greenhouse_id: String,
    pub ts: i64,
    pub soil_moisture: f64,
    pub air_temperature: f64,
    pub air_humidity: f64,
    pub soil_temperature: f64,
    pub light_intensity: f64,
    pub water_level: f64,
    pub water_reserve: f64,
}

/// Immutable persisted reading. Never mutated after insert.
#[derive(Debug, Clone, Serialize)]
pub struct StoredReading {
    pub id: i64,
    pub greenhouse_id: String,
    pub ts: i64,
    pub soil_moisture: f64,
    pub air_temperature: f64,
    pub air_humidity: f64,
    pub soil_temperature: f64,
    pub light_intensity: f64,
    pub water_level: f64,
    pub water_reserve: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IrrigationKind {
    Automatic,
    Detected,
    Manual,
}

impl IrrigationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Detected => "detected",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "automatic" => Some(Self::Automatic),
            "detected" => Some(Self::Detected),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IrrigationEvent {
    pub id: i64,
    pub greenhouse_id: String,
    pub kind: IrrigationKind,
    pub water_liters: Option<f64>,
    pub notes: String,
    pub confirmed: bool,
    pub created_ts: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: i64,
    pub user_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub data: NotificationData,
    pub read: bool,
    pub created_ts: i64,
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn reading_from_row(row: &SqliteRow) -> Result<StoredReading> {
    Ok(StoredReading {
        id: row.try_get("id")?,
        greenhouse_id: row.try_get("greenhouse_id")?,
        ts: row.try_get("ts")?,
        soil_moisture: row.try_get("soil_moisture")?,
        air_temperature: row.try_get("air_temperature")?,
        air_humidity: row.try_get("air_humidity")?,
        soil_temperature: row.try_get("soil_temperature")?,
        light_intensity: row.try_get("light_intensity")?,
        water_level: row.try_get("water_level")?,
        water_reserve: row.try_get("water_reserve")?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<IrrigationEvent> {
    let kind: String = row.try_get("kind")?;
    Ok(IrrigationEvent {
        id: row.try_get("id")?,
        greenhouse_id: row.try_get("greenhouse_id")?,
        kind: IrrigationKind::parse(&kind)
            .with_context(|| format!("unknown irrigation kind '{kind}' in db"))?,
        water_liters: row.try_get("water_liters")?,
        notes: row.try_get("notes")?,
        confirmed: row.try_get("confirmed")?,
        created_ts: row.try_get("created_ts")?,
    })
}

fn notification_from_row(row: &SqliteRow) -> Result<Notification> {
    let kind: String = row.try_get("kind")?;
    let data: String = row.try_get("data")?;
    Ok(Notification {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        kind: NotificationKind::parse(&kind)
            .with_context(|| format!("unknown notification kind '{kind}' in db"))?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        data: serde_json::from_str(&data).context("malformed notification data payload")?,
        read: row.try_get("read")?,
        created_ts: row.try_get("created_ts")?,
    })
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

// ---------------------------------------------------------------------------
// Db
// ---------------------------------------------------------------------------

impl Db {
    /// db_url examples:
    /// - "sqlite:greenhouse.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // An in-memory database is private to its connection; a larger pool
        // would hand out connections that never saw the migrations.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Greenhouses
    // ----------------------------

    pub async fn upsert_greenhouse(&self, g: &Greenhouse) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO greenhouses (greenhouse_id, name, owner_user_id, target_moisture)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(greenhouse_id) DO UPDATE SET
              name=excluded.name,
              owner_user_id=excluded.owner_user_id,
              target_moisture=excluded.target_moisture
            "#,
        )
        .bind(&g.greenhouse_id)
        .bind(&g.name)
        .bind(&g.owner_user_id)
        .bind(g.target_moisture)
        .execute(&self.pool)
        .await
        .context("upsert_greenhouse failed")?;
        Ok(())
    }

    pub async fn load_greenhouses(&self) -> Result<Vec<Greenhouse>> {
        let rows = sqlx::query(
            r#"
            SELECT greenhouse_id, name, owner_user_id, target_moisture
            FROM greenhouses
            ORDER BY greenhouse_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_greenhouses failed")?;

        rows.iter()
            .map(|r| {
                Ok(Greenhouse {
                    greenhouse_id: r.try_get("greenhouse_id")?,
                    name: r.try_get("name")?,
                    owner_user_id: r.try_get("owner_user_id")?,
                    target_moisture: r.try_get("target_moisture")?,
                })
            })
            .collect()
    }

    pub async fn get_greenhouse(&self, greenhouse_id: &str) -> Result<Option<Greenhouse>> {
        let row = sqlx::query(
            r#"
            SELECT greenhouse_id, name, owner_user_id, target_moisture
            FROM greenhouses
            WHERE greenhouse_id = ?
            "#,
        )
        .bind(greenhouse_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_greenhouse failed")?;

        row.map(|r| {
            Ok(Greenhouse {
                greenhouse_id: r.try_get("greenhouse_id")?,
                name: r.try_get("name")?,
                owner_user_id: r.try_get("owner_user_id")?,
                target_moisture: r.try_get("target_moisture")?,
            })
        })
        .transpose()
    }

    // ----------------------------
    // Sensor readings
    // ----------------------------

    pub async fn insert_reading(&self, r: &NewReading) -> Result<StoredReading> {
        let res = sqlx::query(
            r#"
            INSERT INTO sensor_readings (
              greenhouse_id, ts,
              soil_moisture, air_temperature, air_humidity, soil_temperature,
              light_intensity, water_level, water_reserve
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&r.greenhouse_id)
        .bind(r.ts)
        .bind(r.soil_moisture)
        .bind(r.air_temperature)
        .bind(r.air_humidity)
        .bind(r.soil_temperature)
        .bind(r.light_intensity)
        .bind(r.water_level)
        .bind(r.water_reserve)
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;

        Ok(StoredReading {
            id: res.last_insert_rowid(),
            greenhouse_id: r.greenhouse_id.clone(),
            ts: r.ts,
            soil_moisture: r.soil_moisture,
            air_temperature: r.air_temperature,
            air_humidity: r.air_humidity,
            soil_temperature: r.soil_temperature,
            light_intensity: r.light_intensity,
            water_level: r.water_level,
            water_reserve: r.water_reserve,
        })
    }

    /// Most recent reading for a greenhouse. Id breaks timestamp ties, so
    /// arrival order decides which reading counts as "previous".
    pub async fn latest_reading(&self, greenhouse_id: &str) -> Result<Option<StoredReading>> {
        let row = sqlx::query(
            r#"
            SELECT id, greenhouse_id, ts,
                   soil_moisture, air_temperature, air_humidity, soil_temperature,
                   light_intensity, water_level, water_reserve
            FROM sensor_readings
            WHERE greenhouse_id = ?
            ORDER BY ts DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(greenhouse_id)
        .fetch_optional(&self.pool)
        .await
        .context("latest_reading failed")?;

        row.as_ref().map(reading_from_row).transpose()
    }

    pub async fn count_readings(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sensor_readings")
            .fetch_one(&self.pool)
            .await
            .context("count_readings failed")?;
        Ok(row.try_get("n")?)
    }

    // ----------------------------
    // Irrigation events
    // ----------------------------

    pub async fn insert_event(
        &self,
        greenhouse_id: &str,
        kind: IrrigationKind,
        water_liters: Option<f64>,
        notes: &str,
        created_ts: i64,
    ) -> Result<IrrigationEvent> {
        let res = sqlx::query(
            r#"
            INSERT INTO irrigation_events (greenhouse_id, kind, water_liters, notes, created_ts)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(greenhouse_id)
        .bind(kind.as_str())
        .bind(water_liters)
        .bind(notes)
        .bind(created_ts)
        .execute(&self.pool)
        .await
        .context("insert_event failed")?;

        Ok(IrrigationEvent {
            id: res.last_insert_rowid(),
            greenhouse_id: greenhouse_id.to_string(),
            kind,
            water_liters,
            notes: notes.to_string(),
            confirmed: false,
            created_ts,
        })
    }

    pub async fn get_event(&self, id: i64) -> Result<Option<IrrigationEvent>> {
        let row = sqlx::query(
            r#"
            SELECT id, greenhouse_id, kind, water_liters, notes, confirmed, created_ts
            FROM irrigation_events
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_event failed")?;

        row.as_ref().map(event_from_row).transpose()
    }

    /// The dedup invariant query: is there an unconfirmed `detected` event
    /// for this greenhouse created at or after `cutoff_ts`?
    pub async fn has_unconfirmed_detected_since(
        &self,
        greenhouse_id: &str,
        cutoff_ts: i64,
    ) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n
            FROM irrigation_events
            WHERE greenhouse_id = ?
              AND kind = 'detected'
              AND confirmed = 0
              AND created_ts >= ?
            "#,
        )
        .bind(greenhouse_id)
        .bind(cutoff_ts)
        .fetch_one(&self.pool)
        .await
        .context("has_unconfirmed_detected_since failed")?;

        let n: i64 = row.try_get("n")?;
        Ok(n > 0)
    }

    /// Applies a confirmation exactly once. Returns the number of rows
    /// changed: 0 means the event was missing or already confirmed — the
    /// caller distinguishes the two with a follow-up `get_event`.
    pub async fn apply_confirmation(
        &self,
        id: i64,
        final_kind: IrrigationKind,
        water_liters: Option<f64>,
        notes: Option<&str>,
    ) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE irrigation_events
            SET kind = ?,
                water_liters = COALESCE(?, water_liters),
                notes = COALESCE(?, notes),
                confirmed = 1
            WHERE id = ? AND confirmed = 0
            "#,
        )
        .bind(final_kind.as_str())
        .bind(water_liters)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("apply_confirmation failed")?;

        Ok(res.rows_affected())
    }

    pub async fn list_events(
        &self,
        greenhouse_id: Option<&str>,
        kind: Option<IrrigationKind>,
        limit: i64,
    ) -> Result<Vec<IrrigationEvent>> {
        let mut sql = String::from(
            "SELECT id, greenhouse_id, kind, water_liters, notes, confirmed, created_ts \
             FROM irrigation_events WHERE 1=1",
        );
        if greenhouse_id.is_some() {
            sql.push_str(" AND greenhouse_id = ?");
        }
        if kind.is_some() {
            sql.push_str(" AND kind = ?");
        }
        sql.push_str(" ORDER BY created_ts DESC, id DESC LIMIT ?");

        let mut q = sqlx::query(&sql);
        if let Some(g) = greenhouse_id {
            q = q.bind(g);
        }
        if let Some(k) = kind {
            q = q.bind(k.as_str());
        }
        q = q.bind(limit);

        let rows = q
            .fetch_all(&self.pool)
            .await
            .context("list_events failed")?;
        rows.iter().map(event_from_row).collect()
    }

    pub async fn count_events(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM irrigation_events")
            .fetch_one(&self.pool)
            .await
            .context("count_events failed")?;
        Ok(row.try_get("n")?)
    }

    // ----------------------------
    // Notifications
    // ----------------------------

    pub async fn insert_notification(
        &self,
        user_id: &str,
        kind: NotificationKind,
        title: &str,
        message: &str,
        data: &NotificationData,
        created_ts: i64,
    ) -> Result<Notification> {
        let data_json =
            serde_json::to_string(data).context("failed to serialize notification data")?;

        let res = sqlx::query(
            r#"
            INSERT INTO notifications (user_id, kind, title, message, data, read, created_ts)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(user_id)
        .bind(kind.as_str())
        .bind(title)
        .bind(message)
        .bind(&data_json)
        .bind(created_ts)
        .execute(&self.pool)
        .await
        .context("insert_notification failed")?;

        Ok(Notification {
            id: res.last_insert_rowid(),
            user_id: user_id.to_string(),
            kind,
            title: title.to_string(),
            message: message.to_string(),
            data: data.clone(),
            read: false,
            created_ts,
        })
    }

    pub async fn get_notification(&self, id: i64) -> Result<Option<Notification>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, kind, title, message, data, read, created_ts
            FROM notifications
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_notification failed")?;

        row.as_ref().map(notification_from_row).transpose()
    }

    pub async fn mark_notification_read(&self, id: i64) -> Result<u64> {
        let res = sqlx::query("UPDATE notifications SET read = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("mark_notification_read failed")?;
        Ok(res.rows_affected())
    }

    /// Like `mark_notification_read`, but only touches rows owned by
    /// `user_id`. Returns 0 when the id belongs to someone else.
    pub async fn mark_notification_read_owned(&self, id: i64, user_id: &str) -> Result<u64> {
        let res = sqlx::query("UPDATE notifications SET read = 1 WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("mark_notification_read_owned failed")?;
        Ok(res.rows_affected())
    }

    pub async fn mark_all_read(&self, user_id: &str) -> Result<u64> {
        let res = sqlx::query("UPDATE notifications SET read = 1 WHERE user_id = ? AND read = 0")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("mark_all_read failed")?;
        Ok(res.rows_affected())
    }

    pub async fn list_notifications(
        &self,
        user_id: &str,
        kind: Option<NotificationKind>,
        unread_only: bool,
        limit: i64,
    ) -> Result<Vec<Notification>> {
        let mut sql = String::from(
            "SELECT id, user_id, kind, title, message, data, read, created_ts \
             FROM notifications WHERE user_id = ?",
        );
        if kind.is_some() {
            sql.push_str(" AND kind = ?");
        }
        if unread_only {
            sql.push_str(" AND read = 0");
        }
        sql.push_str(" ORDER BY created_ts DESC, id DESC LIMIT ?");

        let mut q = sqlx::query(&sql).bind(user_id);
        if let Some(k) = kind {
            q = q.bind(k.as_str());
        }
        q = q.bind(limit);

        let rows = q
            .fetch_all(&self.pool)
            .await
            .context("list_notifications failed")?;
        rows.iter().map(notification_from_row).collect()
    }

    pub async fn delete_notification(&self, id: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM notifications WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete_notification failed")?;
        Ok(res.rows_affected())
    }

    pub async fn delete_notifications_before(&self, cutoff_ts: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM notifications WHERE created_ts < ?")
            .bind(cutoff_ts)
            .execute(&self.pool)
            .await
            .context("delete_notifications_before failed")?;
        Ok(res.rows_affected())
    }

    pub async fn count_notifications(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM notifications")
            .fetch_one(&self.pool)
            .await
            .context("count_notifications failed")?;
        Ok(row.try_get("n")?)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
