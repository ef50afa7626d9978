//! Local sqlite store of confirmed device state.
//!
//! Every write is an INSERT; the current value of a concern is its newest
//! row. On startup the newest rows seed the engine so a hub restarted while
//! offline shows last-known-good data.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::model::{
    CropProfile, DataPoint, HistoricalData, RelayStates, SensorChannel, SensorReading, SystemStatus,
};
use crate::reconciler::Applied;

#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

/// Newest stored value of each concern. `None`/empty where nothing has been
/// recorded yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LastKnown {
    pub reading: Option<SensorReading>,
    pub relays: Option<RelayStates>,
    pub auto_mode: Option<bool>,
    pub status: Option<SystemStatus>,
    pub profiles: Vec<CropProfile>,
    pub history: HistoricalData,
    /// Timestamp of the newest row across all concerns.
    pub recorded_at: Option<OffsetDateTime>,
}

fn to_ms(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_ms(ms: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .with_context(|| format!("stored timestamp {ms} out of range"))
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct ReadingRow {
    air_temperature: f64,
    air_humidity: f64,
    water_temperature: f64,
    tds: f64,
    ph: f64,
    recorded_at: i64,
}

impl ReadingRow {
    fn into_reading(self) -> Result<SensorReading> {
        Ok(SensorReading {
            air_temperature: self.air_temperature,
            air_humidity: self.air_humidity,
            water_temperature: self.water_temperature,
            tds: self.tds,
            ph: self.ph,
            timestamp: from_ms(self.recorded_at)?,
        })
    }
}

#[derive(FromRow)]
struct RelayRow {
    tds_relay: bool,
    humidity_relay: bool,
    air_circulation_relay: bool,
    recorded_at: i64,
}

#[derive(FromRow)]
struct AutoModeRow {
    enabled: bool,
    recorded_at: i64,
}

#[derive(FromRow)]
struct StatusRow {
    status: String,
    recorded_at: i64,
}

#[derive(FromRow)]
struct ProfileRow {
    profile_id: String,
    name: String,
    min_air_temp: f64,
    max_air_temp: f64,
    min_air_humidity: f64,
    max_air_humidity: f64,
    min_water_temp: f64,
    max_water_temp: f64,
    min_tds: f64,
    max_tds: f64,
    min_ph: f64,
    max_ph: f64,
    is_active: bool,
    recorded_at: i64,
}

impl From<ProfileRow> for CropProfile {
    fn from(r: ProfileRow) -> Self {
        CropProfile {
            id: r.profile_id,
            name: r.name,
            min_air_temp: r.min_air_temp,
            max_air_temp: r.max_air_temp,
            min_air_humidity: r.min_air_humidity,
            max_air_humidity: r.max_air_humidity,
            min_water_temp: r.min_water_temp,
            max_water_temp: r.max_water_temp,
            min_tds: r.min_tds,
            max_tds: r.max_tds,
            min_ph: r.min_ph,
            max_ph: r.max_ph,
            is_active: r.is_active,
        }
    }
}

impl Store {
    /// db_url examples:
    /// - "sqlite:/var/lib/hydro/hub.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Each in-memory connection is its own database.
        let max = if db_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max)
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
    // Writes
    // ----------------------------

    pub async fn record(&self, device_id: &str, applied: &Applied) -> Result<()> {
        match applied {
            Applied::Reading(r) => self.insert_reading(device_id, r).await,
            Applied::Relays(relays, at) => self.insert_relays(device_id, relays, *at).await,
            Applied::AutoMode(enabled, at) => self.insert_auto_mode(device_id, *enabled, *at).await,
            Applied::Status(status, at) => self.insert_status(device_id, *status, *at).await,
            Applied::Profiles(list, at) => self.insert_profiles(device_id, list, *at).await,
        }
    }

    pub async fn insert_reading(&self, device_id: &str, r: &SensorReading) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensor_readings
              (device_id, air_temperature, air_humidity, water_temperature, tds, ph, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(device_id)
        .bind(r.air_temperature)
        .bind(r.air_humidity)
        .bind(r.water_temperature)
        .bind(r.tds)
        .bind(r.ph)
        .bind(to_ms(r.timestamp))
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;
        Ok(())
    }

    pub async fn insert_relays(&self, device_id: &str, relays: &RelayStates, at: OffsetDateTime) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO relay_states
              (device_id, tds_relay, humidity_relay, air_circulation_relay, recorded_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(device_id)
        .bind(relays.tds_relay)
        .bind(relays.humidity_relay)
        .bind(relays.air_circulation_relay)
        .bind(to_ms(at))
        .execute(&self.pool)
        .await
        .context("insert_relays failed")?;
        Ok(())
    }

    pub async fn insert_auto_mode(&self, device_id: &str, enabled: bool, at: OffsetDateTime) -> Result<()> {
        sqlx::query("INSERT INTO auto_mode_states (device_id, enabled, recorded_at) VALUES (?, ?, ?)")
            .bind(device_id)
            .bind(enabled)
            .bind(to_ms(at))
            .execute(&self.pool)
            .await
            .context("insert_auto_mode failed")?;
        Ok(())
    }

    pub async fn insert_status(&self, device_id: &str, status: SystemStatus, at: OffsetDateTime) -> Result<()> {
        let status = match status {
            SystemStatus::Online => "online",
            SystemStatus::Offline => "offline",
            SystemStatus::Warning => "warning",
            SystemStatus::Error => "error",
        };
        sqlx::query("INSERT INTO device_statuses (device_id, status, recorded_at) VALUES (?, ?, ?)")
            .bind(device_id)
            .bind(status)
            .bind(to_ms(at))
            .execute(&self.pool)
            .await
            .context("insert_status failed")?;
        Ok(())
    }

    /// Store the whole list as a new batch in one transaction.
    pub async fn insert_profiles(&self, device_id: &str, list: &[CropProfile], at: OffsetDateTime) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin profiles tx")?;

        let (batch,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(batch), 0) + 1 FROM crop_profiles WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_one(&mut *tx)
        .await
        .context("next profile batch failed")?;

        for (position, p) in list.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO crop_profiles (
                  device_id, batch, position, profile_id, name,
                  min_air_temp, max_air_temp, min_air_humidity, max_air_humidity,
                  min_water_temp, max_water_temp, min_tds, max_tds, min_ph, max_ph,
                  is_active, recorded_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(device_id)
            .bind(batch)
            .bind(position as i64)
            .bind(&p.id)
            .bind(&p.name)
            .bind(p.min_air_temp)
            .bind(p.max_air_temp)
            .bind(p.min_air_humidity)
            .bind(p.max_air_humidity)
            .bind(p.min_water_temp)
            .bind(p.max_water_temp)
            .bind(p.min_tds)
            .bind(p.max_tds)
            .bind(p.min_ph)
            .bind(p.max_ph)
            .bind(p.is_active)
            .bind(to_ms(at))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("insert profile '{}' failed", p.id))?;
        }

        tx.commit().await.context("commit profiles tx")?;
        Ok(())
    }

    // ----------------------------
    // Reads
    // ----------------------------

    /// Newest readings, oldest first.
    pub async fn recent_readings(&self, device_id: &str, limit: usize) -> Result<Vec<SensorReading>> {
        let rows: Vec<ReadingRow> = sqlx::query_as(
            r#"
            SELECT air_temperature, air_humidity, water_temperature, tds, ph, recorded_at
            FROM sensor_readings
            WHERE device_id = ?
            ORDER BY recorded_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(device_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("recent_readings failed")?;

        let mut readings = rows
            .into_iter()
            .map(ReadingRow::into_reading)
            .collect::<Result<Vec<_>>>()?;
        readings.reverse();
        Ok(readings)
    }

    pub async fn load_last_known(&self, device_id: &str, history_limit: usize) -> Result<LastKnown> {
        let readings = self.recent_readings(device_id, history_limit.max(1)).await?;

        let relays: Option<RelayRow> = sqlx::query_as(
            r#"
            SELECT tds_relay, humidity_relay, air_circulation_relay, recorded_at
            FROM relay_states WHERE device_id = ?
            ORDER BY recorded_at DESC, id DESC LIMIT 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("load relay_states failed")?;

        let auto_mode: Option<AutoModeRow> = sqlx::query_as(
            r#"
            SELECT enabled, recorded_at
            FROM auto_mode_states WHERE device_id = ?
            ORDER BY recorded_at DESC, id DESC LIMIT 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("load auto_mode_states failed")?;

        let status: Option<StatusRow> = sqlx::query_as(
            r#"
            SELECT status, recorded_at
            FROM device_statuses WHERE device_id = ?
            ORDER BY recorded_at DESC, id DESC LIMIT 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("load device_statuses failed")?;

        let profiles: Vec<ProfileRow> = sqlx::query_as(
            r#"
            SELECT profile_id, name,
                   min_air_temp, max_air_temp, min_air_humidity, max_air_humidity,
                   min_water_temp, max_water_temp, min_tds, max_tds, min_ph, max_ph,
                   is_active, recorded_at
            FROM crop_profiles
            WHERE device_id = ?
              AND batch = (SELECT MAX(batch) FROM crop_profiles WHERE device_id = ?)
            ORDER BY position
            "#,
        )
        .bind(device_id)
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .context("load crop_profiles failed")?;

        let mut last = LastKnown::default();
        let mut newest: Option<i64> = None;
        let mut seen = |ms: i64| newest = Some(newest.map_or(ms, |n| n.max(ms)));

        for r in &readings {
            for channel in SensorChannel::ALL {
                last.history.channel_mut(channel).push(DataPoint {
                    timestamp: r.timestamp,
                    value: r.value(channel),
                });
            }
        }
        if let Some(r) = readings.last() {
            seen(to_ms(r.timestamp));
            last.reading = Some(*r);
        }
        if let Some(r) = relays {
            seen(r.recorded_at);
            last.relays = Some(RelayStates {
                tds_relay: r.tds_relay,
                humidity_relay: r.humidity_relay,
                air_circulation_relay: r.air_circulation_relay,
            });
        }
        if let Some(r) = auto_mode {
            seen(r.recorded_at);
            last.auto_mode = Some(r.enabled);
        }
        if let Some(r) = status {
            seen(r.recorded_at);
            match r.status.parse::<SystemStatus>() {
                Ok(s) => last.status = Some(s),
                Err(e) => warn!(error = %e, "ignoring stored status"),
            }
        }
        if let Some(first) = profiles.first() {
            seen(first.recorded_at);
        }
        last.profiles = profiles.into_iter().map(CropProfile::from).collect();
        last.recorded_at = newest.map(from_ms).transpose()?;
        Ok(last)
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

/// Drain confirmed changes from the engine into the store. Write failures are
/// logged and skipped.
pub async fn run_writer(store: Store, device_id: String, mut rx: mpsc::Receiver<Applied>) {
    info!(device = %device_id, "store writer started");
    while let Some(applied) = rx.recv().await {
        if let Err(e) = store.record(&device_id, &applied).await {
            warn!(error = %format!("{e:#}"), "store write failed");
        }
    }
    info!("store writer stopped");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use time::macros::datetime;

    async fn store() -> Store {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn reading(tds: f64, at: OffsetDateTime) -> SensorReading {
        SensorReading {
            air_temperature: 23.5,
            air_humidity: 68.0,
            water_temperature: 21.3,
            tds,
            ph: 6.2,
            timestamp: at,
        }
    }

    fn profile(id: &str, active: bool) -> CropProfile {
        CropProfile {
            id: id.into(),
            name: format!("crop-{id}"),
            min_air_temp: 18.0,
            max_air_temp: 24.0,
            min_air_humidity: 60.0,
            max_air_humidity: 80.0,
            min_water_temp: 18.0,
            max_water_temp: 23.0,
            min_tds: 560.0,
            max_tds: 840.0,
            min_ph: 5.8,
            max_ph: 6.5,
            is_active: active,
        }
    }

    #[tokio::test]
    async fn empty_store_knows_nothing() {
        let s = store().await;
        let last = s.load_last_known("dev", 50).await.unwrap();
        assert_eq!(last, LastKnown::default());
    }

    #[tokio::test]
    async fn newest_row_wins_per_concern() {
        let s = store().await;
        let t0 = datetime!(2024-05-01 12:00 UTC);
        let t1 = datetime!(2024-05-01 12:01 UTC);

        s.insert_reading("dev", &reading(700.0, t0)).await.unwrap();
        s.insert_reading("dev", &reading(710.0, t1)).await.unwrap();
        s.insert_auto_mode("dev", true, t0).await.unwrap();
        s.insert_auto_mode("dev", false, t1).await.unwrap();
        s.insert_status("dev", SystemStatus::Warning, t1).await.unwrap();
        s.insert_relays("dev", &RelayStates::default(), t0).await.unwrap();

        let last = s.load_last_known("dev", 50).await.unwrap();
        assert_eq!(last.reading.unwrap().tds, 710.0);
        assert_eq!(last.auto_mode, Some(false));
        assert_eq!(last.status, Some(SystemStatus::Warning));
        assert_eq!(last.relays, Some(RelayStates::default()));
        assert_eq!(last.recorded_at, Some(t1));
    }

    #[tokio::test]
    async fn history_is_rebuilt_oldest_first_and_limited() {
        let s = store().await;
        let t0 = datetime!(2024-05-01 12:00 UTC);
        for i in 0..10 {
            s.insert_reading("dev", &reading(700.0 + i as f64, t0 + time::Duration::minutes(i)))
                .await
                .unwrap();
        }
        let last = s.load_last_known("dev", 4).await.unwrap();
        let tds: Vec<f64> = last.history.tds.iter().map(|p| p.value).collect();
        assert_eq!(tds, vec![706.0, 707.0, 708.0, 709.0]);
    }

    #[tokio::test]
    async fn latest_profile_batch_is_current() {
        let s = store().await;
        let t0 = datetime!(2024-05-01 12:00 UTC);
        s.insert_profiles("dev", &[profile("1", true), profile("2", false)], t0)
            .await
            .unwrap();
        s.insert_profiles("dev", &[profile("1", false), profile("2", true)], t0)
            .await
            .unwrap();

        let last = s.load_last_known("dev", 50).await.unwrap();
        assert_eq!(last.profiles.len(), 2);
        assert_eq!(last.profiles[0].id, "1");
        assert!(last.profiles[1].is_active);
        assert!(!last.profiles[0].is_active);
    }

    #[tokio::test]
    async fn devices_are_isolated() {
        let s = store().await;
        s.insert_auto_mode("other", true, datetime!(2024-05-01 12:00 UTC))
            .await
            .unwrap();
        assert_eq!(s.load_last_known("dev", 50).await.unwrap().auto_mode, None);
    }

    #[tokio::test]
    async fn writer_records_applied_changes() {
        let s = store().await;
        let (tx, rx) = mpsc::channel(8);
        let writer = tokio::spawn(run_writer(s.clone(), "dev".into(), rx));

        let at = datetime!(2024-05-01 12:00 UTC);
        tx.send(Applied::Reading(reading(733.0, at))).await.unwrap();
        tx.send(Applied::Profiles(Arc::new(vec![profile("3", true)]), at))
            .await
            .unwrap();
        drop(tx);
        writer.await.unwrap();

        let last = s.load_last_known("dev", 50).await.unwrap();
        assert_eq!(last.reading.unwrap().tds, 733.0);
        assert_eq!(last.profiles[0].id, "3");
    }
}
