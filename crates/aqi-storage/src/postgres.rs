//! Postgres-backed snapshot table.

use std::future::Future;
use std::time::Duration;

use aqi_core::{Pollutants, StationReading, StoredStationRow, Weather};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::{debug, info};

use crate::{StationStore, StationTx, StoreError};

const SELECT_COLUMNS: &str = r#"
    SELECT row_id, station_id, name, source_url, aqi,
           pm25, pm10, no2, o3, co, so2,
           temperature, pressure, humidity, wind_speed,
           latitude, longitude, observed_at, source, attribution, region, last_update
      FROM station_readings
"#;

#[derive(Debug, Clone)]
pub struct PgPoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Upper bound on a single `COMMIT`.
    pub commit_timeout: Duration,
}

impl Default for PgPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
            commit_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgStationStore {
    pool: PgPool,
    commit_timeout: Duration,
}

#[derive(Debug, FromRow)]
struct StationRowRecord {
    row_id: i64,
    station_id: i64,
    name: Option<String>,
    source_url: Option<String>,
    aqi: Option<i32>,
    pm25: Option<f64>,
    pm10: Option<f64>,
    no2: Option<f64>,
    o3: Option<f64>,
    co: Option<f64>,
    so2: Option<f64>,
    temperature: Option<f64>,
    pressure: Option<f64>,
    humidity: Option<f64>,
    wind_speed: Option<f64>,
    latitude: f64,
    longitude: f64,
    observed_at: Option<String>,
    source: String,
    attribution: Option<Json<JsonValue>>,
    region: String,
    last_update: DateTime<Utc>,
}

impl From<StationRowRecord> for StoredStationRow {
    fn from(rec: StationRowRecord) -> Self {
        StoredStationRow {
            row_id: rec.row_id,
            last_update: rec.last_update,
            reading: StationReading {
                station_id: rec.station_id,
                name: rec.name,
                source_url: rec.source_url,
                aqi: rec.aqi,
                pollutants: Pollutants {
                    pm25: rec.pm25,
                    pm10: rec.pm10,
                    no2: rec.no2,
                    o3: rec.o3,
                    co: rec.co,
                    so2: rec.so2,
                },
                weather: Weather {
                    temperature: rec.temperature,
                    pressure: rec.pressure,
                    humidity: rec.humidity,
                    wind_speed: rec.wind_speed,
                },
                latitude: rec.latitude,
                longitude: rec.longitude,
                observed_at: rec.observed_at,
                source: rec.source,
                attribution: rec.attribution.map(|Json(value)| value),
                region: rec.region,
            },
        }
    }
}

/// Binds every reading column after the leading placeholder(s) already bound.
fn bind_reading<'q>(
    query: Query<'q, Postgres, PgArguments>,
    reading: &'q StationReading,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(reading.name.as_deref())
        .bind(reading.source_url.as_deref())
        .bind(reading.aqi)
        .bind(reading.pollutants.pm25)
        .bind(reading.pollutants.pm10)
        .bind(reading.pollutants.no2)
        .bind(reading.pollutants.o3)
        .bind(reading.pollutants.co)
        .bind(reading.pollutants.so2)
        .bind(reading.weather.temperature)
        .bind(reading.weather.pressure)
        .bind(reading.weather.humidity)
        .bind(reading.weather.wind_speed)
        .bind(reading.latitude)
        .bind(reading.longitude)
        .bind(reading.observed_at.as_deref())
        .bind(reading.source.as_str())
        .bind(reading.attribution.clone().map(Json))
        .bind(reading.region.as_str())
}

async fn within<T>(
    stage: &'static str,
    limit: Duration,
    fut: impl Future<Output = Result<T, sqlx::Error>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(StoreError::Timeout(stage, limit)),
    }
}

impl PgStationStore {
    pub async fn connect(database_url: &str, config: PgPoolConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool,
            commit_timeout: config.commit_timeout,
        })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            commit_timeout: PgPoolConfig::default().commit_timeout,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("station_readings migrations applied");
        Ok(())
    }
}

#[async_trait]
impl StationStore for PgStationStore {
    async fn begin(&self) -> Result<Box<dyn StationTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStationTx {
            tx: Some(tx),
            commit_timeout: self.commit_timeout,
        }))
    }

    async fn rows_for_stations(
        &self,
        station_ids: &[i64],
    ) -> Result<Vec<StoredStationRow>, StoreError> {
        if station_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("{SELECT_COLUMNS} WHERE station_id = ANY($1) ORDER BY station_id");
        let rows = sqlx::query_as::<_, StationRowRecord>(&sql)
            .bind(station_ids.to_vec())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn row_for_station(
        &self,
        station_id: i64,
    ) -> Result<Option<StoredStationRow>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE station_id = $1");
        let row = sqlx::query_as::<_, StationRowRecord>(&sql)
            .bind(station_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn latest_rows(&self, limit: Option<usize>) -> Result<Vec<StoredStationRow>, StoreError> {
        // LIMIT NULL is LIMIT ALL in Postgres.
        let sql = format!("{SELECT_COLUMNS} ORDER BY last_update DESC, station_id LIMIT $1");
        let rows = sqlx::query_as::<_, StationRowRecord>(&sql)
            .bind(limit.map(|l| l as i64))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn rows_for_region(&self, region: &str) -> Result<Vec<StoredStationRow>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE region = $1 ORDER BY station_id");
        let rows = sqlx::query_as::<_, StationRowRecord>(&sql)
            .bind(region)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn count_rows(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM station_readings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn last_refresh(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let newest: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(last_update) FROM station_readings")
                .fetch_one(&self.pool)
                .await?;
        Ok(newest)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM station_readings WHERE last_update < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

struct PgStationTx {
    tx: Option<Transaction<'static, Postgres>>,
    commit_timeout: Duration,
}

impl PgStationTx {
    fn open(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::TransactionClosed)
    }
}

#[async_trait]
impl StationTx for PgStationTx {
    async fn update_row(
        &mut self,
        row_id: i64,
        reading: &StationReading,
        last_update: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let tx = self.open()?;
        let query = sqlx::query(
            r#"
            UPDATE station_readings
               SET name = $3, source_url = $4, aqi = $5,
                   pm25 = $6, pm10 = $7, no2 = $8, o3 = $9, co = $10, so2 = $11,
                   temperature = $12, pressure = $13, humidity = $14, wind_speed = $15,
                   latitude = $16, longitude = $17, observed_at = $18, source = $19,
                   attribution = $20, region = $21, last_update = $2
             WHERE row_id = $1
            "#,
        )
        .bind(row_id)
        .bind(last_update);
        let result = bind_reading(query, reading).execute(&mut **tx).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RowNotFound(row_id));
        }
        debug!(row_id, station_id = reading.station_id, "row updated");
        Ok(())
    }

    async fn insert_row(
        &mut self,
        reading: &StationReading,
        last_update: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let tx = self.open()?;
        let query = sqlx::query(
            r#"
            INSERT INTO station_readings (
                station_id, last_update, name, source_url, aqi,
                pm25, pm10, no2, o3, co, so2,
                temperature, pressure, humidity, wind_speed,
                latitude, longitude, observed_at, source, attribution, region
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16, $17, $18, $19, $20, $21
            )
            ON CONFLICT (station_id) DO UPDATE
               SET last_update = EXCLUDED.last_update, name = EXCLUDED.name,
                   source_url = EXCLUDED.source_url, aqi = EXCLUDED.aqi,
                   pm25 = EXCLUDED.pm25, pm10 = EXCLUDED.pm10, no2 = EXCLUDED.no2,
                   o3 = EXCLUDED.o3, co = EXCLUDED.co, so2 = EXCLUDED.so2,
                   temperature = EXCLUDED.temperature, pressure = EXCLUDED.pressure,
                   humidity = EXCLUDED.humidity, wind_speed = EXCLUDED.wind_speed,
                   latitude = EXCLUDED.latitude, longitude = EXCLUDED.longitude,
                   observed_at = EXCLUDED.observed_at, source = EXCLUDED.source,
                   attribution = EXCLUDED.attribution, region = EXCLUDED.region
            RETURNING row_id
            "#,
        )
        .bind(reading.station_id)
        .bind(last_update);
        let row = bind_reading(query, reading).fetch_one(&mut **tx).await?;
        let row_id: i64 = sqlx::Row::try_get(&row, "row_id")?;
        debug!(row_id, station_id = reading.station_id, "row upserted");
        Ok(row_id)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
        // A timed-out commit drops the connection; Postgres rolls back if it never landed.
        within("commit", self.commit_timeout, tx.commit()).await
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
        tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stalled_commit_is_bounded() {
        let err = within(
            "commit",
            Duration::from_millis(20),
            std::future::pending::<Result<(), sqlx::Error>>(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::Timeout("commit", _)));
        assert!(err.to_string().starts_with("commit timed out"));
    }

    #[tokio::test]
    async fn finished_commit_passes_through() {
        within("commit", Duration::from_secs(1), async { Ok::<_, sqlx::Error>(()) })
            .await
            .unwrap();
        let err = within("commit", Duration::from_secs(1), async {
            Err::<(), _>(sqlx::Error::PoolTimedOut)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::Database(sqlx::Error::PoolTimedOut)));
    }
}
