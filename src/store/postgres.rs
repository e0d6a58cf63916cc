use super::{DedupStore, IngestState, NewReading, RangeQuery, Reading, StoreError, TimeSeriesStore};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Builds a lazily connecting pool so the relay can start (and report
    /// itself unhealthy) while the database is still down.
    pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(8))
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS readings (
                id bigserial primary key,
                metric text not null,
                value double precision not null,
                ts timestamptz not null,
                ts_local timestamp null,
                inserted_at timestamptz not null default now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS readings_metric_ts_idx ON readings (metric, ts DESC)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ingest_state (
                metric text primary key,
                last_timestamp timestamptz not null,
                updated_at timestamptz not null default now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn reading_from_row(row: &PgRow) -> Result<Reading, sqlx::Error> {
    Ok(Reading {
        id: row.try_get::<i64, _>("id")?,
        metric: row.try_get::<String, _>("metric")?,
        value: row.try_get::<f64, _>("value")?,
        timestamp: row.try_get::<DateTime<Utc>, _>("ts")?,
        timestamp_local: row.try_get::<Option<NaiveDateTime>, _>("ts_local")?,
    })
}

#[async_trait]
impl DedupStore for PgStore {
    async fn get(&self, metric: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query("SELECT last_timestamp FROM ingest_state WHERE metric = $1")
            .bind(metric)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|row| row.try_get::<DateTime<Utc>, _>("last_timestamp"))
            .transpose()?)
    }

    async fn set(&self, metric: &str, timestamp: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ingest_state (metric, last_timestamp, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (metric)
            DO UPDATE SET last_timestamp = EXCLUDED.last_timestamp, updated_at = now()
            "#,
        )
        .bind(metric)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn states(&self) -> Result<Vec<IngestState>, StoreError> {
        let rows = sqlx::query("SELECT metric, last_timestamp FROM ingest_state ORDER BY metric")
            .fetch_all(&self.pool)
            .await?;
        let mut states = Vec::with_capacity(rows.len());
        for row in rows {
            states.push(IngestState {
                metric: row.try_get::<String, _>("metric")?,
                last_timestamp: row.try_get::<DateTime<Utc>, _>("last_timestamp")?,
            });
        }
        Ok(states)
    }
}

#[async_trait]
impl TimeSeriesStore for PgStore {
    async fn append(&self, reading: NewReading) -> Result<Reading, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO readings (metric, value, ts, ts_local)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&reading.metric)
        .bind(reading.value)
        .bind(reading.timestamp)
        .bind(reading.timestamp_local)
        .fetch_one(&self.pool)
        .await?;
        let id = row.try_get::<i64, _>("id")?;
        Ok(reading.into_reading(id))
    }

    async fn range(&self, query: &RangeQuery) -> Result<Vec<Reading>, StoreError> {
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT id, metric, value, ts, ts_local
            FROM readings
            WHERE metric = $1
              AND ($2::timestamptz IS NULL OR ts >= $2)
              AND ($3::timestamptz IS NULL OR ts <= $3)
            ORDER BY ts DESC, id DESC
            LIMIT $4
            "#,
        )
        .bind(&query.metric)
        .bind(query.start)
        .bind(query.end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(reading_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastHub;
    use crate::ingest::{IngestOutcome, Ingestor};
    use crate::metric::MetricSet;
    use crate::pipeline::IngestStats;
    use crate::source::serial::SerialFeed;
    use crate::source::RawSample;
    use anyhow::Result;
    use chrono::TimeZone;
    use std::env;
    use std::sync::Arc;

    async fn setup_test_pool(database_url: &str, schema: &str) -> Result<PgPool> {
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
            .execute(&admin_pool)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA {schema}"))
            .execute(&admin_pool)
            .await?;
        drop(admin_pool);

        let schema_name = schema.to_string();
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .after_connect(move |conn, _meta| {
                let schema = schema_name.clone();
                Box::pin(async move {
                    sqlx::query(&format!("SET search_path TO {schema}"))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;
        Ok(pool)
    }

    #[tokio::test]
    async fn test_pg_store_round_trip() -> Result<()> {
        if env::var("RELAY_INTEGRATION_TEST").ok().as_deref() != Some("1") {
            return Ok(());
        }
        let database_url = match env::var("RELAY_TEST_DATABASE_URL") {
            Ok(value) => value,
            Err(_) => return Ok(()),
        };

        let schema = format!("relay_test_{}", std::process::id());
        let store = PgStore::from_pool(setup_test_pool(&database_url, &schema).await?);
        store.ensure_schema().await?;
        store.ping().await?;

        let at = |secs| Utc.timestamp_opt(secs, 0).single().expect("ts");
        assert_eq!(store.get("rt").await?, None);
        store.set("rt", at(10)).await?;
        store.set("rt", at(20)).await?;
        assert_eq!(store.get("rt").await?, Some(at(20)));
        assert_eq!(store.states().await?.len(), 1);

        for (value, secs) in [(1.0, 10), (2.0, 20), (3.0, 30)] {
            store
                .append(NewReading {
                    metric: "rt".to_string(),
                    value,
                    timestamp: at(secs),
                    timestamp_local: None,
                })
                .await?;
        }

        let rows = store
            .range(&RangeQuery {
                metric: "rt".to_string(),
                start: Some(at(15)),
                end: None,
                limit: 10,
            })
            .await?;
        let values: Vec<f64> = rows.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![3.0, 2.0]);

        // A serial frame is stamped with a nanosecond receive time; re-polling
        // it must dedup against the microsecond watermark read back from Postgres.
        let feed = SerialFeed::new();
        let ingestor = Ingestor::new(
            Arc::new(feed.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            BroadcastHub::new(4),
            MetricSet::new(["temp"]),
            Arc::new(IngestStats::new()),
        );
        let received = Utc
            .timestamp_opt(1_700_000_000, 855_294_295)
            .single()
            .expect("ts");
        feed.record(RawSample::new("temp", 26.3, received));

        assert!(matches!(
            ingestor.run_cycle("temp").await?,
            IngestOutcome::Accepted(_)
        ));
        for _ in 0..2 {
            assert!(matches!(
                ingestor.run_cycle("temp").await?,
                IngestOutcome::Duplicate { .. }
            ));
        }
        let rows = store
            .range(&RangeQuery {
                metric: "temp".to_string(),
                start: None,
                end: None,
                limit: 10,
            })
            .await?;
        assert_eq!(rows.len(), 1);

        store.close().await;
        Ok(())
    }
}
