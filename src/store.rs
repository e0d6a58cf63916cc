//! Persistence seams: the per-metric dedup watermark and the time series of
//! accepted readings. Both have an in-memory and a Postgres implementation.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("stored row could not be decoded: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => Self::Unavailable(err.to_string()),
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_) => Self::Corrupt(err.to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}

/// A persisted reading. `id` is assigned by the store and breaks timestamp ties.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub id: i64,
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_local: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub timestamp_local: Option<NaiveDateTime>,
}

impl NewReading {
    pub(crate) fn into_reading(self, id: i64) -> Reading {
        Reading {
            id,
            metric: self.metric,
            value: self.value,
            timestamp: self.timestamp,
            timestamp_local: self.timestamp_local,
        }
    }
}

/// Last accepted observation time for one metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestState {
    pub metric: String,
    pub last_timestamp: DateTime<Utc>,
}

/// Inclusive time range over one metric, newest first, at most `limit` rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeQuery {
    pub metric: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl RangeQuery {
    pub fn matches(&self, reading: &Reading) -> bool {
        reading.metric == self.metric
            && self.start.map_or(true, |start| reading.timestamp >= start)
            && self.end.map_or(true, |end| reading.timestamp <= end)
    }
}

#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn get(&self, metric: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn set(&self, metric: &str, timestamp: DateTime<Utc>) -> Result<(), StoreError>;

    /// Every stored watermark, ordered by metric.
    async fn states(&self) -> Result<Vec<IngestState>, StoreError>;
}

#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    async fn append(&self, reading: NewReading) -> Result<Reading, StoreError>;

    /// Readings matching `query`, ordered by `(timestamp, id)` descending.
    async fn range(&self, query: &RangeQuery) -> Result<Vec<Reading>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
