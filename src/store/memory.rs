use super::{DedupStore, IngestState, NewReading, RangeQuery, Reading, StoreError, TimeSeriesStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    readings: HashMap<String, Vec<Reading>>,
    state: HashMap<String, DateTime<Utc>>,
}

/// Process-local store backing both seams. Used with `RELAY_DATABASE_URL=memory`
/// and in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".to_string())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, metric: &str) -> usize {
        self.inner
            .read()
            .map(|inner| inner.readings.get(metric).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

#[async_trait]
impl DedupStore for MemoryStore {
    async fn get(&self, metric: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.state.get(metric).copied())
    }

    async fn set(&self, metric: &str, timestamp: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        inner.state.insert(metric.to_string(), timestamp);
        Ok(())
    }

    async fn states(&self) -> Result<Vec<IngestState>, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let mut states: Vec<IngestState> = inner
            .state
            .iter()
            .map(|(metric, last)| IngestState {
                metric: metric.clone(),
                last_timestamp: *last,
            })
            .collect();
        states.sort_by(|a, b| a.metric.cmp(&b.metric));
        Ok(states)
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn append(&self, reading: NewReading) -> Result<Reading, StoreError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        inner.next_id += 1;
        let reading = reading.into_reading(inner.next_id);
        inner
            .readings
            .entry(reading.metric.clone())
            .or_default()
            .push(reading.clone());
        Ok(reading)
    }

    async fn range(&self, query: &RangeQuery) -> Result<Vec<Reading>, StoreError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let mut rows: Vec<Reading> = inner
            .readings
            .get(&query.metric)
            .into_iter()
            .flatten()
            .filter(|reading| query.matches(reading))
            .cloned()
            .collect();
        rows.sort_by_key(|reading| Reverse((reading.timestamp, reading.id)));
        rows.truncate(query.limit);
        Ok(rows)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.read().map(|_| ()).map_err(|_| poisoned())
    }
}
