use crate::metric::MetricSet;
use crate::store::{RangeQuery, Reading, StoreError, TimeSeriesStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_HISTORY_LIMIT: usize = 100;
pub const DEFAULT_MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("unknown metric {0}")]
    UnknownMetric(String),

    #[error("start {start} is after end {end}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("limit must be at least 1")]
    InvalidLimit,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Read side over the time series store: validates the request, then asks the
/// store for the newest `limit` readings inside the inclusive range.
#[derive(Clone)]
pub struct HistoryQueryEngine {
    store: Arc<dyn TimeSeriesStore>,
    metrics: MetricSet,
    max_limit: usize,
}

impl HistoryQueryEngine {
    pub fn new(store: Arc<dyn TimeSeriesStore>, metrics: MetricSet) -> Self {
        Self {
            store,
            metrics,
            max_limit: DEFAULT_MAX_HISTORY_LIMIT,
        }
    }

    pub fn with_max_limit(mut self, max_limit: usize) -> Self {
        self.max_limit = max_limit.max(1);
        self
    }

    pub async fn query(
        &self,
        metric: &str,
        query: HistoryQuery,
    ) -> Result<Vec<Reading>, HistoryError> {
        if !self.metrics.contains(metric) {
            return Err(HistoryError::UnknownMetric(metric.to_string()));
        }
        if let (Some(start), Some(end)) = (query.start, query.end) {
            if start > end {
                return Err(HistoryError::InvalidRange { start, end });
            }
        }
        let limit = match query.limit {
            Some(0) => return Err(HistoryError::InvalidLimit),
            Some(limit) => limit.min(self.max_limit),
            None => DEFAULT_HISTORY_LIMIT.min(self.max_limit),
        };

        let rows = self
            .store
            .range(&RangeQuery {
                metric: metric.to_string(),
                start: query.start,
                end: query.end,
                limit,
            })
            .await?;
        tracing::debug!(metric, rows = rows.len(), limit, "history query");
        Ok(rows)
    }
}
