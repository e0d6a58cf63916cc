mod ingestor;


use crate::broadcast::{BroadcastHub, ReadingEvent};
use crate::metric::MetricSet;
use crate::pipeline::IngestStats;
use crate::source::{SampleSource, SourceError};
use crate::store::{DedupStore, Reading, StoreError, TimeSeriesStore};
use chrono::{DateTime, FixedOffset, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("unknown metric {0}")]
    UnknownMetric(String),
}

/// What [`Ingestor::accept`] did with one sample.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Persisted, recorded as the new watermark and published.
    Accepted(Reading),
    /// Not newer than the stored watermark; nothing was written or published.
    Duplicate {
        metric: String,
        value: f64,
        timestamp: DateTime<Utc>,
        last: DateTime<Utc>,
    },
}

/// Result of one polling cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Persisted, recorded as the new watermark and published.
    Accepted(Reading),
    /// Not newer than the stored watermark; nothing was written or published.
    Duplicate {
        metric: String,
        value: f64,
        timestamp: DateTime<Utc>,
        last: DateTime<Utc>,
    },
    /// The source had nothing for this metric yet.
    NoSample,
}

impl From<Admission> for IngestOutcome {
    fn from(admission: Admission) -> Self {
        match admission {
            Admission::Accepted(reading) => Self::Accepted(reading),
            Admission::Duplicate {
                metric,
                value,
                timestamp,
                last,
            } => Self::Duplicate {
                metric,
                value,
                timestamp,
                last,
            },
        }
    }
}

/// Applies the fetch, dedup, persist, watermark and publish sequence for one
/// metric at a time.
#[derive(Clone)]
pub struct Ingestor {
    source: Arc<dyn SampleSource>,
    dedup: Arc<dyn DedupStore>,
    series: Arc<dyn TimeSeriesStore>,
    hub: BroadcastHub<ReadingEvent>,
    metrics: MetricSet,
    stats: Arc<IngestStats>,
    lanes: Arc<HashMap<String, Arc<Mutex<()>>>>,
    local_offset: Option<FixedOffset>,
}
