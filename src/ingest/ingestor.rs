use super::{Admission, IngestError, IngestOutcome, Ingestor};
use crate::broadcast::{BroadcastHub, ReadingEvent};
use crate::metric::MetricSet;
use crate::pipeline::IngestStats;
use crate::source::{RawSample, SampleSource};
use crate::store::{DedupStore, IngestState, NewReading, StoreError, TimeSeriesStore};
use chrono::FixedOffset;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

impl Ingestor {
    pub fn new(
        source: Arc<dyn SampleSource>,
        dedup: Arc<dyn DedupStore>,
        series: Arc<dyn TimeSeriesStore>,
        hub: BroadcastHub<ReadingEvent>,
        metrics: MetricSet,
        stats: Arc<IngestStats>,
    ) -> Self {
        let lanes = metrics
            .iter()
            .map(|metric| (metric.to_string(), Arc::new(Mutex::new(()))))
            .collect::<HashMap<_, _>>();
        Self {
            source,
            dedup,
            series,
            hub,
            metrics,
            stats,
            lanes: Arc::new(lanes),
            local_offset: None,
        }
    }

    /// Also stamps each reading with its wall-clock time at `offset`.
    pub fn with_local_offset(mut self, offset: Option<FixedOffset>) -> Self {
        self.local_offset = offset;
        self
    }

    pub fn metrics(&self) -> &MetricSet {
        &self.metrics
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub fn hub(&self) -> &BroadcastHub<ReadingEvent> {
        &self.hub
    }

    pub async fn watermarks(&self) -> Result<Vec<IngestState>, StoreError> {
        self.dedup.states().await
    }

    /// One fetch/dedup/persist/publish cycle for `metric`.
    pub async fn run_cycle(&self, metric: &str) -> Result<IngestOutcome, IngestError> {
        let sample = match self.source.fetch_latest(metric).await {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                self.stats.record_empty();
                return Ok(IngestOutcome::NoSample);
            }
            Err(err) => {
                self.stats.record_source_failure(metric, &err);
                return Err(err.into());
            }
        };
        self.accept(sample).await.map(IngestOutcome::from)
    }

    /// Dedups `sample` against the stored watermark and, when newer, appends
    /// it, advances the watermark and publishes it, in that order.
    pub async fn accept(&self, sample: RawSample) -> Result<Admission, IngestError> {
        let Some(lane) = self.lanes.get(&sample.metric) else {
            return Err(IngestError::UnknownMetric(sample.metric));
        };
        let _guard = lane.lock().await;

        let result = self.accept_locked(sample).await;
        match &result {
            Ok(Admission::Accepted(reading)) => self.stats.record_accepted(reading),
            Ok(Admission::Duplicate { .. }) => self.stats.record_duplicate(),
            Err(IngestError::Store(err)) => self.stats.record_store_failure(err),
            Err(_) => {}
        }
        result
    }

    async fn accept_locked(&self, sample: RawSample) -> Result<Admission, IngestError> {
        let timestamp = sample.observed_at.to_utc();
        let last = self.dedup.get(&sample.metric).await?;

        if let Some(last) = last {
            if timestamp <= last {
                return Ok(Admission::Duplicate {
                    metric: sample.metric,
                    value: sample.value,
                    timestamp,
                    last,
                });
            }
        }

        let timestamp_local = self
            .local_offset
            .map(|offset| timestamp.with_timezone(&offset).naive_local());
        let reading = self
            .series
            .append(NewReading {
                metric: sample.metric,
                value: sample.value,
                timestamp,
                timestamp_local,
            })
            .await?;
        self.dedup.set(&reading.metric, reading.timestamp).await?;

        let delivered = self.hub.publish(&ReadingEvent::from(&reading));
        tracing::trace!(metric = %reading.metric, delivered, "published reading");

        Ok(Admission::Accepted(reading))
    }
}
