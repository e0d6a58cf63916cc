use crate::ingest::{IngestError, IngestOutcome, Ingestor};
use crate::source::SourceError;
use crate::store::{Reading, StoreError};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
pub struct IngestStats {
    pub accepted: AtomicU64,
    pub duplicates: AtomicU64,
    pub empty_cycles: AtomicU64,
    pub source_failures: AtomicU64,
    pub store_failures: AtomicU64,
    pub last_accept_unix_ms: AtomicU64,
    pub last_error: Mutex<Option<String>>,
    latest: Mutex<BTreeMap<String, Reading>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub duplicates: u64,
    pub empty_cycles: u64,
    pub source_failures: u64,
    pub store_failures: u64,
    pub last_accept_unix_ms: Option<u64>,
    pub last_error: Option<String>,
    pub latest: BTreeMap<String, Reading>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self, reading: &Reading) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        self.last_accept_unix_ms.store(now_ms, Ordering::Relaxed);
        if let Ok(mut latest) = self.latest.lock() {
            latest.insert(reading.metric.clone(), reading.clone());
        }
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty(&self) {
        self.empty_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_source_failure(&self, metric: &str, err: &SourceError) {
        self.source_failures.fetch_add(1, Ordering::Relaxed);
        self.record_error(format!("{metric}: {err}"));
    }

    pub fn record_store_failure(&self, err: &StoreError) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
        self.record_error(err.to_string());
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let last_accept = self.last_accept_unix_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            empty_cycles: self.empty_cycles.load(Ordering::Relaxed),
            source_failures: self.source_failures.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            last_accept_unix_ms: (last_accept > 0).then_some(last_accept),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
            latest: self
                .latest
                .lock()
                .map(|latest| latest.clone())
                .unwrap_or_default(),
        }
    }
}

pub struct PipelineHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancels every metric task and waits for them to finish. A cycle that is
    /// already running completes first.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "pipeline task failed");
            }
        }
    }
}

/// Spawns one cycle loop per configured metric. The loops run until `cancel`
/// fires; errors in one metric's cycle are logged and never reach the others.
/// `interval` is raised to at least one millisecond.
pub fn spawn_pipeline(
    ingestor: Ingestor,
    interval: Duration,
    cancel: CancellationToken,
) -> PipelineHandle {
    let interval = interval.max(MIN_POLL_INTERVAL);
    let tasks = ingestor
        .metrics()
        .iter()
        .map(|metric| {
            let ingestor = ingestor.clone();
            let metric = metric.to_string();
            let cancel = cancel.clone();
            tokio::spawn(async move { run_metric(ingestor, metric, interval, cancel).await })
        })
        .collect();
    tracing::info!(
        metrics = ingestor.metrics().len(),
        interval_ms = interval.as_millis() as u64,
        "ingest pipeline started"
    );
    PipelineHandle { cancel, tasks }
}

async fn run_metric(
    ingestor: Ingestor,
    metric: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match ingestor.run_cycle(&metric).await {
            Ok(IngestOutcome::Accepted(reading)) => {
                tracing::info!(
                    metric = %reading.metric,
                    value = reading.value,
                    timestamp = %reading.timestamp,
                    "accepted reading"
                );
            }
            Ok(IngestOutcome::Duplicate {
                value, timestamp, ..
            }) => {
                tracing::debug!(metric = %metric, value, timestamp = %timestamp, "duplicate sample");
            }
            Ok(IngestOutcome::NoSample) => {
                tracing::trace!(metric = %metric, "no sample yet");
            }
            Err(IngestError::Source(err)) => {
                tracing::warn!(metric = %metric, error = %err, "fetch failed");
            }
            Err(err) => {
                tracing::warn!(metric = %metric, error = %err, "ingest cycle failed");
            }
        }
    }
    tracing::debug!(metric = %metric, "pipeline task stopped");
}
