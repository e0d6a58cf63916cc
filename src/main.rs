use anyhow::{Context, Result};
use sensor_relay::broadcast::{BroadcastHub, ReadingEvent};
use sensor_relay::config::{Config, SourceConfig, StoreDriver};
use sensor_relay::history::HistoryQueryEngine;
use sensor_relay::http::{router, HttpState};
use sensor_relay::ingest::Ingestor;
use sensor_relay::pipeline::{spawn_pipeline, IngestStats};
use sensor_relay::source::cloud::CloudFeedSource;
use sensor_relay::source::serial::SerialFeed;
use sensor_relay::source::simulated::SimulatedSource;
use sensor_relay::source::{CommandSink, SampleSource};
use sensor_relay::store::memory::MemoryStore;
use sensor_relay::store::postgres::PgStore;
use sensor_relay::store::{DedupStore, TimeSeriesStore};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sensor_relay=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(normalize_otlp_http_endpoint(endpoint));
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "sensor-relay"),
            ])))
            .install_batch(Tokio)?;

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "failed to bind sensor-relay listener on {addr}: port already in use (set RELAY_HTTP_BIND to another address)"
            );
        }
        Err(err) => Err(err).with_context(|| format!("failed to bind sensor-relay listener on {addr}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let (dedup, series, pg) = match &config.store {
        StoreDriver::Memory => {
            tracing::warn!("using in-memory store; readings are lost on exit");
            let store = MemoryStore::new();
            (
                Arc::new(store.clone()) as Arc<dyn DedupStore>,
                Arc::new(store) as Arc<dyn TimeSeriesStore>,
                None,
            )
        }
        StoreDriver::Postgres(url) => {
            let store = PgStore::connect_lazy(url, config.db_pool_size)?;
            if let Err(err) = store.ensure_schema().await {
                tracing::warn!(error = %err, "failed to prepare schema; database unreachable at startup");
            }
            (
                Arc::new(store.clone()) as Arc<dyn DedupStore>,
                Arc::new(store.clone()) as Arc<dyn TimeSeriesStore>,
                Some(store),
            )
        }
    };

    let cancel = CancellationToken::new();
    let mut serial_task = None;
    let mut commands: Option<Arc<dyn CommandSink>> = None;
    let source: Arc<dyn SampleSource> = match &config.source {
        SourceConfig::Cloud(settings) => {
            tracing::info!(base_url = %settings.base_url, "polling cloud feeds");
            Arc::new(CloudFeedSource::new(settings.clone())?)
        }
        SourceConfig::Serial(settings) => {
            let feed = SerialFeed::new();
            serial_task = Some(feed.spawn_device_reader(settings.clone(), cancel.child_token()));
            commands = Some(Arc::new(feed.clone()) as Arc<dyn CommandSink>);
            Arc::new(feed)
        }
        SourceConfig::Simulated { seed } => {
            tracing::warn!(seed = ?seed, "using simulated sensor values");
            Arc::new(SimulatedSource::new(*seed))
        }
    };

    let hub: BroadcastHub<ReadingEvent> = BroadcastHub::new(config.subscriber_queue);
    let ingestor = Ingestor::new(
        source,
        dedup,
        series.clone(),
        hub,
        config.metrics.clone(),
        Arc::new(IngestStats::new()),
    )
    .with_local_offset(config.local_offset());
    let history = HistoryQueryEngine::new(series.clone(), config.metrics.clone())
        .with_max_limit(config.history_max_limit);

    let pipeline = spawn_pipeline(ingestor.clone(), config.poll_interval(), cancel.child_token());

    let mut state = HttpState::new(ingestor, history, series);
    if let Some(commands) = commands {
        state = state.with_commands(commands);
    }
    let app = router(state);
    let listener = bind_listener(&config.http_bind).await?;
    tracing::info!(addr = %config.http_bind, "http listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown signal received");
        })
        .await?;

    cancel.cancel();
    pipeline.shutdown().await;
    if let Some(task) = serial_task {
        if let Err(err) = task.await {
            tracing::warn!(error = %err, "serial reader task failed");
        }
    }
    if let Some(store) = pg {
        store.close().await;
    }
    opentelemetry::global::shutdown_tracer_provider();

    Ok(())
}
