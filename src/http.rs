use crate::broadcast::{ReadingEvent, Subscriber};
use crate::error::{AppError, AppResult};
use crate::history::{HistoryQuery, HistoryQueryEngine};
use crate::ingest::{Admission, Ingestor};
use crate::pipeline::StatsSnapshot;
use crate::source::{CommandSink, ObservedAt, RawSample};
use crate::store::{IngestState, Reading, TimeSeriesStore};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpState {
    ingestor: Ingestor,
    history: HistoryQueryEngine,
    series: Arc<dyn TimeSeriesStore>,
    commands: Option<Arc<dyn CommandSink>>,
}

impl HttpState {
    pub fn new(
        ingestor: Ingestor,
        history: HistoryQueryEngine,
        series: Arc<dyn TimeSeriesStore>,
    ) -> Self {
        Self {
            ingestor,
            history,
            series,
            commands: None,
        }
    }

    /// Enables `POST /control` by routing commands to `commands`.
    pub fn with_commands(mut self, commands: Arc<dyn CommandSink>) -> Self {
        self.commands = Some(commands);
        self
    }
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/system/health", get(system_health))
        .route("/status", get(status))
        .route("/history/{metric}", get(history))
        .route("/ingest", post(ingest))
        .route("/control", post(control))
        .route("/ws/metrics", get(ws_metrics))
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn system_health(State(state): State<HttpState>) -> Response {
    match state.series.ping().await {
        Ok(()) => Json(json!({ "status": "ok", "store": "connected" })).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "error",
                    "store": "disconnected",
                    "reason": err.to_string(),
                })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    metrics: Vec<String>,
    subscribers: usize,
    watermarks: Vec<IngestState>,
    #[serde(flatten)]
    ingest: StatsSnapshot,
}

async fn status(State(state): State<HttpState>) -> AppResult<Json<StatusResponse>> {
    let watermarks = state.ingestor.watermarks().await?;
    Ok(Json(StatusResponse {
        metrics: state
            .ingestor
            .metrics()
            .iter()
            .map(str::to_string)
            .collect(),
        subscribers: state.ingestor.hub().subscriber_count(),
        watermarks,
        ingest: state.ingestor.stats().snapshot(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct HistoryParams {
    start: Option<String>,
    end: Option<String>,
    limit: Option<String>,
}

fn parse_time_param(name: &str, raw: Option<&str>) -> AppResult<Option<DateTime<Utc>>> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(None);
    };
    ObservedAt::parse(raw)
        .map(|at| Some(at.to_utc()))
        .map_err(|_| AppError::bad_request(format!("Invalid {name} timestamp: {raw}")))
}

impl HistoryParams {
    fn into_query(self) -> AppResult<HistoryQuery> {
        let limit = match self.limit.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                raw.parse::<usize>()
                    .map_err(|_| AppError::bad_request(format!("Invalid limit: {raw}")))?,
            ),
        };
        Ok(HistoryQuery {
            start: parse_time_param("start", self.start.as_deref())?,
            end: parse_time_param("end", self.end.as_deref())?,
            limit,
        })
    }
}

async fn history(
    State(state): State<HttpState>,
    Path(metric): Path<String>,
    Query(params): Query<HistoryParams>,
) -> AppResult<Json<Vec<Reading>>> {
    let query = params.into_query()?;
    let rows = state.history.query(&metric, query).await?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    metric: String,
    value: f64,
    timestamp: Option<String>,
}

async fn ingest(
    State(state): State<HttpState>,
    Json(request): Json<IngestRequest>,
) -> AppResult<Json<serde_json::Value>> {
    if !request.value.is_finite() {
        return Err(AppError::bad_request("value must be a finite number"));
    }
    let observed_at = match request.timestamp.as_deref() {
        Some(raw) => ObservedAt::parse(raw)
            .map_err(|_| AppError::bad_request(format!("Invalid timestamp: {raw}")))?,
        None => ObservedAt::from(Utc::now()),
    };

    let outcome = state
        .ingestor
        .accept(RawSample::new(request.metric, request.value, observed_at))
        .await?;
    let body = match outcome {
        Admission::Accepted(reading) => {
            tracing::info!(metric = %reading.metric, value = reading.value, "accepted manual reading");
            json!({ "status": "accepted", "reading": reading })
        }
        Admission::Duplicate { last, .. } => {
            json!({ "status": "duplicate", "last_timestamp": last })
        }
    };
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
struct ControlRequest {
    command: String,
}

async fn control(
    State(state): State<HttpState>,
    Json(request): Json<ControlRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let Some(commands) = &state.commands else {
        return Err(AppError::unavailable("No actuator link configured"));
    };
    commands.send_command(&request.command)?;
    let sent = request.command.trim();
    tracing::info!(command = %sent, "actuator command queued");
    Ok(Json(json!({ "sent": sent })))
}

async fn ws_metrics(ws: WebSocketUpgrade, State(state): State<HttpState>) -> Response {
    let hub = state.ingestor.hub().clone();
    ws.on_upgrade(move |socket| pump_subscriber(socket, hub.subscribe()))
}

/// Forwards hub events to one websocket client until either side goes away.
async fn pump_subscriber(socket: WebSocket, mut subscriber: Subscriber<ReadingEvent>) {
    let id = subscriber.id();
    tracing::debug!(subscriber = %id, "websocket client connected");
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = subscriber.recv() => {
                let Some(event) = event else {
                    tracing::debug!(subscriber = %id, "dropped by hub");
                    break;
                };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to encode reading event");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    tracing::debug!(subscriber = %id, "websocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastHub;
    use crate::metric::MetricSet;
    use crate::pipeline::IngestStats;
    use crate::source::serial::SerialFeed;
    use crate::source::CommandError;
    use crate::store::memory::MemoryStore;
    use crate::store::{NewReading, RangeQuery, StoreError};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct DownStore;

    #[async_trait]
    impl TimeSeriesStore for DownStore {
        async fn append(&self, _reading: NewReading) -> Result<Reading, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn range(&self, _query: &RangeQuery) -> Result<Vec<Reading>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    fn app_with(series: Arc<dyn TimeSeriesStore>) -> Router {
        let metrics = MetricSet::new(["rt", "rh"]);
        let ingestor = Ingestor::new(
            Arc::new(SerialFeed::new()),
            Arc::new(MemoryStore::new()),
            series.clone(),
            BroadcastHub::new(8),
            metrics.clone(),
            Arc::new(IngestStats::new()),
        );
        let history = HistoryQueryEngine::new(series.clone(), metrics);
        router(HttpState::new(ingestor, history, series))
    }

    fn app() -> Router {
        app_with(Arc::new(MemoryStore::new()))
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: std::sync::Mutex<Vec<String>>,
        offline: bool,
    }

    impl CommandSink for RecordingSink {
        fn send_command(&self, command: &str) -> Result<(), CommandError> {
            if self.offline {
                return Err(CommandError::NotConnected);
            }
            let command = crate::source::serial::validate_command(command)?;
            self.sent.lock().unwrap().push(command.to_string());
            Ok(())
        }
    }

    fn app_with_commands(sink: Arc<RecordingSink>) -> Router {
        let store = Arc::new(MemoryStore::new());
        let metrics = MetricSet::new(["pir"]);
        let ingestor = Ingestor::new(
            Arc::new(SerialFeed::new()),
            store.clone(),
            store.clone(),
            BroadcastHub::new(8),
            metrics.clone(),
            Arc::new(IngestStats::new()),
        );
        let history = HistoryQueryEngine::new(store.clone(), metrics);
        router(HttpState::new(ingestor, history, store).with_commands(sink))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_ingest(body: serde_json::Value) -> Request<Body> {
        post_json("/ingest", body)
    }

    #[tokio::test]
    async fn system_health_reports_store_state() {
        let (status, body) = send(&app(), get_req("/system/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"], "connected");

        let (status, body) = send(&app_with(Arc::new(DownStore)), get_req("/system/health")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "error");
        assert_eq!(body["store"], "disconnected");
    }

    #[tokio::test]
    async fn history_rejects_unknown_metric_and_bad_params() {
        let app = app();
        let (status, body) = send(&app, get_req("/history/lux")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["detail"], "Unknown metric: lux");

        let (status, _) = send(
            &app,
            get_req("/history/rt?start=2025-03-02T00:00:00Z&end=2025-03-01T00:00:00Z"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, get_req("/history/rt?limit=0")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, get_req("/history/rt?start=soon")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn manual_ingest_feeds_history_and_status() {
        let app = app();
        for (value, ts) in [(24.0, "2025-03-01T10:00:00Z"), (25.0, "2025-03-01T10:00:05Z")] {
            let (status, body) = send(
                &app,
                post_ingest(json!({ "metric": "rt", "value": value, "timestamp": ts })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "accepted");
        }

        let (_, body) = send(
            &app,
            post_ingest(json!({ "metric": "rt", "value": 23.0, "timestamp": "2025-03-01T10:00:01Z" })),
        )
        .await;
        assert_eq!(body["status"], "duplicate");

        let (status, body) = send(&app, get_req("/history/rt?limit=5")).await;
        assert_eq!(status, StatusCode::OK);
        let values: Vec<f64> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row["value"].as_f64().unwrap())
            .collect();
        assert_eq!(values, vec![25.0, 24.0]);

        let (_, body) = send(&app, get_req("/status")).await;
        assert_eq!(body["accepted"], 2);
        assert_eq!(body["duplicates"], 1);
        assert_eq!(body["latest"]["rt"]["value"], 25.0);
        assert_eq!(body["watermarks"][0]["last_timestamp"], "2025-03-01T10:00:05Z");
    }

    #[tokio::test]
    async fn manual_ingest_rejects_unknown_metric() {
        let (status, _) = send(&app(), post_ingest(json!({ "metric": "pir", "value": 1 }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn control_forwards_commands_to_the_link() {
        let sink = Arc::new(RecordingSink::default());
        let app = app_with_commands(sink.clone());

        let (status, body) = send(&app, post_json("/control", json!({ "command": " 1 " }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sent"], "1");
        assert_eq!(*sink.sent.lock().unwrap(), vec!["1".to_string()]);

        let (status, _) = send(&app, post_json("/control", json!({ "command": "on#" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn control_without_a_live_link_is_unavailable() {
        let (status, body) = send(&app(), post_json("/control", json!({ "command": "1" }))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["detail"], "No actuator link configured");

        let offline = Arc::new(RecordingSink {
            offline: true,
            ..RecordingSink::default()
        });
        let (status, _) = send(
            &app_with_commands(offline),
            post_json("/control", json!({ "command": "1" })),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
