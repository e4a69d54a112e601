//! HTTP surface for the ReliefMesh pipeline.
//!
//! Exposes the intake boundary (`POST /requests`), point reads for the
//! three collections, and an SSE stream of state-store changes for the
//! Status Observer. Durable backends are selected from config and injected
//! into the runtime bootstrap here, keeping the runtime crate
//! broker-agnostic.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_stream::stream;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use reliefmesh_config::{load_config, BackendSpec};
use reliefmesh_core::bus::Topic;
use reliefmesh_core::store::{Collection, StateStore};
use reliefmesh_core::types::{ImageryRefs, RequestId};
use reliefmesh_runtime::{
    IntakeError, IntakeRequest, IntakeRouter, PipelineComponents, RuntimeApp,
};
use reliefmesh_stores_backends::{RedisStateStore, RedisTriggerBus};

#[derive(Clone)]
struct AppState {
    intake: Arc<IntakeRouter>,
    store: Arc<dyn StateStore>,
}

#[derive(Debug, Deserialize)]
struct SubmitRequestBody {
    region_name: String,
    event_name: String,
    #[serde(default)]
    imagery: ImageryBody,
}

#[derive(Debug, Default, Deserialize)]
struct ImageryBody {
    #[serde(default)]
    pre_event: Vec<String>,
    #[serde(default)]
    post_event: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    request_id: RequestId,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Build the store/bus pair the config selects; anything other than the
/// in-memory backends must be constructed here.
async fn build_components(config_path: &std::path::Path) -> anyhow::Result<PipelineComponents> {
    let config = load_config(config_path).context("load config for component selection")?;
    let mut components = PipelineComponents::default();

    if let Some(store) = build_redis_state_store(&config.stores.state)? {
        components = components.with_store(store);
    }
    if let Some(bus) = build_redis_trigger_bus(&config.bus.trigger)? {
        // Triggers stranded by a crashed consumer go back on the queue
        // before any consumer starts.
        for topic in Topic::ALL {
            if let Err(e) = bus.recover_pending(topic).await {
                tracing::warn!(topic = %topic, error = %e, "pending trigger recovery failed");
            }
        }
        components = components.with_bus(bus);
    }
    Ok(components)
}

fn build_redis_state_store(
    spec: &BackendSpec,
) -> anyhow::Result<Option<Arc<dyn StateStore>>> {
    match spec.backend.trim().to_ascii_lowercase().as_str() {
        "in_memory" | "memory" => Ok(None),
        "redis" => {
            let url = require_setting("stores.state", spec.connection_url.as_deref())?;
            let prefix = spec
                .key_prefix
                .clone()
                .unwrap_or_else(|| "reliefmesh:state".to_string());
            let store =
                RedisStateStore::new(url, prefix).context("build redis state store")?;
            Ok(Some(Arc::new(store)))
        }
        backend => anyhow::bail!("unsupported state store backend '{}'", backend),
    }
}

fn build_redis_trigger_bus(spec: &BackendSpec) -> anyhow::Result<Option<Arc<RedisTriggerBus>>> {
    match spec.backend.trim().to_ascii_lowercase().as_str() {
        "in_memory" | "memory" => Ok(None),
        "redis" => {
            let url = require_setting("bus.trigger", spec.connection_url.as_deref())?;
            let prefix = spec
                .key_prefix
                .clone()
                .unwrap_or_else(|| "reliefmesh:bus".to_string());
            let bus = RedisTriggerBus::new(url, prefix).context("build redis trigger bus")?;
            Ok(Some(Arc::new(bus)))
        }
        backend => anyhow::bail!("unsupported trigger bus backend '{}'", backend),
    }
}

fn require_setting<'a>(section: &str, value: Option<&'a str>) -> anyhow::Result<&'a str> {
    value
        .filter(|v| !v.trim().is_empty())
        .with_context(|| format!("{}.connection_url is required for backend redis", section))
}

pub async fn run_server(config: PathBuf, listen: SocketAddr) -> anyhow::Result<()> {
    let components = build_components(&config).await?;

    let app = RuntimeApp::from_config_path_with_components(config, components)
        .await
        .context("build pipeline runtime")?;

    let _workers = app.spawn_workers();

    let state = AppState {
        intake: app.intake.clone(),
        store: app.store.clone(),
    };

    let router = Router::new()
        .route("/health", get(health))
        .route("/requests", post(submit_request))
        .route("/requests/{id}", get(get_request))
        .route("/requests/{id}/report", get(get_report))
        .route("/requests/{id}/plan", get(get_plan))
        .route("/events", get(stream_changes))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .context("bind server listener failed")?;
    tracing::info!(listen = %listen, "reliefmesh-server listening");
    axum::serve(listener, router)
        .await
        .context("server terminated with error")
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status":"ok"}))
}

async fn submit_request(
    State(state): State<AppState>,
    Json(payload): Json<SubmitRequestBody>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let intake = IntakeRequest {
        region_name: payload.region_name,
        event_name: payload.event_name,
        imagery: ImageryRefs::new(payload.imagery.pre_event, payload.imagery.post_event),
    };
    let request_id = state
        .intake
        .submit(intake)
        .await
        .map_err(map_intake_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            request_id,
            status: "accepted",
        }),
    ))
}

async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorBody>)> {
    read_record(&state, Collection::Requests, id).await
}

async fn get_report(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorBody>)> {
    read_record(&state, Collection::DamageReports, id).await
}

async fn get_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorBody>)> {
    read_record(&state, Collection::LogisticsPlans, id).await
}

async fn read_record(
    state: &AppState,
    collection: Collection,
    id: String,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ErrorBody>)> {
    let request_id = RequestId::from(id);
    match state.store.read(collection, &request_id).await {
        Ok(Some(doc)) => Ok(Json(doc)),
        Ok(None) => Err(error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("{}/{}", collection, request_id),
        )),
        Err(e) => Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            e.to_string(),
        )),
    }
}

async fn stream_changes(
    State(state): State<AppState>,
) -> Sse<impl futures_util::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let mut rx = state.store.subscribe();

    let change_stream = stream! {
        loop {
            match rx.recv().await {
                Ok(change) => {
                    let payload = serde_json::to_string(&change)
                        .unwrap_or_else(|_| "{}".to_string());
                    yield Ok(SseEvent::default().event("record_change").data(payload));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "sse subscriber lagged behind; dropping old changes");
                    continue;
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(change_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(10))
            .text("keepalive"),
    )
}

fn map_intake_error(err: IntakeError) -> (StatusCode, Json<ErrorBody>) {
    let (status, code) = match &err {
        IntakeError::Validation(_) => (StatusCode::BAD_REQUEST, "invalid_argument"),
        IntakeError::Aoi(_) => (StatusCode::BAD_GATEWAY, "aoi_unavailable"),
        IntakeError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    error_response(status, code, err.to_string())
}

fn error_response(
    status: StatusCode,
    code: &str,
    message: String,
) -> (StatusCode, Json<ErrorBody>) {
    (
        status,
        Json(ErrorBody {
            code: code.to_string(),
            message,
        }),
    )
}
