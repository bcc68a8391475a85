//! HTTP API endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use fluxstats_core::aggregate::StatAggregate;
use fluxstats_core::engine::ProcessorStatsSnapshot;
use fluxstats_core::rollup::RollUpBitMask;
use fluxstats_core::statistic::{StatisticConfiguration, StatisticRegistry};
use fluxstats_core::store::MemoryAggregateStore;
use fluxstats_core::transport::{BadEvent, MemoryBadEventSink};
use fluxstats_core::uid::UidDictionary;
use fluxstats_core::{
    AggregationPipeline, IngestReport, Interval, RunState, StatisticEvent, StatisticType,
    StatsError, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<AggregationPipeline>,
    pub registry: Arc<StatisticRegistry>,
    pub dictionary: Arc<UidDictionary>,
    pub store: Arc<MemoryAggregateStore>,
    pub bad_events: Arc<MemoryBadEventSink>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health))
        .route("/ping", get(ping))

        // Ingestion
        .route("/events", post(ingest))

        // Statistic definitions
        .route("/statistics", get(list_statistics).post(register_statistic))
        .route("/statistics/:name", get(get_statistic))
        .route("/statistics/:name/cells", get(cells))

        // Status
        .route("/processors", get(processors))
        .route("/stats", get(stats))
        .route("/bad-events", get(bad_events))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub processors: usize,
}

#[derive(Debug, Serialize)]
pub struct ProcessorStatus {
    pub id: String,
    pub statistic_type: StatisticType,
    pub interval: Interval,
    pub state: RunState,
    pub stats: ProcessorStatsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct StatisticResponse {
    pub name: String,
    pub description: String,
    pub statistic_type: StatisticType,
    pub precision: Interval,
    pub enabled: bool,
    pub tag_names: Vec<String>,
    pub fields: Vec<String>,
}

impl From<&StatisticConfiguration> for StatisticResponse {
    fn from(config: &StatisticConfiguration) -> Self {
        Self {
            name: config.name().to_string(),
            description: config.description().to_string(),
            statistic_type: config.statistic_type(),
            precision: config.precision(),
            enabled: config.is_enabled(),
            tag_names: config.tag_names().to_vec(),
            fields: config.all_field_names(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CellParams {
    /// Raw rollup mask bits, 0 for the fully specific cells
    #[serde(default)]
    mask: u16,
}

#[derive(Debug, Serialize)]
pub struct CellResponse {
    pub interval: Interval,
    pub time: Timestamp,
    pub tags: BTreeMap<String, String>,
    pub aggregate: StatAggregate,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub statistics: usize,
    pub cells: usize,
    pub merges: u64,
    pub dictionary_cache: usize,
    pub bad_events: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(e: StatsError) -> ApiError {
    let status = if e.is_data_error() || matches!(e, StatsError::Config(_)) {
        StatusCode::BAD_REQUEST
    } else if matches!(e, StatsError::Transport(_)) {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(ErrorResponse { error: e.to_string() }))
}

fn not_found(name: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("Unknown statistic: {}", name),
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let healthy = state.pipeline.is_healthy();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" }.to_string(),
            version: fluxstats_core::VERSION.to_string(),
            processors: state.pipeline.processors().count(),
        }),
    )
}

async fn ping() -> &'static str {
    "pong"
}

async fn ingest(
    State(state): State<AppState>,
    Json(events): Json<Vec<StatisticEvent>>,
) -> Result<(StatusCode, Json<IngestReport>), ApiError> {
    let report = state.pipeline.submit(events).await.map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(report)))
}

async fn list_statistics(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.registry.names())
}

async fn register_statistic(
    State(state): State<AppState>,
    Json(config): Json<StatisticConfiguration>,
) -> Result<(StatusCode, Json<StatisticResponse>), ApiError> {
    let registered = state.registry.register(config).map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(StatisticResponse::from(registered.as_ref()))))
}

async fn get_statistic(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<StatisticResponse>, ApiError> {
    let config = state.registry.get(&name).ok_or_else(|| not_found(&name))?;
    Ok(Json(StatisticResponse::from(config.as_ref())))
}

/// Stored cells of one statistic and mask, with identifiers resolved to names
async fn cells(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<CellParams>,
) -> Result<Json<Vec<CellResponse>>, ApiError> {
    if state.registry.get(&name).is_none() {
        return Err(not_found(&name));
    }
    // Registered but never written
    let Some(statistic) = state.dictionary.get(&name).await.map_err(api_error)? else {
        return Ok(Json(Vec::new()));
    };
    let mask = RollUpBitMask::from_bits(params.mask).map_err(api_error)?;
    let scanned = state.store.scan(statistic, mask).map_err(api_error)?;

    let mut cells = Vec::with_capacity(scanned.len());
    for (key, aggregate) in scanned {
        let mut tags = BTreeMap::new();
        for tag in key.tags() {
            let tag_name = state.dictionary.get_name(tag.tag).await.map_err(api_error)?;
            let value = state.dictionary.get_name(tag.value).await.map_err(api_error)?;
            tags.insert(tag_name, value);
        }
        cells.push(CellResponse {
            interval: key.interval(),
            time: key.column_time(),
            tags,
            aggregate,
        });
    }
    Ok(Json(cells))
}

async fn processors(State(state): State<AppState>) -> Json<Vec<ProcessorStatus>> {
    Json(
        state
            .pipeline
            .processors()
            .map(|p| ProcessorStatus {
                id: p.id().to_string(),
                statistic_type: p.statistic_type(),
                interval: p.interval(),
                state: p.state(),
                stats: p.stats(),
            })
            .collect(),
    )
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        statistics: state.registry.len(),
        cells: state.store.len(),
        merges: state.store.merge_count(),
        dictionary_cache: state.dictionary.cache_len(),
        bad_events: state.bad_events.len(),
    })
}

async fn bad_events(State(state): State<AppState>) -> Json<Vec<BadEvent>> {
    Json(state.bad_events.snapshot())
}
