// src/main.rs
mod accrual;
mod approval;
mod clock;
mod directory;
mod engine;
mod entry_store;
mod ledger;
mod model;
mod month_end;
mod notifier;
mod reconciler;
mod sweeper;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::clock::EngineClock;
use crate::directory::FileUserDirectory;
use crate::engine::{EngineError, ToilEngine};
use crate::entry_store::LedgerEntryStore;
use crate::ledger::LedgerStore;
use crate::model::{
    ActionType, MonthYear, SurplusAction, ToggleResponse, ToilProcessingRecord, ToilRecord,
    ToilSummary, ToilThresholds,
};
use crate::sweeper::{run_reconciliation_sweep, DEFAULT_SWEEP_INTERVAL_SECS};

// --- Configuration ---

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // Server Configuration
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    // Engine Configuration
    #[serde(default = "default_data_dir")]
    pub toil_data_dir: String,
    pub users_file: Option<String>,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    // Rollover threshold overrides (hours)
    pub full_time_threshold: Option<f64>,
    pub part_time_threshold: Option<f64>,
    pub casual_threshold: Option<f64>,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    3000
}

fn default_data_dir() -> String {
    "toil_data".to_string()
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

impl Config {
    pub fn from_env() -> Result<Self, envy::Error> {
        // Load .env file if it exists
        dotenv::dotenv().ok();
        envy::from_env::<Config>()
    }

    pub fn thresholds(&self) -> ToilThresholds {
        let defaults = ToilThresholds::default();
        ToilThresholds {
            full_time: self.full_time_threshold.unwrap_or(defaults.full_time),
            part_time: self.part_time_threshold.unwrap_or(defaults.part_time),
            casual: self.casual_threshold.unwrap_or(defaults.casual),
        }
    }
}

// --- HTTP Error Mapping ---

#[derive(Error, Debug)]
enum AppError {
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        error!("Request failed: {}", self);

        let AppError::Engine(engine_error) = self;
        let (status_code, message) = match &engine_error {
            EngineError::AlreadyProcessed { .. } => {
                (StatusCode::CONFLICT, engine_error.to_string())
            }
            EngineError::NotProcessable { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, engine_error.to_string())
            }
            EngineError::InvalidTransition => (StatusCode::CONFLICT, engine_error.to_string()),
            EngineError::SelfApproval | EngineError::NotAuthorized => {
                (StatusCode::FORBIDDEN, engine_error.to_string())
            }
            EngineError::Validation(_) => (StatusCode::BAD_REQUEST, engine_error.to_string()),
            EngineError::EntryCreationFailed { .. } | EngineError::EntryRemovalFailed { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, engine_error.to_string())
            }
            EngineError::Storage(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Storage failure; please try again".to_string(),
            ),
        };
        (status_code, Json(json!({ "error": message }))).into_response()
    }
}

// --- Application State ---

#[derive(Clone)]
struct AppState {
    engine: Arc<ToilEngine>,
    started_at: Instant,
}

// --- Request / Response Shapes ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryQuery {
    user_id: String,
    month: MonthYear,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueQuery {
    acting_user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToggleRequest {
    user_id: String,
    date: NaiveDate,
    action: ActionType,
    active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccrueRequest {
    user_id: String,
    date: NaiveDate,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccrueResponse {
    record: Option<ToilRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MonthEndRequest {
    user_id: String,
    month: MonthYear,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecisionRequest {
    record_id: String,
    approver_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DecisionResponse {
    success: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SurplusActionRequest {
    record_id: String,
    acting_user_id: String,
    action: SurplusAction,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CleanupRequest {
    user_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CleanupResponse {
    removed: usize,
}

// --- Handlers ---

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "ledgerRecords": state.engine.record_count(),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}

async fn get_toil_summary(
    State(state): State<AppState>,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<ToilSummary>, AppError> {
    let summary = state
        .engine
        .toil_summary(&query.user_id, query.month)
        .await?;
    Ok(Json(summary))
}

async fn get_toil_records(
    State(state): State<AppState>,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<Vec<ToilRecord>>, AppError> {
    let records = state
        .engine
        .toil_records(&query.user_id, query.month)
        .await?;
    Ok(Json(records))
}

async fn get_processing_history(
    State(state): State<AppState>,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<Vec<ToilProcessingRecord>>, AppError> {
    let history = state
        .engine
        .processing_history(&query.user_id, query.month)?;
    Ok(Json(history))
}

async fn get_approval_queue(
    State(state): State<AppState>,
    Query(query): Query<QueueQuery>,
) -> Result<Json<Vec<ToilProcessingRecord>>, AppError> {
    let queue = state.engine.pending_approvals(&query.acting_user_id).await?;
    Ok(Json(queue))
}

async fn toggle_action(
    State(state): State<AppState>,
    Json(request): Json<ToggleRequest>,
) -> Result<Json<ToggleResponse>, AppError> {
    let response = state
        .engine
        .toggle_action(&request.user_id, request.date, request.action, request.active)
        .await?;
    Ok(Json(response))
}

async fn accrue_day(
    State(state): State<AppState>,
    Json(request): Json<AccrueRequest>,
) -> Result<Json<AccrueResponse>, AppError> {
    let record = state.engine.accrue_day(&request.user_id, request.date).await?;
    Ok(Json(AccrueResponse { record }))
}

async fn submit_month_end(
    State(state): State<AppState>,
    Json(request): Json<MonthEndRequest>,
) -> Result<Json<ToilProcessingRecord>, AppError> {
    let record = state
        .engine
        .submit_month_end(&request.user_id, request.month)
        .await?;
    Ok(Json(record))
}

async fn approve_toil(
    State(state): State<AppState>,
    Json(request): Json<DecisionRequest>,
) -> Result<Json<DecisionResponse>, AppError> {
    let success = state
        .engine
        .approve_toil(&request.record_id, &request.approver_id)
        .await?;
    Ok(Json(DecisionResponse { success }))
}

async fn reject_toil(
    State(state): State<AppState>,
    Json(request): Json<DecisionRequest>,
) -> Result<Json<DecisionResponse>, AppError> {
    let success = state
        .engine
        .reject_toil(&request.record_id, &request.approver_id)
        .await?;
    Ok(Json(DecisionResponse { success }))
}

async fn set_surplus_action(
    State(state): State<AppState>,
    Json(request): Json<SurplusActionRequest>,
) -> Result<Json<ToilProcessingRecord>, AppError> {
    let record = state
        .engine
        .set_surplus_action(&request.record_id, &request.acting_user_id, request.action)
        .await?;
    Ok(Json(record))
}

async fn cleanup_duplicates(
    State(state): State<AppState>,
    Json(request): Json<CleanupRequest>,
) -> Result<Json<CleanupResponse>, AppError> {
    let removed = state
        .engine
        .cleanup_duplicate_synthetic_entries(&request.user_id)
        .await?;
    Ok(Json(CleanupResponse { removed }))
}

// --- Entrypoint ---

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting TOIL engine");

    let ledger = Arc::new(LedgerStore::open(&config.toil_data_dir)?);
    let entries = Arc::new(LedgerEntryStore::new(ledger.clone()));
    let directory = Arc::new(match &config.users_file {
        Some(path) => FileUserDirectory::load(path)?,
        None => {
            warn!("USERS_FILE not set; starting with an empty user directory");
            FileUserDirectory::empty()
        }
    });

    let engine = Arc::new(ToilEngine::new(
        ledger,
        entries,
        directory,
        config.thresholds(),
        EngineClock::system(),
    ));

    // Background duplicate-entry sweep
    tokio::spawn(run_reconciliation_sweep(
        engine.clone(),
        Duration::from_secs(config.sweep_interval_secs),
    ));

    let state = AppState {
        engine,
        started_at: Instant::now(),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/api/toil/summary", get(get_toil_summary))
        .route("/api/toil/records", get(get_toil_records))
        .route("/api/toil/history", get(get_processing_history))
        .route("/api/toil/queue", get(get_approval_queue))
        .route("/api/toil/toggle", post(toggle_action))
        .route("/api/toil/accrue", post(accrue_day))
        .route("/api/toil/month-end", post(submit_month_end))
        .route("/api/toil/approve", post(approve_toil))
        .route("/api/toil/reject", post(reject_toil))
        .route("/api/toil/surplus-action", post(set_surplus_action))
        .route("/api/toil/cleanup", post(cleanup_duplicates))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
