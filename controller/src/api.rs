//! REST API for the auto-tester controller
//!
//! Each public endpoint maps onto one queue, store, or device operation.
//! All state-mutating calls return `204 No Content` on success; errors come
//! back as a JSON body with a consistent shape. Device failures inside a
//! running task never surface here — they are side-channeled through
//! `GET /log` and `GET /status/{param}`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use shared::api::{
    endpoints, CalibrationFactors, CalibrationRequest, ConfigResponse, LogEntry, StatusResponse,
};
use shared::config::{AnalyzerConfig, Parameter};
use shared::task::{Reading, Task, TaskKind, OPCODE_FACTOR_BASE, OPCODE_PUMP_FACTOR};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::activity::ActivityLog;
use crate::database::ControllerDatabase;
use crate::device::Device;
use crate::queue::{QueueError, TaskQueue};
use crate::reconfigure::ScheduleSupervisor;
use crate::recurrence::Rule;

/// Application state shared across all API handlers
#[derive(Clone)]
pub struct AppState {
    /// Store handle; also the queue lock
    pub database: Arc<Mutex<ControllerDatabase>>,
    /// The persistent task queue
    pub queue: TaskQueue,
    /// Typed device transactions over the shared bus
    pub device: Device,
    /// Operator-facing activity ring
    pub activity: ActivityLog,
    /// Recurrence schedule supervisor, reconciled on config writes
    pub supervisor: ScheduleSupervisor,
    /// Serializes config read-modify-write with the executor's accounting
    pub accounting: Arc<Mutex<()>>,
}

/// Creates the API router. Called once at startup.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Liveness probe for orchestrators and monitoring.
        .route(endpoints::HEALTH, get(health_check))
        .route(endpoints::CONFIG, get(get_config).put(put_config))
        .route(endpoints::RUN, post(run_test))
        .route(endpoints::CALIBRATE_PUMP_START, post(calibrate_pump_start))
        .route(endpoints::CALIBRATE_START, post(calibrate_start))
        .route(endpoints::CALIBRATE, post(calibrate_direct))
        .route(endpoints::STATUS, get(read_status))
        .route(endpoints::RESULTS, get(get_results))
        .route(endpoints::QUEUE, get(get_queue))
        .route(endpoints::QUEUE_ENTRY, delete(cancel_task))
        .route(endpoints::LOG, get(get_log))
        .route(endpoints::FILL, post(fill))
        .with_state(state)
}

/// Custom error types for the API.
///
/// `NotFound` deliberately renders as 400: clients of the original firmware
/// expect the legacy shape for cancelling a task that is not queued.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Store error: {0}")]
    Store(String),
    #[error("Device error: {0}")]
    Device(String),
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::DuplicateInProgress
            | QueueError::DuplicateQueued
            | QueueError::AlreadyRunning => ApiError::Conflict(e.to_string()),
            QueueError::NotFound => ApiError::NotFound(e.to_string()),
            QueueError::Store(e) => ApiError::Store(format!("{:#}", e)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "Conflict"),
            ApiError::NotFound(_) => (StatusCode::BAD_REQUEST, "Not Found"),
            ApiError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Store Error"),
            ApiError::Device(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Device Error"),
        };

        let body = Json(serde_json::json!({
            "error": error_message,
            "details": self.to_string()
        }));

        (status, body).into_response()
    }
}

fn parse_parameter(param: &str) -> Result<Parameter, ApiError> {
    param
        .parse()
        .map_err(|_| ApiError::InvalidInput(format!("unknown parameter: {}", param)))
}

fn store_error(e: anyhow::Error) -> ApiError {
    ApiError::Store(format!("{:#}", e))
}

fn device_error(e: crate::device::DeviceError) -> ApiError {
    ApiError::Device(e.to_string())
}

/// Decode a request body that was extracted as a raw JSON value, so that a
/// malformed payload maps onto the InvalidInput error shape.
fn decode_body<T: serde::de::DeserializeOwned>(body: serde_json::Value) -> Result<T, ApiError> {
    serde_json::from_value(body).map_err(|e| ApiError::InvalidInput(format!("malformed body: {}", e)))
}

async fn load_config(state: &AppState) -> Result<AnalyzerConfig, ApiError> {
    let mut database = state.database.lock().await;
    database.load_config().await.map_err(store_error)
}

/// Calibration and flush actions require a fully drained queue.
async fn ensure_idle(state: &AppState) -> Result<(), ApiError> {
    if state.queue.is_idle().await? {
        Ok(())
    } else {
        Err(ApiError::Conflict(
            "requires an empty queue and no running task".to_string(),
        ))
    }
}

/// The handler for the `/health` endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "autotester-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// `GET /config`: the persisted record merged with the calibration factors
/// read live from the device. A factor whose read fails renders as null.
async fn get_config(State(state): State<AppState>) -> Result<Json<ConfigResponse>, ApiError> {
    let config = load_config(&state).await?;
    let addr = config.i2c_addr;

    let mut factors = CalibrationFactors::default();
    factors.pump_calibration = match state.device.read_factor(addr, OPCODE_PUMP_FACTOR).await {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("Pump calibration factor read failed: {}", e);
            None
        }
    };
    for p in Parameter::ALL {
        let value = match state
            .device
            .read_factor(addr, OPCODE_FACTOR_BASE + p.index())
            .await
        {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(parameter = %p, "Calibration factor read failed: {}", e);
                None
            }
        };
        factors.set(p, value);
    }

    Ok(Json(ConfigResponse { config, factors }))
}

/// `PUT /config`: validate and replace the full record, then reconcile the
/// schedules against it.
async fn put_config(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Result<StatusCode, ApiError> {
    let config: AnalyzerConfig = decode_body(body)?;
    config
        .validate()
        .map_err(|e| ApiError::InvalidInput(e.to_string()))?;
    for p in Parameter::ALL {
        let rule = &config.parameter(p).schedule;
        if !rule.is_empty() {
            Rule::parse(rule, chrono::Utc::now())
                .map_err(|e| ApiError::InvalidInput(format!("{} schedule: {}", p, e)))?;
        }
    }

    {
        let _accounting = state.accounting.lock().await;
        let mut database = state.database.lock().await;
        database.store_config(&config).await.map_err(store_error)?;
    }
    state.supervisor.reconcile(&config).await;

    info!("Configuration replaced");
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /run/{param}`: enqueue a test, gated by the reagent/waste
/// admissibility check.
async fn run_test(
    State(state): State<AppState>,
    Path(param): Path<String>,
) -> Result<StatusCode, ApiError> {
    let p = parse_parameter(&param)?;

    let config = load_config(&state).await?;
    config
        .test_admissible(p)
        .map_err(|reason| ApiError::Conflict(format!("{} test not admissible: {}", p, reason)))?;

    state.queue.add(TaskKind::Test(p)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /calibrate/pump/start`: enqueue the pump calibration run.
async fn calibrate_pump_start(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    ensure_idle(&state).await?;
    state.queue.add(TaskKind::PumpCalibration).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /calibrate/{param}/start`: transmit the known value to the device
/// (one 5-byte write), then enqueue the poll task that reads the resulting
/// factor back.
async fn calibrate_start(
    State(state): State<AppState>,
    Path(param): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<StatusCode, ApiError> {
    let p = parse_parameter(&param)?;
    let request: CalibrationRequest = decode_body(body)?;
    ensure_idle(&state).await?;

    let config = load_config(&state).await?;
    let kind = TaskKind::Calibration(p);
    state
        .device
        .write_value(config.i2c_addr, kind.opcode(), request.value)
        .await
        .map_err(device_error)?;

    state.queue.add(kind).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /calibrate/{param}`: single-shot write-through of a value, with
/// the resulting factor read back for the log. No task is enqueued. This
/// is also how the measured pump volume is submitted (`param` = `pump`).
async fn calibrate_direct(
    State(state): State<AppState>,
    Path(param): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<StatusCode, ApiError> {
    let kind = if param == "pump" {
        TaskKind::PumpCalibration
    } else {
        TaskKind::Calibration(parse_parameter(&param)?)
    };
    let request: CalibrationRequest = decode_body(body)?;

    let config = load_config(&state).await?;
    let addr = config.i2c_addr;
    state
        .device
        .write_value(addr, kind.opcode(), request.value)
        .await
        .map_err(device_error)?;

    // Read the device's updated factor back so the operator can see it.
    if let Some(opcode) = kind.factor_opcode() {
        let factor = state
            .device
            .read_factor(addr, opcode)
            .await
            .map_err(device_error)?;
        state
            .activity
            .append(format!(
                "{}: calibration factor now {:.4}",
                kind.label(),
                factor
            ))
            .await;
    }

    Ok(StatusCode::NO_CONTENT)
}

/// `GET /status/{param}`: the live device status byte, plus the param of
/// the task currently executing (empty when idle).
async fn read_status(
    State(state): State<AppState>,
    Path(param): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    parse_parameter(&param)?;

    let config = load_config(&state).await?;
    let status = state
        .device
        .read_status(config.i2c_addr)
        .await
        .map_err(device_error)?;
    let current = state
        .queue
        .current_kind()
        .await
        .map(|kind| kind.to_string())
        .unwrap_or_default();

    Ok(Json(StatusResponse {
        status,
        param: current,
    }))
}

/// `GET /results/{param}`: full measurement history, oldest first.
async fn get_results(
    State(state): State<AppState>,
    Path(param): Path<String>,
) -> Result<Json<Vec<Reading>>, ApiError> {
    let p = parse_parameter(&param)?;
    let mut database = state.database.lock().await;
    let readings = database.readings_for(p).await.map_err(store_error)?;
    Ok(Json(readings))
}

/// `GET /queue`: all queued tasks in FIFO order.
async fn get_queue(State(state): State<AppState>) -> Result<Json<Vec<Task>>, ApiError> {
    let tasks = state.queue.list().await?;
    Ok(Json(tasks))
}

/// `DELETE /queue/{param}`: cancel a queued task. The running task cannot
/// be cancelled.
async fn cancel_task(
    State(state): State<AppState>,
    Path(param): Path<String>,
) -> Result<StatusCode, ApiError> {
    let kind: TaskKind = param
        .parse()
        .map_err(|_| ApiError::InvalidInput(format!("unknown task: {}", param)))?;
    state.queue.cancel(kind).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /log`: the recent activity lines, oldest first.
async fn get_log(State(state): State<AppState>) -> Json<Vec<LogEntry>> {
    Json(state.activity.recent().await)
}

/// `POST /fill/{param}`: enqueue a flush; a successful flush resets the
/// parameter's remaining reagent to a full bottle.
async fn fill(
    State(state): State<AppState>,
    Path(param): Path<String>,
) -> Result<StatusCode, ApiError> {
    let p = parse_parameter(&param)?;
    ensure_idle(&state).await?;
    state.queue.add(TaskKind::Flush(p)).await?;
    Ok(StatusCode::NO_CONTENT)
}
