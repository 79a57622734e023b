use crate::command::CommandPublisher;
use crate::connection::{ConnectionHandle, ConnectionStatus};
use crate::errors::Error;
use crate::model::{Device, HistoryResponse, ListResponse};
use crate::state::StateAggregator;
use crate::store::TelemetryStore;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TelemetryStore>,
    pub aggregator: StateAggregator,
    pub publisher: CommandPublisher,
    pub connection: ConnectionHandle,
}

#[derive(Debug, Deserialize)]
pub struct DataQuery {
    device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ServoRequest {
    device_id: Option<String>,
    angle: Option<Value>,
    command_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WaterRequest {
    device_id: Option<String>,
    state: Option<Value>,
    command_by: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ServoResponse {
    success: bool,
    device_id: String,
    angle: Value,
    command_by: String,
    published: bool,
}

#[derive(Debug, Serialize)]
pub struct WaterResponse {
    success: bool,
    device_id: String,
    state: Value,
    command_by: String,
    published: bool,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/devices", get(get_devices))
        .route("/api/data", get(get_data))
        .route("/api/history/:device_id", get(get_history))
        .route("/api/control/servo", post(post_servo))
        .route("/api/control/water", post(post_water))
        .route("/api/status", get(get_status))
        .with_state(state)
}

async fn get_devices(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<Device>>, ApiError> {
    let devices = state.store.list_devices().await?;
    Ok(Json(devices.into()))
}

async fn get_data(
    State(state): State<AppState>,
    Query(params): Query<DataQuery>,
) -> Result<Response, ApiError> {
    match params.device_id.filter(|id| !id.is_empty()) {
        Some(device_id) => match state.aggregator.latest(&device_id).await? {
            Some(record) => Ok(Json(record).into_response()),
            None => Err(ApiError::NotFound(format!(
                "no telemetry for device {}",
                device_id
            ))),
        },
        None => {
            let records = state.aggregator.latest_all().await?;
            Ok(Json(ListResponse::from(records)).into_response())
        }
    }
}

async fn get_history(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    let data = state
        .store
        .query_telemetry_history(&device_id, limit)
        .await?;

    Ok(Json(HistoryResponse {
        total: data.len(),
        data,
        limit,
    }))
}

async fn post_servo(
    State(state): State<AppState>,
    Json(body): Json<ServoRequest>,
) -> Result<Json<ServoResponse>, ApiError> {
    let (device_id, angle) = match (body.device_id, body.angle) {
        (Some(device_id), Some(angle)) if !device_id.is_empty() => (device_id, angle),
        _ => {
            return Err(ApiError::BadRequest(
                "device_id and angle are required".to_string(),
            ))
        }
    };

    let outcome = state
        .publisher
        .send_servo(&device_id, &angle, body.command_by.as_deref())
        .await?;

    Ok(Json(ServoResponse {
        success: true,
        device_id,
        angle: outcome.command.final_value,
        command_by: outcome.command.issued_by,
        published: outcome.published,
    }))
}

async fn post_water(
    State(state): State<AppState>,
    Json(body): Json<WaterRequest>,
) -> Result<Json<WaterResponse>, ApiError> {
    let (device_id, water_state) = match (body.device_id, body.state) {
        (Some(device_id), Some(water_state)) if !device_id.is_empty() => (device_id, water_state),
        _ => {
            return Err(ApiError::BadRequest(
                "device_id and state are required".to_string(),
            ))
        }
    };

    let outcome = state
        .publisher
        .send_water(&device_id, &water_state, body.command_by.as_deref())
        .await?;

    Ok(Json(WaterResponse {
        success: true,
        device_id,
        state: outcome.command.final_value,
        command_by: outcome.command.issued_by,
        published: outcome.published,
    }))
}

async fn get_status(State(state): State<AppState>) -> Json<ConnectionStatus> {
    Json(state.connection.get_status())
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Internal(e) => {
                error!("API error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(message) => ApiError::BadRequest(message),
            other => ApiError::Internal(anyhow::Error::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqttConfig;
    use crate::connection::{ConnectionEvent, ConnectionManager};
    use crate::model::TelemetryRecord;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};
    use tokio::sync::mpsc;

    fn app_state() -> (ConnectionManager, Arc<MemoryStore>, AppState) {
        let store = Arc::new(MemoryStore::new());
        let (tx, _rx) = mpsc::channel(1);
        let (manager, connection) = ConnectionManager::new(MqttConfig::default(), Vec::new(), tx);

        let state = AppState {
            store: store.clone(),
            aggregator: StateAggregator::new(store.clone()),
            publisher: CommandPublisher::new(connection.clone(), store.clone()),
            connection,
        };
        (manager, store, state)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn record(device_id: &str, minute: u32) -> TelemetryRecord {
        TelemetryRecord {
            id: None,
            device_id: device_id.to_string(),
            temperature: Some(21.5),
            humidity: Some(55.0),
            pressure: None,
            servo_state: 0,
            water_state: false,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_servo_command_reports_clamped_angle() {
        let (mut manager, _store, state) = app_state();
        manager.apply(ConnectionEvent::Start);
        manager.apply(ConnectionEvent::ConnAck);

        let body = ServoRequest {
            device_id: Some("dev1".to_string()),
            angle: Some(json!(200)),
            command_by: None,
        };
        let Json(response) = post_servo(State(state), Json(body)).await.unwrap();

        assert!(response.success);
        assert!(response.published);
        assert_eq!(response.angle, json!(180));
        assert_eq!(response.command_by, "system");
    }

    #[tokio::test]
    async fn test_water_command_while_disconnected_still_succeeds() {
        let (_manager, store, state) = app_state();

        let body = WaterRequest {
            device_id: Some("dev1".to_string()),
            state: Some(json!(1)),
            command_by: Some("ops".to_string()),
        };
        let Json(response) = post_water(State(state), Json(body)).await.unwrap();

        assert!(response.success);
        assert!(!response.published);
        assert_eq!(response.state, json!(true));
        assert_eq!(store.commands().await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_fields_are_client_errors() {
        let (_manager, store, state) = app_state();

        let body = ServoRequest {
            device_id: Some("dev1".to_string()),
            angle: None,
            command_by: None,
        };
        let err = post_servo(State(state.clone()), Json(body)).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let body = ServoRequest {
            device_id: Some("dev1".to_string()),
            angle: Some(json!("wide")),
            command_by: None,
        };
        let err = post_servo(State(state.clone()), Json(body)).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let body = WaterRequest {
            device_id: None,
            state: Some(json!(true)),
            command_by: None,
        };
        let err = post_water(State(state), Json(body)).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        assert!(store.commands().await.is_empty());
    }

    #[tokio::test]
    async fn test_latest_data_for_device() {
        let (_manager, store, state) = app_state();
        store.append_telemetry(record("dev1", 5)).await.unwrap();
        store.append_telemetry(record("dev1", 0)).await.unwrap();

        let response = get_data(
            State(state.clone()),
            Query(DataQuery {
                device_id: Some("dev1".to_string()),
            }),
        )
        .await
        .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["device_id"], "dev1");
        assert_eq!(body["timestamp"], "2024-05-01T10:05:00Z");

        let err = get_data(
            State(state),
            Query(DataQuery {
                device_id: Some("ghost".to_string()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_latest_data_for_all_devices() {
        let (_manager, store, state) = app_state();

        let response = get_data(State(state.clone()), Query(DataQuery { device_id: None }))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["total"], 0);

        store.append_telemetry(record("a", 1)).await.unwrap();
        store.append_telemetry(record("b", 2)).await.unwrap();
        store.append_telemetry(record("a", 3)).await.unwrap();

        let response = get_data(State(state), Query(DataQuery { device_id: None }))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["total"], 2);
    }

    #[tokio::test]
    async fn test_history_limit_is_clamped() {
        let (_manager, store, state) = app_state();
        for minute in 0..5 {
            store.append_telemetry(record("dev1", minute)).await.unwrap();
        }

        let Json(history) = get_history(
            State(state.clone()),
            Path("dev1".to_string()),
            Query(HistoryQuery { limit: Some(0) }),
        )
        .await
        .unwrap();
        assert_eq!(history.limit, 1);
        assert_eq!(history.data.len(), 1);

        let Json(history) = get_history(
            State(state),
            Path("dev1".to_string()),
            Query(HistoryQuery { limit: None }),
        )
        .await
        .unwrap();
        assert_eq!(history.limit, DEFAULT_HISTORY_LIMIT);
        assert_eq!(history.total, 5);
    }

    #[tokio::test]
    async fn test_status_reports_broker() {
        let (_manager, _store, state) = app_state();
        let Json(status) = get_status(State(state)).await;
        assert!(!status.connected);
        assert_eq!(status.broker, "localhost");
        assert_eq!(status.port, 1883);
    }

    #[test]
    fn test_storage_errors_map_to_server_error() {
        let err = ApiError::from(Error::Database(sqlx::Error::PoolClosed));
        assert_eq!(
            err.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
