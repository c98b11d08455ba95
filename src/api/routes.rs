use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::auth::{TokenVerifier, WorkflowProvider};
use crate::db::models::{
    ExecutionStatus, LogEntry, NodeExecutionRecord, NodeStatus, WorkflowExecutionRecord,
};
use crate::db::{ExecutionFilter, ExecutionStore, Page};
use crate::error::EngineError;
use crate::eventbus::EventBus;
use crate::service::{ExecutionInput, ExecutionService};

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<ExecutionService>,
    pub store: Arc<dyn ExecutionStore>,
    pub bus: Arc<EventBus>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub provider: Arc<dyn WorkflowProvider>,
}

/// Error envelope returned by every endpoint.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "missing or invalid credentials")
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match &err {
            EngineError::InvalidGraph(_) | EngineError::CycleDetected { .. } => {
                Self::new(StatusCode::BAD_REQUEST, err.to_string())
            }
            EngineError::IllegalTransition { .. } | EngineError::RetryExhausted { .. } => {
                Self::new(StatusCode::CONFLICT, err.to_string())
            }
            // Missing and foreign-owned records answer the same way.
            EngineError::NotFound => Self::new(StatusCode::NOT_FOUND, "not found"),
            _ => {
                log::error!("internal error: {err}");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct CreateExecutionRequest {
    pub input_data: Option<Value>,
    pub context: Option<Value>,
    pub priority: Option<u8>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ListExecutionsQuery {
    pub workflow_id: Option<Uuid>,
    pub status: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ExecutionResponse {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: Uuid,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub input_data: Value,
    pub output_data: Value,
    pub context: Value,
    pub total_nodes: u32,
    pub completed_nodes: u32,
    pub failed_nodes: u32,
    pub progress_percentage: f64,
    pub error_message: Option<String>,
    pub error_details: Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: u8,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub broker_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<WorkflowExecutionRecord> for ExecutionResponse {
    fn from(record: WorkflowExecutionRecord) -> Self {
        let progress_percentage = record.progress_percentage();
        Self {
            id: record.id,
            workflow_id: record.workflow_id,
            user_id: record.user_id,
            status: record.status,
            started_at: record.started_at,
            completed_at: record.completed_at,
            duration_seconds: record.duration_seconds,
            input_data: record.input_data,
            output_data: record.output_data,
            context: record.context,
            total_nodes: record.total_nodes,
            completed_nodes: record.completed_nodes,
            failed_nodes: record.failed_nodes,
            progress_percentage,
            error_message: record.error_message,
            error_details: record.error_details,
            retry_count: record.retry_count,
            max_retries: record.max_retries,
            priority: record.priority,
            scheduled_at: record.scheduled_at,
            broker_task_id: record.broker_task_id,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NodeResponse {
    pub id: Uuid,
    pub workflow_execution_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub node_id: String,
    pub node_name: String,
    pub node_type: String,
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub input_data: Value,
    pub output_data: Value,
    pub agent_response: Option<String>,
    pub tokens_used: Option<u32>,
    pub model_used: Option<String>,
    pub tools_called: Vec<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub execution_order: u32,
    pub parent_node_ids: Vec<String>,
    pub child_node_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<NodeExecutionRecord> for NodeResponse {
    fn from(record: NodeExecutionRecord) -> Self {
        Self {
            id: record.id,
            workflow_execution_id: record.workflow_execution_id,
            agent_id: record.agent_id,
            node_id: record.node_id,
            node_name: record.node_name,
            node_type: record.node_type.as_str().to_string(),
            status: record.status,
            started_at: record.started_at,
            completed_at: record.completed_at,
            duration_seconds: record.duration_seconds,
            input_data: record.input_data,
            output_data: record.output_data,
            agent_response: record.agent_response,
            tokens_used: record.tokens_used,
            model_used: record.model_used,
            tools_called: record.tools_called,
            error_message: record.error_message,
            retry_count: record.retry_count,
            max_retries: record.max_retries,
            execution_order: record.execution_order,
            parent_node_ids: record.parent_node_ids,
            child_node_ids: record.child_node_ids,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExecutionDetailResponse {
    #[serde(flatten)]
    pub execution: ExecutionResponse,
    pub nodes: Vec<NodeResponse>,
}

#[derive(Debug, Serialize)]
pub struct ListExecutionsResponse {
    pub items: Vec<ExecutionResponse>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

/// Resolve the bearer token from the `Authorization` header.
pub async fn authenticate(state: &ApiState, headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(ApiError::unauthorized)?;

    state
        .verifier
        .verify(token)
        .await
        .ok_or_else(ApiError::unauthorized)
}

// Route handlers

/// GET /health
async fn health() -> Json<Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /workflows/:workflow_id/executions
async fn create_execution(
    State(state): State<ApiState>,
    Path(workflow_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<CreateExecutionRequest>,
) -> Result<(StatusCode, Json<ExecutionResponse>), ApiError> {
    let user_id = authenticate(&state, &headers).await?;
    let spec = state.provider.get(workflow_id, user_id).await?;

    let record = state
        .service
        .create_execution(
            workflow_id,
            user_id,
            &spec,
            ExecutionInput {
                input_data: request.input_data,
                context: request.context,
                priority: request.priority,
                scheduled_at: request.scheduled_at,
                max_retries: request.max_retries,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(record.into())))
}

/// GET /executions?workflow_id=&status=&limit=&offset=
async fn list_executions(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<Json<ListExecutionsResponse>, ApiError> {
    let user_id = authenticate(&state, &headers).await?;

    let status = match &query.status {
        Some(raw) => Some(
            ExecutionStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown status: {raw}")))?,
        ),
        None => None,
    };

    let filter = ExecutionFilter {
        workflow_id: query.workflow_id,
        status,
    };
    let page = Page {
        limit: query.limit.unwrap_or(100).min(500),
        offset: query.offset.unwrap_or(0),
    };

    let (items, total) = state.service.list_executions(user_id, &filter, page).await?;
    Ok(Json(ListExecutionsResponse {
        items: items.into_iter().map(ExecutionResponse::from).collect(),
        total,
        limit: page.limit,
        offset: page.offset,
    }))
}

/// GET /executions/:id, returning the parent record with its nodes.
async fn get_execution(
    State(state): State<ApiState>,
    Path(execution_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ExecutionDetailResponse>, ApiError> {
    let user_id = authenticate(&state, &headers).await?;
    let record = state.service.get_execution(execution_id, user_id).await?;
    let nodes = state.service.list_nodes(execution_id, user_id).await?;
    Ok(Json(ExecutionDetailResponse {
        execution: record.into(),
        nodes: nodes.into_iter().map(NodeResponse::from).collect(),
    }))
}

/// POST /executions/:id/cancel
async fn cancel_execution(
    State(state): State<ApiState>,
    Path(execution_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let user_id = authenticate(&state, &headers).await?;
    state.service.cancel_execution(execution_id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /executions/:id/retry
async fn retry_execution(
    State(state): State<ApiState>,
    Path(execution_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let user_id = authenticate(&state, &headers).await?;
    state.service.retry_execution(execution_id, user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /executions/:id/nodes
async fn list_nodes(
    State(state): State<ApiState>,
    Path(execution_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Vec<NodeResponse>>, ApiError> {
    let user_id = authenticate(&state, &headers).await?;
    let nodes = state.service.list_nodes(execution_id, user_id).await?;
    Ok(Json(nodes.into_iter().map(NodeResponse::from).collect()))
}

/// GET /executions/:id/nodes/:node_execution_id
async fn get_node(
    State(state): State<ApiState>,
    Path((execution_id, node_execution_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
) -> Result<Json<NodeResponse>, ApiError> {
    let user_id = authenticate(&state, &headers).await?;
    let node = state.service.get_node(node_execution_id, user_id).await?;
    if node.workflow_execution_id != execution_id {
        return Err(EngineError::NotFound.into());
    }
    Ok(Json(node.into()))
}

/// GET /executions/:id/logs
async fn get_logs(
    State(state): State<ApiState>,
    Path(execution_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Vec<LogEntry>>, ApiError> {
    let user_id = authenticate(&state, &headers).await?;
    let log = state.service.get_logs(execution_id, user_id).await?;
    Ok(Json(log))
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/workflows/:workflow_id/executions", post(create_execution))
        .route("/executions", get(list_executions))
        .route("/executions/:id", get(get_execution))
        .route("/executions/:id/cancel", post(cancel_execution))
        .route("/executions/:id/retry", post(retry_execution))
        .route("/executions/:id/nodes", get(list_nodes))
        .route("/executions/:id/nodes/:node_execution_id", get(get_node))
        .route("/executions/:id/logs", get(get_logs))
        .route("/ws", get(super::ws::ws_handler))
        .with_state(state)
}
