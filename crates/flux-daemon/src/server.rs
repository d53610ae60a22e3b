use std::{collections::BTreeSet, env, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use utoipa::{IntoParams, OpenApi, ToSchema};
use uuid::Uuid;

use flux_rpc::annotations::parse_annotations;
use flux_rpc::executor::{
    CallerIdentity, EngineConfig, ExecuteResult, ExecutionContext, ProcedureExecutor,
};
use flux_rpc::loader::{load_procedures, DEFAULT_NAMESPACE};
use flux_rpc::metrics::RpcMetrics;
use flux_rpc::scheduler::{ProcedureScheduler, SchedulerConfig};
use flux_rpc::sync::{ProcedureSpec, SyncEngine, SyncOptions, SyncOutcome, SyncRequest};
use flux_rpc::validator::{validate_access, SUPER_ROLES};
use flux_rpc::{
    Database, ExecutionFilters, ExecutionLogLine, ExecutionRecord, ExecutionStatus, NewProcedure,
    ProcedureChanges, ProcedureError, ProcedureRecord,
};

use crate::auth::{caller_from_headers, AuthConfig};

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let db = Database::connect(&config.db_url)
        .await
        .context("failed to open database")?;

    let metrics = RpcMetrics::new().context("initializing metrics registry")?;
    let executor = ProcedureExecutor::new(
        db.clone(),
        EngineConfig {
            default_max_rows: config.max_rows,
        },
        metrics.clone(),
    );

    let mut sync = SyncEngine::new(db.clone());
    if let Some(dir) = &config.procedures_dir {
        sync = sync.with_procedures_dir(dir.clone());
    }

    let scheduler = ProcedureScheduler::new(db.clone(), executor.clone(), SchedulerConfig::default());

    if let Some(dir) = &config.procedures_dir {
        boot_sync(&sync, dir).await;
    }
    if config.scheduler_enabled {
        scheduler.start();
    }

    let state = Arc::new(AppState {
        db,
        executor,
        scheduler: scheduler.clone(),
        sync,
        auth: config.auth.clone(),
        metrics,
    });

    let app = build_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %config.listen_addr, "flux-daemon listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("HTTP server exited")?;

    scheduler.shutdown().await;
    Ok(())
}

/// Reconciles every namespace found under the procedures directory into the
/// stored catalog. Failures are logged; boot continues with whatever the
/// catalog already holds.
async fn boot_sync(sync: &SyncEngine, dir: &std::path::Path) {
    let namespaces: BTreeSet<String> = match load_procedures(dir) {
        Ok(loaded) => loaded.into_iter().map(|p| p.namespace).collect(),
        Err(error) => {
            warn!(%error, dir = %dir.display(), "failed to walk procedures directory at boot");
            return;
        }
    };
    for namespace in namespaces {
        match sync
            .sync(SyncRequest {
                namespace: namespace.clone(),
                procedures: Vec::new(),
                options: SyncOptions::default(),
            })
            .await
        {
            Ok(outcome) => info!(
                namespace = %namespace,
                created = outcome.created.len(),
                updated = outcome.updated.len(),
                "boot sync applied"
            ),
            Err(error) => warn!(%error, namespace = %namespace, "boot sync failed"),
        }
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/openapi.json", get(openapi))
        .route("/rpc/executions/:id", get(get_execution))
        .route("/rpc/executions/:id/logs", get(get_execution_logs))
        .route("/rpc/:namespace/:name", post(invoke_procedure))
        .route(
            "/admin/rpc/procedures",
            get(list_procedures).post(create_procedure),
        )
        .route(
            "/admin/rpc/procedures/:id",
            get(get_procedure)
                .put(update_procedure)
                .delete(delete_procedure),
        )
        .route("/admin/rpc/sync", post(sync_procedures))
        .route("/admin/rpc/executions", get(list_executions))
        .route("/admin/rpc/executions/:id/cancel", post(cancel_execution))
        .with_state(state)
}

#[derive(Clone)]
struct AppState {
    db: Database,
    executor: ProcedureExecutor,
    scheduler: ProcedureScheduler,
    sync: SyncEngine,
    auth: AuthConfig,
    metrics: RpcMetrics,
}

#[derive(Debug, Clone)]
struct AppConfig {
    listen_addr: SocketAddr,
    db_url: String,
    procedures_dir: Option<PathBuf>,
    max_rows: usize,
    scheduler_enabled: bool,
    auth: AuthConfig,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let listen_addr = env::var("FLUX_API_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid FLUX_API_ADDR")?;

        let db_url = env::var("FLUX_DB_DSN")
            .or_else(|_| env::var("DATABASE_URL"))
            .context("FLUX_DB_DSN or DATABASE_URL must be configured")?;

        let procedures_dir = env::var("FLUX_PROCEDURES_DIR")
            .ok()
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from);

        let max_rows = env::var("FLUX_MAX_ROWS")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(1_000);

        let scheduler_enabled = !matches!(bool_env("FLUX_SCHEDULER_DISABLED"), Some(true));

        let auth = AuthConfig {
            jwt_secret: env::var("FLUX_JWT_SECRET")
                .ok()
                .filter(|secret| !secret.trim().is_empty()),
            service_key: env::var("FLUX_SERVICE_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
        };

        Ok(Self {
            listen_addr,
            db_url,
            procedures_dir,
            max_rows,
            scheduler_enabled,
            auth,
        })
    }
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is healthy"))
)]
async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[utoipa::path(
    get,
    path = "/metrics",
    responses((status = 200, description = "Prometheus metrics", content_type = "text/plain"))
)]
async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&state.metrics.registry().gather(), &mut buffer)
        .map_err(ApiError::internal)?;
    Ok((
        StatusCode::OK,
        [("content-type", encoder.format_type().to_string())],
        buffer,
    )
        .into_response())
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(docs::ApiDoc::openapi())
}

#[derive(Debug, Deserialize, ToSchema)]
struct InvokeBody {
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    params: Option<Map<String, Value>>,
    #[serde(default, rename = "async")]
    run_async: bool,
}

#[derive(Debug, Serialize, ToSchema)]
struct InvokeResponse {
    execution_id: Uuid,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows_returned: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<ExecuteResult> for InvokeResponse {
    fn from(result: ExecuteResult) -> Self {
        let pending = result.status == ExecutionStatus::Pending;
        Self {
            execution_id: result.execution_id,
            status: result.status.as_str().to_string(),
            result: result.result,
            rows_returned: (!pending).then_some(result.rows_returned),
            duration_ms: (!pending).then_some(result.duration_ms),
            error: result.error,
        }
    }
}

#[utoipa::path(
    post,
    path = "/rpc/{namespace}/{name}",
    params(
        ("namespace" = String, Path, description = "Procedure namespace"),
        ("name" = String, Path, description = "Procedure name")
    ),
    request_body = InvokeBody,
    responses(
        (status = 200, description = "Invocation outcome", body = InvokeResponse),
        (status = 403, description = "Access denied", body = ErrorBody),
        (status = 404, description = "Procedure missing or disabled", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn invoke_procedure(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<InvokeBody>,
) -> Result<Json<InvokeResponse>, ApiError> {
    let caller = caller_from_headers(&state.auth, &headers);

    let procedure = state
        .db
        .fetch_procedure_by_name(&namespace, &name)
        .await
        .map_err(ApiError::internal)?
        .filter(|procedure| procedure.enabled)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                format!("procedure {namespace}/{name} not found"),
            )
        })?;

    validate_access(&procedure, &caller.role, caller.is_authenticated)
        .map_err(|err| ApiError::new(StatusCode::FORBIDDEN, err.to_string()))?;

    let params = body.params.unwrap_or_default();
    let ctx = ExecutionContext::new(procedure, params, caller);
    let result = if body.run_async {
        state.executor.execute_async(ctx).await
    } else {
        state.executor.execute(ctx).await
    }
    .map_err(ApiError::internal)?;

    Ok(Json(InvokeResponse::from(result)))
}

#[derive(Debug, Serialize, ToSchema)]
struct ExecutionResponse {
    id: Uuid,
    procedure_id: Uuid,
    procedure_name: String,
    namespace: String,
    status: String,
    #[schema(value_type = Object)]
    input_params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    rows_returned: i64,
    duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_email: Option<String>,
    is_async: bool,
    created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<String>,
}

impl From<ExecutionRecord> for ExecutionResponse {
    fn from(record: ExecutionRecord) -> Self {
        Self {
            id: record.id,
            procedure_id: record.procedure_id,
            procedure_name: record.procedure_name,
            namespace: record.namespace,
            status: record.status.as_str().to_string(),
            input_params: record.input_params,
            result: record.result,
            error_message: record.error_message,
            rows_returned: record.rows_returned,
            duration_ms: record.duration_ms,
            user_id: record.user_id,
            user_role: record.user_role,
            user_email: record.user_email,
            is_async: record.is_async,
            created_at: record.created_at.to_rfc3339(),
            started_at: record.started_at.map(|ts| ts.to_rfc3339()),
            completed_at: record.completed_at.map(|ts| ts.to_rfc3339()),
        }
    }
}

#[utoipa::path(
    get,
    path = "/rpc/executions/{id}",
    params(("id" = Uuid, Path, description = "Execution identifier")),
    responses(
        (status = 200, description = "Execution record", body = ExecutionResponse),
        (status = 404, description = "Unknown or foreign execution", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ExecutionResponse>, ApiError> {
    let caller = caller_from_headers(&state.auth, &headers);
    let record = state
        .db
        .fetch_execution(id)
        .await
        .map_err(ApiError::internal)?
        .filter(|record| can_view_execution(&caller, record))
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("execution {id} not found")))?;
    Ok(Json(ExecutionResponse::from(record)))
}

#[derive(Debug, Deserialize, IntoParams)]
struct LogsQuery {
    /// Only return lines after this line number.
    #[serde(default)]
    after: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
struct LogLineResponse {
    line_no: i64,
    level: String,
    message: String,
    created_at: String,
}

impl From<ExecutionLogLine> for LogLineResponse {
    fn from(line: ExecutionLogLine) -> Self {
        Self {
            line_no: line.line_no,
            level: line.level,
            message: line.message,
            created_at: line.created_at.to_rfc3339(),
        }
    }
}

#[utoipa::path(
    get,
    path = "/rpc/executions/{id}/logs",
    params(
        ("id" = Uuid, Path, description = "Execution identifier"),
        LogsQuery
    ),
    responses(
        (status = 200, description = "Log lines in ascending order", body = [LogLineResponse]),
        (status = 404, description = "Unknown or foreign execution", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn get_execution_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<LogLineResponse>>, ApiError> {
    let caller = caller_from_headers(&state.auth, &headers);
    state
        .db
        .fetch_execution(id)
        .await
        .map_err(ApiError::internal)?
        .filter(|record| can_view_execution(&caller, record))
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("execution {id} not found")))?;

    let lines = state
        .db
        .list_execution_logs(id, query.after)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(lines.into_iter().map(LogLineResponse::from).collect()))
}

#[derive(Debug, Serialize, ToSchema)]
struct ProcedureResponse {
    id: Uuid,
    namespace: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    sql_query: String,
    original_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_schema: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_schema: Option<BTreeMap<String, String>>,
    allowed_tables: Vec<String>,
    allowed_schemas: Vec<String>,
    max_execution_time_seconds: i64,
    require_roles: Vec<String>,
    is_public: bool,
    disable_execution_logs: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    schedule: Option<String>,
    enabled: bool,
    version: i64,
    source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_by: Option<String>,
    created_at: String,
    updated_at: String,
}

impl From<ProcedureRecord> for ProcedureResponse {
    fn from(record: ProcedureRecord) -> Self {
        Self {
            id: record.id,
            namespace: record.namespace,
            name: record.name,
            description: record.description,
            sql_query: record.sql_query,
            original_code: record.original_code,
            input_schema: record.input_schema,
            output_schema: record.output_schema,
            allowed_tables: record.allowed_tables,
            allowed_schemas: record.allowed_schemas,
            max_execution_time_seconds: record.max_execution_time_seconds,
            require_roles: record.require_roles,
            is_public: record.is_public,
            disable_execution_logs: record.disable_execution_logs,
            schedule: record.schedule,
            enabled: record.enabled,
            version: record.version,
            source: record.source.as_str().to_string(),
            created_by: record.created_by,
            created_at: record.created_at.to_rfc3339(),
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
struct ProcedureListQuery {
    #[serde(default)]
    namespace: Option<String>,
}

#[utoipa::path(
    get,
    path = "/admin/rpc/procedures",
    params(ProcedureListQuery),
    responses(
        (status = 200, description = "Procedure definitions", body = [ProcedureResponse]),
        (status = 403, description = "Admin role required", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn list_procedures(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ProcedureListQuery>,
) -> Result<Json<Vec<ProcedureResponse>>, ApiError> {
    require_admin(&caller_from_headers(&state.auth, &headers))?;
    let records = state
        .db
        .list_procedures(query.namespace.as_deref())
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(records.into_iter().map(ProcedureResponse::from).collect()))
}

#[derive(Debug, Deserialize, ToSchema)]
struct CreateProcedureBody {
    #[serde(default)]
    namespace: Option<String>,
    name: String,
    /// Full annotated source; configuration is parsed out of it.
    code: String,
    #[serde(default)]
    enabled: Option<bool>,
}

#[utoipa::path(
    post,
    path = "/admin/rpc/procedures",
    request_body = CreateProcedureBody,
    responses(
        (status = 201, description = "Procedure created", body = ProcedureResponse),
        (status = 403, description = "Admin role required", body = ErrorBody),
        (status = 409, description = "Procedure already exists", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn create_procedure(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateProcedureBody>,
) -> Result<(StatusCode, Json<ProcedureResponse>), ApiError> {
    let caller = caller_from_headers(&state.auth, &headers);
    require_admin(&caller)?;

    let namespace = body
        .namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    let (annotations, sql_query) = parse_annotations(&body.code);
    let name = annotations
        .name
        .clone()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| body.name.clone());

    let record = state
        .db
        .create_procedure(NewProcedure {
            namespace: &namespace,
            name: &name,
            description: annotations.description.as_deref(),
            sql_query: &sql_query,
            original_code: &body.code,
            input_schema: annotations.input_schema.as_ref(),
            output_schema: annotations.output_schema.as_ref(),
            allowed_tables: &annotations.allowed_tables,
            allowed_schemas: &annotations.allowed_schemas,
            max_execution_time_seconds: annotations.max_execution_time.as_secs() as i64,
            require_roles: &annotations.require_roles,
            is_public: annotations.is_public,
            disable_execution_logs: false,
            schedule: annotations.schedule.as_deref(),
            enabled: body.enabled.unwrap_or(true),
            source: flux_rpc::ProcedureSource::Api,
            created_by: caller.user_id.as_deref(),
        })
        .await
        .map_err(storage_error)?;

    state.scheduler.reschedule(&record);
    Ok((StatusCode::CREATED, Json(ProcedureResponse::from(record))))
}

#[utoipa::path(
    get,
    path = "/admin/rpc/procedures/{id}",
    params(("id" = Uuid, Path, description = "Procedure identifier")),
    responses(
        (status = 200, description = "Procedure definition", body = ProcedureResponse),
        (status = 403, description = "Admin role required", body = ErrorBody),
        (status = 404, description = "Unknown procedure", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn get_procedure(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ProcedureResponse>, ApiError> {
    require_admin(&caller_from_headers(&state.auth, &headers))?;
    let record = state
        .db
        .fetch_procedure(id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("procedure {id} not found")))?;
    Ok(Json(ProcedureResponse::from(record)))
}

#[derive(Debug, Deserialize, ToSchema)]
struct UpdateProcedureBody {
    /// Full annotated source; configuration is parsed out of it.
    code: String,
    #[serde(default)]
    enabled: Option<bool>,
}

#[utoipa::path(
    put,
    path = "/admin/rpc/procedures/{id}",
    params(("id" = Uuid, Path, description = "Procedure identifier")),
    request_body = UpdateProcedureBody,
    responses(
        (status = 200, description = "Procedure updated", body = ProcedureResponse),
        (status = 403, description = "Admin role required", body = ErrorBody),
        (status = 404, description = "Unknown procedure", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn update_procedure(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<UpdateProcedureBody>,
) -> Result<Json<ProcedureResponse>, ApiError> {
    require_admin(&caller_from_headers(&state.auth, &headers))?;

    let existing = state
        .db
        .fetch_procedure(id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("procedure {id} not found")))?;

    let (annotations, sql_query) = parse_annotations(&body.code);
    let record = state
        .db
        .update_procedure(
            id,
            ProcedureChanges {
                description: annotations.description.as_deref(),
                sql_query: &sql_query,
                original_code: &body.code,
                input_schema: annotations.input_schema.as_ref(),
                output_schema: annotations.output_schema.as_ref(),
                allowed_tables: &annotations.allowed_tables,
                allowed_schemas: &annotations.allowed_schemas,
                max_execution_time_seconds: annotations.max_execution_time.as_secs() as i64,
                require_roles: &annotations.require_roles,
                is_public: annotations.is_public,
                disable_execution_logs: existing.disable_execution_logs,
                schedule: annotations.schedule.as_deref(),
                enabled: body.enabled.unwrap_or(existing.enabled),
            },
        )
        .await
        .map_err(storage_error)?;

    state.scheduler.reschedule(&record);
    Ok(Json(ProcedureResponse::from(record)))
}

#[utoipa::path(
    delete,
    path = "/admin/rpc/procedures/{id}",
    params(("id" = Uuid, Path, description = "Procedure identifier")),
    responses(
        (status = 204, description = "Procedure deleted"),
        (status = 403, description = "Admin role required", body = ErrorBody),
        (status = 404, description = "Unknown procedure", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn delete_procedure(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    require_admin(&caller_from_headers(&state.auth, &headers))?;

    let record = state
        .db
        .fetch_procedure(id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("procedure {id} not found")))?;

    state
        .db
        .delete_procedure(id)
        .await
        .map_err(ApiError::internal)?;
    state.scheduler.unregister(&record.schedule_key());
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, ToSchema)]
struct SyncBody {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    #[schema(value_type = Option<Vec<Object>>)]
    procedures: Option<Vec<ProcedureSpec>>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    options: Option<SyncOptions>,
}

#[derive(Debug, Serialize, ToSchema)]
struct SyncErrorBody {
    name: String,
    error: String,
}

#[derive(Debug, Serialize, ToSchema)]
struct SyncResponse {
    created: usize,
    updated: usize,
    unchanged: usize,
    deleted: usize,
    created_names: Vec<String>,
    updated_names: Vec<String>,
    unchanged_names: Vec<String>,
    deleted_names: Vec<String>,
    errors: Vec<SyncErrorBody>,
}

impl From<SyncOutcome> for SyncResponse {
    fn from(outcome: SyncOutcome) -> Self {
        Self {
            created: outcome.created.len(),
            updated: outcome.updated.len(),
            unchanged: outcome.unchanged.len(),
            deleted: outcome.deleted.len(),
            created_names: outcome.created,
            updated_names: outcome.updated,
            unchanged_names: outcome.unchanged,
            deleted_names: outcome.deleted,
            errors: outcome
                .errors
                .into_iter()
                .map(|entry| SyncErrorBody {
                    name: entry.name,
                    error: entry.error,
                })
                .collect(),
        }
    }
}

#[utoipa::path(
    post,
    path = "/admin/rpc/sync",
    request_body = SyncBody,
    responses(
        (status = 200, description = "Sync summary", body = SyncResponse),
        (status = 403, description = "Admin role required", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn sync_procedures(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SyncBody>,
) -> Result<Json<SyncResponse>, ApiError> {
    require_admin(&caller_from_headers(&state.auth, &headers))?;

    let namespace = body
        .namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    let options = body.options.unwrap_or_default();
    let outcome = state
        .sync
        .sync(SyncRequest {
            namespace: namespace.clone(),
            procedures: body.procedures.unwrap_or_default(),
            options,
        })
        .await
        .map_err(ApiError::internal)?;

    if !options.dry_run {
        for name in outcome.created.iter().chain(outcome.updated.iter()) {
            if let Ok(Some(record)) = state.db.fetch_procedure_by_name(&namespace, name).await {
                state.scheduler.reschedule(&record);
            }
        }
        for name in &outcome.deleted {
            state.scheduler.unregister(&format!("{namespace}/{name}"));
        }
    }

    Ok(Json(SyncResponse::from(outcome)))
}

#[derive(Debug, Deserialize, IntoParams)]
struct ExecutionListQuery {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    procedure_name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

#[utoipa::path(
    get,
    path = "/admin/rpc/executions",
    params(ExecutionListQuery),
    responses(
        (status = 200, description = "Execution records, newest first", body = [ExecutionResponse]),
        (status = 400, description = "Invalid status filter", body = ErrorBody),
        (status = 403, description = "Admin role required", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn list_executions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ExecutionListQuery>,
) -> Result<Json<Vec<ExecutionResponse>>, ApiError> {
    require_admin(&caller_from_headers(&state.auth, &headers))?;

    let status = query
        .status
        .as_deref()
        .map(ExecutionStatus::from_str)
        .transpose()
        .map_err(|_| ApiError::bad_request("invalid status filter"))?;

    let records = state
        .db
        .list_executions(ExecutionFilters {
            namespace: query.namespace.as_deref(),
            procedure_name: query.procedure_name.as_deref(),
            status,
            user_id: query.user_id.as_deref(),
            limit: query.limit,
        })
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(records.into_iter().map(ExecutionResponse::from).collect()))
}

#[utoipa::path(
    post,
    path = "/admin/rpc/executions/{id}/cancel",
    params(("id" = Uuid, Path, description = "Execution identifier")),
    responses(
        (status = 200, description = "Execution cancelled", body = ExecutionResponse),
        (status = 403, description = "Admin role required", body = ErrorBody),
        (status = 404, description = "Unknown execution", body = ErrorBody),
        (status = 409, description = "Execution already terminal", body = ErrorBody)
    ),
    security(("bearerAuth" = []))
)]
async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ExecutionResponse>, ApiError> {
    require_admin(&caller_from_headers(&state.auth, &headers))?;

    state
        .db
        .fetch_execution(id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("execution {id} not found")))?;

    if !state.db.cancel_execution(id).await.map_err(ApiError::internal)? {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "execution is not cancellable in its current state",
        ));
    }

    let record = state
        .db
        .fetch_execution(id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::internal("execution vanished after cancellation"))?;
    Ok(Json(ExecutionResponse::from(record)))
}

fn can_view_execution(caller: &CallerIdentity, record: &ExecutionRecord) -> bool {
    if SUPER_ROLES.contains(&caller.role.as_str()) {
        return true;
    }
    match (&caller.user_id, &record.user_id) {
        (Some(caller_id), Some(owner)) => caller_id == owner,
        _ => false,
    }
}

fn require_admin(caller: &CallerIdentity) -> Result<(), ApiError> {
    if SUPER_ROLES.contains(&caller.role.as_str()) {
        Ok(())
    } else {
        Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "administrative role required",
        ))
    }
}

fn storage_error(err: anyhow::Error) -> ApiError {
    match err.downcast::<ProcedureError>() {
        Ok(ProcedureError::Duplicate(namespace, name)) => ApiError::new(
            StatusCode::CONFLICT,
            format!("procedure '{name}' already exists in namespace '{namespace}'"),
        ),
        Ok(ProcedureError::NotFound(id)) => {
            ApiError::new(StatusCode::NOT_FOUND, format!("procedure {id} not found"))
        }
        Err(err) => ApiError::internal(err),
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(status = %self.status, message = %self.message, "api error");
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    error: String,
}

fn bool_env(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .and_then(|value| match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

pub mod docs {
    use super::*;
    use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityRequirement, SecurityScheme};
    use utoipa::Modify;

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Fluxbase RPC API", version = "0.1.0"),
        paths(
            healthz,
            metrics,
            invoke_procedure,
            get_execution,
            get_execution_logs,
            list_procedures,
            create_procedure,
            get_procedure,
            update_procedure,
            delete_procedure,
            sync_procedures,
            list_executions,
            cancel_execution
        ),
        components(
            schemas(
                InvokeBody,
                InvokeResponse,
                ExecutionResponse,
                LogLineResponse,
                ProcedureResponse,
                CreateProcedureBody,
                UpdateProcedureBody,
                SyncBody,
                SyncResponse,
                SyncErrorBody,
                ErrorBody
            )
        ),
        modifiers(&SecurityAddon)
    )]
    pub struct ApiDoc;

    struct SecurityAddon;

    impl Modify for SecurityAddon {
        fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
            if let Some(components) = openapi.components.as_mut() {
                components.add_security_scheme(
                    "bearerAuth",
                    SecurityScheme::Http(
                        HttpBuilder::new()
                            .scheme(HttpAuthScheme::Bearer)
                            .bearer_format("JWT")
                            .description(Some(
                                "HS256 token carrying sub/role/email claims",
                            ))
                            .build(),
                    ),
                );
            }
            openapi
                .security
                .get_or_insert_with(Default::default)
                .push(SecurityRequirement::new("bearerAuth", Vec::<String>::new()));
        }
    }
}
