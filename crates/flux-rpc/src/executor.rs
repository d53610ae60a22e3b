//! Procedure invocation orchestration.
//!
//! A synchronous invocation creates its execution record directly in
//! `running` and moves it to exactly one terminal state. An asynchronous
//! invocation gets a `pending` record up front, then a detached task drives
//! the same path. Invocation failures (bad input, rejected SQL, runtime
//! errors, deadline) never surface as transport errors: the record is
//! finalised and the returned [`ExecuteResult`] carries the error text.

use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::TryStreamExt;
use serde::Serialize;
use serde_json::{Map, Number, Value};
use sqlx::postgres::PgRow;
use sqlx::types::BigDecimal;
use sqlx::{any::AnyRow, Column, PgPool, Row, TypeInfo};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::metrics::RpcMetrics;
use crate::params::{merge_caller_params, substitute_params};
use crate::rls::set_rls_context;
use crate::validator::{validate_input, validate_sql};
use crate::{Database, ExecutionStatus, NewExecution, ProcedureRecord};

/// Engine-level execution limits.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Rows captured per invocation before the result set is cut off.
    pub default_max_rows: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_rows: 1_000,
        }
    }
}

/// The resolved caller of an invocation.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub user_id: Option<String>,
    pub role: String,
    pub email: Option<String>,
    pub claims: Value,
    pub is_authenticated: bool,
}

impl CallerIdentity {
    /// An unauthenticated caller.
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            role: "anon".to_string(),
            email: None,
            claims: Value::Object(Map::new()),
            is_authenticated: false,
        }
    }

    /// The synthetic caller used by the scheduler and internal jobs.
    pub fn service_role() -> Self {
        Self {
            user_id: None,
            role: "service_role".to_string(),
            email: None,
            claims: Value::Object(Map::new()),
            is_authenticated: true,
        }
    }
}

/// Everything the executor needs for one invocation.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub procedure: ProcedureRecord,
    pub params: Map<String, Value>,
    pub caller: CallerIdentity,
    pub is_async: bool,
    /// Pre-allocated record id; set by `execute_async` for the worker path.
    pub execution_id: Option<Uuid>,
    pub disable_execution_logs: bool,
}

impl ExecutionContext {
    pub fn new(
        procedure: ProcedureRecord,
        params: Map<String, Value>,
        caller: CallerIdentity,
    ) -> Self {
        let disable_execution_logs = procedure.disable_execution_logs;
        Self {
            procedure,
            params,
            caller,
            is_async: false,
            execution_id: None,
            disable_execution_logs,
        }
    }
}

/// Outcome returned to the invoking surface.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResult {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub rows_returned: i64,
    pub duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Drives single invocations end to end.
#[derive(Clone)]
pub struct ProcedureExecutor {
    db: Database,
    config: EngineConfig,
    metrics: RpcMetrics,
}

impl ProcedureExecutor {
    pub fn new(db: Database, config: EngineConfig, metrics: RpcMetrics) -> Self {
        Self {
            db,
            config,
            metrics,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Runs one invocation to a terminal state.
    #[instrument(skip(self, ctx), fields(namespace = %ctx.procedure.namespace, procedure = %ctx.procedure.name))]
    pub async fn execute(&self, ctx: ExecutionContext) -> Result<ExecuteResult> {
        let started = Instant::now();
        // Synchronous invocations with logs disabled never persist a record;
        // async ones always do so the status stays pollable.
        let persist = ctx.is_async || !ctx.disable_execution_logs;
        let execution_id = ctx.execution_id.unwrap_or_else(Uuid::new_v4);
        let input_params = Value::Object(ctx.params.clone());

        if persist {
            if ctx.execution_id.is_some() {
                if !self.db.mark_execution_running(execution_id).await? {
                    info!(execution_id = %execution_id, "execution left pending before start; skipping");
                    return Ok(ExecuteResult {
                        execution_id,
                        status: ExecutionStatus::Cancelled,
                        result: None,
                        rows_returned: 0,
                        duration_ms: 0,
                        error: Some("execution was cancelled".to_string()),
                    });
                }
            } else {
                self.db
                    .insert_execution(NewExecution {
                        id: execution_id,
                        procedure_id: ctx.procedure.id,
                        procedure_name: &ctx.procedure.name,
                        namespace: &ctx.procedure.namespace,
                        status: ExecutionStatus::Running,
                        input_params: &input_params,
                        user_id: ctx.caller.user_id.as_deref(),
                        user_role: Some(&ctx.caller.role),
                        user_email: ctx.caller.email.as_deref(),
                        is_async: ctx.is_async,
                    })
                    .await?;
            }
            self.db
                .append_execution_log(execution_id, "info", "execution started")
                .await?;
        }

        if let Err(err) = validate_input(ctx.procedure.input_schema.as_ref(), &ctx.params) {
            return self
                .finish_failure(&ctx, execution_id, persist, started, ExecutionStatus::Failed, err.to_string())
                .await;
        }

        let validation = validate_sql(
            &ctx.procedure.sql_query,
            &ctx.procedure.allowed_tables,
            &ctx.procedure.allowed_schemas,
        );
        if !validation.valid {
            return self
                .finish_failure(
                    &ctx,
                    execution_id,
                    persist,
                    started,
                    ExecutionStatus::Failed,
                    validation.errors.join("; "),
                )
                .await;
        }

        let merged = merge_caller_params(
            &ctx.params,
            ctx.caller.user_id.as_deref(),
            Some(&ctx.caller.role),
            ctx.caller.email.as_deref(),
        );
        let sql = match substitute_params(&ctx.procedure.sql_query, &merged) {
            Ok(sql) => sql,
            Err(err) => {
                return self
                    .finish_failure(&ctx, execution_id, persist, started, ExecutionStatus::Failed, err.to_string())
                    .await;
            }
        };

        // The deadline scopes the database work only, and an elapsed
        // deadline is observed before any error the query may have raised.
        let timeout = ctx.procedure.execution_timeout();
        let outcome = tokio::time::timeout(timeout, self.run_query(&sql, &ctx.caller)).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Err(_elapsed) => {
                self.finish_failure(
                    &ctx,
                    execution_id,
                    persist,
                    started,
                    ExecutionStatus::Timeout,
                    "Query execution timed out".to_string(),
                )
                .await
            }
            Ok(Err(err)) => {
                self.finish_failure(&ctx, execution_id, persist, started, ExecutionStatus::Failed, err.to_string())
                    .await
            }
            Ok(Ok(rows)) => {
                let rows_returned = rows.len() as i64;
                let result = Value::Array(rows.into_iter().map(Value::Object).collect());
                if persist {
                    self.db
                        .complete_execution(execution_id, &result, rows_returned, duration_ms)
                        .await?;
                    self.db
                        .append_execution_log(execution_id, "info", "execution completed")
                        .await?;
                }
                self.metrics
                    .observe(&ctx.procedure.name, "success", started.elapsed());
                info!(execution_id = %execution_id, rows_returned, duration_ms, "execution completed");
                Ok(ExecuteResult {
                    execution_id,
                    status: ExecutionStatus::Completed,
                    result: Some(result),
                    rows_returned,
                    duration_ms,
                    error: None,
                })
            }
        }
    }

    /// Creates the pending record and dispatches the run to a detached task.
    /// The record is persisted regardless of `disable_execution_logs` so
    /// callers can poll the status.
    pub async fn execute_async(&self, mut ctx: ExecutionContext) -> Result<ExecuteResult> {
        let execution_id = Uuid::new_v4();
        let input_params = Value::Object(ctx.params.clone());
        self.db
            .insert_execution(NewExecution {
                id: execution_id,
                procedure_id: ctx.procedure.id,
                procedure_name: &ctx.procedure.name,
                namespace: &ctx.procedure.namespace,
                status: ExecutionStatus::Pending,
                input_params: &input_params,
                user_id: ctx.caller.user_id.as_deref(),
                user_role: Some(&ctx.caller.role),
                user_email: ctx.caller.email.as_deref(),
                is_async: true,
            })
            .await?;

        ctx.execution_id = Some(execution_id);
        ctx.is_async = true;

        // Detached: the originating request returns immediately and the
        // spawned task owns every state transition from here.
        let executor = self.clone();
        tokio::spawn(async move {
            if let Err(error) = executor.execute(ctx).await {
                error!(%error, execution_id = %execution_id, "async execution failed to finalise its record");
            }
        });

        Ok(ExecuteResult {
            execution_id,
            status: ExecutionStatus::Pending,
            result: None,
            rows_returned: 0,
            duration_ms: 0,
            error: None,
        })
    }

    async fn finish_failure(
        &self,
        ctx: &ExecutionContext,
        execution_id: Uuid,
        persist: bool,
        started: Instant,
        status: ExecutionStatus,
        message: String,
    ) -> Result<ExecuteResult> {
        let duration_ms = started.elapsed().as_millis() as i64;
        if persist {
            self.db
                .fail_execution(execution_id, status, &message, duration_ms)
                .await?;
            self.db
                .append_execution_log(execution_id, "error", &message)
                .await?;
        }
        self.metrics
            .observe(&ctx.procedure.name, "error", started.elapsed());
        warn!(execution_id = %execution_id, status = status.as_str(), error = %message, "execution failed");
        Ok(ExecuteResult {
            execution_id,
            status,
            result: None,
            rows_returned: 0,
            duration_ms,
            error: Some(message),
        })
    }

    /// Runs the substituted SQL inside a fresh transaction, streaming rows
    /// up to the configured cap. On Postgres this goes through the
    /// natively-typed pool so timestamptz/date/uuid/jsonb/numeric columns
    /// normalise instead of dropping to null, and the RLS context is bound
    /// before the body executes.
    async fn run_query(
        &self,
        sql: &str,
        caller: &CallerIdentity,
    ) -> Result<Vec<Map<String, Value>>> {
        match self.db.postgres_pool() {
            Some(pool) => self.run_query_postgres(pool, sql, caller).await,
            None => self.run_query_sqlite(sql).await,
        }
    }

    async fn run_query_postgres(
        &self,
        pool: &PgPool,
        sql: &str,
        caller: &CallerIdentity,
    ) -> Result<Vec<Map<String, Value>>> {
        let mut tx = pool.begin().await?;
        set_rls_context(
            &mut tx,
            caller.user_id.as_deref(),
            &caller.role,
            &caller.claims,
        )
        .await?;

        let mut out = Vec::new();
        {
            let mut rows = sqlx::query(sql).fetch(&mut *tx);
            while let Some(row) = rows.try_next().await? {
                if out.len() >= self.config.default_max_rows {
                    break;
                }
                out.push(pg_row_to_object(&row));
            }
        }
        tx.commit().await?;
        Ok(out)
    }

    async fn run_query_sqlite(&self, sql: &str) -> Result<Vec<Map<String, Value>>> {
        let mut tx = self.db.pool().begin().await?;
        let mut out = Vec::new();
        {
            let mut rows = sqlx::query(sql).fetch(&mut *tx);
            while let Some(row) = rows.try_next().await? {
                if out.len() >= self.config.default_max_rows {
                    break;
                }
                out.push(any_row_to_object(&row));
            }
        }
        tx.commit().await?;
        Ok(out)
    }
}

/// Converts one Postgres result row into a column-keyed JSON object,
/// column order preserved.
fn pg_row_to_object(row: &PgRow) -> Map<String, Value> {
    let mut object = Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), decode_pg_column(row, idx));
    }
    object
}

/// Normalises one natively-typed column value. Timestamps become RFC3339
/// strings, json/jsonb pass through as structured values, numerics keep
/// their full decimal text, byte sequences are attempted as JSON first.
/// Values the driver cannot represent drop to null.
fn decode_pg_column(row: &PgRow, idx: usize) -> Value {
    match row.columns()[idx].type_info().name() {
        "BOOL" => match row.try_get::<Option<bool>, _>(idx) {
            Ok(Some(v)) => Value::Bool(v),
            _ => Value::Null,
        },
        "INT2" => match row.try_get::<Option<i16>, _>(idx) {
            Ok(Some(v)) => Value::from(v as i64),
            _ => Value::Null,
        },
        "INT4" => match row.try_get::<Option<i32>, _>(idx) {
            Ok(Some(v)) => Value::from(v as i64),
            _ => Value::Null,
        },
        "INT8" => match row.try_get::<Option<i64>, _>(idx) {
            Ok(Some(v)) => Value::from(v),
            _ => Value::Null,
        },
        "FLOAT4" => match row.try_get::<Option<f32>, _>(idx) {
            Ok(Some(v)) => Number::from_f64(v as f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            _ => Value::Null,
        },
        "FLOAT8" => match row.try_get::<Option<f64>, _>(idx) {
            Ok(Some(v)) => Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null),
            _ => Value::Null,
        },
        "NUMERIC" => match row.try_get::<Option<BigDecimal>, _>(idx) {
            Ok(Some(v)) => {
                let text = v.to_string();
                serde_json::from_str::<Number>(&text)
                    .map(Value::Number)
                    .unwrap_or(Value::String(text))
            }
            _ => Value::Null,
        },
        "TIMESTAMPTZ" => match row.try_get::<Option<DateTime<Utc>>, _>(idx) {
            Ok(Some(v)) => Value::String(v.to_rfc3339()),
            _ => Value::Null,
        },
        "TIMESTAMP" => match row.try_get::<Option<NaiveDateTime>, _>(idx) {
            Ok(Some(v)) => Value::String(v.and_utc().to_rfc3339()),
            _ => Value::Null,
        },
        "DATE" => match row.try_get::<Option<NaiveDate>, _>(idx) {
            Ok(Some(v)) => Value::String(v.to_string()),
            _ => Value::Null,
        },
        "UUID" => match row.try_get::<Option<Uuid>, _>(idx) {
            Ok(Some(v)) => Value::String(v.to_string()),
            _ => Value::Null,
        },
        "JSON" | "JSONB" => match row.try_get::<Option<Value>, _>(idx) {
            Ok(Some(v)) => v,
            _ => Value::Null,
        },
        "BYTEA" => match row.try_get::<Option<Vec<u8>>, _>(idx) {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned())),
            _ => Value::Null,
        },
        _ => match row.try_get::<Option<String>, _>(idx) {
            // Opaque handles and exotic types that refuse a text decode
            // drop to null.
            Ok(Some(v)) => Value::String(v),
            _ => Value::Null,
        },
    }
}

/// Converts one SQLite result row into a column-keyed JSON object, column
/// order preserved.
fn any_row_to_object(row: &AnyRow) -> Map<String, Value> {
    let mut object = Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), decode_any_column(row, idx));
    }
    object
}

/// Normalises a SQLite column value. The storage classes cover the whole
/// cascade; timestamps are stored as RFC3339 text and arrive as strings.
/// Byte sequences are attempted as JSON first; anything else drops to null.
fn decode_any_column(row: &AnyRow, idx: usize) -> Value {
    if let Ok(value) = row.try_get::<Option<i64>, _>(idx) {
        return match value {
            Some(v) => Value::from(v),
            None => Value::Null,
        };
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(idx) {
        return match value {
            Some(v) => Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null),
            None => Value::Null,
        };
    }
    if let Ok(value) = row.try_get::<Option<bool>, _>(idx) {
        return match value {
            Some(v) => Value::Bool(v),
            None => Value::Null,
        };
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(idx) {
        return match value {
            Some(v) => Value::String(v),
            None => Value::Null,
        };
    }
    if let Ok(value) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return match value {
            Some(bytes) => serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned())),
            None => Value::Null,
        };
    }
    Value::Null
}
