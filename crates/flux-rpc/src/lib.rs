//! Fluxbase RPC persistence layer and engine entry points.
//!
//! This crate hosts the stored-procedure engine: annotation parsing, the
//! filesystem loader, input/SQL/access validation, parameter substitution,
//! the executor, the cron scheduler and the sync engine. The storage layer
//! below offers an async API around SQLite/Postgres (sqlx `Any` driver) for
//! procedure definitions, execution records and execution log lines.

pub mod annotations;
pub mod executor;
pub mod loader;
pub mod metrics;
pub mod params;
pub mod rls;
pub mod scheduler;
pub mod sync;
pub mod validator;

use std::{
    collections::BTreeMap,
    path::Path,
    str::FromStr,
    sync::Once,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{
    any::{AnyPoolOptions, AnyRow},
    migrate::MigrateError,
    postgres::PgPoolOptions,
    AnyPool, PgPool, QueryBuilder, Row,
};
use thiserror::Error;
use uuid::Uuid;

/// Fallback per-invocation timeout applied when a procedure declares none.
pub const DEFAULT_EXECUTION_TIMEOUT_SECS: i64 = 30;

/// Supported database backends for the persistence layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatabaseDriver {
    Sqlite,
    Postgres,
}

/// Primary entry point to the persistence layer.
///
/// Catalog queries run on the driver-agnostic pool. On Postgres a second,
/// natively-typed pool is kept alongside it: procedure bodies produce
/// arbitrary column types (timestamptz, uuid, jsonb, numeric) that the
/// `Any` driver cannot decode, so the executor runs them there.
#[derive(Clone, Debug)]
pub struct Database {
    pool: AnyPool,
    pg_pool: Option<PgPool>,
    driver: DatabaseDriver,
}

impl Database {
    /// Establishes (or creates) a connection pool for the given database URL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        static DRIVERS: Once = Once::new();
        DRIVERS.call_once(|| {
            sqlx::any::install_default_drivers();
        });

        let driver = if database_url.starts_with("postgres://")
            || database_url.starts_with("postgresql://")
        {
            DatabaseDriver::Postgres
        } else {
            DatabaseDriver::Sqlite
        };

        let max_connections = match driver {
            DatabaseDriver::Sqlite if database_url.contains(":memory:") => 1,
            _ => 8,
        };

        let pool = AnyPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let pg_pool = match driver {
            DatabaseDriver::Postgres => Some(
                PgPoolOptions::new()
                    .min_connections(1)
                    .max_connections(max_connections)
                    .connect(database_url)
                    .await?,
            ),
            DatabaseDriver::Sqlite => None,
        };

        // Run embedded migrations. The directory is resolved relative to this crate.
        let migration_result = match driver {
            DatabaseDriver::Sqlite => sqlx::migrate!("./migrations").run(&pool).await,
            DatabaseDriver::Postgres => sqlx::migrate!("./migrations_postgres").run(&pool).await,
        };
        if let Err(err) = migration_result {
            match &err {
                MigrateError::Execute(sqlx::Error::Database(db_err))
                    if db_err.message().contains("_sqlx_migrations")
                        && db_err
                            .code()
                            .map(|code| matches!(code.as_ref(), "2067" | "1555" | "23505"))
                            .unwrap_or(false) => {}
                _ => return Err(err.into()),
            }
        }

        Ok(Self {
            pool,
            pg_pool,
            driver,
        })
    }

    /// Connects to a file path via `sqlite://` scheme.
    pub async fn connect_file(path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}", path.display());
        Self::connect(&url).await
    }

    /// Exposes the underlying pool. The executor composes transactions on it.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// The natively-typed Postgres pool, present only on that driver.
    pub fn postgres_pool(&self) -> Option<&PgPool> {
        self.pg_pool.as_ref()
    }

    /// Returns the configured driver for this database handle.
    pub fn driver(&self) -> DatabaseDriver {
        self.driver
    }

    /// Registers a new procedure and returns the persisted record.
    pub async fn create_procedure(&self, data: NewProcedure<'_>) -> Result<ProcedureRecord> {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let now_str = encode_datetime(now);
        let input_schema = encode_schema(data.input_schema)?;
        let output_schema = encode_schema(data.output_schema)?;
        let allowed_tables = encode_string_list(data.allowed_tables)?;
        let allowed_schemas = encode_string_list(data.allowed_schemas)?;
        let require_roles = encode_string_list(data.require_roles)?;

        let result = match self.driver {
            DatabaseDriver::Sqlite => {
                sqlx::query(
                    r#"
                INSERT INTO procedures (
                    id, namespace, name, description, sql_query, original_code,
                    input_schema, output_schema, allowed_tables, allowed_schemas,
                    max_execution_time_seconds, require_roles, is_public,
                    disable_execution_logs, schedule, enabled, version, source,
                    created_by, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?)
                "#,
                )
                .bind(encode_uuid(id))
                .bind(data.namespace)
                .bind(data.name)
                .bind(data.description)
                .bind(data.sql_query)
                .bind(data.original_code)
                .bind(input_schema)
                .bind(output_schema)
                .bind(allowed_tables)
                .bind(allowed_schemas)
                .bind(data.max_execution_time_seconds)
                .bind(require_roles)
                .bind(data.is_public)
                .bind(data.disable_execution_logs)
                .bind(data.schedule)
                .bind(data.enabled)
                .bind(data.source.as_str())
                .bind(data.created_by)
                .bind(now_str.clone())
                .bind(now_str)
                .execute(&self.pool)
                .await
            }
            DatabaseDriver::Postgres => {
                sqlx::query(
                    r#"
                INSERT INTO procedures (
                    id, namespace, name, description, sql_query, original_code,
                    input_schema, output_schema, allowed_tables, allowed_schemas,
                    max_execution_time_seconds, require_roles, is_public,
                    disable_execution_logs, schedule, enabled, version, source,
                    created_by, created_at, updated_at
                ) VALUES (
                    $1, $2, $3, $4, $5, $6,
                    CAST($7 AS JSONB), CAST($8 AS JSONB), CAST($9 AS JSONB), CAST($10 AS JSONB),
                    $11, CAST($12 AS JSONB), $13, $14, $15, $16, 1, $17, $18, $19, $20
                )
                "#,
                )
                .bind(encode_uuid(id))
                .bind(data.namespace)
                .bind(data.name)
                .bind(data.description)
                .bind(data.sql_query)
                .bind(data.original_code)
                .bind(input_schema)
                .bind(output_schema)
                .bind(allowed_tables)
                .bind(allowed_schemas)
                .bind(data.max_execution_time_seconds)
                .bind(require_roles)
                .bind(data.is_public)
                .bind(data.disable_execution_logs)
                .bind(data.schedule)
                .bind(data.enabled)
                .bind(data.source.as_str())
                .bind(data.created_by)
                .bind(now_str.clone())
                .bind(now_str)
                .execute(&self.pool)
                .await
            }
        };

        result.map_err(|err| {
            if is_unique_violation(&err) {
                anyhow::Error::new(ProcedureError::Duplicate(
                    data.namespace.to_owned(),
                    data.name.to_owned(),
                ))
            } else {
                err.into()
            }
        })?;

        self.fetch_procedure(id).await?.ok_or_else(|| {
            anyhow!(
                "procedure inserted but missing when reloaded (namespace={}, name={})",
                data.namespace,
                data.name
            )
        })
    }

    /// Applies a full update to a procedure. The version column is bumped
    /// inside the statement so it stays strictly increasing.
    pub async fn update_procedure(
        &self,
        id: Uuid,
        changes: ProcedureChanges<'_>,
    ) -> Result<ProcedureRecord> {
        let now_str = encode_datetime(Utc::now());
        let input_schema = encode_schema(changes.input_schema)?;
        let output_schema = encode_schema(changes.output_schema)?;
        let allowed_tables = encode_string_list(changes.allowed_tables)?;
        let allowed_schemas = encode_string_list(changes.allowed_schemas)?;
        let require_roles = encode_string_list(changes.require_roles)?;

        let result = match self.driver {
            DatabaseDriver::Sqlite => {
                sqlx::query(
                    r#"
                UPDATE procedures SET
                    description = ?, sql_query = ?, original_code = ?,
                    input_schema = ?, output_schema = ?, allowed_tables = ?,
                    allowed_schemas = ?, max_execution_time_seconds = ?,
                    require_roles = ?, is_public = ?, disable_execution_logs = ?,
                    schedule = ?, enabled = ?, version = version + 1, updated_at = ?
                WHERE id = ?
                "#,
                )
                .bind(changes.description)
                .bind(changes.sql_query)
                .bind(changes.original_code)
                .bind(input_schema)
                .bind(output_schema)
                .bind(allowed_tables)
                .bind(allowed_schemas)
                .bind(changes.max_execution_time_seconds)
                .bind(require_roles)
                .bind(changes.is_public)
                .bind(changes.disable_execution_logs)
                .bind(changes.schedule)
                .bind(changes.enabled)
                .bind(now_str)
                .bind(encode_uuid(id))
                .execute(&self.pool)
                .await?
            }
            DatabaseDriver::Postgres => {
                sqlx::query(
                    r#"
                UPDATE procedures SET
                    description = $1, sql_query = $2, original_code = $3,
                    input_schema = CAST($4 AS JSONB), output_schema = CAST($5 AS JSONB),
                    allowed_tables = CAST($6 AS JSONB), allowed_schemas = CAST($7 AS JSONB),
                    max_execution_time_seconds = $8, require_roles = CAST($9 AS JSONB),
                    is_public = $10, disable_execution_logs = $11,
                    schedule = $12, enabled = $13, version = version + 1, updated_at = $14
                WHERE id = $15
                "#,
                )
                .bind(changes.description)
                .bind(changes.sql_query)
                .bind(changes.original_code)
                .bind(input_schema)
                .bind(output_schema)
                .bind(allowed_tables)
                .bind(allowed_schemas)
                .bind(changes.max_execution_time_seconds)
                .bind(require_roles)
                .bind(changes.is_public)
                .bind(changes.disable_execution_logs)
                .bind(changes.schedule)
                .bind(changes.enabled)
                .bind(now_str)
                .bind(encode_uuid(id))
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(anyhow::Error::new(ProcedureError::NotFound(id)));
        }

        self.fetch_procedure(id)
            .await?
            .ok_or_else(|| anyhow!("procedure updated but missing when reloaded ({id})"))
    }

    /// Retrieves a procedure by its identifier.
    pub async fn fetch_procedure(&self, id: Uuid) -> Result<Option<ProcedureRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM procedures WHERE id = ?",
            DatabaseDriver::Postgres => {
                r#"
            SELECT
                id, namespace, name, description, sql_query, original_code,
                input_schema::text AS input_schema,
                output_schema::text AS output_schema,
                allowed_tables::text AS allowed_tables,
                allowed_schemas::text AS allowed_schemas,
                max_execution_time_seconds,
                require_roles::text AS require_roles,
                is_public, disable_execution_logs, schedule, enabled, version,
                source, created_by, created_at, updated_at
            FROM procedures
            WHERE id = $1
            "#
            }
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(id))
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_procedure).transpose()
    }

    /// Retrieves a procedure by its natural key.
    pub async fn fetch_procedure_by_name(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ProcedureRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM procedures WHERE namespace = ? AND name = ?",
            DatabaseDriver::Postgres => {
                r#"
            SELECT
                id, namespace, name, description, sql_query, original_code,
                input_schema::text AS input_schema,
                output_schema::text AS output_schema,
                allowed_tables::text AS allowed_tables,
                allowed_schemas::text AS allowed_schemas,
                max_execution_time_seconds,
                require_roles::text AS require_roles,
                is_public, disable_execution_logs, schedule, enabled, version,
                source, created_by, created_at, updated_at
            FROM procedures
            WHERE namespace = $1 AND name = $2
            "#
            }
        };
        let row = sqlx::query(select)
            .bind(namespace)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_procedure).transpose()
    }

    /// Lists procedures, optionally restricted to one namespace.
    pub async fn list_procedures(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<ProcedureRecord>> {
        let mut rows = match namespace {
            Some(ns) => {
                let query = match self.driver {
                    DatabaseDriver::Sqlite => {
                        "SELECT * FROM procedures WHERE namespace = ? ORDER BY namespace ASC, name ASC"
                    }
                    DatabaseDriver::Postgres => {
                        r#"
                SELECT
                    id, namespace, name, description, sql_query, original_code,
                    input_schema::text AS input_schema,
                    output_schema::text AS output_schema,
                    allowed_tables::text AS allowed_tables,
                    allowed_schemas::text AS allowed_schemas,
                    max_execution_time_seconds,
                    require_roles::text AS require_roles,
                    is_public, disable_execution_logs, schedule, enabled, version,
                    source, created_by, created_at, updated_at
                FROM procedures
                WHERE namespace = $1
                ORDER BY namespace ASC, name ASC
                "#
                    }
                };
                sqlx::query(query).bind(ns).fetch(&self.pool)
            }
            None => {
                let query = match self.driver {
                    DatabaseDriver::Sqlite => {
                        "SELECT * FROM procedures ORDER BY namespace ASC, name ASC"
                    }
                    DatabaseDriver::Postgres => {
                        r#"
                SELECT
                    id, namespace, name, description, sql_query, original_code,
                    input_schema::text AS input_schema,
                    output_schema::text AS output_schema,
                    allowed_tables::text AS allowed_tables,
                    allowed_schemas::text AS allowed_schemas,
                    max_execution_time_seconds,
                    require_roles::text AS require_roles,
                    is_public, disable_execution_logs, schedule, enabled, version,
                    source, created_by, created_at, updated_at
                FROM procedures
                ORDER BY namespace ASC, name ASC
                "#
                    }
                };
                sqlx::query(query).fetch(&self.pool)
            }
        };

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_procedure(row)?);
        }
        Ok(out)
    }

    /// Returns every enabled procedure carrying a non-empty schedule.
    pub async fn list_scheduled_procedures(&self) -> Result<Vec<ProcedureRecord>> {
        let query = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT * FROM procedures WHERE enabled = 1 AND schedule IS NOT NULL AND schedule != ''"
            }
            DatabaseDriver::Postgres => {
                r#"
            SELECT
                id, namespace, name, description, sql_query, original_code,
                input_schema::text AS input_schema,
                output_schema::text AS output_schema,
                allowed_tables::text AS allowed_tables,
                allowed_schemas::text AS allowed_schemas,
                max_execution_time_seconds,
                require_roles::text AS require_roles,
                is_public, disable_execution_logs, schedule, enabled, version,
                source, created_by, created_at, updated_at
            FROM procedures
            WHERE enabled = true AND schedule IS NOT NULL AND schedule != ''
            "#
            }
        };
        let mut rows = sqlx::query(query).fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_procedure(row)?);
        }
        Ok(out)
    }

    /// Removes a procedure definition.
    pub async fn delete_procedure(&self, id: Uuid) -> Result<bool> {
        let delete = match self.driver {
            DatabaseDriver::Sqlite => "DELETE FROM procedures WHERE id = ?",
            DatabaseDriver::Postgres => "DELETE FROM procedures WHERE id = $1",
        };
        let result = sqlx::query(delete)
            .bind(encode_uuid(id))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Persists a fresh execution record in its initial state.
    pub async fn insert_execution(&self, data: NewExecution<'_>) -> Result<ExecutionRecord> {
        let now = Utc::now();
        let now_str = encode_datetime(now);
        let started_at = match data.status {
            ExecutionStatus::Running => Some(now_str.clone()),
            _ => None,
        };
        let params_json =
            serde_json::to_string(data.input_params).context("serialize execution input")?;

        match self.driver {
            DatabaseDriver::Sqlite => {
                sqlx::query(
                    r#"
                INSERT INTO executions (
                    id, procedure_id, procedure_name, namespace, status,
                    input_params, user_id, user_role, user_email, is_async,
                    created_at, started_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
                )
                .bind(encode_uuid(data.id))
                .bind(encode_uuid(data.procedure_id))
                .bind(data.procedure_name)
                .bind(data.namespace)
                .bind(data.status.as_str())
                .bind(params_json)
                .bind(data.user_id)
                .bind(data.user_role)
                .bind(data.user_email)
                .bind(data.is_async)
                .bind(now_str)
                .bind(started_at)
                .execute(&self.pool)
                .await?
            }
            DatabaseDriver::Postgres => {
                sqlx::query(
                    r#"
                INSERT INTO executions (
                    id, procedure_id, procedure_name, namespace, status,
                    input_params, user_id, user_role, user_email, is_async,
                    created_at, started_at
                ) VALUES ($1, $2, $3, $4, $5, CAST($6 AS JSONB), $7, $8, $9, $10, $11, $12)
                "#,
                )
                .bind(encode_uuid(data.id))
                .bind(encode_uuid(data.procedure_id))
                .bind(data.procedure_name)
                .bind(data.namespace)
                .bind(data.status.as_str())
                .bind(params_json)
                .bind(data.user_id)
                .bind(data.user_role)
                .bind(data.user_email)
                .bind(data.is_async)
                .bind(now_str)
                .bind(started_at)
                .execute(&self.pool)
                .await?
            }
        };

        self.fetch_execution(data.id)
            .await?
            .ok_or_else(|| anyhow!("execution inserted but missing when reloaded ({})", data.id))
    }

    /// Moves a pending execution to `running`. Returns false when the record
    /// already left `pending` (e.g. an external cancellation won the race).
    pub async fn mark_execution_running(&self, id: Uuid) -> Result<bool> {
        let now_str = encode_datetime(Utc::now());
        let update = match self.driver {
            DatabaseDriver::Sqlite => {
                "UPDATE executions SET status = 'running', started_at = ? WHERE id = ? AND status = 'pending'"
            }
            DatabaseDriver::Postgres => {
                "UPDATE executions SET status = 'running', started_at = $1 WHERE id = $2 AND status = 'pending'"
            }
        };
        let result = sqlx::query(update)
            .bind(now_str)
            .bind(encode_uuid(id))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Finalises a successful execution with its captured result set.
    pub async fn complete_execution(
        &self,
        id: Uuid,
        result: &Value,
        rows_returned: i64,
        duration_ms: i64,
    ) -> Result<()> {
        let now_str = encode_datetime(Utc::now());
        let result_json = serde_json::to_string(result).context("serialize execution result")?;
        let update = match self.driver {
            DatabaseDriver::Sqlite => {
                r#"
            UPDATE executions
            SET status = 'completed', result = ?, rows_returned = ?, duration_ms = ?, completed_at = ?
            WHERE id = ?
            "#
            }
            DatabaseDriver::Postgres => {
                r#"
            UPDATE executions
            SET status = 'completed', result = CAST($1 AS JSONB), rows_returned = $2, duration_ms = $3, completed_at = $4
            WHERE id = $5
            "#
            }
        };
        sqlx::query(update)
            .bind(result_json)
            .bind(rows_returned)
            .bind(duration_ms)
            .bind(now_str)
            .bind(encode_uuid(id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Finalises an execution in `failed` or `timeout` with its error text.
    pub async fn fail_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        error_message: &str,
        duration_ms: i64,
    ) -> Result<()> {
        debug_assert!(matches!(
            status,
            ExecutionStatus::Failed | ExecutionStatus::Timeout
        ));
        let now_str = encode_datetime(Utc::now());
        let update = match self.driver {
            DatabaseDriver::Sqlite => {
                r#"
            UPDATE executions
            SET status = ?, error_message = ?, duration_ms = ?, completed_at = ?
            WHERE id = ?
            "#
            }
            DatabaseDriver::Postgres => {
                r#"
            UPDATE executions
            SET status = $1, error_message = $2, duration_ms = $3, completed_at = $4
            WHERE id = $5
            "#
            }
        };
        sqlx::query(update)
            .bind(status.as_str())
            .bind(error_message)
            .bind(duration_ms)
            .bind(now_str)
            .bind(encode_uuid(id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Attempts an external cancellation. Only `pending` and `running`
    /// records may transition; the guard keeps terminal states terminal.
    pub async fn cancel_execution(&self, id: Uuid) -> Result<bool> {
        let now_str = encode_datetime(Utc::now());
        let update = match self.driver {
            DatabaseDriver::Sqlite => {
                r#"
            UPDATE executions
            SET status = 'cancelled', completed_at = ?
            WHERE id = ? AND status IN ('pending', 'running')
            "#
            }
            DatabaseDriver::Postgres => {
                r#"
            UPDATE executions
            SET status = 'cancelled', completed_at = $1
            WHERE id = $2 AND status IN ('pending', 'running')
            "#
            }
        };
        let result = sqlx::query(update)
            .bind(now_str)
            .bind(encode_uuid(id))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Retrieves an execution record by identifier.
    pub async fn fetch_execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM executions WHERE id = ?",
            DatabaseDriver::Postgres => {
                r#"
            SELECT
                id, procedure_id, procedure_name, namespace, status,
                input_params::text AS input_params,
                result::text AS result,
                error_message, rows_returned, duration_ms,
                user_id, user_role, user_email, is_async,
                created_at, started_at, completed_at
            FROM executions
            WHERE id = $1
            "#
            }
        };
        let row = sqlx::query(select)
            .bind(encode_uuid(id))
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_execution).transpose()
    }

    /// Lists execution records applying optional filters, newest first.
    pub async fn list_executions(
        &self,
        filters: ExecutionFilters<'_>,
    ) -> Result<Vec<ExecutionRecord>> {
        let select = match self.driver {
            DatabaseDriver::Sqlite => "SELECT * FROM executions",
            DatabaseDriver::Postgres => {
                r#"
            SELECT
                id, procedure_id, procedure_name, namespace, status,
                input_params::text AS input_params,
                result::text AS result,
                error_message, rows_returned, duration_ms,
                user_id, user_role, user_email, is_async,
                created_at, started_at, completed_at
            FROM executions
            "#
            }
        };

        let mut builder = QueryBuilder::new(select);
        let mut has_where = false;

        if let Some(namespace) = filters.namespace {
            builder.push(if has_where { " AND " } else { " WHERE " });
            has_where = true;
            builder.push("namespace = ");
            builder.push_bind(namespace);
        }

        if let Some(procedure_name) = filters.procedure_name {
            builder.push(if has_where { " AND " } else { " WHERE " });
            has_where = true;
            builder.push("procedure_name = ");
            builder.push_bind(procedure_name);
        }

        if let Some(status) = filters.status {
            builder.push(if has_where { " AND " } else { " WHERE " });
            has_where = true;
            builder.push("status = ");
            builder.push_bind(status.as_str());
        }

        if let Some(user_id) = filters.user_id {
            builder.push(if has_where { " AND " } else { " WHERE " });
            has_where = true;
            builder.push("user_id = ");
            builder.push_bind(user_id);
        }

        builder.push(" ORDER BY created_at DESC");
        let limit = filters.limit.unwrap_or(100).max(1) as i64;
        builder.push(" LIMIT ");
        builder.push_bind(limit);

        let mut rows = builder.build().fetch(&self.pool);
        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_execution(row)?);
        }
        Ok(out)
    }

    /// Appends a log line for an execution, assigning the next line number
    /// at emission time. Returns the assigned line number.
    pub async fn append_execution_log(
        &self,
        execution_id: Uuid,
        level: &str,
        message: &str,
    ) -> Result<i64> {
        let next = match self.driver {
            DatabaseDriver::Sqlite => {
                "SELECT COALESCE(MAX(line_no), 0) + 1 AS next_line FROM execution_logs WHERE execution_id = ?"
            }
            DatabaseDriver::Postgres => {
                "SELECT COALESCE(MAX(line_no), 0) + 1 AS next_line FROM execution_logs WHERE execution_id = $1"
            }
        };
        let row = sqlx::query(next)
            .bind(encode_uuid(execution_id))
            .fetch_one(&self.pool)
            .await?;
        let line_no: i64 = row.try_get("next_line")?;

        let insert = match self.driver {
            DatabaseDriver::Sqlite => {
                "INSERT INTO execution_logs (execution_id, line_no, level, message, created_at) VALUES (?, ?, ?, ?, ?)"
            }
            DatabaseDriver::Postgres => {
                "INSERT INTO execution_logs (execution_id, line_no, level, message, created_at) VALUES ($1, $2, $3, $4, $5)"
            }
        };
        sqlx::query(insert)
            .bind(encode_uuid(execution_id))
            .bind(line_no)
            .bind(level)
            .bind(message)
            .bind(encode_datetime(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(line_no)
    }

    /// Returns log lines for an execution in ascending line order,
    /// optionally only the lines after the given one.
    pub async fn list_execution_logs(
        &self,
        execution_id: Uuid,
        after: Option<i64>,
    ) -> Result<Vec<ExecutionLogLine>> {
        let mut rows = match after {
            Some(line) => {
                let query = match self.driver {
                    DatabaseDriver::Sqlite => {
                        "SELECT * FROM execution_logs WHERE execution_id = ? AND line_no > ? ORDER BY line_no ASC"
                    }
                    DatabaseDriver::Postgres => {
                        "SELECT * FROM execution_logs WHERE execution_id = $1 AND line_no > $2 ORDER BY line_no ASC"
                    }
                };
                sqlx::query(query)
                    .bind(encode_uuid(execution_id))
                    .bind(line)
                    .fetch(&self.pool)
            }
            None => {
                let query = match self.driver {
                    DatabaseDriver::Sqlite => {
                        "SELECT * FROM execution_logs WHERE execution_id = ? ORDER BY line_no ASC"
                    }
                    DatabaseDriver::Postgres => {
                        "SELECT * FROM execution_logs WHERE execution_id = $1 ORDER BY line_no ASC"
                    }
                };
                sqlx::query(query)
                    .bind(encode_uuid(execution_id))
                    .fetch(&self.pool)
            }
        };

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_execution_log(row)?);
        }
        Ok(out)
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                matches!(code.as_ref(), "2067" | "1555" | "23505")
            } else {
                db_err.message().contains("UNIQUE") || db_err.message().contains("unique")
            }
        }
        _ => false,
    }
}

fn parse_datetime(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid RFC3339 timestamp '{}': {}", value, err))
}

fn encode_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn encode_uuid(value: Uuid) -> String {
    value.to_string()
}

fn parse_uuid(value: String) -> Result<Uuid> {
    Uuid::parse_str(&value).map_err(|err| anyhow!("invalid UUID '{}': {}", value, err))
}

fn encode_schema(value: Option<&BTreeMap<String, String>>) -> Result<Option<String>> {
    value
        .map(|map| serde_json::to_string(map).context("serialize schema map"))
        .transpose()
}

fn encode_string_list(values: &[String]) -> Result<String> {
    serde_json::to_string(values).context("serialize string list")
}

fn decode_datetime(row: &AnyRow, column: &str) -> Result<DateTime<Utc>> {
    let raw: String = row.try_get(column)?;
    parse_datetime(raw)
}

fn decode_optional_datetime(row: &AnyRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    match row.try_get::<Option<String>, _>(column)? {
        Some(raw) => parse_datetime(raw).map(Some),
        None => Ok(None),
    }
}

fn decode_bool(row: &AnyRow, column: &str) -> Result<bool> {
    match row.try_get::<bool, _>(column) {
        Ok(value) => Ok(value),
        Err(_) => {
            let raw: i64 = row.try_get(column)?;
            Ok(raw != 0)
        }
    }
}

fn decode_optional_string(row: &AnyRow, column: &str) -> Result<Option<String>> {
    Ok(row.try_get::<Option<String>, _>(column)?)
}

fn decode_string_list(row: &AnyRow, column: &str) -> Result<Vec<String>> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to deserialize JSON array column '{column}'"))
}

/// Decodes `require_roles`, tolerating the deprecated scalar form by
/// promoting a non-empty bare string to a one-element list.
fn decode_role_list(row: &AnyRow, column: &str) -> Result<Vec<String>> {
    let raw: String = row.try_get(column)?;
    match serde_json::from_str::<Vec<String>>(&raw) {
        Ok(list) => Ok(list),
        Err(_) if raw.trim().is_empty() => Ok(Vec::new()),
        Err(_) => Ok(vec![raw.trim().to_owned()]),
    }
}

fn decode_schema_map(row: &AnyRow, column: &str) -> Result<Option<BTreeMap<String, String>>> {
    match row.try_get::<Option<String>, _>(column)? {
        Some(raw) if !raw.is_empty() => serde_json::from_str(&raw)
            .with_context(|| format!("failed to deserialize schema column '{column}'"))
            .map(Some),
        _ => Ok(None),
    }
}

fn decode_json_value(row: &AnyRow, column: &str, ctx: &str) -> Result<Value> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).with_context(|| ctx.to_owned())
}

fn decode_optional_json_value(row: &AnyRow, column: &str, ctx: &str) -> Result<Option<Value>> {
    match row.try_get::<Option<String>, _>(column)? {
        Some(raw) => serde_json::from_str(&raw).with_context(|| ctx.to_owned()).map(Some),
        None => Ok(None),
    }
}

fn map_procedure(row: AnyRow) -> Result<ProcedureRecord> {
    let id = parse_uuid(row.try_get::<String, _>("id")?)?;
    let source: String = row.try_get("source")?;
    let schedule = decode_optional_string(&row, "schedule")?.filter(|s| !s.is_empty());

    Ok(ProcedureRecord {
        id,
        namespace: row.try_get("namespace")?,
        name: row.try_get("name")?,
        description: decode_optional_string(&row, "description")?,
        sql_query: row.try_get("sql_query")?,
        original_code: row.try_get("original_code")?,
        input_schema: decode_schema_map(&row, "input_schema")?,
        output_schema: decode_schema_map(&row, "output_schema")?,
        allowed_tables: decode_string_list(&row, "allowed_tables")?,
        allowed_schemas: decode_string_list(&row, "allowed_schemas")?,
        max_execution_time_seconds: row.try_get("max_execution_time_seconds")?,
        require_roles: decode_role_list(&row, "require_roles")?,
        is_public: decode_bool(&row, "is_public")?,
        disable_execution_logs: decode_bool(&row, "disable_execution_logs")?,
        schedule,
        enabled: decode_bool(&row, "enabled")?,
        version: row.try_get("version")?,
        source: ProcedureSource::from_str(&source)?,
        created_by: decode_optional_string(&row, "created_by")?,
        created_at: decode_datetime(&row, "created_at")?,
        updated_at: decode_datetime(&row, "updated_at")?,
    })
}

fn map_execution(row: AnyRow) -> Result<ExecutionRecord> {
    let id = parse_uuid(row.try_get::<String, _>("id")?)?;
    let procedure_id = parse_uuid(row.try_get::<String, _>("procedure_id")?)?;
    let status: String = row.try_get("status")?;

    Ok(ExecutionRecord {
        id,
        procedure_id,
        procedure_name: row.try_get("procedure_name")?,
        namespace: row.try_get("namespace")?,
        status: ExecutionStatus::from_str(&status)?,
        input_params: decode_json_value(&row, "input_params", "failed to deserialize input params")?,
        result: decode_optional_json_value(&row, "result", "failed to deserialize result")?,
        error_message: decode_optional_string(&row, "error_message")?,
        rows_returned: row.try_get("rows_returned")?,
        duration_ms: row.try_get("duration_ms")?,
        user_id: decode_optional_string(&row, "user_id")?,
        user_role: decode_optional_string(&row, "user_role")?,
        user_email: decode_optional_string(&row, "user_email")?,
        is_async: decode_bool(&row, "is_async")?,
        created_at: decode_datetime(&row, "created_at")?,
        started_at: decode_optional_datetime(&row, "started_at")?,
        completed_at: decode_optional_datetime(&row, "completed_at")?,
    })
}

fn map_execution_log(row: AnyRow) -> Result<ExecutionLogLine> {
    let execution_id = parse_uuid(row.try_get::<String, _>("execution_id")?)?;
    Ok(ExecutionLogLine {
        execution_id,
        line_no: row.try_get("line_no")?,
        level: row.try_get("level")?,
        message: row.try_get("message")?,
        created_at: decode_datetime(&row, "created_at")?,
    })
}

/// Errors returned by the procedure catalog.
#[derive(Debug, Error, Clone)]
pub enum ProcedureError {
    #[error("procedure '{1}' already exists in namespace '{0}'")]
    Duplicate(String, String),
    #[error("procedure '{0}' not found")]
    NotFound(Uuid),
}

/// Input payload for procedure creation.
#[derive(Debug, Clone)]
pub struct NewProcedure<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub sql_query: &'a str,
    pub original_code: &'a str,
    pub input_schema: Option<&'a BTreeMap<String, String>>,
    pub output_schema: Option<&'a BTreeMap<String, String>>,
    pub allowed_tables: &'a [String],
    pub allowed_schemas: &'a [String],
    pub max_execution_time_seconds: i64,
    pub require_roles: &'a [String],
    pub is_public: bool,
    pub disable_execution_logs: bool,
    pub schedule: Option<&'a str>,
    pub enabled: bool,
    pub source: ProcedureSource,
    pub created_by: Option<&'a str>,
}

/// Updatable fields for an existing procedure. Applying these always bumps
/// the version.
#[derive(Debug, Clone)]
pub struct ProcedureChanges<'a> {
    pub description: Option<&'a str>,
    pub sql_query: &'a str,
    pub original_code: &'a str,
    pub input_schema: Option<&'a BTreeMap<String, String>>,
    pub output_schema: Option<&'a BTreeMap<String, String>>,
    pub allowed_tables: &'a [String],
    pub allowed_schemas: &'a [String],
    pub max_execution_time_seconds: i64,
    pub require_roles: &'a [String],
    pub is_public: bool,
    pub disable_execution_logs: bool,
    pub schedule: Option<&'a str>,
    pub enabled: bool,
}

/// Input payload for a new execution record.
#[derive(Debug, Clone)]
pub struct NewExecution<'a> {
    pub id: Uuid,
    pub procedure_id: Uuid,
    pub procedure_name: &'a str,
    pub namespace: &'a str,
    pub status: ExecutionStatus,
    pub input_params: &'a Value,
    pub user_id: Option<&'a str>,
    pub user_role: Option<&'a str>,
    pub user_email: Option<&'a str>,
    pub is_async: bool,
}

/// Filters applied when listing executions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilters<'a> {
    pub namespace: Option<&'a str>,
    pub procedure_name: Option<&'a str>,
    pub status: Option<ExecutionStatus>,
    pub user_id: Option<&'a str>,
    pub limit: Option<u32>,
}

/// Persisted procedure definition row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcedureRecord {
    pub id: Uuid,
    pub namespace: String,
    pub name: String,
    pub description: Option<String>,
    pub sql_query: String,
    pub original_code: String,
    pub input_schema: Option<BTreeMap<String, String>>,
    pub output_schema: Option<BTreeMap<String, String>>,
    pub allowed_tables: Vec<String>,
    pub allowed_schemas: Vec<String>,
    pub max_execution_time_seconds: i64,
    pub require_roles: Vec<String>,
    pub is_public: bool,
    pub disable_execution_logs: bool,
    pub schedule: Option<String>,
    pub enabled: bool,
    pub version: i64,
    pub source: ProcedureSource,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcedureRecord {
    /// Effective per-invocation timeout; non-positive declarations fall back
    /// to the engine default.
    pub fn execution_timeout(&self) -> Duration {
        let secs = if self.max_execution_time_seconds > 0 {
            self.max_execution_time_seconds
        } else {
            DEFAULT_EXECUTION_TIMEOUT_SECS
        };
        Duration::from_secs(secs as u64)
    }

    /// Scheduler entry key.
    pub fn schedule_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// One attempted run of a procedure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub procedure_id: Uuid,
    pub procedure_name: String,
    pub namespace: String,
    pub status: ExecutionStatus,
    pub input_params: Value,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub rows_returned: i64,
    pub duration_ms: i64,
    pub user_id: Option<String>,
    pub user_role: Option<String>,
    pub user_email: Option<String>,
    pub is_async: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One line emitted through the execution log channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionLogLine {
    pub execution_id: Uuid,
    pub line_no: i64,
    pub level: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Execution lifecycle statuses persisted in the DB (also used in API responses).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Timeout => "timeout",
        }
    }

    /// Terminal states admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Timeout
        )
    }
}

impl FromStr for ExecutionStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            "timeout" => Ok(ExecutionStatus::Timeout),
            other => Err(anyhow!("unknown execution status: {other}")),
        }
    }
}

/// Origin of a procedure definition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureSource {
    Filesystem,
    Api,
    Sdk,
}

impl ProcedureSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcedureSource::Filesystem => "filesystem",
            ProcedureSource::Api => "api",
            ProcedureSource::Sdk => "sdk",
        }
    }
}

impl FromStr for ProcedureSource {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "filesystem" => Ok(ProcedureSource::Filesystem),
            "api" => Ok(ProcedureSource::Api),
            "sdk" => Ok(ProcedureSource::Sdk),
            other => Err(anyhow!("unknown procedure source: {other}")),
        }
    }
}
