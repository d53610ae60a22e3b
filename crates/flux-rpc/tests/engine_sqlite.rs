//! End-to-end engine tests against an in-memory SQLite database.

use std::time::Duration;

use serde_json::{json, Map, Value};

use flux_rpc::executor::{
    CallerIdentity, EngineConfig, ExecutionContext, ProcedureExecutor,
};
use flux_rpc::metrics::RpcMetrics;
use flux_rpc::scheduler::{ProcedureScheduler, SchedulerConfig};
use flux_rpc::sync::{SyncEngine, SyncOptions, SyncRequest};
use flux_rpc::{
    Database, ExecutionFilters, ExecutionStatus, NewProcedure, ProcedureRecord, ProcedureSource,
};

async fn setup() -> (Database, ProcedureExecutor) {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    sqlx::query("CREATE TABLE orders (id INTEGER PRIMARY KEY, user_id TEXT NOT NULL, total REAL)")
        .execute(db.pool())
        .await
        .unwrap();
    for (user, total) in [("u1", 10.0), ("u1", 20.0), ("u2", 5.0)] {
        sqlx::query("INSERT INTO orders (user_id, total) VALUES (?, ?)")
            .bind(user)
            .bind(total)
            .execute(db.pool())
            .await
            .unwrap();
    }
    let executor = ProcedureExecutor::new(
        db.clone(),
        EngineConfig::default(),
        RpcMetrics::new().unwrap(),
    );
    (db, executor)
}

fn caller(user_id: &str, role: &str) -> CallerIdentity {
    CallerIdentity {
        user_id: Some(user_id.to_string()),
        role: role.to_string(),
        email: None,
        claims: json!({"sub": user_id, "role": role}),
        is_authenticated: true,
    }
}

fn params(value: Value) -> Map<String, Value> {
    value.as_object().unwrap().clone()
}

async fn count_orders(db: &Database, allowed_tables: &[String]) -> ProcedureRecord {
    let schema = [("user_id".to_string(), "uuid".to_string())]
        .into_iter()
        .collect();
    db.create_procedure(NewProcedure {
        namespace: "public",
        name: "count_orders",
        description: Some("count a user's orders"),
        sql_query: "SELECT COUNT(*) AS n FROM orders WHERE user_id = $user_id",
        original_code: "SELECT COUNT(*) AS n FROM orders WHERE user_id = $user_id\n",
        input_schema: Some(&schema),
        output_schema: None,
        allowed_tables,
        allowed_schemas: &[],
        max_execution_time_seconds: 30,
        require_roles: &[],
        is_public: false,
        disable_execution_logs: false,
        schedule: None,
        enabled: true,
        source: ProcedureSource::Api,
        created_by: None,
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn happy_path_select() {
    let (db, executor) = setup().await;
    let procedure = count_orders(&db, &["orders".to_string()]).await;

    let ctx = ExecutionContext::new(
        procedure,
        params(json!({"user_id": "u1"})),
        caller("u1", "user"),
    );
    let result = executor.execute(ctx).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.rows_returned, 1);
    assert_eq!(result.result, Some(json!([{"n": 2}])));
    assert!(result.error.is_none());

    let record = db.fetch_execution(result.execution_id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(record.user_id.as_deref(), Some("u1"));
    assert_eq!(record.rows_returned, 1);
    assert!(record.started_at.is_some());
    assert!(record.completed_at.is_some());

    let logs = db
        .list_execution_logs(result.execution_id, None)
        .await
        .unwrap();
    assert!(!logs.is_empty());
    assert_eq!(logs[0].line_no, 1);
}

#[tokio::test]
async fn disallowed_table_fails_before_execution() {
    let (db, executor) = setup().await;
    let procedure = count_orders(&db, &["customers".to_string()]).await;

    let ctx = ExecutionContext::new(
        procedure,
        params(json!({"user_id": "u1"})),
        caller("u1", "user"),
    );
    let result = executor.execute(ctx).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result
        .error
        .as_deref()
        .unwrap()
        .contains("Table not allowed: orders"));

    let record = db.fetch_execution(result.execution_id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn missing_required_parameter_fails() {
    let (db, executor) = setup().await;
    let procedure = count_orders(&db, &["orders".to_string()]).await;

    let ctx = ExecutionContext::new(procedure, params(json!({})), caller("u1", "user"));
    let result = executor.execute(ctx).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(
        result.error.as_deref(),
        Some("missing required parameter: user_id")
    );
}

#[tokio::test]
async fn caller_params_are_available_to_the_template() {
    let (db, executor) = setup().await;
    let procedure = db
        .create_procedure(NewProcedure {
            namespace: "public",
            name: "whoami",
            description: None,
            sql_query: "SELECT $caller_role AS role, $caller_id AS id",
            original_code: "SELECT $caller_role AS role, $caller_id AS id",
            input_schema: None,
            output_schema: None,
            allowed_tables: &[],
            allowed_schemas: &[],
            max_execution_time_seconds: 30,
            require_roles: &[],
            is_public: true,
            disable_execution_logs: false,
            schedule: None,
            enabled: true,
            source: ProcedureSource::Api,
            created_by: None,
        })
        .await
        .unwrap();

    let ctx = ExecutionContext::new(procedure, Map::new(), caller("u7", "analyst"));
    let result = executor.execute(ctx).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.result, Some(json!([{"role": "analyst", "id": "u7"}])));
}

#[tokio::test]
async fn disabled_logs_sync_invocation_leaves_no_record() {
    let (db, executor) = setup().await;
    let mut procedure = count_orders(&db, &["orders".to_string()]).await;
    procedure.disable_execution_logs = true;

    let ctx = ExecutionContext::new(
        procedure.clone(),
        params(json!({"user_id": "u1"})),
        caller("u1", "user"),
    );
    let first = executor.execute(ctx).await.unwrap();
    assert_eq!(first.status, ExecutionStatus::Completed);
    assert!(db.fetch_execution(first.execution_id).await.unwrap().is_none());

    // The returned id is still fresh and unique per invocation.
    let ctx = ExecutionContext::new(
        procedure,
        params(json!({"user_id": "u1"})),
        caller("u1", "user"),
    );
    let second = executor.execute(ctx).await.unwrap();
    assert_ne!(first.execution_id, second.execution_id);
}

#[tokio::test]
async fn async_execution_is_pollable_even_with_logs_disabled() {
    let (db, executor) = setup().await;
    let mut procedure = count_orders(&db, &["orders".to_string()]).await;
    procedure.disable_execution_logs = true;

    let mut ctx = ExecutionContext::new(
        procedure,
        params(json!({"user_id": "u2"})),
        caller("u2", "user"),
    );
    ctx.disable_execution_logs = true;
    let dispatched = executor.execute_async(ctx).await.unwrap();
    assert_eq!(dispatched.status, ExecutionStatus::Pending);

    let mut finished = None;
    for _ in 0..200 {
        let record = db
            .fetch_execution(dispatched.execution_id)
            .await
            .unwrap()
            .expect("async record must exist");
        if record.status.is_terminal() {
            finished = Some(record);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let record = finished.expect("async execution never finished");
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert!(record.is_async);
    assert_eq!(record.result, Some(json!([{"n": 1}])));
}

#[tokio::test]
async fn cancelled_pending_execution_is_not_picked_up() {
    let (db, executor) = setup().await;
    let procedure = count_orders(&db, &["orders".to_string()]).await;

    let input = json!({"user_id": "u1"});
    let id = uuid::Uuid::new_v4();
    db.insert_execution(flux_rpc::NewExecution {
        id,
        procedure_id: procedure.id,
        procedure_name: &procedure.name,
        namespace: &procedure.namespace,
        status: ExecutionStatus::Pending,
        input_params: &input,
        user_id: Some("u1"),
        user_role: Some("user"),
        user_email: None,
        is_async: true,
    })
    .await
    .unwrap();
    assert!(db.cancel_execution(id).await.unwrap());

    let mut ctx = ExecutionContext::new(
        procedure,
        params(json!({"user_id": "u1"})),
        caller("u1", "user"),
    );
    ctx.is_async = true;
    ctx.execution_id = Some(id);

    let result = executor.execute(ctx).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);

    let record = db.fetch_execution(id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn non_positive_timeout_falls_back_to_default() {
    let (db, _) = setup().await;
    let mut procedure = count_orders(&db, &[]).await;
    procedure.max_execution_time_seconds = 0;
    assert_eq!(procedure.execution_timeout(), Duration::from_secs(30));
    procedure.max_execution_time_seconds = -5;
    assert_eq!(procedure.execution_timeout(), Duration::from_secs(30));
    procedure.max_execution_time_seconds = 7;
    assert_eq!(procedure.execution_timeout(), Duration::from_secs(7));
}

#[tokio::test]
async fn max_rows_cap_truncates_results() {
    let (db, _) = setup().await;
    let executor = ProcedureExecutor::new(
        db.clone(),
        EngineConfig {
            default_max_rows: 2,
        },
        RpcMetrics::new().unwrap(),
    );
    let procedure = db
        .create_procedure(NewProcedure {
            namespace: "public",
            name: "all_orders",
            description: None,
            sql_query: "SELECT id FROM orders",
            original_code: "SELECT id FROM orders",
            input_schema: None,
            output_schema: None,
            allowed_tables: &[],
            allowed_schemas: &[],
            max_execution_time_seconds: 30,
            require_roles: &[],
            is_public: true,
            disable_execution_logs: false,
            schedule: None,
            enabled: true,
            source: ProcedureSource::Api,
            created_by: None,
        })
        .await
        .unwrap();

    let ctx = ExecutionContext::new(procedure, Map::new(), caller("u1", "user"));
    let result = executor.execute(ctx).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.rows_returned, 2);
}

#[tokio::test]
async fn execution_listing_filters() {
    let (db, executor) = setup().await;
    let procedure = count_orders(&db, &["orders".to_string()]).await;

    for user in ["u1", "u2"] {
        let ctx = ExecutionContext::new(
            procedure.clone(),
            params(json!({"user_id": user})),
            caller(user, "user"),
        );
        executor.execute(ctx).await.unwrap();
    }

    let all = db
        .list_executions(ExecutionFilters::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    let mine = db
        .list_executions(ExecutionFilters {
            user_id: Some("u1"),
            ..ExecutionFilters::default()
        })
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].user_id.as_deref(), Some("u1"));

    let completed = db
        .list_executions(ExecutionFilters {
            status: Some(ExecutionStatus::Completed),
            namespace: Some("public"),
            ..ExecutionFilters::default()
        })
        .await
        .unwrap();
    assert_eq!(completed.len(), 2);
}

#[tokio::test]
async fn filesystem_sync_creates_and_scheduler_registers() {
    let (db, executor) = setup().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("cron")).unwrap();
    std::fs::write(
        dir.path().join("cron/tick.sql"),
        "-- @fluxbase:schedule */5 * * * *\nSELECT 1 AS one\n",
    )
    .unwrap();

    let sync = SyncEngine::new(db.clone()).with_procedures_dir(dir.path());
    let outcome = sync
        .sync(SyncRequest {
            namespace: "cron".to_string(),
            procedures: Vec::new(),
            options: SyncOptions::default(),
        })
        .await
        .unwrap();
    assert_eq!(outcome.created, vec!["tick".to_string()]);

    let record = db
        .fetch_procedure_by_name("cron", "tick")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.source, ProcedureSource::Filesystem);
    assert_eq!(record.schedule.as_deref(), Some("*/5 * * * *"));

    let scheduler = ProcedureScheduler::new(db.clone(), executor, SchedulerConfig::default());
    scheduler.start();
    // The startup load runs in the background; give it a moment.
    for _ in 0..100 {
        if scheduler.has_entry("cron/tick") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(scheduler.has_entry("cron/tick"));
    scheduler.shutdown().await;
}

#[tokio::test]
async fn annotated_code_round_trips_into_stored_fields() {
    let (db, _) = setup().await;
    let code = "\
-- @fluxbase:name monthly
-- @fluxbase:description Monthly rollup
-- @fluxbase:input user_id:uuid,limit?:number
-- @fluxbase:allowed-tables orders
-- @fluxbase:allowed-schemas analytics
-- @fluxbase:max-execution-time 2m
-- @fluxbase:require-role admin
-- @fluxbase:public yes
SELECT COUNT(*) AS n FROM analytics.orders WHERE user_id = $user_id
";

    let sync = SyncEngine::new(db.clone());
    sync.sync(SyncRequest {
        namespace: "reports".to_string(),
        procedures: vec![flux_rpc::sync::ProcedureSpec {
            name: "ignored_stem".to_string(),
            code: code.to_string(),
        }],
        options: SyncOptions::default(),
    })
    .await
    .unwrap();

    let record = db
        .fetch_procedure_by_name("reports", "monthly")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.description.as_deref(), Some("Monthly rollup"));
    assert_eq!(
        record.sql_query,
        "SELECT COUNT(*) AS n FROM analytics.orders WHERE user_id = $user_id"
    );
    assert_eq!(record.original_code, code);
    assert_eq!(record.allowed_tables, vec!["orders".to_string()]);
    assert_eq!(record.allowed_schemas, vec!["analytics".to_string()]);
    assert_eq!(record.max_execution_time_seconds, 120);
    assert_eq!(record.require_roles, vec!["admin".to_string()]);
    assert!(record.is_public);
    let schema = record.input_schema.unwrap();
    assert_eq!(schema.get("user_id").unwrap(), "uuid");
    assert_eq!(schema.get("limit?").unwrap(), "number");
}

#[tokio::test]
async fn cron_tick_synthesises_a_service_role_execution() {
    let (db, executor) = setup().await;
    db.create_procedure(NewProcedure {
        namespace: "cron",
        name: "heartbeat",
        description: None,
        sql_query: "SELECT 1 AS one",
        original_code: "SELECT 1 AS one",
        input_schema: None,
        output_schema: None,
        allowed_tables: &[],
        allowed_schemas: &[],
        max_execution_time_seconds: 30,
        require_roles: &[],
        is_public: false,
        disable_execution_logs: false,
        // Every second, so the test observes a tick quickly.
        schedule: Some("* * * * * *"),
        enabled: true,
        source: ProcedureSource::Api,
        created_by: None,
    })
    .await
    .unwrap();

    let scheduler = ProcedureScheduler::new(db.clone(), executor, SchedulerConfig::default());
    scheduler.start();

    let mut record = None;
    for _ in 0..600 {
        let listed = db
            .list_executions(ExecutionFilters {
                namespace: Some("cron"),
                status: Some(ExecutionStatus::Completed),
                ..ExecutionFilters::default()
            })
            .await
            .unwrap();
        if let Some(first) = listed.into_iter().next() {
            record = Some(first);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    scheduler.shutdown().await;

    let record = record.expect("no scheduled execution observed");
    assert_eq!(record.user_role.as_deref(), Some("service_role"));
    assert_eq!(record.user_id, None);
    assert_eq!(record.input_params["_trigger"], json!("cron"));
    assert!(record.input_params.get("_scheduled_at").is_some());
}

#[tokio::test]
async fn disabled_procedure_does_not_run_at_tick() {
    let (db, executor) = setup().await;
    let record = db
        .create_procedure(NewProcedure {
            namespace: "cron",
            name: "paused",
            description: None,
            sql_query: "SELECT 1",
            original_code: "SELECT 1",
            input_schema: None,
            output_schema: None,
            allowed_tables: &[],
            allowed_schemas: &[],
            max_execution_time_seconds: 30,
            require_roles: &[],
            is_public: false,
            disable_execution_logs: false,
            schedule: Some("* * * * * *"),
            enabled: true,
            source: ProcedureSource::Api,
            created_by: None,
        })
        .await
        .unwrap();

    let scheduler = ProcedureScheduler::new(db.clone(), executor, SchedulerConfig::default());
    scheduler.register(&record);

    // Disable between registration and the first tick; the tick must bail.
    sqlx::query("UPDATE procedures SET enabled = 0 WHERE id = ?")
        .bind(record.id.to_string())
        .execute(db.pool())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(2_200)).await;
    scheduler.shutdown().await;

    let listed = db
        .list_executions(ExecutionFilters {
            namespace: Some("cron"),
            ..ExecutionFilters::default()
        })
        .await
        .unwrap();
    assert!(listed.is_empty(), "disabled procedure must not run");
}
