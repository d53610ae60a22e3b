//! Cron-driven trigger for procedures that declare a `schedule`.
//!
//! Each scheduled procedure gets one entry keyed `namespace/name`, backed by
//! a spawned loop that sleeps until the next cron occurrence. Entries hold a
//! cancellation token so re-registration and shutdown are immediate. At most
//! `max_concurrent` scheduled runs are in flight at once; ticks beyond the
//! cap are dropped with a warning rather than queued.

use std::{collections::HashMap, str::FromStr, sync::Arc, time::Duration};

use chrono::Utc;
use cron::Schedule;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::{CallerIdentity, ExecutionContext, ProcedureExecutor};
use crate::{Database, ProcedureRecord};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cap on simultaneously running scheduled executions.
    pub max_concurrent: usize,
    /// Startup attempts at loading the scheduled set.
    pub load_retries: u32,
    /// First retry delay; doubled per attempt.
    pub initial_backoff: Duration,
    /// How long shutdown waits for in-flight runs.
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            load_retries: 5,
            initial_backoff: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Accepts both 5-field (standard) and 6-field (leading seconds) cron
/// expressions; the parser wants seconds, so 5-field input gains a zero
/// seconds column.
pub fn normalize_cron(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expr.trim())
    } else {
        expr.trim().to_string()
    }
}

/// Owns the entry map and drives scheduled invocations.
#[derive(Clone)]
pub struct ProcedureScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    db: Database,
    executor: ProcedureExecutor,
    config: SchedulerConfig,
    entries: RwLock<HashMap<String, CancellationToken>>,
    active: Mutex<usize>,
    root: CancellationToken,
}

impl ProcedureScheduler {
    pub fn new(db: Database, executor: ProcedureExecutor, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                db,
                executor,
                config,
                entries: RwLock::new(HashMap::new()),
                active: Mutex::new(0),
                root: CancellationToken::new(),
            }),
        }
    }

    /// Begins accepting cron ticks immediately; loading the scheduled set
    /// retries in the background so a racy database during boot does not
    /// block the service.
    pub fn start(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut backoff = inner.config.initial_backoff;
            for attempt in 1..=inner.config.load_retries {
                match inner.db.list_scheduled_procedures().await {
                    Ok(procedures) => {
                        info!(count = procedures.len(), "registering scheduled procedures");
                        for procedure in &procedures {
                            register(&inner, procedure);
                        }
                        return;
                    }
                    Err(error) => {
                        warn!(%error, attempt, "failed to load scheduled procedures; retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = inner.root.cancelled() => return,
                        }
                        backoff *= 2;
                    }
                }
            }
            warn!(
                attempts = inner.config.load_retries,
                "giving up on loading scheduled procedures"
            );
        });
    }

    /// Registers (or replaces) the entry for one procedure.
    pub fn register(&self, procedure: &ProcedureRecord) {
        register(&self.inner, procedure);
    }

    /// Removes the entry for the given `namespace/name` key, if present.
    pub fn unregister(&self, key: &str) {
        if let Some(token) = self.inner.entries.write().remove(key) {
            token.cancel();
        }
    }

    /// Unregisters and, when the procedure is enabled with a non-empty
    /// schedule, registers again with the current configuration.
    pub fn reschedule(&self, procedure: &ProcedureRecord) {
        self.unregister(&procedure.schedule_key());
        let has_schedule = procedure
            .schedule
            .as_deref()
            .map_or(false, |s| !s.is_empty());
        if procedure.enabled && has_schedule {
            register(&self.inner, procedure);
        }
    }

    pub fn has_entry(&self, key: &str) -> bool {
        self.inner.entries.read().contains_key(key)
    }

    pub fn entry_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Stops accepting ticks and waits for in-flight runs, bounded by the
    /// configured grace period.
    pub async fn shutdown(&self) {
        self.inner.root.cancel();
        for (_, token) in self.inner.entries.write().drain() {
            token.cancel();
        }

        let deadline = tokio::time::Instant::now() + self.inner.config.shutdown_grace;
        loop {
            if *self.inner.active.lock() == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("scheduler shutdown grace elapsed with runs still in flight");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("scheduler stopped");
    }
}

fn register(inner: &Arc<SchedulerInner>, procedure: &ProcedureRecord) {
    let Some(schedule_expr) = procedure.schedule.as_deref() else {
        return;
    };
    let key = procedure.schedule_key();
    let schedule = match Schedule::from_str(&normalize_cron(schedule_expr)) {
        Ok(schedule) => schedule,
        Err(error) => {
            warn!(entry = %key, %error, "invalid cron expression; entry not registered");
            return;
        }
    };

    let token = inner.root.child_token();
    if let Some(previous) = inner.entries.write().insert(key.clone(), token.clone()) {
        previous.cancel();
    }

    let inner = inner.clone();
    let namespace = procedure.namespace.clone();
    let name = procedure.name.clone();
    tokio::spawn(async move {
        info!(entry = %key, "scheduler entry started");
        loop {
            let now = Utc::now();
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!(entry = %key, "no upcoming cron occurrences");
                break;
            };
            let until = (next - now).to_std().unwrap_or(Duration::from_secs(1));
            tokio::select! {
                _ = tokio::time::sleep(until) => fire(&inner, &key, &namespace, &name).await,
                _ = token.cancelled() => break,
            }
        }
        debug!(entry = %key, "scheduler entry stopped");
    });
}

async fn fire(inner: &Arc<SchedulerInner>, key: &str, namespace: &str, name: &str) {
    {
        let mut active = inner.active.lock();
        if *active >= inner.config.max_concurrent {
            warn!(entry = %key, active = *active, "scheduled run dropped: concurrency cap reached");
            return;
        }
        *active += 1;
    }

    // Schedule-time configuration is authoritative: re-fetch and bail out
    // silently when the procedure vanished or was disabled meanwhile.
    match inner.db.fetch_procedure_by_name(namespace, name).await {
        Ok(Some(procedure)) if procedure.enabled => {
            let mut params = Map::new();
            params.insert("_trigger".to_string(), json!("cron"));
            params.insert(
                "_scheduled_at".to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
            let ctx = ExecutionContext::new(procedure, params, CallerIdentity::service_role());
            if let Err(error) = inner.executor.execute(ctx).await {
                warn!(entry = %key, %error, "scheduled execution failed to run");
            }
        }
        Ok(_) => {
            debug!(entry = %key, "procedure missing or disabled at tick");
        }
        Err(error) => {
            warn!(entry = %key, %error, "failed to re-fetch procedure at tick");
        }
    }

    *inner.active.lock() -= 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::EngineConfig;
    use crate::metrics::RpcMetrics;
    use crate::{NewProcedure, ProcedureSource};

    #[test]
    fn five_field_expressions_gain_a_seconds_column() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("0 0 * * 1"), "0 0 0 * * 1");
    }

    #[test]
    fn six_field_expressions_pass_through() {
        assert_eq!(normalize_cron("30 */5 * * * *"), "30 */5 * * * *");
    }

    #[test]
    fn normalized_expressions_parse() {
        assert!(Schedule::from_str(&normalize_cron("*/5 * * * *")).is_ok());
        assert!(Schedule::from_str(&normalize_cron("15 2 * * *")).is_ok());
        assert!(Schedule::from_str(&normalize_cron("not a schedule")).is_err());
    }

    async fn scheduler() -> ProcedureScheduler {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let executor = ProcedureExecutor::new(
            db.clone(),
            EngineConfig::default(),
            RpcMetrics::new().unwrap(),
        );
        ProcedureScheduler::new(db, executor, SchedulerConfig::default())
    }

    async fn scheduled_record(
        scheduler: &ProcedureScheduler,
        name: &str,
        schedule: &str,
    ) -> crate::ProcedureRecord {
        scheduler
            .inner
            .db
            .create_procedure(NewProcedure {
                namespace: "cron",
                name,
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
                schedule: Some(schedule),
                enabled: true,
                source: ProcedureSource::Api,
                created_by: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn register_and_reschedule_maintain_one_entry_per_key() {
        let scheduler = scheduler().await;
        let record = scheduled_record(&scheduler, "cleanup", "*/5 * * * *").await;

        scheduler.register(&record);
        assert!(scheduler.has_entry("cron/cleanup"));

        // Re-registration replaces rather than duplicates.
        scheduler.register(&record);
        assert_eq!(scheduler.entry_keys(), vec!["cron/cleanup".to_string()]);

        let mut disabled = record.clone();
        disabled.enabled = false;
        scheduler.reschedule(&disabled);
        assert!(!scheduler.has_entry("cron/cleanup"));

        scheduler.reschedule(&record);
        assert!(scheduler.has_entry("cron/cleanup"));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_cron_expression_is_not_registered() {
        let scheduler = scheduler().await;
        let mut record = scheduled_record(&scheduler, "broken", "*/5 * * * *").await;
        record.schedule = Some("every tuesday-ish".to_string());

        scheduler.register(&record);
        assert!(!scheduler.has_entry("cron/broken"));
    }
}
