//! Reconciliation between a supplied procedure set and the stored catalog.
//!
//! One pass classifies every candidate as create, update or unchanged, and
//! optionally deletes stored procedures missing from the candidate set.
//! Candidates either arrive inline (`{name, code}`) or, when none are
//! supplied, from the filesystem loader.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::annotations::{parse_annotations, Annotations};
use crate::loader::load_procedures;
use crate::{Database, NewProcedure, ProcedureChanges, ProcedureRecord, ProcedureSource};

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SyncOptions {
    #[serde(default)]
    pub delete_missing: bool,
    #[serde(default)]
    pub dry_run: bool,
}

/// One inline candidate: raw annotated source plus its path-stem name.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcedureSpec {
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub namespace: String,
    pub procedures: Vec<ProcedureSpec>,
    pub options: SyncOptions,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncErrorEntry {
    pub name: String,
    pub error: String,
}

/// Per-category names affected by one sync pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncOutcome {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub deleted: Vec<String>,
    pub errors: Vec<SyncErrorEntry>,
}

struct Candidate {
    name: String,
    annotations: Annotations,
    sql_query: String,
    original_code: String,
    source: ProcedureSource,
}

impl Candidate {
    fn from_spec(spec: &ProcedureSpec) -> Self {
        let (annotations, sql_query) = parse_annotations(&spec.code);
        let name = annotations
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| spec.name.clone());
        Self {
            name,
            annotations,
            sql_query,
            original_code: spec.code.clone(),
            source: ProcedureSource::Sdk,
        }
    }

    fn max_execution_time_seconds(&self) -> i64 {
        self.annotations.max_execution_time.as_secs() as i64
    }

    fn differs_from(&self, existing: &ProcedureRecord) -> bool {
        existing.sql_query != self.sql_query
            || existing.description != self.annotations.description
            || existing.max_execution_time_seconds != self.max_execution_time_seconds()
            || existing.is_public != self.annotations.is_public
            || existing.require_roles != self.annotations.require_roles
            || existing.allowed_tables != self.annotations.allowed_tables
            || existing.allowed_schemas != self.annotations.allowed_schemas
    }
}

/// Applies sync passes against the stored catalog.
#[derive(Clone)]
pub struct SyncEngine {
    db: Database,
    procedures_dir: Option<PathBuf>,
}

impl SyncEngine {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            procedures_dir: None,
        }
    }

    /// Configures the loader fallback used when a request supplies no
    /// inline procedures.
    pub fn with_procedures_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.procedures_dir = Some(dir.into());
        self
    }

    #[instrument(skip(self, request), fields(namespace = %request.namespace))]
    pub async fn sync(&self, request: SyncRequest) -> Result<SyncOutcome> {
        let namespace = if request.namespace.is_empty() {
            crate::loader::DEFAULT_NAMESPACE.to_string()
        } else {
            request.namespace.clone()
        };

        let candidates = self.resolve_candidates(&request, &namespace)?;
        let existing = self.db.list_procedures(Some(&namespace)).await?;

        let mut outcome = SyncOutcome::default();
        for candidate in &candidates {
            let current = existing.iter().find(|record| record.name == candidate.name);
            match self
                .apply_candidate(&namespace, candidate, current, request.options.dry_run)
                .await
            {
                Ok(Action::Created) => outcome.created.push(candidate.name.clone()),
                Ok(Action::Updated) => outcome.updated.push(candidate.name.clone()),
                Ok(Action::Unchanged) => outcome.unchanged.push(candidate.name.clone()),
                Err(error) => {
                    warn!(name = %candidate.name, %error, "sync candidate failed");
                    outcome.errors.push(SyncErrorEntry {
                        name: candidate.name.clone(),
                        error: error.to_string(),
                    });
                }
            }
        }

        if request.options.delete_missing {
            for record in &existing {
                if record.source == ProcedureSource::Api {
                    continue;
                }
                if candidates.iter().any(|c| c.name == record.name) {
                    continue;
                }
                if request.options.dry_run {
                    outcome.deleted.push(record.name.clone());
                    continue;
                }
                match self.db.delete_procedure(record.id).await {
                    Ok(_) => outcome.deleted.push(record.name.clone()),
                    Err(error) => outcome.errors.push(SyncErrorEntry {
                        name: record.name.clone(),
                        error: error.to_string(),
                    }),
                }
            }
        }

        info!(
            created = outcome.created.len(),
            updated = outcome.updated.len(),
            unchanged = outcome.unchanged.len(),
            deleted = outcome.deleted.len(),
            errors = outcome.errors.len(),
            dry_run = request.options.dry_run,
            "sync pass finished"
        );
        Ok(outcome)
    }

    fn resolve_candidates(
        &self,
        request: &SyncRequest,
        namespace: &str,
    ) -> Result<Vec<Candidate>> {
        if !request.procedures.is_empty() {
            return Ok(request.procedures.iter().map(Candidate::from_spec).collect());
        }

        let dir = self.procedures_dir.as_ref().ok_or_else(|| {
            anyhow!("no procedures supplied and no procedures directory configured")
        })?;
        let loaded = load_procedures(dir)?;
        Ok(loaded
            .into_iter()
            .filter(|procedure| procedure.namespace == namespace)
            .map(|procedure| Candidate {
                name: procedure.name,
                annotations: procedure.annotations,
                sql_query: procedure.sql_query,
                original_code: procedure.original_code,
                source: ProcedureSource::Filesystem,
            })
            .collect())
    }

    async fn apply_candidate(
        &self,
        namespace: &str,
        candidate: &Candidate,
        existing: Option<&ProcedureRecord>,
        dry_run: bool,
    ) -> Result<Action> {
        match existing {
            None => {
                if !dry_run {
                    self.db
                        .create_procedure(NewProcedure {
                            namespace,
                            name: &candidate.name,
                            description: candidate.annotations.description.as_deref(),
                            sql_query: &candidate.sql_query,
                            original_code: &candidate.original_code,
                            input_schema: candidate.annotations.input_schema.as_ref(),
                            output_schema: candidate.annotations.output_schema.as_ref(),
                            allowed_tables: &candidate.annotations.allowed_tables,
                            allowed_schemas: &candidate.annotations.allowed_schemas,
                            max_execution_time_seconds: candidate.max_execution_time_seconds(),
                            require_roles: &candidate.annotations.require_roles,
                            is_public: candidate.annotations.is_public,
                            disable_execution_logs: false,
                            schedule: candidate.annotations.schedule.as_deref(),
                            enabled: true,
                            source: candidate.source,
                            created_by: None,
                        })
                        .await?;
                }
                Ok(Action::Created)
            }
            Some(existing) if candidate.differs_from(existing) => {
                if !dry_run {
                    self.db
                        .update_procedure(
                            existing.id,
                            ProcedureChanges {
                                description: candidate.annotations.description.as_deref(),
                                sql_query: &candidate.sql_query,
                                original_code: &candidate.original_code,
                                input_schema: candidate.annotations.input_schema.as_ref(),
                                output_schema: candidate.annotations.output_schema.as_ref(),
                                allowed_tables: &candidate.annotations.allowed_tables,
                                allowed_schemas: &candidate.annotations.allowed_schemas,
                                max_execution_time_seconds: candidate.max_execution_time_seconds(),
                                require_roles: &candidate.annotations.require_roles,
                                is_public: candidate.annotations.is_public,
                                disable_execution_logs: existing.disable_execution_logs,
                                schedule: candidate.annotations.schedule.as_deref(),
                                enabled: existing.enabled,
                            },
                        )
                        .await?;
                }
                Ok(Action::Updated)
            }
            Some(_) => Ok(Action::Unchanged),
        }
    }
}

enum Action {
    Created,
    Updated,
    Unchanged,
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine() -> SyncEngine {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        SyncEngine::new(db)
    }

    fn spec(name: &str, code: &str) -> ProcedureSpec {
        ProcedureSpec {
            name: name.to_string(),
            code: code.to_string(),
        }
    }

    fn request(procedures: Vec<ProcedureSpec>, options: SyncOptions) -> SyncRequest {
        SyncRequest {
            namespace: "reports".to_string(),
            procedures,
            options,
        }
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let engine = engine().await;
        let specs = vec![
            spec("daily", "-- @fluxbase:allowed-tables orders\nSELECT 1"),
            spec("weekly", "SELECT 2"),
        ];

        let first = engine
            .sync(request(specs.clone(), SyncOptions::default()))
            .await
            .unwrap();
        assert_eq!(first.created.len(), 2);
        assert!(first.updated.is_empty());

        let second = engine
            .sync(request(specs, SyncOptions::default()))
            .await
            .unwrap();
        assert!(second.created.is_empty());
        assert!(second.updated.is_empty());
        assert!(second.deleted.is_empty());
        assert_eq!(second.unchanged.len(), 2);
    }

    #[tokio::test]
    async fn changed_code_triggers_update_and_version_bump() {
        let engine = engine().await;
        engine
            .sync(request(vec![spec("daily", "SELECT 1")], SyncOptions::default()))
            .await
            .unwrap();
        let before = engine
            .db
            .fetch_procedure_by_name("reports", "daily")
            .await
            .unwrap()
            .unwrap();

        let outcome = engine
            .sync(request(vec![spec("daily", "SELECT 2")], SyncOptions::default()))
            .await
            .unwrap();
        assert_eq!(outcome.updated, vec!["daily".to_string()]);

        let after = engine
            .db
            .fetch_procedure_by_name("reports", "daily")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.sql_query, "SELECT 2");
        assert!(after.version > before.version);
        assert_eq!(after.id, before.id);
    }

    #[tokio::test]
    async fn delete_missing_spares_api_sourced_procedures() {
        let engine = engine().await;
        engine
            .sync(request(
                vec![spec("keep", "SELECT 1"), spec("drop", "SELECT 2")],
                SyncOptions::default(),
            ))
            .await
            .unwrap();

        // An operator-created procedure in the same namespace.
        engine
            .db
            .create_procedure(NewProcedure {
                namespace: "reports",
                name: "manual",
                description: None,
                sql_query: "SELECT 3",
                original_code: "SELECT 3",
                input_schema: None,
                output_schema: None,
                allowed_tables: &[],
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
            .unwrap();

        let outcome = engine
            .sync(request(
                vec![spec("keep", "SELECT 1")],
                SyncOptions {
                    delete_missing: true,
                    dry_run: false,
                },
            ))
            .await
            .unwrap();

        assert_eq!(outcome.deleted, vec!["drop".to_string()]);
        assert!(engine
            .db
            .fetch_procedure_by_name("reports", "manual")
            .await
            .unwrap()
            .is_some());
        assert!(engine
            .db
            .fetch_procedure_by_name("reports", "drop")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn dry_run_reports_without_writing() {
        let engine = engine().await;
        let outcome = engine
            .sync(request(
                vec![spec("daily", "SELECT 1")],
                SyncOptions {
                    delete_missing: false,
                    dry_run: true,
                },
            ))
            .await
            .unwrap();
        assert_eq!(outcome.created, vec!["daily".to_string()]);
        assert!(engine
            .db
            .fetch_procedure_by_name("reports", "daily")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn inline_annotation_name_overrides_spec_name() {
        let engine = engine().await;
        let outcome = engine
            .sync(request(
                vec![spec("raw_name", "-- @fluxbase:name pretty_name\nSELECT 1")],
                SyncOptions::default(),
            ))
            .await
            .unwrap();
        assert_eq!(outcome.created, vec!["pretty_name".to_string()]);
    }

    #[tokio::test]
    async fn missing_loader_configuration_is_an_error() {
        let engine = engine().await;
        let err = engine
            .sync(request(Vec::new(), SyncOptions::default()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no procedures"));
    }
}
