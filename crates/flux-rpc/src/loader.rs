//! Filesystem loader for procedure definitions.
//!
//! Walks a procedures directory recursively and turns every `.sql` file into
//! a [`LoadedProcedure`]. The namespace/name pair is derived from the path:
//! `<root>/<ns>/<leaf>.sql` yields `(ns, leaf)`, a file directly under the
//! root lands in the `default` namespace. Files that cannot be read are
//! logged and skipped so one broken file never blocks a reload.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::annotations::{parse_annotations, Annotations};
use crate::{NewProcedure, ProcedureSource};

/// Namespace used for files sitting directly in the procedures root.
pub const DEFAULT_NAMESPACE: &str = "default";

/// A procedure definition read from disk, not yet persisted.
#[derive(Debug, Clone)]
pub struct LoadedProcedure {
    pub namespace: String,
    pub name: String,
    pub annotations: Annotations,
    pub sql_query: String,
    pub original_code: String,
    pub path: PathBuf,
}

impl LoadedProcedure {
    /// Builds the storage payload, populating filesystem defaults and
    /// applying annotation overrides.
    pub fn to_new_procedure(&self) -> NewProcedure<'_> {
        NewProcedure {
            namespace: &self.namespace,
            name: &self.name,
            description: self.annotations.description.as_deref(),
            sql_query: &self.sql_query,
            original_code: &self.original_code,
            input_schema: self.annotations.input_schema.as_ref(),
            output_schema: self.annotations.output_schema.as_ref(),
            allowed_tables: &self.annotations.allowed_tables,
            allowed_schemas: &self.annotations.allowed_schemas,
            max_execution_time_seconds: self.annotations.max_execution_time.as_secs() as i64,
            require_roles: &self.annotations.require_roles,
            is_public: self.annotations.is_public,
            disable_execution_logs: false,
            schedule: self.annotations.schedule.as_deref(),
            enabled: true,
            source: ProcedureSource::Filesystem,
            created_by: None,
        }
    }
}

/// Loads every `.sql` file below `root`. Read failures are logged and the
/// offending file is skipped.
pub fn load_procedures(root: &Path) -> Result<Vec<LoadedProcedure>> {
    let mut out = Vec::new();
    walk_dir(root, root, &mut out)
        .with_context(|| format!("walking procedures directory {}", root.display()))?;
    out.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
    Ok(out)
}

fn walk_dir(root: &Path, dir: &Path, out: &mut Vec<LoadedProcedure>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "skipping unreadable directory entry");
                continue;
            }
        };
        let path = entry.path();
        if path.is_dir() {
            walk_dir(root, &path, out)?;
            continue;
        }
        if path.extension().and_then(|ext| ext.to_str()) != Some("sql") {
            continue;
        }
        match load_file(root, &path) {
            Ok(loaded) => {
                debug!(namespace = %loaded.namespace, name = %loaded.name, path = %path.display(), "loaded procedure file");
                out.push(loaded);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping procedure file");
            }
        }
    }
    Ok(())
}

fn load_file(root: &Path, path: &Path) -> Result<LoadedProcedure> {
    let original_code = fs::read_to_string(path).context("reading procedure file")?;
    let (annotations, sql_query) = parse_annotations(&original_code);

    let (namespace, path_name) = resolve_names(root, path)?;
    // The annotation name overrides the path-derived name; the namespace
    // always comes from the path.
    let name = annotations
        .name
        .clone()
        .filter(|name| !name.is_empty())
        .unwrap_or(path_name);

    Ok(LoadedProcedure {
        namespace,
        name,
        annotations,
        sql_query,
        original_code,
        path: path.to_path_buf(),
    })
}

fn resolve_names(root: &Path, path: &Path) -> Result<(String, String)> {
    let relative = path
        .strip_prefix(root)
        .context("procedure file outside root")?;
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .context("procedure file has no usable stem")?
        .to_string();

    let namespace = match relative.components().next() {
        Some(first) if relative.components().count() > 1 => first
            .as_os_str()
            .to_str()
            .context("namespace component is not valid UTF-8")?
            .to_string(),
        _ => DEFAULT_NAMESPACE.to_string(),
    };

    Ok((namespace, stem))
}
