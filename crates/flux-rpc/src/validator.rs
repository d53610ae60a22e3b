//! Input, SQL and access validation for procedure invocations.
//!
//! SQL validation runs a substring blocklist first, then parses the body
//! with the PostgreSQL dialect and walks the statement tree to gather every
//! table reference (FROM clauses, joins, subqueries, sublinks and CTE
//! bodies) before enforcing the per-procedure allow-lists. The blocklist
//! includes comment introducers: procedure bodies are stored after
//! annotation stripping, so a surviving `--` or `/*` marks an injection
//! attempt through a substitution site.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};
use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, JoinConstraint, JoinOperator, ObjectName, Query, Select,
    SelectItem, SetExpr, Statement, TableFactor, TableWithJoins,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

use crate::ProcedureRecord;

/// Case-insensitive substrings that are never allowed in a procedure body.
pub const FORBIDDEN_PATTERNS: &[&str] = &[
    "pg_catalog",
    "information_schema",
    "pg_temp",
    "pg_toast",
    "xp_",
    "exec(",
    "execute(",
    "--",
    "/*",
];

/// Roles that satisfy any non-empty `require_roles` list.
pub const SUPER_ROLES: &[&str] = &["service_role", "dashboard_admin"];

/// Outcome of statically analysing a procedure body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub tables_accessed: Vec<String>,
    pub operations_used: Vec<String>,
}

/// Root statement classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlOperation {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    Truncate,
    Unknown,
}

impl SqlOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlOperation::Select => "SELECT",
            SqlOperation::Insert => "INSERT",
            SqlOperation::Update => "UPDATE",
            SqlOperation::Delete => "DELETE",
            SqlOperation::Create => "CREATE",
            SqlOperation::Drop => "DROP",
            SqlOperation::Alter => "ALTER",
            SqlOperation::Truncate => "TRUNCATE",
            SqlOperation::Unknown => "UNKNOWN",
        }
    }
}

/// Input parameter rejection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("missing required parameter: {0}")]
    MissingParameter(String),
    #[error("parameter '{field}' must be of type {expected}")]
    TypeMismatch { field: String, expected: String },
}

/// Access policy rejection. The display text is surfaced verbatim to callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("procedure requires authentication")]
    AuthenticationRequired,
    #[error("access denied: role '{0}' is not permitted to execute this procedure")]
    RoleNotAllowed(String),
}

/// Checks a parameter map against the declared input schema. Without a
/// schema any map is accepted. Declared fields may carry a trailing `?` to
/// mark them optional; explicit `null` passes every type check.
pub fn validate_input(
    schema: Option<&BTreeMap<String, String>>,
    params: &Map<String, Value>,
) -> Result<(), InputError> {
    let Some(schema) = schema else {
        return Ok(());
    };

    for (declared, type_tag) in schema {
        let (field, optional) = match declared.strip_suffix('?') {
            Some(field) => (field, true),
            None => (declared.as_str(), false),
        };

        let value = match params.get(field) {
            Some(value) => value,
            None if optional => continue,
            None => return Err(InputError::MissingParameter(field.to_string())),
        };

        if value.is_null() {
            continue;
        }
        if !matches_type(value, type_tag) {
            return Err(InputError::TypeMismatch {
                field: field.to_string(),
                expected: type_tag.clone(),
            });
        }
    }
    Ok(())
}

fn matches_type(value: &Value, type_tag: &str) -> bool {
    match type_tag.to_ascii_lowercase().as_str() {
        "uuid" | "string" | "text" | "timestamp" | "date" => value.is_string(),
        "number" | "int" | "float" | "decimal" => value.is_number(),
        "boolean" | "bool" => value.is_boolean(),
        "array" => value.is_array(),
        "object" | "json" | "jsonb" => value.is_object(),
        // Unknown tags never reject; the parser is total and so are we.
        _ => true,
    }
}

/// Statically validates a procedure body against the allow-lists.
pub fn validate_sql(
    sql: &str,
    allowed_tables: &[String],
    allowed_schemas: &[String],
) -> SqlValidation {
    let mut validation = SqlValidation {
        valid: true,
        ..SqlValidation::default()
    };

    let lowered = sql.to_lowercase();
    for pattern in FORBIDDEN_PATTERNS {
        if lowered.contains(pattern) {
            validation
                .errors
                .push(format!("Query contains forbidden pattern: {pattern}"));
        }
    }
    if !validation.errors.is_empty() {
        validation.valid = false;
        return validation;
    }

    let statements = match Parser::parse_sql(&PostgreSqlDialect {}, sql) {
        Ok(statements) => statements,
        Err(err) => {
            validation.errors.push(format!("Failed to parse SQL: {err}"));
            validation.valid = false;
            return validation;
        }
    };

    if statements.len() != 1 {
        validation.errors.push(format!(
            "Expected exactly one statement, found {}",
            statements.len()
        ));
        validation.valid = false;
        return validation;
    }

    let statement = &statements[0];
    let operation = classify_statement(statement);
    if operation == SqlOperation::Unknown {
        validation
            .warnings
            .push("Statement type is not recognised; allow-lists may not cover it".to_string());
    }
    validation
        .operations_used
        .push(operation.as_str().to_string());

    let mut tables = BTreeSet::new();
    collect_statement_tables(statement, &mut tables);

    for reference in &tables {
        check_reference(reference, allowed_tables, allowed_schemas, &mut validation.errors);
    }

    validation.tables_accessed = tables.into_iter().collect();
    validation.valid = validation.errors.is_empty();
    validation
}

fn check_reference(
    reference: &str,
    allowed_tables: &[String],
    allowed_schemas: &[String],
    errors: &mut Vec<String>,
) {
    match reference.split_once('.') {
        Some((schema, table)) => {
            if !allowed_schemas.is_empty() && !allowed_schemas.iter().any(|s| s == schema) {
                errors.push(format!("Schema not allowed: {schema}"));
            }
            if !allowed_tables.is_empty()
                && !allowed_tables.iter().any(|t| t == table || t == reference)
            {
                errors.push(format!("Table not allowed: {reference}"));
            }
        }
        None => {
            if !allowed_tables.is_empty() && !allowed_tables.iter().any(|t| t == reference) {
                errors.push(format!("Table not allowed: {reference}"));
            }
        }
    }
}

/// Checks the caller's role and authentication state against the
/// procedure's access policy.
pub fn validate_access(
    procedure: &ProcedureRecord,
    role: &str,
    is_authenticated: bool,
) -> Result<(), AccessError> {
    if !procedure.is_public && !is_authenticated {
        return Err(AccessError::AuthenticationRequired);
    }
    if procedure.require_roles.is_empty() {
        return Ok(());
    }
    if SUPER_ROLES.contains(&role) {
        return Ok(());
    }
    for entry in &procedure.require_roles {
        match entry.as_str() {
            "anon" => return Ok(()),
            "authenticated" if is_authenticated => return Ok(()),
            other if other == role => return Ok(()),
            _ => {}
        }
    }
    Err(AccessError::RoleNotAllowed(role.to_string()))
}

fn classify_statement(statement: &Statement) -> SqlOperation {
    match statement {
        Statement::Query(_) => SqlOperation::Select,
        Statement::Insert { .. } => SqlOperation::Insert,
        Statement::Update { .. } => SqlOperation::Update,
        Statement::Delete { .. } => SqlOperation::Delete,
        Statement::CreateTable { .. }
        | Statement::CreateView { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateSchema { .. } => SqlOperation::Create,
        Statement::Drop { .. } => SqlOperation::Drop,
        Statement::AlterTable { .. } | Statement::AlterIndex { .. } => SqlOperation::Alter,
        Statement::Truncate { .. } => SqlOperation::Truncate,
        _ => SqlOperation::Unknown,
    }
}

fn collect_statement_tables(statement: &Statement, out: &mut BTreeSet<String>) {
    match statement {
        Statement::Query(query) => collect_query(query, out),
        Statement::Insert {
            table_name, source, ..
        } => {
            out.insert(object_name_key(table_name));
            collect_query(source, out);
        }
        Statement::Update {
            table,
            from,
            selection,
            ..
        } => {
            collect_table_with_joins(table, out);
            if let Some(from) = from {
                collect_table_with_joins(from, out);
            }
            if let Some(selection) = selection {
                collect_expr(selection, out);
            }
        }
        Statement::Delete {
            from,
            using,
            selection,
            ..
        } => {
            for item in from {
                collect_table_with_joins(item, out);
            }
            if let Some(using) = using {
                for item in using {
                    collect_table_with_joins(item, out);
                }
            }
            if let Some(selection) = selection {
                collect_expr(selection, out);
            }
        }
        Statement::Truncate { table_name, .. } => {
            out.insert(object_name_key(table_name));
        }
        _ => {}
    }
}

fn collect_query(query: &Query, out: &mut BTreeSet<String>) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            collect_query(&cte.query, out);
        }
    }
    collect_set_expr(&query.body, out);
}

fn collect_set_expr(body: &SetExpr, out: &mut BTreeSet<String>) {
    match body {
        SetExpr::Select(select) => collect_select(select, out),
        SetExpr::Query(query) => collect_query(query, out),
        SetExpr::SetOperation { left, right, .. } => {
            collect_set_expr(left, out);
            collect_set_expr(right, out);
        }
        SetExpr::Insert(statement) | SetExpr::Update(statement) => {
            collect_statement_tables(statement, out)
        }
        _ => {}
    }
}

fn collect_select(select: &Select, out: &mut BTreeSet<String>) {
    for item in &select.from {
        collect_table_with_joins(item, out);
    }
    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                collect_expr(expr, out)
            }
            _ => {}
        }
    }
    if let Some(selection) = &select.selection {
        collect_expr(selection, out);
    }
    if let Some(having) = &select.having {
        collect_expr(having, out);
    }
}

fn collect_table_with_joins(item: &TableWithJoins, out: &mut BTreeSet<String>) {
    collect_table_factor(&item.relation, out);
    for join in &item.joins {
        collect_table_factor(&join.relation, out);
        collect_join_operator(&join.join_operator, out);
    }
}

fn collect_table_factor(factor: &TableFactor, out: &mut BTreeSet<String>) {
    match factor {
        TableFactor::Table { name, .. } => {
            out.insert(object_name_key(name));
        }
        TableFactor::Derived { subquery, .. } => collect_query(subquery, out),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => collect_table_with_joins(table_with_joins, out),
        _ => {}
    }
}

fn collect_join_operator(operator: &JoinOperator, out: &mut BTreeSet<String>) {
    let constraint = match operator {
        JoinOperator::Inner(constraint)
        | JoinOperator::LeftOuter(constraint)
        | JoinOperator::RightOuter(constraint)
        | JoinOperator::FullOuter(constraint) => constraint,
        _ => return,
    };
    if let JoinConstraint::On(expr) = constraint {
        collect_expr(expr, out);
    }
}

fn collect_expr(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            collect_expr(left, out);
            collect_expr(right, out);
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr) => collect_expr(expr, out),
        Expr::Cast { expr, .. } => collect_expr(expr, out),
        Expr::InSubquery { expr, subquery, .. } => {
            collect_expr(expr, out);
            collect_query(subquery, out);
        }
        Expr::Exists { subquery, .. } | Expr::Subquery(subquery) => collect_query(subquery, out),
        Expr::InList { expr, list, .. } => {
            collect_expr(expr, out);
            for item in list {
                collect_expr(item, out);
            }
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            collect_expr(expr, out);
            collect_expr(low, out);
            collect_expr(high, out);
        }
        Expr::Function(function) => {
            for arg in &function.args {
                match arg {
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(expr))
                    | FunctionArg::Named {
                        arg: FunctionArgExpr::Expr(expr),
                        ..
                    } => collect_expr(expr, out),
                    _ => {}
                }
            }
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
            ..
        } => {
            if let Some(operand) = operand {
                collect_expr(operand, out);
            }
            for condition in conditions {
                collect_expr(condition, out);
            }
            for result in results {
                collect_expr(result, out);
            }
            if let Some(else_result) = else_result {
                collect_expr(else_result, out);
            }
        }
        _ => {}
    }
}

/// Renders a possibly schema-qualified reference: `schema.name` when a
/// qualifier is present, the bare name otherwise.
fn object_name_key(name: &ObjectName) -> String {
    let parts = &name.0;
    if parts.len() >= 2 {
        format!(
            "{}.{}",
            parts[parts.len() - 2].value,
            parts[parts.len() - 1].value
        )
    } else {
        parts
            .first()
            .map(|ident| ident.value.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProcedureSource, ProcedureRecord};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn procedure(is_public: bool, require_roles: &[&str]) -> ProcedureRecord {
        ProcedureRecord {
            id: Uuid::new_v4(),
            namespace: "public".into(),
            name: "p".into(),
            description: None,
            sql_query: "SELECT 1".into(),
            original_code: "SELECT 1".into(),
            input_schema: None,
            output_schema: None,
            allowed_tables: vec![],
            allowed_schemas: vec!["public".into()],
            max_execution_time_seconds: 30,
            require_roles: require_roles.iter().map(|r| r.to_string()).collect(),
            is_public,
            disable_execution_logs: false,
            schedule: None,
            enabled: true,
            version: 1,
            source: ProcedureSource::Api,
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn params(value: serde_json::Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    fn schema(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn input_without_schema_accepts_anything() {
        let map = params(json!({"whatever": [1, 2, 3]}));
        assert!(validate_input(None, &map).is_ok());
    }

    #[test]
    fn input_missing_required_parameter() {
        let schema = schema(&[("user_id", "uuid")]);
        let err = validate_input(Some(&schema), &params(json!({}))).unwrap_err();
        assert_eq!(err.to_string(), "missing required parameter: user_id");
    }

    #[test]
    fn input_optional_field_may_be_absent() {
        let schema = schema(&[("limit?", "number")]);
        assert!(validate_input(Some(&schema), &params(json!({}))).is_ok());
    }

    #[test]
    fn input_null_passes_any_type() {
        let schema = schema(&[("user_id", "uuid")]);
        assert!(validate_input(Some(&schema), &params(json!({"user_id": null}))).is_ok());
    }

    #[test]
    fn input_type_mismatch() {
        let schema = schema(&[("count", "number")]);
        let err = validate_input(Some(&schema), &params(json!({"count": "five"}))).unwrap_err();
        assert!(matches!(err, InputError::TypeMismatch { .. }));

        let schema = schema_helper_object();
        assert!(validate_input(Some(&schema), &params(json!({"payload": {"a": 1}}))).is_ok());
        assert!(validate_input(Some(&schema), &params(json!({"payload": [1]}))).is_err());
    }

    fn schema_helper_object() -> BTreeMap<String, String> {
        schema(&[("payload", "object")])
    }

    #[test]
    fn blocklist_rejects_system_catalogs_and_comments() {
        for body in [
            "SELECT * FROM pg_catalog.pg_tables",
            "SELECT 1 -- sneaky",
            "SELECT /* hidden */ 1",
            "SELECT * FROM information_schema.tables",
        ] {
            let validation = validate_sql(body, &[], &[]);
            assert!(!validation.valid, "expected rejection for {body}");
            assert!(validation.errors[0].starts_with("Query contains forbidden pattern"));
        }
    }

    #[test]
    fn parse_failure_is_reported() {
        let validation = validate_sql("SELEC wrong", &[], &[]);
        assert!(!validation.valid);
        assert!(validation.errors[0].starts_with("Failed to parse SQL"));
    }

    #[test]
    fn multiple_statements_are_rejected() {
        let validation = validate_sql("SELECT 1; SELECT 2", &[], &[]);
        assert!(!validation.valid);
        assert!(validation.errors[0].contains("found 2"));
    }

    #[test]
    fn empty_body_is_rejected() {
        let validation = validate_sql("", &[], &[]);
        assert!(!validation.valid);
        assert!(validation.errors[0].contains("found 0"));
    }

    #[test]
    fn operation_classification() {
        let cases = [
            ("SELECT * FROM orders", "SELECT"),
            ("INSERT INTO orders (id) VALUES (1)", "INSERT"),
            ("UPDATE orders SET total = 2", "UPDATE"),
            ("DELETE FROM orders WHERE id = 1", "DELETE"),
            ("CREATE TABLE t (id INT)", "CREATE"),
            ("DROP TABLE orders", "DROP"),
            ("TRUNCATE TABLE orders", "TRUNCATE"),
        ];
        for (sql, expected) in cases {
            let validation = validate_sql(sql, &[], &[]);
            assert_eq!(validation.operations_used, vec![expected], "for {sql}");
        }
    }

    #[test]
    fn table_extraction_covers_joins_subqueries_and_ctes() {
        let sql = "WITH recent AS (SELECT id FROM orders) \
                   SELECT u.name FROM users u \
                   JOIN accounts a ON a.user_id = u.id \
                   WHERE u.id IN (SELECT user_id FROM sessions)";
        let validation = validate_sql(sql, &[], &[]);
        assert!(validation.valid);
        for table in ["orders", "users", "accounts", "sessions", "recent"] {
            assert!(
                validation.tables_accessed.contains(&table.to_string()),
                "missing {table} in {:?}",
                validation.tables_accessed
            );
        }
    }

    #[test]
    fn allow_list_rejects_unlisted_table() {
        let allowed = vec!["customers".to_string()];
        let validation = validate_sql("SELECT COUNT(*) AS n FROM orders", &allowed, &[]);
        assert!(!validation.valid);
        assert!(validation
            .errors
            .contains(&"Table not allowed: orders".to_string()));
    }

    #[test]
    fn allow_list_accepts_listed_table() {
        let allowed = vec!["orders".to_string()];
        let validation = validate_sql("SELECT COUNT(*) AS n FROM orders", &allowed, &[]);
        assert!(validation.valid, "errors: {:?}", validation.errors);
    }

    #[test]
    fn qualified_reference_checks_schema_and_table() {
        let schemas = vec!["analytics".to_string()];
        let validation = validate_sql("SELECT * FROM analytics.facts", &[], &schemas);
        assert!(validation.valid);

        let validation = validate_sql("SELECT * FROM reporting.facts", &[], &schemas);
        assert!(!validation.valid);
        assert!(validation
            .errors
            .contains(&"Schema not allowed: reporting".to_string()));
    }

    #[test]
    fn qualified_table_may_match_bare_or_qualified_allow_entry() {
        let allowed = vec!["facts".to_string()];
        let validation = validate_sql("SELECT * FROM analytics.facts", &allowed, &[]);
        assert!(validation.valid);

        let allowed = vec!["analytics.facts".to_string()];
        let validation = validate_sql("SELECT * FROM analytics.facts", &allowed, &[]);
        assert!(validation.valid);
    }

    #[test]
    fn empty_allow_lists_mean_no_restriction() {
        let validation = validate_sql("SELECT * FROM anything.goes", &[], &[]);
        assert!(validation.valid);
    }

    #[test]
    fn access_private_requires_authentication() {
        let record = procedure(false, &[]);
        let err = validate_access(&record, "anon", false).unwrap_err();
        assert_eq!(err, AccessError::AuthenticationRequired);
        assert!(validate_access(&record, "user", true).is_ok());
    }

    #[test]
    fn access_role_entries() {
        let record = procedure(true, &["admin"]);
        assert!(validate_access(&record, "admin", true).is_ok());
        assert!(validate_access(&record, "user", true).is_err());

        let record = procedure(true, &["authenticated"]);
        assert!(validate_access(&record, "user", true).is_ok());
        assert!(validate_access(&record, "anon", false).is_err());

        let record = procedure(true, &["anon"]);
        assert!(validate_access(&record, "anybody", false).is_ok());
    }

    #[test]
    fn super_roles_bypass_role_lists() {
        let record = procedure(true, &["admin"]);
        assert!(validate_access(&record, "service_role", true).is_ok());
        assert!(validate_access(&record, "dashboard_admin", true).is_ok());
    }
}
