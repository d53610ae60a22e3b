//! Parameter substitution for procedure bodies.
//!
//! Substitution is literal interpolation, not placeholder binding: every
//! `$identifier` in the template is replaced with a formatted SQL literal.
//! Safety comes from the validator's allow-lists and blocklist applied to
//! the template beforehand, plus the quote-and-escape formatting here.

use std::collections::BTreeSet;

use serde_json::{Map, Value};
use thiserror::Error;

/// Raised when the template references parameters the caller never supplied.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubstitutionError {
    #[error("missing required parameters: [{}]", .0.join(", "))]
    MissingParameters(Vec<String>),
}

/// Merges the synthesised caller parameters under the user-supplied map.
/// User values win on key conflict.
pub fn merge_caller_params(
    params: &Map<String, Value>,
    user_id: Option<&str>,
    role: Option<&str>,
    email: Option<&str>,
) -> Map<String, Value> {
    let mut merged = Map::new();
    merged.insert("caller_id".to_string(), opt_string(user_id));
    merged.insert("caller_role".to_string(), opt_string(role));
    merged.insert("caller_email".to_string(), opt_string(email));
    for (key, value) in params {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

fn opt_string(value: Option<&str>) -> Value {
    value
        .map(|v| Value::String(v.to_string()))
        .unwrap_or(Value::Null)
}

/// Replaces every `$identifier` in the template with a formatted literal.
/// All missing identifiers are collected before the call fails.
pub fn substitute_params(
    sql: &str,
    params: &Map<String, Value>,
) -> Result<String, SubstitutionError> {
    let mut out = String::with_capacity(sql.len());
    let mut missing = BTreeSet::new();
    let mut chars = sql.char_indices().peekable();

    while let Some((_, ch)) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }
        match chars.peek() {
            Some(&(start, first)) if first.is_ascii_alphabetic() || first == '_' => {
                let mut end = start + 1;
                chars.next();
                while let Some(&(idx, next)) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        end = idx + 1;
                        chars.next();
                    } else {
                        break;
                    }
                }
                let ident = &sql[start..end];
                match params.get(ident) {
                    Some(value) => out.push_str(&format_literal(value)),
                    None => {
                        missing.insert(ident.to_string());
                    }
                }
            }
            _ => out.push('$'),
        }
    }

    if missing.is_empty() {
        Ok(out)
    } else {
        Err(SubstitutionError::MissingParameters(
            missing.into_iter().collect(),
        ))
    }
}

/// Formats one runtime value as a SQL literal. Strings double internal
/// quotes; maps become `'…'::jsonb`; numeric-only sequences are promoted to
/// `'[…]'::vector` before the generic `ARRAY[…]` rule so JSON-decoded
/// embeddings interpolate as vectors.
pub fn format_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => format!("'{}'", text.replace('\'', "''")),
        Value::Array(items) => {
            if !items.is_empty() && items.iter().all(Value::is_number) {
                let joined = items
                    .iter()
                    .map(Value::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                format!("'[{joined}]'::vector")
            } else {
                let literals = items
                    .iter()
                    .map(format_literal)
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("ARRAY[{literals}]")
            }
        }
        Value::Object(_) => {
            let json = value.to_string().replace('\'', "''");
            format!("'{json}'::jsonb")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::validate_sql;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn scalar_literals() {
        assert_eq!(format_literal(&json!(null)), "NULL");
        assert_eq!(format_literal(&json!(true)), "TRUE");
        assert_eq!(format_literal(&json!(false)), "FALSE");
        assert_eq!(format_literal(&json!(42)), "42");
        assert_eq!(format_literal(&json!(-3.5)), "-3.5");
        assert_eq!(format_literal(&json!("plain")), "'plain'");
    }

    #[test]
    fn string_quotes_are_doubled() {
        assert_eq!(format_literal(&json!("O'Brien")), "'O''Brien'");
        assert_eq!(format_literal(&json!("''")), "''''''");
    }

    #[test]
    fn big_number_tokens_format_as_their_original_text() {
        // Values beyond i64/u64/f64 range keep their decoded token text.
        let value: Value =
            serde_json::from_str(r#"{"big": 123456789012345678901234567890.123456789}"#).unwrap();
        let big = value.as_object().unwrap().get("big").unwrap();
        assert_eq!(
            format_literal(big),
            "123456789012345678901234567890.123456789"
        );
    }

    #[test]
    fn numeric_sequences_promote_to_vector() {
        assert_eq!(
            format_literal(&json!([0.1, 0.2, 3])),
            "'[0.1,0.2,3]'::vector"
        );
    }

    #[test]
    fn mixed_sequences_stay_arrays() {
        assert_eq!(
            format_literal(&json!(["a", 1])),
            "ARRAY['a', 1]"
        );
        assert_eq!(format_literal(&json!([])), "ARRAY[]");
    }

    #[test]
    fn objects_become_jsonb() {
        assert_eq!(
            format_literal(&json!({"k": "it's"})),
            "'{\"k\":\"it''s\"}'::jsonb"
        );
    }

    #[test]
    fn substitution_replaces_identifiers() {
        let params = map(json!({"user_id": "u1", "limit": 10}));
        let sql = substitute_params(
            "SELECT * FROM orders WHERE user_id = $user_id LIMIT $limit",
            &params,
        )
        .unwrap();
        assert_eq!(sql, "SELECT * FROM orders WHERE user_id = 'u1' LIMIT 10");
    }

    #[test]
    fn positional_placeholders_are_left_alone() {
        let params = map(json!({}));
        let sql = substitute_params("SELECT $1 + $2", &params).unwrap();
        assert_eq!(sql, "SELECT $1 + $2");
    }

    #[test]
    fn missing_parameters_are_collected() {
        let params = map(json!({"present": 1}));
        let err = substitute_params("SELECT $present, $a, $b, $a", &params).unwrap_err();
        assert_eq!(
            err,
            SubstitutionError::MissingParameters(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(err.to_string(), "missing required parameters: [a, b]");
    }

    #[test]
    fn caller_params_are_synthesised_and_user_values_win() {
        let user = map(json!({"caller_role": "spoofed", "x": 1}));
        let merged = merge_caller_params(&user, Some("u1"), Some("user"), None);
        assert_eq!(merged.get("caller_id").unwrap(), "u1");
        // The user-supplied value shadows the synthesised one.
        assert_eq!(merged.get("caller_role").unwrap(), "spoofed");
        assert_eq!(merged.get("caller_email").unwrap(), &Value::Null);
        assert_eq!(merged.get("x").unwrap(), 1);
    }

    #[test]
    fn substituted_sql_still_parses_as_one_statement() {
        let params = map(json!({
            "user_id": "u'1",
            "tags": ["a", "b"],
            "payload": {"k": 1},
            "active": true
        }));
        let template = "SELECT * FROM orders WHERE user_id = $user_id \
                        AND active = $active AND payload = $payload AND tags = $tags";
        let template_validation = validate_sql(template, &[], &[]);
        let substituted = substitute_params(template, &params).unwrap();
        let validation = validate_sql(&substituted, &[], &[]);
        assert!(validation.valid, "errors: {:?}", validation.errors);
        assert_eq!(validation.operations_used, template_validation.operations_used);
    }
}
