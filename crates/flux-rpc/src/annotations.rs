//! Annotation parsing for procedure source files.
//!
//! Procedure files carry their configuration in leading comment lines of the
//! form `-- @fluxbase:<key> <value>`. Parsing is total: malformed values fall
//! back to defaults so a bad annotation never prevents a file from loading.

use std::collections::BTreeMap;
use std::time::Duration;

/// Marker prefix for annotation lines.
pub const ANNOTATION_PREFIX: &str = "-- @fluxbase:";

/// Configuration extracted from annotation lines, defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotations {
    pub name: Option<String>,
    pub description: Option<String>,
    pub input_schema: Option<BTreeMap<String, String>>,
    pub output_schema: Option<BTreeMap<String, String>>,
    pub allowed_tables: Vec<String>,
    pub allowed_schemas: Vec<String>,
    /// Zero means "unset"; callers fall back to the engine default.
    pub max_execution_time: Duration,
    pub require_roles: Vec<String>,
    pub is_public: bool,
    pub version: i64,
    pub schedule: Option<String>,
}

impl Default for Annotations {
    fn default() -> Self {
        Self {
            name: None,
            description: None,
            input_schema: None,
            output_schema: None,
            allowed_tables: Vec::new(),
            allowed_schemas: vec!["public".to_string()],
            max_execution_time: Duration::from_secs(30),
            require_roles: Vec::new(),
            is_public: false,
            version: 1,
            schedule: None,
        }
    }
}

/// Parses annotation lines out of a procedure source. Returns the extracted
/// configuration plus the SQL body with annotation lines removed and
/// surrounding whitespace trimmed.
pub fn parse_annotations(source: &str) -> (Annotations, String) {
    let mut annotations = Annotations::default();
    let mut body_lines = Vec::new();

    for line in source.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix(ANNOTATION_PREFIX) {
            let (key, value) = match rest.split_once(char::is_whitespace) {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (rest.trim(), ""),
            };
            apply_annotation(&mut annotations, key, value);
        } else {
            body_lines.push(line);
        }
    }

    (annotations, body_lines.join("\n").trim().to_string())
}

fn apply_annotation(annotations: &mut Annotations, key: &str, value: &str) {
    match key {
        "name" => {
            if !value.is_empty() {
                annotations.name = Some(value.to_string());
            }
        }
        "description" => {
            if !value.is_empty() {
                annotations.description = Some(value.to_string());
            }
        }
        "input" => annotations.input_schema = parse_schema(value),
        "output" => annotations.output_schema = parse_schema(value),
        "allowed-tables" => annotations.allowed_tables = parse_list(value),
        "allowed-schemas" => {
            let schemas = parse_list(value);
            if !schemas.is_empty() {
                annotations.allowed_schemas = schemas;
            }
        }
        "max-execution-time" => annotations.max_execution_time = parse_duration(value),
        "require-role" => annotations.require_roles = parse_list(value),
        "public" => annotations.is_public = parse_bool(value),
        "version" => {
            if let Ok(version) = value.parse::<i64>() {
                if version > 0 {
                    annotations.version = version;
                }
            }
        }
        "schedule" => {
            if !value.is_empty() {
                annotations.schedule = Some(value.to_string());
            }
        }
        _ => {}
    }
}

/// Parses an `input`/`output` schema value. `any` and empty mean "no
/// schema"; otherwise either a JSON object or the `field:type,field:type`
/// shorthand is accepted. Fields ending `?` are optional.
fn parse_schema(value: &str) -> Option<BTreeMap<String, String>> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("any") {
        return None;
    }

    if value.starts_with('{') {
        let parsed: serde_json::Value = serde_json::from_str(value).ok()?;
        let object = parsed.as_object()?;
        let mut schema = BTreeMap::new();
        for (field, ty) in object {
            schema.insert(field.clone(), ty.as_str().unwrap_or("string").to_string());
        }
        return if schema.is_empty() { None } else { Some(schema) };
    }

    let mut schema = BTreeMap::new();
    for pair in value.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        match pair.split_once(':') {
            Some((field, ty)) if !field.trim().is_empty() => {
                schema.insert(field.trim().to_string(), ty.trim().to_string());
            }
            _ => {}
        }
    }
    if schema.is_empty() {
        None
    } else {
        Some(schema)
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1")
}

/// Parses a duration value such as `30s`, `5m`, `1h30m` or a bare integer
/// (seconds). Invalid input yields zero, which callers treat as "unset".
pub fn parse_duration(value: &str) -> Duration {
    let value = value.trim();
    if value.is_empty() {
        return Duration::ZERO;
    }
    if let Ok(seconds) = value.parse::<u64>() {
        return Duration::from_secs(seconds);
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if digits.is_empty() {
            return Duration::ZERO;
        }
        let amount: u64 = match digits.parse() {
            Ok(amount) => amount,
            Err(_) => return Duration::ZERO,
        };
        digits.clear();
        let unit = match ch {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                total += Duration::from_millis(amount);
                continue;
            }
            's' => Duration::from_secs(1),
            'm' => Duration::from_secs(60),
            'h' => Duration::from_secs(3_600),
            _ => return Duration::ZERO,
        };
        total += unit * amount as u32;
    }

    if digits.is_empty() {
        total
    } else {
        // Trailing digits without a unit make the whole value invalid.
        Duration::ZERO
    }
}
