//! Bounded field-level validation for persisted JSON records.
//!
//! Operational files (stats, metrics, locks) are written incrementally over
//! long-running processes. A single corrupted or partially-upgraded record
//! must not make the entire history unreadable, so validation supports
//! per-field recovery: a field that declares a default can be substituted
//! instead of rejecting the whole record, and corrupt elements of a
//! collection can be dropped instead of failing the load.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::{Map, Value};

/// Expected JSON type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    fn name(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }
}

/// Constraints for a single declared field.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    field_type: FieldType,
    required: bool,
    min: Option<f64>,
    max: Option<f64>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    pattern: Option<Regex>,
    allowed: Option<Vec<String>>,
    default: Option<Value>,
    /// Sub-schema for object fields.
    properties: Option<Box<Schema>>,
    /// Sub-schema for elements of array fields.
    items: Option<Box<Schema>>,
}

impl FieldSpec {
    fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            min: None,
            max: None,
            min_length: None,
            max_length: None,
            pattern: None,
            allowed: None,
            default: None,
            properties: None,
            items: None,
        }
    }

    pub fn string() -> Self {
        Self::new(FieldType::String)
    }

    pub fn integer() -> Self {
        Self::new(FieldType::Integer)
    }

    pub fn number() -> Self {
        Self::new(FieldType::Number)
    }

    pub fn boolean() -> Self {
        Self::new(FieldType::Boolean)
    }

    /// Array field whose elements validate against `items`.
    pub fn array_of(items: Schema) -> Self {
        let mut spec = Self::new(FieldType::Array);
        spec.items = Some(Box::new(items));
        spec
    }

    /// Object field validated against a nested schema.
    pub fn object(properties: Schema) -> Self {
        let mut spec = Self::new(FieldType::Object);
        spec.properties = Some(Box::new(properties));
        spec
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn min_length(mut self, len: usize) -> Self {
        self.min_length = Some(len);
        self
    }

    pub fn max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }

    /// Constrain string values to the given regex.
    ///
    /// Schemas are static declarations, so an invalid pattern is a programmer
    /// error and panics at construction.
    pub fn pattern(mut self, pattern: &str) -> Self {
        self.pattern = Some(Regex::new(pattern).expect("field pattern should be a valid regex"));
        self
    }

    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.allowed = Some(values.iter().map(|v| (*v).to_string()).collect());
        self
    }

    /// Declare a recovery default. A field with a default is expected to be
    /// present; a missing or invalid value is replaced under recovery mode.
    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    fn constraint_error(&self, value: &Value) -> Option<String> {
        if !self.field_type.matches(value) {
            return Some(format!(
                "expected {}, got {}",
                self.field_type.name(),
                json_type_name(value)
            ));
        }
        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min
                && n < min
            {
                return Some(format!("{n} is below minimum {min}"));
            }
            if let Some(max) = self.max
                && n > max
            {
                return Some(format!("{n} is above maximum {max}"));
            }
        }
        if let Some(s) = value.as_str() {
            let chars = s.chars().count();
            if let Some(min) = self.min_length
                && chars < min
            {
                return Some(format!("length {chars} is below minimum {min}"));
            }
            if let Some(max) = self.max_length
                && chars > max
            {
                return Some(format!("length {chars} is above maximum {max}"));
            }
            if let Some(pattern) = &self.pattern
                && !pattern.is_match(s)
            {
                return Some(format!("value does not match pattern {}", pattern.as_str()));
            }
            if let Some(allowed) = &self.allowed
                && !allowed.iter().any(|a| a == s)
            {
                return Some(format!("value not in {{{}}}", allowed.join(", ")));
            }
        }
        None
    }
}

/// A named set of field constraints for one persisted structure.
#[derive(Debug, Clone)]
pub struct Schema {
    name: &'static str,
    fields: BTreeMap<&'static str, FieldSpec>,
    deny_unknown: bool,
}

impl Schema {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            fields: BTreeMap::new(),
            deny_unknown: false,
        }
    }

    pub fn field(mut self, name: &'static str, spec: FieldSpec) -> Self {
        self.fields.insert(name, spec);
        self
    }

    /// Reject fields not declared by the schema. By default unknown fields
    /// pass through untouched.
    pub fn deny_unknown_fields(mut self) -> Self {
        self.deny_unknown = true;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// One validation problem, with the path of the offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
    pub value: Option<Value>,
    /// Whether recovery substituted a default (or dropped the element).
    pub recovered: bool,
}

/// Outcome of validating one record against a [`Schema`].
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    /// True when no unrecovered issue remains.
    pub valid: bool,
    /// The (possibly repaired) record; `None` when validation failed.
    pub data: Option<Value>,
    pub issues: Vec<ValidationIssue>,
    pub has_recoveries: bool,
}

/// Outcome of validating a collection element-wise.
#[derive(Debug, Clone)]
pub struct ArrayOutcome {
    /// False when any element failed validation (dropped under recovery).
    pub valid: bool,
    /// Elements that validated (including recovered ones).
    pub data: Vec<Value>,
    pub issues: Vec<ValidationIssue>,
}

/// Failure detail from [`parse_json`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIssue {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for ParseIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (line {}, column {})",
            self.message, self.line, self.column
        )
    }
}

/// Parse raw text as JSON. Never panics; malformed input yields a
/// [`ParseIssue`] with position context instead.
pub fn parse_json(content: &str) -> Result<Value, ParseIssue> {
    serde_json::from_str(content).map_err(|err| ParseIssue {
        message: err.to_string(),
        line: err.line(),
        column: err.column(),
    })
}

/// Validate `value` against `schema`.
///
/// With `recover`, a missing or invalid field that declares a default is
/// replaced by it and marked recovered; without it, every violation makes the
/// record invalid.
pub fn validate(value: &Value, schema: &Schema, recover: bool) -> ValidationOutcome {
    let mut issues = Vec::new();
    let Some(map) = value.as_object() else {
        issues.push(ValidationIssue {
            path: String::new(),
            message: format!(
                "{}: expected object, got {}",
                schema.name,
                json_type_name(value)
            ),
            value: None,
            recovered: false,
        });
        return ValidationOutcome {
            valid: false,
            data: None,
            issues,
            has_recoveries: false,
        };
    };

    let mut repaired = map.clone();
    for (name, spec) in &schema.fields {
        validate_field(name, spec, &mut repaired, recover, &mut issues);
    }
    if schema.deny_unknown {
        reject_unknown_fields(schema, &mut repaired, recover, &mut issues);
    }

    finish(Value::Object(repaired), issues)
}

/// Validate each element of a collection independently.
///
/// Under recovery, elements that fail validation are dropped from the output
/// (not defaulted) while valid and recovered elements are kept; `valid`
/// reflects whether any element was dropped.
pub fn validate_array(value: &Value, item_schema: &Schema, recover: bool) -> ArrayOutcome {
    let Some(elements) = value.as_array() else {
        return ArrayOutcome {
            valid: false,
            data: Vec::new(),
            issues: vec![ValidationIssue {
                path: String::new(),
                message: format!(
                    "{}: expected array, got {}",
                    item_schema.name,
                    json_type_name(value)
                ),
                value: None,
                recovered: false,
            }],
        };
    };

    let mut data = Vec::new();
    let mut issues = Vec::new();
    let mut all_valid = true;
    for (index, element) in elements.iter().enumerate() {
        let outcome = validate(element, item_schema, recover);
        for issue in outcome.issues {
            issues.push(ValidationIssue {
                path: prefix_path(&format!("[{index}]"), &issue.path),
                ..issue
            });
        }
        if outcome.valid && let Some(element) = outcome.data {
            data.push(element);
        } else {
            all_valid = false;
            if recover {
                issues.push(ValidationIssue {
                    path: format!("[{index}]"),
                    message: format!("{} element dropped", item_schema.name),
                    value: None,
                    recovered: true,
                });
            }
        }
    }

    ArrayOutcome {
        valid: all_valid,
        data,
        issues,
    }
}

fn validate_field(
    name: &str,
    spec: &FieldSpec,
    record: &mut Map<String, Value>,
    recover: bool,
    issues: &mut Vec<ValidationIssue>,
) {
    let Some(value) = record.get(name).cloned() else {
        // Absent optional fields without a declared default are fine.
        if !spec.required && spec.default.is_none() {
            return;
        }
        if recover && let Some(default) = spec.default.clone() {
            record.insert(name.to_string(), default);
            issues.push(ValidationIssue {
                path: name.to_string(),
                message: "missing field recovered with default".to_string(),
                value: None,
                recovered: true,
            });
        } else {
            issues.push(ValidationIssue {
                path: name.to_string(),
                message: "missing required field".to_string(),
                value: None,
                recovered: false,
            });
        }
        return;
    };

    // Nested structures recurse into their own sub-schema.
    if let Some(sub) = &spec.properties {
        if !value.is_object() {
            fail_or_recover(name, spec, &value, "expected object", record, recover, issues);
            return;
        }
        let outcome = validate(&value, sub, recover);
        for issue in outcome.issues {
            issues.push(ValidationIssue {
                path: prefix_path(name, &issue.path),
                ..issue
            });
        }
        if let Some(data) = outcome.data
            && outcome.valid
        {
            record.insert(name.to_string(), data);
        }
        return;
    }
    if let Some(items) = &spec.items {
        if !value.is_array() {
            fail_or_recover(name, spec, &value, "expected array", record, recover, issues);
            return;
        }
        let outcome = validate_array(&value, items, recover);
        for issue in outcome.issues {
            issues.push(ValidationIssue {
                path: prefix_path(name, &issue.path),
                ..issue
            });
        }
        if recover || outcome.valid {
            record.insert(name.to_string(), Value::Array(outcome.data));
        }
        return;
    }

    if let Some(message) = spec.constraint_error(&value) {
        fail_or_recover(name, spec, &value, &message, record, recover, issues);
    }
}

fn fail_or_recover(
    name: &str,
    spec: &FieldSpec,
    value: &Value,
    message: &str,
    record: &mut Map<String, Value>,
    recover: bool,
    issues: &mut Vec<ValidationIssue>,
) {
    if recover && let Some(default) = spec.default.clone() {
        record.insert(name.to_string(), default);
        issues.push(ValidationIssue {
            path: name.to_string(),
            message: format!("{message}; recovered with default"),
            value: Some(value.clone()),
            recovered: true,
        });
    } else {
        issues.push(ValidationIssue {
            path: name.to_string(),
            message: message.to_string(),
            value: Some(value.clone()),
            recovered: false,
        });
    }
}

fn reject_unknown_fields(
    schema: &Schema,
    record: &mut Map<String, Value>,
    recover: bool,
    issues: &mut Vec<ValidationIssue>,
) {
    let unknown: Vec<String> = record
        .keys()
        .filter(|key| !schema.fields.contains_key(key.as_str()))
        .cloned()
        .collect();
    for key in unknown {
        if recover {
            record.remove(&key);
        }
        issues.push(ValidationIssue {
            path: key.clone(),
            message: "unknown field".to_string(),
            value: None,
            recovered: recover,
        });
    }
}

fn finish(repaired: Value, issues: Vec<ValidationIssue>) -> ValidationOutcome {
    let has_recoveries = issues.iter().any(|issue| issue.recovered);
    let valid = issues.iter().all(|issue| issue.recovered);
    ValidationOutcome {
        valid,
        data: valid.then_some(repaired),
        issues,
        has_recoveries,
    }
}

fn prefix_path(prefix: &str, path: &str) -> String {
    if path.is_empty() {
        prefix.to_string()
    } else if path.starts_with('[') {
        format!("{prefix}{path}")
    } else {
        format!("{prefix}.{path}")
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
