//! Response contract enforcement for generated content.
//!
//! The generation service answers with free text that *should* contain one
//! JSON object. [`ResponseValidator::validate`] digs the object out of any
//! surrounding noise (code fences, reasoning blocks, prose), then applies the
//! job's [`ResponseContract`]:
//!
//! 1. required fields are present and non-empty
//! 2. counted fields have exactly the element count the record implies
//! 3. numeric ranges are clamped (numeric strings normalized first)
//! 4. authoritative fields are restored to the record's value
//! 5. the optional JSON Schema accepts the corrected payload
//!
//! Field paths are dotted; a `*` segment addresses every element of an array
//! (`messages.*.score`).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::AppError;
use crate::models::{Fields, Record};
use crate::util::{self, lookup, set_path};

/// Typed reasons a response is rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("field '{field}' has {actual} elements, expected {expected}")]
    CountMismatch {
        field: String,
        expected: usize,
        actual: usize,
    },

    #[error("field '{field}' value {value} is outside [{min}, {max}]")]
    OutOfRange {
        field: String,
        value: String,
        min: f64,
        max: f64,
    },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// What to do when the service returns more elements than requested.
///
/// Fewer elements than requested are always an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountPolicy {
    #[default]
    Reject,
    Truncate,
}

/// An array field whose length must track the input record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountedField {
    /// Array path in the payload.
    pub field: String,
    /// Record path holding the expected count: a number, or an array whose
    /// length is used.
    pub expected_from: String,
}

/// A numeric field with a declared domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeRule {
    pub field: String,
    pub min: f64,
    pub max: f64,
    /// Round to the nearest integer after clamping.
    #[serde(default)]
    pub integer: bool,
}

/// A payload field that must equal a value the caller already knows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthoritativeField {
    /// Payload path.
    pub field: String,
    /// Record path holding the authoritative value.
    pub source: String,
}

/// Declarative response contract, usually loaded from the job file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseContract {
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub counted_fields: Vec<CountedField>,
    #[serde(default)]
    pub ranges: Vec<RangeRule>,
    #[serde(default)]
    pub authoritative_fields: Vec<AuthoritativeField>,
    #[serde(default)]
    pub count_policy: CountPolicy,
    /// Optional JSON Schema the corrected payload must satisfy.
    #[serde(default)]
    pub schema: Option<Value>,
    /// Top-level payload keys written back to the record. All keys if unset.
    #[serde(default)]
    pub output_fields: Option<Vec<String>>,
}

/// Compiled, shareable validator for one [`ResponseContract`].
#[derive(Clone)]
pub struct ResponseValidator {
    contract: ResponseContract,
    schema: Option<Arc<jsonschema::Validator>>,
}

impl ResponseValidator {
    /// Compile the contract. An invalid embedded schema is a configuration error.
    pub fn new(contract: ResponseContract) -> Result<Self, AppError> {
        let schema = contract
            .schema
            .as_ref()
            .map(|s| {
                jsonschema::validator_for(s)
                    .map(Arc::new)
                    .map_err(|e| AppError::ConfigError(format!("Invalid response schema: {e}")))
            })
            .transpose()?;

        Ok(Self { contract, schema })
    }

    pub fn contract(&self) -> &ResponseContract {
        &self.contract
    }

    /// Parse and correct `raw`, returning the fields to persist for `record`.
    pub fn validate(&self, raw: &str, record: &Record) -> Result<Fields, ValidationError> {
        let mut payload = locate_payload(raw)?;
        if !payload.is_object() {
            return Err(ValidationError::MalformedPayload(format!(
                "expected a JSON object, got {}",
                util::type_name(&payload)
            )));
        }

        self.check_required(&payload)?;
        self.check_counts(&mut payload, record)?;
        self.apply_ranges(&mut payload)?;
        self.restore_authoritative(&mut payload, record)?;

        if let Some(schema) = &self.schema {
            let errors: Vec<String> = schema
                .iter_errors(&payload)
                .take(3)
                .map(|e| e.to_string())
                .collect();
            if !errors.is_empty() {
                return Err(ValidationError::MalformedPayload(format!(
                    "schema violation: {}",
                    errors.join("; ")
                )));
            }
        }

        let Value::Object(mut fields) = payload else {
            return Err(ValidationError::MalformedPayload(
                "payload stopped being an object".to_string(),
            ));
        };
        if let Some(keep) = &self.contract.output_fields {
            fields.retain(|k, _| keep.iter().any(|f| f == k));
        }
        Ok(fields)
    }

    fn check_required(&self, payload: &Value) -> Result<(), ValidationError> {
        for field in &self.contract.required_fields {
            match lookup(payload, field) {
                None | Some(Value::Null) => {
                    return Err(ValidationError::MissingField(field.clone()));
                }
                Some(Value::String(s)) if s.is_empty() => {
                    return Err(ValidationError::MissingField(field.clone()));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn check_counts(&self, payload: &mut Value, record: &Record) -> Result<(), ValidationError> {
        for rule in &self.contract.counted_fields {
            let expected = match record.get(&rule.expected_from) {
                Some(Value::Array(items)) => items.len(),
                Some(Value::Number(n)) => match n.as_u64() {
                    Some(n) => n as usize,
                    None => continue,
                },
                _ => {
                    tracing::debug!(
                        record_id = %record.id,
                        source = %rule.expected_from,
                        "No expected count on record, skipping count check"
                    );
                    continue;
                }
            };

            let items = match lookup_mut(payload, &rule.field) {
                Some(Value::Array(items)) => items,
                Some(other) => {
                    return Err(ValidationError::MalformedPayload(format!(
                        "field '{}' must be an array, got {}",
                        rule.field,
                        util::type_name(other)
                    )));
                }
                None => return Err(ValidationError::MissingField(rule.field.clone())),
            };

            let actual = items.len();
            if actual == expected {
                continue;
            }
            if actual > expected && self.contract.count_policy == CountPolicy::Truncate {
                tracing::warn!(
                    record_id = %record.id,
                    field = %rule.field,
                    expected,
                    actual,
                    "Truncating surplus generated elements"
                );
                items.truncate(expected);
                continue;
            }
            return Err(ValidationError::CountMismatch {
                field: rule.field.clone(),
                expected,
                actual,
            });
        }
        Ok(())
    }

    fn apply_ranges(&self, payload: &mut Value) -> Result<(), ValidationError> {
        for rule in &self.contract.ranges {
            let segments = util::split_path(&rule.field);
            let mut outcome = Ok(());
            for_each_mut(payload, &segments, &mut |value| {
                if outcome.is_ok() {
                    outcome = clamp_value(value, rule);
                }
            });
            outcome?;
        }
        Ok(())
    }

    fn restore_authoritative(
        &self,
        payload: &mut Value,
        record: &Record,
    ) -> Result<(), ValidationError> {
        for rule in &self.contract.authoritative_fields {
            let Some(expected) = record.get(&rule.source) else {
                continue;
            };
            if lookup(payload, &rule.field) == Some(expected) {
                continue;
            }

            tracing::warn!(
                record_id = %record.id,
                field = %rule.field,
                "Service altered an authoritative field, restoring it"
            );
            set_path(payload, &rule.field, expected.clone()).map_err(|e| {
                ValidationError::MalformedPayload(format!(
                    "cannot restore authoritative field '{}': {e}",
                    rule.field
                ))
            })?;
        }
        Ok(())
    }
}

fn clamp_value(value: &mut Value, rule: &RangeRule) -> Result<(), ValidationError> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    let Some(number) = number.filter(|n| n.is_finite()) else {
        return Err(ValidationError::OutOfRange {
            field: rule.field.clone(),
            value: value.to_string(),
            min: rule.min,
            max: rule.max,
        });
    };

    let mut clamped = number.clamp(rule.min, rule.max);
    if rule.integer {
        clamped = clamped.round();
    }
    if clamped != number {
        tracing::debug!(field = %rule.field, from = number, to = clamped, "Clamped value");
    }

    *value = if rule.integer {
        Value::from(clamped as i64)
    } else {
        serde_json::Number::from_f64(clamped)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    };
    Ok(())
}

/// Visit every value addressed by `segments`, expanding `*` over arrays.
fn for_each_mut(value: &mut Value, segments: &[&str], f: &mut dyn FnMut(&mut Value)) {
    let Some((head, rest)) = segments.split_first() else {
        f(value);
        return;
    };

    match (head, value) {
        (&"*", Value::Array(items)) => {
            for item in items {
                for_each_mut(item, rest, f);
            }
        }
        (key, Value::Object(map)) => {
            if let Some(child) = map.get_mut(*key) {
                for_each_mut(child, rest, f);
            }
        }
        (index, Value::Array(items)) => {
            if let Some(child) = index.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                for_each_mut(child, rest, f);
            }
        }
        _ => {}
    }
}

fn lookup_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    util::split_path(path)
        .into_iter()
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get_mut(segment),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(move |i| items.get_mut(i)),
            _ => None,
        })
}

/// Find the first balanced JSON object in `raw` that parses.
///
/// Reasoning blocks (`<think>…</think>`) are dropped first since they often
/// contain brace-heavy scratch work.
pub fn locate_payload(raw: &str) -> Result<Value, ValidationError> {
    let text = strip_reasoning(raw);
    let mut last_error = None;

    for (start, _) in text.match_indices('{') {
        let Some(end) = balanced_end(&text[start..]) else {
            last_error.get_or_insert_with(|| "unterminated JSON object".to_string());
            continue;
        };
        match serde_json::from_str::<Value>(&text[start..start + end]) {
            Ok(value) => return Ok(value),
            Err(e) => last_error = Some(e.to_string()),
        }
    }

    Err(ValidationError::MalformedPayload(
        last_error.unwrap_or_else(|| "no JSON object found in response".to_string()),
    ))
}

fn strip_reasoning(raw: &str) -> String {
    const OPEN: &str = "<think>";
    const CLOSE: &str = "</think>";

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        match rest[start..].find(CLOSE) {
            Some(end) => rest = &rest[start + end + CLOSE.len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Byte length of the balanced `{...}` prefix of `s`, honoring JSON strings.
fn balanced_end(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}
