//! EdgeEvaluator — decides whether a completed predecessor's edge to a successor is
//! satisfied given the predecessor's output.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::graph::{Condition, ConditionOperator, EdgeKind, EdgeSpec};

/// Evaluates edge satisfaction against a predecessor's JSON output.
pub struct EdgeEvaluator;

impl EdgeEvaluator {
    /// An edge from a completed predecessor is satisfied iff it is a `sequence` edge,
    /// or every condition on it holds against `output`.
    pub fn is_satisfied(edge: &EdgeSpec, output: &Value) -> bool {
        match edge.kind {
            EdgeKind::Sequence => true,
            EdgeKind::Conditional => edge.conditions.iter().all(|c| Self::eval(c, output)),
        }
    }

    fn eval(condition: &Condition, output: &Value) -> bool {
        let field = extract_field(output, &condition.field);
        match condition.operator {
            ConditionOperator::Equals => values_equal(field, &condition.value),
            ConditionOperator::NotEquals => !values_equal(field, &condition.value),
            ConditionOperator::GreaterThan => numeric_cmp(field, &condition.value)
                .map(|(a, b)| a > b)
                .unwrap_or(false),
            ConditionOperator::LessThan => numeric_cmp(field, &condition.value)
                .map(|(a, b)| a < b)
                .unwrap_or(false),
            ConditionOperator::In => match &condition.value {
                Value::Array(items) => field.map(|f| items.contains(f)).unwrap_or(false),
                _ => false,
            },
            ConditionOperator::Contains => match (field.and_then(Value::as_str), condition.value.as_str()) {
                (Some(haystack), Some(needle)) => haystack.contains(needle),
                _ => false,
            },
            ConditionOperator::WithinHours => Self::within_hours(field, &condition.value),
        }
    }

    fn within_hours(field: Option<&Value>, configured_hours: &Value) -> bool {
        let hours = match configured_hours.as_f64() {
            Some(h) => h,
            None => return false,
        };
        let timestamp = match field.and_then(Value::as_str) {
            Some(s) => s,
            None => return false,
        };
        let parsed: DateTime<Utc> = match DateTime::parse_from_rfc3339(timestamp) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(_) => return false,
        };
        let elapsed = Utc::now().signed_duration_since(parsed);
        let elapsed_hours = elapsed.num_milliseconds() as f64 / 3_600_000.0;
        elapsed_hours <= hours
    }
}

/// Walk a dot-path into a JSON value. Any missing segment yields `None` (undefined).
fn extract_field<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return None,
        }
    }
    Some(current)
}

/// `equals`/`not_equals`: undefined (missing field) compares unequal to any literal,
/// and JSON `null` is treated as undefined for this purpose.
fn values_equal(field: Option<&Value>, literal: &Value) -> bool {
    match field {
        None => false,
        Some(Value::Null) => false,
        Some(v) => v == literal,
    }
}

fn numeric_cmp(field: Option<&Value>, literal: &Value) -> Option<(f64, f64)> {
    let a = field.and_then(Value::as_f64)?;
    let b = literal.as_f64()?;
    Some((a, b))
}
