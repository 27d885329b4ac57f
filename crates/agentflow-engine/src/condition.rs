use serde_json::Value;
use tracing::{debug, warn};

use agentflow_core::error::Result;
use agentflow_core::flow::{Operator, Predicate};
use agentflow_core::types::Payload;
use agentflow_core::ExecutionData;

use crate::template::{Reference, TemplateResolver};

/// A predicate with its field reference pre-parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: Reference,
    pub operator: Operator,
    pub value: Value,
}

impl Condition {
    pub fn compile(predicate: &Predicate) -> Result<Self> {
        Ok(Self {
            field: Reference::parse_field(&predicate.field)?,
            operator: predicate.operator.clone(),
            value: predicate.value.clone(),
        })
    }
}

/// Evaluates binary predicates for conditional edges and condition nodes.
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Unsupported operators and non-numeric ordering comparisons are `false`.
    pub fn evaluate(condition: &Condition, data: &ExecutionData, trigger: &Payload) -> bool {
        let actual = TemplateResolver::lookup(&condition.field, data, trigger);
        let expected = &condition.value;

        let result = match &condition.operator {
            Operator::Equals => values_equal(&actual, expected),
            Operator::NotEquals => !values_equal(&actual, expected),
            Operator::GreaterThan => compare_numbers(&actual, expected, |a, b| a > b),
            Operator::LessThan => compare_numbers(&actual, expected, |a, b| a < b),
            Operator::Unsupported(name) => {
                warn!(operator = %name, field = %condition.field, "Unsupported condition operator, treating as false");
                false
            }
        };

        debug!(field = %condition.field, actual = %actual, expected = %expected, result, "Condition evaluated");
        result
    }
}

/// JSON equality, treating numbers and numeric strings by value.
fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn compare_numbers(a: &Value, b: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => cmp(x, y),
        _ => false,
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
