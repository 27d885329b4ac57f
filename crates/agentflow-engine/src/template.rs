//! `${...}` references in node inputs, parsed once when a graph is built.
//!
//! Three reference shapes exist:
//! - `${trigger_data.FIELD}` reads the execution's trigger payload;
//! - `${NODE_ID.FIELD}` reads one field of a completed node's output;
//! - `${KEY}` reads `execution_data[KEY]`, falling back to `trigger_data[KEY]`.
//!
//! Only a string that is a single whole reference is a template. Anything
//! else is a literal and passes through unchanged. References that are well
//! formed but point at nothing resolve to `null` with a warning; malformed
//! ones are rejected when the graph is built.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use agentflow_core::error::{FlowError, Result};
use agentflow_core::types::Payload;
use agentflow_core::ExecutionData;

const TRIGGER_SCOPE: &str = "trigger_data";

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\$\{([^{}]*)\}$").expect("valid reference pattern"))
}

/// A parsed `${...}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Trigger(String),
    NodeOutput { node_id: String, field: String },
    Bare(String),
}

impl Reference {
    /// Parse the body of a reference (the text between `${` and `}`).
    ///
    /// Only the first dot splits scope from field; `a.b.c` reads the flat
    /// field `b.c` of node `a`.
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(FlowError::Structural("empty template reference".into()));
        }

        match expr.split_once('.') {
            Some((scope, field)) => {
                let (scope, field) = (scope.trim(), field.trim());
                if scope.is_empty() || field.is_empty() {
                    return Err(FlowError::Structural(format!(
                        "malformed template reference '${{{}}}'",
                        expr
                    )));
                }
                if scope == TRIGGER_SCOPE {
                    Ok(Reference::Trigger(field.to_string()))
                } else {
                    Ok(Reference::NodeOutput {
                        node_id: scope.to_string(),
                        field: field.to_string(),
                    })
                }
            }
            None => Ok(Reference::Bare(expr.to_string())),
        }
    }

    /// Parse a template value. `Ok(None)` means the string is a literal.
    pub fn parse_template(value: &str) -> Result<Option<Self>> {
        match reference_pattern().captures(value) {
            Some(caps) => Self::parse(&caps[1]).map(Some),
            None => Ok(None),
        }
    }

    /// Parse a predicate field, which may omit the `${}` wrapper.
    pub fn parse_field(field: &str) -> Result<Self> {
        match Self::parse_template(field)? {
            Some(reference) => Ok(reference),
            None => Self::parse(field),
        }
    }

    /// Node whose output this reference reads, if it names one explicitly.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Reference::NodeOutput { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Trigger(field) => write!(f, "${{{}.{}}}", TRIGGER_SCOPE, field),
            Reference::NodeOutput { node_id, field } => write!(f, "${{{}.{}}}", node_id, field),
            Reference::Bare(key) => write!(f, "${{{}}}", key),
        }
    }
}

/// One entry of a compiled input template.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    Literal(Value),
    Ref(Reference),
}

/// A node's input template with every reference pre-parsed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputTemplate {
    entries: Vec<(String, TemplateValue)>,
}

impl InputTemplate {
    pub fn compile(raw: &Payload) -> Result<Self> {
        let mut entries = Vec::with_capacity(raw.len());
        for (key, value) in raw {
            let compiled = match value {
                Value::String(s) => match Reference::parse_template(s)? {
                    Some(reference) => TemplateValue::Ref(reference),
                    None => TemplateValue::Literal(value.clone()),
                },
                other => TemplateValue::Literal(other.clone()),
            };
            entries.push((key.clone(), compiled));
        }
        Ok(Self { entries })
    }

    pub fn references(&self) -> impl Iterator<Item = &Reference> {
        self.entries.iter().filter_map(|(_, v)| match v {
            TemplateValue::Ref(r) => Some(r),
            TemplateValue::Literal(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves compiled templates against execution data and trigger data.
pub struct TemplateResolver;

impl TemplateResolver {
    /// Produce a node's concrete input.
    pub fn resolve(template: &InputTemplate, data: &ExecutionData, trigger: &Payload) -> Payload {
        template
            .entries
            .iter()
            .map(|(key, value)| {
                let resolved = match value {
                    TemplateValue::Literal(v) => v.clone(),
                    TemplateValue::Ref(reference) => Self::lookup(reference, data, trigger),
                };
                (key.clone(), resolved)
            })
            .collect()
    }

    /// Resolve one reference. Unresolvable references yield `null`.
    pub fn lookup(reference: &Reference, data: &ExecutionData, trigger: &Payload) -> Value {
        match Self::try_lookup(reference, data, trigger) {
            Some(value) => value.clone(),
            None => {
                warn!(reference = %reference, "Template reference did not resolve, using null");
                Value::Null
            }
        }
    }

    fn try_lookup<'a>(
        reference: &Reference,
        data: &'a ExecutionData,
        trigger: &'a Payload,
    ) -> Option<&'a Value> {
        match reference {
            Reference::Trigger(field) => trigger.get(field),
            Reference::NodeOutput { node_id, field } => data.field(node_id, field),
            Reference::Bare(key) => data.get(key).or_else(|| trigger.get(key)),
        }
    }
}
