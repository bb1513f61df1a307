use super::functions::display_value;
use super::transformer::{TransformerConfig, ValueFn};
use crate::entity::EntityId;
use crate::sensor::Sensor;
use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;

/// How list items are rendered into the joined string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOptions {
    pub separator: String,
    /// Wrap each item in double quotes, JSON-escaped
    pub quote: bool,
    /// Fewer non-null items than this publishes null
    pub minimum: Option<usize>,
    /// Items beyond this are dropped
    pub maximum: Option<usize>,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            separator: ",".to_string(),
            quote: true,
            minimum: None,
            maximum: None,
        }
    }
}

/// Join a list value into a string; a lone scalar counts as a one-item list
pub fn join_values(value: &Value, options: &JoinOptions) -> Value {
    let items: Vec<&Value> = match value {
        Value::Null => return Value::Null,
        Value::Array(items) => items.iter().filter(|v| !v.is_null()).collect(),
        other => vec![other],
    };

    if options.minimum.is_some_and(|min| items.len() < min) {
        return Value::Null;
    }
    let limit = options.maximum.unwrap_or(items.len());

    let rendered: Vec<String> = items
        .into_iter()
        .take(limit)
        .map(|item| {
            let text = display_value(item);
            if options.quote {
                Value::String(text).to_string()
            } else {
                text
            }
        })
        .collect();
    Value::String(rendered.join(&options.separator))
}

/// Transformer configuration that publishes `source` joined into `target`
pub(crate) fn joiner_config(
    producer: Option<EntityId>,
    source: Sensor,
    target: Option<Sensor>,
    options: JoinOptions,
) -> TransformerConfig {
    let target = target.unwrap_or_else(|| source.clone());
    let tag = format!("joiner:{}->{}", source, target);
    let join: ValueFn = Arc::new(move |value: &Value| -> Result<Option<Value>> {
        Ok(Some(join_values(value, &options)))
    });
    TransformerConfig {
        producer,
        source_sensor: Some(source),
        target_sensor: Some(target),
        from_value: Some(join),
        unique_tag: Some(tag),
        ..Default::default()
    }
}
