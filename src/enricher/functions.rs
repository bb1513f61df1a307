use super::error::ConfigError;
use anyhow::{anyhow, bail, Result};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Custom aggregation over the filtered producer values; None means "no change"
pub type AggregateFn = Arc<dyn Fn(&[Value]) -> Result<Option<Value>> + Send + Sync>;

/// Custom reduction over source sensor values in declaration order
pub type ReduceFn = Arc<dyn Fn(&[Value]) -> Result<Option<Value>> + Send + Sync>;

/// Predicate over producer values; false excludes the value
pub type ValuePredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Which stored values reach the aggregation
#[derive(Clone, Default)]
pub enum ValueFilter {
    #[default]
    AcceptAll,
    /// Drop nulls and whitespace-only strings
    ExcludeBlank,
    Custom(ValuePredicate),
}

impl ValueFilter {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ValueFilter::AcceptAll => true,
            ValueFilter::ExcludeBlank => !is_blank(value),
            ValueFilter::Custom(predicate) => predicate(value),
        }
    }
}

impl fmt::Debug for ValueFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueFilter::AcceptAll => f.write_str("AcceptAll"),
            ValueFilter::ExcludeBlank => f.write_str("ExcludeBlank"),
            ValueFilter::Custom(_) => f.write_str("Custom"),
        }
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Substitutes used by the numeric aggregations
#[derive(Debug, Clone, Default)]
pub struct NumericDefaults {
    /// Stands in for a null input; nulls are skipped when unset
    pub value_if_null: Option<Value>,
    /// Result when no numeric input remains; null when unset
    pub value_if_none: Option<Value>,
}

/// Aggregation applied by an aggregator
#[derive(Clone)]
pub enum Aggregation {
    List,
    Sum,
    Average,
    Custom(AggregateFn),
}

impl Aggregation {
    /// Pick the aggregation from a name and/or custom function
    ///
    /// With neither, the filtered values are published as a list.
    pub fn resolve(name: Option<&str>, custom: Option<AggregateFn>) -> Result<Self, ConfigError> {
        match (name, custom) {
            (Some(name), Some(_)) => Err(ConfigError::ConflictingTransformation(name.to_string())),
            (None, Some(f)) => Ok(Aggregation::Custom(f)),
            (None, None) => Ok(Aggregation::List),
            (Some(name), None) => match name {
                "list" => Ok(Aggregation::List),
                "sum" => Ok(Aggregation::Sum),
                "average" => Ok(Aggregation::Average),
                other => Err(ConfigError::UnknownTransformation(other.to_string())),
            },
        }
    }

    pub fn apply(&self, values: &[Value], defaults: &NumericDefaults) -> Result<Option<Value>> {
        match self {
            Aggregation::List => Ok(Some(Value::Array(values.to_vec()))),
            Aggregation::Sum => sum(values, defaults).map(Some),
            Aggregation::Average => average(values, defaults).map(Some),
            Aggregation::Custom(f) => f(values),
        }
    }
}

impl fmt::Debug for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::List => f.write_str("List"),
            Aggregation::Sum => f.write_str("Sum"),
            Aggregation::Average => f.write_str("Average"),
            Aggregation::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Rule deciding whether enough inputs are healthy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumCheck {
    All,
    AllAndAtLeastOne,
    AtLeastOne,
    AtLeastOneUnlessEmpty,
    AlwaysTrue,
    AtLeast(usize),
}

impl QuorumCheck {
    pub fn is_quorate(self, healthy: usize, total: usize) -> bool {
        match self {
            QuorumCheck::All => healthy >= total,
            QuorumCheck::AllAndAtLeastOne => healthy >= 1 && healthy >= total,
            QuorumCheck::AtLeastOne => healthy >= 1,
            QuorumCheck::AtLeastOneUnlessEmpty => total == 0 || healthy >= 1,
            QuorumCheck::AlwaysTrue => true,
            QuorumCheck::AtLeast(n) => healthy >= n,
        }
    }

    /// Aggregation publishing whether the `true` inputs form a quorum
    ///
    /// The population is `total_size` when given, else the number of inputs.
    pub fn computing(self, total_size: Option<usize>) -> AggregateFn {
        Arc::new(move |values: &[Value]| -> Result<Option<Value>> {
            let healthy = values.iter().filter(|v| v.as_bool() == Some(true)).count();
            let total = total_size.unwrap_or(values.len());
            Ok(Some(Value::Bool(self.is_quorate(healthy, total))))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }
}

/// Interpret a value as a number; None for null, error for anything non-numeric
fn numeric(value: &Value) -> Result<Option<Number>> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(Some(Number::Int(i))),
            None => n
                .as_f64()
                .map(|f| Some(Number::Float(f)))
                .ok_or_else(|| anyhow!("number {} out of range", n)),
        },
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                Ok(Some(Number::Int(i)))
            } else if let Ok(f) = trimmed.parse::<f64>() {
                Ok(Some(Number::Float(f)))
            } else {
                bail!("value {:?} is not numeric", s)
            }
        }
        other => bail!("value {} is not numeric", other),
    }
}

fn numbers(values: &[Value], defaults: &NumericDefaults) -> Result<Vec<Number>> {
    let substitute = match &defaults.value_if_null {
        Some(v) => numeric(v)?,
        None => None,
    };
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        match numeric(value)? {
            Some(n) => out.push(n),
            None => out.extend(substitute),
        }
    }
    Ok(out)
}

fn empty_result(defaults: &NumericDefaults) -> Value {
    defaults.value_if_none.clone().unwrap_or(Value::Null)
}

/// Sum of the numeric inputs; integer if every input is an integer
pub fn sum(values: &[Value], defaults: &NumericDefaults) -> Result<Value> {
    let numbers = numbers(values, defaults)?;
    if numbers.is_empty() {
        return Ok(empty_result(defaults));
    }

    let mut int_total: Option<i64> = Some(0);
    let mut float_total = 0.0;
    for n in &numbers {
        float_total += n.as_f64();
        int_total = match (int_total, n) {
            (Some(acc), Number::Int(i)) => acc.checked_add(*i),
            _ => None,
        };
    }
    Ok(match int_total {
        Some(total) => Value::from(total),
        None => Value::from(float_total),
    })
}

/// Arithmetic mean of the numeric inputs, always a float
pub fn average(values: &[Value], defaults: &NumericDefaults) -> Result<Value> {
    let numbers = numbers(values, defaults)?;
    if numbers.is_empty() {
        return Ok(empty_result(defaults));
    }
    let total: f64 = numbers.iter().map(|n| n.as_f64()).sum();
    Ok(Value::from(total / numbers.len() as f64))
}

/// Render a value for text output: strings unquoted, null as empty
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Reduction applied by a reducer
#[derive(Clone)]
pub enum Reduction {
    /// Fill `{}` placeholders in order, or join with a separator
    Joiner {
        format: Option<String>,
        separator: String,
    },
    Sum,
    List,
    Custom(ReduceFn),
}

pub const DEFAULT_REDUCER: &str = "joiner";
const DEFAULT_SEPARATOR: &str = ",";

impl Reduction {
    /// Pick the reduction; a bare reducer joins its inputs
    pub fn resolve(
        name: Option<&str>,
        custom: Option<ReduceFn>,
        parameters: &Map<String, Value>,
    ) -> Result<Self, ConfigError> {
        match (name, custom) {
            (Some(name), Some(_)) => Err(ConfigError::ConflictingTransformation(name.to_string())),
            (None, Some(f)) => Ok(Reduction::Custom(f)),
            (name, None) => match name.unwrap_or(DEFAULT_REDUCER) {
                "joiner" => Ok(Reduction::Joiner {
                    format: parameters
                        .get("format")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    separator: parameters
                        .get("separator")
                        .and_then(Value::as_str)
                        .unwrap_or(DEFAULT_SEPARATOR)
                        .to_string(),
                }),
                "sum" => Ok(Reduction::Sum),
                "list" => Ok(Reduction::List),
                other => Err(ConfigError::UnknownTransformation(other.to_string())),
            },
        }
    }

    pub fn apply(&self, values: &[Value]) -> Result<Option<Value>> {
        match self {
            Reduction::Joiner { format, separator } => {
                let text = match format {
                    Some(format) => fill_placeholders(format, values),
                    None => values
                        .iter()
                        .map(display_value)
                        .collect::<Vec<_>>()
                        .join(separator),
                };
                Ok(Some(Value::String(text)))
            }
            Reduction::Sum => sum(values, &NumericDefaults::default()).map(Some),
            Reduction::List => Ok(Some(Value::Array(values.to_vec()))),
            Reduction::Custom(f) => f(values),
        }
    }
}

impl fmt::Debug for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reduction::Joiner { format, separator } => f
                .debug_struct("Joiner")
                .field("format", format)
                .field("separator", separator)
                .finish(),
            Reduction::Sum => f.write_str("Sum"),
            Reduction::List => f.write_str("List"),
            Reduction::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Replace each `{}` with the next value; surplus placeholders become empty
fn fill_placeholders(format: &str, values: &[Value]) -> String {
    let mut out = String::with_capacity(format.len());
    let mut args = values.iter();
    let mut rest = format;
    while let Some(pos) = rest.find("{}") {
        out.push_str(&rest[..pos]);
        if let Some(value) = args.next() {
            out.push_str(&display_value(value));
        }
        rest = &rest[pos + 2..];
    }
    out.push_str(rest);
    out
}
