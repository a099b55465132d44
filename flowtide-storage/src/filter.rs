//! Document filters.
//!
//! A [`Filter`] is a conjunction of per-field conditions. Field names may use
//! dots to reach into nested objects (`client_to_server.bytes`).

use std::cmp::Ordering;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Gte(Value),
    Lte(Value),
    /// Field equals one of the values.
    In(Vec<Value>),
    /// Field is an array containing the value.
    Contains(Value),
}

impl Condition {
    fn matches(&self, field: Option<&Value>) -> bool {
        match self {
            Condition::Eq(expected) => field.is_some_and(|v| loosely_equal(v, expected)),
            Condition::Ne(expected) => !field.is_some_and(|v| loosely_equal(v, expected)),
            Condition::Gte(bound) => {
                field.and_then(|v| compare(v, bound)).is_some_and(Ordering::is_ge)
            }
            Condition::Lte(bound) => {
                field.and_then(|v| compare(v, bound)).is_some_and(Ordering::is_le)
            }
            Condition::In(options) => {
                field.is_some_and(|v| options.iter().any(|o| loosely_equal(v, o)))
            }
            Condition::Contains(item) => field
                .and_then(Value::as_array)
                .is_some_and(|items| items.iter().any(|v| loosely_equal(v, item))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Condition)>,
}

impl Filter {
    /// Matches every document.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self::all().eq("_id", Value::String(id.into()))
    }

    pub fn with(mut self, field: impl Into<String>, condition: Condition) -> Self {
        self.conditions.push((field.into(), condition));
        self
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Eq(value.into()))
    }

    pub fn ne(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Ne(value.into()))
    }

    pub fn gte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Gte(value.into()))
    }

    pub fn lte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Lte(value.into()))
    }

    pub fn is_in<V: Into<Value>>(self, field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        self.with(field, Condition::In(values.into_iter().map(Into::into).collect()))
    }

    pub fn contains(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(field, Condition::Contains(value.into()))
    }

    pub fn conditions(&self) -> &[(String, Condition)] {
        &self.conditions
    }

    pub fn matches(&self, document: &Value) -> bool {
        self.conditions
            .iter()
            .all(|(field, condition)| condition.matches(lookup(document, field)))
    }
}

fn lookup<'a>(document: &'a Value, field: &str) -> Option<&'a Value> {
    field
        .split('.')
        .try_fold(document, |value, segment| value.get(segment))
        .filter(|v| !v.is_null())
}

/// Numbers compare by value regardless of their JSON representation.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y) == Some(Ordering::Equal),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn compare_numbers(x: &serde_json::Number, y: &serde_json::Number) -> Option<Ordering> {
    match (x.as_u64(), y.as_u64()) {
        (Some(x), Some(y)) => Some(x.cmp(&y)),
        _ => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
    }
}
