//! Sorted fetches: sort keys, ranking and window bounds.

use std::cmp::Ordering;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{JetError, Result};
use crate::matcher::lookup_field;

/// Window length used when `to` is omitted.
pub const DEFAULT_WINDOW: usize = 10;

/// The `sort` member of a fetch request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortParams {
    #[serde(default)]
    pub from: Option<usize>,
    #[serde(default)]
    pub to: Option<usize>,
    #[serde(default)]
    pub by_path: bool,
    /// Any non-null, non-false value selects sorting by value.
    #[serde(default)]
    pub by_value: Option<Value>,
    /// `{"<field>": "<type>"}`: sort by one field of object values.
    #[serde(default)]
    pub by_value_field: Option<Map<String, Value>>,
    #[serde(default)]
    pub descending: bool,
}

/// What a sorted fetch ranks by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortBy {
    Path,
    Value,
    ValueField(String),
}

/// Ordering and window of a sorted fetch. Indices are 0-based and the
/// window covers ranks `from..=to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sorter {
    pub by: SortBy,
    pub descending: bool,
    pub from: usize,
    pub to: usize,
}

impl Sorter {
    pub fn new(by: SortBy, descending: bool, from: usize, to: usize) -> Result<Self> {
        let Some(span) = to.checked_sub(from) else {
            return Err(JetError::InvalidParams(format!(
                "sort.from ({from}) must not exceed sort.to ({to})"
            )));
        };
        if span.checked_add(1).is_none() {
            return Err(JetError::InvalidParams(format!(
                "sort window {from}..={to} is too large"
            )));
        }
        Ok(Self {
            by,
            descending,
            from,
            to,
        })
    }

    pub fn from_params(params: &SortParams) -> Result<Self> {
        let by = if let Some(fields) = &params.by_value_field {
            let mut names = fields.keys();
            match (names.next(), names.next()) {
                (Some(field), None) => SortBy::ValueField(field.clone()),
                _ => {
                    return Err(JetError::InvalidParams(
                        "sort.byValueField must name exactly one field".into(),
                    ));
                }
            }
        } else if params
            .by_value
            .as_ref()
            .is_some_and(|v| !v.is_null() && *v != Value::Bool(false))
        {
            SortBy::Value
        } else {
            SortBy::Path
        };
        let from = params.from.unwrap_or(0);
        let to = match params.to {
            Some(to) => to,
            None => from.checked_add(DEFAULT_WINDOW - 1).ok_or_else(|| {
                JetError::InvalidParams(format!("sort.from ({from}) is out of range"))
            })?,
        };
        Self::new(by, params.descending, from, to)
    }

    /// Number of slots in the window.
    pub fn window_len(&self) -> usize {
        self.to.saturating_sub(self.from).saturating_add(1)
    }

    /// Rank an element for this sorter.
    pub fn rank(&self, path: &str, value: Option<&Value>) -> Rank {
        let key = match &self.by {
            SortBy::Path => SortKey::Text(path.to_string()),
            SortBy::Value => SortKey::of(value),
            SortBy::ValueField(field) => SortKey::of(value.and_then(|v| lookup_field(v, field))),
        };
        Rank {
            key,
            path: path.to_string(),
            descending: self.descending,
        }
    }
}

/// A totally ordered projection of a JSON value:
/// `null < bool < number < string < anything else`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SortKey {
    Null,
    Bool(bool),
    Number(Number),
    Text(String),
    /// Arrays and objects, compared by their JSON text.
    Other(String),
}

impl SortKey {
    pub fn of(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::Null,
            Some(Value::Bool(b)) => Self::Bool(*b),
            Some(Value::Number(n)) => Self::Number(Number(n.as_f64().unwrap_or(f64::NAN))),
            Some(Value::String(s)) => Self::Text(s.clone()),
            Some(other) => Self::Other(other.to_string()),
        }
    }
}

/// `f64` with a total order.
#[derive(Debug, Clone, Copy)]
pub struct Number(pub f64);

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Number {}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Number {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// The position of one element in a sorted fetch: key in the requested
/// direction, ties broken by path ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rank {
    pub key: SortKey,
    pub path: String,
    descending: bool,
}

impl Ord for Rank {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_key = self.key.cmp(&other.key);
        let by_key = if self.descending {
            by_key.reverse()
        } else {
            by_key
        };
        by_key.then_with(|| self.path.cmp(&other.path))
    }
}

impl PartialOrd for Rank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
