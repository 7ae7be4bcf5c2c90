//! Fetch matchers: predicates over `(path, value, access)`.
//!
//! Matchers are plain data built from the `path` / `value` / `valueField` /
//! `access` members of a fetch request and evaluated by
//! [`Matcher::matches`], a pure function.

use std::borrow::Cow;

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::element::{Access, Element};
use crate::error::{JetError, Result};

/// A test applied to an element path.
#[derive(Debug, Clone)]
pub enum PathOp {
    Equals(String),
    StartsWith(String),
    EndsWith(String),
    Contains(String),
    ContainsAllOf(Vec<String>),
    EqualsOneOf(Vec<String>),
    Regex(Regex),
}

/// JSON type names accepted by `isType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
}

/// A test applied to an element value (or one field of it).
#[derive(Debug, Clone)]
pub enum ValueOp {
    Equals(Value),
    EqualsNot(Value),
    /// Numeric range with exclusive bounds.
    Range {
        above: Option<f64>,
        below: Option<f64>,
    },
    IsType(ValueType),
}

/// A fetch predicate.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Matches every element.
    Always,
    Path { op: PathOp, case_insensitive: bool },
    /// `field` is a dotted path into object values; `None` tests the value itself.
    Value { field: Option<String>, op: ValueOp },
    Access(Access),
    /// Conjunction.
    All(Vec<Matcher>),
    /// Disjunction.
    Any(Vec<Matcher>),
}

/// The filtering members of a fetch request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchParams {
    /// Either an exact path string or an object of path operators.
    #[serde(default)]
    pub path: Option<Value>,
    #[serde(default)]
    pub case_insensitive: bool,
    #[serde(default)]
    pub value: Option<Map<String, Value>>,
    #[serde(default)]
    pub value_field: Option<Map<String, Value>>,
    #[serde(default)]
    pub access: Option<Access>,
}

impl Matcher {
    pub fn path_equals(path: impl Into<String>) -> Self {
        Self::Path {
            op: PathOp::Equals(path.into()),
            case_insensitive: false,
        }
    }

    pub fn path_starts_with(prefix: impl Into<String>) -> Self {
        Self::Path {
            op: PathOp::StartsWith(prefix.into()),
            case_insensitive: false,
        }
    }

    pub fn path_regex(pattern: &str) -> Result<Self> {
        Ok(Self::Path {
            op: PathOp::Regex(compile(pattern, false)?),
            case_insensitive: false,
        })
    }

    pub fn value_range(field: Option<&str>, above: Option<f64>, below: Option<f64>) -> Self {
        Self::Value {
            field: field.map(str::to_string),
            op: ValueOp::Range { above, below },
        }
    }

    /// Build a matcher from fetch params. No filter at all matches everything.
    pub fn from_params(params: &MatchParams) -> Result<Self> {
        let ci = params.case_insensitive;
        let mut matchers = Vec::new();

        match &params.path {
            None => {}
            Some(Value::String(path)) => matchers.push(Self::Path {
                op: PathOp::Equals(fold(path, ci)),
                case_insensitive: ci,
            }),
            Some(Value::Object(ops)) => {
                for (name, arg) in ops {
                    matchers.push(Self::Path {
                        op: path_op(name, arg, ci)?,
                        case_insensitive: ci,
                    });
                }
            }
            Some(_) => return Err(invalid("path must be a string or an object")),
        }

        if let Some(ops) = &params.value {
            matchers.extend(value_ops(ops, None)?);
        }

        if let Some(fields) = &params.value_field {
            for (field, ops) in fields {
                let Value::Object(ops) = ops else {
                    return Err(invalid(format!("valueField.{field} must be an object")));
                };
                matchers.extend(value_ops(ops, Some(field))?);
            }
        }

        if let Some(access) = params.access {
            matchers.push(Self::Access(access));
        }

        Ok(match matchers.len() {
            0 => Self::Always,
            1 => matchers.remove(0),
            _ => Self::All(matchers),
        })
    }

    pub fn matches_element(&self, element: &Element) -> bool {
        self.matches(&element.path, element.value.as_ref(), element.access)
    }

    /// Evaluate against one element. Value tests never match methods.
    pub fn matches(&self, path: &str, value: Option<&Value>, access: Access) -> bool {
        match self {
            Self::Always => true,
            Self::Path {
                op,
                case_insensitive,
            } => {
                let path: Cow<'_, str> = if *case_insensitive {
                    Cow::Owned(path.to_lowercase())
                } else {
                    Cow::Borrowed(path)
                };
                op.matches(&path)
            }
            Self::Value { field, op } => {
                let target = match (value, field) {
                    (Some(value), Some(field)) => lookup_field(value, field),
                    (Some(value), None) => Some(value),
                    (None, _) => None,
                };
                target.is_some_and(|target| op.matches(target))
            }
            Self::Access(expected) => *expected == access,
            Self::All(matchers) => matchers.iter().all(|m| m.matches(path, value, access)),
            Self::Any(matchers) => matchers.iter().any(|m| m.matches(path, value, access)),
        }
    }
}

impl PathOp {
    fn matches(&self, path: &str) -> bool {
        match self {
            Self::Equals(expected) => path == expected,
            Self::StartsWith(prefix) => path.starts_with(prefix.as_str()),
            Self::EndsWith(suffix) => path.ends_with(suffix.as_str()),
            Self::Contains(part) => path.contains(part.as_str()),
            Self::ContainsAllOf(parts) => parts.iter().all(|p| path.contains(p.as_str())),
            Self::EqualsOneOf(options) => options.iter().any(|o| o == path),
            Self::Regex(regex) => regex.is_match(path),
        }
    }
}

impl ValueOp {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Equals(expected) => value == expected,
            Self::EqualsNot(expected) => value != expected,
            Self::Range { above, below } => match value.as_f64() {
                Some(n) => above.is_none_or(|a| n > a) && below.is_none_or(|b| n < b),
                None => false,
            },
            Self::IsType(kind) => {
                let actual = match value {
                    Value::Null => ValueType::Null,
                    Value::Bool(_) => ValueType::Boolean,
                    Value::Number(_) => ValueType::Number,
                    Value::String(_) => ValueType::String,
                    Value::Array(_) => ValueType::Array,
                    Value::Object(_) => ValueType::Object,
                };
                actual == *kind
            }
        }
    }
}

/// Follow a dotted field path (`a.b.0`) into a JSON value.
pub(crate) fn lookup_field<'a>(value: &'a Value, field: &str) -> Option<&'a Value> {
    field.split('.').try_fold(value, |current, segment| match current {
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => current.get(segment),
    })
}

fn invalid(reason: impl Into<String>) -> JetError {
    JetError::InvalidParams(reason.into())
}

fn fold(s: &str, case_insensitive: bool) -> String {
    if case_insensitive {
        s.to_lowercase()
    } else {
        s.to_string()
    }
}

fn compile(pattern: &str, case_insensitive: bool) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| invalid(format!("invalid regex {pattern:?}: {e}")))
}

fn string_arg<'a>(op: &str, arg: &'a Value) -> Result<&'a str> {
    arg.as_str()
        .ok_or_else(|| invalid(format!("{op} expects a string")))
}

fn string_list(op: &str, arg: &Value, ci: bool) -> Result<Vec<String>> {
    let items = arg
        .as_array()
        .ok_or_else(|| invalid(format!("{op} expects an array of strings")))?;
    items
        .iter()
        .map(|item| string_arg(op, item).map(|s| fold(s, ci)))
        .collect()
}

fn number_arg(op: &str, arg: &Value) -> Result<f64> {
    arg.as_f64()
        .ok_or_else(|| invalid(format!("{op} expects a number")))
}

fn path_op(name: &str, arg: &Value, ci: bool) -> Result<PathOp> {
    Ok(match name {
        "equals" => PathOp::Equals(fold(string_arg(name, arg)?, ci)),
        "startsWith" => PathOp::StartsWith(fold(string_arg(name, arg)?, ci)),
        "endsWith" => PathOp::EndsWith(fold(string_arg(name, arg)?, ci)),
        "contains" => PathOp::Contains(fold(string_arg(name, arg)?, ci)),
        "containsAllOf" => PathOp::ContainsAllOf(string_list(name, arg, ci)?),
        "equalsOneOf" => PathOp::EqualsOneOf(string_list(name, arg, ci)?),
        "regex" => PathOp::Regex(compile(string_arg(name, arg)?, ci)?),
        other => return Err(invalid(format!("unknown path operator {other}"))),
    })
}

fn value_ops(ops: &Map<String, Value>, field: Option<&str>) -> Result<Vec<Matcher>> {
    let field = field.map(str::to_string);
    let mut matchers = Vec::new();
    let mut above = None;
    let mut below = None;

    for (name, arg) in ops {
        let op = match name.as_str() {
            "equals" => ValueOp::Equals(arg.clone()),
            "equalsNot" => ValueOp::EqualsNot(arg.clone()),
            "isType" => ValueOp::IsType(
                serde_json::from_value(arg.clone())
                    .map_err(|_| invalid(format!("unknown type {arg}")))?,
            ),
            "greaterThan" => {
                above = Some(number_arg(name, arg)?);
                continue;
            }
            "lessThan" => {
                below = Some(number_arg(name, arg)?);
                continue;
            }
            other => return Err(invalid(format!("unknown value operator {other}"))),
        };
        matchers.push(Matcher::Value {
            field: field.clone(),
            op,
        });
    }

    if above.is_some() || below.is_some() {
        matchers.push(Matcher::Value {
            field,
            op: ValueOp::Range { above, below },
        });
    }
    Ok(matchers)
}
