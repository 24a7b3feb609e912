//! Capabilities and their argument constraints.
//!
//! Policy files in the wild spell capabilities several ways: a bare string,
//! a list of strings, a list mixing strings and single-key objects, or an
//! object mapping names to `null` or to an argument constraint. All of them
//! normalize into [`Capabilities`] at parse time.

use crate::error::PolicyError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Required argument values for a constrained capability (`{"x": 1}`).
pub type Constraint = BTreeMap<String, Value>;

/// Compare two JSON values by value, treating `1` and `1.0` as equal.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => a == b,
    }
}

/// A set of capability grants keyed by name.
///
/// A `None` constraint authorizes any arguments; `Some(constraint)` only
/// authorizes calls whose named arguments equal the constraint's values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capabilities(BTreeMap<String, Option<Constraint>>);

impl Capabilities {
    /// An empty capability set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `name`, replacing any previous constraint.
    pub fn insert(&mut self, name: impl Into<String>, constraint: Option<Constraint>) {
        self.0.insert(name.into(), constraint);
    }

    /// Grant `name` unconstrained unless it is already present.
    ///
    /// Used when folding in role capabilities: a constrained grant written
    /// on the entry itself is never widened by a role.
    pub fn insert_if_absent(&mut self, name: impl Into<String>) {
        self.0.entry(name.into()).or_insert(None);
    }

    /// Remove a grant, returning whether it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        self.0.remove(name).is_some()
    }

    /// Whether `name` is granted (with or without constraint).
    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Look up a grant: `None` if absent, `Some(None)` if unconstrained.
    pub fn get(&self, name: &str) -> Option<Option<&Constraint>> {
        self.0.get(name).map(Option::as_ref)
    }

    /// Iterate grants in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Option<Constraint>)> {
        self.0.iter()
    }

    /// Iterate granted names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Number of grants.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no capability is granted.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge `other` into `self`; `other` wins on conflicts.
    pub fn extend(&mut self, other: Capabilities) {
        self.0.extend(other.0);
    }

    /// Normalize any accepted capability spelling into a set.
    pub fn from_value(value: &Value) -> Result<Self, PolicyError> {
        let mut caps = Self::new();
        match value {
            Value::Null => {}
            Value::String(name) => caps.insert_if_absent(name.as_str()),
            Value::Array(items) => {
                for item in items {
                    // Constrained spellings override bare names, never the reverse.
                    for (name, constraint) in Self::from_value(item)?.0 {
                        match constraint {
                            Some(c) => caps.insert(name, Some(c)),
                            None => caps.insert_if_absent(name),
                        }
                    }
                }
            }
            Value::Object(map) => {
                for (name, constraint) in map {
                    caps.insert(name.as_str(), constraint_from_value(name, constraint)?);
                }
            }
            other => {
                return Err(PolicyError::Validation(format!(
                    "invalid capability value {other}: expected a string, a list, or an object \
                     of the form {{\"name\": null}} or {{\"name\": {{\"arg\": value}}}}"
                )));
            }
        }
        Ok(caps)
    }

    /// The JSON object form written to the policy file.
    pub fn to_value(&self) -> Value {
        let map: Map<String, Value> = self
            .0
            .iter()
            .map(|(name, constraint)| {
                let v = match constraint {
                    Some(c) => Value::Object(c.clone().into_iter().collect()),
                    None => Value::Null,
                };
                (name.clone(), v)
            })
            .collect();
        Value::Object(map)
    }
}

fn constraint_from_value(name: &str, value: &Value) -> Result<Option<Constraint>, PolicyError> {
    match value {
        Value::Null => Ok(None),
        Value::Object(args) => Ok(Some(
            args.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        )),
        other => Err(PolicyError::Validation(format!(
            "constraint for capability {name:?} must be null or an object, got {other}"
        ))),
    }
}

impl FromIterator<String> for Capabilities {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut caps = Self::new();
        for name in iter {
            caps.insert_if_absent(name);
        }
        caps
    }
}

impl<'a> FromIterator<&'a str> for Capabilities {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        iter.into_iter().map(str::to_string).collect()
    }
}

impl Serialize for Capabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Capabilities {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Capabilities::from_value(&value).map_err(serde::de::Error::custom)
    }
}
