//! Selector-addressed variable storage shared by the engine and executors.
//!
//! A selector is a path: the first element names a node id or one of the
//! reserved namespaces (`sys`, `inputs`, `env`), the second names a
//! variable, further elements index into object values. Reads never block
//! and a missing selector resolves to [`Segment::None`] so executors decide
//! for themselves whether an absent input is fatal.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Namespace for read-only run metadata.
pub const SYSTEM_NAMESPACE: &str = "sys";
/// Namespace for caller-supplied inputs.
pub const USER_INPUTS_NAMESPACE: &str = "inputs";
/// Namespace for environment variables.
pub const ENVIRONMENT_NAMESPACE: &str = "env";

/// Hierarchical variable address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Selector(pub Vec<String>);

impl Selector {
    pub fn new(parts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn node_id(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn variable(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    /// Path elements past the variable name, indexing into object values.
    pub fn rest(&self) -> &[String] {
        if self.0.len() > 2 {
            &self.0[2..]
        } else {
            &[]
        }
    }

    pub fn is_valid(&self) -> bool {
        self.0.len() >= 2 && !self.0[0].is_empty() && !self.0[1].is_empty()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl From<Vec<String>> for Selector {
    fn from(parts: Vec<String>) -> Self {
        Self(parts)
    }
}

/// A single typed value held in the pool.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Segment {
    #[default]
    None,
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Object(HashMap<String, Segment>),
    Array(Vec<Segment>),
}

impl Segment {
    pub fn is_none(&self) -> bool {
        matches!(self, Segment::None)
    }

    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => Segment::None,
            Value::Bool(b) => Segment::Boolean(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Segment::Integer(i)
                } else {
                    Segment::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => Segment::String(s.clone()),
            Value::Array(items) => {
                Segment::Array(items.iter().map(Segment::from_value).collect())
            }
            Value::Object(map) => Segment::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Segment::from_value(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Segment::None => Value::Null,
            Segment::String(s) => Value::String(s.clone()),
            Segment::Integer(i) => Value::from(*i),
            Segment::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Segment::Boolean(b) => Value::Bool(*b),
            Segment::Object(map) => Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_value())).collect(),
            ),
            Segment::Array(items) => {
                Value::Array(items.iter().map(Segment::to_value).collect())
            }
        }
    }

    /// Rendering used by template substitution and answer assembly.
    pub fn to_display_string(&self) -> String {
        match self {
            Segment::None => String::new(),
            Segment::String(s) => s.clone(),
            Segment::Integer(i) => i.to_string(),
            Segment::Float(f) => f.to_string(),
            Segment::Boolean(b) => b.to_string(),
            Segment::Object(_) | Segment::Array(_) => {
                serde_json::to_string(&self.to_value()).unwrap_or_default()
            }
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Segment::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Segment::Integer(i) => Some(*i as f64),
            Segment::Float(f) => Some(*f),
            Segment::String(s) => s.trim().parse().ok(),
            Segment::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Segment]> {
        match self {
            Segment::Array(items) => Some(items),
            _ => None,
        }
    }
}

impl Serialize for Segment {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Segment {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Segment::from_value(&value))
    }
}

/// Per-run variable store. Keys are `node_id` + NUL + `variable_name`; the
/// NUL byte cannot appear in either part so keys never collide.
#[derive(Default)]
pub struct VariablePool {
    variables: RwLock<HashMap<String, Segment>>,
}

fn make_key(node_id: &str, name: &str) -> String {
    format!("{node_id}\0{name}")
}

impl VariablePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the reserved namespaces from caller-supplied maps.
    pub fn with_namespaces(
        system: HashMap<String, Value>,
        user_inputs: HashMap<String, Value>,
        environment: HashMap<String, Value>,
    ) -> Self {
        let pool = Self::new();
        for (name, value) in &system {
            pool.set(SYSTEM_NAMESPACE, name, Segment::from_value(value));
        }
        for (name, value) in &user_inputs {
            pool.set(USER_INPUTS_NAMESPACE, name, Segment::from_value(value));
        }
        for (name, value) in &environment {
            pool.set(ENVIRONMENT_NAMESPACE, name, Segment::from_value(value));
        }
        pool
    }

    pub fn set(&self, node_id: &str, name: &str, segment: Segment) {
        self.variables
            .write()
            .insert(make_key(node_id, name), segment);
    }

    /// Writes a node's entire output map in one pass.
    pub fn set_node_outputs(&self, node_id: &str, outputs: &HashMap<String, Segment>) {
        let mut vars = self.variables.write();
        for (name, segment) in outputs {
            vars.insert(make_key(node_id, name), segment.clone());
        }
    }

    /// Resolves a selector. Missing selectors and invalid paths yield
    /// [`Segment::None`] rather than an error.
    pub fn get(&self, selector: &Selector) -> Segment {
        let (Some(node_id), Some(name)) = (selector.node_id(), selector.variable()) else {
            return Segment::None;
        };
        let vars = self.variables.read();
        let Some(root) = vars.get(&make_key(node_id, name)) else {
            return Segment::None;
        };
        let mut current = root;
        for part in selector.rest() {
            match current {
                Segment::Object(map) => match map.get(part) {
                    Some(next) => current = next,
                    None => return Segment::None,
                },
                Segment::Array(items) => {
                    match part.parse::<usize>().ok().and_then(|i| items.get(i)) {
                        Some(next) => current = next,
                        None => return Segment::None,
                    }
                }
                _ => return Segment::None,
            }
        }
        current.clone()
    }

    pub fn has(&self, selector: &Selector) -> bool {
        !self.get(selector).is_none()
    }

    pub fn user_input(&self, name: &str) -> Segment {
        self.get(&Selector::new([USER_INPUTS_NAMESPACE, name]))
    }

    /// All variables belonging to one node id, by name.
    pub fn node_variables(&self, node_id: &str) -> HashMap<String, Segment> {
        let prefix = format!("{node_id}\0");
        self.variables
            .read()
            .iter()
            .filter_map(|(key, segment)| {
                key.strip_prefix(&prefix)
                    .map(|name| (name.to_string(), segment.clone()))
            })
            .collect()
    }

    pub fn remove_node(&self, node_id: &str) {
        let prefix = format!("{node_id}\0");
        self.variables
            .write()
            .retain(|key, _| !key.starts_with(&prefix));
    }

    /// Branch-scoped copy taken at a parallel fan-out or iteration pass.
    pub fn fork(&self) -> Self {
        Self {
            variables: RwLock::new(self.variables.read().clone()),
        }
    }

    /// Folds a completed branch back in at the join point. Branch writes
    /// win over stale parent entries.
    pub fn merge_branch(&self, branch: &VariablePool) {
        let branch_vars = branch.variables.read();
        let mut vars = self.variables.write();
        for (key, segment) in branch_vars.iter() {
            vars.insert(key.clone(), segment.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.variables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.read().is_empty()
    }
}

impl fmt::Debug for VariablePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariablePool")
            .field("len", &self.len())
            .finish()
    }
}
