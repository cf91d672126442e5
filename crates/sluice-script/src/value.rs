//! Execution-time values and their transmission-safe representation.
//!
//! `RuntimeValue` is what the interpreter binds to names; `SerializedValue`
//! is the closed, transmission-safe tagged set a value is classified into
//! exactly once during serialization.  Chart values are held behind an `Arc`
//! so that aliased bindings share one underlying object and identity can be
//! decided by pointer, not by structure.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A value bound in the executor namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Null,
    /// Missing-value sentinel, distinct from `Null` in the runtime but
    /// collapsed to the same transmission null downstream.
    Missing,
    List(Vec<RuntimeValue>),
    Map(IndexMap<String, RuntimeValue>),
    Table(Table),
    Chart(Arc<ChartSpec>),
    /// A value that already went through the serialization engine.
    Serialized(SerializedValue),
}

impl RuntimeValue {
    /// Short type name used in error messages and `Unrepresentable` tags.
    pub fn type_name(&self) -> &'static str {
        match self {
            RuntimeValue::Int(_) => "int",
            RuntimeValue::Float(_) => "float",
            RuntimeValue::Bool(_) => "bool",
            RuntimeValue::Str(_) => "str",
            RuntimeValue::Null => "null",
            RuntimeValue::Missing => "missing",
            RuntimeValue::List(_) => "list",
            RuntimeValue::Map(_) => "map",
            RuntimeValue::Table(_) => "table",
            RuntimeValue::Chart(_) => "chart",
            RuntimeValue::Serialized(_) => "serialized",
        }
    }

    /// True for `Null` and the `Missing` sentinel alike.
    pub fn is_absent(&self) -> bool {
        matches!(self, RuntimeValue::Null | RuntimeValue::Missing)
    }

    pub fn is_chart(&self) -> bool {
        matches!(self, RuntimeValue::Chart(_))
    }

    /// Deep copy. Charts get a fresh identity: the copy is structurally
    /// equal but no longer aliases the original.
    pub fn deep_copy(&self) -> RuntimeValue {
        match self {
            RuntimeValue::Chart(spec) => RuntimeValue::Chart(Arc::new(spec.as_ref().clone())),
            RuntimeValue::List(items) => {
                RuntimeValue::List(items.iter().map(RuntimeValue::deep_copy).collect())
            }
            RuntimeValue::Map(entries) => RuntimeValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.deep_copy()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// A rectangular table: named columns over row-major cells.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<RuntimeValue>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First `n` rows as a new table.
    pub fn head(&self, n: usize) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }

    /// All cells of the named column, or `None` if the column is unknown.
    pub fn column(&self, name: &str) -> Option<Vec<RuntimeValue>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.get(idx).cloned().unwrap_or(RuntimeValue::Null))
                .collect(),
        )
    }
}

/// A chart specification produced by `make_chart`.
///
/// Pure data: rendering to the transmission spec and static markup is done
/// by the serialization engine, in one place.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartSpec {
    pub kind: String,
    pub title: Option<String>,
    pub x: Vec<RuntimeValue>,
    pub y: Vec<RuntimeValue>,
}

/// The closed set of transmission-safe value shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SerializedValue {
    Scalar {
        value: serde_json::Value,
    },
    Table {
        columns: Vec<String>,
        rows: Vec<IndexMap<String, serde_json::Value>>,
        total_rows: usize,
    },
    Chart {
        spec: serde_json::Value,
        markup: String,
    },
    Null,
    Unrepresentable {
        type_name: String,
    },
}

impl SerializedValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SerializedValue::Null)
    }
}

/// Ordered name → value bindings left behind by one execution.
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    bindings: IndexMap<String, RuntimeValue>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&RuntimeValue> {
        self.bindings.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: RuntimeValue) {
        self.bindings.insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Bindings in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &RuntimeValue)> {
        self.bindings.iter()
    }
}
