//! Document model and shard-key math.
//!
//! Documents are insertion-ordered maps of JSON values. Field order is
//! semantic in two places: shard-key bound documents (the fields of `min`
//! name the shard-key projection, in order) and command documents (the first
//! field names the command).
//!
//! Cross-type value ordering is canonical and total:
//! null < bool < number < string < array < object.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::CoreError;

/// An insertion-ordered document.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Doc(Map<String, Value>);

impl Doc {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Interpret a JSON value as a document. Non-objects are rejected.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(CoreError::NotADocument {
                found: type_name(&other),
            }),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// First field, if any. Command documents name the command here.
    pub fn first(&self) -> Option<(&String, &Value)> {
        self.0.iter().next()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The document identity, when present.
    pub fn id(&self) -> Option<DocId> {
        self.0.get("_id").map(|v| DocId(v.clone()))
    }

    /// Serialized size in bytes, used for transfer batch budgeting.
    pub fn approx_size(&self) -> u64 {
        serde_json::to_vec(&self.0).map(|v| v.len() as u64).unwrap_or(0)
    }
}

impl From<Map<String, Value>> for Doc {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl fmt::Debug for Doc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.0) {
            Ok(s) => write!(f, "{s}"),
            Err(_) => write!(f, "Doc(<unprintable>)"),
        }
    }
}

/// A document's `_id` value, totally ordered so collections can key on it.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(Value);

impl DocId {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Serialized size in bytes.
    pub fn approx_size(&self) -> u64 {
        serde_json::to_vec(&self.0).map(|v| v.len() as u64).unwrap_or(0)
    }
}

impl PartialEq for DocId {
    fn eq(&self, other: &Self) -> bool {
        cmp_values(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for DocId {}

impl PartialOrd for DocId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DocId {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_values(&self.0, &other.0)
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocId({})", self.0)
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Canonical cross-type comparison. Numbers compare numerically regardless
/// of integer/float representation; objects compare as ordered field lists.
pub fn cmp_values(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => cmp_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                let ord = cmp_values(xi, yi);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((xk, xv), (yk, yv)) in x.iter().zip(y.iter()) {
                let ord = xk.cmp(yk);
                if ord != Ordering::Equal {
                    return ord;
                }
                let ord = cmp_values(xv, yv);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => unreachable!("type ranks matched"),
    }
}

fn cmp_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x.cmp(&y);
    }
    let x = a.as_f64().unwrap_or(0.0);
    let y = b.as_f64().unwrap_or(0.0);
    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
}

/// Compare two same-length projections field by field.
pub fn cmp_projection(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = cmp_values(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// A contiguous shard-key range, inclusive of `min`, exclusive of `max`.
///
/// The fields of `min` enumerate the shard-key projection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyRange {
    pub min: Doc,
    pub max: Doc,
}

impl KeyRange {
    pub fn new(min: Doc, max: Doc) -> Result<Self, CoreError> {
        if min.is_empty() || max.is_empty() {
            return Err(CoreError::EmptyRangeBound);
        }
        Ok(Self { min, max })
    }

    /// Extract the shard-key projection of `doc`: the values of the fields
    /// named by `min`, in `min`'s order, missing fields read as null.
    pub fn project(&self, doc: &Doc) -> Vec<Value> {
        self.min
            .keys()
            .map(|k| doc.get(k).cloned().unwrap_or(Value::Null))
            .collect()
    }

    fn min_values(&self) -> Vec<Value> {
        self.min.iter().map(|(_, v)| v.clone()).collect()
    }

    fn max_values(&self) -> Vec<Value> {
        self.max
            .iter()
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Whether `doc`'s shard-key projection lies in `[min, max)`.
    pub fn contains(&self, doc: &Doc) -> bool {
        self.contains_projection(&self.project(doc))
    }

    pub fn contains_projection(&self, projection: &[Value]) -> bool {
        cmp_projection(projection, &self.min_values()) != Ordering::Less
            && cmp_projection(projection, &self.max_values()) == Ordering::Less
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?})", self.min, self.max)
    }
}
