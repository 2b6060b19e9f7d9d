//! Telemetry value model.
//!
//! A telemetry record is a tree: string keys mapping to scalars or nested
//! records. `Value` is the tagged sum type for one node of that tree, with an
//! explicit serializer arm per variant. `TelemetryRecord` is an ordered map,
//! so serialization is canonical (same content, same bytes), which the
//! sinks rely on for digests.
//!
//! # Merge policy
//!
//! [`merge_into`] is the one place records are combined:
//! - map into map: merged key by key, recursively
//! - anything else: the incoming value replaces the stored one
//!   (last-write-wins per leaf)
//!
//! Merging the same record twice leaves the destination unchanged after the
//! first merge, and records with disjoint leaves merge to the same result in
//! any order.

use crate::error::Result;
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;

/// Key carrying the packet id in every record and fragment.
pub const PID_KEY: &str = "pid";

/// Key carrying the record discriminator.
pub const TYPE_KEY: &str = "type";

/// One node of a telemetry tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
    Map(TelemetryRecord),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view; integers widen to f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&TelemetryRecord> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Copy of this value with every float rounded to `decimals` places.
    pub fn rounded(&self, decimals: u32) -> Value {
        match self {
            Value::Float(f) => Value::Float(round_to(*f, decimals)),
            Value::List(items) => Value::List(items.iter().map(|v| v.rounded(decimals)).collect()),
            Value::Map(m) => Value::Map(m.rounded(decimals)),
            other => other.clone(),
        }
    }
}

fn round_to(value: f64, decimals: u32) -> f64 {
    if !value.is_finite() {
        return value;
    }
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::Float(v as f64),
        }
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<TelemetryRecord> for Value {
    fn from(v: TelemetryRecord) -> Self {
        Value::Map(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            // JSON has no NaN/inf; they go out as null like a failed reading
            Value::Float(f) if !f.is_finite() => serializer.serialize_unit(),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Text(s) => serializer.serialize_str(s),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(record) => record.serialize(serializer),
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a telemetry value")
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> std::result::Result<Value, D::Error> {
        Value::deserialize(d)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Value, E> {
        Ok(Value::from(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Value, E> {
        Ok(Value::Text(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Value, E> {
        Ok(Value::Text(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element::<Value>()? {
            items.push(item);
        }
        Ok(Value::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Value, A::Error> {
        let mut record = TelemetryRecord::new();
        while let Some((key, value)) = map.next_entry::<String, Value>()? {
            record.insert(key, value);
        }
        Ok(Value::Map(record))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

/// A tree of telemetry fields keyed by name.
///
/// Full records carry a `pid` and a `type`; fragments carry `pid` plus a
/// subset of the top-level fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TelemetryRecord(BTreeMap<String, Value>);

impl TelemetryRecord {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Empty record tagged with a packet id.
    pub fn with_pid(pid: u64) -> Self {
        let mut record = Self::new();
        record.insert(PID_KEY, pid);
        record
    }

    /// Packet id, if present and a non-negative integer.
    pub fn pid(&self) -> Option<u64> {
        self.get(PID_KEY)
            .and_then(Value::as_i64)
            .and_then(|pid| u64::try_from(pid).ok())
    }

    pub fn record_type(&self) -> Option<&str> {
        self.get(TYPE_KEY).and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.0.get_mut(key)
    }

    /// Walk nested maps along `path`.
    pub fn get_path(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut node = self.get(first)?;
        for key in rest {
            node = node.as_map()?.get(key)?;
        }
        Some(node)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Nested map stored under `key`, created (or replacing a scalar) on demand.
    pub fn map_entry(&mut self, key: &str) -> &mut TelemetryRecord {
        let slot = self
            .0
            .entry(key.to_string())
            .or_insert_with(|| Value::Map(TelemetryRecord::new()));
        if !matches!(slot, Value::Map(_)) {
            *slot = Value::Map(TelemetryRecord::new());
        }
        match slot {
            Value::Map(m) => m,
            _ => unreachable!("slot was just set to a map"),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge `other` into this record. See [`merge_into`].
    pub fn merge(&mut self, other: &TelemetryRecord) {
        merge_into(self, other);
    }

    /// Copy with every float rounded to `decimals` places (the radio variant).
    pub fn rounded(&self, decimals: u32) -> TelemetryRecord {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), v.rounded(decimals)))
            .collect()
    }

    /// Compact canonical JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_json_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// SHA-256 of the canonical JSON form, lowercase hex.
    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

/// Recursively merge `src` into `dst`, last write wins per leaf.
pub fn merge_into(dst: &mut TelemetryRecord, src: &TelemetryRecord) {
    for (key, incoming) in src.iter() {
        match (dst.0.get_mut(key), incoming) {
            (Some(Value::Map(existing)), Value::Map(nested)) => merge_into(existing, nested),
            _ => {
                dst.0.insert(key.clone(), incoming.clone());
            }
        }
    }
}

impl FromIterator<(String, Value)> for TelemetryRecord {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, Value>> for TelemetryRecord {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl IntoIterator for TelemetryRecord {
    type Item = (String, Value);
    type IntoIter = btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a TelemetryRecord {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
