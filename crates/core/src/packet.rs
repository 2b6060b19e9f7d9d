//! Fragments and record splitting.
//!
//! A key-compressed telemetry record is too large for one LoRa frame, so it
//! is split into a fixed number of fragments along a static, schema-defined
//! partition of its top-level fields. Every fragment repeats the record's
//! `pid`; nothing else identifies it on air.
//!
//! # Standard Partition
//!
//! ```text
//! +------------+------------------------------------------+-----------+
//! | fragment   | fields (wire codes)                      | if absent |
//! +------------+------------------------------------------+-----------+
//! | 1 identity | type, etm, lcl, bat, gps                 | null      |
//! | 2 thermal  | prs, tmp{b28, mcp, b68, l25}             | "N/A"     |
//! | 3 height   | alt, hum                                 | "N/A"     |
//! | 4 motion   | acc, gyr                                 | null      |
//! +------------+------------------------------------------+-----------+
//! ```
//!
//! Missing fields are filled with a sentinel instead of being left out, so a
//! fragment has the same shape every cycle. Fields that belong to no group
//! (validity flag, board diagnostics, magnetometer, UV) stay on the can.
//!
//! # Size Constraint
//!
//! The partition is static, not measured, so [`Splitter::split`] frames every
//! fragment and rejects the record if any of them exceeds the payload limit.

use crate::error::{PacketError, Result};
use crate::framing::{encode_frame, MAX_LORA_PAYLOAD};
use crate::value::{TelemetryRecord, Value, PID_KEY};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use tracing::debug;

/// Placeholder text for a reading that was not available.
pub const NOT_AVAILABLE: &str = "N/A";

/// One radio-sized piece of a telemetry record.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    /// Packet id of the originating record
    pub pid: u64,

    /// Fields carried by this fragment (never contains `pid`)
    pub body: TelemetryRecord,
}

impl Fragment {
    pub fn new(pid: u64, mut body: TelemetryRecord) -> Self {
        body.remove(PID_KEY);
        Self { pid, body }
    }

    /// Split a flat record into pid and body.
    pub fn from_record(record: TelemetryRecord) -> Result<Self> {
        let pid = record.pid().ok_or(PacketError::MissingPid)?;
        Ok(Self::new(pid, record))
    }

    /// Body plus `pid`, as it appears on the wire.
    pub fn to_record(&self) -> TelemetryRecord {
        let mut record = self.body.clone();
        record.insert(PID_KEY, self.pid);
        record
    }
}

// `pid` goes first so a truncated frame still shows which record it was.
impl Serialize for Fragment {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.body.len() + 1))?;
        map.serialize_entry(PID_KEY, &self.pid)?;
        for (key, value) in self.body.iter().filter(|(k, _)| k.as_str() != PID_KEY) {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// What a fragment carries when a field is missing from the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    Null,
    NotAvailable,
}

impl Sentinel {
    pub fn value(self) -> Value {
        match self {
            Sentinel::Null => Value::Null,
            Sentinel::NotAvailable => Value::Text(NOT_AVAILABLE.to_string()),
        }
    }
}

/// One top-level field of a fragment group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    /// Wire key
    pub key: String,

    /// Filler when the field (or one of its members) is absent
    pub missing: Sentinel,

    /// Nested keys that must always be present under `key`
    pub members: Vec<String>,
}

impl FieldSpec {
    pub fn new(key: &str, missing: Sentinel) -> Self {
        Self {
            key: key.to_string(),
            missing,
            members: Vec::new(),
        }
    }

    pub fn with_members(mut self, members: &[&str]) -> Self {
        self.members = members.iter().map(|m| m.to_string()).collect();
        self
    }

    fn extract(&self, record: &TelemetryRecord) -> Value {
        let present = record.get(&self.key);

        if self.members.is_empty() {
            return present.cloned().unwrap_or(self.missing.value());
        }

        let mut nested = present.and_then(Value::as_map).cloned().unwrap_or_default();
        for member in &self.members {
            if !nested.contains_key(member) {
                nested.insert(member.clone(), self.missing.value());
            }
        }
        Value::Map(nested)
    }
}

/// Fields that travel together in one fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentGroup {
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

impl FragmentGroup {
    pub fn new(name: &str, fields: Vec<FieldSpec>) -> Self {
        Self {
            name: name.to_string(),
            fields,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.key.as_str())
    }
}

/// Static assignment of record fields to fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    groups: Vec<FragmentGroup>,
}

impl Partition {
    pub fn new(groups: Vec<FragmentGroup>) -> Self {
        Self { groups }
    }

    /// The four-fragment layout flown with key map v1.
    pub fn standard() -> Self {
        use Sentinel::{NotAvailable, Null};

        Self::new(vec![
            FragmentGroup::new(
                "identity",
                vec![
                    FieldSpec::new("type", Null),
                    FieldSpec::new("etm", Null),
                    FieldSpec::new("lcl", Null),
                    FieldSpec::new("bat", Null),
                    FieldSpec::new("gps", Null),
                ],
            ),
            FragmentGroup::new(
                "thermal",
                vec![
                    FieldSpec::new("prs", NotAvailable),
                    FieldSpec::new("tmp", NotAvailable).with_members(&["b28", "mcp", "b68", "l25"]),
                ],
            ),
            FragmentGroup::new(
                "height",
                vec![
                    FieldSpec::new("alt", NotAvailable),
                    FieldSpec::new("hum", NotAvailable),
                ],
            ),
            FragmentGroup::new(
                "motion",
                vec![FieldSpec::new("acc", Null), FieldSpec::new("gyr", Null)],
            ),
        ])
    }

    pub fn groups(&self) -> &[FragmentGroup] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn assigns(&self, key: &str) -> bool {
        self.groups.iter().any(|g| g.keys().any(|k| k == key))
    }
}

impl Default for Partition {
    fn default() -> Self {
        Self::standard()
    }
}

/// Splits key-compressed records into payload-bounded fragments.
#[derive(Debug, Clone)]
pub struct Splitter {
    partition: Partition,
    max_payload: usize,
}

impl Splitter {
    pub fn new(partition: Partition, max_payload: usize) -> Self {
        Self {
            partition,
            max_payload,
        }
    }

    /// Standard partition with the LoRa payload ceiling.
    pub fn standard() -> Self {
        Self::new(Partition::standard(), MAX_LORA_PAYLOAD)
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Split a record into one fragment per partition group, in order.
    ///
    /// # Errors
    /// - `PacketError::MissingPid` if the record has no integer pid
    /// - `PacketError::ExceedsPayload` if any framed fragment is too large
    pub fn split(&self, record: &TelemetryRecord) -> Result<Vec<Fragment>> {
        let pid = record.pid().ok_or(PacketError::MissingPid)?;

        let left_behind: Vec<&str> = record
            .keys()
            .filter(|k| *k != PID_KEY && !self.partition.assigns(k))
            .collect();
        if !left_behind.is_empty() {
            debug!(pid, fields = ?left_behind, "fields not carried by any fragment");
        }

        let mut fragments = Vec::with_capacity(self.partition.len());
        for (index, group) in self.partition.groups().iter().enumerate() {
            let body: TelemetryRecord = group
                .fields
                .iter()
                .map(|field| (field.key.clone(), field.extract(record)))
                .collect();
            let fragment = Fragment::new(pid, body);

            let size = encode_frame(&fragment)?.len();
            if size > self.max_payload {
                return Err(PacketError::ExceedsPayload {
                    pid,
                    index,
                    size,
                    limit: self.max_payload,
                }
                .into());
            }

            fragments.push(fragment);
        }

        Ok(fragments)
    }
}

impl Default for Splitter {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> TelemetryRecord {
        TelemetryRecord::from_json_value(value).unwrap()
    }

    fn compact_record(pid: u64) -> TelemetryRecord {
        record(json!({
            "pid": pid,
            "type": "TLM",
            "vld": true,
            "etm": 768364735,
            "lcl": "2024-May-07T02:38:57",
            "bat": {"V": 3.81, "soc": 67.2},
            "gps": {"lat": 47.84, "lon": 21.25, "tmsp": "02:38:57"},
            "prs": {"b28": 1003.2, "b68": 1003.4, "l25": 1003.1},
            "tmp": {"b28": 21.3, "mcp": 21.1, "b68": 21.6, "l25": 20.9},
            "alt": {"b28": 84.1, "b68": 83.7, "l25": 84.5},
            "hum": {"b28": 41.0, "b68": 40.2},
            "acc": {"icm": {"a_x": 0.12, "a_y": -0.03, "a_z": 9.81}},
            "gyr": {"icm": {"g_x": 0.01, "g_y": 0.0, "g_z": -0.02}},
            "mag": {"icm": {"m_x": 12.0, "m_y": -3.5, "m_z": 40.1}}
        }))
    }

    #[test]
    fn test_split_standard_record() {
        let splitter = Splitter::standard();
        let fragments = splitter.split(&compact_record(42)).unwrap();

        assert_eq!(fragments.len(), 4);
        assert!(fragments.iter().all(|f| f.pid == 42));

        let keys: Vec<Vec<&str>> = fragments.iter().map(|f| f.body.keys().collect()).collect();
        assert_eq!(keys[0], vec!["bat", "etm", "gps", "lcl", "type"]);
        assert_eq!(keys[1], vec!["prs", "tmp"]);
        assert_eq!(keys[2], vec!["alt", "hum"]);
        assert_eq!(keys[3], vec!["acc", "gyr"]);
    }

    #[test]
    fn test_every_fragment_fits_payload() {
        let splitter = Splitter::standard();
        for fragment in splitter.split(&compact_record(9_999_999)).unwrap() {
            assert!(encode_frame(&fragment).unwrap().len() <= MAX_LORA_PAYLOAD);
        }
    }

    #[test]
    fn test_missing_fields_get_sentinels() {
        let splitter = Splitter::standard();
        let sparse = record(json!({"pid": 3, "tmp": {"b28": 20.5}}));

        let fragments = splitter.split(&sparse).unwrap();

        assert_eq!(fragments[0].body.get("gps"), Some(&Value::Null));
        assert_eq!(fragments[0].body.get("bat"), Some(&Value::Null));
        assert_eq!(fragments[1].body.get("prs"), Some(&Value::from(NOT_AVAILABLE)));
        assert_eq!(
            fragments[1].body.get("tmp"),
            Some(&Value::Map(record(json!({
                "b28": 20.5, "mcp": "N/A", "b68": "N/A", "l25": "N/A"
            }))))
        );
        assert_eq!(fragments[2].body.get("alt"), Some(&Value::from(NOT_AVAILABLE)));
        assert_eq!(fragments[3].body.get("acc"), Some(&Value::Null));
    }

    #[test]
    fn test_shape_is_stable_across_cycles() {
        let splitter = Splitter::standard();
        let full = splitter.split(&compact_record(1)).unwrap();
        let sparse = splitter.split(&record(json!({"pid": 2}))).unwrap();

        for (a, b) in full.iter().zip(&sparse) {
            assert_eq!(a.body.keys().collect::<Vec<_>>(), b.body.keys().collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_missing_pid_rejected() {
        let err = Splitter::standard().split(&record(json!({"tmp": 1}))).unwrap_err();
        assert!(matches!(err, crate::Error::Packet(PacketError::MissingPid)));
    }

    #[test]
    fn test_oversized_fragment_rejected() {
        let splitter = Splitter::new(Partition::standard(), 40);
        let err = splitter.split(&compact_record(5)).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Packet(PacketError::ExceedsPayload { pid: 5, index: 0, limit: 40, .. })
        ));
    }

    #[test]
    fn test_fragment_serializes_pid_first() {
        let fragment = Fragment::new(7, record(json!({"alt": 12.0, "hum": 55})));
        let text = String::from_utf8(encode_frame(&fragment).unwrap()).unwrap();
        assert_eq!(text, r#"{"pid":7,"alt":12.0,"hum":55}"#);
    }

    #[test]
    fn test_fragment_record_conversions() {
        let fragment = Fragment::from_record(record(json!({"pid": 8, "alt": 1.0}))).unwrap();
        assert_eq!(fragment.pid, 8);
        assert!(!fragment.body.contains_key("pid"));
        assert_eq!(fragment.to_record(), record(json!({"pid": 8, "alt": 1.0})));
    }
}
