//! Field-name compression for the radio link.
//!
//! Long canonical field names are swapped for short wire codes before a
//! record is split, and swapped back once the ground station has a complete
//! record. Both ends must use the same table version; changing the table
//! breaks compatibility with deployed peers, so every change bumps
//! [`KEY_MAP_VERSION`].
//!
//! # Round-tripping
//!
//! `decode(encode(r)) == r` holds when every key in `r` is round-trippable:
//! either a canonical name, or a key that is neither a name nor a code.
//! A key that is itself a wire code (say a literal `"alt"`) passes through
//! `encode` untouched and then expands on `decode`.

use crate::error::{KeyMapError, Result};
use crate::value::{TelemetryRecord, Value};
use std::collections::HashMap;

/// Version of the built-in wire table.
pub const KEY_MAP_VERSION: u32 = 1;

/// Canonical name to wire code, version 1.
///
/// The flight table once carried `"telemetry"` twice (`"tele"` and
/// `"tlm"`); only `"tlm"` was ever effective on air, so that is the one kept.
pub const KEY_MAP_V1: &[(&str, &str)] = &[
    ("pid", "pid"),
    ("type", "type"),
    ("epoch", "etm"),
    ("local", "lcl"),
    ("telemetry", "tlm"),
    ("valid", "vld"),
    ("esp32", "e32"),
    ("wifi_signal_strength", "wss"),
    ("free_memory", "fm"),
    ("altitude", "alt"),
    ("temperature", "tmp"),
    ("humidity", "hum"),
    ("pressure", "prs"),
    ("acceleration", "acc"),
    ("gyroscope", "gyr"),
    ("magnetometer", "mag"),
    ("uv_index", "uv"),
    ("gps_coordinates", "gps"),
    ("battery", "bat"),
    ("air_quality", "aq"),
    ("bmp280", "b28"),
    ("bme688", "b68"),
    ("lps25h", "l25"),
    ("lis3mdl", "l3m"),
    ("mcp9808", "mcp"),
    ("icm20948", "icm"),
    ("mpu9250", "mpu"),
    ("ccs811", "c81"),
    ("eCO2", "eco"),
    ("tVOC", "tvoc"),
    ("accel_x", "a_x"),
    ("accel_y", "a_y"),
    ("accel_z", "a_z"),
    ("gyro_x", "g_x"),
    ("gyro_y", "g_y"),
    ("gyro_z", "g_z"),
    ("mag_x", "m_x"),
    ("mag_y", "m_y"),
    ("mag_z", "m_z"),
    ("latitude", "lat"),
    ("longitude", "lon"),
    ("speed", "spd"),
    ("timestamp", "tmsp"),
    ("magnetic_variation", "mv"),
    ("course", "crs"),
    ("voltage", "V"),
    ("soc", "soc"),
];

/// Bidirectional, injective name ↔ code table.
#[derive(Debug, Clone)]
pub struct KeyMap {
    version: u32,
    forward: HashMap<String, String>,
    reverse: HashMap<String, String>,
}

impl KeyMap {
    /// Build a key map, rejecting any table that is not injective.
    ///
    /// # Errors
    /// - `KeyMapError::DuplicateName` if a canonical name repeats
    /// - `KeyMapError::DuplicateCode` if two names share a code
    pub fn from_pairs<N, C>(version: u32, pairs: impl IntoIterator<Item = (N, C)>) -> Result<Self>
    where
        N: Into<String>,
        C: Into<String>,
    {
        let mut forward = HashMap::new();
        let mut reverse: HashMap<String, String> = HashMap::new();

        for (name, code) in pairs {
            let name = name.into();
            let code = code.into();

            if forward.contains_key(&name) {
                return Err(KeyMapError::DuplicateName { version, name }.into());
            }
            if let Some(first) = reverse.get(&code) {
                return Err(KeyMapError::DuplicateCode {
                    version,
                    code,
                    first: first.clone(),
                    second: name,
                }
                .into());
            }

            forward.insert(name.clone(), code.clone());
            reverse.insert(code, name);
        }

        Ok(Self {
            version,
            forward,
            reverse,
        })
    }

    /// The built-in version 1 wire table.
    pub fn v1() -> Result<Self> {
        Self::from_pairs(KEY_MAP_VERSION, KEY_MAP_V1.iter().copied())
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Wire code for a canonical name.
    pub fn code(&self, name: &str) -> Option<&str> {
        self.forward.get(name).map(String::as_str)
    }

    /// Canonical name for a wire code.
    pub fn name(&self, code: &str) -> Option<&str> {
        self.reverse.get(code).map(String::as_str)
    }

    /// Short form of `key`, or `key` itself when unmapped.
    pub fn compress<'a>(&'a self, key: &'a str) -> &'a str {
        self.code(key).unwrap_or(key)
    }

    /// Long form of `key`, or `key` itself when unmapped.
    pub fn expand<'a>(&'a self, key: &'a str) -> &'a str {
        self.name(key).unwrap_or(key)
    }

    /// True when `key` survives `decode(encode(..))` unchanged.
    pub fn is_round_trippable(&self, key: &str) -> bool {
        self.forward.contains_key(key) || !self.reverse.contains_key(key)
    }

    /// Replace every mapped key with its wire code, recursively.
    pub fn encode(&self, record: &TelemetryRecord) -> TelemetryRecord {
        rename(record, &|key| self.compress(key).to_string())
    }

    /// Replace every wire code with its canonical name, recursively.
    pub fn decode(&self, record: &TelemetryRecord) -> TelemetryRecord {
        rename(record, &|key| self.expand(key).to_string())
    }
}

fn rename(record: &TelemetryRecord, map_key: &dyn Fn(&str) -> String) -> TelemetryRecord {
    record
        .iter()
        .map(|(key, value)| (map_key(key), rename_value(value, map_key)))
        .collect()
}

fn rename_value(value: &Value, map_key: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::Map(nested) => Value::Map(rename(nested, map_key)),
        Value::List(items) => Value::List(items.iter().map(|v| rename_value(v, map_key)).collect()),
        scalar => scalar.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> TelemetryRecord {
        TelemetryRecord::from_json_value(value).unwrap()
    }

    #[test]
    fn test_v1_is_injective() {
        let map = KeyMap::v1().unwrap();
        assert_eq!(map.version(), KEY_MAP_VERSION);
        assert_eq!(map.len(), KEY_MAP_V1.len());
        assert_eq!(map.code("temperature"), Some("tmp"));
        assert_eq!(map.name("gyr"), Some("gyroscope"));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let err = KeyMap::from_pairs(7, [("telemetry", "tele"), ("telemetry", "tlm")]).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::KeyMap(KeyMapError::DuplicateName { version: 7, ref name }) if name == "telemetry"
        ));
    }

    #[test]
    fn test_duplicate_code_rejected() {
        let err = KeyMap::from_pairs(1, [("pressure", "prs"), ("pres", "prs")]).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::KeyMap(KeyMapError::DuplicateCode { ref first, ref second, .. })
                if first == "pressure" && second == "pres"
        ));
    }

    #[test]
    fn test_encode_nested() {
        let map = KeyMap::v1().unwrap();
        let full = record(json!({
            "pid": 12,
            "type": "TLM",
            "temperature": {"bmp280": 21.3, "mcp9808": null},
            "acceleration": {"icm20948": {"accel_x": 0.1, "accel_y": 0.0, "accel_z": 9.8}},
            "note": "kept"
        }));

        let encoded = map.encode(&full);

        assert_eq!(
            encoded,
            record(json!({
                "pid": 12,
                "type": "TLM",
                "tmp": {"b28": 21.3, "mcp": null},
                "acc": {"icm": {"a_x": 0.1, "a_y": 0.0, "a_z": 9.8}},
                "note": "kept"
            }))
        );
        assert_eq!(map.decode(&encoded), full);
    }

    #[test]
    fn test_unknown_keys_pass_through() {
        let map = KeyMap::v1().unwrap();
        let r = record(json!({"mystery": {"x": 1}}));
        assert_eq!(map.encode(&r), r);
        assert_eq!(map.decode(&r), r);
    }

    #[test]
    fn test_codes_are_not_round_trippable() {
        let map = KeyMap::v1().unwrap();
        assert!(map.is_round_trippable("altitude"));
        assert!(map.is_round_trippable("x"));
        assert!(!map.is_round_trippable("alt"));

        // a literal wire code expands on the way back
        let r = record(json!({"alt": 1.0}));
        assert_eq!(map.decode(&map.encode(&r)), record(json!({"altitude": 1.0})));
    }

    #[test]
    fn test_lists_are_walked() {
        let map = KeyMap::v1().unwrap();
        let r = record(json!({"gps_coordinates": [{"latitude": 1.0}, {"longitude": 2.0}]}));
        assert_eq!(
            map.encode(&r),
            record(json!({"gps": [{"lat": 1.0}, {"lon": 2.0}]}))
        );
    }

    fn arb_key() -> impl Strategy<Value = String> {
        prop_oneof![
            proptest::sample::select(KEY_MAP_V1.iter().map(|(n, _)| n.to_string()).collect::<Vec<_>>()),
            "[a-z]{1,6}",
        ]
    }

    fn arb_record() -> impl Strategy<Value = TelemetryRecord> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            (-1.0e6f64..1.0e6).prop_map(Value::Float),
            "[a-zA-Z/ ]{0,8}".prop_map(Value::Text),
        ];
        let tree = leaf.prop_recursive(3, 24, 4, |inner| {
            proptest::collection::btree_map(arb_key(), inner, 0..4)
                .prop_map(|m| Value::Map(m.into()))
        });
        proptest::collection::btree_map(arb_key(), tree, 0..6).prop_map(TelemetryRecord::from)
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(r in arb_record()) {
            let map = KeyMap::v1().unwrap();
            let restricted: TelemetryRecord = r
                .into_iter()
                .filter(|(k, _)| map.is_round_trippable(k))
                .collect();
            prop_assume!(all_keys(&restricted, &|k| map.is_round_trippable(k)));
            prop_assert_eq!(map.decode(&map.encode(&restricted)), restricted);
        }
    }

    fn all_keys(r: &TelemetryRecord, ok: &dyn Fn(&str) -> bool) -> bool {
        r.iter().all(|(k, v)| {
            ok(k) && match v {
                Value::Map(m) => all_keys(m, ok),
                _ => true,
            }
        })
    }
}
