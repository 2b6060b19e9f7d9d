//! Fragment frame serialization and parsing.
//!
//! A frame is the byte payload of one radio transmission: the fragment as a
//! compact JSON object with `pid` as its first member.
//!
//! # Frame Format
//!
//! ```text
//! {"pid":42,"alt":{"b28":84.1},"hum":"N/A"}
//!  ^^^^^^^^ always first
//! ```
//!
//! No length prefix and no checksum: the LoRa PHY already drops frames that
//! fail its CRC, and the JSON parser rejects the truncated ones.
//!
//! # Lenient Decoding
//!
//! Receivers see frames from more than one kind of peer. [`decode_frame`]
//! accepts, in addition to plain JSON:
//! - the frame as a hex string, as the RN2483 reports it (`7B22706964...`)
//! - a printed byte-string repr with single quotes (`b'{'pid': 1}'`)
//!
//! Anything else is a [`FrameError`], which the reassembler turns into a
//! single log line and a `Malformed` event.

use crate::error::{FrameError, Result};
use crate::packet::Fragment;
use crate::value::{TelemetryRecord, Value, PID_KEY};

/// Largest payload the RN2483 transmits in one LoRa frame.
pub const MAX_LORA_PAYLOAD: usize = 255;

/// Serialize a fragment into frame bytes.
pub fn encode_frame(fragment: &Fragment) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(fragment)?)
}

/// Parse frame bytes back into a fragment.
///
/// # Errors
/// - `FrameError::Empty` for zero-length or whitespace-only input
/// - `FrameError::NotUtf8` when the bytes are not text
/// - `FrameError::Hex` for hex-looking input that does not decode
/// - `FrameError::Json` / `NotAnObject` when the text is not a JSON object
/// - `FrameError::MissingPid` / `InvalidPid` when `pid` is absent or bad
pub fn decode_frame(bytes: &[u8]) -> Result<Fragment> {
    Ok(parse(bytes, true)?)
}

/// Frame bytes as uppercase hex, the form the modem takes on `radio tx`.
pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Inverse of [`to_hex`]; accepts either case.
pub fn from_hex(text: &str) -> Result<Vec<u8>> {
    Ok(hex::decode(text.trim()).map_err(FrameError::Hex)?)
}

fn parse(bytes: &[u8], allow_hex: bool) -> std::result::Result<Fragment, FrameError> {
    let text = std::str::from_utf8(bytes).map_err(|_| FrameError::NotUtf8)?;
    let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    if text.is_empty() {
        return Err(FrameError::Empty);
    }

    if allow_hex && looks_like_hex(text) {
        let inner = hex::decode(text)?;
        return parse(&inner, false);
    }

    let text = unwrap_repr(text);
    let value: Value = serde_json::from_str(&text)?;
    let Value::Map(mut record) = value else {
        return Err(FrameError::NotAnObject);
    };

    let pid = take_pid(&mut record)?;
    Ok(Fragment::new(pid, record))
}

fn take_pid(record: &mut TelemetryRecord) -> std::result::Result<u64, FrameError> {
    match record.remove(PID_KEY) {
        None => Err(FrameError::MissingPid),
        Some(value) => value
            .as_i64()
            .and_then(|pid| u64::try_from(pid).ok())
            .ok_or(FrameError::InvalidPid),
    }
}

fn looks_like_hex(text: &str) -> bool {
    text.len() % 2 == 0 && text.bytes().all(|b| b.is_ascii_hexdigit())
}

// b'{...}' or b"{...}" and single-quoted keys, as left by printing a bytes
// object on the peer instead of sending it.
fn unwrap_repr(text: &str) -> String {
    let inner = ["b'", "b\""]
        .iter()
        .find_map(|prefix| text.strip_prefix(prefix))
        .map(|rest| rest.trim_end_matches(['\'', '"']))
        .unwrap_or(text);

    if !inner.contains('"') && inner.contains('\'') {
        inner.replace('\'', "\"")
    } else {
        inner.to_string()
    }
}
