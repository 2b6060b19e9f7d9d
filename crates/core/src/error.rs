//! Error types for the CanSat telemetry link.
//!
//! Every failure in the core is a structured, recoverable value. The
//! acquisition and receive loops log these and carry on; only a handful
//! (key map load, transport open, no sensors at all) are fatal to `main`.

use thiserror::Error;

/// Top-level error type for all operations in the link.
///
/// Each variant corresponds to a specific failure domain:
/// - Key map: the wire table is not injective
/// - Frame: a received byte frame does not parse as a fragment
/// - Packet: a record cannot be split into valid fragments
/// - Transport: the radio link refused or failed an operation
/// - Sink: durable storage rejected a record
/// - Sensor: a sensor read or the sensor suite setup failed
/// - I/O and JSON: passthrough from std and serde_json
#[derive(Debug, Error)]
pub enum Error {
    /// Key map table violates injectivity
    #[error("key map error: {0}")]
    KeyMap(#[from] KeyMapError),

    /// Received frame could not be decoded
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Record could not be split into fragments
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Radio link failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Persistence failure
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Sensor failure
    #[error("sensor error: {0}")]
    Sensor(#[from] SensorError),

    /// File or device I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Key map construction errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyMapError {
    /// The same canonical name appears twice in the table
    #[error("key map v{version}: canonical name {name:?} is defined more than once")]
    DuplicateName { version: u32, name: String },

    /// Two canonical names collapse to the same wire code
    #[error("key map v{version}: code {code:?} is shared by {first:?} and {second:?}")]
    DuplicateCode {
        version: u32,
        code: String,
        first: String,
        second: String,
    },
}

/// Frame decoding errors.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame contained no bytes
    #[error("empty frame")]
    Empty,

    /// Frame bytes are not valid UTF-8 text
    #[error("frame is not valid UTF-8")]
    NotUtf8,

    /// Frame looked hex-encoded but did not decode
    #[error("invalid hex payload: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Frame text is not valid JSON
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Top-level JSON value is not an object
    #[error("frame payload is not a JSON object")]
    NotAnObject,

    /// The `pid` field is missing
    #[error("frame has no pid")]
    MissingPid,

    /// The `pid` field is not a non-negative integer
    #[error("frame pid is not a non-negative integer")]
    InvalidPid,
}

/// Splitter errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Record carries no integer `pid`
    #[error("record has no integer pid")]
    MissingPid,

    /// A framed fragment is larger than the radio payload ceiling
    #[error("fragment {index} of pid {pid} is {size} bytes, exceeds payload limit {limit}")]
    ExceedsPayload {
        pid: u64,
        index: usize,
        size: usize,
        limit: usize,
    },
}

/// Radio transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Serial port could not be opened
    #[error("failed to open serial port {path:?}: {reason}")]
    Open { path: String, reason: String },

    /// Modem answered a command with an error token
    #[error("modem rejected {command:?}: {response}")]
    Rejected { command: String, response: String },

    /// Modem did not answer in time
    #[error("no response to {command:?} within {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    /// Frame is larger than the modem accepts
    #[error("frame of {size} bytes exceeds modem payload limit {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    /// The other end of the link has gone away
    #[error("link closed")]
    Closed,
}

/// Durable sink errors.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Record handed to the sink has no pid to key it by
    #[error("record has no pid")]
    MissingPid,

    /// Existing store file could not be understood
    #[error("store {path} is corrupted: {reason}")]
    Corrupted { path: String, reason: String },
}

/// Sensor errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SensorError {
    /// Bus read failed or timed out
    #[error("{sensor}: read failed: {reason}")]
    ReadFailed { sensor: String, reason: String },

    /// No sensors could be brought up at all
    #[error("no sensors detected")]
    NoSensors,
}

/// Type alias for Result with our Error type
pub type Result<T> = std::result::Result<T, Error>;
