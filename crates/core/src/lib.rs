//! cansat-link-core: telemetry link between a CanSat and its ground station
//!
//! This library provides the pieces of a LoRa telemetry downlink that:
//! - Shortens field names with a versioned key map
//! - Splits each record into fragments small enough for one LoRa frame
//! - Sends frames over an RN2483 radio, or a seeded in-process link
//! - Reassembles fragments by pid on the ground, tolerating loss
//! - Stores completed records durably, one JSON object per line
//!
//! # Architecture
//!
//! The system is designed around clear module boundaries:
//! - `value`: Dynamic telemetry record type
//! - `keymap`: Field-name compression
//! - `packet`: Fragment type and the record splitter
//! - `framing`: Fragment wire encoding and tolerant decoding
//! - `reassembly`: Fragment reassembly with bounded memory
//! - `network`: Transport trait and seeded link simulator
//! - `radio`: RN2483 serial transport
//! - `sink`: Durable record storage
//! - `sensors`: Sensor interface and per-cycle collection
//! - `pipeline`: Can-side sender and ground station loop steps
//! - `metrics`: Observable system behavior
//!
//! # Design Principles
//!
//! - **No panics**: All errors are structured and recoverable
//! - **Bounded memory**: Pending records and remembered pids have fixed limits
//! - **Deterministic**: Seeded randomness makes simulated runs reproducible
//! - **Keep flying**: One bad frame, sensor or write never stops the loop

pub mod error;
pub mod framing;
pub mod keymap;
pub mod metrics;
pub mod network;
pub mod packet;
pub mod pipeline;
pub mod radio;
pub mod reassembly;
pub mod sensors;
pub mod sink;
pub mod value;

// Re-export commonly used types
pub use error::{Error, Result};
pub use keymap::KeyMap;
pub use network::{LinkConfig, SimulatedLink, Transport};
pub use packet::{Fragment, Splitter};
pub use pipeline::{GroundStation, Sender};
pub use reassembly::{Reassembler, ReassemblyConfig};
pub use sink::{JsonLinesSink, JsonMapSink, Sink};
pub use value::{TelemetryRecord, Value};
