//! Sensor collaborator interface.
//!
//! Every physical device is one [`Sensor`]. A reading is a small record
//! keyed by quantity (`"temperature"`, `"pressure"`, ...); the manager files
//! each quantity under the sensor's id, so redundant sensors sit side by
//! side:
//!
//! ```text
//! temperature: { bmp280: 21.31, mcp9808: 21.12, bme688: null, lps25h: 20.94 }
//! ```
//!
//! A failed read never aborts collection: that sensor's quantities become
//! null for this cycle and the rest carry on.

use crate::error::{Result, SensorError};
use crate::value::{TelemetryRecord, Value};
use tracing::warn;

/// Decimal places kept in the radio copy of a reading.
pub const RADIO_DECIMALS: u32 = 2;

/// Quantities sent over the radio unrounded. Two decimals of a degree is
/// about a kilometre.
pub const FULL_PRECISION: &[&str] = &["gps_coordinates"];

/// One physical device on the I2C or UART bus.
pub trait Sensor {
    /// Stable id, used as the key under each quantity
    fn id(&self) -> &str;

    /// Quantities this sensor reports
    fn channels(&self) -> &[&str];

    /// Take one reading, keyed by quantity.
    fn read(&mut self) -> std::result::Result<TelemetryRecord, SensorError>;
}

/// Static suite of sensors polled once per cycle.
pub struct SensorManager {
    sensors: Vec<Box<dyn Sensor>>,
    failures: u64,
}

impl SensorManager {
    /// # Errors
    /// `SensorError::NoSensors` when the suite is empty; nothing useful can
    /// be flown without at least one sensor.
    pub fn new(sensors: Vec<Box<dyn Sensor>>) -> Result<Self> {
        if sensors.is_empty() {
            return Err(SensorError::NoSensors.into());
        }
        Ok(Self {
            sensors,
            failures: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.sensors.iter().map(|s| s.id()).collect()
    }

    /// Failed reads since start.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Poll every sensor once.
    ///
    /// Returns the full-precision data and the radio copy rounded to
    /// [`RADIO_DECIMALS`], except for the [`FULL_PRECISION`] quantities.
    pub fn collect(&mut self) -> (TelemetryRecord, TelemetryRecord) {
        let mut full = TelemetryRecord::new();

        for sensor in &mut self.sensors {
            let reading = match sensor.read() {
                Ok(reading) => Some(reading),
                Err(e) => {
                    self.failures += 1;
                    warn!(sensor = sensor.id(), error = %e, "sensor read failed");
                    None
                }
            };

            let id = sensor.id().to_string();
            for channel in sensor.channels() {
                let value = reading
                    .as_ref()
                    .and_then(|r| r.get(channel))
                    .cloned()
                    .unwrap_or(Value::Null);
                full.map_entry(channel).insert(id.clone(), value);
            }
        }

        let mut compact = full.rounded(RADIO_DECIMALS);
        for quantity in FULL_PRECISION {
            if let Some(exact) = full.get(quantity) {
                compact.insert(*quantity, exact.clone());
            }
        }
        (full, compact)
    }
}
