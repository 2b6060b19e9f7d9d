//! Simulated sensor suite for runs without hardware.
//!
//! Each device follows one shared flight profile (climb, then descent under
//! parachute) with a little seeded noise on top, and fails a read now and
//! then so the degraded paths get exercised.
//!
//! # Design
//!
//! - Every device owns its own ChaCha8 stream, derived from the run seed
//!   and its position in the suite, so adding a device does not perturb
//!   the others.
//! - Failures are per read and independent.

use cansat_link_core::error::SensorError;
use cansat_link_core::sensors::Sensor;
use cansat_link_core::value::{TelemetryRecord, Value};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Cycles spent climbing before apogee.
const ASCENT_CYCLES: u64 = 60;
const APOGEE_M: f64 = 900.0;
const DESCENT_M_PER_CYCLE: f64 = 8.0;

const GROUND_PRESSURE_HPA: f64 = 1013.25;
const GROUND_TEMPERATURE_C: f64 = 18.0;

/// Altitude above the launch site after `step` cycles.
pub fn altitude_at(step: u64) -> f64 {
    if step <= ASCENT_CYCLES {
        APOGEE_M * step as f64 / ASCENT_CYCLES as f64
    } else {
        (APOGEE_M - DESCENT_M_PER_CYCLE * (step - ASCENT_CYCLES) as f64).max(0.0)
    }
}

fn pressure_at(altitude: f64) -> f64 {
    GROUND_PRESSURE_HPA * (1.0 - altitude / 44_330.0).powf(5.255)
}

fn temperature_at(altitude: f64) -> f64 {
    GROUND_TEMPERATURE_C - 0.0065 * altitude
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Model {
    Bmp280,
    Bme688,
    Lps25h,
    Mcp9808,
    Icm20948,
    M8n,
    Max17048,
}

impl Model {
    fn id(self) -> &'static str {
        match self {
            Model::Bmp280 => "bmp280",
            Model::Bme688 => "bme688",
            Model::Lps25h => "lps25h",
            Model::Mcp9808 => "mcp9808",
            Model::Icm20948 => "icm20948",
            Model::M8n => "m8n",
            Model::Max17048 => "max17048",
        }
    }

    fn channels(self) -> &'static [&'static str] {
        match self {
            Model::Bmp280 => &["temperature", "pressure", "altitude"],
            Model::Bme688 => &["temperature", "pressure", "humidity"],
            Model::Lps25h => &["temperature", "pressure"],
            Model::Mcp9808 => &["temperature"],
            Model::Icm20948 => &["acceleration", "gyroscope"],
            Model::M8n => &["gps_coordinates"],
            Model::Max17048 => &["battery"],
        }
    }
}

/// One simulated device.
pub struct SimulatedSensor {
    model: Model,
    rng: ChaCha8Rng,
    failure_rate: f64,
    step: u64,
}

impl SimulatedSensor {
    fn new(model: Model, seed: u64, failure_rate: f64) -> Self {
        Self {
            model,
            rng: ChaCha8Rng::seed_from_u64(seed),
            failure_rate,
            step: 0,
        }
    }

    fn noise(&mut self, amplitude: f64) -> f64 {
        self.rng.gen_range(-amplitude..=amplitude)
    }

    fn triple(&mut self, prefix: &str, base: [f64; 3], amplitude: f64) -> Value {
        ["x", "y", "z"]
            .iter()
            .zip(base)
            .map(|(axis, b)| (format!("{prefix}_{axis}"), Value::from(b + self.noise(amplitude))))
            .collect::<TelemetryRecord>()
            .into()
    }

    fn sample(&mut self, altitude: f64) -> TelemetryRecord {
        let mut reading = TelemetryRecord::new();
        let temperature = temperature_at(altitude);
        let pressure = pressure_at(altitude);

        match self.model {
            Model::Bmp280 => {
                reading.insert("temperature", temperature + self.noise(0.3));
                reading.insert("pressure", pressure + self.noise(0.5));
                reading.insert("altitude", altitude + self.noise(1.5));
            }
            Model::Bme688 => {
                reading.insert("temperature", temperature + self.noise(0.5));
                reading.insert("pressure", pressure + self.noise(0.8));
                reading.insert("humidity", (45.0 - altitude / 60.0 + self.noise(2.0)).max(0.0));
            }
            Model::Lps25h => {
                reading.insert("temperature", temperature + self.noise(0.6));
                reading.insert("pressure", pressure + self.noise(0.3));
            }
            Model::Mcp9808 => {
                reading.insert("temperature", temperature + self.noise(0.1));
            }
            Model::Icm20948 => {
                let thrust = if self.step < ASCENT_CYCLES / 6 { 25.0 } else { 9.81 };
                let acceleration = self.triple("accel", [0.0, 0.0, thrust], 0.4);
                let gyroscope = self.triple("gyro", [0.0, 0.0, 0.0], 3.0);
                reading.insert("acceleration", acceleration);
                reading.insert("gyroscope", gyroscope);
            }
            Model::M8n => {
                let mut fix = TelemetryRecord::new();
                let drift = self.step as f64 * 0.000_05;
                fix.insert("latitude", 47.5316 + drift + self.noise(0.000_02));
                fix.insert("longitude", 21.6273 + drift / 2.0 + self.noise(0.000_02));
                // receiver reports these to one decimal
                fix.insert("speed", ((3.0 + self.noise(1.0)).max(0.0) * 10.0).round() / 10.0);
                fix.insert("course", ((65.0 + self.noise(10.0)) * 10.0).round() / 10.0);
                reading.insert("gps_coordinates", fix);
            }
            Model::Max17048 => {
                let soc = (100.0 - self.step as f64 * 0.05).max(0.0);
                let mut battery = TelemetryRecord::new();
                battery.insert("voltage", 3.3 + 0.9 * soc / 100.0 + self.noise(0.01));
                battery.insert("soc", soc);
                reading.insert("battery", battery);
            }
        }

        reading
    }
}

impl Sensor for SimulatedSensor {
    fn id(&self) -> &str {
        self.model.id()
    }

    fn channels(&self) -> &[&str] {
        self.model.channels()
    }

    fn read(&mut self) -> Result<TelemetryRecord, SensorError> {
        let altitude = altitude_at(self.step);
        self.step += 1;

        if self.failure_rate > 0.0 && self.rng.gen::<f64>() < self.failure_rate {
            return Err(SensorError::ReadFailed {
                sensor: self.model.id().to_string(),
                reason: "i2c timeout".to_string(),
            });
        }

        Ok(self.sample(altitude))
    }
}

/// The flight suite, seeded from `seed`.
pub fn flight_suite(seed: u64, failure_rate: f64) -> Vec<Box<dyn Sensor>> {
    [
        Model::Bmp280,
        Model::Bme688,
        Model::Lps25h,
        Model::Mcp9808,
        Model::Icm20948,
        Model::M8n,
        Model::Max17048,
    ]
    .into_iter()
    .enumerate()
    .map(|(index, model)| {
        let sensor_seed = seed.wrapping_add(index as u64 + 1);
        Box::new(SimulatedSensor::new(model, sensor_seed, failure_rate)) as Box<dyn Sensor>
    })
    .collect()
}
