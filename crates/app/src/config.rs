//! Configuration for the cansat-link application.
//!
//! Parses command-line arguments and resolves them into a [`Config`],
//! filling gaps with defaults. Link impairments left unset are randomized
//! from the seed, so a run is reproducible from the seed alone.
//!
//! # Philosophy
//!
//! The tool should work with ZERO arguments: it then runs the in-process
//! simulation. All resolved values can be printed with `--print-config`.

use cansat_link_core::framing::MAX_LORA_PAYLOAD;
use cansat_link_core::network::LinkConfig;
use cansat_link_core::radio::{RadioConfig, RN2483_BAUD};
use cansat_link_core::reassembly::ReassemblyConfig;
use cansat_link_core::sink::RolloverPolicy;
use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// CanSat telemetry link: can, ground station, or both in one process
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Random seed for determinism (default: time-based)
    #[arg(long, global = true)]
    pub seed: Option<u64>,

    /// Root directory for session logs
    #[arg(long, global = true, default_value = "./telemetry")]
    pub out_dir: PathBuf,

    /// Largest frame handed to the radio, in bytes
    #[arg(long, global = true, default_value_t = MAX_LORA_PAYLOAD)]
    pub max_payload: usize,

    /// Partial records buffered at once on the ground
    #[arg(long, global = true, default_value_t = 4)]
    pub max_pending: usize,

    /// Fragments accepted for one pid before it is abandoned
    #[arg(long, global = true, default_value_t = 8)]
    pub fragment_budget: usize,

    /// Reassembly timeout in milliseconds
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Log file size that triggers rollover, in bytes
    #[arg(long, global = true, default_value_t = 5 * 1024 * 1024)]
    pub max_file_bytes: u64,

    /// Records per log file before rollover
    #[arg(long, global = true, default_value_t = 500)]
    pub max_file_records: usize,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Print resolved configuration
    #[arg(long, global = true)]
    pub print_config: bool,

    /// Don't print metrics summary
    #[arg(long, global = true)]
    pub no_metrics: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Can, lossy link and ground station in one process (default)
    Simulate(SimulateArgs),
    /// Flight loop: read sensors, log locally, transmit over the RN2483
    Can(CanArgs),
    /// Ground loop: receive over the RN2483, reassemble and store
    Station(StationArgs),
}

#[derive(Args, Debug, Default)]
pub struct SimulateArgs {
    /// Telemetry cycles to run
    #[arg(long, default_value_t = 50)]
    pub cycles: u64,

    /// Transmit every Nth cycle
    #[arg(long, default_value_t = 1)]
    pub transmit_every: u64,

    /// Pause between cycles in milliseconds
    #[arg(long, default_value_t = 0)]
    pub interval_ms: u64,

    /// Probability a sensor read fails
    #[arg(long, default_value_t = 0.02)]
    pub sensor_failure_rate: f64,

    /// Base link latency (default: random 10-80)
    #[arg(long)]
    pub latency: Option<u64>,

    /// Latency jitter (default: random 0-40)
    #[arg(long)]
    pub jitter: Option<u64>,

    /// Frame loss rate 0.0-1.0 (default: random 0-0.05)
    #[arg(long)]
    pub loss: Option<f64>,

    /// Disable frame loss (same as --loss 0)
    #[arg(long)]
    pub no_loss: bool,

    /// Frame duplication rate (default: random 0-0.03)
    #[arg(long)]
    pub duplicate: Option<f64>,

    /// Frame truncation rate (default: random 0-0.03)
    #[arg(long)]
    pub corrupt: Option<f64>,
}

#[derive(Args, Debug)]
pub struct SerialArgs {
    /// Serial device of the RN2483
    #[arg(long, default_value = "/dev/ttyUSB0")]
    pub port: String,

    /// Baud rate
    #[arg(long, default_value_t = RN2483_BAUD)]
    pub baud: u32,
}

#[derive(Args, Debug)]
pub struct CanArgs {
    #[command(flatten)]
    pub serial: SerialArgs,

    /// Telemetry cycles to run (default: until killed)
    #[arg(long)]
    pub cycles: Option<u64>,

    /// Transmit every Nth cycle
    #[arg(long, default_value_t = 10)]
    pub transmit_every: u64,

    /// Pause between cycles in milliseconds
    #[arg(long, default_value_t = 100)]
    pub interval_ms: u64,

    /// Pause between fragments of one record in milliseconds
    #[arg(long, default_value_t = 20)]
    pub fragment_gap_ms: u64,

    /// Probability a simulated sensor read fails
    #[arg(long, default_value_t = 0.0)]
    pub sensor_failure_rate: f64,
}

/// Where the ground station writes completed records.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Store {
    /// Append-only JSON lines with rollover
    Lines,
    /// One JSON object keyed by pid
    Map,
}

#[derive(Args, Debug)]
pub struct StationArgs {
    #[command(flatten)]
    pub serial: SerialArgs,

    /// Idle wait before running timeouts, in milliseconds
    #[arg(long, default_value_t = 250)]
    pub idle_poll_ms: u64,

    /// Frames queued between the radio reader and reassembly
    #[arg(long, default_value_t = 64)]
    pub queue_capacity: usize,

    /// Storage layout
    #[arg(long, value_enum, default_value_t = Store::Lines)]
    pub store: Store,
}

/// Fully resolved run configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub seed: u64,
    pub out_dir: PathBuf,
    pub max_payload: usize,
    pub reassembly: ReassemblyConfig,
    pub rollover: RolloverPolicy,
    pub print_config: bool,
    pub print_metrics: bool,
    pub mode: Mode,
}

#[derive(Debug, Clone)]
pub enum Mode {
    Simulate(SimulatePlan),
    Can(CanPlan),
    Station(StationPlan),
}

#[derive(Debug, Clone)]
pub struct SimulatePlan {
    pub cycles: u64,
    pub transmit_every: u64,
    pub interval: Duration,
    pub sensor_failure_rate: f64,
    pub link: LinkConfig,
}

#[derive(Debug, Clone)]
pub struct CanPlan {
    pub radio: RadioConfig,
    pub cycles: Option<u64>,
    pub transmit_every: u64,
    pub interval: Duration,
    pub fragment_gap: Duration,
    pub sensor_failure_rate: f64,
}

#[derive(Debug, Clone)]
pub struct StationPlan {
    pub radio: RadioConfig,
    pub idle_poll: Duration,
    pub queue_capacity: usize,
    pub store: Store,
}

impl Config {
    /// Resolve parsed arguments.
    ///
    /// With no `--seed`, a time-based seed is used and reported by
    /// [`Config::print`].
    pub fn resolve(cli: Cli) -> Result<Self, String> {
        let seed = cli.seed.unwrap_or_else(time_seed);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        if cli.max_payload == 0 || cli.max_payload > MAX_LORA_PAYLOAD {
            return Err(format!(
                "--max-payload must be between 1 and {MAX_LORA_PAYLOAD}"
            ));
        }

        let simulating = matches!(cli.command, None | Some(Command::Simulate(_)));
        let timeout_ms = cli.timeout_ms.unwrap_or_else(|| {
            // simulated passes last seconds, real ones minutes
            if simulating {
                rng.gen_range(500..=3000)
            } else {
                30_000
            }
        });

        let reassembly = ReassemblyConfig {
            max_pending: cli.max_pending,
            fragment_budget: cli.fragment_budget,
            timeout: Duration::from_millis(timeout_ms),
            ..ReassemblyConfig::default()
        };
        let rollover = RolloverPolicy {
            max_bytes: cli.max_file_bytes,
            max_records: cli.max_file_records,
        };

        let mode = match cli.command {
            None => resolve_simulate(SimulateArgs::defaults(), seed, cli.max_payload, &mut rng)?,
            Some(Command::Simulate(args)) => resolve_simulate(args, seed, cli.max_payload, &mut rng)?,
            Some(Command::Can(args)) => {
                check_every(args.transmit_every)?;
                check_rate("--sensor-failure-rate", args.sensor_failure_rate)?;
                Mode::Can(CanPlan {
                    radio: radio_config(&args.serial),
                    cycles: args.cycles,
                    transmit_every: args.transmit_every,
                    interval: Duration::from_millis(args.interval_ms),
                    fragment_gap: Duration::from_millis(args.fragment_gap_ms),
                    sensor_failure_rate: args.sensor_failure_rate,
                })
            }
            Some(Command::Station(args)) => {
                if args.queue_capacity == 0 {
                    return Err("--queue-capacity must be at least 1".to_string());
                }
                Mode::Station(StationPlan {
                    radio: radio_config(&args.serial),
                    idle_poll: Duration::from_millis(args.idle_poll_ms),
                    queue_capacity: args.queue_capacity,
                    store: args.store,
                })
            }
        };

        Ok(Config {
            seed,
            out_dir: cli.out_dir,
            max_payload: cli.max_payload,
            reassembly,
            rollover,
            print_config: cli.print_config,
            print_metrics: !cli.no_metrics,
            mode,
        })
    }

    /// Print the configuration in human-readable form.
    pub fn print(&self) {
        println!("=== Configuration ===");
        println!("Seed: {}", self.seed);
        println!("Output root: {}", self.out_dir.display());
        println!("Max payload: {} bytes", self.max_payload);
        println!();

        match &self.mode {
            Mode::Simulate(SimulatePlan {
                cycles,
                transmit_every,
                interval,
                sensor_failure_rate,
                link,
            }) => {
                println!("=== Simulation ===");
                println!("Cycles: {cycles} (transmit every {transmit_every})");
                println!("Interval: {} ms", interval.as_millis());
                println!("Sensor failure rate: {:.2}%", sensor_failure_rate * 100.0);
                println!();
                println!("=== Link Simulation ===");
                println!("Base latency: {} ms", link.base_latency_ms);
                println!("Jitter: ±{} ms", link.jitter_ms);
                println!("Loss rate: {:.2}%", link.loss_rate * 100.0);
                println!("Duplicate rate: {:.2}%", link.duplicate_rate * 100.0);
                println!("Truncation rate: {:.2}%", link.corrupt_rate * 100.0);
            }
            Mode::Can(CanPlan {
                radio,
                cycles,
                transmit_every,
                interval,
                fragment_gap,
                ..
            }) => {
                println!("=== Can ===");
                println!("Port: {} @ {} baud", radio.port, radio.baud_rate);
                match cycles {
                    Some(n) => println!("Cycles: {n}"),
                    None => println!("Cycles: unbounded"),
                }
                println!("Transmit every: {transmit_every} cycles");
                println!("Interval: {} ms", interval.as_millis());
                println!("Fragment gap: {} ms", fragment_gap.as_millis());
            }
            Mode::Station(StationPlan {
                radio,
                idle_poll,
                queue_capacity,
                store,
            }) => {
                println!("=== Station ===");
                println!("Port: {} @ {} baud", radio.port, radio.baud_rate);
                println!("Idle poll: {} ms", idle_poll.as_millis());
                println!("Queue capacity: {queue_capacity}");
                println!("Store: {store:?}");
            }
        }
        println!();

        println!("=== Reassembly ===");
        println!("Expected fragments: {}", self.reassembly.expected_fragments);
        println!("Max pending: {}", self.reassembly.max_pending);
        println!("Fragment budget: {}", self.reassembly.fragment_budget);
        println!("Timeout: {} ms", self.reassembly.timeout.as_millis());
        println!();
        println!("=== Storage ===");
        println!(
            "Rollover: {} bytes / {} records",
            self.rollover.max_bytes, self.rollover.max_records
        );
        println!();
    }
}

impl SimulateArgs {
    /// Same values clap would fill in for a bare `simulate`.
    fn defaults() -> Self {
        Self {
            cycles: 50,
            transmit_every: 1,
            sensor_failure_rate: 0.02,
            ..Self::default()
        }
    }
}

fn resolve_simulate(
    args: SimulateArgs,
    seed: u64,
    max_payload: usize,
    rng: &mut ChaCha8Rng,
) -> Result<Mode, String> {
    check_every(args.transmit_every)?;
    check_rate("--sensor-failure-rate", args.sensor_failure_rate)?;

    let loss_rate = if args.no_loss {
        0.0
    } else {
        args.loss.unwrap_or_else(|| {
            // Bias toward small loss rates
            let r: f64 = rng.gen();
            (r * r * 0.05).min(0.05)
        })
    };

    let link = LinkConfig {
        base_latency_ms: args.latency.unwrap_or_else(|| rng.gen_range(10..=80)),
        jitter_ms: args.jitter.unwrap_or_else(|| rng.gen_range(0..=40)),
        loss_rate,
        duplicate_rate: args.duplicate.unwrap_or_else(|| rng.gen_range(0.0..=0.03)),
        corrupt_rate: args.corrupt.unwrap_or_else(|| rng.gen_range(0.0..=0.03)),
        max_payload,
        seed,
    };
    check_rate("--loss", link.loss_rate)?;
    check_rate("--duplicate", link.duplicate_rate)?;
    check_rate("--corrupt", link.corrupt_rate)?;

    Ok(Mode::Simulate(SimulatePlan {
        cycles: args.cycles,
        transmit_every: args.transmit_every,
        interval: Duration::from_millis(args.interval_ms),
        sensor_failure_rate: args.sensor_failure_rate,
        link,
    }))
}

fn radio_config(serial: &SerialArgs) -> RadioConfig {
    RadioConfig {
        baud_rate: serial.baud,
        ..RadioConfig::new(serial.port.as_str())
    }
}

fn check_rate(flag: &str, rate: f64) -> Result<(), String> {
    if (0.0..=1.0).contains(&rate) {
        Ok(())
    } else {
        Err(format!("{flag} must be between 0.0 and 1.0, got {rate}"))
    }
}

fn check_every(every: u64) -> Result<(), String> {
    if every == 0 {
        Err("--transmit-every must be at least 1".to_string())
    } else {
        Ok(())
    }
}

fn time_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let cli = Cli::try_parse_from(std::iter::once("cansat-link").chain(args.iter().copied())).unwrap();
        Config::resolve(cli).unwrap()
    }

    #[test]
    fn test_zero_args_simulates() {
        let config = parse(&["--seed", "42"]);
        assert_eq!(config.seed, 42);
        assert!(matches!(
            config.mode,
            Mode::Simulate(SimulatePlan { cycles: 50, transmit_every: 1, .. })
        ));
        assert!(config.print_metrics);
    }

    #[test]
    fn test_seed_is_reproducible() {
        let a = parse(&["--seed", "7"]);
        let b = parse(&["--seed", "7"]);

        let (Mode::Simulate(sa), Mode::Simulate(sb)) = (a.mode, b.mode) else {
            panic!("expected simulate mode");
        };
        assert_eq!(sa.link.base_latency_ms, sb.link.base_latency_ms);
        assert_eq!(sa.link.loss_rate, sb.link.loss_rate);
        assert_eq!(a.reassembly.timeout, b.reassembly.timeout);
    }

    #[test]
    fn test_no_loss_overrides() {
        let config = parse(&["simulate", "--no-loss", "--latency", "5", "--seed", "1"]);
        let Mode::Simulate(SimulatePlan { link, .. }) = config.mode else {
            panic!("expected simulate mode");
        };
        assert_eq!(link.loss_rate, 0.0);
        assert_eq!(link.base_latency_ms, 5);
    }

    #[test]
    fn test_station_defaults() {
        let config = parse(&["station", "--port", "/dev/ttyACM0"]);
        let Mode::Station(plan) = config.mode else {
            panic!("expected station mode");
        };
        assert_eq!(plan.radio.port, "/dev/ttyACM0");
        assert_eq!(plan.radio.baud_rate, RN2483_BAUD);
        assert_eq!(plan.idle_poll, Duration::from_millis(250));
        assert_eq!(plan.store, Store::Lines);
        assert_eq!(config.reassembly.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_can_transmits_every_tenth_cycle() {
        let config = parse(&["can"]);
        assert!(matches!(config.mode, Mode::Can(CanPlan { transmit_every: 10, .. })));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cli = Cli::try_parse_from(["cansat-link", "simulate", "--loss", "1.5"]).unwrap();
        assert!(Config::resolve(cli).is_err());

        let cli = Cli::try_parse_from(["cansat-link", "--max-payload", "1000"]).unwrap();
        assert!(Config::resolve(cli).is_err());
    }
}
