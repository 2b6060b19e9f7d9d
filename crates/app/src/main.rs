//! cansat-link: CanSat LoRa telemetry sender and ground station.
//!
//! Three run modes:
//! - `simulate` (default): can, lossy link and station in one process
//! - `can`: sensor loop transmitting over an RN2483
//! - `station`: RN2483 receiver feeding reassembly and storage

mod config;
mod relay;
mod sim_sensors;

use cansat_link_core::metrics::Metrics;
use cansat_link_core::network::SimulatedLink;
use cansat_link_core::packet::{Partition, Splitter};
use cansat_link_core::pipeline::{build_record, validate, GroundStation, Sender};
use cansat_link_core::radio::SerialRadio;
use cansat_link_core::reassembly::Reassembler;
use cansat_link_core::sensors::SensorManager;
use cansat_link_core::sink::{session_dir, JsonLinesSink, JsonMapSink, Sink};
use cansat_link_core::{KeyMap, Result, TelemetryRecord, Transport};
use chrono::{Local, Utc};
use clap::Parser;
use config::{CanPlan, Cli, Config, Mode, SimulatePlan, StationPlan, Store};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Format of the `local` timestamp in every record.
const LOCAL_TIME_FORMAT: &str = "%Y-%b-%dT%H:%M:%S";

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let config = match Config::resolve(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(2);
        }
    };

    if config.print_config {
        config.print();
    }

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run(config: &Config) -> Result<()> {
    let metrics = match &config.mode {
        Mode::Simulate(plan) => run_simulate(config, plan)?,
        Mode::Can(plan) => run_can(config, plan)?,
        Mode::Station(plan) => run_station(config, plan)?,
    };

    if config.print_metrics {
        metrics.print_summary();
        if matches!(config.mode, Mode::Simulate(_)) {
            metrics.print_result();
        }
    }
    Ok(())
}

fn splitter(config: &Config) -> Splitter {
    Splitter::new(Partition::standard(), config.max_payload)
}

fn open_session(config: &Config) -> Result<PathBuf> {
    let dir = session_dir(&config.out_dir, &Local::now())?;
    info!(dir = %dir.display(), "session directory");
    Ok(dir)
}

/// One sensor cycle: collect, validate, stamp.
///
/// Returns the full record and its radio copy, both under `pid`.
fn cycle(sensors: &mut SensorManager, pid: u64) -> (TelemetryRecord, TelemetryRecord) {
    let (full, compact) = sensors.collect();
    validate(&full);

    let now = Utc::now();
    let local = now.with_timezone(&Local).format(LOCAL_TIME_FORMAT).to_string();
    let epoch = now.timestamp();

    (
        build_record(pid, epoch, &local, &full),
        build_record(pid, epoch, &local, &compact),
    )
}

fn send<T: Transport>(sender: &mut Sender<T>, record: &TelemetryRecord, metrics: &mut Metrics) {
    match sender.send(record) {
        Ok(report) => metrics.record_send(&report),
        Err(e) => {
            metrics.records_transmitted += 1;
            warn!(pid = record.pid(), error = %e, "record not sent");
        }
    }
}

fn run_simulate(config: &Config, plan: &SimulatePlan) -> Result<Metrics> {
    let link = plan.link;
    let mut sensors = SensorManager::new(sim_sensors::flight_suite(config.seed, plan.sensor_failure_rate))?;
    let dir = open_session(config)?;

    let shared = SimulatedLink::shared(link);
    let mut sender = Sender::new(shared.clone(), KeyMap::v1()?, splitter(config));
    let mut station = GroundStation::new(
        shared.clone(),
        Reassembler::new(config.reassembly.clone()),
        KeyMap::v1()?,
        JsonLinesSink::open(&dir, "ground", config.rollover)?,
    );
    let mut metrics = Metrics::new();

    info!(cycles = plan.cycles, seed = config.seed, "simulation starting");
    for n in 0..plan.cycles {
        let pid = n + 1;
        let (_, compact) = cycle(&mut sensors, pid);
        metrics.records_collected += 1;

        if n % plan.transmit_every == 0 {
            send(&mut sender, &compact, &mut metrics);
        }

        while station.poll_once() {}
        station.tick();

        if !plan.interval.is_zero() {
            thread::sleep(plan.interval);
        }
    }

    // let in-flight frames land
    let deadline = Instant::now() + Duration::from_millis(link.base_latency_ms + link.jitter_ms + 50);
    loop {
        while station.poll_once() {}
        let in_flight = shared
            .lock()
            .map_or(false, |link| link.has_pending());
        if !in_flight || Instant::now() >= deadline {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    station.finish();

    metrics.sensor_failures = sensors.failures();
    metrics.absorb_station(station.stats(), station.reassembler().stats());
    if let Ok(link) = shared.lock() {
        metrics.absorb_link(link.stats());
    }
    metrics.complete();

    info!(
        stored = station.sink().stats().appended,
        path = %station.sink().current_path().display(),
        "simulation finished"
    );
    Ok(metrics)
}

fn run_can(config: &Config, plan: &CanPlan) -> Result<Metrics> {
    let mut sensors = SensorManager::new(sim_sensors::flight_suite(config.seed, plan.sensor_failure_rate))?;
    let radio = SerialRadio::open(plan.radio.clone())?;
    let dir = open_session(config)?;
    let mut local_log = JsonLinesSink::open(&dir, "telemetry", config.rollover)?;

    let mut sender = Sender::new(radio, KeyMap::v1()?, splitter(config)).with_fragment_gap(plan.fragment_gap);
    let mut metrics = Metrics::new();

    info!(sensors = ?sensors.ids(), "flight loop starting");
    let mut n: u64 = 0;
    while plan.cycles.map_or(true, |limit| n < limit) {
        let pid = n + 1;
        let (full, compact) = cycle(&mut sensors, pid);
        metrics.records_collected += 1;

        if let Err(e) = local_log.append(&full) {
            error!(pid, error = %e, "failed to save record locally");
        }

        if n % plan.transmit_every == 0 {
            send(&mut sender, &compact, &mut metrics);
        }

        n += 1;
        thread::sleep(plan.interval);
    }

    metrics.sensor_failures = sensors.failures();
    metrics.complete();
    Ok(metrics)
}

fn run_station(config: &Config, plan: &StationPlan) -> Result<Metrics> {
    let radio = SerialRadio::open(plan.radio.clone())?;
    let dir = open_session(config)?;
    let sink = open_store(&dir, plan.store, config)?;

    let (queue, frames) = mpsc::sync_channel(plan.queue_capacity);
    let reader = thread::Builder::new()
        .name("radio-reader".to_string())
        .spawn(move || relay::read_loop(radio, queue))?;

    let mut station = GroundStation::new(
        relay::ChannelTransport::new(frames, plan.idle_poll),
        Reassembler::new(config.reassembly.clone()),
        KeyMap::v1()?,
        sink,
    );
    let mut metrics = Metrics::new();

    info!("ground station listening");
    loop {
        if station.service() {
            continue;
        }
        if station.transport_mut().is_closed() {
            break;
        }
    }
    station.finish();

    match reader.join() {
        Ok(forwarded) => info!(forwarded, "radio reader finished"),
        Err(_) => error!("radio reader panicked"),
    }

    metrics.absorb_station(station.stats(), station.reassembler().stats());
    metrics.complete();
    Ok(metrics)
}

fn open_store(dir: &Path, store: Store, config: &Config) -> Result<Box<dyn Sink>> {
    Ok(match store {
        Store::Lines => Box::new(JsonLinesSink::open(dir, "ground", config.rollover)?),
        Store::Map => Box::new(JsonMapSink::open(dir.join("ground.json"))?),
    })
}
