//! The two ends of the link.
//!
//! [`Sender`] runs on the can: key-compress a record, split it, frame each
//! fragment and hand it to the radio. [`GroundStation`] runs on the ground:
//! poll the radio, reassemble, expand keys and persist.
//!
//! Both are single-threaded steps driven by the caller's loop. Failures in
//! one step are logged and counted; the loop keeps going.

use crate::error::Result;
use crate::framing::encode_frame;
use crate::keymap::KeyMap;
use crate::network::Transport;
use crate::packet::Splitter;
use crate::reassembly::{CompletedRecord, Event, Reassembler};
use crate::sink::Sink;
use crate::value::{TelemetryRecord, Value, PID_KEY, TYPE_KEY};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// `type` of a regular telemetry record.
pub const TELEMETRY_TYPE: &str = "TLM";

/// Default spacing of timeout checks in [`GroundStation::service`].
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Assemble one telemetry record from collected sensor data.
///
/// `data` is merged in at top level, next to the identity fields.
pub fn build_record(pid: u64, epoch: i64, local: &str, data: &TelemetryRecord) -> TelemetryRecord {
    let mut record = data.clone();
    record.insert(PID_KEY, pid);
    record.insert(TYPE_KEY, TELEMETRY_TYPE);
    record.insert("valid", true);
    record.insert("epoch", epoch);
    record.insert("local", local);
    record
}

/// Quantities worth a warning when no sensor produced them.
const WATCHED: &[&str] = &["altitude", "temperature", "gps_coordinates"];

/// Log missing critical quantities; returns their names.
///
/// Data is never rejected: a cycle without GPS is still worth sending.
pub fn validate(data: &TelemetryRecord) -> Vec<&'static str> {
    let missing: Vec<&'static str> = WATCHED
        .iter()
        .copied()
        .filter(|quantity| !has_reading(data.get(quantity)))
        .collect();

    for quantity in &missing {
        warn!(quantity, "no reading this cycle");
    }
    missing
}

fn has_reading(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Map(sources)) => sources.iter().any(|(_, v)| !v.is_null()),
        Some(_) => true,
    }
}

/// What happened to one record on the way out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    pub pid: u64,
    pub fragments: usize,
    pub transmitted: usize,
    pub failed: usize,
    pub bytes: usize,
}

/// Can-side half of the link.
pub struct Sender<T: Transport> {
    transport: T,
    keymap: KeyMap,
    splitter: Splitter,
    fragment_gap: Duration,
}

impl<T: Transport> Sender<T> {
    pub fn new(transport: T, keymap: KeyMap, splitter: Splitter) -> Self {
        Self {
            transport,
            keymap,
            splitter,
            fragment_gap: Duration::ZERO,
        }
    }

    /// Pause between fragments of one record.
    pub fn with_fragment_gap(mut self, gap: Duration) -> Self {
        self.fragment_gap = gap;
        self
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Encode, split and transmit one record.
    ///
    /// Transmit failures are logged and counted in the report; the rest of
    /// the fragments still go out.
    ///
    /// # Errors
    /// Only when the record cannot be split (no pid, oversized fragment).
    pub fn send(&mut self, record: &TelemetryRecord) -> Result<SendReport> {
        let encoded = self.keymap.encode(record);
        let fragments = self.splitter.split(&encoded)?;

        let mut report = SendReport {
            pid: fragments.first().map_or(0, |f| f.pid),
            fragments: fragments.len(),
            ..SendReport::default()
        };

        for (index, fragment) in fragments.iter().enumerate() {
            if index > 0 && !self.fragment_gap.is_zero() {
                thread::sleep(self.fragment_gap);
            }

            let frame = encode_frame(fragment)?;
            match self.transport.transmit(&frame) {
                Ok(()) => {
                    report.transmitted += 1;
                    report.bytes += frame.len();
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(pid = fragment.pid, index, error = %e, "transmit failed");
                }
            }
        }

        debug!(
            pid = report.pid,
            fragments = report.fragments,
            bytes = report.bytes,
            "record sent"
        );
        Ok(report)
    }
}

/// Counters for the ground station.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StationStats {
    pub frames: u64,
    pub receive_errors: u64,
    pub malformed: u64,
    pub completed: u64,
    pub superseded: u64,
    pub persisted: u64,
    pub persist_failures: u64,
}

/// Ground-side half of the link.
pub struct GroundStation<T: Transport, S: Sink> {
    transport: T,
    reassembler: Reassembler,
    keymap: KeyMap,
    sink: S,
    stats: StationStats,
    tick_every: Duration,
    last_tick: Instant,
}

impl<T: Transport, S: Sink> GroundStation<T, S> {
    pub fn new(transport: T, reassembler: Reassembler, keymap: KeyMap, sink: S) -> Self {
        Self {
            transport,
            reassembler,
            keymap,
            sink,
            stats: StationStats::default(),
            tick_every: TICK_INTERVAL,
            last_tick: Instant::now(),
        }
    }

    pub fn with_tick_interval(mut self, every: Duration) -> Self {
        self.tick_every = every;
        self
    }

    /// Poll once, then check timeouts if `tick_every` has passed since the
    /// last check, whether or not a frame arrived.
    ///
    /// Returns whether a frame was received.
    pub fn service(&mut self) -> bool {
        let received = self.poll_once();
        if self.last_tick.elapsed() >= self.tick_every {
            self.tick();
        }
        received
    }

    /// Poll the transport once and process what arrived.
    ///
    /// Returns whether a frame was received.
    pub fn poll_once(&mut self) -> bool {
        match self.transport.receive() {
            Ok(Some(frame)) => {
                self.process_frame(&frame);
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.stats.receive_errors += 1;
                warn!(error = %e, "receive failed");
                false
            }
        }
    }

    /// Feed one raw frame through reassembly and persistence.
    pub fn process_frame(&mut self, frame: &[u8]) {
        self.stats.frames += 1;
        let events = self.reassembler.insert_frame(frame);
        self.handle(events);
    }

    /// Abandon or complete partial records that have timed out.
    pub fn tick(&mut self) {
        self.last_tick = Instant::now();
        let events = self.reassembler.check_timeouts();
        self.handle(events);
    }

    /// Resolve everything still pending; call once at end of stream.
    pub fn finish(&mut self) {
        let events = self.reassembler.flush();
        self.handle(events);
    }

    pub fn stats(&self) -> StationStats {
        self.stats
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn handle(&mut self, events: Vec<Event>) {
        for event in events {
            match event {
                Event::Completed(completed) => {
                    self.stats.completed += 1;
                    self.persist(completed);
                }
                Event::Superseded { .. } => self.stats.superseded += 1,
                Event::Malformed { .. } => self.stats.malformed += 1,
            }
        }
    }

    fn persist(&mut self, completed: CompletedRecord) {
        let record = self.keymap.decode(&completed.record);
        match self.sink.append(&record) {
            Ok(()) => {
                self.stats.persisted += 1;
                info!(pid = completed.pid, fragments = completed.fragments, "record stored");
            }
            Err(e) => {
                self.stats.persist_failures += 1;
                error!(pid = completed.pid, error = %e, "failed to persist record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SinkError, TransportError};
    use crate::network::{LinkConfig, SimulatedLink};
    use crate::reassembly::{PidState, ReassemblyConfig};
    use serde_json::json;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct MemorySink {
        records: Vec<TelemetryRecord>,
        fail: bool,
    }

    impl Sink for MemorySink {
        fn append(&mut self, record: &TelemetryRecord) -> Result<()> {
            if self.fail {
                return Err(SinkError::Corrupted {
                    path: "memory".into(),
                    reason: "disk full".into(),
                }
                .into());
            }
            self.records.push(record.clone());
            Ok(())
        }
    }

    /// Transport that replays canned frames and fails every transmit.
    struct Canned {
        frames: VecDeque<Vec<u8>>,
    }

    impl Transport for Canned {
        fn transmit(&mut self, _frame: &[u8]) -> Result<()> {
            Err(TransportError::Timeout {
                command: "radio tx".into(),
                timeout_ms: 1,
            }
            .into())
        }

        fn receive(&mut self) -> Result<Option<Vec<u8>>> {
            Ok(self.frames.pop_front())
        }
    }

    fn data() -> TelemetryRecord {
        TelemetryRecord::from_json_value(json!({
            "temperature": {"bmp280": 21.3, "mcp9808": 21.1},
            "pressure": {"bmp280": 1003.2},
            "altitude": {"bmp280": 84.1},
            "humidity": {"bme688": 40.2},
            "acceleration": {"icm20948": {"accel_x": 0.1, "accel_y": 0.0, "accel_z": 9.8}},
            "gyroscope": {"icm20948": {"gyro_x": 0.0, "gyro_y": 0.0, "gyro_z": 0.0}},
            "gps_coordinates": {"m8n": {"latitude": 47.8, "longitude": 21.2}},
            "battery": {"max17048": {"voltage": 3.8, "soc": 71.0}}
        }))
        .unwrap()
    }

    fn station<T: Transport>(transport: T) -> GroundStation<T, MemorySink> {
        GroundStation::new(
            transport,
            Reassembler::new(ReassemblyConfig::default()),
            KeyMap::v1().unwrap(),
            MemorySink::default(),
        )
    }

    #[test]
    fn test_build_record_identity() {
        let record = build_record(9, 1_715_049_537, "2024-May-07T02:38:57", &data());
        assert_eq!(record.pid(), Some(9));
        assert_eq!(record.record_type(), Some(TELEMETRY_TYPE));
        assert_eq!(record.get("valid"), Some(&Value::Bool(true)));
        assert!(record.contains_key("temperature"));
    }

    #[test]
    fn test_validate_logs_but_never_rejects() {
        assert!(validate(&data()).is_empty());

        let mut sparse = data();
        sparse.remove("gps_coordinates");
        sparse.insert("altitude", TelemetryRecord::from_json_value(json!({"bmp280": null})).unwrap());
        assert_eq!(validate(&sparse), vec!["altitude", "gps_coordinates"]);
    }

    #[test]
    fn test_sender_to_station_roundtrip() {
        let link = SimulatedLink::shared(LinkConfig::perfect(1));
        let mut sender = Sender::new(link.clone(), KeyMap::v1().unwrap(), Splitter::standard());
        let mut ground = station(link);

        let record = build_record(1, 100, "now", &data());
        let report = sender.send(&record).unwrap();
        assert_eq!(report.fragments, 4);
        assert_eq!(report.transmitted, 4);

        while ground.poll_once() {}

        let stored = &ground.sink().records;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].pid(), Some(1));
        assert_eq!(stored[0].get_path(&["temperature", "mcp9808"]), Some(&Value::Float(21.1)));
        assert_eq!(stored[0].get_path(&["temperature", "lps25h"]), Some(&Value::from("N/A")));
        assert_eq!(
            stored[0].get_path(&["acceleration", "icm20948", "accel_z"]),
            Some(&Value::Float(9.8))
        );
        // the validity flag stays on the can
        assert!(!stored[0].contains_key("valid"));
    }

    #[test]
    fn test_transmit_failures_do_not_stop_the_cycle() {
        let mut sender = Sender::new(
            Canned { frames: VecDeque::new() },
            KeyMap::v1().unwrap(),
            Splitter::standard(),
        );

        let report = sender.send(&build_record(2, 0, "", &data())).unwrap();

        assert_eq!(report.fragments, 4);
        assert_eq!(report.failed, 4);
        assert_eq!(report.transmitted, 0);
    }

    #[test]
    fn test_unsplittable_record_is_an_error() {
        let mut sender = Sender::new(
            SimulatedLink::new(LinkConfig::perfect(1)),
            KeyMap::v1().unwrap(),
            Splitter::standard(),
        );
        assert!(sender.send(&data()).is_err());
    }

    #[test]
    fn test_station_survives_garbage() {
        let frames = VecDeque::from(vec![
            b"\xff\x00garbage".to_vec(),
            br#"{"pid":3,"bat":{},"tmp":{},"alt":1,"hum":2,"acc":{},"gyr":{}}"#.to_vec(),
            br#"{"pid":4"#.to_vec(),
        ]);
        let mut ground = station(Canned { frames });

        while ground.poll_once() {}
        ground.finish();

        let stats = ground.stats();
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.malformed, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(ground.sink().records[0].pid(), Some(3));
        assert!(ground.sink().records[0].contains_key("battery"));
    }

    #[test]
    fn test_timeouts_checked_under_traffic() {
        let mut ground = GroundStation::new(
            Canned {
                frames: VecDeque::from(vec![br#"{"pid":10,"bat":{}}"#.to_vec()]),
            },
            Reassembler::new(ReassemblyConfig {
                timeout: Duration::from_millis(20),
                ..ReassemblyConfig::default()
            }),
            KeyMap::v1().unwrap(),
            MemorySink::default(),
        )
        .with_tick_interval(Duration::ZERO);

        assert!(ground.service());
        assert_eq!(ground.stats().superseded, 0);

        thread::sleep(Duration::from_millis(30));
        // the link never goes quiet
        for _ in 0..3 {
            ground.transport_mut().frames.push_back(br#"{"pid":10,"tmp":{}}"#.to_vec());
            assert!(ground.service());
        }

        assert_eq!(ground.stats().superseded, 1);
        assert_eq!(ground.reassembler().state(10), PidState::Superseded);
    }

    #[test]
    fn test_persist_failure_is_absorbed() {
        let frames = VecDeque::from(vec![
            br#"{"pid":5,"bat":{},"tmp":{},"alt":1,"hum":2,"acc":{},"gyr":{}}"#.to_vec(),
        ]);
        let mut ground = GroundStation::new(
            Canned { frames },
            Reassembler::new(ReassemblyConfig::default()),
            KeyMap::v1().unwrap(),
            MemorySink {
                fail: true,
                ..MemorySink::default()
            },
        );

        ground.poll_once();
        ground.finish();

        assert_eq!(ground.stats().completed, 1);
        assert_eq!(ground.stats().persist_failures, 1);
        assert_eq!(ground.stats().persisted, 0);
    }
}
