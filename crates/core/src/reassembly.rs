//! Fragment reassembly with bounded memory.
//!
//! The reassembler merges incoming fragments into per-pid partial records
//! and decides when a record is finished. The wire format carries no
//! fragment index or total, so completion is inferred.
//!
//! # States per pid
//!
//! ```text
//!            fragment             trigger + required keys present
//!   ABSENT ----------> PARTIAL ----------------------------------> COMPLETE
//!                         |
//!                         | window full / budget spent / timed out
//!                         v
//!                     SUPERSEDED
//! ```
//!
//! # Triggers
//!
//! A pid's completeness is evaluated when:
//! - its fragment count reaches `expected_fragments`
//! - a fragment for a different pid arrives (the previously current pid is
//!   evaluated)
//! - it times out, or the stream is flushed
//!
//! A pid that fails the check on a count or pid-change trigger stays
//! PARTIAL. Only the explicit supersede policy removes it.
//!
//! # Memory Bounds
//!
//! At most `max_pending` partial records are held. Opening a new pid on a
//! full window supersedes the entry that has been pending longest. Resolved
//! pids (complete or superseded) are remembered up to `completed_memory`
//! so that late and duplicate fragments do not reopen them.
//!
//! # Thread Safety
//!
//! This structure is NOT thread-safe. Feed it from a single thread; the
//! ground station funnels frames through one channel for that reason.

use crate::error::Error;
use crate::framing::decode_frame;
use crate::packet::Fragment;
use crate::value::{merge_into, TelemetryRecord};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Tuning for the reassembler.
#[derive(Debug, Clone)]
pub struct ReassemblyConfig {
    /// Fragments per record on the sender side
    pub expected_fragments: usize,

    /// Top-level wire keys a record needs before it is complete
    pub required_keys: Vec<String>,

    /// Maximum partial records held at once
    pub max_pending: usize,

    /// Fragments accepted for one pid before it is abandoned
    pub fragment_budget: usize,

    /// Age after which a partial record is abandoned
    pub timeout: Duration,

    /// Resolved pids remembered to reject late fragments
    pub completed_memory: usize,
}

impl ReassemblyConfig {
    /// Required keys for the standard partition.
    ///
    /// `gps` is not listed: it rides in the same fragment as `bat` and is a
    /// null sentinel whenever there is no fix.
    pub fn standard_required_keys() -> Vec<String> {
        ["bat", "tmp", "alt", "hum", "acc", "gyr"]
            .iter()
            .map(|k| k.to_string())
            .collect()
    }
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            expected_fragments: 4,
            required_keys: Self::standard_required_keys(),
            max_pending: 4,
            fragment_budget: 8,
            timeout: Duration::from_secs(30),
            completed_memory: 64,
        }
    }
}

/// A fully reassembled record, still in wire keys.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedRecord {
    pub pid: u64,

    /// Merged fields, including `pid`
    pub record: TelemetryRecord,

    /// Fragments merged into it, duplicates included
    pub fragments: usize,

    pub completed_at: DateTime<Utc>,
}

/// Why a partial record was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupersedeReason {
    WindowFull,
    BudgetExhausted,
    TimedOut,
    Flushed,
}

impl fmt::Display for SupersedeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SupersedeReason::WindowFull => "window full",
            SupersedeReason::BudgetExhausted => "fragment budget exhausted",
            SupersedeReason::TimedOut => "timed out",
            SupersedeReason::Flushed => "flushed",
        };
        f.write_str(text)
    }
}

/// Outcome of feeding the reassembler.
#[derive(Debug)]
pub enum Event {
    Completed(CompletedRecord),
    Superseded {
        pid: u64,
        fragments: usize,
        missing: Vec<String>,
        reason: SupersedeReason,
    },
    Malformed {
        error: Error,
    },
}

/// Lifecycle state of one pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidState {
    Absent,
    Partial { fragments: usize },
    Complete,
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    CountReached,
    PidChanged,
    TimedOut,
    Flushed,
}

#[derive(Debug)]
struct PartialRecord {
    record: TelemetryRecord,
    fragments: usize,
    first_seen: Instant,
}

impl PartialRecord {
    fn new(pid: u64) -> Self {
        Self {
            record: TelemetryRecord::with_pid(pid),
            fragments: 0,
            first_seen: Instant::now(),
        }
    }

    fn merge(&mut self, body: &TelemetryRecord) {
        merge_into(&mut self.record, body);
        self.fragments += 1;
    }

    fn missing(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|key| !self.record.contains_key(key))
            .cloned()
            .collect()
    }

    fn is_timed_out(&self, timeout: Duration) -> bool {
        self.first_seen.elapsed() >= timeout
    }
}

/// Reassembler for collecting fragments back into telemetry records.
pub struct Reassembler {
    config: ReassemblyConfig,

    /// Partial records indexed by pid
    pending: HashMap<u64, PartialRecord>,

    /// Pid of the most recent fragment
    last_pid: Option<u64>,

    /// Recently resolved pids, oldest first
    resolved: HashMap<u64, PidState>,
    resolved_order: VecDeque<u64>,

    stats: ReassemblerStats,
}

impl Reassembler {
    pub fn new(config: ReassemblyConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            last_pid: None,
            resolved: HashMap::new(),
            resolved_order: VecDeque::new(),
            stats: ReassemblerStats::default(),
        }
    }

    pub fn config(&self) -> &ReassemblyConfig {
        &self.config
    }

    /// Decode a raw frame and insert it.
    ///
    /// A frame that does not decode yields a single `Malformed` event and a
    /// warning; no buffered pid is touched.
    pub fn insert_frame(&mut self, bytes: &[u8]) -> Vec<Event> {
        match decode_frame(bytes) {
            Ok(fragment) => self.insert_fragment(fragment),
            Err(error) => {
                self.stats.malformed += 1;
                warn!(error = %error, len = bytes.len(), "dropping malformed frame");
                vec![Event::Malformed { error }]
            }
        }
    }

    /// Merge one fragment and report anything it resolved.
    pub fn insert_fragment(&mut self, fragment: Fragment) -> Vec<Event> {
        let pid = fragment.pid;
        let mut events = Vec::new();

        if self.resolved.contains_key(&pid) {
            self.stats.late_ignored += 1;
            debug!(pid, "ignoring fragment for resolved pid");
            return events;
        }

        if let Some(previous) = self.last_pid.filter(|&p| p != pid) {
            events.extend(self.evaluate(previous, Trigger::PidChanged));
        }
        self.last_pid = Some(pid);

        if !self.pending.contains_key(&pid) {
            while self.pending.len() >= self.config.max_pending.max(1) {
                let Some(oldest) = self.oldest_pending() else {
                    break;
                };
                events.extend(self.supersede(oldest, SupersedeReason::WindowFull));
            }
        }

        let partial = self
            .pending
            .entry(pid)
            .or_insert_with(|| PartialRecord::new(pid));
        partial.merge(&fragment.body);
        self.stats.fragments += 1;
        let fragments = partial.fragments;
        debug!(pid, fragments, "fragment merged");

        if fragments >= self.config.expected_fragments {
            events.extend(self.evaluate(pid, Trigger::CountReached));
        } else if fragments >= self.config.fragment_budget {
            events.extend(self.supersede(pid, SupersedeReason::BudgetExhausted));
        }

        events
    }

    /// Resolve every partial record older than the timeout.
    ///
    /// Call this periodically. A timed-out record that already has every
    /// required key is completed rather than dropped.
    pub fn check_timeouts(&mut self) -> Vec<Event> {
        let mut timed_out: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, partial)| partial.is_timed_out(self.config.timeout))
            .map(|(pid, _)| *pid)
            .collect();
        timed_out.sort_unstable();

        timed_out
            .into_iter()
            .filter_map(|pid| self.evaluate(pid, Trigger::TimedOut))
            .collect()
    }

    /// Resolve everything still pending, lowest pid first.
    pub fn flush(&mut self) -> Vec<Event> {
        let mut pids: Vec<u64> = self.pending.keys().copied().collect();
        pids.sort_unstable();

        pids.into_iter()
            .filter_map(|pid| self.evaluate(pid, Trigger::Flushed))
            .collect()
    }

    /// Where `pid` currently stands.
    pub fn state(&self, pid: u64) -> PidState {
        if let Some(partial) = self.pending.get(&pid) {
            return PidState::Partial {
                fragments: partial.fragments,
            };
        }
        self.resolved.get(&pid).copied().unwrap_or(PidState::Absent)
    }

    /// Merged fields buffered so far for `pid`.
    pub fn partial(&self, pid: u64) -> Option<&TelemetryRecord> {
        self.pending.get(&pid).map(|p| &p.record)
    }

    pub fn stats(&self) -> ReassemblerStats {
        ReassemblerStats {
            pending: self.pending.len(),
            last_pid: self.last_pid,
            ..self.stats
        }
    }

    /// True when no partial record is buffered.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    fn evaluate(&mut self, pid: u64, trigger: Trigger) -> Option<Event> {
        let partial = self.pending.get(&pid)?;
        let missing = partial.missing(&self.config.required_keys);
        let fragments = partial.fragments;

        if missing.is_empty() {
            let partial = self.pending.remove(&pid)?;
            self.resolve(pid, PidState::Complete);
            self.stats.completed += 1;
            info!(pid, fragments = partial.fragments, trigger = ?trigger, "record complete");

            return Some(Event::Completed(CompletedRecord {
                pid,
                record: partial.record,
                fragments: partial.fragments,
                completed_at: Utc::now(),
            }));
        }

        match trigger {
            Trigger::TimedOut => self.supersede(pid, SupersedeReason::TimedOut),
            Trigger::Flushed => self.supersede(pid, SupersedeReason::Flushed),
            _ if fragments >= self.config.fragment_budget => {
                self.supersede(pid, SupersedeReason::BudgetExhausted)
            }
            _ => {
                debug!(
                    pid,
                    fragments,
                    missing = ?missing,
                    "incomplete, awaiting more data"
                );
                None
            }
        }
    }

    fn supersede(&mut self, pid: u64, reason: SupersedeReason) -> Option<Event> {
        let partial = self.pending.remove(&pid)?;
        let missing = partial.missing(&self.config.required_keys);
        self.resolve(pid, PidState::Superseded);
        self.stats.superseded += 1;
        warn!(
            pid,
            fragments = partial.fragments,
            missing = ?missing,
            reason = %reason,
            "abandoning partial record"
        );

        Some(Event::Superseded {
            pid,
            fragments: partial.fragments,
            missing,
            reason,
        })
    }

    fn resolve(&mut self, pid: u64, state: PidState) {
        if self.config.completed_memory == 0 {
            return;
        }
        while self.resolved_order.len() >= self.config.completed_memory {
            if let Some(forgotten) = self.resolved_order.pop_front() {
                self.resolved.remove(&forgotten);
            }
        }
        self.resolved.insert(pid, state);
        self.resolved_order.push_back(pid);
    }

    fn oldest_pending(&self) -> Option<u64> {
        self.pending
            .iter()
            .min_by_key(|(pid, partial)| (partial.first_seen, **pid))
            .map(|(pid, _)| *pid)
    }
}

/// Counters describing reassembler activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblerStats {
    /// Partial records currently buffered
    pub pending: usize,

    /// Pid of the most recent fragment
    pub last_pid: Option<u64>,

    /// Fragments merged
    pub fragments: u64,

    pub completed: u64,
    pub superseded: u64,
    pub malformed: u64,

    /// Fragments dropped because their pid was already resolved
    pub late_ignored: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use serde_json::json;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing::Level;
    use tracing_subscriber::fmt::MakeWriter;

    fn fragment(value: serde_json::Value) -> Fragment {
        Fragment::from_record(TelemetryRecord::from_json_value(value).unwrap()).unwrap()
    }

    fn config() -> ReassemblyConfig {
        ReassemblyConfig {
            timeout: Duration::from_secs(60),
            ..ReassemblyConfig::default()
        }
    }

    fn full_set(pid: u64) -> Vec<Fragment> {
        vec![
            fragment(json!({"pid": pid, "type": "TLM", "bat": {"volt": 3.8}, "gps": null})),
            fragment(json!({"pid": pid, "prs": "N/A", "tmp": {"b28": 21.3}})),
            fragment(json!({"pid": pid, "alt": 12.0, "hum": 55})),
            fragment(json!({"pid": pid, "acc": {"x": 0.1}, "gyr": {"x": 0}})),
        ]
    }

    fn completed(events: &[Event]) -> Vec<&CompletedRecord> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Completed(record) => Some(record),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_out_of_order_fragments_complete() {
        let mut reassembler = Reassembler::new(config());
        let fragments = full_set(1);

        for index in [2, 0, 3] {
            assert!(reassembler.insert_fragment(fragments[index].clone()).is_empty());
        }
        let events = reassembler.insert_fragment(fragments[1].clone());

        let done = completed(&events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].pid, 1);
        assert_eq!(done[0].fragments, 4);
        for key in ["bat", "gps", "tmp", "prs", "alt", "hum", "acc", "gyr", "type", "pid"] {
            assert!(done[0].record.contains_key(key), "missing {key}");
        }
        assert_eq!(reassembler.state(1), PidState::Complete);
        assert!(reassembler.is_idle());
    }

    #[test]
    fn test_pid_change_completes_previous() {
        let mut reassembler = Reassembler::new(config());

        reassembler.insert_fragment(fragment(json!({"pid": 5, "bat": {"V": 3.7}})));
        reassembler.insert_fragment(fragment(json!({"pid": 5, "tmp": {"b28": 20.0}})));
        let events = reassembler.insert_fragment(fragment(json!({
            "pid": 5, "alt": 3.0, "hum": 40, "acc": {}, "gyr": {}
        })));
        assert!(events.is_empty());
        assert_eq!(reassembler.state(5), PidState::Partial { fragments: 3 });

        let events = reassembler.insert_fragment(fragment(json!({"pid": 6, "bat": null})));

        let done = completed(&events);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].pid, 5);
        assert_eq!(reassembler.state(5), PidState::Complete);
        assert_eq!(reassembler.state(6), PidState::Partial { fragments: 1 });
    }

    #[test]
    fn test_incomplete_stays_partial() {
        let mut reassembler = Reassembler::new(config());
        let fragments = full_set(7);

        assert!(reassembler.insert_fragment(fragments[0].clone()).is_empty());
        assert!(reassembler.insert_fragment(fragments[1].clone()).is_empty());
        assert_eq!(reassembler.state(7), PidState::Partial { fragments: 2 });

        // a newer pid evaluates 7 but does not drop it
        assert!(reassembler.insert_fragment(full_set(8)[0].clone()).is_empty());
        assert_eq!(reassembler.state(7), PidState::Partial { fragments: 2 });

        // so its remaining fragments can still finish it
        reassembler.insert_fragment(fragments[2].clone());
        let events = reassembler.insert_fragment(fragments[3].clone());
        assert_eq!(completed(&events)[0].pid, 7);
    }

    #[test]
    fn test_duplicate_fragment_is_idempotent() {
        let mut reassembler = Reassembler::new(config());
        let fragments = full_set(2);

        reassembler.insert_fragment(fragments[0].clone());
        let once = reassembler.partial(2).cloned().unwrap();
        reassembler.insert_fragment(fragments[0].clone());
        assert_eq!(reassembler.partial(2), Some(&once));

        reassembler.insert_fragment(fragments[1].clone());
        reassembler.insert_fragment(fragments[2].clone());
        let events = reassembler.insert_fragment(fragments[3].clone());
        assert_eq!(completed(&events)[0].fragments, 5);
    }

    #[test]
    fn test_late_fragment_ignored() {
        let mut reassembler = Reassembler::new(config());
        for f in full_set(3) {
            reassembler.insert_fragment(f);
        }

        let events = reassembler.insert_fragment(full_set(3)[2].clone());

        assert!(events.is_empty());
        assert_eq!(reassembler.stats().completed, 1);
        assert_eq!(reassembler.stats().late_ignored, 1);
        assert!(reassembler.is_idle());
    }

    #[test]
    fn test_overlapping_keys_last_write_wins() {
        let mut reassembler = Reassembler::new(config());
        reassembler.insert_fragment(fragment(json!({"pid": 4, "tmp": {"b28": 1.0, "mcp": 2.0}})));
        reassembler.insert_fragment(fragment(json!({"pid": 4, "tmp": {"b28": 9.0}})));

        let record = reassembler.partial(4).unwrap();
        assert_eq!(record.get_path(&["tmp", "b28"]), Some(&Value::Float(9.0)));
        assert_eq!(record.get_path(&["tmp", "mcp"]), Some(&Value::Float(2.0)));
    }

    #[test]
    fn test_window_full_supersedes_oldest() {
        let mut reassembler = Reassembler::new(ReassemblyConfig {
            max_pending: 2,
            ..config()
        });

        reassembler.insert_fragment(full_set(10)[0].clone());
        reassembler.insert_fragment(full_set(11)[0].clone());
        let events = reassembler.insert_fragment(full_set(12)[0].clone());

        assert!(matches!(
            events.as_slice(),
            [Event::Superseded { pid: 10, fragments: 1, reason: SupersedeReason::WindowFull, .. }]
        ));
        assert_eq!(reassembler.state(10), PidState::Superseded);
        assert_eq!(reassembler.stats().pending, 2);

        // abandoned pids stay abandoned
        assert!(reassembler.insert_fragment(full_set(10)[1].clone()).is_empty());
        assert_eq!(reassembler.state(10), PidState::Superseded);
    }

    #[test]
    fn test_fragment_budget_exhausted() {
        let mut reassembler = Reassembler::new(ReassemblyConfig {
            fragment_budget: 5,
            ..config()
        });
        let only_battery = full_set(20)[0].clone();

        for _ in 0..4 {
            assert!(reassembler.insert_fragment(only_battery.clone()).is_empty());
        }
        let events = reassembler.insert_fragment(only_battery);

        match events.as_slice() {
            [Event::Superseded { pid, fragments, missing, reason }] => {
                assert_eq!(*pid, 20);
                assert_eq!(*fragments, 5);
                assert_eq!(*reason, SupersedeReason::BudgetExhausted);
                assert!(missing.contains(&"alt".to_string()));
            }
            other => panic!("expected supersede, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout() {
        let mut reassembler = Reassembler::new(ReassemblyConfig {
            timeout: Duration::from_millis(50),
            ..config()
        });
        let fragments = full_set(30);
        reassembler.insert_fragment(fragments[0].clone());

        assert!(reassembler.check_timeouts().is_empty());
        std::thread::sleep(Duration::from_millis(60));

        let events = reassembler.check_timeouts();
        assert!(matches!(
            events.as_slice(),
            [Event::Superseded { pid: 30, reason: SupersedeReason::TimedOut, .. }]
        ));
        assert!(reassembler.is_idle());
    }

    #[test]
    fn test_timeout_completes_when_required_present() {
        let mut reassembler = Reassembler::new(ReassemblyConfig {
            timeout: Duration::from_millis(20),
            ..config()
        });
        reassembler.insert_fragment(fragment(json!({
            "pid": 31, "bat": 1, "tmp": 1, "alt": 1, "hum": 1, "acc": 1, "gyr": 1
        })));

        std::thread::sleep(Duration::from_millis(30));

        let events = reassembler.check_timeouts();
        assert_eq!(completed(&events)[0].pid, 31);
    }

    #[test]
    fn test_malformed_frame_isolated() {
        let mut reassembler = Reassembler::new(config());
        reassembler.insert_fragment(full_set(40)[0].clone());
        let before = reassembler.partial(40).cloned();

        let events = reassembler.insert_frame(b"{\"pid\":40,\"tmp\":{\"b2");

        assert!(matches!(events.as_slice(), [Event::Malformed { .. }]));
        assert_eq!(reassembler.partial(40).cloned(), before);
        assert_eq!(reassembler.state(40), PidState::Partial { fragments: 1 });
        assert_eq!(reassembler.stats().malformed, 1);
    }

    /// Log sink shared with the subscriber under test.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_malformed_frame_warns_once() {
        let logs = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_max_level(Level::WARN)
            .with_ansi(false)
            .finish();

        let mut reassembler = Reassembler::new(config());
        let events = tracing::subscriber::with_default(subscriber, || {
            reassembler.insert_frame(b"\x00\x01 not a frame")
        });

        assert!(matches!(events.as_slice(), [Event::Malformed { .. }]));
        let text = logs.text();
        let warnings: Vec<&str> = text.lines().filter(|l| l.contains("WARN")).collect();
        assert_eq!(warnings.len(), 1, "{text}");
        assert!(warnings[0].contains("dropping malformed frame"));
    }

    #[test]
    fn test_flush_resolves_everything() {
        let mut reassembler = Reassembler::new(config());
        let fragments = full_set(50);
        for f in &fragments[..3] {
            reassembler.insert_fragment(f.clone());
        }
        reassembler.insert_fragment(fragment(json!({
            "pid": 51, "bat": 1, "tmp": 1, "alt": 1, "hum": 1, "acc": 1, "gyr": 1
        })));

        // pid 51 arriving evaluated 50, which is still missing acc/gyr
        assert_eq!(reassembler.state(50), PidState::Partial { fragments: 3 });

        let events = reassembler.flush();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            Event::Superseded { pid: 50, reason: SupersedeReason::Flushed, .. }
        ));
        assert!(matches!(&events[1], Event::Completed(r) if r.pid == 51));
        assert!(reassembler.is_idle());
    }

    #[test]
    fn test_resolved_memory_is_bounded() {
        let mut reassembler = Reassembler::new(ReassemblyConfig {
            completed_memory: 2,
            ..config()
        });
        for pid in 1..=3 {
            for f in full_set(pid) {
                reassembler.insert_fragment(f);
            }
        }

        assert_eq!(reassembler.state(1), PidState::Absent);
        assert_eq!(reassembler.state(2), PidState::Complete);
        assert_eq!(reassembler.state(3), PidState::Complete);
    }
}
