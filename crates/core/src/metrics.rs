//! Counters for one run of the link, and their summary.
//!
//! Each stage keeps its own small stats struct ([`SendReport`],
//! [`StationStats`], [`ReassemblerStats`], [`LinkStats`]); `Metrics` folds
//! them into one place for the end-of-run report.
//!
//! # Thread Safety
//!
//! `Metrics` is NOT thread-safe. In the station's reader/processor split,
//! only the processing thread owns it.

use crate::network::LinkStats;
use crate::pipeline::{SendReport, StationStats};
use crate::reassembly::ReassemblerStats;
use std::time::{Duration, Instant};

/// Pipeline-wide counters.
#[derive(Debug, Clone)]
pub struct Metrics {
    // === Timing ===
    pub start_time: Instant,
    pub end_time: Option<Instant>,

    // === Can side ===
    /// Sensor cycles run
    pub records_collected: u64,
    /// Records handed to the sender
    pub records_transmitted: u64,
    /// Failed sensor reads
    pub sensor_failures: u64,
    pub fragments_generated: u64,
    pub fragments_sent: u64,
    pub transmit_failures: u64,
    /// Frame bytes that left the radio
    pub bytes_sent: u64,

    // === Link ===
    pub frames_dropped: u64,
    pub frames_duplicated: u64,
    pub frames_corrupted: u64,

    // === Ground side ===
    pub frames_received: u64,
    pub receive_errors: u64,
    pub frames_malformed: u64,
    /// Fragments for pids already resolved
    pub late_fragments: u64,
    pub records_completed: u64,
    pub records_superseded: u64,
    pub records_persisted: u64,
    pub persist_failures: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            end_time: None,
            records_collected: 0,
            records_transmitted: 0,
            sensor_failures: 0,
            fragments_generated: 0,
            fragments_sent: 0,
            transmit_failures: 0,
            bytes_sent: 0,
            frames_dropped: 0,
            frames_duplicated: 0,
            frames_corrupted: 0,
            frames_received: 0,
            receive_errors: 0,
            frames_malformed: 0,
            late_fragments: 0,
            records_completed: 0,
            records_superseded: 0,
            records_persisted: 0,
            persist_failures: 0,
        }
    }

    /// Mark the run as finished.
    pub fn complete(&mut self) {
        self.end_time = Some(Instant::now());
    }

    /// Total duration (or elapsed so far if still running).
    pub fn duration(&self) -> Duration {
        match self.end_time {
            Some(end) => end.duration_since(self.start_time),
            None => self.start_time.elapsed(),
        }
    }

    /// Count one sender call.
    pub fn record_send(&mut self, report: &SendReport) {
        self.records_transmitted += 1;
        self.fragments_generated += report.fragments as u64;
        self.fragments_sent += report.transmitted as u64;
        self.transmit_failures += report.failed as u64;
        self.bytes_sent += report.bytes as u64;
    }

    /// Take the station's and reassembler's totals.
    ///
    /// Both are cumulative, so this overwrites rather than adds.
    pub fn absorb_station(&mut self, station: StationStats, reassembler: ReassemblerStats) {
        self.frames_received = station.frames;
        self.receive_errors = station.receive_errors;
        self.frames_malformed = station.malformed;
        self.records_completed = station.completed;
        self.records_superseded = station.superseded;
        self.records_persisted = station.persisted;
        self.persist_failures = station.persist_failures;
        self.late_fragments = reassembler.late_ignored;
    }

    /// Take the simulated link's totals.
    pub fn absorb_link(&mut self, link: LinkStats) {
        self.frames_dropped = link.frames_dropped;
        self.frames_duplicated = link.frames_duplicated;
        self.frames_corrupted = link.frames_corrupted;
    }

    /// Completed records per transmitted record.
    pub fn completion_rate(&self) -> f64 {
        if self.records_transmitted == 0 {
            0.0
        } else {
            self.records_completed as f64 / self.records_transmitted as f64
        }
    }

    /// Malformed frames per received frame.
    pub fn malformed_rate(&self) -> f64 {
        if self.frames_received == 0 {
            0.0
        } else {
            self.frames_malformed as f64 / self.frames_received as f64
        }
    }

    /// Frames lost on the link per frame sent.
    pub fn loss_rate(&self) -> f64 {
        if self.fragments_sent == 0 {
            0.0
        } else {
            self.frames_dropped as f64 / self.fragments_sent as f64
        }
    }

    /// Radio bytes per second of run time.
    pub fn throughput_bps(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.bytes_sent as f64 / secs
        }
    }

    /// True when everything transmitted made it to disk.
    pub fn is_clean(&self) -> bool {
        self.records_transmitted > 0
            && self.records_persisted == self.records_transmitted
            && self.persist_failures == 0
    }

    /// Print a human-readable summary to stdout.
    pub fn print_summary(&self) {
        println!("\n=== Link Summary ===");
        println!("Duration: {} ms", self.duration().as_millis());
        println!();

        println!("=== Can ===");
        println!("Cycles: {}", self.records_collected);
        println!("Sensor failures: {}", self.sensor_failures);
        println!("Records transmitted: {}", self.records_transmitted);
        println!(
            "Fragments: {} generated, {} sent, {} failed",
            self.fragments_generated, self.fragments_sent, self.transmit_failures
        );
        println!("Bytes on air: {}", self.bytes_sent);
        println!();

        println!("=== Link ===");
        println!("Dropped: {} ({:.2}%)", self.frames_dropped, self.loss_rate() * 100.0);
        println!("Duplicated: {}", self.frames_duplicated);
        println!("Truncated: {}", self.frames_corrupted);
        println!();

        println!("=== Ground ===");
        println!("Frames received: {}", self.frames_received);
        println!(
            "Malformed: {} ({:.2}%)",
            self.frames_malformed,
            self.malformed_rate() * 100.0
        );
        println!("Receive errors: {}", self.receive_errors);
        println!("Late fragments: {}", self.late_fragments);
        println!(
            "Records completed: {} ({:.1}%)",
            self.records_completed,
            self.completion_rate() * 100.0
        );
        println!("Records superseded: {}", self.records_superseded);
        println!("Records persisted: {}", self.records_persisted);
        println!("Persist failures: {}", self.persist_failures);
        println!();

        println!("=== Performance ===");
        println!("Throughput: {:.1} B/s", self.throughput_bps());
        println!();
    }

    /// Print just the verdict.
    pub fn print_result(&self) {
        if self.is_clean() {
            println!("✓ All {} records stored", self.records_persisted);
        } else {
            println!(
                "✗ {} of {} records stored ({} superseded, {} persist failures)",
                self.records_persisted,
                self.records_transmitted,
                self.records_superseded,
                self.persist_failures
            );
        }
    }

    /// Export metrics as `key=value` lines.
    pub fn export_text(&self) -> String {
        format!(
            "duration_ms={}\n\
             records_collected={}\n\
             records_transmitted={}\n\
             sensor_failures={}\n\
             fragments_generated={}\n\
             fragments_sent={}\n\
             transmit_failures={}\n\
             frames_dropped={}\n\
             loss_rate={:.4}\n\
             frames_received={}\n\
             frames_malformed={}\n\
             late_fragments={}\n\
             records_completed={}\n\
             records_superseded={}\n\
             records_persisted={}\n\
             persist_failures={}\n\
             completion_rate={:.4}\n",
            self.duration().as_millis(),
            self.records_collected,
            self.records_transmitted,
            self.sensor_failures,
            self.fragments_generated,
            self.fragments_sent,
            self.transmit_failures,
            self.frames_dropped,
            self.loss_rate(),
            self.frames_received,
            self.frames_malformed,
            self.late_fragments,
            self.records_completed,
            self.records_superseded,
            self.records_persisted,
            self.persist_failures,
            self.completion_rate(),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert!(metrics.end_time.is_none());
        assert_eq!(metrics.completion_rate(), 0.0);
        assert!(!metrics.is_clean());
    }

    #[test]
    fn test_record_send_accumulates() {
        let mut metrics = Metrics::new();
        let report = SendReport {
            pid: 1,
            fragments: 4,
            transmitted: 3,
            failed: 1,
            bytes: 300,
        };

        metrics.record_send(&report);
        metrics.record_send(&report);

        assert_eq!(metrics.records_transmitted, 2);
        assert_eq!(metrics.fragments_generated, 8);
        assert_eq!(metrics.fragments_sent, 6);
        assert_eq!(metrics.transmit_failures, 2);
        assert_eq!(metrics.bytes_sent, 600);
    }

    #[test]
    fn test_absorb_station_overwrites() {
        let mut metrics = Metrics::new();
        metrics.records_transmitted = 4;

        let station = StationStats {
            frames: 16,
            malformed: 4,
            completed: 2,
            persisted: 2,
            ..StationStats::default()
        };
        let reassembler = ReassemblerStats {
            late_ignored: 3,
            ..ReassemblerStats::default()
        };
        metrics.absorb_station(station, reassembler);
        metrics.absorb_station(station, reassembler);

        assert_eq!(metrics.frames_received, 16);
        assert_eq!(metrics.late_fragments, 3);
        assert_eq!(metrics.completion_rate(), 0.5);
        assert_eq!(metrics.malformed_rate(), 0.25);
        assert!(!metrics.is_clean());
    }

    #[test]
    fn test_export_text() {
        let mut metrics = Metrics::new();
        metrics.records_transmitted = 10;
        metrics.records_persisted = 10;
        metrics.frames_malformed = 1;
        metrics.complete();

        let text = metrics.export_text();
        assert!(text.contains("records_transmitted=10"));
        assert!(text.contains("records_persisted=10"));
        assert!(text.contains("frames_malformed=1"));
        assert!(metrics.is_clean());
    }
}
