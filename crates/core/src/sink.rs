//! Durable storage for completed records.
//!
//! Two stores, both under a timestamped session directory:
//! - [`JsonLinesSink`]: append-only, one canonical JSON record per line,
//!   rolling over to a new numbered file at a size or record ceiling
//! - [`JsonMapSink`]: one JSON object keyed by decimal pid, rewritten
//!   atomically on every change
//!
//! # Idempotency
//!
//! The same record content may arrive more than once (a re-sent cycle, a
//! replayed log). `JsonLinesSink` keeps the SHA-256 digest of every stored
//! record, rebuilt from disk on open, and skips repeats. `JsonMapSink` is
//! keyed by pid and merges, so repeats leave the file unchanged.

use crate::error::{Result, SinkError};
use crate::value::{merge_into, TelemetryRecord};
use chrono::{DateTime, TimeZone};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Where completed records go.
pub trait Sink {
    /// Persist one record. Storing identical content twice is a no-op.
    fn append(&mut self, record: &TelemetryRecord) -> Result<()>;
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn append(&mut self, record: &TelemetryRecord) -> Result<()> {
        (**self).append(record)
    }
}

/// Create `{root}/{YYYYmmddTHHMMSS}_log` and return its path.
pub fn session_dir<Tz>(root: &Path, now: &DateTime<Tz>) -> Result<PathBuf>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let dir = root.join(format!("{}_log", now.format("%Y%m%dT%H%M%S")));
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// When a log file is closed and the next one started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloverPolicy {
    pub max_bytes: u64,
    pub max_records: usize,
}

impl Default for RolloverPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 5 * 1024 * 1024,
            max_records: 500,
        }
    }
}

/// Counters for a lines sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub appended: u64,
    pub duplicates: u64,
    pub files: u32,
}

/// Append-only JSON lines store with rollover.
pub struct JsonLinesSink {
    dir: PathBuf,
    base: String,
    policy: RolloverPolicy,
    index: u32,
    file: File,
    bytes: u64,
    records: usize,
    seen: HashSet<String>,
    stats: SinkStats,
}

impl JsonLinesSink {
    /// Open (or continue) the store `{dir}/{base}.jsonl`.
    ///
    /// Existing files of the series are scanned so repeats across restarts
    /// are still skipped, and appending resumes in the newest file.
    pub fn open(dir: impl Into<PathBuf>, base: &str, policy: RolloverPolicy) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut seen = HashSet::new();
        let mut index = 0;
        let mut last = Scan::default();
        while Self::path_in(&dir, base, index).exists() {
            last = scan(&Self::path_in(&dir, base, index), &mut seen)?;
            if !Self::path_in(&dir, base, index + 1).exists() {
                break;
            }
            index += 1;
        }

        let path = Self::path_in(&dir, base, index);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if !last.terminated {
            file.write_all(b"\n")?;
        }
        let bytes = file.metadata()?.len();
        let records = last.records;
        info!(path = %path.display(), known = seen.len(), "opened record log");

        Ok(Self {
            dir,
            base: base.to_string(),
            policy,
            index,
            file,
            bytes,
            records,
            seen,
            stats: SinkStats {
                files: index + 1,
                ..SinkStats::default()
            },
        })
    }

    pub fn current_path(&self) -> PathBuf {
        Self::path_in(&self.dir, &self.base, self.index)
    }

    pub fn stats(&self) -> SinkStats {
        self.stats
    }

    fn path_in(dir: &Path, base: &str, index: u32) -> PathBuf {
        if index == 0 {
            dir.join(format!("{base}.jsonl"))
        } else {
            dir.join(format!("{base}_{index:03}.jsonl"))
        }
    }

    /// Drop bytes past the last complete line, left by a write that failed
    /// partway.
    fn repair_tail(&mut self) -> Result<()> {
        let on_disk = self.file.metadata()?.len();
        if on_disk > self.bytes {
            warn!(path = %self.current_path().display(), stray = on_disk - self.bytes, "cutting partial line");
            self.file.set_len(self.bytes)?;
        }
        Ok(())
    }

    fn roll_over(&mut self) -> Result<()> {
        self.index += 1;
        let path = self.current_path();
        self.file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.bytes = self.file.metadata()?.len();
        self.records = 0;
        self.stats.files += 1;
        info!(path = %path.display(), "rolled over record log");
        Ok(())
    }
}

impl Sink for JsonLinesSink {
    fn append(&mut self, record: &TelemetryRecord) -> Result<()> {
        let digest = record.digest()?;
        if self.seen.contains(&digest) {
            self.stats.duplicates += 1;
            debug!(pid = ?record.pid(), "record already stored");
            return Ok(());
        }

        if self.bytes >= self.policy.max_bytes || self.records >= self.policy.max_records {
            self.roll_over()?;
        }

        self.repair_tail()?;

        let mut line = record.to_json()?;
        line.push('\n');
        if let Err(e) = self.file.write_all(line.as_bytes()).and_then(|()| self.file.flush()) {
            if let Err(cut) = self.file.set_len(self.bytes) {
                warn!(path = %self.current_path().display(), error = %cut, "could not cut back partial line");
            }
            return Err(e.into());
        }

        self.bytes += line.len() as u64;
        self.records += 1;
        self.seen.insert(digest);
        self.stats.appended += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Scan {
    records: usize,
    /// File is empty or ends in a newline
    terminated: bool,
}

impl Default for Scan {
    fn default() -> Self {
        Self {
            records: 0,
            terminated: true,
        }
    }
}

/// Record the digests of one lines file.
fn scan(path: &Path, seen: &mut HashSet<String>) -> Result<Scan> {
    let bytes = fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);
    let mut records = 0;

    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match TelemetryRecord::from_json(line) {
            Ok(record) => {
                seen.insert(record.digest()?);
                records += 1;
            }
            // usually a line cut short by power loss
            Err(e) => warn!(path = %path.display(), line = number + 1, error = %e, "skipping unreadable line"),
        }
    }

    Ok(Scan {
        records,
        terminated: text.is_empty() || text.ends_with('\n'),
    })
}

/// Single JSON object keyed by pid, updated in place.
pub struct JsonMapSink {
    path: PathBuf,
    records: BTreeMap<String, TelemetryRecord>,
}

impl JsonMapSink {
    /// Load `path` if it exists, otherwise start empty.
    ///
    /// # Errors
    /// `SinkError::Corrupted` if the file is not a JSON object of records.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let records = if path.exists() {
            let text = fs::read_to_string(&path)?;
            if text.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&text).map_err(|e| SinkError::Corrupted {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, pid: u64) -> Option<&TelemetryRecord> {
        self.records.get(&pid.to_string())
    }

    fn write_atomic(&self) -> Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = File::create(&tmp)?;
        serde_json::to_writer_pretty(&mut file, &self.records)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Sink for JsonMapSink {
    /// Merge `record` into its pid entry and rewrite the file.
    ///
    /// The in-memory map only changes once the file is written, so a failed
    /// append can be retried.
    fn append(&mut self, record: &TelemetryRecord) -> Result<()> {
        let pid = record.pid().ok_or(SinkError::MissingPid)?;
        let key = pid.to_string();

        let mut merged = self.records.get(&key).cloned().unwrap_or_default();
        merge_into(&mut merged, record);
        if self.records.get(&key) == Some(&merged) {
            debug!(pid, "record unchanged");
            return Ok(());
        }

        let previous = self.records.insert(key.clone(), merged);
        if let Err(e) = self.write_atomic() {
            match previous {
                Some(previous) => self.records.insert(key, previous),
                None => self.records.remove(&key),
            };
            return Err(e);
        }
        Ok(())
    }
}
