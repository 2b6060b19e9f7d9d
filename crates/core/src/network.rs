//! Radio transport abstraction and a simulated lossy LoRa link.
//!
//! The core only ever talks to a [`Transport`]: transmit is fire-and-forget
//! and receive is a non-blocking poll. There is no acknowledgement in the
//! protocol; losing a frame is normal and the next telemetry cycle
//! supersedes it.
//!
//! # Simulated Effects
//!
//! - **Latency**: Base delay for all frames
//! - **Jitter**: Random variation in latency (uniform distribution)
//! - **Loss**: Random frame drops (Bernoulli distribution)
//! - **Duplication**: A frame is delivered twice, each copy with its own delay
//! - **Corruption**: A frame arrives truncated, as after a cut UART read
//!
//! Reordering falls out of jitter: frames are held in a min-heap keyed by
//! delivery time.
//!
//! # Determinism
//!
//! All randomness comes from a seeded ChaCha8 RNG. Given the same seed
//! and inputs, the same frames are dropped, duplicated and cut.

use crate::error::{Result, TransportError};
use crate::framing::MAX_LORA_PAYLOAD;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::trace;

/// A half-duplex, best-effort frame link.
pub trait Transport {
    /// Hand one frame to the link. `Ok` means accepted, not delivered.
    fn transmit(&mut self, frame: &[u8]) -> Result<()>;

    /// Next received frame, if one is pending. Never blocks for long.
    fn receive(&mut self) -> Result<Option<Vec<u8>>>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn transmit(&mut self, frame: &[u8]) -> Result<()> {
        (**self).transmit(frame)
    }

    fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        (**self).receive()
    }
}

// Lets the sender and the station share one in-process link.
impl<T: Transport> Transport for Arc<Mutex<T>> {
    fn transmit(&mut self, frame: &[u8]) -> Result<()> {
        self.lock().unwrap_or_else(|e| e.into_inner()).transmit(frame)
    }

    fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        self.lock().unwrap_or_else(|e| e.into_inner()).receive()
    }
}

/// Configuration for the simulated link.
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    /// Base latency in milliseconds
    pub base_latency_ms: u64,

    /// Jitter range in milliseconds (uniform ±jitter)
    pub jitter_ms: u64,

    /// Frame loss probability [0.0, 1.0]
    pub loss_rate: f64,

    /// Probability a delivered frame arrives twice [0.0, 1.0]
    pub duplicate_rate: f64,

    /// Probability a delivered frame is truncated [0.0, 1.0]
    pub corrupt_rate: f64,

    /// Largest frame the link accepts
    pub max_payload: usize,

    /// Random seed for determinism
    pub seed: u64,
}

impl LinkConfig {
    /// A link with no impairments.
    pub fn perfect(seed: u64) -> Self {
        Self {
            base_latency_ms: 0,
            jitter_ms: 0,
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            corrupt_rate: 0.0,
            max_payload: MAX_LORA_PAYLOAD,
            seed,
        }
    }

    /// Moderate impairments, roughly a LoRa link near the edge of range.
    pub fn default_with_seed(seed: u64) -> Self {
        Self {
            base_latency_ms: 40,
            jitter_ms: 20,
            loss_rate: 0.05,
            duplicate_rate: 0.02,
            corrupt_rate: 0.02,
            max_payload: MAX_LORA_PAYLOAD,
            seed,
        }
    }
}

#[derive(Debug, Clone)]
struct ScheduledFrame {
    frame: Vec<u8>,
    delivery_time: Instant,
    seq: u64,
}

impl PartialEq for ScheduledFrame {
    fn eq(&self, other: &Self) -> bool {
        self.delivery_time == other.delivery_time && self.seq == other.seq
    }
}

impl Eq for ScheduledFrame {}

impl PartialOrd for ScheduledFrame {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledFrame {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // min-heap: earliest delivery first, send order on ties
        other
            .delivery_time
            .cmp(&self.delivery_time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// In-process LoRa link with latency, jitter, loss, duplication and
/// truncation.
///
/// # Thread Safety
/// Not thread-safe; wrap in `Arc<Mutex<_>>` to share.
pub struct SimulatedLink {
    config: LinkConfig,
    rng: ChaCha8Rng,
    queue: BinaryHeap<ScheduledFrame>,
    next_seq: u64,

    // Statistics
    frames_sent: u64,
    frames_dropped: u64,
    frames_duplicated: u64,
    frames_corrupted: u64,
    frames_delivered: u64,
}

impl SimulatedLink {
    pub fn new(config: LinkConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);

        Self {
            config,
            rng,
            queue: BinaryHeap::new(),
            next_seq: 0,
            frames_sent: 0,
            frames_dropped: 0,
            frames_duplicated: 0,
            frames_corrupted: 0,
            frames_delivered: 0,
        }
    }

    /// Wrap the link for sharing between a sender and a station.
    pub fn shared(config: LinkConfig) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new(config)))
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Receive a frame, waiting up to the specified duration.
    ///
    /// Busy-waits with short sleeps.
    pub fn recv_wait(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(frame) = self.pop_ready() {
                return Some(frame);
            }

            if Instant::now() >= deadline {
                return None;
            }

            std::thread::sleep(Duration::from_micros(100));
        }
    }

    /// Check if any frames are in flight.
    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Deliver everything still in flight at once, in delivery order.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(scheduled) = self.queue.pop() {
            frames.push(scheduled.frame);
            self.frames_delivered += 1;
        }
        frames
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            frames_sent: self.frames_sent,
            frames_dropped: self.frames_dropped,
            frames_duplicated: self.frames_duplicated,
            frames_corrupted: self.frames_corrupted,
            frames_delivered: self.frames_delivered,
            frames_in_flight: self.queue.len(),
        }
    }

    fn pop_ready(&mut self) -> Option<Vec<u8>> {
        let ready = self
            .queue
            .peek()
            .is_some_and(|scheduled| Instant::now() >= scheduled.delivery_time);
        if !ready {
            return None;
        }

        let scheduled = self.queue.pop()?;
        self.frames_delivered += 1;
        Some(scheduled.frame)
    }

    fn schedule(&mut self, mut frame: Vec<u8>) {
        if self.roll(self.config.corrupt_rate) && frame.len() > 1 {
            let keep = self.rng.gen_range(1..frame.len());
            frame.truncate(keep);
            self.frames_corrupted += 1;
        }

        let delay_ms = self.compute_delay();
        let seq = self.next_seq;
        self.next_seq += 1;

        self.queue.push(ScheduledFrame {
            frame,
            delivery_time: Instant::now() + Duration::from_millis(delay_ms),
            seq,
        });
    }

    fn roll(&mut self, probability: f64) -> bool {
        probability > 0.0 && self.rng.gen::<f64>() < probability
    }

    /// Delay = base_latency ± jitter
    fn compute_delay(&mut self) -> u64 {
        let base = self.config.base_latency_ms;

        if self.config.jitter_ms == 0 {
            return base;
        }

        let jitter_range = self.config.jitter_ms * 2;
        let jitter = self.rng.gen_range(0..=jitter_range);
        let jitter_offset = jitter as i64 - self.config.jitter_ms as i64;

        (base as i64 + jitter_offset).max(0) as u64
    }
}

impl Transport for SimulatedLink {
    fn transmit(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > self.config.max_payload {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                limit: self.config.max_payload,
            }
            .into());
        }

        self.frames_sent += 1;

        if self.roll(self.config.loss_rate) {
            self.frames_dropped += 1;
            trace!(len = frame.len(), "simulated loss");
            return Ok(());
        }

        self.schedule(frame.to_vec());

        if self.roll(self.config.duplicate_rate) {
            self.frames_duplicated += 1;
            self.schedule(frame.to_vec());
        }

        Ok(())
    }

    fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.pop_ready())
    }
}

/// Statistics about simulated link behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkStats {
    /// Frames handed to the link
    pub frames_sent: u64,

    /// Frames lost
    pub frames_dropped: u64,

    /// Extra copies scheduled
    pub frames_duplicated: u64,

    /// Frames delivered truncated
    pub frames_corrupted: u64,

    /// Frames handed to the receiver, copies included
    pub frames_delivered: u64,

    /// Frames currently in flight
    pub frames_in_flight: usize,
}
