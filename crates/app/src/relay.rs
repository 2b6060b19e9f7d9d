//! Hand-off between the radio reader thread and the reassembly loop.
//!
//! The reader owns the modem and does nothing but pull frames off it; the
//! main thread owns the reassembler and the sink. A bounded channel between
//! them is the only shared state.

use cansat_link_core::error::{Result, TransportError};
use cansat_link_core::network::Transport;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// Consecutive receive errors after which the reader gives up.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Pump frames from `radio` into `queue` until the queue's receiver is
/// dropped or the radio keeps failing.
///
/// Returns the number of frames forwarded.
pub fn read_loop<T: Transport>(mut radio: T, queue: SyncSender<Vec<u8>>) -> u64 {
    let mut forwarded = 0;
    let mut consecutive_errors = 0;

    loop {
        match radio.receive() {
            Ok(Some(frame)) => {
                consecutive_errors = 0;
                if queue.send(frame).is_err() {
                    info!(forwarded, "reassembly loop gone, reader stopping");
                    return forwarded;
                }
                forwarded += 1;
            }
            Ok(None) => consecutive_errors = 0,
            Err(e) => {
                consecutive_errors += 1;
                warn!(error = %e, consecutive_errors, "radio receive failed");
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    error!(forwarded, "radio unusable, reader stopping");
                    return forwarded;
                }
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }
}

/// Receive-only transport over the reader's queue.
pub struct ChannelTransport {
    queue: Receiver<Vec<u8>>,
    idle_wait: Duration,
    closed: bool,
}

impl ChannelTransport {
    /// `idle_wait` bounds how long one `receive` blocks.
    pub fn new(queue: Receiver<Vec<u8>>, idle_wait: Duration) -> Self {
        Self {
            queue,
            idle_wait,
            closed: false,
        }
    }

    /// True once the reader has stopped and the queue is drained.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Transport for ChannelTransport {
    fn transmit(&mut self, _frame: &[u8]) -> Result<()> {
        Err(TransportError::Closed.into())
    }

    fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        if self.closed {
            return Ok(None);
        }
        match self.queue.recv_timeout(self.idle_wait) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                self.closed = true;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cansat_link_core::network::{LinkConfig, SimulatedLink};
    use std::sync::mpsc;

    /// Radio that fails every receive.
    struct Dead;

    impl Transport for Dead {
        fn transmit(&mut self, _frame: &[u8]) -> Result<()> {
            Ok(())
        }

        fn receive(&mut self) -> Result<Option<Vec<u8>>> {
            Err(TransportError::Timeout {
                command: "radio rx 0".into(),
                timeout_ms: 1,
            }
            .into())
        }
    }

    #[test]
    fn test_reader_stops_when_consumer_leaves() {
        let mut link = SimulatedLink::shared(LinkConfig::perfect(1));
        link.transmit(b"{\"pid\":1}").unwrap();
        link.transmit(b"{\"pid\":2}").unwrap();

        let (tx, rx) = mpsc::sync_channel(1);
        let radio = link.clone();
        let reader = thread::spawn(move || read_loop(radio, tx));

        let mut transport = ChannelTransport::new(rx, Duration::from_millis(500));
        assert_eq!(transport.receive().unwrap(), Some(b"{\"pid\":1}".to_vec()));
        assert_eq!(transport.receive().unwrap(), Some(b"{\"pid\":2}".to_vec()));
        drop(transport);

        // the reader notices on its next hand-off
        link.transmit(b"{\"pid\":3}").unwrap();
        assert_eq!(reader.join().unwrap(), 2);
    }

    #[test]
    fn test_dead_radio_closes_channel() {
        let (tx, rx) = mpsc::sync_channel(4);
        let forwarded = read_loop(Dead, tx);
        assert_eq!(forwarded, 0);

        let mut transport = ChannelTransport::new(rx, Duration::from_millis(10));
        assert_eq!(transport.receive().unwrap(), None);
        assert!(transport.is_closed());
    }

    #[test]
    fn test_channel_transport_is_receive_only() {
        let (_tx, rx) = mpsc::sync_channel(1);
        let mut transport = ChannelTransport::new(rx, Duration::from_millis(1));
        assert!(transport.transmit(b"x").is_err());
        assert_eq!(transport.receive().unwrap(), None);
        assert!(!transport.is_closed());
    }
}
