//! RN2483 LoRa modem over a serial line.
//!
//! The modem speaks a line-oriented ASCII protocol: every command ends in
//! `\r\n` and is answered by one line. Payloads travel hex-encoded.
//!
//! ```text
//! > radio tx 7B22706964223A317D      < ok          (accepted)
//!                                    < radio_tx_ok (on air)  | radio_err
//! > radio rx 0                       < ok          (listening)
//!                                    < radio_rx  7B22...     | radio_err
//! ```
//!
//! The modem answers `busy` while a previous operation is still running;
//! commands are re-sent a bounded number of times. Reception is one-shot:
//! after each `radio_rx` (or a watchdog `radio_err`) the receiver is armed
//! again on the next poll.

use crate::error::{Result, TransportError};
use crate::framing::{from_hex, to_hex, MAX_LORA_PAYLOAD};
use crate::network::Transport;
use serialport::SerialPort;
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Factory baud rate of the RN2483 UART.
pub const RN2483_BAUD: u32 = 57_600;

/// Serial and radio parameters for the modem.
#[derive(Debug, Clone)]
pub struct RadioConfig {
    pub port: String,
    pub baud_rate: u32,

    /// Carrier frequency in Hz
    pub frequency_hz: u32,

    /// Transmit power in dBm
    pub power_dbm: i8,

    /// Read timeout of the serial port; bounds one receive poll
    pub poll_timeout: Duration,

    /// How long to wait for a command's reply
    pub command_timeout: Duration,

    /// How long to wait for `radio_tx_ok` after `ok`
    pub tx_timeout: Duration,

    /// Resends of a command answered with `busy`
    pub busy_retries: u32,
    pub busy_backoff: Duration,
}

impl RadioConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: RN2483_BAUD,
            frequency_hz: 868_000_000,
            power_dbm: 14,
            poll_timeout: Duration::from_millis(10),
            command_timeout: Duration::from_secs(2),
            tx_timeout: Duration::from_secs(3),
            busy_retries: 5,
            busy_backoff: Duration::from_millis(200),
        }
    }

    /// Bring-up sequence, each with the reply it must produce (`None`: any).
    pub fn init_commands(&self) -> Vec<(String, Option<&'static str>)> {
        vec![
            ("sys reset".to_string(), None),
            ("mac pause".to_string(), None),
            ("radio set mod lora".to_string(), Some("ok")),
            (format!("radio set freq {}", self.frequency_hz), Some("ok")),
            (format!("radio set pwr {}", self.power_dbm), Some("ok")),
            ("radio set sf sf7".to_string(), Some("ok")),
            ("radio set afcbw 41.7".to_string(), Some("ok")),
            ("radio set rxbw 125".to_string(), Some("ok")),
            ("radio set cr 4/5".to_string(), Some("ok")),
            ("radio set wdt 60000".to_string(), Some("ok")),
            ("radio set sync 12".to_string(), Some("ok")),
            ("radio set bw 125".to_string(), Some("ok")),
        ]
    }
}

/// RN2483 modem as a [`Transport`].
pub struct SerialRadio<P = Box<dyn SerialPort>> {
    port: P,
    config: RadioConfig,
    line_buf: Vec<u8>,
    rx_armed: bool,
    received: VecDeque<Vec<u8>>,
}

impl SerialRadio {
    /// Open the serial port and run the bring-up sequence.
    ///
    /// # Errors
    /// - `TransportError::Open` if the port cannot be opened
    /// - `TransportError::Rejected` / `Timeout` if the modem misbehaves
    pub fn open(config: RadioConfig) -> Result<Self> {
        let port = serialport::new(&config.port, config.baud_rate)
            .timeout(config.poll_timeout)
            .open()
            .map_err(|e| TransportError::Open {
                path: config.port.clone(),
                reason: e.to_string(),
            })?;

        Self::with_port(port, config)
    }
}

impl<P: Read + Write> SerialRadio<P> {
    /// Drive a modem on an already open byte stream.
    pub fn with_port(port: P, config: RadioConfig) -> Result<Self> {
        let mut radio = Self {
            port,
            config,
            line_buf: Vec::new(),
            rx_armed: false,
            received: VecDeque::new(),
        };
        radio.initialize()?;
        Ok(radio)
    }

    pub fn get_ref(&self) -> &P {
        &self.port
    }

    fn initialize(&mut self) -> Result<()> {
        info!(
            port = %self.config.port,
            mhz = self.config.frequency_hz as f64 / 1e6,
            "starting LoRa modem"
        );

        for (command, expected) in self.config.init_commands() {
            let reply = self.command(&command)?;
            if let Some(expected) = expected {
                if reply != expected {
                    return Err(TransportError::Rejected {
                        command,
                        response: reply,
                    }
                    .into());
                }
            }
            debug!(command = %command, reply = %reply, "modem configured");
        }

        Ok(())
    }

    /// Send one command and return its reply, re-sending while `busy`.
    fn command(&mut self, command: &str) -> Result<String> {
        let mut attempts = 0;
        loop {
            trace!(command, "modem <");
            self.port.write_all(format!("{command}\r\n").as_bytes())?;
            self.port.flush()?;

            let reply = self
                .read_line(self.config.command_timeout)?
                .ok_or_else(|| TransportError::Timeout {
                    command: command.to_string(),
                    timeout_ms: self.config.command_timeout.as_millis() as u64,
                })?;

            if reply == "busy" && attempts < self.config.busy_retries {
                attempts += 1;
                warn!(command, attempts, "modem busy");
                thread::sleep(self.config.busy_backoff);
                continue;
            }
            return Ok(reply);
        }
    }

    /// Next complete line within `timeout`, without its terminator.
    ///
    /// Unsolicited `radio_rx` lines seen while waiting are queued as frames.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(line) = self.take_line() {
                if !self.absorb_unsolicited(&line) {
                    return Ok(Some(line));
                }
            }

            if !self.fill()? && Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Read what the port has; false when nothing arrived.
    fn fill(&mut self) -> Result<bool> {
        let mut chunk = [0u8; 256];
        match self.port.read(&mut chunk) {
            Ok(0) => Ok(false),
            Ok(n) => {
                self.line_buf.extend_from_slice(&chunk[..n]);
                Ok(true)
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.line_buf.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.line_buf.drain(..=end).collect();
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if line.is_empty() {
            return self.take_line();
        }
        trace!(line = %line, "modem >");
        Some(line)
    }

    // A `radio_rx` or receive-side `radio_err` can interleave with command
    // replies while the receiver is armed.
    fn absorb_unsolicited(&mut self, line: &str) -> bool {
        if let Some(payload) = line.strip_prefix("radio_rx") {
            self.rx_armed = false;
            match from_hex(payload) {
                Ok(frame) => self.received.push_back(frame),
                Err(e) => warn!(error = %e, "modem delivered undecodable payload"),
            }
            return true;
        }
        if self.rx_armed && line == "radio_err" {
            self.rx_armed = false;
            debug!("receive window closed, re-arming");
            return true;
        }
        false
    }

    fn stop_receiving(&mut self) -> Result<()> {
        if self.rx_armed {
            self.rx_armed = false;
            let reply = self.command("radio rxstop")?;
            debug!(reply = %reply, "receiver stopped");
        }
        Ok(())
    }
}

impl<P: Read + Write> Transport for SerialRadio<P> {
    fn transmit(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > MAX_LORA_PAYLOAD {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                limit: MAX_LORA_PAYLOAD,
            }
            .into());
        }

        self.stop_receiving()?;

        let command = format!("radio tx {}", to_hex(frame));
        let reply = self.command(&command)?;
        if reply != "ok" {
            return Err(TransportError::Rejected {
                command: "radio tx".to_string(),
                response: reply,
            }
            .into());
        }

        match self.read_line(self.config.tx_timeout)? {
            Some(done) if done == "radio_tx_ok" => Ok(()),
            Some(other) => Err(TransportError::Rejected {
                command: "radio tx".to_string(),
                response: other,
            }
            .into()),
            None => Err(TransportError::Timeout {
                command: "radio tx".to_string(),
                timeout_ms: self.config.tx_timeout.as_millis() as u64,
            }
            .into()),
        }
    }

    fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(frame) = self.received.pop_front() {
            return Ok(Some(frame));
        }

        if !self.rx_armed {
            let reply = self.command("radio rx 0")?;
            if reply != "ok" {
                return Err(TransportError::Rejected {
                    command: "radio rx 0".to_string(),
                    response: reply,
                }
                .into());
            }
            self.rx_armed = true;
        }

        self.fill()?;
        while let Some(line) = self.take_line() {
            if !self.absorb_unsolicited(&line) {
                debug!(line = %line, "ignoring modem line");
            }
        }

        Ok(self.received.pop_front())
    }
}
