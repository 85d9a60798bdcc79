//! Serial-port stimulator link.
//!
//! Talks to the TTL microcontroller over a plain serial line: one command byte
//! per edge, no terminator. Anything the firmware prints back is collected as
//! text lines for the log.
use anyhow::{Context, Result};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::trace;

use super::capabilities::{LinkOpener, StimulatorLink};

/// Read timeout for draining echo; writes are not affected.
const ECHO_READ_TIMEOUT: Duration = Duration::from_millis(5);

/// An open serial connection to the stimulator.
pub struct SerialStimulator {
    port: Box<dyn SerialPort>,
    name: String,
    partial: String,
}

impl SerialStimulator {
    /// Open `port_name` at `baud_rate` (8N1, no flow control).
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(ECHO_READ_TIMEOUT)
            .open()
            .with_context(|| format!("Failed to open serial port '{}'", port_name))?;
        Ok(Self {
            port,
            name: port_name.to_string(),
            partial: String::new(),
        })
    }
}

impl StimulatorLink for SerialStimulator {
    fn write_command(&mut self, command: u8) -> Result<()> {
        trace!("Sending '{}' to {}", command as char, self.name);
        self.port
            .write_all(&[command])
            .with_context(|| format!("Failed to send command to '{}'", self.name))?;
        self.port
            .flush()
            .with_context(|| format!("Failed to flush '{}'", self.name))?;
        Ok(())
    }

    fn drain_echo(&mut self) -> Result<Vec<String>> {
        let waiting = self
            .port
            .bytes_to_read()
            .with_context(|| format!("Failed to query '{}'", self.name))?;
        if waiting > 0 {
            let mut buffer = vec![0u8; waiting as usize];
            let n = self.port.read(&mut buffer).unwrap_or(0);
            self.partial
                .push_str(&String::from_utf8_lossy(&buffer[..n]));
        }

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        Ok(lines)
    }
}

/// Opens [`SerialStimulator`] links on demand.
#[derive(Debug, Clone)]
pub struct SerialOpener {
    port: String,
    baud_rate: u32,
}

impl SerialOpener {
    /// Opener for the given port and baud rate.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
        }
    }
}

impl LinkOpener for SerialOpener {
    fn open(&self) -> Result<Box<dyn StimulatorLink>> {
        Ok(Box::new(SerialStimulator::open(&self.port, self.baud_rate)?))
    }

    fn describe(&self) -> String {
        format!("{} @ {}", self.port, self.baud_rate)
    }
}
