//! Hardware collaborator traits
//!
//! The camera and the stimulator are opaque external collaborators. The core
//! only needs a handful of operations from each, expressed here as small traits
//! so the pipeline can run against real drivers or the mocks in
//! [`crate::hardware::mock`].
//!
//! # Design Philosophy
//!
//! Each trait:
//! - Is synchronous: vendor SDK calls and serial writes block, so callers run
//!   them on dedicated blocking contexts (`spawn_blocking`)
//! - Is `Send`, so the device can live behind a lock shared across threads
//! - Uses `anyhow::Result`; components map failures into [`crate::error::DaqError`]
//! - Focuses on ONE device

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::data::RawImage;

/// Sensor region of interest in unbinned pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    /// Left edge
    pub x: u32,
    /// Top edge
    pub y: u32,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Roi {
    /// Region starting at the sensor origin.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

/// Capability: continuous frame acquisition from a camera.
///
/// # Contract
/// - Configuration calls may fail individually; callers treat that as a warning
/// - `start_continuous_acquisition` fills the device's circular buffer until
///   `stop_acquisition`
/// - `remaining_buffered_count` reports frames waiting in that buffer
/// - `poll_one_frame` pops the oldest buffered frame, `None` when empty
/// - There is no blocking "wait for frame" primitive; callers poll
pub trait CameraDevice: Send {
    /// Human-readable device label for logs.
    fn label(&self) -> String;

    /// Set exposure time in milliseconds.
    fn set_exposure(&mut self, exposure_ms: f64) -> Result<()>;

    /// Set the readout region.
    fn set_roi(&mut self, roi: Roi) -> Result<()>;

    /// Set a named device property (buffering, clear mode, binning, ...).
    fn set_property(&mut self, name: &str, value: &str) -> Result<()>;

    /// Begin free-running acquisition into the device buffer.
    fn start_continuous_acquisition(&mut self) -> Result<()>;

    /// Halt acquisition.
    fn stop_acquisition(&mut self) -> Result<()>;

    /// Whether a sequence acquisition is currently running.
    fn is_acquiring(&self) -> bool;

    /// Number of frames waiting in the device buffer.
    fn remaining_buffered_count(&mut self) -> Result<usize>;

    /// Retrieve the oldest buffered frame, if any.
    fn poll_one_frame(&mut self) -> Result<Option<RawImage>>;
}

/// Capability: byte-command link to a TTL stimulator.
///
/// The protocol is single-byte commands, `b'H'` drives the output high and
/// `b'L'` drives it low. The microcontroller may echo free-text lines, which are
/// drained for logging but never parsed for correctness.
pub trait StimulatorLink: Send {
    /// Write one command byte and flush it to the wire.
    fn write_command(&mut self, command: u8) -> Result<()>;

    /// Collect any complete lines echoed back since the last call.
    fn drain_echo(&mut self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Factory for stimulator links, so a closed link can be reopened lazily.
pub trait LinkOpener: Send + Sync {
    /// Open a fresh link.
    fn open(&self) -> Result<Box<dyn StimulatorLink>>;

    /// Description of the endpoint for logs (e.g. `COM5 @ 115200`).
    fn describe(&self) -> String;
}

/// Command byte that drives the TTL output high.
pub const TTL_HIGH: u8 = b'H';

/// Command byte that drives the TTL output low.
pub const TTL_LOW: u8 = b'L';
