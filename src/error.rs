//! Custom error types for the acquisition core.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it gives every subsystem a single vocabulary for
//! reporting failures to the caller.
//!
//! ## Error Hierarchy
//!
//! - **`Device`**: the camera is unreachable or misbehaving. Escalates and stops
//!   acquisition.
//! - **`Connection`**: the stimulator serial port is unavailable. Degrades
//!   gracefully: pulses are skipped, imaging continues.
//! - **`Write`**: storage failed for one specific write job. The writer reports it
//!   and moves on; the frames of that job are lost and flagged.
//! - **`Config`**: an invalid plan or setting, rejected before anything starts.
//! - **`ConfigLoad`**: wraps `figment` errors raised while reading configuration.
//! - **`Io`** / **`Tiff`**: wrap the underlying I/O and TIFF codec errors.
//!
//! Hardware traits return `anyhow::Result`; components convert those failures into
//! the matching variant at their boundary with `DaqError::device` and friends.

use std::path::PathBuf;
use thiserror::Error;

use crate::events::Severity;

/// Convenience alias for results using the crate error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Device error: {0}")]
    Device(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Write error for {path:?} ({frames} frames lost): {reason}")]
    Write {
        path: PathBuf,
        frames: usize,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("Frame sink is shut down")]
    SinkClosed,

    #[error("Background task failed: {0}")]
    Task(String),
}

impl DaqError {
    /// Wrap a hardware-layer failure as a camera device error.
    pub fn device(err: impl std::fmt::Display) -> Self {
        DaqError::Device(err.to_string())
    }

    /// Wrap a hardware-layer failure as a stimulator connection error.
    pub fn connection(err: impl std::fmt::Display) -> Self {
        DaqError::Connection(err.to_string())
    }

    /// Severity used when the error is surfaced as a status event.
    pub fn severity(&self) -> Severity {
        match self {
            DaqError::Connection(_) => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

impl From<tokio::task::JoinError> for DaqError {
    fn from(value: tokio::task::JoinError) -> Self {
        DaqError::Task(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_warnings_device_errors_are_not() {
        assert_eq!(DaqError::device("camera gone").severity(), Severity::Error);
        assert_eq!(
            DaqError::connection("COM5 busy").severity(),
            Severity::Warning
        );
    }

    #[test]
    fn write_error_mentions_lost_frames() {
        let err = DaqError::Write {
            path: PathBuf::from("burst_003.tif"),
            frames: 42,
            reason: "disk full".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("burst_003.tif"));
        assert!(msg.contains("42 frames lost"));
        assert!(msg.contains("disk full"));
    }
}
