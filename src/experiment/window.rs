//! Capture windows.
//!
//! At most one window is open at a time. Sealing consumes the window, so the
//! frames it gathered can be handed to storage at most once.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::data::Frame;
use crate::storage::WriteJob;

/// An open, append-only capture window.
#[derive(Debug)]
pub struct CaptureWindow {
    index: u64,
    started_at: Duration,
    requested: Duration,
    frames: Vec<Arc<Frame>>,
}

impl CaptureWindow {
    /// Open window `index` (1-based) at clock time `started_at`.
    pub fn open(index: u64, started_at: Duration, requested: Duration) -> Self {
        Self {
            index,
            started_at,
            requested,
            frames: Vec::new(),
        }
    }

    /// Append one frame.
    pub fn push(&mut self, frame: Arc<Frame>) {
        self.frames.push(frame);
    }

    /// 1-based window index.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Clock time the window opened.
    pub fn started_at(&self) -> Duration {
        self.started_at
    }

    /// Clock time the window is due to close.
    pub fn deadline(&self) -> Duration {
        self.started_at + self.requested
    }

    /// Frames collected so far.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no frame arrived yet.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Close the window.
    pub fn seal(self, sealed_at: Duration) -> SealedWindow {
        SealedWindow {
            index: self.index,
            started_at: self.started_at,
            sealed_at,
            frames: self.frames,
        }
    }
}

/// A closed window whose frames are ready for storage.
#[derive(Debug)]
pub struct SealedWindow {
    index: u64,
    started_at: Duration,
    sealed_at: Duration,
    frames: Vec<Arc<Frame>>,
}

impl SealedWindow {
    /// 1-based window index.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Frames in the window.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the window captured nothing.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// How long the window was actually open.
    pub fn open_for(&self) -> Duration {
        self.sealed_at.saturating_sub(self.started_at)
    }

    /// Turn the window into a write job for `path`.
    pub fn into_write_job(self, path: PathBuf) -> WriteJob {
        WriteJob::new(path, self.frames)
    }
}
