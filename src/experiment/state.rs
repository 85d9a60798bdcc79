//! Scheduler state.

use serde::{Deserialize, Serialize};

/// Lifecycle of one experiment run.
///
/// # State Machine
///
/// ```text
/// Idle ──start──> WindowOpen ──elapsed──> WindowClosing ──> Resting
///                     ▲                                        │
///                     └────────────── rest elapsed ────────────┤
///                                                              ▼
///                                                             Done
///
/// any non-terminal state ──stop / camera failure──> Stopped
/// ```
///
/// Fixed-interval runs stay in `WindowOpen` for their whole capture and pass
/// through `WindowClosing` while the batches are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    /// Not started
    Idle,
    /// Collecting frames into a capture window
    WindowOpen {
        /// 1-based window index
        index: u64,
    },
    /// Sealing the window and handing it to storage
    WindowClosing {
        /// 1-based window index
        index: u64,
    },
    /// Waiting out the rest period after a window
    Resting {
        /// Index of the window that just closed
        after: u64,
    },
    /// All planned windows ran
    Done,
    /// Ended early by a stop request or a fatal device error
    Stopped,
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerState::Idle => write!(f, "Idle"),
            SchedulerState::WindowOpen { index } => write!(f, "WindowOpen({})", index),
            SchedulerState::WindowClosing { index } => write!(f, "WindowClosing({})", index),
            SchedulerState::Resting { after } => write!(f, "Resting(after {})", after),
            SchedulerState::Done => write!(f, "Done"),
            SchedulerState::Stopped => write!(f, "Stopped"),
        }
    }
}

impl SchedulerState {
    /// Whether the run is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SchedulerState::Done | SchedulerState::Stopped)
    }

    /// Whether a capture window is currently open.
    pub fn is_capturing(&self) -> bool {
        matches!(self, SchedulerState::WindowOpen { .. })
    }
}
