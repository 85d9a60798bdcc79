//! Experiment plans and the burst/trigger scheduler.

pub mod plan;
pub mod scheduler;
pub mod state;
pub mod window;

pub use plan::{AcquisitionMode, ExperimentPlan};
pub use scheduler::{BurstScheduler, RunHandle, RunOutcome, RunSummary, DEFAULT_CAPTURE_CAPACITY};
pub use state::SchedulerState;
pub use window::{CaptureWindow, SealedWindow};
