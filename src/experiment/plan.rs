//! Experiment plans.
//!
//! A plan fixes the timing of a run before it starts. The number of capture
//! windows is derived once, at construction, and never recomputed; the
//! scheduler only reads it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DaqError, DaqResult};
use crate::stimulus::PulseSpec;

/// How frames are gathered during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// Repeated (capture window, rest) cycles; every window becomes one stack.
    Burst {
        /// Total experiment duration
        total: Duration,
        /// Capture window length
        window: Duration,
        /// Rest between windows
        rest: Duration,
    },
    /// One continuous run sampling the newest frame every `interval`,
    /// written in batches of `batch_size` and merged at the end.
    FixedInterval {
        /// Total experiment duration
        total: Duration,
        /// Time between snaps
        interval: Duration,
        /// Snaps per batch file
        batch_size: usize,
    },
}

impl AcquisitionMode {
    /// Total planned duration.
    pub fn total(&self) -> Duration {
        match *self {
            AcquisitionMode::Burst { total, .. } | AcquisitionMode::FixedInterval { total, .. } => {
                total
            }
        }
    }

    fn cycle(&self) -> DaqResult<Duration> {
        match *self {
            AcquisitionMode::Burst { window, rest, .. } => window.checked_add(rest).ok_or_else(|| {
                DaqError::Config(format!(
                    "Capture window {:?} plus rest {:?} is too long",
                    window, rest
                ))
            }),
            AcquisitionMode::FixedInterval { interval, .. } => Ok(interval),
        }
    }
}

/// Validated, immutable experiment plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentPlan {
    mode: AcquisitionMode,
    pulse: Option<PulseSpec>,
    target_fps: f64,
    window_count: u64,
}

impl ExperimentPlan {
    /// Validate the parts of a plan and derive its window count.
    pub fn new(mode: AcquisitionMode, pulse: Option<PulseSpec>, target_fps: f64) -> DaqResult<Self> {
        match mode {
            AcquisitionMode::Burst { window, .. } if window.is_zero() => {
                return Err(DaqError::Config("Capture window must be longer than zero".into()));
            }
            AcquisitionMode::FixedInterval { interval, .. } if interval.is_zero() => {
                return Err(DaqError::Config("Snap interval must be longer than zero".into()));
            }
            AcquisitionMode::FixedInterval { batch_size: 0, .. } => {
                return Err(DaqError::Config("Batch size must be at least one".into()));
            }
            _ => {}
        }
        if !(target_fps.is_finite() && target_fps > 0.0) {
            return Err(DaqError::Config(format!(
                "Target frame rate must be positive, got {}",
                target_fps
            )));
        }
        if let Some(spec) = &pulse {
            spec.validate()?;
        }

        let window_count = (mode.total().as_nanos() / mode.cycle()?.as_nanos()) as u64;
        Ok(Self {
            mode,
            pulse,
            target_fps,
            window_count,
        })
    }

    /// Burst plan without stimulation.
    pub fn burst(total: Duration, window: Duration, rest: Duration, target_fps: f64) -> DaqResult<Self> {
        Self::new(
            AcquisitionMode::Burst {
                total,
                window,
                rest,
            },
            None,
            target_fps,
        )
    }

    /// Same plan with stimulation enabled.
    pub fn with_pulse(self, pulse: PulseSpec) -> DaqResult<Self> {
        Self::new(self.mode, Some(pulse), self.target_fps)
    }

    /// Acquisition mode.
    pub fn mode(&self) -> &AcquisitionMode {
        &self.mode
    }

    /// Stimulus, if enabled.
    pub fn pulse(&self) -> Option<&PulseSpec> {
        self.pulse.as_ref()
    }

    /// Requested camera frame rate.
    pub fn target_fps(&self) -> f64 {
        self.target_fps
    }

    /// Windows (burst) or snaps (fixed interval) in the run.
    pub fn window_count(&self) -> u64 {
        self.window_count
    }

    /// Frames a full burst window should hold at the target rate.
    pub fn expected_frames_per_window(&self) -> u64 {
        match self.mode {
            AcquisitionMode::Burst { window, .. } => {
                (window.as_secs_f64() * self.target_fps).floor() as u64
            }
            AcquisitionMode::FixedInterval { batch_size, .. } => batch_size as u64,
        }
    }
}
