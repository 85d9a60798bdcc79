//! TTL stimulation.

pub mod pulse;

pub use pulse::{PulseController, PulseMode, PulseOutcome, PulseSpec, PULSE_WIDTH};
