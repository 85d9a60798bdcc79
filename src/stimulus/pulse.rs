//! TTL pulse generation.
//!
//! A pulse is a rising edge (`H`), a fixed 1 ms hold, and a falling edge (`L`)
//! written to the stimulator link. A train repeats that pattern at a given
//! frequency for a given duration. Every pattern runs on its own blocking
//! context so millisecond holds never stall the async runtime.
//!
//! The link is opened lazily. When it cannot be opened the pulse is skipped
//! and a connection warning is published; imaging is never interrupted by a
//! missed stimulus.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::clock::HardwareClock;
use crate::error::{DaqError, DaqResult};
use crate::events::EventSink;
use crate::hardware::capabilities::{LinkOpener, StimulatorLink, TTL_HIGH, TTL_LOW};

/// Hold time between the rising and falling edge of every pulse.
pub const PULSE_WIDTH: Duration = Duration::from_millis(1);

/// Shape of a stimulus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PulseMode {
    /// One pulse.
    Single,
    /// `floor(duration * frequency)` pulses at `frequency`.
    Train,
}

/// An immutable stimulus description.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseSpec {
    /// Single pulse or train
    pub mode: PulseMode,
    /// Train frequency in Hz (ignored for `Single`)
    pub frequency_hz: f64,
    /// Total train duration (ignored for `Single`)
    pub duration: Duration,
    /// Delay from window start to the first edge
    pub delay: Duration,
}

impl PulseSpec {
    /// A single pulse fired `delay` after window start.
    pub fn single(delay: Duration) -> Self {
        Self {
            mode: PulseMode::Single,
            frequency_hz: 0.0,
            duration: Duration::ZERO,
            delay,
        }
    }

    /// A pulse train.
    pub fn train(frequency_hz: f64, duration: Duration, delay: Duration) -> Self {
        Self {
            mode: PulseMode::Train,
            frequency_hz,
            duration,
            delay,
        }
    }

    /// Reject trains that cannot be generated.
    pub fn validate(&self) -> DaqResult<()> {
        if self.mode == PulseMode::Train
            && !(self.frequency_hz.is_finite() && self.frequency_hz > 0.0)
        {
            return Err(DaqError::Config(format!(
                "Pulse train frequency must be positive, got {}",
                self.frequency_hz
            )));
        }
        Ok(())
    }

    /// Number of pulses this spec produces.
    pub fn pulse_count(&self) -> u32 {
        match self.mode {
            PulseMode::Single => 1,
            PulseMode::Train => {
                let count = self.duration.as_nanos() as f64 * self.frequency_hz / 1e9;
                count.floor().max(0.0) as u32
            }
        }
    }

    /// Low time after each pulse in a train.
    pub fn gap(&self) -> Duration {
        match self.mode {
            PulseMode::Single => Duration::ZERO,
            PulseMode::Train => {
                Duration::from_secs_f64(1.0 / self.frequency_hz).saturating_sub(PULSE_WIDTH)
            }
        }
    }
}

impl std::fmt::Display for PulseSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.mode {
            PulseMode::Single => write!(f, "single pulse"),
            PulseMode::Train => write!(
                f,
                "{} Hz train for {} ms",
                self.frequency_hz,
                self.duration.as_millis()
            ),
        }
    }
}

/// What happened to a requested stimulus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PulseOutcome {
    /// Every pulse was written.
    Sent {
        /// Pulses written
        pulses: u32,
    },
    /// The link could not be opened; nothing was written.
    Skipped {
        /// Why the link was unavailable
        reason: String,
    },
    /// The link failed part way through.
    Failed {
        /// Pulses completed before the failure
        sent: u32,
        /// Underlying error
        reason: String,
    },
}

impl PulseOutcome {
    /// Whether the full pattern went out.
    pub fn is_sent(&self) -> bool {
        matches!(self, PulseOutcome::Sent { .. })
    }
}

/// Owns the stimulator link and fires pulse patterns on it.
///
/// Cloning is cheap; clones share the same link.
#[derive(Clone)]
pub struct PulseController {
    opener: Arc<dyn LinkOpener>,
    link: Arc<Mutex<Option<Box<dyn StimulatorLink>>>>,
    clock: Arc<dyn HardwareClock>,
    events: EventSink,
}

impl PulseController {
    /// Create a controller. Nothing is opened until the first pulse.
    pub fn new(opener: Arc<dyn LinkOpener>, clock: Arc<dyn HardwareClock>, events: EventSink) -> Self {
        Self {
            opener,
            link: Arc::new(Mutex::new(None)),
            clock,
            events,
        }
    }

    /// Whether a link is currently held open.
    pub fn is_open(&self) -> bool {
        self.link.lock().is_some()
    }

    /// Open the link now instead of on the first pulse. Blocking.
    pub fn open(&self) -> DaqResult<()> {
        let mut guard = self.link.lock();
        self.ensure_open(&mut guard).map(|_| ())
    }

    /// Drop the link; the next pulse reopens it.
    pub fn close(&self) {
        if self.link.lock().take().is_some() {
            info!("Stimulator link {} closed", self.opener.describe());
        }
    }

    /// Fire `spec` on a dedicated blocking context.
    ///
    /// `spec.delay` is not applied here; the caller schedules the call.
    pub fn fire(&self, spec: PulseSpec) -> JoinHandle<PulseOutcome> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.run_blocking(spec))
    }

    /// Send a lone rising edge, the rig's manual "test TTL" action.
    pub async fn test_pulse(&self) -> DaqResult<PulseOutcome> {
        let this = self.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let mut guard = this.link.lock();
            let link = match this.ensure_open(&mut guard) {
                Ok(link) => link,
                Err(e) => return PulseOutcome::Skipped { reason: e.to_string() },
            };
            match link.write_command(TTL_HIGH) {
                Ok(()) => {
                    this.drain_echo(link);
                    this.events.info("Test TTL sent");
                    PulseOutcome::Sent { pulses: 1 }
                }
                Err(e) => {
                    *guard = None;
                    this.report_failure(0, &e)
                }
            }
        })
        .await?;
        Ok(outcome)
    }

    fn ensure_open<'a>(
        &self,
        guard: &'a mut Option<Box<dyn StimulatorLink>>,
    ) -> DaqResult<&'a mut Box<dyn StimulatorLink>> {
        if guard.is_none() {
            match self.opener.open() {
                Ok(link) => {
                    info!("Stimulator link {} opened", self.opener.describe());
                    *guard = Some(link);
                }
                Err(e) => {
                    let err = DaqError::connection(format!(
                        "{}: {:#}",
                        self.opener.describe(),
                        e
                    ));
                    self.events.emit(err.severity(), format!("{}; pulse skipped", err));
                    return Err(err);
                }
            }
        }
        guard
            .as_mut()
            .ok_or_else(|| DaqError::connection("stimulator link unavailable"))
    }

    fn run_blocking(&self, spec: PulseSpec) -> PulseOutcome {
        let mut guard = self.link.lock();
        let link = match self.ensure_open(&mut guard) {
            Ok(link) => link,
            Err(e) => return PulseOutcome::Skipped { reason: e.to_string() },
        };

        let total = spec.pulse_count();
        let gap = spec.gap();
        let mut sent = 0;
        for _ in 0..total {
            if let Err(e) = self.pulse_once(link.as_mut()) {
                *guard = None;
                return self.report_failure(sent, &e);
            }
            sent += 1;
            if !gap.is_zero() {
                self.clock.block_for(gap);
            }
        }
        self.drain_echo(link);
        self.events.info(format!("Sent {} ({} pulses)", spec, sent));
        PulseOutcome::Sent { pulses: sent }
    }

    fn pulse_once(&self, link: &mut dyn StimulatorLink) -> anyhow::Result<()> {
        link.write_command(TTL_HIGH)?;
        self.clock.block_for(PULSE_WIDTH);
        link.write_command(TTL_LOW)
    }

    fn drain_echo(&self, link: &mut Box<dyn StimulatorLink>) {
        match link.drain_echo() {
            Ok(lines) => {
                for line in lines {
                    debug!("Stimulator: {}", line);
                }
            }
            Err(e) => debug!("Stimulator echo unavailable: {:#}", e),
        }
    }

    fn report_failure(&self, sent: u32, e: &anyhow::Error) -> PulseOutcome {
        let err = DaqError::connection(format!("{}: {:#}", self.opener.describe(), e));
        self.events
            .emit(err.severity(), format!("{} after {} pulses", err, sent));
        PulseOutcome::Failed {
            sent,
            reason: err.to_string(),
        }
    }
}

impl std::fmt::Debug for PulseController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PulseController")
            .field("link", &self.opener.describe())
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::{drain, Severity};
    use crate::hardware::mock::MockStimulatorOpener;

    fn controller() -> (
        PulseController,
        crate::hardware::mock::StimulatorRecorder,
        Arc<ManualClock>,
        EventSink,
    ) {
        let (opener, recorder) = MockStimulatorOpener::new();
        let clock = Arc::new(ManualClock::new());
        let events = EventSink::new();
        let pulses = PulseController::new(Arc::new(opener), clock.clone(), events.clone());
        (pulses, recorder, clock, events)
    }

    #[test]
    fn train_pulse_count_floors() {
        let spec = PulseSpec::train(40.0, Duration::from_millis(300), Duration::ZERO);
        assert_eq!(spec.pulse_count(), 12);
        assert_eq!(spec.gap(), Duration::from_millis(24));

        let spec = PulseSpec::train(3.0, Duration::from_millis(900), Duration::ZERO);
        assert_eq!(spec.pulse_count(), 2);
        assert_eq!(PulseSpec::single(Duration::ZERO).pulse_count(), 1);
    }

    #[test]
    fn gap_saturates_for_fast_trains() {
        let spec = PulseSpec::train(2000.0, Duration::from_millis(10), Duration::ZERO);
        assert_eq!(spec.gap(), Duration::ZERO);
        assert_eq!(spec.pulse_count(), 20);
    }

    #[test]
    fn zero_frequency_train_is_rejected() {
        let spec = PulseSpec::train(0.0, Duration::from_millis(300), Duration::ZERO);
        assert!(matches!(spec.validate(), Err(DaqError::Config(_))));
        assert!(PulseSpec::single(Duration::ZERO).validate().is_ok());
    }

    #[tokio::test]
    async fn train_writes_edges_and_spans_its_duration() {
        let (pulses, recorder, clock, _events) = controller();
        let spec = PulseSpec::train(40.0, Duration::from_millis(300), Duration::ZERO);

        let outcome = pulses.fire(spec).await.unwrap();

        assert_eq!(outcome, PulseOutcome::Sent { pulses: 12 });
        let commands = recorder.commands();
        assert_eq!(commands.len(), 24);
        assert!(commands.chunks(2).all(|pair| pair == [b'H', b'L']));
        assert_eq!(clock.elapsed(), Duration::from_millis(300));
        assert!(pulses.is_open());
    }

    #[tokio::test]
    async fn single_pulse_holds_one_millisecond() {
        let (pulses, recorder, clock, _events) = controller();
        let outcome = pulses.fire(PulseSpec::single(Duration::ZERO)).await.unwrap();
        assert_eq!(outcome, PulseOutcome::Sent { pulses: 1 });
        assert_eq!(recorder.commands(), vec![b'H', b'L']);
        assert_eq!(clock.elapsed(), PULSE_WIDTH);
    }

    #[tokio::test]
    async fn unavailable_link_skips_pulse_with_warning() {
        let (pulses, recorder, _clock, events) = controller();
        let mut rx = events.subscribe();
        recorder.refuse_open(true);

        let outcome = pulses.fire(PulseSpec::single(Duration::ZERO)).await.unwrap();

        assert!(matches!(outcome, PulseOutcome::Skipped { .. }));
        assert!(recorder.commands().is_empty());
        let seen = drain(&mut rx);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].severity, Severity::Warning);
        assert!(seen[0].message.contains("Connection error"));
    }

    #[tokio::test]
    async fn link_is_reopened_after_close() {
        let (pulses, recorder, _clock, _events) = controller();
        pulses.fire(PulseSpec::single(Duration::ZERO)).await.unwrap();
        pulses.close();
        assert!(!pulses.is_open());
        pulses.fire(PulseSpec::single(Duration::ZERO)).await.unwrap();
        assert_eq!(recorder.opens(), 2);
    }

    #[tokio::test]
    async fn write_failure_reports_partial_train() {
        let (pulses, recorder, _clock, _events) = controller();
        pulses.open().unwrap();
        recorder.fail_writes(true);
        let spec = PulseSpec::train(10.0, Duration::from_secs(1), Duration::ZERO);
        let outcome = pulses.fire(spec).await.unwrap();
        assert!(matches!(outcome, PulseOutcome::Failed { sent: 0, .. }));
        assert!(!pulses.is_open());
    }

    #[tokio::test]
    async fn test_pulse_sends_lone_rising_edge() {
        let (pulses, recorder, _clock, _events) = controller();
        let outcome = pulses.test_pulse().await.unwrap();
        assert_eq!(outcome, PulseOutcome::Sent { pulses: 1 });
        assert_eq!(recorder.commands(), vec![b'H']);
    }
}
