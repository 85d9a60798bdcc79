//! Clock abstraction for acquisition timing.
//!
//! Every time-dependent decision in the pipeline (window close, rest period,
//! pulse delay, preview throttling, pulse widths) goes through a
//! [`HardwareClock`]. Production code uses [`SystemClock`]; tests inject a
//! [`ManualClock`] and move time forward explicitly, so state-machine tests never
//! wait on the wall clock.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// Below this remainder `SystemClock::block_for` spins instead of sleeping.
const SPIN_THRESHOLD: Duration = Duration::from_micros(1500);

/// Source of elapsed time and delayed wake-ups.
///
/// # Contract
/// - `elapsed` is monotonic and measured from the clock's creation
/// - `sleep` resolves once at least `duration` of clock time has passed
/// - `block_for` holds the calling thread for `duration`; used only on
///   dedicated blocking contexts (pulse trains), never on async tasks
#[async_trait]
pub trait HardwareClock: Send + Sync {
    /// Time elapsed since the clock was created.
    fn elapsed(&self) -> Duration;

    /// Wait asynchronously for `duration`.
    async fn sleep(&self, duration: Duration);

    /// Block the current thread for `duration` with sub-millisecond precision.
    fn block_for(&self, duration: Duration);
}

/// Wall-clock implementation backed by the tokio timer.
///
/// Under `#[tokio::test(start_paused = true)]` the async half follows tokio's
/// paused clock as well.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: tokio::time::Instant,
}

impl SystemClock {
    /// Create a clock whose epoch is now.
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HardwareClock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn block_for(&self, duration: Duration) {
        let deadline = std::time::Instant::now() + duration;
        if duration > SPIN_THRESHOLD {
            std::thread::sleep(duration - SPIN_THRESHOLD);
        }
        while std::time::Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }
}

struct Sleeper {
    deadline: Duration,
    wake: oneshot::Sender<()>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    sleepers: Vec<Sleeper>,
}

/// Test clock that only moves when told to.
///
/// `sleep` parks until [`ManualClock::advance`] pushes time past its deadline.
/// `block_for` advances the clock itself, so a pulse train driven by this clock
/// completes instantly while its total duration stays observable.
#[derive(Default)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

impl ManualClock {
    /// Create a clock at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward and wake every sleeper whose deadline has passed.
    pub fn advance(&self, by: Duration) {
        let mut due = {
            let mut state = self.state.lock();
            state.now += by;
            let now = state.now;
            let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.sleepers)
                .into_iter()
                .partition(|s| s.deadline <= now);
            state.sleepers = pending;
            due
        };
        due.sort_by_key(|s| s.deadline);
        for sleeper in due {
            let _ = sleeper.wake.send(());
        }
    }

    /// Number of sleepers still waiting (cancelled sleeps are not counted).
    pub fn pending_sleepers(&self) -> usize {
        self.state
            .lock()
            .sleepers
            .iter()
            .filter(|s| !s.wake.is_closed())
            .count()
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.state
            .lock()
            .sleepers
            .iter()
            .filter(|s| !s.wake.is_closed())
            .map(|s| s.deadline)
            .min()
    }
}

#[async_trait]
impl HardwareClock for ManualClock {
    fn elapsed(&self) -> Duration {
        self.state.lock().now
    }

    async fn sleep(&self, duration: Duration) {
        let rx = {
            let mut state = self.state.lock();
            if duration.is_zero() {
                return;
            }
            let (tx, rx) = oneshot::channel();
            let deadline = state.now + duration;
            state.sleepers.push(Sleeper { deadline, wake: tx });
            rx
        };
        let _ = rx.await;
    }

    fn block_for(&self, duration: Duration) {
        self.advance(duration);
    }
}
